use std::any::Any;
use std::sync::Arc;

use tickbot_cache::{CacheError, CacheView, view_as};
use tickbot_threads::{StopToken, ThreadRegistry};

use crate::Tick;

/// Synchronous piece of bot logic run on the scheduler thread
pub type Action = Arc<dyn Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Predicate over cached host state
pub type Condition = Arc<dyn Fn(&dyn CacheView) -> anyhow::Result<bool> + Send + Sync>;

/// Body of a background worker started from a step
pub type WorkerFn = Arc<dyn Fn(StopToken) -> anyhow::Result<()> + Send + Sync>;

/// What to do when a wait point runs out of ticks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnTimeout {
    /// Carry on with the next instruction; `last_wait` reports the timeout
    Continue,
    /// Fail the step
    Fail,
    /// Leave the current state for the named one
    Goto(String),
}

/// How the most recent wait point in the running program ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied { waited_ticks: Tick },
    TimedOut { waited_ticks: Tick },
}

impl WaitOutcome {
    pub fn timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut { .. })
    }

    pub fn waited_ticks(&self) -> Tick {
        match self {
            WaitOutcome::Satisfied { waited_ticks } | WaitOutcome::TimedOut { waited_ticks } => {
                *waited_ticks
            }
        }
    }
}

/// One step of a resumable program
#[derive(Clone)]
pub enum Instruction {
    Run(Action),
    /// Park until `condition` holds, checking once per tick
    WaitUntil {
        condition: Condition,
        timeout: Option<Tick>,
        on_timeout: OnTimeout,
    },
    WaitTicks(Tick),
    /// Give up the rest of this tick
    Yield,
    /// Start a background worker in the thread registry
    Spawn { worker: String, work: WorkerFn },
    /// Park until the named worker's body has returned
    AwaitWorker {
        worker: String,
        timeout: Option<Tick>,
        on_timeout: OnTimeout,
    },
}

impl Instruction {
    pub(crate) fn goto_target(&self) -> Option<&str> {
        match self {
            Instruction::WaitUntil {
                on_timeout: OnTimeout::Goto(target),
                ..
            }
            | Instruction::AwaitWorker {
                on_timeout: OnTimeout::Goto(target),
                ..
            } => Some(target),
            _ => None,
        }
    }

    pub(crate) fn on_timeout(&self) -> OnTimeout {
        match self {
            Instruction::WaitUntil { on_timeout, .. }
            | Instruction::AwaitWorker { on_timeout, .. } => on_timeout.clone(),
            _ => OnTimeout::Fail,
        }
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Run(_) => write!(f, "Run(..)"),
            Instruction::WaitUntil {
                timeout,
                on_timeout,
                ..
            } => f
                .debug_struct("WaitUntil")
                .field("timeout", timeout)
                .field("on_timeout", on_timeout)
                .finish_non_exhaustive(),
            Instruction::WaitTicks(ticks) => f.debug_tuple("WaitTicks").field(ticks).finish(),
            Instruction::Yield => write!(f, "Yield"),
            Instruction::Spawn { worker, .. } => f
                .debug_struct("Spawn")
                .field("worker", worker)
                .finish_non_exhaustive(),
            Instruction::AwaitWorker {
                worker,
                timeout,
                on_timeout,
            } => f
                .debug_struct("AwaitWorker")
                .field("worker", worker)
                .field("timeout", timeout)
                .field("on_timeout", on_timeout)
                .finish(),
        }
    }
}

/// An ordered list of instructions that can be suspended and resumed at any
/// wait point.
///
/// ```ignore
/// let travel = Program::new()
///     .run(|ctx| issue_move(ctx))
///     .wait_until_or(arrived, 300, OnTimeout::Goto("Idle".into()))
///     .wait_ticks(2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn run<F>(self, action: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(Instruction::Run(Arc::new(action)))
    }

    /// Wait with no bound
    pub fn wait_until<F>(self, condition: F) -> Self
    where
        F: Fn(&dyn CacheView) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.push(Instruction::WaitUntil {
            condition: Arc::new(condition),
            timeout: None,
            on_timeout: OnTimeout::Fail,
        })
    }

    pub fn wait_until_or<F>(self, condition: F, timeout: Tick, on_timeout: OnTimeout) -> Self
    where
        F: Fn(&dyn CacheView) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.push(Instruction::WaitUntil {
            condition: Arc::new(condition),
            timeout: Some(timeout),
            on_timeout,
        })
    }

    pub fn wait_ticks(self, ticks: Tick) -> Self {
        self.push(Instruction::WaitTicks(ticks))
    }

    pub fn yield_now(self) -> Self {
        self.push(Instruction::Yield)
    }

    pub fn spawn<F>(self, worker: impl Into<String>, work: F) -> Self
    where
        F: Fn(StopToken) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(Instruction::Spawn {
            worker: worker.into(),
            work: Arc::new(work),
        })
    }

    pub fn await_worker(
        self,
        worker: impl Into<String>,
        timeout: Option<Tick>,
        on_timeout: OnTimeout,
    ) -> Self {
        self.push(Instruction::AwaitWorker {
            worker: worker.into(),
            timeout,
            on_timeout,
        })
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// States named by `OnTimeout::Goto` anywhere in the program
    pub(crate) fn goto_targets(&self) -> impl Iterator<Item = &str> {
        self.instructions.iter().filter_map(Instruction::goto_target)
    }
}

/// A request an action makes of the scheduler, applied once the action returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    JumpTo(String),
    Pause,
}

/// What an action can see and ask for while it runs
pub struct StepContext<'a> {
    tick: Tick,
    bot: &'a str,
    state: &'a str,
    cache: &'a dyn CacheView,
    threads: &'a ThreadRegistry,
    last_wait: Option<WaitOutcome>,
    directive: Option<Directive>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        tick: Tick,
        bot: &'a str,
        state: &'a str,
        cache: &'a dyn CacheView,
        threads: &'a ThreadRegistry,
        last_wait: Option<WaitOutcome>,
    ) -> Self {
        Self {
            tick,
            bot,
            state,
            cache,
            threads,
            last_wait,
            directive: None,
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn bot(&self) -> &str {
        self.bot
    }

    /// State (or recovery policy) this action belongs to
    pub fn state(&self) -> &str {
        self.state
    }

    pub fn cache(&self) -> &dyn CacheView {
        self.cache
    }

    pub fn read_as<T: Any + Send + Sync>(&self, namespace: &str) -> Result<Arc<T>, CacheError> {
        view_as::<T>(self.cache, namespace)
    }

    pub fn threads(&self) -> &ThreadRegistry {
        self.threads
    }

    /// How the last wait point of this program run ended, if any
    pub fn last_wait(&self) -> Option<WaitOutcome> {
        self.last_wait
    }

    /// Leave the current state for `state` once this action returns.
    /// The last request wins.
    pub fn jump_to(&mut self, state: impl Into<String>) {
        self.directive = Some(Directive::JumpTo(state.into()));
    }

    /// Pause the bot once this action returns
    pub fn pause(&mut self) {
        self.directive = Some(Directive::Pause);
    }

    pub(crate) fn take_directive(&mut self) -> Option<Directive> {
        self.directive.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_builder_records_goto_targets() {
        let program = Program::new()
            .run(|_| Ok(()))
            .wait_until_or(|_| Ok(false), 10, OnTimeout::Goto("Idle".into()))
            .wait_ticks(3)
            .await_worker("pathing", Some(5), OnTimeout::Goto("Flee".into()))
            .yield_now();

        assert_eq!(program.len(), 5);
        let targets: Vec<&str> = program.goto_targets().collect();
        assert_eq!(targets, vec!["Idle", "Flee"]);
        assert!(matches!(program.get(2), Some(Instruction::WaitTicks(3))));
        assert!(program.get(5).is_none());
    }

    #[test]
    fn test_wait_outcome_accessors() {
        let outcome = WaitOutcome::TimedOut { waited_ticks: 4 };
        assert!(outcome.timed_out());
        assert_eq!(outcome.waited_ticks(), 4);
        assert!(!WaitOutcome::Satisfied { waited_ticks: 0 }.timed_out());
    }
}
