use std::time::Duration;

use tickbot_cache::CacheView;
use tickbot_events::{BotEvent, EventEnvelope, EventSender};
use tickbot_threads::ThreadRegistry;
use tracing::{debug, warn};

use crate::cursor::Suspension;
use crate::program::{Action, Directive, Instruction, OnTimeout, Program, StepContext, WaitOutcome};
use crate::{SchedulerError, Tick};

/// How far a program got this tick
#[derive(Debug)]
pub(crate) enum StepResult {
    Suspended,
    Completed,
    /// An action asked for a jump or a pause; the pc is already past it
    Directive(Directive),
    /// A wait point timed out with `OnTimeout::Goto`
    Goto(String),
    Failed(SchedulerError),
}

enum Check {
    Pending,
    Ready,
    Expired,
    Failed(SchedulerError),
}

/// Everything a program needs to run for one tick
pub(crate) struct Exec<'a> {
    pub tick: Tick,
    pub bot: &'a str,
    /// Name of the state or recovery policy that owns the program
    pub owner: &'a str,
    pub cache: &'a dyn CacheView,
    pub threads: &'a ThreadRegistry,
    pub events: &'a EventSender,
}

impl Exec<'_> {
    pub fn run_action(
        &self,
        action: &Action,
        last_wait: Option<WaitOutcome>,
    ) -> anyhow::Result<Option<Directive>> {
        let mut ctx = StepContext::new(
            self.tick,
            self.bot,
            self.owner,
            self.cache,
            self.threads,
            last_wait,
        );
        action(&mut ctx)?;
        Ok(ctx.take_directive())
    }

    /// Run `program` from `pc` until it parks, completes or fails
    pub fn run(
        &self,
        program: &Program,
        pc: &mut usize,
        suspension: &mut Option<Suspension>,
        last_wait: &mut Option<WaitOutcome>,
    ) -> StepResult {
        loop {
            if let Some(parked) = suspension.take() {
                let waited_ticks = self.tick.saturating_sub(parked.started_at());
                match self.check(&parked) {
                    Check::Pending => {
                        *suspension = Some(parked);
                        return StepResult::Suspended;
                    }
                    Check::Ready => {
                        *last_wait = Some(WaitOutcome::Satisfied { waited_ticks });
                        *pc += 1;
                    }
                    Check::Expired => {
                        *last_wait = Some(WaitOutcome::TimedOut { waited_ticks });
                        warn!(
                            target: "scheduler",
                            bot = self.bot,
                            "Wait in '{}' timed out after {} tick(s)",
                            self.owner,
                            waited_ticks
                        );
                        self.events.publish(EventEnvelope::bot_event(
                            self.bot,
                            self.tick,
                            BotEvent::SuspensionTimedOut {
                                state: self.owner.to_string(),
                                waited_ticks,
                            },
                        ));

                        let on_timeout = program
                            .get(*pc)
                            .map(Instruction::on_timeout)
                            .unwrap_or(OnTimeout::Fail);
                        match on_timeout {
                            OnTimeout::Continue => *pc += 1,
                            OnTimeout::Fail => {
                                return StepResult::Failed(SchedulerError::SuspensionTimeout {
                                    state: self.owner.to_string(),
                                    waited_ticks,
                                });
                            }
                            OnTimeout::Goto(target) => return StepResult::Goto(target),
                        }
                    }
                    Check::Failed(error) => return StepResult::Failed(error),
                }
                continue;
            }

            let Some(instruction) = program.get(*pc) else {
                return StepResult::Completed;
            };

            match instruction {
                Instruction::Run(action) => match self.run_action(action, *last_wait) {
                    Ok(directive) => {
                        *pc += 1;
                        if let Some(directive) = directive {
                            return StepResult::Directive(directive);
                        }
                    }
                    Err(source) => return StepResult::Failed(self.step_failed(source)),
                },
                Instruction::WaitUntil {
                    condition, timeout, ..
                } => {
                    *suspension = Some(Suspension::Until {
                        condition: condition.clone(),
                        started_at: self.tick,
                        deadline: timeout.map(|t| self.tick.saturating_add(t)),
                    });
                }
                Instruction::WaitTicks(ticks) => {
                    *suspension = Some(Suspension::Ticks {
                        started_at: self.tick,
                        resume_at: self.tick.saturating_add(*ticks),
                    });
                }
                Instruction::Yield => {
                    *suspension = Some(Suspension::Ticks {
                        started_at: self.tick,
                        resume_at: self.tick.saturating_add(1),
                    });
                }
                Instruction::Spawn { worker, work } => {
                    self.settle_finished(worker);
                    let work = work.clone();
                    if let Err(error) = self.threads.start(worker.clone(), move |token| work(token)) {
                        return StepResult::Failed(self.step_failed(error.into()));
                    }
                    *pc += 1;
                }
                Instruction::AwaitWorker {
                    worker, timeout, ..
                } => {
                    *suspension = Some(Suspension::Worker {
                        name: worker.clone(),
                        started_at: self.tick,
                        deadline: timeout.map(|t| self.tick.saturating_add(t)),
                    });
                }
            }
        }
    }

    fn check(&self, suspension: &Suspension) -> Check {
        let expired = |deadline: &Option<Tick>| deadline.is_some_and(|d| self.tick >= d);

        match suspension {
            Suspension::Until {
                condition,
                deadline,
                ..
            } => match condition(self.cache) {
                Ok(true) => Check::Ready,
                Ok(false) if expired(deadline) => Check::Expired,
                Ok(false) => Check::Pending,
                Err(source) => Check::Failed(self.step_failed(source)),
            },
            Suspension::Ticks { resume_at, .. } => {
                if self.tick >= *resume_at {
                    Check::Ready
                } else {
                    Check::Pending
                }
            }
            Suspension::Worker { name, deadline, .. } => match self.threads.outcome(name) {
                Ok(Some(outcome)) => match outcome.error() {
                    None => Check::Ready,
                    Some(error) => Check::Failed(SchedulerError::WorkerFailed {
                        worker: name.clone(),
                        error: error.to_string(),
                    }),
                },
                Ok(None) if expired(deadline) => Check::Expired,
                Ok(None) => Check::Pending,
                Err(error) => Check::Failed(SchedulerError::WorkerFailed {
                    worker: name.clone(),
                    error: error.to_string(),
                }),
            },
        }
    }

    /// A previous run whose body returned still holds the name until stopped
    fn settle_finished(&self, worker: &str) {
        if !self.threads.is_finished(worker).unwrap_or(false) {
            return;
        }
        if let Err(error) = self.threads.stop(worker, Duration::ZERO) {
            debug!(target: "scheduler", bot = self.bot, "Previous '{}' run not settled: {}", worker, error);
        }
    }

    fn step_failed(&self, source: anyhow::Error) -> SchedulerError {
        SchedulerError::StepFailed {
            state: self.owner.to_string(),
            source,
        }
    }
}
