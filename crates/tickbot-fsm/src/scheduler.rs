use std::sync::Arc;

use tickbot_cache::CacheView;
use tickbot_events::{BotEvent, EventEnvelope, EventSender};
use tickbot_threads::ThreadRegistry;
use tracing::{debug, error, info, trace, warn};

use crate::cursor::{Phase, ScheduleCursor, Suspension};
use crate::exec::{Exec, StepResult};
use crate::interrupt::InterruptController;
use crate::program::{Directive, WaitOutcome};
use crate::recovery::{RecoveryPolicy, ResumeTarget};
use crate::script::{BotScript, FailurePolicy};
use crate::state::BotState;
use crate::{SchedulerError, Tick};

/// What happened to one bot during one tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: Tick,
    /// The bot is paused and nothing ran
    pub idle: bool,
    /// Current state after the tick
    pub state: String,
    /// State whose entry action ran this tick
    pub entered: Option<String>,
    /// Transition taken after a completed step, as (from, to)
    pub transition: Option<(String, String)>,
    pub recovery_activated: Option<String>,
    pub recovery_completed: Option<String>,
    pub errors: Vec<SchedulerError>,
}

impl TickReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug)]
struct ActiveRecovery {
    policy: usize,
    /// Cursor of the interrupted state, restored on `Resume`
    saved: ScheduleCursor,
    /// First tick the interrupted state did not get
    interrupted_at: Tick,
    pc: usize,
    suspension: Option<Suspension>,
    last_wait: Option<WaitOutcome>,
}

/// Drives one bot through its script, one host tick at a time.
///
/// Owned by the host thread. Every call does a bounded amount of work and
/// returns; long operations belong in registry workers.
pub struct CooperativeScheduler {
    script: Arc<BotScript>,
    cache: Arc<dyn CacheView>,
    threads: Arc<ThreadRegistry>,
    events: EventSender,
    interrupts: InterruptController,
    cursor: ScheduleCursor,
    recovery: Option<ActiveRecovery>,
    last_tick: Tick,
}

impl CooperativeScheduler {
    pub fn new(
        script: Arc<BotScript>,
        cache: Arc<dyn CacheView>,
        threads: Arc<ThreadRegistry>,
    ) -> Self {
        let interrupts = InterruptController::new(script.policies().to_vec());
        let cursor = ScheduleCursor::entering(script.start_state());
        Self {
            script,
            cache,
            threads,
            events: EventSender::detached(),
            interrupts,
            cursor,
            recovery: None,
            last_tick: 0,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        self.script.name()
    }

    pub fn script(&self) -> &Arc<BotScript> {
        &self.script
    }

    pub fn cursor(&self) -> &ScheduleCursor {
        &self.cursor
    }

    pub fn current_state(&self) -> &str {
        self.cursor.state()
    }

    pub fn is_paused(&self) -> bool {
        self.cursor.is_paused()
    }

    /// Name of the recovery policy currently running, if any
    pub fn active_recovery(&self) -> Option<&str> {
        self.interrupts.active_policy().map(|policy| policy.name())
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    /// Advance the bot by one tick.
    ///
    /// Recovery triggers are checked first. If a recovery is running it gets
    /// the tick; otherwise the current state resumes where it was parked.
    pub fn tick(&mut self, tick: Tick) -> TickReport {
        let mut report = TickReport {
            tick,
            ..Default::default()
        };

        if self.cursor.paused {
            report.idle = true;
            report.state = self.cursor.state.clone();
            return report;
        }
        self.last_tick = tick;

        let poll = self.interrupts.poll(self.cache.as_ref());
        for (policy, source) in poll.errors {
            self.publish(BotEvent::RecoveryEvaluationFailed {
                policy: policy.clone(),
                error: format!("{:#}", source),
            });
            report
                .errors
                .push(SchedulerError::RecoveryEvaluationFailed { policy, source });
        }
        if let Some(index) = poll.activated {
            self.activate_recovery(index, &mut report);
        }

        if self.recovery.is_some() {
            self.advance_recovery(&mut report);
        } else {
            self.advance_state(&mut report);
        }

        report.state = self.cursor.state.clone();
        report
    }

    /// Force the bot into `state`, bypassing transitions.
    ///
    /// The current state's exit action runs if it was entered. Any parked wait
    /// and any running recovery are discarded.
    pub fn jump_to_state(&mut self, state: &str) -> Result<(), SchedulerError> {
        let mut errors = Vec::new();
        // Exit failures are already logged and published
        self.switch_to(state, &mut errors)
    }

    pub fn pause(&mut self) {
        if !self.cursor.paused {
            self.cursor.paused = true;
            info!(target: "scheduler", "[{}] Paused in '{}'", self.name(), self.cursor.state);
            self.publish(BotEvent::Paused);
        }
    }

    pub fn resume(&mut self) {
        if self.cursor.paused {
            self.cursor.paused = false;
            info!(target: "scheduler", "[{}] Resumed in '{}'", self.name(), self.cursor.state);
            self.publish(BotEvent::Resumed);
        }
    }

    fn advance_state(&mut self, report: &mut TickReport) {
        let script = Arc::clone(&self.script);
        let Some(state) = script.state(&self.cursor.state) else {
            // Only reachable if a directive named a state that does not exist
            report
                .errors
                .push(SchedulerError::UnknownState(self.cursor.state.clone()));
            self.pause();
            return;
        };

        if matches!(self.cursor.phase, Phase::Entering) {
            self.cursor.last_wait = None;
            report.entered = Some(state.name().to_string());

            let directive = match state.entry() {
                Some(entry) => match self.exec(state.name()).run_action(entry, None) {
                    Ok(directive) => directive,
                    Err(source) => {
                        let error = SchedulerError::StepFailed {
                            state: state.name().to_string(),
                            source,
                        };
                        self.fail_step(state, error, report);
                        return;
                    }
                },
                None => None,
            };

            self.cursor.phase = Phase::Stepping {
                pc: 0,
                suspension: None,
            };
            debug!(target: "scheduler", "[{}] Entered '{}'", script.name(), state.name());
            self.publish(BotEvent::StateEntered {
                state: state.name().to_string(),
            });

            if let Some(directive) = directive {
                self.apply_directive(directive, report);
                return;
            }
        }

        let result = {
            let exec = Exec {
                tick: self.last_tick,
                bot: script.name(),
                owner: state.name(),
                cache: self.cache.as_ref(),
                threads: self.threads.as_ref(),
                events: &self.events,
            };
            let Phase::Stepping { pc, suspension } = &mut self.cursor.phase else {
                return;
            };
            exec.run(state.program(), pc, suspension, &mut self.cursor.last_wait)
        };

        match result {
            StepResult::Suspended => {
                trace!(target: "scheduler", "[{}] '{}' parked", script.name(), state.name());
            }
            StepResult::Completed => self.complete_step(state, report),
            StepResult::Directive(directive) => self.apply_directive(directive, report),
            StepResult::Goto(target) => {
                if let Err(error) = self.switch_to(&target, &mut report.errors) {
                    report.errors.push(error);
                }
            }
            StepResult::Failed(error) => self.fail_step(state, error, report),
        }
    }

    /// Pick the first matching transition, or loop back into the same state
    fn complete_step(&mut self, state: &BotState, report: &mut TickReport) {
        let mut target = None;
        for transition in state.transitions() {
            match (transition.condition)(self.cache.as_ref()) {
                Ok(true) => {
                    target = Some(transition.target.clone());
                    break;
                }
                Ok(false) => {}
                Err(source) => {
                    warn!(
                        target: "scheduler",
                        "[{}] Transition {} -> {} could not be evaluated: {:#}",
                        self.name(),
                        state.name(),
                        transition.target,
                        source
                    );
                    report.errors.push(SchedulerError::TransitionFailed {
                        from: state.name().to_string(),
                        to: transition.target.clone(),
                        source,
                    });
                }
            }
        }

        match target {
            Some(target) => {
                if let Some(error) = self.run_exit(state) {
                    report.errors.push(error);
                }
                debug!(target: "scheduler", "[{}] {} -> {}", self.name(), state.name(), target);
                self.publish(BotEvent::Transitioned {
                    from: state.name().to_string(),
                    to: target.clone(),
                });
                report.transition = Some((state.name().to_string(), target.clone()));
                self.cursor.reset_to(target);
            }
            None => {
                // Still in the same state, so no exit action
                trace!(target: "scheduler", "[{}] '{}' loops", self.name(), state.name());
                self.cursor.phase = Phase::Entering;
                self.cursor.last_wait = None;
            }
        }
    }

    fn fail_step(&mut self, state: &BotState, error: SchedulerError, report: &mut TickReport) {
        error!(target: "scheduler", "[{}] {}", self.name(), error);
        self.publish(BotEvent::StepFailed {
            state: state.name().to_string(),
            error: error.to_string(),
        });
        report.errors.push(error);

        if let Some(exit_error) = self.run_exit(state) {
            report.errors.push(exit_error);
        }

        match self.script.on_step_failure().clone() {
            FailurePolicy::Pause => {
                self.cursor.reset_to(state.name());
                self.pause();
            }
            FailurePolicy::Restart => self.cursor.reset_to(state.name()),
            FailurePolicy::JumpTo(target) => {
                self.publish(BotEvent::Jumped {
                    from: state.name().to_string(),
                    to: target.clone(),
                });
                self.cursor.reset_to(target);
            }
        }
    }

    fn apply_directive(&mut self, directive: Directive, report: &mut TickReport) {
        match directive {
            Directive::Pause => self.pause(),
            Directive::JumpTo(target) => {
                if let Err(error) = self.switch_to(&target, &mut report.errors) {
                    warn!(target: "scheduler", "[{}] {}", self.name(), error);
                    report.errors.push(error);
                }
            }
        }
    }

    /// Leave the current state (running its exit if entered) for `target`
    fn switch_to(
        &mut self,
        target: &str,
        errors: &mut Vec<SchedulerError>,
    ) -> Result<(), SchedulerError> {
        let script = Arc::clone(&self.script);
        if !script.has_state(target) {
            return Err(SchedulerError::UnknownState(target.to_string()));
        }

        if let Some(active) = self.recovery.take() {
            if let Some(policy) = self.interrupts.policy(active.policy) {
                info!(
                    target: "scheduler",
                    "[{}] Jump to '{}' discards recovery '{}'",
                    script.name(),
                    target,
                    policy.name()
                );
            }
            self.interrupts.set_active(None);
            self.restore(active.saved);
        }

        let from = self.cursor.state.clone();
        if self.cursor.is_entered() {
            if let Some(state) = script.state(&from) {
                if let Some(error) = self.run_exit(state) {
                    errors.push(error);
                }
            }
        }

        info!(target: "scheduler", "[{}] Jump {} -> {}", script.name(), from, target);
        self.publish(BotEvent::Jumped {
            from,
            to: target.to_string(),
        });
        self.cursor.reset_to(target);
        Ok(())
    }

    /// Run `state`'s exit action. Failures are logged and returned, never fatal.
    fn run_exit(&self, state: &BotState) -> Option<SchedulerError> {
        let result = match state.exit() {
            Some(exit) => self.exec(state.name()).run_action(exit, self.cursor.last_wait),
            None => Ok(None),
        };
        self.publish(BotEvent::StateExited {
            state: state.name().to_string(),
        });

        match result {
            Ok(None) => None,
            Ok(Some(directive)) => {
                debug!(
                    target: "scheduler",
                    "[{}] Ignoring {:?} requested by exit action of '{}'",
                    self.name(),
                    directive,
                    state.name()
                );
                None
            }
            Err(source) => {
                let error = SchedulerError::StepFailed {
                    state: state.name().to_string(),
                    source,
                };
                error!(target: "scheduler", "[{}] Exit action failed: {}", self.name(), error);
                Some(error)
            }
        }
    }

    fn activate_recovery(&mut self, index: usize, report: &mut TickReport) {
        let Some(policy) = self.interrupts.policy(index).cloned() else {
            return;
        };

        let (saved, interrupted_at) = match self.recovery.take() {
            Some(preempted) => {
                if let Some(previous) = self.interrupts.policy(preempted.policy) {
                    info!(
                        target: "scheduler",
                        "[{}] Recovery '{}' preempts '{}', which will fire again if still triggered",
                        self.name(),
                        policy.name(),
                        previous.name()
                    );
                }
                // The preempted program restarts from the top later instead of being lost
                self.interrupts.rearm(preempted.policy);
                (preempted.saved, preempted.interrupted_at)
            }
            None => (self.cursor.clone(), self.last_tick),
        };

        info!(
            target: "scheduler",
            "[{}] Recovery '{}' interrupts '{}'",
            self.name(),
            policy.name(),
            self.cursor.state
        );
        self.publish(BotEvent::RecoveryActivated {
            policy: policy.name().to_string(),
            interrupted: self.cursor.state.clone(),
        });

        self.recovery = Some(ActiveRecovery {
            policy: index,
            saved,
            interrupted_at,
            pc: 0,
            suspension: None,
            last_wait: None,
        });
        self.interrupts.set_active(Some(index));
        report.recovery_activated = Some(policy.name().to_string());
    }

    fn advance_recovery(&mut self, report: &mut TickReport) {
        let Some(mut active) = self.recovery.take() else {
            return;
        };
        let Some(policy) = self.interrupts.policy(active.policy).cloned() else {
            self.interrupts.set_active(None);
            self.resume_interrupted(active);
            return;
        };

        let result = {
            let exec = Exec {
                tick: self.last_tick,
                bot: self.script.name(),
                owner: policy.name(),
                cache: self.cache.as_ref(),
                threads: self.threads.as_ref(),
                events: &self.events,
            };
            exec.run(
                policy.program(),
                &mut active.pc,
                &mut active.suspension,
                &mut active.last_wait,
            )
        };

        match result {
            StepResult::Suspended => self.recovery = Some(active),
            StepResult::Completed => {
                let target = policy.resume_target().clone();
                self.finish_recovery(active, &policy, target, report);
            }
            StepResult::Goto(target) | StepResult::Directive(Directive::JumpTo(target)) => {
                self.finish_recovery(active, &policy, ResumeTarget::JumpTo(target), report);
            }
            StepResult::Directive(Directive::Pause) => {
                self.recovery = Some(active);
                self.pause();
            }
            StepResult::Failed(error) => {
                error!(
                    target: "scheduler",
                    "[{}] Recovery '{}' failed: {}",
                    self.name(),
                    policy.name(),
                    error
                );
                self.publish(BotEvent::RecoveryFailed {
                    policy: policy.name().to_string(),
                    error: error.to_string(),
                });
                report.errors.push(error);
                self.interrupts.set_active(None);
                self.resume_interrupted(active);
                self.pause();
            }
        }
    }

    fn finish_recovery(
        &mut self,
        active: ActiveRecovery,
        policy: &RecoveryPolicy,
        target: ResumeTarget,
        report: &mut TickReport,
    ) {
        self.interrupts.set_active(None);
        self.resume_interrupted(active);

        let resumed = match target {
            ResumeTarget::Resume => self.cursor.state.clone(),
            ResumeTarget::JumpTo(state) => {
                if let Err(error) = self.switch_to(&state, &mut report.errors) {
                    report.errors.push(error);
                }
                self.cursor.state.clone()
            }
        };

        info!(
            target: "scheduler",
            "[{}] Recovery '{}' done, continuing in '{}'",
            self.name(),
            policy.name(),
            resumed
        );
        self.publish(BotEvent::RecoveryCompleted {
            policy: policy.name().to_string(),
            resumed,
        });
        report.recovery_completed = Some(policy.name().to_string());
    }

    /// Restore the interrupted cursor with its wait budget intact.
    ///
    /// Deadlines of a parked wait move forward by the ticks the recovery
    /// held, so the state gets as many checks as it would have without it.
    fn resume_interrupted(&mut self, active: ActiveRecovery) {
        let held = self
            .last_tick
            .saturating_sub(active.interrupted_at)
            .saturating_add(1);
        self.restore(active.saved);
        if let Phase::Stepping {
            suspension: Some(parked),
            ..
        } = &mut self.cursor.phase
        {
            parked.postpone(held);
            trace!(target: "scheduler", "[{}] Parked wait postponed by {} tick(s)", self.name(), held);
        }
    }

    /// Put back a saved cursor, keeping the current pause flag
    fn restore(&mut self, saved: ScheduleCursor) {
        let paused = self.cursor.paused;
        self.cursor = saved;
        self.cursor.paused = paused;
    }

    fn exec<'a>(&'a self, owner: &'a str) -> Exec<'a> {
        Exec {
            tick: self.last_tick,
            bot: self.script.name(),
            owner,
            cache: self.cache.as_ref(),
            threads: self.threads.as_ref(),
            events: &self.events,
        }
    }

    fn publish(&self, event: BotEvent) {
        self.events.publish(EventEnvelope::bot_event(
            self.script.name(),
            self.last_tick,
            event,
        ));
    }
}

impl std::fmt::Debug for CooperativeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeScheduler")
            .field("bot", &self.script.name())
            .field("cursor", &self.cursor)
            .field("active_recovery", &self.active_recovery())
            .field("last_tick", &self.last_tick)
            .finish_non_exhaustive()
    }
}
