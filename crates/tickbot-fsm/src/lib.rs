//! Cooperative, tick-driven state machine for bot logic.
//!
//! A bot is a [`BotScript`]: named states, each with an entry action, a
//! resumable step [`Program`], an exit action and ordered transitions, plus
//! prioritized [`RecoveryPolicy`]s. A [`CooperativeScheduler`] advances one bot
//! by at most one state's worth of work per host tick, parking at explicit
//! wait points instead of blocking the host thread.

mod cursor;
mod exec;
mod interrupt;
mod program;
mod recovery;
mod scheduler;
mod script;
mod state;

pub use cursor::{Phase, ScheduleCursor, Suspension};
pub use interrupt::{InterruptController, InterruptPoll};
pub use program::{
    Action, Condition, Directive, Instruction, OnTimeout, Program, StepContext, WaitOutcome,
    WorkerFn,
};
pub use recovery::{RecoveryPolicy, RecoveryPolicyBuilder, ResumeTarget};
pub use scheduler::{CooperativeScheduler, TickReport};
pub use script::{BotBuilder, BotScript, FailurePolicy};
pub use state::{BotState, StateBuilder, Transition};
pub use tickbot_events::Tick;

/// Errors rejected while assembling a script
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("'{0}' is defined more than once")]
    DuplicateName(String),
    #[error("unknown state '{state}' referenced by {referenced_by}")]
    UnknownState { state: String, referenced_by: String },
    #[error("bot '{0}' has no states")]
    NoStates(String),
    #[error("recovery policy '{0}' has no trigger")]
    MissingTrigger(String),
}

/// Errors surfaced while running a script
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown state '{0}'")]
    UnknownState(String),
    #[error("trigger for recovery policy '{policy}' could not be evaluated: {source:#}")]
    RecoveryEvaluationFailed {
        policy: String,
        source: anyhow::Error,
    },
    #[error("wait in '{state}' timed out after {waited_ticks} tick(s)")]
    SuspensionTimeout { state: String, waited_ticks: Tick },
    #[error("step in '{state}' failed: {source:#}")]
    StepFailed {
        state: String,
        source: anyhow::Error,
    },
    #[error("transition {from} -> {to} could not be evaluated: {source:#}")]
    TransitionFailed {
        from: String,
        to: String,
        source: anyhow::Error,
    },
    #[error("worker '{worker}' failed: {error}")]
    WorkerFailed { worker: String, error: String },
}
