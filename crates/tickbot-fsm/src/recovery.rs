use std::sync::Arc;

use tickbot_cache::CacheView;

use crate::Tick;
use crate::program::{Condition, OnTimeout, Program, StepContext};

/// Where the bot goes once a recovery program completes
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum ResumeTarget {
    /// Continue the interrupted state exactly where it was parked
    Resume,
    /// Leave the interrupted state for the named one
    JumpTo(String),
}

/// A watched condition that preempts normal execution with its own program.
///
/// Handlers for things like the character dying or the party wiping are
/// written as policies: wait for the respawn, then jump back to a safe state.
#[derive(Clone)]
pub struct RecoveryPolicy {
    name: String,
    trigger: Option<Condition>,
    program: Program,
    resume: ResumeTarget,
}

impl RecoveryPolicy {
    pub fn builder(name: impl Into<String>) -> RecoveryPolicyBuilder {
        RecoveryPolicyBuilder {
            name: name.into(),
            trigger: None,
            program: Program::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn resume_target(&self) -> &ResumeTarget {
        &self.resume
    }

    pub(crate) fn has_trigger(&self) -> bool {
        self.trigger.is_some()
    }

    pub(crate) fn evaluate(&self, cache: &dyn CacheView) -> anyhow::Result<bool> {
        match &self.trigger {
            Some(trigger) => trigger(cache),
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPolicy")
            .field("name", &self.name)
            .field("program", &self.program)
            .field("resume", &self.resume)
            .finish_non_exhaustive()
    }
}

pub struct RecoveryPolicyBuilder {
    name: String,
    trigger: Option<Condition>,
    program: Program,
}

impl RecoveryPolicyBuilder {
    pub fn trigger<F>(mut self, trigger: F) -> Self
    where
        F: Fn(&dyn CacheView) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.trigger = Some(Arc::new(trigger));
        self
    }

    pub fn wait_ticks(mut self, ticks: Tick) -> Self {
        self.program = self.program.wait_ticks(ticks);
        self
    }

    /// Wait for `condition`; on timeout the recovery fails
    pub fn wait_until<F>(mut self, condition: F, timeout: Option<Tick>) -> Self
    where
        F: Fn(&dyn CacheView) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.program = match timeout {
            Some(timeout) => self.program.wait_until_or(condition, timeout, OnTimeout::Fail),
            None => self.program.wait_until(condition),
        };
        self
    }

    pub fn run<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.program = self.program.run(action);
        self
    }

    /// Replace the recovery program wholesale
    pub fn program(mut self, program: Program) -> Self {
        self.program = program;
        self
    }

    pub fn resume(self) -> RecoveryPolicy {
        self.finish(ResumeTarget::Resume)
    }

    pub fn jump_to(self, state: impl Into<String>) -> RecoveryPolicy {
        self.finish(ResumeTarget::JumpTo(state.into()))
    }

    fn finish(self, resume: ResumeTarget) -> RecoveryPolicy {
        RecoveryPolicy {
            name: self.name,
            trigger: self.trigger,
            program: self.program,
            resume,
        }
    }
}
