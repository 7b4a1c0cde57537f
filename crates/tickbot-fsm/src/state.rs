use std::sync::Arc;

use tickbot_cache::CacheView;

use crate::program::{Action, Condition, Program, StepContext};

/// Edge to another state, taken when the step completes and `condition` holds
#[derive(Clone)]
pub struct Transition {
    pub condition: Condition,
    pub target: String,
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A named bot state. Immutable once built.
#[derive(Clone)]
pub struct BotState {
    name: String,
    entry: Option<Action>,
    program: Program,
    exit: Option<Action>,
    transitions: Vec<Transition>,
}

impl BotState {
    pub fn builder(name: impl Into<String>) -> StateBuilder {
        StateBuilder {
            state: BotState {
                name: name.into(),
                entry: None,
                program: Program::new(),
                exit: None,
                transitions: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> Option<&Action> {
        self.entry.as_ref()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn exit(&self) -> Option<&Action> {
        self.exit.as_ref()
    }

    /// Transitions in declaration order
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }
}

impl std::fmt::Debug for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotState")
            .field("name", &self.name)
            .field("has_entry", &self.entry.is_some())
            .field("program", &self.program)
            .field("has_exit", &self.exit.is_some())
            .field("transitions", &self.transitions)
            .finish()
    }
}

pub struct StateBuilder {
    state: BotState,
}

impl StateBuilder {
    pub fn on_enter<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.state.entry = Some(Arc::new(action));
        self
    }

    pub fn step(mut self, program: Program) -> Self {
        self.state.program = program;
        self
    }

    pub fn on_exit<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.state.exit = Some(Arc::new(action));
        self
    }

    /// Add a transition; earlier transitions win
    pub fn transition<F>(mut self, target: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&dyn CacheView) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.state.transitions.push(Transition {
            condition: Arc::new(condition),
            target: target.into(),
        });
        self
    }

    /// Unconditional transition
    pub fn then(self, target: impl Into<String>) -> Self {
        self.transition(target, |_| Ok(true))
    }

    pub fn build(self) -> BotState {
        self.state
    }
}
