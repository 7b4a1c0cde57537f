use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::BuildError;
use crate::recovery::{RecoveryPolicy, ResumeTarget};
use crate::state::BotState;

/// What the scheduler does after a step fails and its exit action has run
#[derive(Debug, Clone, Default, PartialEq, Eq, strum_macros::Display)]
pub enum FailurePolicy {
    /// Pause the bot; resuming re-enters the failed state
    #[default]
    Pause,
    /// Re-enter the failed state on the next tick
    Restart,
    /// Move to the named state
    JumpTo(String),
}

/// A validated, immutable bot definition
#[derive(Debug)]
pub struct BotScript {
    name: String,
    states: Vec<Arc<BotState>>,
    index: HashMap<String, usize>,
    start: String,
    policies: Vec<Arc<RecoveryPolicy>>,
    on_step_failure: FailurePolicy,
}

impl BotScript {
    pub fn builder(name: impl Into<String>) -> BotBuilder {
        BotBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self, name: &str) -> Option<&Arc<BotState>> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn states(&self) -> &[Arc<BotState>] {
        &self.states
    }

    pub fn start_state(&self) -> &str {
        &self.start
    }

    /// Recovery policies in priority order
    pub fn policies(&self) -> &[Arc<RecoveryPolicy>] {
        &self.policies
    }

    pub fn on_step_failure(&self) -> &FailurePolicy {
        &self.on_step_failure
    }
}

/// Assembles states and recovery policies into a [`BotScript`].
///
/// All cross references are checked in `build`, so a script that builds can
/// never ask the scheduler for a state that does not exist.
pub struct BotBuilder {
    name: String,
    states: Vec<BotState>,
    start: Option<String>,
    policies: Vec<RecoveryPolicy>,
    on_step_failure: FailurePolicy,
}

impl BotBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            start: None,
            policies: Vec::new(),
            on_step_failure: FailurePolicy::default(),
        }
    }

    pub fn state(mut self, state: BotState) -> Self {
        self.states.push(state);
        self
    }

    /// Defaults to the first state added
    pub fn start_at(mut self, state: impl Into<String>) -> Self {
        self.start = Some(state.into());
        self
    }

    /// Add a recovery policy; earlier policies have higher priority
    pub fn recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn on_step_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_step_failure = policy;
        self
    }

    pub fn build(self) -> Result<BotScript, BuildError> {
        if self.states.is_empty() {
            return Err(BuildError::NoStates(self.name));
        }

        let mut index = HashMap::with_capacity(self.states.len());
        for (i, state) in self.states.iter().enumerate() {
            if index.insert(state.name().to_string(), i).is_some() {
                return Err(BuildError::DuplicateName(state.name().to_string()));
            }
        }

        let mut policy_names = HashSet::new();
        for policy in &self.policies {
            if !policy_names.insert(policy.name()) {
                return Err(BuildError::DuplicateName(policy.name().to_string()));
            }
            if !policy.has_trigger() {
                return Err(BuildError::MissingTrigger(policy.name().to_string()));
            }
        }

        let known = |target: &str, referenced_by: &str| {
            if index.contains_key(target) {
                Ok(())
            } else {
                Err(BuildError::UnknownState {
                    state: target.to_string(),
                    referenced_by: referenced_by.to_string(),
                })
            }
        };

        let start = match self.start {
            Some(start) => start,
            None => self.states[0].name().to_string(),
        };
        known(&start, "start state")?;

        for state in &self.states {
            for transition in state.transitions() {
                known(&transition.target, state.name())?;
            }
            for target in state.program().goto_targets() {
                known(target, state.name())?;
            }
        }

        for policy in &self.policies {
            if let ResumeTarget::JumpTo(target) = policy.resume_target() {
                known(target, policy.name())?;
            }
            for target in policy.program().goto_targets() {
                known(target, policy.name())?;
            }
        }

        if let FailurePolicy::JumpTo(target) = &self.on_step_failure {
            known(target, "step failure policy")?;
        }

        Ok(BotScript {
            name: self.name,
            states: self.states.into_iter().map(Arc::new).collect(),
            index,
            start,
            policies: self.policies.into_iter().map(Arc::new).collect(),
            on_step_failure: self.on_step_failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{OnTimeout, Program};

    fn idle() -> BotState {
        BotState::builder("Idle").then("Travel").build()
    }

    fn travel() -> BotState {
        BotState::builder("Travel").then("Idle").build()
    }

    #[test]
    fn test_valid_script() {
        let script = BotBuilder::new("farmer")
            .state(idle())
            .state(travel())
            .build()
            .unwrap();
        assert_eq!(script.start_state(), "Idle");
        assert!(script.has_state("Travel"));
        assert_eq!(script.states().len(), 2);
        assert_eq!(script.on_step_failure(), &FailurePolicy::Pause);
    }

    #[test]
    fn test_empty_script_rejected() {
        assert!(matches!(
            BotBuilder::new("farmer").build(),
            Err(BuildError::NoStates(_))
        ));
    }

    #[test]
    fn test_duplicate_state_rejected() {
        let result = BotBuilder::new("farmer")
            .state(idle())
            .state(travel())
            .state(BotState::builder("Idle").build())
            .build();
        assert!(matches!(result, Err(BuildError::DuplicateName(name)) if name == "Idle"));
    }

    #[test]
    fn test_dangling_references_rejected() {
        let dangling_transition = BotBuilder::new("farmer")
            .state(BotState::builder("Idle").then("Bank").build())
            .build();
        assert!(matches!(
            dangling_transition,
            Err(BuildError::UnknownState { state, referenced_by }) if state == "Bank" && referenced_by == "Idle"
        ));

        let dangling_goto = BotBuilder::new("farmer")
            .state(
                BotState::builder("Idle")
                    .step(Program::new().wait_until_or(
                        |_| Ok(false),
                        5,
                        OnTimeout::Goto("Flee".into()),
                    ))
                    .build(),
            )
            .build();
        assert!(matches!(dangling_goto, Err(BuildError::UnknownState { state, .. }) if state == "Flee"));

        let dangling_start = BotBuilder::new("farmer")
            .state(idle())
            .state(travel())
            .start_at("Town")
            .build();
        assert!(matches!(dangling_start, Err(BuildError::UnknownState { state, .. }) if state == "Town"));

        let dangling_policy = BotBuilder::new("farmer")
            .state(idle())
            .state(travel())
            .recovery(
                RecoveryPolicy::builder("death")
                    .trigger(|_| Ok(false))
                    .jump_to("Graveyard"),
            )
            .build();
        assert!(matches!(
            dangling_policy,
            Err(BuildError::UnknownState { state, referenced_by }) if state == "Graveyard" && referenced_by == "death"
        ));
    }

    #[test]
    fn test_policy_needs_trigger() {
        let result = BotBuilder::new("farmer")
            .state(idle())
            .state(travel())
            .recovery(RecoveryPolicy::builder("death").resume())
            .build();
        assert!(matches!(result, Err(BuildError::MissingTrigger(name)) if name == "death"));
    }
}
