use crate::Tick;
use crate::program::{Condition, WaitOutcome};

/// Where a program is parked between ticks
#[derive(Clone)]
pub enum Suspension {
    /// Waiting for `condition`, checked once per tick
    Until {
        condition: Condition,
        started_at: Tick,
        deadline: Option<Tick>,
    },
    Ticks { started_at: Tick, resume_at: Tick },
    /// Waiting for a registry worker's body to return
    Worker {
        name: String,
        started_at: Tick,
        deadline: Option<Tick>,
    },
}

impl Suspension {
    pub fn started_at(&self) -> Tick {
        match self {
            Suspension::Until { started_at, .. }
            | Suspension::Ticks { started_at, .. }
            | Suspension::Worker { started_at, .. } => *started_at,
        }
    }

    /// Push the deadline or resume tick `ticks` further out
    pub(crate) fn postpone(&mut self, ticks: Tick) {
        match self {
            Suspension::Until { deadline, .. } | Suspension::Worker { deadline, .. } => {
                if let Some(deadline) = deadline {
                    *deadline = deadline.saturating_add(ticks);
                }
            }
            Suspension::Ticks { resume_at, .. } => *resume_at = resume_at.saturating_add(ticks),
        }
    }
}

impl std::fmt::Debug for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suspension::Until {
                started_at,
                deadline,
                ..
            } => f
                .debug_struct("Until")
                .field("started_at", started_at)
                .field("deadline", deadline)
                .finish_non_exhaustive(),
            Suspension::Ticks {
                started_at,
                resume_at,
            } => f
                .debug_struct("Ticks")
                .field("started_at", started_at)
                .field("resume_at", resume_at)
                .finish(),
            Suspension::Worker {
                name,
                started_at,
                deadline,
            } => f
                .debug_struct("Worker")
                .field("name", name)
                .field("started_at", started_at)
                .field("deadline", deadline)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Phase {
    /// The entry action has not run yet
    Entering,
    /// Entered; the step program is at `pc`, possibly parked
    Stepping {
        pc: usize,
        suspension: Option<Suspension>,
    },
}

/// Position of a bot within its script
#[derive(Debug, Clone)]
pub struct ScheduleCursor {
    pub(crate) state: String,
    pub(crate) phase: Phase,
    pub(crate) paused: bool,
    pub(crate) last_wait: Option<WaitOutcome>,
}

impl ScheduleCursor {
    pub(crate) fn entering(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            phase: Phase::Entering,
            paused: false,
            last_wait: None,
        }
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the entry action of the current state has run
    pub fn is_entered(&self) -> bool {
        matches!(self.phase, Phase::Stepping { .. })
    }

    pub fn pc(&self) -> Option<usize> {
        match &self.phase {
            Phase::Entering => None,
            Phase::Stepping { pc, .. } => Some(*pc),
        }
    }

    pub fn suspension(&self) -> Option<&Suspension> {
        match &self.phase {
            Phase::Entering => None,
            Phase::Stepping { suspension, .. } => suspension.as_ref(),
        }
    }

    /// Move to the entry point of `state`
    pub(crate) fn reset_to(&mut self, state: impl Into<String>) {
        self.state = state.into();
        self.phase = Phase::Entering;
        self.last_wait = None;
    }
}
