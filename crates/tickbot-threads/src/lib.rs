//! Named background workers with cooperative, bounded shutdown.

use std::time::Duration;

mod registry;
mod token;

pub use registry::{ThreadRegistry, WorkerInfo};
pub use token::StopToken;

/// Lifecycle of a registered worker.
///
/// Transitions only go forward: Running → StopRequested → Stopped or Zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ThreadStatus {
    Running,
    StopRequested,
    Stopped,
    /// Did not exit within its stop timeout. The thread may still be running.
    Zombie,
}

/// How a worker body returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed(String),
    Panicked(String),
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Completed)
    }

    /// Error text for failed or panicked workers
    pub fn error(&self) -> Option<&str> {
        match self {
            WorkerOutcome::Completed => None,
            WorkerOutcome::Failed(message) | WorkerOutcome::Panicked(message) => Some(message),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("a worker named '{0}' is already running")]
    DuplicateName(String),
    #[error("no worker named '{0}'")]
    NotFound(String),
    #[error("worker '{name}' did not stop within {timeout:?}")]
    GracefulStopTimedOut { name: String, timeout: Duration },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
