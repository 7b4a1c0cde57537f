use std::sync::{Arc, OnceLock};

use crate::CacheError;

type Initializer<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Lazily-constructed shared instance that only exists once a host is connected.
///
/// `connect` stores the initializer; the first `get` after that runs it exactly
/// once, no matter how many threads race on the first access. Every caller gets
/// the same `Arc`.
pub struct InstanceGate<T> {
    initializer: OnceLock<Initializer<T>>,
    instance: OnceLock<Arc<T>>,
}

impl<T> InstanceGate<T> {
    pub const fn new() -> Self {
        Self {
            initializer: OnceLock::new(),
            instance: OnceLock::new(),
        }
    }

    /// Record that the host is connected and how to build the instance
    pub fn connect<F>(&self, initializer: F) -> Result<(), CacheError>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.initializer
            .set(Box::new(initializer))
            .map_err(|_| CacheError::AlreadyConnected)
    }

    /// Get the instance, constructing it on first use
    pub fn get(&self) -> Result<Arc<T>, CacheError> {
        if let Some(instance) = self.instance.get() {
            return Ok(Arc::clone(instance));
        }

        let initializer = self.initializer.get().ok_or(CacheError::NotReady)?;
        let instance = self.instance.get_or_init(|| {
            tracing::debug!(target: "cache", "Constructing shared instance");
            Arc::new(initializer())
        });
        Ok(Arc::clone(instance))
    }

    pub fn is_connected(&self) -> bool {
        self.initializer.get().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.instance.get().is_some()
    }
}

impl<T> Default for InstanceGate<T> {
    fn default() -> Self {
        Self::new()
    }
}
