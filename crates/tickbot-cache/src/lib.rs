//! Throttled, per-tick cache of host state.
//!
//! Host queries are expensive, so reads never touch the host. A single caller
//! (the host driver) runs [`EntityCache::refresh_if_due`] once per tick; each
//! namespace then decides whether it is due based on its own interval.

use std::any::Any;
use std::sync::Arc;

mod cache;
mod gate;
mod namespace;

pub use cache::{EntityCache, EntityCacheBuilder, RefreshFailure, RefreshReport};
pub use gate::InstanceGate;
pub use namespace::{
    CacheNamespace, FailureBackoff, FnProvider, NamespaceStatus, Snapshot, SnapshotData,
    SnapshotProvider,
};
pub use tickbot_events::Tick;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("entity cache is not ready: host connection has not been established")]
    NotReady,
    #[error("host connection was already established")]
    AlreadyConnected,
    #[error("unknown cache namespace '{0}'")]
    UnknownNamespace(String),
    #[error("cache namespace '{0}' is registered twice")]
    DuplicateNamespace(String),
    #[error("cache namespace '{0}' has not been refreshed yet")]
    Empty(String),
    #[error("cache namespace '{namespace}' does not hold a {expected}")]
    TypeMismatch {
        namespace: String,
        expected: &'static str,
    },
}

/// Read-only access to cached host state.
///
/// This is what bot logic sees. It has no way to trigger a refresh.
pub trait CacheView: Send + Sync {
    fn read(&self, namespace: &str) -> Result<Snapshot, CacheError>;

    /// Most recent tick the cache was refreshed for
    fn current_tick(&self) -> Tick;
}

/// Typed read through a [`CacheView`]
pub fn view_as<T: Any + Send + Sync>(
    view: &dyn CacheView,
    namespace: &str,
) -> Result<Arc<T>, CacheError> {
    let snapshot = view.read(namespace)?;
    cache::downcast_snapshot(namespace, &snapshot)
}
