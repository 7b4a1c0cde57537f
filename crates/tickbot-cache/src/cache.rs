use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::gate::InstanceGate;
use crate::namespace::{CacheNamespace, NamespaceStatus, RefreshOutcome, Snapshot};
use crate::{CacheError, CacheView, Tick};

/// The process-wide cache. Empty until a host connects.
static GLOBAL: InstanceGate<EntityCache> = InstanceGate::new();

/// A namespace whose provider failed during a refresh pass
#[derive(Debug)]
pub struct RefreshFailure {
    pub namespace: String,
    pub error: anyhow::Error,
    pub consecutive_failures: u32,
}

/// Result of one refresh pass
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub tick: Tick,
    /// Namespaces that produced a new snapshot
    pub refreshed: Vec<String>,
    /// Namespaces whose provider failed; their readers keep the stale snapshot
    pub failed: Vec<RefreshFailure>,
    /// Namespaces skipped because of repeated failures
    pub cooling_down: Vec<String>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cache of host state, partitioned into independently-throttled namespaces
pub struct EntityCache {
    namespaces: Vec<CacheNamespace>,
    index: HashMap<String, usize>,
    current_tick: AtomicU64,
}

impl EntityCache {
    pub fn builder() -> EntityCacheBuilder {
        EntityCacheBuilder::new()
    }

    /// Mark the host connection as established.
    ///
    /// `initializer` runs once, on the first `get_instance` call.
    pub fn connect_host<F>(initializer: F) -> Result<(), CacheError>
    where
        F: Fn() -> EntityCache + Send + Sync + 'static,
    {
        GLOBAL.connect(initializer)?;
        debug!(target: "cache", "Host connected, entity cache available");
        Ok(())
    }

    /// The process-wide instance; `NotReady` until `connect_host` has been called
    pub fn get_instance() -> Result<Arc<EntityCache>, CacheError> {
        GLOBAL.get()
    }

    pub fn is_host_connected() -> bool {
        GLOBAL.is_connected()
    }

    /// Refresh every namespace that is due at `tick`.
    ///
    /// This is the single coordination point: call it once per host tick, never
    /// from individual consumers. Calling it again with the same tick is a no-op
    /// for every namespace already attempted at that tick.
    pub fn refresh_if_due(&self, tick: Tick) -> RefreshReport {
        self.current_tick.fetch_max(tick, Ordering::AcqRel);

        let mut report = RefreshReport {
            tick,
            ..Default::default()
        };

        for namespace in &self.namespaces {
            match namespace.refresh_if_due(tick) {
                RefreshOutcome::NotDue => {}
                RefreshOutcome::CoolingDown => {
                    report.cooling_down.push(namespace.name().to_string());
                }
                RefreshOutcome::Refreshed => {
                    trace!(target: "cache", "Refreshed '{}' at tick {}", namespace.name(), tick);
                    report.refreshed.push(namespace.name().to_string());
                }
                RefreshOutcome::Failed {
                    error,
                    consecutive_failures,
                } => {
                    warn!(
                        target: "cache",
                        "Refresh of '{}' failed at tick {} ({} in a row), serving stale data: {:#}",
                        namespace.name(),
                        tick,
                        consecutive_failures,
                        error
                    );
                    report.failed.push(RefreshFailure {
                        namespace: namespace.name().to_string(),
                        error,
                        consecutive_failures,
                    });
                }
            }
        }

        report
    }

    pub fn read(&self, namespace: &str) -> Result<Snapshot, CacheError> {
        Ok(self.namespace(namespace)?.read())
    }

    /// Typed read of the current snapshot
    pub fn read_as<T: Any + Send + Sync>(&self, namespace: &str) -> Result<Arc<T>, CacheError> {
        let snapshot = self.read(namespace)?;
        downcast_snapshot(namespace, &snapshot)
    }

    pub fn status(&self, namespace: &str) -> Result<NamespaceStatus, CacheError> {
        Ok(self.namespace(namespace)?.status())
    }

    /// Namespace names in registration order
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(|ns| ns.name())
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick.load(Ordering::Acquire)
    }

    fn namespace(&self, name: &str) -> Result<&CacheNamespace, CacheError> {
        self.index
            .get(name)
            .map(|&i| &self.namespaces[i])
            .ok_or_else(|| CacheError::UnknownNamespace(name.to_string()))
    }
}

impl CacheView for EntityCache {
    fn read(&self, namespace: &str) -> Result<Snapshot, CacheError> {
        EntityCache::read(self, namespace)
    }

    fn current_tick(&self) -> Tick {
        EntityCache::current_tick(self)
    }
}

impl Default for EntityCache {
    /// A cache with no namespaces
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            index: HashMap::new(),
            current_tick: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("namespaces", &self.namespaces)
            .field("current_tick", &self.current_tick())
            .finish()
    }
}

pub(crate) fn downcast_snapshot<T: Any + Send + Sync>(
    namespace: &str,
    snapshot: &Snapshot,
) -> Result<Arc<T>, CacheError> {
    if snapshot.is_empty() {
        return Err(CacheError::Empty(namespace.to_string()));
    }
    snapshot
        .downcast::<T>()
        .ok_or_else(|| CacheError::TypeMismatch {
            namespace: namespace.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

/// Builder for [`EntityCache`]
#[derive(Default)]
pub struct EntityCacheBuilder {
    namespaces: Vec<CacheNamespace>,
}

impl EntityCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: CacheNamespace) -> Self {
        self.namespaces.push(namespace);
        self
    }

    pub fn namespaces(mut self, namespaces: impl IntoIterator<Item = CacheNamespace>) -> Self {
        self.namespaces.extend(namespaces);
        self
    }

    pub fn build(self) -> Result<EntityCache, CacheError> {
        let mut index = HashMap::with_capacity(self.namespaces.len());
        for (i, namespace) in self.namespaces.iter().enumerate() {
            if index.insert(namespace.name().to_string(), i).is_some() {
                return Err(CacheError::DuplicateNamespace(namespace.name().to_string()));
            }
        }

        Ok(EntityCache {
            namespaces: self.namespaces,
            index,
            current_tick: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_namespace(name: &str, interval: Tick) -> (CacheNamespace, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ns = CacheNamespace::from_fn(name, interval, move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
        });
        (ns, calls)
    }

    #[test]
    fn test_duplicate_namespace_rejected() {
        let (a, _) = counter_namespace("agents", 1);
        let (b, _) = counter_namespace("agents", 2);
        let result = EntityCache::builder().namespace(a).namespace(b).build();
        assert!(matches!(result, Err(CacheError::DuplicateNamespace(name)) if name == "agents"));
    }

    #[test]
    fn test_unknown_namespace() {
        let cache = EntityCache::builder().build().unwrap();
        assert!(matches!(
            cache.read("skills"),
            Err(CacheError::UnknownNamespace(name)) if name == "skills"
        ));
    }

    #[test]
    fn test_fast_and_slow_namespaces() {
        let (fast, fast_calls) = counter_namespace("player", 1);
        let (slow, slow_calls) = counter_namespace("inventory", 5);
        let cache = EntityCache::builder()
            .namespace(fast)
            .namespace(slow)
            .build()
            .unwrap();

        for tick in 1..=5 {
            cache.refresh_if_due(tick);
        }

        assert_eq!(fast_calls.load(Ordering::SeqCst), 5);
        assert_eq!(slow_calls.load(Ordering::SeqCst), 1);

        cache.refresh_if_due(6);
        assert_eq!(slow_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.current_tick(), 6);
    }

    #[test]
    fn test_many_reads_in_one_tick_trigger_one_refresh() {
        let (ns, calls) = counter_namespace("agents", 1);
        let cache = EntityCache::builder().namespace(ns).build().unwrap();

        let report = cache.refresh_if_due(3);
        assert_eq!(report.refreshed, vec!["agents".to_string()]);

        for _ in 0..100 {
            let snapshot = cache.read("agents").unwrap();
            assert_eq!(snapshot.refreshed_at(), Some(3));
            // A second pass from a misbehaving call site must not refresh again
            assert!(cache.refresh_if_due(3).refreshed.is_empty());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*cache.read_as::<usize>("agents").unwrap(), 1);
    }

    #[test]
    fn test_read_as_errors() {
        let (ns, _) = counter_namespace("agents", 1);
        let cache = EntityCache::builder().namespace(ns).build().unwrap();

        assert!(matches!(cache.read_as::<usize>("agents"), Err(CacheError::Empty(_))));
        cache.refresh_if_due(1);
        assert!(matches!(
            cache.read_as::<String>("agents"),
            Err(CacheError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_refresh_is_reported_not_fatal() {
        let ok = CacheNamespace::from_fn("player", 1, || Ok(1u8));
        let bad = CacheNamespace::from_fn("party", 1, || -> anyhow::Result<u8> {
            anyhow::bail!("party frame not loaded")
        });
        let cache = EntityCache::builder()
            .namespace(ok)
            .namespace(bad)
            .build()
            .unwrap();

        let report = cache.refresh_if_due(1);
        assert_eq!(report.refreshed, vec!["player".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].namespace, "party");
        assert!(!report.is_clean());
        assert!(cache.read("party").unwrap().is_stale());
    }

    #[test]
    fn test_concurrent_readers_during_refresh() {
        let (ns, _) = counter_namespace("agents", 1);
        let cache = Arc::new(EntityCache::builder().namespace(ns).build().unwrap());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..1_000 {
                        if let Ok(value) = cache.read_as::<usize>("agents") {
                            // Snapshots only ever move forward
                            assert!(*value >= last);
                            last = *value;
                        }
                    }
                })
            })
            .collect();

        for tick in 1..=200 {
            cache.refresh_if_due(tick);
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
