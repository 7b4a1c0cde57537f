use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::Tick;

/// Type-erased snapshot payload
pub type SnapshotData = Arc<dyn Any + Send + Sync>;

/// Source of a namespace's data.
///
/// Implementations usually call into the host's native query surface. The only
/// contract is: return a complete, consistent snapshot or fail.
pub trait SnapshotProvider: Send + Sync + 'static {
    type Snapshot: Send + Sync + 'static;

    fn refresh(&self) -> anyhow::Result<Self::Snapshot>;
}

/// Adapter that lets a plain closure act as a provider
pub struct FnProvider<F>(F);

impl<F, T> SnapshotProvider for FnProvider<F>
where
    F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    type Snapshot = T;

    fn refresh(&self) -> anyhow::Result<T> {
        (self.0)()
    }
}

trait ErasedProvider: Send + Sync {
    fn refresh_erased(&self) -> anyhow::Result<SnapshotData>;
}

impl<P: SnapshotProvider> ErasedProvider for P {
    fn refresh_erased(&self) -> anyhow::Result<SnapshotData> {
        let snapshot = self.refresh()?;
        Ok(Arc::new(snapshot))
    }
}

/// Immutable view of a namespace as of its last refresh
#[derive(Clone, Default)]
pub struct Snapshot {
    data: Option<SnapshotData>,
    refreshed_at: Option<Tick>,
    stale: bool,
}

impl Snapshot {
    /// Tick of the refresh that produced this data, if any has succeeded
    pub fn refreshed_at(&self) -> Option<Tick> {
        self.refreshed_at
    }

    /// True when the most recent refresh attempt failed and this is older data
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|data| data.downcast_ref::<T>())
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data
            .as_ref()
            .and_then(|data| Arc::clone(data).downcast::<T>().ok())
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("present", &self.data.is_some())
            .field("refreshed_at", &self.refreshed_at)
            .field("stale", &self.stale)
            .finish()
    }
}

/// Skip refreshes for a while after repeated provider failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureBackoff {
    /// Consecutive failures before the namespace cools down (0 disables)
    pub failure_threshold: u32,
    /// Ticks to skip once the threshold is reached
    pub cooldown_ticks: Tick,
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ticks: 60,
        }
    }
}

impl FailureBackoff {
    pub fn disabled() -> Self {
        Self {
            failure_threshold: 0,
            cooldown_ticks: 0,
        }
    }
}

/// Point-in-time bookkeeping for one namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceStatus {
    pub name: String,
    pub refresh_interval: Tick,
    pub last_attempt_tick: Option<Tick>,
    pub last_refreshed_tick: Option<Tick>,
    pub refresh_count: u64,
    pub consecutive_failures: u32,
    pub cooling_down_until: Option<Tick>,
    pub stale: bool,
    pub last_error: Option<String>,
}

/// What a single namespace did during a refresh pass
#[derive(Debug)]
pub(crate) enum RefreshOutcome {
    NotDue,
    CoolingDown,
    Refreshed,
    Failed {
        error: anyhow::Error,
        consecutive_failures: u32,
    },
}

#[derive(Debug, Default)]
struct RefreshState {
    last_attempt: Option<Tick>,
    last_refreshed: Option<Tick>,
    refresh_count: u64,
    consecutive_failures: u32,
    open_until: Option<Tick>,
    last_error: Option<String>,
}

/// A logical group of related host-state queries with its own refresh interval
pub struct CacheNamespace {
    name: String,
    refresh_interval: Tick,
    backoff: FailureBackoff,
    provider: Box<dyn ErasedProvider>,
    snapshot: RwLock<Snapshot>,
    refresh: Mutex<RefreshState>,
}

impl CacheNamespace {
    /// Create a namespace refreshed every `refresh_interval` ticks (minimum 1)
    pub fn new<P: SnapshotProvider>(
        name: impl Into<String>,
        refresh_interval: Tick,
        provider: P,
    ) -> Self {
        Self {
            name: name.into(),
            refresh_interval: refresh_interval.max(1),
            backoff: FailureBackoff::default(),
            provider: Box::new(provider),
            snapshot: RwLock::new(Snapshot::default()),
            refresh: Mutex::new(RefreshState::default()),
        }
    }

    /// Create a namespace backed by a closure
    pub fn from_fn<F, T>(name: impl Into<String>, refresh_interval: Tick, provider: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        Self::new(name, refresh_interval, FnProvider(provider))
    }

    pub fn with_backoff(mut self, backoff: FailureBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_interval(mut self, refresh_interval: Tick) -> Self {
        self.refresh_interval = refresh_interval.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn refresh_interval(&self) -> Tick {
        self.refresh_interval
    }

    /// Current snapshot handle; holds the read lock only for the clone
    pub fn read(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> NamespaceStatus {
        let state = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        NamespaceStatus {
            name: self.name.clone(),
            refresh_interval: self.refresh_interval,
            last_attempt_tick: state.last_attempt,
            last_refreshed_tick: state.last_refreshed,
            refresh_count: state.refresh_count,
            consecutive_failures: state.consecutive_failures,
            cooling_down_until: state.open_until,
            stale: self.read().is_stale(),
            last_error: state.last_error.clone(),
        }
    }

    /// Refresh at most once for `tick`, honoring the interval and any cooldown.
    ///
    /// The refresh mutex serializes concurrent passes for the same namespace, so
    /// two callers with the same tick still produce a single provider call.
    pub(crate) fn refresh_if_due(&self, tick: Tick) -> RefreshOutcome {
        let mut state = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = state.last_attempt {
            if tick < last.saturating_add(self.refresh_interval) {
                return RefreshOutcome::NotDue;
            }
        }

        if let Some(until) = state.open_until {
            if tick < until {
                return RefreshOutcome::CoolingDown;
            }
            debug!(target: "cache", "Namespace '{}' cooldown over, retrying", self.name);
            state.open_until = None;
        }

        state.last_attempt = Some(tick);

        let result = match catch_unwind(AssertUnwindSafe(|| self.provider.refresh_erased())) {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "provider panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match result {
            Ok(data) => {
                self.swap(Snapshot {
                    data: Some(data),
                    refreshed_at: Some(tick),
                    stale: false,
                });
                state.last_refreshed = Some(tick);
                state.refresh_count += 1;
                state.consecutive_failures = 0;
                state.last_error = None;
                RefreshOutcome::Refreshed
            }
            Err(error) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_error = Some(format!("{:#}", error));

                let previous = self.read();
                self.swap(Snapshot {
                    stale: true,
                    ..previous
                });

                if self.backoff.failure_threshold > 0
                    && state.consecutive_failures >= self.backoff.failure_threshold
                {
                    let until = tick.saturating_add(self.backoff.cooldown_ticks.max(1));
                    warn!(
                        target: "cache",
                        "Namespace '{}' failed {} times in a row, cooling down until tick {}",
                        self.name, state.consecutive_failures, until
                    );
                    state.open_until = Some(until);
                }

                RefreshOutcome::Failed {
                    error,
                    consecutive_failures: state.consecutive_failures,
                }
            }
        }
    }

    fn swap(&self, snapshot: Snapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

impl std::fmt::Debug for CacheNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNamespace")
            .field("name", &self.name)
            .field("refresh_interval", &self.refresh_interval)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn counting(interval: Tick) -> (CacheNamespace, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ns = CacheNamespace::from_fn("agents", interval, move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
        });
        (ns, calls)
    }

    #[test]
    fn test_empty_before_first_refresh() {
        let (ns, _) = counting(1);
        let snapshot = ns.read();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.refreshed_at(), None);
        assert!(snapshot.get::<usize>().is_none());
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let (ns, calls) = counting(0);
        assert_eq!(ns.refresh_interval(), 1);
        ns.refresh_if_due(3);
        ns.refresh_if_due(3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_tick_refreshes_once() {
        let (ns, calls) = counting(1);
        assert!(matches!(ns.refresh_if_due(7), RefreshOutcome::Refreshed));
        assert!(matches!(ns.refresh_if_due(7), RefreshOutcome::NotDue));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ns.read().refreshed_at(), Some(7));
        assert_eq!(ns.read().get::<usize>(), Some(&1));
    }

    #[test]
    fn test_older_tick_is_ignored() {
        let (ns, calls) = counting(1);
        ns.refresh_if_due(10);
        assert!(matches!(ns.refresh_if_due(4), RefreshOutcome::NotDue));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_keeps_previous_snapshot_marked_stale() {
        let fail = Arc::new(AtomicU32::new(0));
        let flag = fail.clone();
        let ns = CacheNamespace::from_fn("party", 1, move || {
            if flag.load(Ordering::SeqCst) > 0 {
                anyhow::bail!("host query failed");
            }
            Ok(42u32)
        });

        ns.refresh_if_due(1);
        fail.store(1, Ordering::SeqCst);
        let outcome = ns.refresh_if_due(2);

        assert!(matches!(
            outcome,
            RefreshOutcome::Failed {
                consecutive_failures: 1,
                ..
            }
        ));
        let snapshot = ns.read();
        assert!(snapshot.is_stale());
        assert_eq!(snapshot.get::<u32>(), Some(&42));
        assert_eq!(snapshot.refreshed_at(), Some(1));

        let status = ns.status();
        assert_eq!(status.last_attempt_tick, Some(2));
        assert_eq!(status.last_refreshed_tick, Some(1));
        assert!(status.last_error.unwrap().contains("host query failed"));
    }

    #[test]
    fn test_provider_panic_is_contained() {
        let ns = CacheNamespace::from_fn("map", 1, || -> anyhow::Result<u8> {
            panic!("bad pointer");
        });
        match ns.refresh_if_due(1) {
            RefreshOutcome::Failed { error, .. } => {
                assert!(error.to_string().contains("bad pointer"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_backoff_cools_down_after_threshold() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ns = CacheNamespace::from_fn("inventory", 1, move || -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("offline")
        })
        .with_backoff(FailureBackoff {
            failure_threshold: 2,
            cooldown_ticks: 3,
        });

        ns.refresh_if_due(1);
        ns.refresh_if_due(2);
        assert_eq!(ns.status().cooling_down_until, Some(5));
        assert!(matches!(ns.refresh_if_due(3), RefreshOutcome::CoolingDown));
        assert!(matches!(ns.refresh_if_due(4), RefreshOutcome::CoolingDown));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Half-open: one more attempt goes through
        assert!(matches!(ns.refresh_if_due(5), RefreshOutcome::Failed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_typed_downcast() {
        let ns = CacheNamespace::from_fn("player", 1, || Ok(vec![1u32, 2, 3]));
        ns.refresh_if_due(1);
        let data = ns.read().downcast::<Vec<u32>>().unwrap();
        assert_eq!(data.len(), 3);
        assert!(ns.read().downcast::<String>().is_none());
    }
}
