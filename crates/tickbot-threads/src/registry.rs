use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::token::{Signal, StopToken};
use crate::{ThreadError, ThreadStatus, WorkerOutcome};

struct Entry {
    name: String,
    signal: Arc<Signal>,
    started_at: Instant,
    status: Mutex<ThreadStatus>,
    outcome: Mutex<Option<WorkerOutcome>>,
    done: Mutex<Receiver<WorkerOutcome>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    // Held for the duration of a stop so concurrent stops observe one result
    stopping: Mutex<()>,
}

impl Entry {
    fn status(&self) -> ThreadStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ThreadStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn recorded(&self) -> Option<WorkerOutcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, outcome: WorkerOutcome) -> WorkerOutcome {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        outcome
    }

    /// Outcome if the worker body has already returned; never blocks
    fn poll_outcome(&self) -> Option<WorkerOutcome> {
        if let Some(outcome) = self.recorded() {
            return Some(outcome);
        }

        // A stop in progress owns the channel and will record the outcome
        let done = match self.done.try_lock() {
            Ok(done) => done,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        match done.try_recv() {
            Ok(received) => Some(self.record(received)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.recorded().or_else(|| Some(self.record(lost()))),
        }
    }

    /// Wait up to `timeout` for the worker body to return
    fn wait_outcome(&self, timeout: Duration) -> Option<WorkerOutcome> {
        if let Some(outcome) = self.recorded() {
            return Some(outcome);
        }

        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = self.recorded() {
            return Some(outcome);
        }
        match done.recv_timeout(timeout) {
            Ok(received) => Some(self.record(received)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(self.record(lost())),
        }
    }

    fn join(&self) {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            // The body is wrapped in catch_unwind, so join only fails if
            // reporting the outcome panicked
            if handle.join().is_err() {
                warn!(target: "threads", "Worker '{}' thread panicked after reporting", self.name);
            }
        }
    }

    fn join_if_finished(&self) {
        if self.poll_outcome().is_some() {
            self.join();
        }
    }

    /// Running and the body has not returned yet
    fn is_live(&self) -> bool {
        matches!(self.status(), ThreadStatus::Running | ThreadStatus::StopRequested)
            && self.poll_outcome().is_none()
    }
}

/// Point-in-time view of a registered worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    pub status: ThreadStatus,
    pub outcome: Option<WorkerOutcome>,
    pub uptime: Duration,
    pub silence: Duration,
}

/// Registry of named background workers.
///
/// Workers are plain OS threads. The registry can ask a worker to stop and
/// wait for it, but it never kills one: a worker that ignores its
/// [`StopToken`] past the timeout is marked [`ThreadStatus::Zombie`] and left
/// running.
#[derive(Default)]
pub struct ThreadRegistry {
    workers: Mutex<HashMap<String, Arc<Entry>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` on a new named thread.
    ///
    /// Fails with `DuplicateName` while a worker with the same name is
    /// registered as running, even if its body has already returned. Settle it
    /// with [`stop`](Self::stop) first; stopped and zombied workers may be
    /// replaced.
    pub fn start<F>(&self, name: impl Into<String>, work: F) -> Result<(), ThreadError>
    where
        F: FnOnce(StopToken) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = workers.get(&name) {
            if matches!(
                existing.status(),
                ThreadStatus::Running | ThreadStatus::StopRequested
            ) {
                return Err(ThreadError::DuplicateName(name));
            }
            match existing.status() {
                ThreadStatus::Zombie => warn!(
                    target: "threads",
                    "Replacing zombie worker '{}'; its thread is detached and may still be running",
                    name
                ),
                status => debug!(target: "threads", "Replacing {} worker '{}'", status, name),
            }
            existing.join_if_finished();
        }

        let signal = Arc::new(Signal::new());
        let token = StopToken::new(signal.clone());
        let (tx, rx) = mpsc::channel();
        let worker_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("tickbot-{}", name))
            .spawn(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(|| work(token))) {
                    Ok(Ok(())) => {
                        debug!(target: "threads", "Worker '{}' finished", worker_name);
                        WorkerOutcome::Completed
                    }
                    Ok(Err(e)) => {
                        warn!(target: "threads", "Worker '{}' failed: {:#}", worker_name, e);
                        WorkerOutcome::Failed(format!("{:#}", e))
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(target: "threads", "Worker '{}' panicked: {}", worker_name, message);
                        WorkerOutcome::Panicked(message)
                    }
                };
                // The registry may have dropped the record already
                let _ = tx.send(outcome);
            })?;

        info!(target: "threads", "Started worker '{}'", name);

        workers.insert(
            name.clone(),
            Arc::new(Entry {
                name,
                signal,
                started_at: Instant::now(),
                status: Mutex::new(ThreadStatus::Running),
                outcome: Mutex::new(None),
                done: Mutex::new(rx),
                handle: Mutex::new(Some(handle)),
                stopping: Mutex::new(()),
            }),
        );
        Ok(())
    }

    /// Ask `name` to stop and wait up to `timeout` for it to exit.
    ///
    /// Repeated calls return the first call's result without waiting again.
    pub fn stop(&self, name: &str, timeout: Duration) -> Result<(), ThreadError> {
        let entry = self.entry(name)?;
        let _stopping = entry.stopping.lock().unwrap_or_else(PoisonError::into_inner);

        match entry.status() {
            ThreadStatus::Stopped => return Ok(()),
            ThreadStatus::Zombie => return Err(timed_out(name, timeout)),
            ThreadStatus::Running | ThreadStatus::StopRequested => {}
        }

        entry.set_status(ThreadStatus::StopRequested);
        entry.signal.request_stop();
        debug!(target: "threads", "Stop requested for worker '{}'", name);

        match entry.wait_outcome(timeout) {
            Some(_) => {
                entry.join();
                entry.set_status(ThreadStatus::Stopped);
                info!(target: "threads", "Worker '{}' stopped", name);
                Ok(())
            }
            None => {
                entry.set_status(ThreadStatus::Zombie);
                error!(
                    target: "threads",
                    "Worker '{}' did not stop within {:?}; marked as zombie",
                    name, timeout
                );
                Err(timed_out(name, timeout))
            }
        }
    }

    /// Stop every worker that is still running, sharing one deadline.
    pub fn stop_all(&self, timeout: Duration) -> Vec<(String, Result<(), ThreadError>)> {
        let entries = self.entries();
        let deadline = Instant::now() + timeout;

        // Signal everyone first so slow workers wind down in parallel
        for entry in &entries {
            if entry.status() == ThreadStatus::Running {
                entry.signal.request_stop();
            }
        }

        entries
            .into_iter()
            .filter(|entry| {
                matches!(entry.status(), ThreadStatus::Running | ThreadStatus::StopRequested)
            })
            .map(|entry| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let result = self.stop(&entry.name, remaining);
                (entry.name.clone(), result)
            })
            .collect()
    }

    pub fn status(&self, name: &str) -> Result<ThreadStatus, ThreadError> {
        Ok(self.entry(name)?.status())
    }

    /// Whether the worker body has returned, whatever its status
    pub fn is_finished(&self, name: &str) -> Result<bool, ThreadError> {
        Ok(self.entry(name)?.poll_outcome().is_some())
    }

    /// How the worker body returned, if it has
    pub fn outcome(&self, name: &str) -> Result<Option<WorkerOutcome>, ThreadError> {
        Ok(self.entry(name)?.poll_outcome())
    }

    pub fn info(&self, name: &str) -> Result<WorkerInfo, ThreadError> {
        let entry = self.entry(name)?;
        Ok(Self::describe(&entry))
    }

    /// Snapshot of every registered worker, sorted by name
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.entries().iter().map(|e| Self::describe(e.as_ref())).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Live workers that have not called `keepalive` within `max_silence`.
    ///
    /// Detection only: the caller decides whether to stop them.
    pub fn unresponsive(&self, max_silence: Duration) -> Vec<(String, Duration)> {
        let mut silent: Vec<(String, Duration)> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.status() == ThreadStatus::Running && entry.is_live())
            .filter_map(|entry| {
                let silence = entry.signal.silence();
                (silence > max_silence).then(|| (entry.name.clone(), silence))
            })
            .collect();
        silent.sort_by(|a, b| a.0.cmp(&b.0));
        silent
    }

    /// Names of workers currently marked as zombies
    pub fn zombies(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.status() == ThreadStatus::Zombie)
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Forget zombies whose threads have finally exited. Returns their names.
    pub fn reap(&self) -> Vec<String> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let finished: Vec<String> = workers
            .values()
            .filter(|entry| {
                entry.status() == ThreadStatus::Zombie && entry.poll_outcome().is_some()
            })
            .map(|entry| entry.name.clone())
            .collect();

        for name in &finished {
            if let Some(entry) = workers.remove(name) {
                entry.join();
                info!(target: "threads", "Reaped zombie worker '{}'", name);
            }
        }
        finished
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, name: &str) -> Result<Arc<Entry>, ThreadError> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ThreadError::NotFound(name.to_string()))
    }

    fn entries(&self) -> Vec<Arc<Entry>> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn describe(entry: &Entry) -> WorkerInfo {
        WorkerInfo {
            name: entry.name.clone(),
            status: entry.status(),
            outcome: entry.poll_outcome(),
            uptime: entry.started_at.elapsed(),
            silence: entry.signal.silence(),
        }
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("workers", &self.list())
            .finish()
    }
}

fn timed_out(name: &str, timeout: Duration) -> ThreadError {
    ThreadError::GracefulStopTimedOut {
        name: name.to_string(),
        timeout,
    }
}

// The sender only disappears without a message if reporting itself panicked
fn lost() -> WorkerOutcome {
    WorkerOutcome::Panicked("worker exited without reporting".to_string())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
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
    use std::sync::atomic::{AtomicBool, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn cooperative(token: StopToken) -> anyhow::Result<()> {
        while !token.sleep(Duration::from_millis(5)) {
            token.keepalive();
        }
        Ok(())
    }

    fn wait_until_finished(registry: &ThreadRegistry, name: &str) {
        let deadline = Instant::now() + TIMEOUT;
        while !registry.is_finished(name).unwrap() {
            assert!(Instant::now() < deadline, "worker '{}' never finished", name);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_duplicate_name_rejected_while_running() {
        let registry = ThreadRegistry::new();
        registry.start("worker1", cooperative).unwrap();

        let second_ran = Arc::new(AtomicBool::new(false));
        let flag = second_ran.clone();
        let result = registry.start("worker1", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(matches!(result, Err(ThreadError::DuplicateName(name)) if name == "worker1"));
        assert_eq!(registry.len(), 1);
        registry.stop("worker1", TIMEOUT).unwrap();
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_graceful_stop() {
        let registry = ThreadRegistry::new();
        registry.start("pathing", cooperative).unwrap();
        assert_eq!(registry.status("pathing").unwrap(), ThreadStatus::Running);

        registry.stop("pathing", TIMEOUT).unwrap();
        assert_eq!(registry.status("pathing").unwrap(), ThreadStatus::Stopped);
        assert_eq!(
            registry.outcome("pathing").unwrap(),
            Some(WorkerOutcome::Completed)
        );

        // Idempotent
        registry.stop("pathing", TIMEOUT).unwrap();
        assert_eq!(registry.status("pathing").unwrap(), ThreadStatus::Stopped);
    }

    #[test]
    fn test_unresponsive_worker_becomes_zombie() {
        let registry = ThreadRegistry::new();
        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        registry
            .start("stuck", move |_token| {
                // Ignores the token until released
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
            .unwrap();

        let result = registry.stop("stuck", Duration::from_millis(50));
        assert!(matches!(result, Err(ThreadError::GracefulStopTimedOut { .. })));
        assert_eq!(registry.status("stuck").unwrap(), ThreadStatus::Zombie);

        // A second stop reports the same thing without waiting again
        let started = Instant::now();
        assert!(registry.stop("stuck", TIMEOUT).is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(registry.zombies(), vec!["stuck".to_string()]);

        // Still a zombie after the thread eventually exits; never silently stopped
        release.store(true, Ordering::SeqCst);
        wait_until_finished(&registry, "stuck");
        assert_eq!(registry.status("stuck").unwrap(), ThreadStatus::Zombie);

        assert_eq!(registry.reap(), vec!["stuck".to_string()]);
        assert!(matches!(registry.status("stuck"), Err(ThreadError::NotFound(_))));
    }

    #[test]
    fn test_failure_and_panic_are_recorded() {
        let registry = ThreadRegistry::new();
        registry
            .start("fails", |_| anyhow::bail!("no route to target"))
            .unwrap();
        registry
            .start("panics", |_| -> anyhow::Result<()> { panic!("bad offset") })
            .unwrap();

        wait_until_finished(&registry, "fails");
        wait_until_finished(&registry, "panics");

        assert!(matches!(
            registry.outcome("fails").unwrap(),
            Some(WorkerOutcome::Failed(msg)) if msg.contains("no route")
        ));
        assert!(matches!(
            registry.outcome("panics").unwrap(),
            Some(WorkerOutcome::Panicked(msg)) if msg.contains("bad offset")
        ));
    }

    #[test]
    fn test_finished_worker_must_be_settled_before_replacing() {
        let registry = ThreadRegistry::new();
        registry.start("loot", |_| Ok(())).unwrap();
        wait_until_finished(&registry, "loot");

        // Returned, but still registered as running
        assert_eq!(registry.status("loot").unwrap(), ThreadStatus::Running);
        assert!(matches!(
            registry.start("loot", cooperative),
            Err(ThreadError::DuplicateName(name)) if name == "loot"
        ));
        assert_eq!(registry.status("loot").unwrap(), ThreadStatus::Running);

        registry.stop("loot", Duration::ZERO).unwrap();
        assert_eq!(registry.status("loot").unwrap(), ThreadStatus::Stopped);

        registry.start("loot", cooperative).unwrap();
        assert_eq!(registry.status("loot").unwrap(), ThreadStatus::Running);
        assert!(!registry.is_finished("loot").unwrap());
        registry.stop("loot", TIMEOUT).unwrap();
    }

    #[test]
    fn test_info_and_list_describe_workers() {
        let registry = ThreadRegistry::new();
        registry.start("scout", cooperative).unwrap();
        registry.start("archer", |_| Ok(())).unwrap();
        wait_until_finished(&registry, "archer");

        let scout = registry.info("scout").unwrap();
        assert_eq!(scout.name, "scout");
        assert_eq!(scout.status, ThreadStatus::Running);
        assert_eq!(scout.outcome, None);

        let names: Vec<String> = registry.list().into_iter().map(|info| info.name).collect();
        assert_eq!(names, vec!["archer".to_string(), "scout".to_string()]);
        assert_eq!(
            registry.info("archer").unwrap().outcome,
            Some(WorkerOutcome::Completed)
        );
        assert!(matches!(registry.info("ghost"), Err(ThreadError::NotFound(_))));

        registry.stop_all(TIMEOUT);
    }

    #[test]
    fn test_unresponsive_detection() {
        let registry = ThreadRegistry::new();
        registry
            .start("silent", |token| {
                token.sleep(Duration::from_secs(10));
                Ok(())
            })
            .unwrap();
        registry.start("chatty", cooperative).unwrap();

        thread::sleep(Duration::from_millis(100));
        let silent = registry.unresponsive(Duration::from_millis(50));
        assert_eq!(silent.len(), 1);
        assert_eq!(silent[0].0, "silent");

        let results = registry.stop_all(TIMEOUT);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }

    #[test]
    fn test_unknown_worker() {
        let registry = ThreadRegistry::new();
        assert!(matches!(registry.status("ghost"), Err(ThreadError::NotFound(_))));
        assert!(matches!(
            registry.stop("ghost", TIMEOUT),
            Err(ThreadError::NotFound(_))
        ));
    }
}
