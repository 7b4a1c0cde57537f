use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct Signal {
    stop_requested: Mutex<bool>,
    wake: Condvar,
    last_keepalive: Mutex<Instant>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            stop_requested: Mutex::new(false),
            wake: Condvar::new(),
            last_keepalive: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn request_stop(&self) {
        let mut stop = self
            .stop_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stop = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        *self
            .stop_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn silence(&self) -> Duration {
        self.last_keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Handed to every worker; the only way a worker learns it should exit.
///
/// Stopping is cooperative. A worker that never checks its token cannot be
/// stopped and ends up a zombie.
#[derive(Debug, Clone)]
pub struct StopToken {
    signal: Arc<Signal>,
}

impl StopToken {
    pub(crate) fn new(signal: Arc<Signal>) -> Self {
        Self { signal }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.signal.is_stop_requested()
    }

    /// Sleep for `duration` or until a stop is requested.
    ///
    /// Returns `true` if the sleep ended because of a stop request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let stop = self
            .signal
            .stop_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (stop, _) = self
            .signal
            .wake
            .wait_timeout_while(stop, duration, |stop| !*stop)
            .unwrap_or_else(PoisonError::into_inner);
        *stop
    }

    /// Tell the registry this worker is still making progress
    pub fn keepalive(&self) {
        *self
            .signal
            .last_keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sleep_runs_full_duration_without_stop() {
        let token = StopToken::new(Arc::new(Signal::new()));
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_sleep_wakes_on_stop() {
        let signal = Arc::new(Signal::new());
        let token = StopToken::new(signal.clone());

        let sleeper = thread::spawn(move || {
            let started = Instant::now();
            let stopped = token.sleep(Duration::from_secs(10));
            (stopped, started.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        signal.request_stop();

        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_keepalive_resets_silence() {
        let signal = Arc::new(Signal::new());
        let token = StopToken::new(signal.clone());
        thread::sleep(Duration::from_millis(20));
        assert!(signal.silence() >= Duration::from_millis(20));
        token.keepalive();
        assert!(signal.silence() < Duration::from_millis(20));
    }
}
