use std::sync::Arc;

use tickbot_cache::CacheView;
use tracing::{debug, warn};

use crate::recovery::RecoveryPolicy;

/// Result of evaluating every trigger once
#[derive(Debug, Default)]
pub struct InterruptPoll {
    /// Index of the policy that fired this tick, if any
    pub activated: Option<usize>,
    /// Triggers that could not be evaluated, as (policy name, error)
    pub errors: Vec<(String, anyhow::Error)>,
}

/// Edge-triggered watcher over a bot's recovery policies.
///
/// Policies are checked in priority order (index 0 first). A policy fires on
/// the tick its trigger turns true and cannot fire again until the trigger
/// has been seen false.
#[derive(Debug)]
pub struct InterruptController {
    policies: Vec<Arc<RecoveryPolicy>>,
    armed: Vec<bool>,
    active: Option<usize>,
}

impl InterruptController {
    pub fn new(policies: Vec<Arc<RecoveryPolicy>>) -> Self {
        let armed = vec![true; policies.len()];
        Self {
            policies,
            armed,
            active: None,
        }
    }

    /// Evaluate all triggers against `cache`.
    ///
    /// At most one policy activates per tick. While a recovery is active only
    /// a strictly higher-priority policy can activate; lower ones that rise in
    /// the meantime stay armed.
    pub fn poll(&mut self, cache: &dyn CacheView) -> InterruptPoll {
        let mut poll = InterruptPoll::default();

        for (index, policy) in self.policies.iter().enumerate() {
            match policy.evaluate(cache) {
                Ok(false) => {
                    if !self.armed[index] {
                        debug!(target: "interrupts", "Policy '{}' re-armed", policy.name());
                    }
                    self.armed[index] = true;
                }
                Ok(true) => {
                    let outranks_active = self.active.is_none_or(|active| index < active);
                    if self.armed[index] && poll.activated.is_none() && outranks_active {
                        debug!(target: "interrupts", "Policy '{}' fired", policy.name());
                        self.armed[index] = false;
                        poll.activated = Some(index);
                    }
                }
                Err(error) => {
                    warn!(
                        target: "interrupts",
                        "Trigger for policy '{}' failed, skipping this tick: {:#}",
                        policy.name(),
                        error
                    );
                    poll.errors.push((policy.name().to_string(), error));
                }
            }
        }

        poll
    }

    /// Let `index` fire again on its next true evaluation, without waiting for
    /// a falling edge. Used when its recovery was cut short.
    pub fn rearm(&mut self, index: usize) {
        if let Some(armed) = self.armed.get_mut(index) {
            if !*armed {
                debug!(target: "interrupts", "Policy '{}' re-armed after preemption", self.policies[index].name());
            }
            *armed = true;
        }
    }

    /// Record which policy's recovery is running
    pub fn set_active(&mut self, active: Option<usize>) {
        self.active = active;
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn active_policy(&self) -> Option<&Arc<RecoveryPolicy>> {
        self.active.and_then(|index| self.policies.get(index))
    }

    pub fn policy(&self, index: usize) -> Option<&Arc<RecoveryPolicy>> {
        self.policies.get(index)
    }

    pub fn is_armed(&self, index: usize) -> bool {
        self.armed.get(index).copied().unwrap_or(false)
    }

    pub fn policies(&self) -> &[Arc<RecoveryPolicy>] {
        &self.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    use tickbot_cache::EntityCache;

    // 0 = false, 1 = true, 2 = error
    fn policy(name: &str, signal: Arc<AtomicU8>) -> Arc<RecoveryPolicy> {
        Arc::new(
            RecoveryPolicy::builder(name)
                .trigger(move |_| match signal.load(Ordering::SeqCst) {
                    0 => Ok(false),
                    1 => Ok(true),
                    _ => anyhow::bail!("health bar not readable"),
                })
                .resume(),
        )
    }

    fn empty_cache() -> EntityCache {
        EntityCache::builder().build().unwrap()
    }

    #[test]
    fn test_continuously_true_trigger_fires_once() {
        let cache = empty_cache();
        let dead = Arc::new(AtomicU8::new(1));
        let mut controller = InterruptController::new(vec![policy("death", dead.clone())]);

        assert_eq!(controller.poll(&cache).activated, Some(0));
        controller.set_active(Some(0));
        for _ in 0..10 {
            assert_eq!(controller.poll(&cache).activated, None);
        }
        controller.set_active(None);
        assert_eq!(controller.poll(&cache).activated, None);

        // Falling edge re-arms, rising edge fires again
        dead.store(0, Ordering::SeqCst);
        assert_eq!(controller.poll(&cache).activated, None);
        assert!(controller.is_armed(0));
        dead.store(1, Ordering::SeqCst);
        assert_eq!(controller.poll(&cache).activated, Some(0));
    }

    #[test]
    fn test_only_highest_priority_fires_per_tick() {
        let cache = empty_cache();
        let high = Arc::new(AtomicU8::new(1));
        let low = Arc::new(AtomicU8::new(1));
        let mut controller = InterruptController::new(vec![
            policy("wipe", high.clone()),
            policy("death", low.clone()),
        ]);

        assert_eq!(controller.poll(&cache).activated, Some(0));
        assert!(controller.is_armed(1));

        // While 0 is active, 1 stays armed but cannot preempt
        controller.set_active(Some(0));
        assert_eq!(controller.poll(&cache).activated, None);
        assert!(controller.is_armed(1));

        // Once 0 is done, the still-true lower policy fires
        controller.set_active(None);
        assert_eq!(controller.poll(&cache).activated, Some(1));
    }

    #[test]
    fn test_higher_priority_preempts_active_recovery() {
        let cache = empty_cache();
        let high = Arc::new(AtomicU8::new(0));
        let low = Arc::new(AtomicU8::new(1));
        let mut controller = InterruptController::new(vec![
            policy("wipe", high.clone()),
            policy("death", low.clone()),
        ]);

        assert_eq!(controller.poll(&cache).activated, Some(1));
        controller.set_active(Some(1));

        high.store(1, Ordering::SeqCst);
        assert_eq!(controller.poll(&cache).activated, Some(0));
    }

    #[test]
    fn test_rearmed_policy_fires_again_while_still_true() {
        let cache = empty_cache();
        let high = Arc::new(AtomicU8::new(0));
        let low = Arc::new(AtomicU8::new(1));
        let mut controller = InterruptController::new(vec![
            policy("wipe", high.clone()),
            policy("death", low.clone()),
        ]);

        assert_eq!(controller.poll(&cache).activated, Some(1));
        controller.set_active(Some(1));
        high.store(1, Ordering::SeqCst);
        assert_eq!(controller.poll(&cache).activated, Some(0));
        assert!(!controller.is_armed(1));

        // Death was cut short; it must not need a falling edge to come back
        controller.rearm(1);
        controller.set_active(Some(0));
        assert_eq!(controller.poll(&cache).activated, None);
        controller.set_active(None);
        assert_eq!(controller.poll(&cache).activated, Some(1));

        // Out of range is ignored
        controller.rearm(7);
        assert!(!controller.is_armed(7));
    }

    #[test]
    fn test_trigger_error_leaves_arming_untouched() {
        let cache = empty_cache();
        let broken = Arc::new(AtomicU8::new(2));
        let healthy = Arc::new(AtomicU8::new(1));
        let mut controller = InterruptController::new(vec![
            policy("wipe", broken.clone()),
            policy("death", healthy.clone()),
        ]);

        let poll = controller.poll(&cache);
        assert_eq!(poll.errors.len(), 1);
        assert_eq!(poll.errors[0].0, "wipe");
        assert_eq!(poll.activated, Some(1));
        assert!(controller.is_armed(0));

        // Recovers on the next tick and fires on its rising edge
        broken.store(1, Ordering::SeqCst);
        controller.set_active(None);
        assert_eq!(controller.poll(&cache).activated, Some(0));
    }

    #[test]
    fn test_policy_without_trigger_never_fires() {
        let cache = empty_cache();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let orphan = RecoveryPolicy::builder("orphan")
            .run(move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .resume();
        let mut controller = InterruptController::new(vec![Arc::new(orphan)]);
        assert_eq!(controller.poll(&cache).activated, None);
        assert!(!called.load(Ordering::SeqCst));
    }
}
