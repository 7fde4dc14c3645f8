//! Heuristic detection of a feed that has stopped yielding new posts.
//!
//! Two signals are tracked: a known key reappearing too often, and an empty
//! feed. Both are best-effort. Dense but healthy feeds can look stalled, and a
//! feed that quietly serves the same page can go unnoticed; neither case is a
//! defect of the collector.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Bounded "act, wait, check" loop behind every retry path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Recovery {
    pub attempts: u32,
    pub wait: Duration,
}

impl Recovery {
    pub(crate) fn new(attempts: u32, wait: Duration) -> Self {
        Self { attempts, wait }
    }

    /// Runs `action` then `probe` up to `attempts` times, waiting `wait`
    /// between them. Returns `true` as soon as a probe succeeds.
    pub(crate) async fn attempt<A, AF, P, PF>(&self, mut action: A, mut probe: P) -> bool
    where
        A: FnMut(u32) -> AF,
        AF: Future<Output = ()>,
        P: FnMut() -> PF,
        PF: Future<Output = bool>,
    {
        for attempt in 1..=self.attempts {
            action(attempt).await;
            tokio::time::sleep(self.wait).await;
            if probe().await {
                tracing::info!(target: "stall_task", "Recovery succeeded on attempt {}/{}.", attempt, self.attempts);
                return true;
            }
            tracing::debug!(target: "stall_task", "Recovery attempt {}/{} found nothing new.", attempt, self.attempts);
        }
        false
    }
}

/// Per-run repeat counts and the keys whose recovery failed.
#[derive(Debug, Default)]
pub(crate) struct StallDetector {
    threshold: u32,
    repeat_counter: HashMap<String, u32>,
    problematic_keys: Vec<String>,
}

impl StallDetector {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Counts one more sighting of an already-known key and returns the
    /// updated count.
    pub(crate) fn observe_repeat(&mut self, key: &str) -> u32 {
        let count = self.repeat_counter.entry(key.to_string()).or_insert(0);
        *count += 1;
        tracing::info!(target: "stall_task",
            "Key {} is already processed. Occurrence count: {}.", key, count);
        *count
    }

    /// A key is stalled once its count goes strictly above the threshold.
    pub(crate) fn is_stalled(&self, count: u32) -> bool {
        count > self.threshold
    }

    pub(crate) fn mark_problematic(&mut self, key: String) {
        tracing::warn!(target: "stall_task", "Key {} marked as a stall point.", key);
        self.problematic_keys.push(key);
    }

    /// Takes the first problematic key and forgets the rest.
    pub(crate) fn take_problematic(&mut self) -> Option<String> {
        let first = self.problematic_keys.first().cloned();
        self.problematic_keys.clear();
        first
    }

    /// Called after a successful retry: the feed moved again.
    pub(crate) fn reset(&mut self) {
        self.problematic_keys.clear();
        self.repeat_counter.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_escalation_starts_above_threshold() {
        let mut detector = StallDetector::new(10);
        let mut last = 0;
        for _ in 0..10 {
            last = detector.observe_repeat("A");
        }
        assert_eq!(last, 10);
        assert!(!detector.is_stalled(last));
        let eleventh = detector.observe_repeat("A");
        assert!(detector.is_stalled(eleventh));
        assert_eq!(detector.observe_repeat("B"), 1);
    }

    #[test]
    fn test_problematic_keys_take_first_and_clear() {
        let mut detector = StallDetector::new(10);
        assert!(detector.take_problematic().is_none());
        detector.mark_problematic("first".to_string());
        detector.mark_problematic("second".to_string());
        assert_eq!(detector.take_problematic().as_deref(), Some("first"));
        assert!(detector.take_problematic().is_none());
    }

    #[test]
    fn test_reset_clears_counts_and_keys() {
        let mut detector = StallDetector::new(1);
        detector.observe_repeat("A");
        detector.mark_problematic("A".to_string());
        detector.reset();
        assert_eq!(detector.observe_repeat("A"), 1);
        assert!(detector.take_problematic().is_none());
    }

    #[tokio::test]
    async fn test_recovery_stops_on_first_success() {
        let actions = Cell::new(0u32);
        let recovery = Recovery::new(5, Duration::ZERO);
        let recovered = recovery
            .attempt(
                |_| {
                    actions.set(actions.get() + 1);
                    async {}
                },
                || {
                    let done = actions.get() >= 3;
                    async move { done }
                },
            )
            .await;
        assert!(recovered);
        assert_eq!(actions.get(), 3);
    }

    #[tokio::test]
    async fn test_recovery_is_bounded() {
        let actions = Cell::new(0u32);
        let recovery = Recovery::new(4, Duration::ZERO);
        let recovered = recovery
            .attempt(
                |_| {
                    actions.set(actions.get() + 1);
                    async {}
                },
                || async { false },
            )
            .await;
        assert!(!recovered);
        assert_eq!(actions.get(), 4);
    }
}
