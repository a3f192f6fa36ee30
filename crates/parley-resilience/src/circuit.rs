//! Per-operation circuit breaker.
//!
//! Failures are counted per key over a rolling window (default 60s). Once
//! the count in the window exceeds the threshold, calls for that key fail
//! fast with [`ParleyError::CircuitOpen`] without running the operation.
//! Any success resets the key, and a key whose failures have all aged out of
//! the window is forgotten.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::errors::ParleyError;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Default rolling failure window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default failures tolerated inside the window.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;

/// Point-in-time view of one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Operation key.
    pub key: String,
    /// Failures inside the window.
    pub failures: usize,
    /// Whether calls currently fail fast.
    pub open: bool,
}

/// Rolling-window circuit breaker keyed by operation.
pub struct CircuitBreaker {
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
    threshold: usize,
    window: Duration,
}

impl CircuitBreaker {
    /// Breaker with a custom threshold and window.
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            threshold,
            window,
        }
    }

    /// Fail fast if `key` is open.
    pub fn check(&self, key: &str) -> Result<(), ParleyError> {
        let mut failures = self.failures.lock();
        let Some(entries) = failures.get_mut(key) else {
            return Ok(());
        };
        prune(entries, self.window);
        if entries.is_empty() {
            let _ = failures.remove(key);
            return Ok(());
        }
        if entries.len() > self.threshold {
            return Err(ParleyError::CircuitOpen { key: key.to_owned() });
        }
        Ok(())
    }

    /// Record a failure for `key`.
    pub fn record_failure(&self, key: &str) {
        let mut failures = self.failures.lock();
        let entries = failures.entry(key.to_owned()).or_default();
        prune(entries, self.window);
        entries.push_back(Instant::now());
        if entries.len() == self.threshold + 1 {
            warn!(key, failures = entries.len(), "circuit opened");
        }
    }

    /// Record a success for `key`, closing it.
    pub fn record_success(&self, key: &str) {
        if let Some(entries) = self.failures.lock().remove(key) {
            if entries.len() > self.threshold {
                info!(key, "circuit closed after success");
            }
        }
    }

    /// Run `op` under the breaker for `key`.
    pub async fn call<T, Fut>(&self, key: &str, op: impl FnOnce() -> Fut) -> Result<T, ParleyError>
    where
        Fut: Future<Output = Result<T, ParleyError>>,
    {
        self.check(key)?;
        match op().await {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(key);
                Err(err)
            }
        }
    }

    /// Whether `key` currently fails fast.
    pub fn is_open(&self, key: &str) -> bool {
        self.check(key).is_err()
    }

    /// Forget keys with no failures left inside the window. Returns how
    /// many were dropped.
    pub fn sweep(&self) -> usize {
        let mut failures = self.failures.lock();
        let before = failures.len();
        failures.retain(|_, entries| {
            prune(entries, self.window);
            !entries.is_empty()
        });
        before - failures.len()
    }

    /// Number of keys with failures inside the window.
    pub fn tracked_keys(&self) -> usize {
        let _ = self.sweep();
        self.failures.lock().len()
    }

    /// Snapshot of every tracked key, sorted by key.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let _ = self.sweep();
        let failures = self.failures.lock();
        let mut out: Vec<CircuitSnapshot> = failures
            .iter()
            .map(|(key, entries)| CircuitSnapshot {
                key: key.clone(),
                failures: entries.len(),
                open: entries.len() > self.threshold,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_WINDOW)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("threshold", &self.threshold)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

fn prune(entries: &mut VecDeque<Instant>, window: Duration) {
    let now = Instant::now();
    while entries
        .front()
        .is_some_and(|t| now.duration_since(*t) > window)
    {
        let _ = entries.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn opens_only_after_threshold_exceeded() {
        let breaker = CircuitBreaker::new(2, DEFAULT_WINDOW);
        breaker.record_failure("send");
        breaker.record_failure("send");
        assert!(!breaker.is_open("send"));
        breaker.record_failure("send");
        assert!(breaker.is_open("send"));
        assert!(!breaker.is_open("other"));
    }

    #[test]
    fn success_resets() {
        let breaker = CircuitBreaker::new(1, DEFAULT_WINDOW);
        breaker.record_failure("k");
        breaker.record_failure("k");
        assert!(breaker.is_open("k"));
        breaker.record_success("k");
        assert!(!breaker.is_open("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_age_out_of_window() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("k");
        breaker.record_failure("k");
        assert!(breaker.is_open("k"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!breaker.is_open("k"));
        assert!(breaker.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_forgets_expired_keys() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for n in 0..20 {
            breaker.record_failure(&format!("deliver:sess_{n}"));
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.record_failure("deliver:sess_live");
        assert_eq!(breaker.sweep(), 0);
        assert_eq!(breaker.tracked_keys(), 21);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.sweep(), 20);
        assert_eq!(breaker.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn open_circuit_skips_operation() {
        let breaker = CircuitBreaker::new(0, DEFAULT_WINDOW);
        let runs = AtomicU32::new(0);

        let first: Result<(), _> = breaker
            .call("op", || async {
                let _ = runs.fetch_add(1, Ordering::SeqCst);
                Err(ParleyError::connection("down"))
            })
            .await;
        assert_matches!(first, Err(ParleyError::Connection { .. }));

        let second: Result<(), _> = breaker
            .call("op", || async {
                let _ = runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_matches!(second, Err(ParleyError::CircuitOpen { ref key }) if key == "op");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_success_closes() {
        let breaker = CircuitBreaker::new(5, DEFAULT_WINDOW);
        breaker.record_failure("op");
        let value = breaker.call("op", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(breaker.snapshot().is_empty());
    }

    #[test]
    fn snapshot_sorted_by_key() {
        let breaker = CircuitBreaker::default();
        breaker.record_failure("b");
        breaker.record_failure("a");
        let keys: Vec<String> = breaker.snapshot().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
