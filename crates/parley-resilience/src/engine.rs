//! Recovery strategies and the retry loop.
//!
//! Strategies are consulted in registration order; the first whose
//! [`RecoveryStrategy::matches`] returns `true` owns the error. Errors no
//! strategy matches are unrecoverable.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use parley_core::errors::{ErrorKind, ParleyError};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::backoff_delay;
use crate::health::{HealthMonitor, Severity};

/// Where an error happened.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Component reporting the error (e.g. `router`, `bridge`).
    pub component: String,
    /// Free-form details.
    pub details: Value,
}

impl ErrorContext {
    /// Context for a component with no details.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            details: Value::Null,
        }
    }
}

/// A way of recovering from a class of errors.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Whether this strategy handles `error`.
    fn matches(&self, error: &ParleyError) -> bool;

    /// Attempt recovery. `true` means the condition is resolved and the
    /// operation may be retried immediately.
    async fn recover(&self, error: &ParleyError, context: &ErrorContext) -> bool;

    /// Retries allowed per operation before giving up.
    fn max_retries(&self) -> u32;

    /// Base backoff in milliseconds.
    fn backoff_ms(&self) -> u64;
}

/// Strategy that matches by [`ErrorKind`] and always asks for a backoff.
#[derive(Clone, Debug)]
pub struct KindStrategy {
    name: String,
    kinds: Vec<ErrorKind>,
    max_retries: u32,
    backoff_ms: u64,
}

impl KindStrategy {
    /// Match any of `kinds`.
    pub fn new(name: impl Into<String>, kinds: &[ErrorKind], max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            name: name.into(),
            kinds: kinds.to_vec(),
            max_retries,
            backoff_ms,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for KindStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, error: &ParleyError) -> bool {
        self.kinds.contains(&error.kind())
    }

    async fn recover(&self, _error: &ParleyError, _context: &ErrorContext) -> bool {
        false
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn backoff_ms(&self) -> u64 {
        self.backoff_ms
    }
}

/// Result of [`ResilienceEngine::handle_error`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// The strategy resolved the condition; retry now.
    pub recovered: bool,
    /// Retry after `delay`.
    pub should_retry: bool,
    /// Backoff before the next attempt.
    pub delay: Option<Duration>,
}

impl RecoveryOutcome {
    fn give_up() -> Self {
        Self {
            recovered: false,
            should_retry: false,
            delay: None,
        }
    }
}

/// Options for [`ResilienceEngine::with_retry`].
#[derive(Clone, Debug)]
pub struct RetryOptions {
    /// Upper bound on retries regardless of strategy.
    pub max_retries: u32,
    /// Context passed to strategies.
    pub context: ErrorContext,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            context: ErrorContext::default(),
        }
    }
}

/// Strategy registry with per-operation retry counters.
pub struct ResilienceEngine {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    retry_counts: Mutex<HashMap<String, u32>>,
    health: Option<Arc<HealthMonitor>>,
}

impl ResilienceEngine {
    /// Engine with no strategies.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            retry_counts: Mutex::new(HashMap::new()),
            health: None,
        }
    }

    /// Engine with the broker's standard strategies: connection failures
    /// (5 retries, 1s base) and timeouts (3 retries, 500ms base).
    pub fn with_default_strategies() -> Self {
        let mut engine = Self::new();
        engine.register(KindStrategy::new("connection", &[ErrorKind::Connection], 5, 1000));
        engine.register(KindStrategy::new("timeout", &[ErrorKind::Timeout], 3, 500));
        engine
    }

    /// Record every handled error into `monitor`.
    #[must_use]
    pub fn with_health(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    /// Append a strategy; earlier registrations win.
    pub fn register(&mut self, strategy: impl RecoveryStrategy + 'static) {
        self.strategies.push(Arc::new(strategy));
    }

    /// Current retry count for an operation.
    pub fn retry_count(&self, op_id: &str) -> u32 {
        self.retry_counts.lock().get(op_id).copied().unwrap_or(0)
    }

    /// Forget the retry count for an operation.
    pub fn reset(&self, op_id: &str) {
        let _ = self.retry_counts.lock().remove(op_id);
    }

    /// Decide what to do about `error` raised by operation `op_id`.
    pub async fn handle_error(
        &self,
        error: &ParleyError,
        context: &ErrorContext,
        op_id: &str,
    ) -> RecoveryOutcome {
        if let Some(health) = &self.health {
            health.record_error(error, Severity::for_kind(error.kind()));
        }

        let Some(strategy) = self.strategies.iter().find(|s| s.matches(error)).cloned() else {
            warn!(op_id, code = error.code(), error = %error, "unrecoverable error");
            self.reset(op_id);
            return RecoveryOutcome::give_up();
        };

        let attempt = {
            let mut counts = self.retry_counts.lock();
            let count = counts.entry(op_id.to_owned()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt > strategy.max_retries() {
            warn!(
                op_id,
                strategy = strategy.name(),
                max_retries = strategy.max_retries(),
                "retries exhausted"
            );
            self.reset(op_id);
            return RecoveryOutcome::give_up();
        }

        if strategy.recover(error, context).await {
            debug!(op_id, strategy = strategy.name(), "recovered");
            self.reset(op_id);
            return RecoveryOutcome {
                recovered: true,
                should_retry: false,
                delay: None,
            };
        }

        let delay = backoff_delay(attempt - 1, strategy.backoff_ms());
        debug!(
            op_id,
            strategy = strategy.name(),
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling retry"
        );
        RecoveryOutcome {
            recovered: false,
            should_retry: true,
            delay: Some(delay),
        }
    }

    /// Run `op` until it succeeds, the strategies give up, or
    /// `opts.max_retries` retries have been spent. Returns the last error.
    pub async fn with_retry<T, F, Fut>(
        &self,
        op_id: &str,
        opts: RetryOptions,
        mut op: F,
    ) -> Result<T, ParleyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ParleyError>>,
    {
        let mut retries = 0;
        loop {
            let err = match op().await {
                Ok(value) => {
                    self.reset(op_id);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let outcome = self.handle_error(&err, &opts.context, op_id).await;
            if retries >= opts.max_retries {
                self.reset(op_id);
                return Err(err);
            }
            retries += 1;

            if outcome.recovered {
                counter!("resilience_retries_total", "mode" => "immediate").increment(1);
            } else if let (true, Some(delay)) = (outcome.should_retry, outcome.delay) {
                counter!("resilience_retries_total", "mode" => "backoff").increment(1);
                tokio::time::sleep(delay).await;
            } else {
                return Err(err);
            }
        }
    }
}

impl Default for ResilienceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResilienceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name().to_owned()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct HealingStrategy {
        heals: AtomicU32,
    }

    #[async_trait]
    impl RecoveryStrategy for HealingStrategy {
        fn name(&self) -> &str {
            "healing"
        }
        fn matches(&self, error: &ParleyError) -> bool {
            error.kind() == ErrorKind::Connection
        }
        async fn recover(&self, _error: &ParleyError, _context: &ErrorContext) -> bool {
            let _ = self.heals.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn max_retries(&self) -> u32 {
            2
        }
        fn backoff_ms(&self) -> u64 {
            100
        }
    }

    fn ctx() -> ErrorContext {
        ErrorContext::new("test")
    }

    #[tokio::test]
    async fn unmatched_error_is_unrecoverable() {
        let engine = ResilienceEngine::with_default_strategies();
        let outcome = engine
            .handle_error(&ParleyError::routing("no target"), &ctx(), "op")
            .await;
        assert_eq!(outcome, RecoveryOutcome::give_up());
    }

    #[tokio::test]
    async fn first_matching_strategy_wins() {
        let mut engine = ResilienceEngine::new();
        engine.register(KindStrategy::new("first", &[ErrorKind::Timeout], 1, 10));
        engine.register(KindStrategy::new("second", &[ErrorKind::Timeout], 9, 10));
        let err = ParleyError::timeout("x", 1);

        assert!(engine.handle_error(&err, &ctx(), "op").await.should_retry);
        // The first strategy's limit of 1 applies, not the second's 9.
        assert!(!engine.handle_error(&err, &ctx(), "op").await.should_retry);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries_and_clears_counter() {
        let mut engine = ResilienceEngine::new();
        engine.register(KindStrategy::new("conn", &[ErrorKind::Connection], 2, 100));
        let err = ParleyError::connection("refused");

        for expected in 1..=2 {
            let outcome = engine.handle_error(&err, &ctx(), "op").await;
            assert!(outcome.should_retry);
            assert_eq!(engine.retry_count("op"), expected);
        }
        let outcome = engine.handle_error(&err, &ctx(), "op").await;
        assert!(!outcome.should_retry);
        assert!(!outcome.recovered);
        assert_eq!(engine.retry_count("op"), 0);
    }

    #[tokio::test]
    async fn backoff_grows_per_attempt_with_bounded_jitter() {
        let mut engine = ResilienceEngine::new();
        engine.register(KindStrategy::new("conn", &[ErrorKind::Connection], 5, 100));
        let err = ParleyError::connection("refused");

        let first = engine.handle_error(&err, &ctx(), "op").await.delay.unwrap();
        let second = engine.handle_error(&err, &ctx(), "op").await.delay.unwrap();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
    }

    #[tokio::test]
    async fn successful_recovery_clears_counter() {
        let mut engine = ResilienceEngine::new();
        engine.register(HealingStrategy {
            heals: AtomicU32::new(0),
        });
        let outcome = engine
            .handle_error(&ParleyError::connection("x"), &ctx(), "op")
            .await;
        assert!(outcome.recovered);
        assert!(!outcome.should_retry);
        assert_eq!(engine.retry_count("op"), 0);
    }

    #[tokio::test]
    async fn counters_are_per_operation() {
        let mut engine = ResilienceEngine::new();
        engine.register(KindStrategy::new("conn", &[ErrorKind::Connection], 1, 10));
        let err = ParleyError::connection("x");
        let _ = engine.handle_error(&err, &ctx(), "a").await;
        assert!(engine.handle_error(&err, &ctx(), "b").await.should_retry);
        assert_eq!(engine.retry_count("a"), 1);
        assert_eq!(engine.retry_count("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_eventually_succeeds() {
        let engine = ResilienceEngine::with_default_strategies();
        let calls = AtomicU32::new(0);
        let result = engine
            .with_retry("flaky", RetryOptions::default(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ParleyError::connection("refused"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.retry_count("flaky"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_rethrows_last_error_when_bounded() {
        let engine = ResilienceEngine::with_default_strategies();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = engine
            .with_retry(
                "down",
                RetryOptions {
                    max_retries: 2,
                    context: ctx(),
                },
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(ParleyError::connection(format!("attempt {n}"))) }
                },
            )
            .await;
        assert_matches!(result, Err(ParleyError::Connection { ref message }) if message == "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_unrecoverable() {
        let engine = ResilienceEngine::with_default_strategies();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = engine
            .with_retry("route", RetryOptions::default(), || {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ParleyError::routing("no target")) }
            })
            .await;
        assert_matches!(result, Err(ParleyError::Routing { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_recovers_immediately() {
        let mut engine = ResilienceEngine::new();
        engine.register(HealingStrategy {
            heals: AtomicU32::new(0),
        });
        let calls = AtomicU32::new(0);
        let result = engine
            .with_retry("heal", RetryOptions::default(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ParleyError::connection("blip"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn handled_errors_reach_health_monitor() {
        let health = Arc::new(HealthMonitor::new(crate::health::HealthConfig::default()));
        let engine = ResilienceEngine::with_default_strategies().with_health(health.clone());
        let _ = engine
            .handle_error(&ParleyError::routing("x"), &ctx(), "op")
            .await;
        assert_eq!(health.recent_errors(10).len(), 1);
    }
}
