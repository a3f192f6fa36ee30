//! # parley-resilience
//!
//! Failure handling shared by the broker and the bridge client.
//!
//! - [`backoff`]: exponential backoff with bounded jitter and a 30s cap
//! - [`engine`]: ordered recovery strategies, per-operation retry counters, `with_retry`
//! - [`circuit`]: per-key circuit breaker over a rolling 60s failure window
//! - [`health`]: capped error log, resource sampling and derived health status

#![deny(unsafe_code)]

pub mod backoff;
pub mod circuit;
pub mod engine;
pub mod health;

pub use circuit::{CircuitBreaker, CircuitSnapshot};
pub use engine::{
    ErrorContext, KindStrategy, RecoveryOutcome, RecoveryStrategy, ResilienceEngine, RetryOptions,
};
pub use health::{
    ErrorRecord, HealthConfig, HealthMonitor, HealthReport, HealthStatus, ProcessSampler,
    ResourceSample, ResourceSampler, Severity,
};
