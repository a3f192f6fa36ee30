//! Health aggregation.
//!
//! Keeps a capped rolling log of recorded errors and derives a status from
//! the trailing window (default 5 minutes):
//!
//! - `unhealthy` if more than 3 system or critical errors
//! - otherwise `degraded` if more than 10 errors of any kind
//! - otherwise `healthy`
//!
//! A periodic sampler turns crossed resource thresholds into synthetic
//! system errors. It never fails in-flight work; it only moves the status.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use parley_core::errors::{ErrorKind, ParleyError};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected, self-healing.
    Low,
    /// Worth attention.
    Medium,
    /// Affects a component.
    High,
    /// Affects the process.
    Critical,
}

impl Severity {
    /// Default severity for an error kind.
    #[must_use]
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::System => Self::High,
            ErrorKind::Connection | ErrorKind::Capacity => Self::Medium,
            ErrorKind::Protocol | ErrorKind::Routing | ErrorKind::Timeout => Self::Low,
        }
    }
}

/// Aggregate status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Nothing notable in the window.
    Healthy,
    /// Elevated error rate.
    Degraded,
    /// Repeated system-level failures.
    Unhealthy,
}

/// One recorded error.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Severity.
    pub severity: Severity,
    /// Machine-readable code.
    pub code: String,
    /// Message.
    pub message: String,
    /// Wall-clock time.
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    at: Instant,
}

impl ErrorRecord {
    /// Record for `err` stamped now.
    pub fn new(err: &ParleyError, severity: Severity) -> Self {
        Self {
            kind: err.kind(),
            severity,
            code: err.code().to_owned(),
            message: err.to_string(),
            timestamp: Utc::now(),
            at: Instant::now(),
        }
    }

    fn counts_toward_unhealthy(&self) -> bool {
        self.kind == ErrorKind::System || self.severity == Severity::Critical
    }
}

/// Monitor configuration.
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Capacity of the rolling error log.
    pub max_errors: usize,
    /// Trailing window used for status.
    pub window: Duration,
    /// System/critical errors tolerated in the window.
    pub unhealthy_threshold: usize,
    /// Errors of any kind tolerated in the window.
    pub degraded_threshold: usize,
    /// Resource sampling period.
    pub sample_interval: Duration,
    /// Process memory above which a system error is recorded.
    pub memory_limit_bytes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_errors: 100,
            window: Duration::from_secs(5 * 60),
            unhealthy_threshold: 3,
            degraded_threshold: 10,
            sample_interval: Duration::from_secs(30),
            memory_limit_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Serializable summary for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    /// Derived status.
    pub status: HealthStatus,
    /// Errors in the trailing window.
    pub recent_errors: usize,
    /// System/critical errors in the trailing window.
    pub recent_system_errors: usize,
    /// Errors currently retained in the log.
    pub logged_errors: usize,
    /// Retained errors by severity.
    pub by_severity: BTreeMap<Severity, usize>,
    /// Most recent error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
}

/// Resource reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceSample {
    /// Resident memory of this process.
    pub memory_bytes: u64,
}

/// Source of resource readings.
pub trait ResourceSampler: Send + Sync {
    /// Take a reading.
    fn sample(&self) -> ResourceSample;
}

/// Samples the current process through `sysinfo`.
#[derive(Debug, Default)]
pub struct ProcessSampler;

impl ResourceSampler for ProcessSampler {
    fn sample(&self) -> ResourceSample {
        let mut system = sysinfo::System::new();
        let Ok(pid) = sysinfo::get_current_pid() else {
            return ResourceSample::default();
        };
        let _ = system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), false);
        ResourceSample {
            memory_bytes: system.process(pid).map_or(0, sysinfo::Process::memory),
        }
    }
}

/// Rolling error log with derived status.
pub struct HealthMonitor {
    config: HealthConfig,
    errors: Mutex<VecDeque<ErrorRecord>>,
}

impl HealthMonitor {
    /// Monitor with `config`.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            errors: Mutex::new(VecDeque::with_capacity(config.max_errors)),
            config,
        }
    }

    /// Record `err` at `severity`.
    pub fn record_error(&self, err: &ParleyError, severity: Severity) {
        self.record(ErrorRecord::new(err, severity));
    }

    /// Append a record, evicting the oldest past capacity.
    pub fn record(&self, record: ErrorRecord) {
        counter!("health_errors_recorded_total", "kind" => record.kind.to_string()).increment(1);
        let mut errors = self.errors.lock();
        if errors.len() >= self.config.max_errors {
            let _ = errors.pop_front();
        }
        errors.push_back(record);
    }

    /// Derived status over the trailing window.
    pub fn status(&self) -> HealthStatus {
        let (recent, system) = self.window_counts();
        self.classify(recent, system)
    }

    fn classify(&self, recent: usize, system: usize) -> HealthStatus {
        if system > self.config.unhealthy_threshold {
            HealthStatus::Unhealthy
        } else if recent > self.config.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Most recent errors, newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.errors.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Diagnostics summary.
    pub fn report(&self) -> HealthReport {
        let (recent, system) = self.window_counts();
        let errors = self.errors.lock();
        let mut by_severity = BTreeMap::new();
        for record in errors.iter() {
            *by_severity.entry(record.severity).or_insert(0) += 1;
        }
        HealthReport {
            status: self.classify(recent, system),
            recent_errors: recent,
            recent_system_errors: system,
            logged_errors: errors.len(),
            by_severity,
            last_error: errors.back().cloned(),
        }
    }

    /// Take one reading and record a system error if a threshold is crossed.
    pub fn sample_once(&self, sampler: &dyn ResourceSampler) -> ResourceSample {
        let sample = sampler.sample();
        #[allow(clippy::cast_precision_loss)]
        gauge!("process_memory_bytes").set(sample.memory_bytes as f64);
        if sample.memory_bytes > self.config.memory_limit_bytes {
            let err = ParleyError::system(format!(
                "memory usage {} bytes exceeds limit {} bytes",
                sample.memory_bytes, self.config.memory_limit_bytes
            ));
            warn!(memory_bytes = sample.memory_bytes, "resource threshold crossed");
            self.record_error(&err, Severity::High);
        }
        sample
    }

    /// Sample periodically until `cancel` fires.
    pub async fn run_sampler(self: Arc<Self>, sampler: Arc<dyn ResourceSampler>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sample_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sample = self.sample_once(sampler.as_ref());
                    debug!(memory_bytes = sample.memory_bytes, status = ?self.status(), "health sample");
                }
                () = cancel.cancelled() => return,
            }
        }
    }

    fn window_counts(&self) -> (usize, usize) {
        let now = Instant::now();
        let errors = self.errors.lock();
        let in_window = errors
            .iter()
            .filter(|e| now.duration_since(e.at) <= self.config.window);
        let mut recent = 0;
        let mut system = 0;
        for record in in_window {
            recent += 1;
            if record.counts_toward_unhealthy() {
                system += 1;
            }
        }
        (recent, system)
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
