//! Broker settings.
//!
//! Loading flow (see [`loader`]):
//! 1. Start with compiled [`BrokerSettings::default()`]
//! 2. Deep-merge an optional JSON settings file over the defaults
//! 3. Apply `PARLEY_*` environment overrides (highest priority)

pub mod loader;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use loader::{deep_merge, load_settings, load_settings_from_path};

/// Default WebSocket/HTTP port.
pub const DEFAULT_PORT: u16 = 4040;
/// Default session admission limit.
pub const DEFAULT_MAX_SESSIONS: usize = 50;
/// Default interaction timeout when a create call does not set one.
pub const DEFAULT_INTERACTION_TIMEOUT_MS: u64 = 300_000;
/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// Default per-target outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default routed-request response timeout.
pub const DEFAULT_ROUTE_TIMEOUT_MS: u64 = 30_000;
/// Default retention of terminal interactions before GC.
pub const DEFAULT_RETENTION_MS: u64 = 60_000;
/// Default limit on concurrently pending interactions.
pub const DEFAULT_MAX_ACTIVE_INTERACTIONS: usize = 100;

/// Cross-origin policy for the HTTP surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorsPolicy {
    /// Any origin.
    #[default]
    Permissive,
    /// Only `corsAllowedOrigins`.
    AllowList,
    /// No CORS headers.
    Disabled,
}

/// Settings consumed by the broker and its host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Bind host.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Session admission limit.
    pub max_sessions: usize,
    /// Limit on concurrently pending interactions.
    pub max_active_interactions: usize,
    /// Interaction timeout applied when a create call omits one.
    pub interaction_timeout_default_ms: u64,
    /// Heartbeat interval.
    pub heartbeat_interval_ms: u64,
    /// Tracing filter directive.
    pub log_level: String,
    /// Expose `/metrics` and detailed `/health`.
    pub diagnostics_enabled: bool,
    /// Cross-origin policy.
    pub cors_policy: CorsPolicy,
    /// Origins allowed under [`CorsPolicy::AllowList`].
    pub cors_allowed_origins: Vec<String>,
    /// Per-target outbound queue capacity.
    pub queue_capacity: usize,
    /// Default routed-request response timeout.
    pub route_timeout_ms: u64,
    /// Retention of terminal interactions before GC.
    pub retention_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_active_interactions: DEFAULT_MAX_ACTIVE_INTERACTIONS,
            interaction_timeout_default_ms: DEFAULT_INTERACTION_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            log_level: "info".into(),
            diagnostics_enabled: false,
            cors_policy: CorsPolicy::Permissive,
            cors_allowed_origins: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            route_timeout_ms: DEFAULT_ROUTE_TIMEOUT_MS,
            retention_ms: DEFAULT_RETENTION_MS,
        }
    }
}

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse settings JSON.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value was out of range after merging.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

impl BrokerSettings {
    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_sessions == 0 {
            return Err(SettingsError::InvalidValue("maxSessions must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeatIntervalMs must be > 0".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue("queueCapacity must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = BrokerSettings::default();
        assert_eq!(s.port, 4040);
        assert_eq!(s.max_sessions, 50);
        assert_eq!(s.heartbeat_interval_ms, 30_000);
        assert_eq!(s.queue_capacity, 100);
        assert_eq!(s.route_timeout_ms, 30_000);
        assert_eq!(s.retention_ms, 60_000);
        assert_eq!(s.cors_policy, CorsPolicy::Permissive);
        assert!(!s.diagnostics_enabled);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: BrokerSettings = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(s.port, 9000);
        assert_eq!(s.max_sessions, DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn camel_case_keys() {
        let value = serde_json::to_value(BrokerSettings::default()).unwrap();
        assert!(value.get("maxSessions").is_some());
        assert!(value.get("interactionTimeoutDefaultMs").is_some());
        assert_eq!(value["corsPolicy"], "permissive");
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let s = BrokerSettings {
            max_sessions: 0,
            ..BrokerSettings::default()
        };
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }
}
