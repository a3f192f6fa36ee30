//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::{BrokerSettings, CorsPolicy, SettingsError};

/// Resolve the default settings path (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BrokerSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BrokerSettings, SettingsError> {
    let mut settings = load_file(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<BrokerSettings, SettingsError> {
    let defaults = serde_json::to_value(BrokerSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are ignored with a
/// warning, leaving the file/default value in place.
pub fn apply_overrides(settings: &mut BrokerSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PARLEY_HOST") {
        settings.host = v;
    }
    if let Some(v) = read("PARLEY_PORT").and_then(|v| checked("PARLEY_PORT", &v, parse_u16_range(&v, 0, 65535))) {
        settings.port = v;
    }
    if let Some(v) = read("PARLEY_MAX_SESSIONS")
        .and_then(|v| checked("PARLEY_MAX_SESSIONS", &v, parse_usize_range(&v, 1, 10_000)))
    {
        settings.max_sessions = v;
    }
    if let Some(v) = read("PARLEY_INTERACTION_TIMEOUT_MS").and_then(|v| {
        checked(
            "PARLEY_INTERACTION_TIMEOUT_MS",
            &v,
            parse_u64_range(&v, 100, 86_400_000),
        )
    }) {
        settings.interaction_timeout_default_ms = v;
    }
    if let Some(v) = read("PARLEY_HEARTBEAT_INTERVAL_MS").and_then(|v| {
        checked(
            "PARLEY_HEARTBEAT_INTERVAL_MS",
            &v,
            parse_u64_range(&v, 100, 600_000),
        )
    }) {
        settings.heartbeat_interval_ms = v;
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = read("PARLEY_DIAGNOSTICS").and_then(|v| checked("PARLEY_DIAGNOSTICS", &v, parse_bool(&v))) {
        settings.diagnostics_enabled = v;
    }
    if let Some(v) = read("PARLEY_CORS_POLICY") {
        match serde_json::from_value::<CorsPolicy>(Value::String(v.clone())) {
            Ok(policy) => settings.cors_policy = policy,
            Err(_) => warn!(key = "PARLEY_CORS_POLICY", value = %v, "invalid env var, ignoring"),
        }
    }
}

fn checked<T>(name: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"a": {"b": 1, "c": 2}});
        let source = serde_json::json!({"a": {"b": 9}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"]["b"], 9);
        assert_eq!(merged["a"]["c"], 2);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(
            serde_json::json!({"a": 1}),
            serde_json::json!({"a": null}),
        );
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(
            serde_json::json!({"o": ["a", "b"]}),
            serde_json::json!({"o": ["c"]}),
        );
        assert_eq!(merged["o"], serde_json::json!(["c"]));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, BrokerSettings::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"port": 5050, "maxSessions": 3, "logLevel": null}}"#).unwrap();

        let settings = load_file(&path).unwrap();
        assert_eq!(settings.port, 5050);
        assert_eq!(settings.max_sessions, 3);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = BrokerSettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("PARLEY_PORT", "7001"),
                ("PARLEY_MAX_SESSIONS", "8"),
                ("PARLEY_HEARTBEAT_INTERVAL_MS", "1000"),
                ("PARLEY_DIAGNOSTICS", "yes"),
                ("PARLEY_CORS_POLICY", "disabled"),
                ("PARLEY_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(s.port, 7001);
        assert_eq!(s.max_sessions, 8);
        assert_eq!(s.heartbeat_interval_ms, 1000);
        assert!(s.diagnostics_enabled);
        assert_eq!(s.cors_policy, CorsPolicy::Disabled);
        assert_eq!(s.log_level, "debug");
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut s = BrokerSettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("PARLEY_PORT", "99999"),
                ("PARLEY_MAX_SESSIONS", "0"),
                ("PARLEY_DIAGNOSTICS", "maybe"),
                ("PARLEY_CORS_POLICY", "whatever"),
                ("PARLEY_HOST", ""),
            ]),
        );
        assert_eq!(s, BrokerSettings::default());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("50", 100, 200), None);
        assert_eq!(parse_usize_range("150", 100, 200), Some(150));
        assert_eq!(parse_u16_range("-1", 0, 10), None);
    }
}
