//! Server configuration.

use axum::http::{HeaderValue, Method};
use parley_core::settings::{BrokerSettings, CorsPolicy};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

/// Configuration for the parley HTTP host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Serve `/metrics` and the detailed `/health` body.
    pub diagnostics_enabled: bool,
    /// Cross-origin policy.
    pub cors_policy: CorsPolicy,
    /// Origins allowed under [`CorsPolicy::AllowList`].
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 1024 * 1024, // 1 MB
            diagnostics_enabled: false,
            cors_policy: CorsPolicy::Permissive,
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Host-facing subset of the broker settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            diagnostics_enabled: settings.diagnostics_enabled,
            cors_policy: settings.cors_policy,
            cors_allowed_origins: settings.cors_allowed_origins.clone(),
            ..Self::default()
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// CORS layer for the configured policy; `None` means no CORS headers.
    pub fn cors_layer(&self) -> Option<CorsLayer> {
        match self.cors_policy {
            CorsPolicy::Permissive => Some(CorsLayer::permissive()),
            CorsPolicy::Disabled => None,
            CorsPolicy::AllowList => {
                let origins: Vec<HeaderValue> = self
                    .cors_allowed_origins
                    .iter()
                    .filter_map(|origin| match origin.parse::<HeaderValue>() {
                        Ok(value) => Some(value),
                        Err(_) => {
                            warn!(origin, "ignoring unparseable CORS origin");
                            None
                        }
                    })
                    .collect();
                Some(
                    CorsLayer::new()
                        .allow_origin(AllowOrigin::list(origins))
                        .allow_methods([Method::GET]),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert!(!cfg.diagnostics_enabled);
        assert_eq!(cfg.cors_policy, CorsPolicy::Permissive);
    }

    #[test]
    fn from_settings_copies_host_fields() {
        let settings = BrokerSettings {
            host: "0.0.0.0".into(),
            port: 5050,
            diagnostics_enabled: true,
            cors_policy: CorsPolicy::AllowList,
            cors_allowed_origins: vec!["http://localhost:3000".into()],
            ..BrokerSettings::default()
        };
        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:5050");
        assert!(cfg.diagnostics_enabled);
        assert_eq!(cfg.cors_allowed_origins, vec!["http://localhost:3000".to_owned()]);
        assert_eq!(cfg.max_message_size, ServerConfig::default().max_message_size);
    }

    #[test]
    fn cors_layer_per_policy() {
        let mut cfg = ServerConfig::default();
        assert!(cfg.cors_layer().is_some());
        cfg.cors_policy = CorsPolicy::Disabled;
        assert!(cfg.cors_layer().is_none());
        cfg.cors_policy = CorsPolicy::AllowList;
        cfg.cors_allowed_origins = vec!["http://ok.example".into(), "bad\norigin".into()];
        assert!(cfg.cors_layer().is_some());
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig {
            port: 8080,
            cors_policy: CorsPolicy::Disabled,
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
