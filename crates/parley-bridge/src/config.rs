//! Bridge client configuration.

use std::time::Duration;

use parley_core::wire::Role;
use thiserror::Error;

/// Default connection-establish timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default liveness probe interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Default reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Invalid bridge configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BridgeConfigError {
    /// The URL is not a `ws://` or `wss://` URL.
    #[error("invalid broker url '{0}': expected ws:// or wss://")]
    InvalidUrl(String),
    /// A duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Settings for a [`crate::BridgeClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    /// Broker WebSocket URL.
    pub url: String,
    /// Role announced in the identify handshake.
    pub role: Role,
    /// Capabilities announced in the identify handshake.
    pub capabilities: Vec<String>,
    /// Version announced in the identify handshake.
    pub client_version: String,
    /// How long to wait for the transport to open.
    pub connect_timeout: Duration,
    /// Liveness probe period while connected.
    pub ping_interval: Duration,
    /// Reconnect attempts after an unclean close before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Optional ceiling on the reconnect delay. Unset means pure
    /// exponential growth.
    pub max_reconnect_delay: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4040/ws".into(),
            role: Role::Responder,
            capabilities: vec!["interactions".into()],
            client_version: env!("CARGO_PKG_VERSION").into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_reconnect_delay: None,
        }
    }
}

impl BridgeConfig {
    /// Config for `url` with defaults elsewhere.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<(), BridgeConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(BridgeConfigError::InvalidUrl(self.url.clone()));
        }
        if self.connect_timeout.is_zero() {
            return Err(BridgeConfigError::ZeroDuration("connect_timeout"));
        }
        if self.ping_interval.is_zero() {
            return Err(BridgeConfigError::ZeroDuration("ping_interval"));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, clamped to `max_reconnect_delay` if set.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self.reconnect_base_delay.saturating_mul(factor);
        match self.max_reconnect_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}
