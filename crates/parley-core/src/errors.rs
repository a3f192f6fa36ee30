//! Error taxonomy for the broker.
//!
//! Every caller-visible failure is a [`ParleyError`], and every
//! `ParleyError` classifies into exactly one [`ErrorKind`]:
//!
//! - **Connection**: open failure/timeout/unexpected close; drives reconnection and session removal
//! - **Protocol**: malformed envelope, unknown type, illegal state transition; logged, non-fatal
//! - **Routing**: no resolvable target or unknown source/interaction; returned, never retried
//! - **Timeout**: a wait expired; terminal and distinguishable from other failures
//! - **Capacity**: admission limits exceeded (sessions, interactions, open circuits)
//! - **System**: resource thresholds crossed; recorded by the health monitor

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad classification of a [`ParleyError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport open/close failures.
    Connection,
    /// Malformed or out-of-order messages.
    Protocol,
    /// Target resolution failures.
    Routing,
    /// Expired waits.
    Timeout,
    /// Admission limits.
    Capacity,
    /// Resource thresholds.
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Routing => "routing",
            Self::Timeout => "timeout",
            Self::Capacity => "capacity",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Top-level error type.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParleyError {
    /// Transport could not be opened or closed unexpectedly.
    #[error("connection error: {message}")]
    Connection {
        /// What went wrong.
        message: String,
    },

    /// The peer a pending operation depended on went away.
    #[error("session {session_id} disconnected")]
    Disconnected {
        /// Session that disconnected.
        session_id: String,
    },

    /// Malformed envelope or unexpected message.
    #[error("protocol error: {message}")]
    Protocol {
        /// What was wrong with the message.
        message: String,
    },

    /// No target could be resolved.
    #[error("routing error: {message}")]
    Routing {
        /// Why resolution failed.
        message: String,
    },

    /// An explicit session id is not registered.
    #[error("session {session_id} not found")]
    SessionNotFound {
        /// Requested session.
        session_id: String,
    },

    /// A pending connection id is not registered.
    #[error("pending connection {pending_id} not found")]
    PendingNotFound {
        /// Requested pending connection.
        pending_id: String,
    },

    /// An interaction id is not (or no longer) tracked.
    #[error("interaction {interaction_id} not found")]
    InteractionNotFound {
        /// Requested interaction.
        interaction_id: String,
    },

    /// Interaction already left `Pending`.
    #[error("interaction {interaction_id} is already {status}")]
    InteractionNotPending {
        /// Requested interaction.
        interaction_id: String,
        /// Its terminal status.
        status: String,
    },

    /// A wait expired.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// How long the caller waited.
        after_ms: u64,
    },

    /// Admission limit exceeded.
    #[error("{resource} limit of {limit} reached")]
    Capacity {
        /// Limited resource (e.g. `sessions`).
        resource: String,
        /// Configured maximum.
        limit: usize,
    },

    /// Circuit breaker is open for an operation key.
    #[error("circuit open for {key}")]
    CircuitOpen {
        /// Operation key.
        key: String,
    },

    /// Resource threshold crossed.
    #[error("system error: {message}")]
    System {
        /// Threshold description.
        message: String,
    },
}

impl ParleyError {
    /// Connection error from any displayable cause.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Protocol error from any displayable cause.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Routing error.
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Timeout for `operation` after `after_ms`.
    pub fn timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms,
        }
    }

    /// Capacity error.
    pub fn capacity(resource: impl Into<String>, limit: usize) -> Self {
        Self::Capacity {
            resource: resource.into(),
            limit,
        }
    }

    /// System error.
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Taxonomy classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Disconnected { .. } => ErrorKind::Connection,
            Self::Protocol { .. } | Self::InteractionNotPending { .. } => ErrorKind::Protocol,
            Self::Routing { .. }
            | Self::SessionNotFound { .. }
            | Self::PendingNotFound { .. }
            | Self::InteractionNotFound { .. } => ErrorKind::Routing,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Capacity { .. } | Self::CircuitOpen { .. } => ErrorKind::Capacity,
            Self::System { .. } => ErrorKind::System,
        }
    }

    /// Machine-readable code used on the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Disconnected { .. } => "SESSION_DISCONNECTED",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Routing { .. } => "ROUTING_ERROR",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::PendingNotFound { .. } => "PENDING_NOT_FOUND",
            Self::InteractionNotFound { .. } => "INTERACTION_NOT_FOUND",
            Self::InteractionNotPending { .. } => "INVALID_STATE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Capacity { .. } => "CAPACITY_EXCEEDED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::System { .. } => "SYSTEM_ERROR",
        }
    }

    /// Whether this is a [`ErrorKind::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, ParleyError>;
