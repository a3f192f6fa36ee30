//! Broker events.
//!
//! The closed set of notifications the broker publishes for observers.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, ParleyError};
use crate::ids::{CorrelationId, InteractionId, SessionId};
use crate::interaction::InteractionStatus;
use crate::wire::Role;

/// Observable broker event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A pending connection completed its identify handshake.
    Connected {
        /// New session.
        session_id: SessionId,
        /// Assigned role.
        role: Role,
    },
    /// A session was removed.
    Disconnected {
        /// Removed session.
        session_id: SessionId,
        /// Its role.
        role: Role,
        /// Why it was removed (`stale`, `send_failed`, `closed`, ...).
        reason: String,
    },
    /// An interaction entered `Pending`.
    InteractionCreated {
        /// Interaction.
        interaction_id: InteractionId,
        /// Asking session.
        requester_id: SessionId,
        /// Answering session.
        responder_id: SessionId,
    },
    /// An interaction reached a terminal status.
    InteractionResolved {
        /// Interaction.
        interaction_id: InteractionId,
        /// Terminal status.
        status: InteractionStatus,
    },
    /// The router delivered (or queued) a message.
    MessageRouted {
        /// Sending session.
        from_id: SessionId,
        /// Resolved targets.
        targets: Vec<SessionId>,
        /// Correlation token for request/response routes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<CorrelationId>,
    },
    /// A component recorded a failure.
    ErrorOccurred {
        /// Taxonomy kind.
        kind: ErrorKind,
        /// Machine-readable code.
        code: String,
        /// Message.
        message: String,
    },
}

impl BrokerEvent {
    /// Event for a recorded error.
    pub fn error(err: &ParleyError) -> Self {
        Self::ErrorOccurred {
            kind: err.kind(),
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// Short name for logging and metrics labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::InteractionCreated { .. } => "interaction_created",
            Self::InteractionResolved { .. } => "interaction_resolved",
            Self::MessageRouted { .. } => "message_routed",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = BrokerEvent::Disconnected {
            session_id: SessionId::from("b1"),
            role: Role::Responder,
            reason: "stale".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "disconnected");
        assert_eq!(value["session_id"], "b1");
        assert_eq!(value["reason"], "stale");
        assert_eq!(event.name(), "disconnected");
    }

    #[test]
    fn error_event_from_error() {
        let event = BrokerEvent::error(&ParleyError::capacity("sessions", 1));
        assert!(matches!(
            event,
            BrokerEvent::ErrorOccurred { kind: ErrorKind::Capacity, ref code, .. } if code == "CAPACITY_EXCEEDED"
        ));
    }
}
