//! Interaction types.
//!
//! An interaction is a unit of work handed to a responder that must reach
//! exactly one terminal outcome. Its status is terminal-once:
//! `Pending → {Resolved, TimedOut, Cancelled}` with no further transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InteractionId, SessionId};

/// Presentation kind of an interaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Informational notice.
    #[default]
    Info,
    /// Warning notice.
    Warning,
    /// Error notice.
    Error,
    /// Question with button choices.
    Question,
    /// Free-text input.
    Input,
}

/// A choice offered to the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Identifier returned when chosen.
    pub id: String,
    /// Display label.
    pub label: String,
}

/// What the responder should present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionSpec {
    /// Title line.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Presentation kind.
    #[serde(default)]
    pub kind: InteractionKind,
    /// Choices.
    #[serde(default)]
    pub buttons: Vec<Button>,
    /// Button preselected by the responder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_button: Option<String>,
    /// Auto-timeout for the interaction itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether the responder should block other UI.
    #[serde(default)]
    pub modal: bool,
    /// Placeholder for free-text input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_placeholder: Option<String>,
}

/// Interaction lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    /// Awaiting an outcome.
    Pending,
    /// Answered by the responder.
    Resolved,
    /// The interaction's own timeout fired.
    TimedOut,
    /// Administratively closed.
    Cancelled,
}

impl InteractionStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal outcome delivered to waiters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionResult {
    /// Chosen button.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_id: Option<String>,
    /// Free-text answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<String>,
    /// User dismissed without choosing.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dismissed: bool,
    /// The interaction timed out.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    /// The interaction was closed administratively.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl InteractionResult {
    /// A button was chosen.
    pub fn button(id: impl Into<String>) -> Self {
        Self {
            button_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Free text was entered.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            custom_text: Some(text.into()),
            ..Self::default()
        }
    }

    /// The user dismissed the interaction.
    #[must_use]
    pub fn dismissed() -> Self {
        Self {
            dismissed: true,
            ..Self::default()
        }
    }

    /// Canonical `{timedOut: true}`.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    /// Canonical `{cancelled: true}`.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }
}

/// Interaction record owned by the interaction manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// Interaction id.
    pub id: InteractionId,
    /// Session that asked. Need not still be connected.
    pub requester_id: SessionId,
    /// Session asked to answer. Need not still be connected.
    pub responder_id: SessionId,
    /// Presentation spec.
    pub spec: InteractionSpec,
    /// Current status.
    pub status: InteractionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the status left `Pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Terminal outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<InteractionResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!InteractionStatus::Pending.is_terminal());
        assert!(InteractionStatus::Resolved.is_terminal());
        assert!(InteractionStatus::TimedOut.is_terminal());
        assert!(InteractionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn canonical_results_serialize_compactly() {
        assert_eq!(
            serde_json::to_value(InteractionResult::timed_out()).unwrap(),
            json!({"timedOut": true})
        );
        assert_eq!(
            serde_json::to_value(InteractionResult::cancelled()).unwrap(),
            json!({"cancelled": true})
        );
        assert_eq!(
            serde_json::to_value(InteractionResult::button("ok")).unwrap(),
            json!({"buttonId": "ok"})
        );
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: InteractionSpec = serde_json::from_value(json!({
            "title": "Deploy?",
            "message": "Ship it to prod",
            "kind": "question",
            "buttons": [{"id": "yes", "label": "Yes"}, {"id": "no", "label": "No"}],
            "timeoutMs": 500
        }))
        .unwrap();
        assert_eq!(spec.kind, InteractionKind::Question);
        assert_eq!(spec.buttons.len(), 2);
        assert_eq!(spec.timeout_ms, Some(500));
        assert!(!spec.modal);
        assert!(spec.default_button.is_none());
    }

    #[test]
    fn status_display() {
        assert_eq!(InteractionStatus::TimedOut.to_string(), "timed_out");
    }
}
