//! Peer wire protocol.
//!
//! Every frame exchanged with a peer is an [`Envelope`]:
//! `{type, id, payload, timestamp}` with `timestamp` in epoch milliseconds.
//! Inbound frames are validated by [`parse_envelope`]; anything without a
//! string `type`, string `id` and numeric `timestamp`, or with an unknown
//! `type`, is a protocol error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorKind, ParleyError};
use crate::ids::MessageId;
use crate::interaction::InteractionSpec;

/// WebSocket close code for an intentional disconnect.
pub const CLEAN_CLOSE_CODE: u16 = 1000;

/// Protocol version advertised in the identify handshake.
pub const PROTOCOL_VERSION: &str = "1";

/// Peer role, assigned by the identify handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Tool-calling peer that initiates interactions.
    Requester,
    /// UI-hosting peer that fulfills interactions.
    Responder,
}

impl Role {
    /// The role a message from this role is routed to by default.
    #[must_use]
    pub fn counterpart(self) -> Self {
        match self {
            Self::Requester => Self::Responder,
            Self::Responder => Self::Requester,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognized envelope `type` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Role handshake; first frame from a peer.
    Identify,
    /// Server acknowledgment of a completed identify.
    Welcome,
    /// Interaction handed to a responder.
    InteractionRequest,
    /// Answer to a routed request or an interaction.
    Response,
    /// Peer-originated routed message.
    Route,
    /// Routed payload delivered to a target.
    Message,
    /// Status notification.
    Status,
    /// Error notification.
    Error,
    /// Tool-surface listing request from a requester.
    ToolList,
    /// Tool-surface invocation from a requester.
    ToolCall,
    /// Tool-surface reply.
    ToolResult,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
}

impl MessageType {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::Welcome => "welcome",
            Self::InteractionRequest => "interaction_request",
            Self::Response => "response",
            Self::Route => "route",
            Self::Message => "message",
            Self::Status => "status",
            Self::Error => "error",
            Self::ToolList => "tool_list",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_owned()))
            .map_err(|_| ParleyError::protocol(format!("unknown message type '{s}'")))
    }
}

/// Delivery priority for queued messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Drained first.
    High,
    /// Default tier.
    #[default]
    Normal,
    /// Drained last.
    Low,
}

/// One wire frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Unique message id.
    pub id: String,
    /// Type-specific payload object.
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    /// New envelope with a fresh id and the current timestamp.
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            id: MessageId::new().into_inner(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Envelope serializing a typed payload.
    pub fn with_payload<T: Serialize>(message_type: MessageType, payload: &T) -> Self {
        let value = serde_json::to_value(payload).unwrap_or_else(|_| empty_object());
        Self::new(message_type, value)
    }

    /// Error envelope for a failure.
    pub fn error(err: &ParleyError, reply_to: Option<&str>) -> Self {
        Self::with_payload(
            MessageType::Error,
            &ErrorBody::from_error(err).reply_to(reply_to),
        )
    }

    /// Deserialize the payload into `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ParleyError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ParleyError::protocol(format!("invalid {} payload: {e}", self.message_type))
        })
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize envelope");
            String::new()
        })
    }
}

/// Parse and validate an inbound frame.
pub fn parse_envelope(text: &str) -> Result<Envelope, ParleyError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ParleyError::protocol(format!("invalid JSON: {e}")))?;
    let Value::Object(map) = &value else {
        return Err(ParleyError::protocol("envelope must be a JSON object"));
    };
    let Some(type_str) = map.get("type").and_then(Value::as_str) else {
        return Err(ParleyError::protocol("envelope missing string 'type'"));
    };
    if !map.get("id").is_some_and(Value::is_string) {
        return Err(ParleyError::protocol("envelope missing string 'id'"));
    }
    if !map.get("timestamp").is_some_and(Value::is_number) {
        return Err(ParleyError::protocol("envelope missing numeric 'timestamp'"));
    }
    let _ = MessageType::from_str(type_str)?;
    serde_json::from_value(value).map_err(|e| ParleyError::protocol(format!("invalid envelope: {e}")))
}

/// `identify` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyPayload {
    /// Role the peer takes.
    pub role: Role,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Peer software version.
    #[serde(default)]
    pub client_version: String,
    /// Session to resume, if the peer had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Free-form peer metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `welcome` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    /// Assigned session id.
    pub session_id: String,
    /// Role as recorded by the broker.
    pub role: Role,
    /// Protocol version.
    pub protocol_version: String,
}

/// `status` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    /// Status keyword (e.g. `connected`, `disconnecting`).
    pub status: String,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `error` payload, also used for structured tool failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Taxonomy kind, when the error came from the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Envelope id this error answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorBody {
    /// Body describing a broker error.
    pub fn from_error(err: &ParleyError) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
            kind: Some(err.kind()),
            reply_to: None,
            data: None,
        }
    }

    /// Attach the envelope id being answered.
    #[must_use]
    pub fn reply_to(mut self, id: Option<&str>) -> Self {
        self.reply_to = id.map(ToOwned::to_owned);
        self
    }
}

/// What a routed message is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// Single-target request; the sender gets an acknowledgment or, with
    /// `requiresResponse`, the correlated answer.
    #[default]
    Request,
    /// Fan-out to every resolved target.
    Notification,
}

/// `route` payload: a peer asking the broker to deliver `body`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePayload {
    /// Explicit target session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    /// Target role (fan-out).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_role: Option<Role>,
    /// Request or notification.
    #[serde(default)]
    pub kind: RouteKind,
    /// Whether the sender waits for a correlated answer.
    #[serde(default)]
    pub requires_response: bool,
    /// Response timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Queue priority if delivery fails.
    #[serde(default)]
    pub priority: Priority,
    /// Opaque content.
    #[serde(default = "empty_object")]
    pub body: Value,
}

/// `response` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Correlation token of the routed request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Interaction being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    /// Answer content.
    #[serde(default)]
    pub body: Value,
}

/// `message` payload: what a target receives for a routed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedMessage {
    /// Originating session.
    pub from_id: String,
    /// Request or notification.
    pub kind: RouteKind,
    /// Present when the sender awaits a `response` echoing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Opaque content.
    #[serde(default)]
    pub body: Value,
}

/// `interaction_request` payload sent to a responder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRequestPayload {
    /// Interaction to answer.
    pub interaction_id: String,
    /// Asking session.
    pub requester_id: String,
    /// What to render.
    pub spec: InteractionSpec,
}

/// `tool_call` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    /// Operation name.
    pub name: String,
    /// Argument object.
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

/// `tool_result` payload. Exactly one of `result` and `error` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    /// Operation name.
    pub name: String,
    /// Envelope id of the `tool_call`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Success value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Structured failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_valid_envelope() {
        let text = r#"{"type":"identify","id":"m1","timestamp":1,"payload":{"role":"responder"}}"#;
        let env = parse_envelope(text).unwrap();
        assert_eq!(env.message_type, MessageType::Identify);
        assert_eq!(env.id, "m1");
        let identify: IdentifyPayload = env.payload_as().unwrap();
        assert_eq!(identify.role, Role::Responder);
        assert!(identify.capabilities.is_empty());
    }

    #[test]
    fn payload_defaults_to_empty_object() {
        let env = parse_envelope(r#"{"type":"ping","id":"m1","timestamp":5}"#).unwrap();
        assert!(env.payload.as_object().is_some_and(serde_json::Map::is_empty));
    }

    #[test]
    fn missing_fields_are_protocol_errors() {
        for text in [
            r#"{"id":"m1","timestamp":1}"#,
            r#"{"type":"ping","timestamp":1}"#,
            r#"{"type":"ping","id":"m1"}"#,
            r#"{"type":"ping","id":7,"timestamp":1}"#,
            r#"{"type":"ping","id":"m1","timestamp":"now"}"#,
        ] {
            assert_matches!(parse_envelope(text), Err(ParleyError::Protocol { .. }), "{text}");
        }
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = parse_envelope(r#"{"type":"teleport","id":"m1","timestamp":1}"#).unwrap_err();
        assert_matches!(err, ParleyError::Protocol { ref message } if message.contains("teleport"));
    }

    #[test]
    fn non_object_and_invalid_json_rejected() {
        assert_matches!(parse_envelope("[1,2]"), Err(ParleyError::Protocol { .. }));
        assert_matches!(parse_envelope("not json"), Err(ParleyError::Protocol { .. }));
    }

    #[test]
    fn envelope_serializes_type_field() {
        let env = Envelope::new(MessageType::InteractionRequest, json!({"a": 1}));
        let value: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(value["type"], "interaction_request");
        assert!(value["id"].as_str().unwrap().starts_with("msg_"));
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn message_type_from_str() {
        assert_eq!("tool_call".parse::<MessageType>().unwrap(), MessageType::ToolCall);
        assert!("nope".parse::<MessageType>().is_err());
    }

    #[test]
    fn priority_orders_high_first() {
        let mut tiers = vec![Priority::Low, Priority::High, Priority::Normal];
        tiers.sort();
        assert_eq!(tiers, vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn role_counterpart() {
        assert_eq!(Role::Requester.counterpart(), Role::Responder);
        assert_eq!(Role::Responder.counterpart(), Role::Requester);
    }

    #[test]
    fn route_payload_defaults() {
        let route: RoutePayload = serde_json::from_value(json!({"toId": "b1"})).unwrap();
        assert_eq!(route.to_id.as_deref(), Some("b1"));
        assert!(!route.requires_response);
        assert_eq!(route.kind, RouteKind::Request);
        assert_eq!(route.priority, Priority::Normal);
    }

    #[test]
    fn error_envelope_carries_code_and_kind() {
        let env = Envelope::error(&ParleyError::routing("no targets"), Some("m9"));
        assert_eq!(env.message_type, MessageType::Error);
        let body: ErrorBody = env.payload_as().unwrap();
        assert_eq!(body.code, "ROUTING_ERROR");
        assert_eq!(body.kind, Some(ErrorKind::Routing));
        assert_eq!(body.reply_to.as_deref(), Some("m9"));
    }

    #[test]
    fn routed_message_omits_missing_correlation() {
        let msg = RoutedMessage {
            from_id: "sess_a".into(),
            kind: RouteKind::Notification,
            correlation_id: None,
            body: json!({"x": 1}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["fromId"], "sess_a");
        assert_eq!(value["kind"], "notification");
        assert!(value.get("correlationId").is_none());
    }
}
