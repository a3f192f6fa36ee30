//! Tool-calling surface for requesters.
//!
//! A fixed set of named operations with JSON-schema arguments. Each call
//! returns a JSON value or a structured [`ToolFailure`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use parley_core::errors::ParleyError;
use parley_core::ids::{InteractionId, SessionId};
use parley_core::interaction::InteractionSpec;
use parley_core::wire::{Envelope, ErrorBody, InteractionRequestPayload, MessageType, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::interactions::InteractionManager;
use crate::registry::Registry;

/// Extra patience beyond an interaction's own timeout when blocking on it.
const WAIT_GRACE: Duration = Duration::from_secs(1);

/// Name, description and argument schema of one operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescriptor {
    /// Operation name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema of the argument object.
    pub input_schema: Value,
}

/// Structured operation failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolFailure {
    /// Machine-readable code.
    pub code: String,
    /// Message.
    pub message: String,
    /// Extra context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolFailure {
    /// Failure with `code` and `message`.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// The operation name is not registered.
    pub fn unknown_operation(name: &str) -> Self {
        Self::new("UNKNOWN_OPERATION", format!("unknown operation '{name}'"))
    }

    /// Arguments did not match the schema.
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new("INVALID_ARGUMENTS", message)
    }

    /// Attach context.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Wire form for `tool_result` and `error` envelopes.
    pub fn into_error_body(self) -> ErrorBody {
        ErrorBody {
            code: self.code,
            message: self.message,
            kind: None,
            reply_to: None,
            data: self.data,
        }
    }
}

impl From<ParleyError> for ToolFailure {
    fn from(err: ParleyError) -> Self {
        Self::new(err.code(), err.to_string()).with_data(json!({ "kind": err.kind() }))
    }
}

/// Shared state operations run against.
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Session registry.
    pub registry: Arc<Registry>,
    /// Interaction manager.
    pub interactions: Arc<InteractionManager>,
    /// Interaction timeout applied when a call omits one.
    pub default_timeout: Duration,
}

/// One operation.
#[async_trait]
pub trait ToolOperation: Send + Sync {
    /// Name, description, schema.
    fn descriptor(&self) -> OperationDescriptor;

    /// Run on behalf of `requester_id`.
    async fn invoke(&self, requester_id: &SessionId, args: Value, ctx: &ToolContext) -> Result<Value, ToolFailure>;
}

/// Ordered operation registry.
pub struct ToolSurface {
    operations: Vec<(String, Arc<dyn ToolOperation>)>,
    ctx: ToolContext,
}

impl ToolSurface {
    /// Surface with the built-in interaction operations.
    pub fn new(ctx: ToolContext) -> Self {
        let mut surface = Self {
            operations: Vec::new(),
            ctx,
        };
        surface.register(CreateInteraction { wait: false });
        surface.register(CreateInteraction { wait: true });
        surface.register(ListActiveInteractions);
        surface.register(CloseInteractions);
        surface
    }

    /// Register an operation under its descriptor name.
    pub fn register(&mut self, operation: impl ToolOperation + 'static) {
        let name = operation.descriptor().name;
        self.operations.retain(|(n, _)| *n != name);
        self.operations.push((name, Arc::new(operation)));
    }

    /// Operations in registration order.
    pub fn list_operations(&self) -> Vec<OperationDescriptor> {
        self.operations.iter().map(|(_, op)| op.descriptor()).collect()
    }

    /// Invoke `name` with `args` for `requester_id`.
    pub async fn invoke_operation(&self, requester_id: &SessionId, name: &str, args: Value) -> Result<Value, ToolFailure> {
        counter!("tool_calls_total", "operation" => name.to_owned()).increment(1);
        let Some((_, operation)) = self.operations.iter().find(|(n, _)| n == name) else {
            counter!("tool_errors_total", "operation" => name.to_owned(), "code" => "UNKNOWN_OPERATION").increment(1);
            return Err(ToolFailure::unknown_operation(name));
        };

        let start = Instant::now();
        let result = operation.invoke(requester_id, args, &self.ctx).await;
        histogram!("tool_call_duration_seconds", "operation" => name.to_owned()).record(start.elapsed().as_secs_f64());
        if let Err(failure) = &result {
            counter!("tool_errors_total", "operation" => name.to_owned(), "code" => failure.code.clone()).increment(1);
            debug!(operation = name, code = %failure.code, "tool call failed");
        }
        result
    }
}

impl std::fmt::Debug for ToolSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.operations.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("ToolSurface").field("operations", &names).finish_non_exhaustive()
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolFailure> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolFailure::invalid_arguments(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateArgs {
    #[serde(flatten)]
    spec: InteractionSpec,
    #[serde(default)]
    responder_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeArgs {
    #[serde(default)]
    responder_id: Option<String>,
    #[serde(default)]
    interaction_id: Option<String>,
}

struct CreateInteraction {
    wait: bool,
}

#[async_trait]
impl ToolOperation for CreateInteraction {
    fn descriptor(&self) -> OperationDescriptor {
        let (name, description) = if self.wait {
            (
                "create_interaction_and_wait",
                "Ask a responder for input and block until it answers, times out or is closed.",
            )
        } else {
            (
                "create_interaction",
                "Ask a responder for input and return the interaction id immediately.",
            )
        };
        OperationDescriptor {
            name: name.into(),
            description: description.into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "message": { "type": "string" },
                    "kind": { "type": "string", "enum": ["info", "warning", "error", "question", "input"] },
                    "buttons": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": { "id": { "type": "string" }, "label": { "type": "string" } },
                            "required": ["id", "label"]
                        }
                    },
                    "defaultButton": { "type": "string" },
                    "timeoutMs": { "type": "integer", "minimum": 1 },
                    "modal": { "type": "boolean" },
                    "inputPlaceholder": { "type": "string" },
                    "responderId": { "type": "string" }
                },
                "required": ["title", "message"]
            }),
        }
    }

    async fn invoke(&self, requester_id: &SessionId, args: Value, ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let CreateArgs { mut spec, responder_id } = parse_args(args)?;
        if spec.title.trim().is_empty() {
            return Err(ToolFailure::invalid_arguments("title must not be empty"));
        }
        if let Some(default) = &spec.default_button {
            if !spec.buttons.iter().any(|b| b.id == *default) {
                return Err(ToolFailure::invalid_arguments(format!("defaultButton '{default}' is not one of the buttons")));
            }
        }
        let timeout_ms = *spec
            .timeout_ms
            .get_or_insert(u64::try_from(ctx.default_timeout.as_millis()).unwrap_or(u64::MAX));

        let responder = match responder_id {
            Some(id) => ctx
                .registry
                .get(&SessionId::from(id.as_str()))
                .filter(|s| s.role == Role::Responder)
                .ok_or_else(|| ParleyError::routing(format!("responder session {id} not found")))?,
            None => ctx
                .registry
                .most_recent_active(Role::Responder)
                .ok_or_else(|| ParleyError::routing("no responder session connected"))?,
        };

        let id = ctx.interactions.create(requester_id.clone(), responder.id.clone(), spec.clone())?;
        let request = Envelope::with_payload(
            MessageType::InteractionRequest,
            &InteractionRequestPayload {
                interaction_id: id.to_string(),
                requester_id: requester_id.to_string(),
                spec,
            },
        );
        if let Err(e) = ctx.registry.send(&responder.id, &request) {
            warn!(interaction_id = %id, responder_id = %responder.id, error = %e, "interaction request not delivered");
            let _ = ctx.interactions.close(&id);
            return Err(ToolFailure::from(e).with_data(json!({ "interactionId": id })));
        }

        if !self.wait {
            return Ok(json!({
                "interactionId": id,
                "responderId": responder.id,
                "status": "pending",
            }));
        }

        let result = ctx
            .interactions
            .wait_for(&id, Duration::from_millis(timeout_ms) + WAIT_GRACE)
            .await
            .map_err(|e| ToolFailure::from(e).with_data(json!({ "interactionId": id })))?;
        let status = ctx.interactions.get(&id).map(|i| i.status);
        Ok(json!({
            "interactionId": id,
            "responderId": responder.id,
            "status": status,
            "result": result,
        }))
    }
}

struct ListActiveInteractions;

#[async_trait]
impl ToolOperation for ListActiveInteractions {
    fn descriptor(&self) -> OperationDescriptor {
        OperationDescriptor {
            name: "list_active_interactions".into(),
            description: "List pending interactions, optionally for one responder.".into(),
            input_schema: json!({
                "type": "object",
                "properties": { "responderId": { "type": "string" } }
            }),
        }
    }

    async fn invoke(&self, _requester_id: &SessionId, args: Value, ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let ScopeArgs { responder_id, .. } = parse_args(args)?;
        let responder = responder_id.map(SessionId::from);
        let interactions = ctx.interactions.list_active(responder.as_ref());
        Ok(json!({ "interactions": interactions }))
    }
}

struct CloseInteractions;

#[async_trait]
impl ToolOperation for CloseInteractions {
    fn descriptor(&self) -> OperationDescriptor {
        OperationDescriptor {
            name: "close_interactions".into(),
            description: "Cancel one pending interaction by id, or every pending interaction (optionally for one responder).".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "interactionId": { "type": "string" },
                    "responderId": { "type": "string" }
                }
            }),
        }
    }

    async fn invoke(&self, _requester_id: &SessionId, args: Value, ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let ScopeArgs {
            responder_id,
            interaction_id,
        } = parse_args(args)?;
        let closed: Vec<InteractionId> = match interaction_id {
            Some(id) => {
                let id = InteractionId::from(id);
                if ctx.interactions.close(&id) { vec![id] } else { Vec::new() }
            }
            None => ctx.interactions.close_all(responder_id.map(SessionId::from).as_ref()),
        };
        Ok(json!({ "closed": closed }))
    }
}
