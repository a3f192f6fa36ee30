//! Broker facade.
//!
//! Wires the registry, interaction manager, router and tool surface together
//! and owns inbound dispatch for peer connections. A host (the WebSocket
//! server, or a test) hands each raw connection to [`Broker::connect`] and
//! feeds its text frames to [`Broker::handle_text`].

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parley_core::errors::ParleyError;
use parley_core::events::BrokerEvent;
use parley_core::ids::{InteractionId, PendingId, SessionId};
use parley_core::interaction::InteractionResult;
use parley_core::settings::BrokerSettings;
use parley_core::wire::{
    Envelope, IdentifyPayload, MessageType, PROTOCOL_VERSION, ResponsePayload, Role, RoutePayload, ToolCallPayload,
    ToolResultPayload, WelcomePayload, parse_envelope,
};
use parley_resilience::{
    CircuitBreaker, CircuitSnapshot, HealthMonitor, HealthReport, ProcessSampler, ResilienceEngine, Severity,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::events::EventBus;
use crate::interactions::{InteractionConfig, InteractionManager};
use crate::registry::{Registry, RegistryConfig, SessionObserver, Transport};
use crate::router::{ResponseDisposition, RouteReply, RouteRequest, Router, RouterConfig};
use crate::tools::{ToolContext, ToolSurface};

/// Where a connection is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    /// Connected, not yet identified.
    Pending(PendingId),
    /// Identified session.
    Session(SessionId),
}

impl Peer {
    /// Session id once identified.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Pending(_) => None,
            Self::Session(id) => Some(id),
        }
    }
}

/// Session counts by role.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionCounts {
    /// Identified requesters.
    pub requester: usize,
    /// Identified responders.
    pub responder: usize,
    /// Connections awaiting identify.
    pub pending: usize,
}

/// Point-in-time diagnostics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSnapshot {
    /// Seconds since the broker was created.
    pub uptime_secs: u64,
    /// Session counts.
    pub sessions: SessionCounts,
    /// Pending interactions.
    pub active_interactions: usize,
    /// Messages waiting in outbound queues.
    pub queued_messages: usize,
    /// Routed requests awaiting a correlated response.
    pub pending_routes: usize,
    /// Circuit breaker state per key.
    pub circuits: Vec<CircuitSnapshot>,
    /// Health aggregate.
    pub health: HealthReport,
}

/// The in-process broker.
pub struct Broker {
    settings: BrokerSettings,
    events: EventBus,
    registry: Arc<Registry>,
    interactions: Arc<InteractionManager>,
    router: Arc<Router>,
    tools: ToolSurface,
    health: Arc<HealthMonitor>,
    breaker: Arc<CircuitBreaker>,
    resilience: ResilienceEngine,
    cancel: CancellationToken,
    tasks: TaskTracker,
    started_at: std::time::Instant,
}

impl Broker {
    /// Build every component from `settings`.
    pub fn new(settings: BrokerSettings) -> Arc<Self> {
        let events = EventBus::new();
        let registry = Arc::new(Registry::new(RegistryConfig::from_settings(&settings), events.clone()));
        let interactions = InteractionManager::new(InteractionConfig::from_settings(&settings), events.clone());
        let breaker = Arc::new(CircuitBreaker::default());
        let router = Arc::new(Router::new(
            registry.clone(),
            breaker.clone(),
            RouterConfig::from_settings(&settings),
            events.clone(),
        ));
        let observer: Arc<dyn SessionObserver> = router.clone();
        registry.add_observer(&observer);

        let health = Arc::new(HealthMonitor::default());
        let resilience = ResilienceEngine::with_default_strategies().with_health(health.clone());
        let tools = ToolSurface::new(ToolContext {
            registry: registry.clone(),
            interactions: interactions.clone(),
            default_timeout: Duration::from_millis(settings.interaction_timeout_default_ms),
        });

        Arc::new(Self {
            settings,
            events,
            registry,
            interactions,
            router,
            tools,
            health,
            breaker,
            resilience,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started_at: std::time::Instant::now(),
        })
    }

    /// Settings the broker was built with.
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Interaction manager.
    pub fn interactions(&self) -> &Arc<InteractionManager> {
        &self.interactions
    }

    /// Router.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Tool surface.
    pub fn tools(&self) -> &ToolSurface {
        &self.tools
    }

    /// Health monitor.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Shared retry engine; errors it handles are recorded into [`Broker::health`].
    pub fn resilience(&self) -> &ResilienceEngine {
        &self.resilience
    }

    /// Register a new raw connection.
    pub fn connect(&self, transport: Arc<dyn Transport>) -> Peer {
        Peer::Pending(self.registry.register_pending(transport))
    }

    /// Handle one inbound text frame from `peer`.
    ///
    /// Malformed frames are answered with an `error` envelope and the
    /// connection stays open. Returns `false` once the peer is gone and its
    /// connection should be closed.
    pub fn handle_text(self: &Arc<Self>, peer: &mut Peer, text: &str) -> bool {
        let envelope = match parse_envelope(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "malformed envelope");
                self.report(&err);
                return self.reply(peer, &Envelope::error(&err, None));
            }
        };
        counter!("envelopes_received_total", "type" => envelope.message_type.as_str()).increment(1);

        match peer.clone() {
            Peer::Pending(pending_id) => self.handle_pending(peer, &pending_id, &envelope),
            Peer::Session(session_id) => {
                if self.registry.get(&session_id).is_none() {
                    debug!(session_id = %session_id, "frame from removed session");
                    return false;
                }
                self.registry.touch(&session_id);
                self.dispatch(&session_id, envelope);
                true
            }
        }
    }

    /// Tear down `peer` after its transport closed.
    pub fn disconnect_peer(&self, peer: &Peer, reason: &str) {
        match peer {
            Peer::Pending(id) => self.registry.discard_pending(id, reason),
            Peer::Session(id) => {
                let _ = self.registry.disconnect(id, reason);
            }
        }
    }

    /// Record a caller-visible failure for health and observers.
    pub fn report(&self, err: &ParleyError) {
        counter!("broker_errors_total", "kind" => err.kind().to_string()).increment(1);
        self.health.record_error(err, Severity::for_kind(err.kind()));
        self.events.emit(BrokerEvent::error(err));
    }

    /// Start the heartbeat, queue sweep and health sampler loops.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.registry.clone().run_heartbeat(cancel.clone())),
            tokio::spawn(
                self.router.clone().run_queue_sweep(cancel.clone()),
            ),
            tokio::spawn(
                self.health
                    .clone()
                    .run_sampler(Arc::new(ProcessSampler), cancel.clone()),
            ),
        ]
    }

    /// Cancel every pending interaction, close every connection and stop
    /// in-flight route and tool tasks along with interaction timers and GC.
    /// Returns the number of sessions closed.
    pub fn shutdown(&self) -> usize {
        let interactions = self.interactions.close_all(None);
        let sessions = self.registry.disconnect_all("shutdown");
        self.cancel.cancel();
        let _ = self.tasks.close();
        self.interactions.shutdown();
        info!(sessions, interactions = interactions.len(), "broker shut down");
        sessions
    }

    /// Resolves once [`shutdown`](Self::shutdown) ran and every task the
    /// broker spawned has exited.
    pub async fn wait_idle(&self) {
        self.tasks.wait().await;
        self.interactions.wait_idle().await;
    }

    /// Diagnostics snapshot.
    pub fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            sessions: SessionCounts {
                requester: self.registry.count_by_role(Role::Requester),
                responder: self.registry.count_by_role(Role::Responder),
                pending: self.registry.pending_count(),
            },
            active_interactions: self.interactions.active_count(),
            queued_messages: self.router.total_queued(),
            pending_routes: self.router.pending_count(),
            circuits: self.breaker.snapshot(),
            health: self.health.report(),
        }
    }

    fn reply(&self, peer: &Peer, envelope: &Envelope) -> bool {
        match peer {
            Peer::Pending(id) => self.registry.send_pending(id, envelope),
            Peer::Session(id) => self.registry.send(id, envelope).is_ok(),
        }
    }

    fn handle_pending(&self, peer: &mut Peer, pending_id: &PendingId, envelope: &Envelope) -> bool {
        match envelope.message_type {
            MessageType::Identify => {}
            MessageType::Ping => {
                return self
                    .registry
                    .send_pending(pending_id, &Envelope::new(MessageType::Pong, json!({})));
            }
            other => {
                let err = ParleyError::protocol(format!("expected identify, got {other}"));
                self.report(&err);
                return self
                    .registry
                    .send_pending(pending_id, &Envelope::error(&err, Some(&envelope.id)));
            }
        }

        let identify: IdentifyPayload = match envelope.payload_as() {
            Ok(identify) => identify,
            Err(err) => {
                self.report(&err);
                return self
                    .registry
                    .send_pending(pending_id, &Envelope::error(&err, Some(&envelope.id)));
            }
        };

        let session = match self.registry.promote(pending_id, identify) {
            Ok(session) => session,
            Err(err) => {
                warn!(pending_id = %pending_id, error = %err, "identify rejected");
                self.report(&err);
                let _ = self
                    .registry
                    .send_pending(pending_id, &Envelope::error(&err, Some(&envelope.id)));
                self.registry.discard_pending(pending_id, err.code());
                return false;
            }
        };

        *peer = Peer::Session(session.id.clone());
        let welcome = Envelope::with_payload(
            MessageType::Welcome,
            &WelcomePayload {
                session_id: session.id.to_string(),
                role: session.role,
                protocol_version: PROTOCOL_VERSION.to_owned(),
            },
        );
        if let Err(err) = self.registry.send(&session.id, &welcome) {
            warn!(session_id = %session.id, error = %err, "welcome not delivered");
            return false;
        }
        let drained = self.router.process_queued(&session.id);
        if drained > 0 {
            debug!(session_id = %session.id, drained, "delivered queued messages");
        }
        true
    }

    #[instrument(skip_all, fields(session_id = %session_id, message_type = %envelope.message_type))]
    fn dispatch(self: &Arc<Self>, session_id: &SessionId, envelope: Envelope) {
        let outcome = match envelope.message_type {
            MessageType::Response => self.handle_response(session_id, &envelope),
            MessageType::Route => self.spawn_route(session_id, &envelope),
            MessageType::ToolList => {
                let list = Envelope::new(MessageType::ToolList, json!({ "operations": self.tools.list_operations() }));
                self.registry.send(session_id, &list)
            }
            MessageType::ToolCall => self.spawn_tool_call(session_id, &envelope),
            MessageType::Ping => self
                .registry
                .send(session_id, &Envelope::new(MessageType::Pong, json!({}))),
            MessageType::Pong => Ok(()),
            MessageType::Status | MessageType::Message => {
                debug!(payload = %envelope.payload, "peer notice");
                Ok(())
            }
            MessageType::Error => {
                warn!(payload = %envelope.payload, "peer reported an error");
                Ok(())
            }
            MessageType::Identify => Err(ParleyError::protocol("session already identified")),
            other => Err(ParleyError::protocol(format!("unexpected message type {other}"))),
        };

        if let Err(err) = outcome {
            debug!(error = %err, "dispatch failed");
            self.report(&err);
            let _ = self
                .registry
                .send(session_id, &Envelope::error(&err, Some(&envelope.id)));
        }
    }

    fn handle_response(&self, session_id: &SessionId, envelope: &Envelope) -> Result<(), ParleyError> {
        let mut payload: ResponsePayload = envelope.payload_as()?;
        if let Some(interaction_id) = payload.interaction_id.take() {
            return self.resolve_interaction(session_id, &InteractionId::from(interaction_id), payload.body);
        }
        match self.router.handle_response(session_id, payload) {
            ResponseDisposition::Correlated(correlation_id) => {
                debug!(correlation_id = %correlation_id, "response correlated");
            }
            ResponseDisposition::Unsolicited { delivered } => {
                debug!(delivered, "unsolicited response forwarded");
            }
        }
        Ok(())
    }

    /// Only the assigned responder may settle an interaction. The result is
    /// forwarded to the requester best-effort.
    fn resolve_interaction(&self, from: &SessionId, id: &InteractionId, body: Value) -> Result<(), ParleyError> {
        let interaction = self
            .interactions
            .get(id)
            .ok_or_else(|| ParleyError::InteractionNotFound {
                interaction_id: id.to_string(),
            })?;
        if interaction.responder_id != *from {
            return Err(ParleyError::routing(format!(
                "session {from} is not the responder for interaction {id}"
            )));
        }
        let result: InteractionResult = serde_json::from_value(body)
            .map_err(|e| ParleyError::protocol(format!("invalid interaction result: {e}")))?;
        self.interactions.resolve(id, result.clone())?;

        let forward = Envelope::with_payload(
            MessageType::Response,
            &ResponsePayload {
                correlation_id: None,
                interaction_id: Some(id.to_string()),
                body: serde_json::to_value(&result).unwrap_or_default(),
            },
        );
        if let Err(err) = self.registry.send(&interaction.requester_id, &forward) {
            debug!(interaction_id = %id, error = %err, "requester not reachable for result");
        }
        Ok(())
    }

    fn spawn_route(self: &Arc<Self>, session_id: &SessionId, envelope: &Envelope) -> Result<(), ParleyError> {
        let payload: RoutePayload = envelope.payload_as()?;
        let request = RouteRequest::from_payload(session_id.clone(), payload);
        let broker = Arc::clone(self);
        let from = session_id.clone();
        let reply_to = envelope.id.clone();
        let cancel = self.cancel.clone();
        let _ = self.tasks.spawn(async move {
            let routed = tokio::select! {
                routed = broker.router.route(request) => routed,
                () = cancel.cancelled() => return,
            };
            let reply = match routed {
                Ok(RouteReply::Response(response)) => Envelope::with_payload(
                    MessageType::Response,
                    &ResponsePayload {
                        correlation_id: Some(response.correlation_id.to_string()),
                        interaction_id: None,
                        body: response.body,
                    },
                ),
                Ok(RouteReply::Ack { delivered, queued }) => Envelope::new(
                    MessageType::Status,
                    json!({ "status": "routed", "replyTo": reply_to, "delivered": delivered, "queued": queued }),
                ),
                Err(err) => {
                    broker.report(&err);
                    Envelope::error(&err, Some(&reply_to))
                }
            };
            if let Err(err) = broker.registry.send(&from, &reply) {
                debug!(session_id = %from, error = %err, "route reply not delivered");
            }
        });
        Ok(())
    }

    fn spawn_tool_call(self: &Arc<Self>, session_id: &SessionId, envelope: &Envelope) -> Result<(), ParleyError> {
        let call: ToolCallPayload = envelope.payload_as()?;
        let broker = Arc::clone(self);
        let from = session_id.clone();
        let reply_to = envelope.id.clone();
        let cancel = self.cancel.clone();
        let _ = self.tasks.spawn(async move {
            let outcome = tokio::select! {
                outcome = broker.tools.invoke_operation(&from, &call.name, call.arguments) => outcome,
                () = cancel.cancelled() => return,
            };
            let (result, error) = match outcome {
                Ok(value) => (Some(value), None),
                Err(failure) => (None, Some(failure.into_error_body())),
            };
            let reply = Envelope::with_payload(
                MessageType::ToolResult,
                &ToolResultPayload {
                    name: call.name,
                    reply_to: Some(reply_to),
                    result,
                    error,
                },
            );
            if let Err(err) = broker.registry.send(&from, &reply) {
                debug!(session_id = %from, error = %err, "tool result not delivered");
            }
        });
        Ok(())
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .field("interactions", &self.interactions)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelTransport, Outbound};
    use parley_core::interaction::InteractionStatus;
    use parley_core::wire::{ErrorBody, InteractionRequestPayload, RoutedMessage, StatusPayload};
    use tokio::sync::mpsc;

    struct TestPeer {
        peer: Peer,
        rx: mpsc::Receiver<Outbound>,
    }

    impl TestPeer {
        fn send(&mut self, broker: &Arc<Broker>, message_type: MessageType, payload: Value) -> (bool, String) {
            let envelope = Envelope::new(message_type, payload);
            let keep = broker.handle_text(&mut self.peer, &envelope.to_json());
            (keep, envelope.id)
        }

        async fn next(&mut self) -> Envelope {
            loop {
                match self.rx.recv().await {
                    Some(Outbound::Text(text)) => {
                        let envelope = parse_envelope(&text).unwrap();
                        if envelope.message_type != MessageType::Ping {
                            return envelope;
                        }
                    }
                    Some(Outbound::Close { .. }) => panic!("unexpected close"),
                    None => panic!("transport dropped"),
                }
            }
        }

        fn session_id(&self) -> SessionId {
            self.peer.session_id().cloned().unwrap()
        }
    }

    fn broker() -> Arc<Broker> {
        Broker::new(BrokerSettings::default())
    }

    fn raw(broker: &Arc<Broker>) -> TestPeer {
        let (transport, rx) = ChannelTransport::new(32);
        TestPeer {
            peer: broker.connect(transport),
            rx,
        }
    }

    async fn identified(broker: &Arc<Broker>, role: Role) -> TestPeer {
        let mut peer = raw(broker);
        let (keep, _) = peer.send(
            broker,
            MessageType::Identify,
            json!({ "role": role, "capabilities": ["dialogs"], "clientVersion": "1.0" }),
        );
        assert!(keep);
        let welcome = peer.next().await;
        assert_eq!(welcome.message_type, MessageType::Welcome);
        peer
    }

    #[tokio::test]
    async fn identify_promotes_and_welcomes() {
        let broker = broker();
        let mut peer = raw(&broker);
        let (keep, _) = peer.send(&broker, MessageType::Identify, json!({ "role": "responder" }));
        assert!(keep);

        let welcome: WelcomePayload = peer.next().await.payload_as().unwrap();
        assert_eq!(welcome.role, Role::Responder);
        assert_eq!(welcome.protocol_version, PROTOCOL_VERSION);
        assert_eq!(peer.peer, Peer::Session(SessionId::from(welcome.session_id)));
        assert_eq!(broker.registry().count_by_role(Role::Responder), 1);
    }

    #[tokio::test]
    async fn pending_peer_must_identify_first() {
        let broker = broker();
        let mut peer = raw(&broker);
        let (keep, id) = peer.send(&broker, MessageType::Route, json!({}));
        assert!(keep);
        let error: ErrorBody = peer.next().await.payload_as().unwrap();
        assert_eq!(error.code, "PROTOCOL_ERROR");
        assert_eq!(error.reply_to.as_deref(), Some(id.as_str()));
        assert_eq!(broker.registry().pending_count(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let broker = broker();
        let mut peer = identified(&broker, Role::Requester).await;
        assert!(broker.handle_text(&mut peer.peer, "{not json"));
        let error = peer.next().await;
        assert_eq!(error.message_type, MessageType::Error);
        assert_eq!(broker.registry().len(), 1);
        assert_eq!(broker.health().report().recent_errors, 1);
    }

    #[tokio::test]
    async fn identify_over_capacity_closes() {
        let broker = Broker::new(BrokerSettings {
            max_sessions: 1,
            ..BrokerSettings::default()
        });
        let _first = identified(&broker, Role::Requester).await;
        let mut second = raw(&broker);
        let (keep, _) = second.send(&broker, MessageType::Identify, json!({ "role": "responder" }));
        assert!(!keep);

        let Some(Outbound::Text(text)) = second.rx.recv().await else {
            panic!("expected error frame");
        };
        let error: ErrorBody = parse_envelope(&text).unwrap().payload_as().unwrap();
        assert_eq!(error.code, "CAPACITY_EXCEEDED");
        assert!(matches!(second.rx.recv().await, Some(Outbound::Close { .. })));
        assert_eq!(broker.registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let broker = broker();
        let mut peer = identified(&broker, Role::Requester).await;
        let _ = peer.send(&broker, MessageType::Ping, json!({}));
        assert_eq!(peer.next().await.message_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn routed_request_returns_correlated_response() {
        let broker = broker();
        let mut requester = identified(&broker, Role::Requester).await;
        let mut responder = identified(&broker, Role::Responder).await;

        let _ = requester.send(
            &broker,
            MessageType::Route,
            json!({ "toId": responder.session_id(), "requiresResponse": true, "timeoutMs": 1000, "body": { "q": 1 } }),
        );
        let delivered = responder.next().await;
        assert_eq!(delivered.message_type, MessageType::Message);
        let message: RoutedMessage = delivered.payload_as().unwrap();
        assert_eq!(message.from_id, requester.session_id().as_str());
        let correlation_id = message.correlation_id.unwrap();

        let _ = responder.send(
            &broker,
            MessageType::Response,
            json!({ "correlationId": correlation_id, "body": { "a": 2 } }),
        );
        let answer: ResponsePayload = requester.next().await.payload_as().unwrap();
        assert_eq!(answer.correlation_id.as_deref(), Some(correlation_id.as_str()));
        assert_eq!(answer.body, json!({ "a": 2 }));
    }

    #[tokio::test]
    async fn notification_is_acknowledged() {
        let broker = broker();
        let mut requester = identified(&broker, Role::Requester).await;
        let mut responder = identified(&broker, Role::Responder).await;

        let (_, id) = requester.send(&broker, MessageType::Route, json!({ "kind": "notification", "body": "hi" }));
        assert_eq!(responder.next().await.message_type, MessageType::Message);
        let ack = requester.next().await;
        let status: StatusPayload = ack.payload_as().unwrap();
        assert_eq!(status.status, "routed");
        assert_eq!(ack.payload["replyTo"], id);
        assert_eq!(ack.payload["delivered"][0], responder.session_id().as_str());
    }

    #[tokio::test]
    async fn tool_call_creates_interaction_and_responder_resolves_it() {
        let broker = broker();
        let mut requester = identified(&broker, Role::Requester).await;
        let mut responder = identified(&broker, Role::Responder).await;

        let (_, call_id) = requester.send(
            &broker,
            MessageType::ToolCall,
            json!({ "name": "create_interaction", "arguments": { "title": "Deploy", "message": "Ship it?" } }),
        );
        let request: InteractionRequestPayload = responder.next().await.payload_as().unwrap();
        assert_eq!(request.spec.title, "Deploy");

        let tool_result: ToolResultPayload = requester.next().await.payload_as().unwrap();
        assert_eq!(tool_result.reply_to.as_deref(), Some(call_id.as_str()));
        assert_eq!(tool_result.result.unwrap()["interactionId"], request.interaction_id.as_str());

        let _ = responder.send(
            &broker,
            MessageType::Response,
            json!({ "interactionId": request.interaction_id, "body": { "buttonId": "ok" } }),
        );
        let forwarded: ResponsePayload = requester.next().await.payload_as().unwrap();
        assert_eq!(forwarded.interaction_id.as_deref(), Some(request.interaction_id.as_str()));
        assert_eq!(forwarded.body["buttonId"], "ok");

        let interaction = broker
            .interactions()
            .get(&InteractionId::from(request.interaction_id))
            .unwrap();
        assert_eq!(interaction.status, InteractionStatus::Resolved);
    }

    #[tokio::test]
    async fn only_assigned_responder_resolves() {
        let broker = broker();
        let requester = identified(&broker, Role::Requester).await;
        let responder = identified(&broker, Role::Responder).await;
        let mut other = identified(&broker, Role::Responder).await;

        let id = broker
            .interactions()
            .create(requester.session_id(), responder.session_id(), parley_core::interaction::InteractionSpec::default())
            .unwrap();
        let _ = other.send(
            &broker,
            MessageType::Response,
            json!({ "interactionId": id, "body": { "buttonId": "ok" } }),
        );
        let error: ErrorBody = other.next().await.payload_as().unwrap();
        assert_eq!(error.code, "ROUTING_ERROR");
        assert_eq!(broker.interactions().get(&id).unwrap().status, InteractionStatus::Pending);
    }

    #[tokio::test]
    async fn tool_list_and_unknown_tool() {
        let broker = broker();
        let mut requester = identified(&broker, Role::Requester).await;

        let _ = requester.send(&broker, MessageType::ToolList, json!({}));
        let list = requester.next().await;
        assert_eq!(list.payload["operations"].as_array().unwrap().len(), 4);

        let _ = requester.send(&broker, MessageType::ToolCall, json!({ "name": "nope" }));
        let result: ToolResultPayload = requester.next().await.payload_as().unwrap();
        assert!(result.result.is_none());
        assert_eq!(result.error.unwrap().code, "UNKNOWN_OPERATION");
    }

    #[tokio::test]
    async fn queued_messages_drain_on_resume() {
        let broker = broker();
        let mut requester = identified(&broker, Role::Requester).await;
        let responder = identified(&broker, Role::Responder).await;
        let responder_id = responder.session_id();
        drop(responder);

        let _ = requester.send(
            &broker,
            MessageType::Route,
            json!({ "toId": responder_id, "kind": "notification", "body": "later" }),
        );
        let status = requester.next().await;
        assert_eq!(status.payload["queued"][0], responder_id.as_str());

        let mut resumed = raw(&broker);
        let _ = resumed.send(
            &broker,
            MessageType::Identify,
            json!({ "role": "responder", "sessionId": responder_id }),
        );
        assert_eq!(resumed.next().await.message_type, MessageType::Welcome);
        let message: RoutedMessage = resumed.next().await.payload_as().unwrap();
        assert_eq!(message.body, json!("later"));
    }

    #[tokio::test]
    async fn shutdown_cancels_interactions_and_closes_sessions() {
        let broker = broker();
        let requester = identified(&broker, Role::Requester).await;
        let responder = identified(&broker, Role::Responder).await;
        let id = broker
            .interactions()
            .create(requester.session_id(), responder.session_id(), parley_core::interaction::InteractionSpec::default())
            .unwrap();

        assert_eq!(broker.shutdown(), 2);
        assert!(broker.registry().is_empty());
        assert_eq!(broker.interactions().get(&id).unwrap().status, InteractionStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_in_flight_tasks_and_gc() {
        let broker = broker();
        let mut requester = identified(&broker, Role::Requester).await;
        let mut responder = identified(&broker, Role::Responder).await;

        let _ = requester.send(
            &broker,
            MessageType::Route,
            json!({ "toId": responder.session_id(), "requiresResponse": true, "timeoutMs": 60_000, "body": {} }),
        );
        assert_eq!(responder.next().await.message_type, MessageType::Message);
        let resolved = broker
            .interactions()
            .create(requester.session_id(), responder.session_id(), parley_core::interaction::InteractionSpec::default())
            .unwrap();
        broker.interactions().resolve(&resolved, InteractionResult::dismissed()).unwrap();
        assert_eq!(broker.router().pending_count(), 1);

        assert_eq!(broker.shutdown(), 2);
        tokio::time::timeout(Duration::from_secs(1), broker.wait_idle())
            .await
            .expect("broker tasks still running after shutdown");
        assert_eq!(broker.router().pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(broker.interactions().get(&resolved).is_some());
    }

    #[tokio::test]
    async fn snapshot_counts() {
        let broker = broker();
        let _requester = identified(&broker, Role::Requester).await;
        let _pending = raw(&broker);
        let snapshot = broker.snapshot();
        assert_eq!(snapshot.sessions.requester, 1);
        assert_eq!(snapshot.sessions.pending, 1);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["health"]["status"], "healthy");
        assert_eq!(value["activeInteractions"], 0);
    }
}
