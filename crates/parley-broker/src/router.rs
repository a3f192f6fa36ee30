//! Message routing.
//!
//! Target resolution order is explicit `toId`, then `toRole` (fan-out),
//! then the sender's counterpart role. Requests that expect a response get a
//! correlation id; the matching inbound `response` completes the caller's
//! future. Correlation is strict: a response without a known correlation id
//! is delivered as unsolicited and never matched to some other pending
//! request.
//!
//! Messages that cannot be delivered are kept in a bounded per-target queue
//! (drop-oldest) and drained by priority when the target comes back. A queue
//! whose target is no longer registered survives for a resume grace period
//! (three heartbeats) and is then swept.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use parley_core::errors::ParleyError;
use parley_core::events::BrokerEvent;
use parley_core::ids::{CorrelationId, SessionId};
use parley_core::settings::BrokerSettings;
use parley_core::wire::{Envelope, MessageType, Priority, ResponsePayload, Role, RouteKind, RoutePayload, RoutedMessage};
use parley_resilience::CircuitBreaker;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::registry::{Registry, Session, SessionObserver};

/// Router limits and defaults.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Per-target queue capacity.
    pub queue_capacity: usize,
    /// Response timeout when a request does not set one.
    pub default_timeout: Duration,
    /// How often orphaned queues are swept.
    pub sweep_interval: Duration,
    /// How long a queue outlives its target session before it is swept.
    pub orphan_grace: Duration,
}

impl RouterConfig {
    /// Values from broker settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        let heartbeat = Duration::from_millis(settings.heartbeat_interval_ms);
        Self {
            queue_capacity: settings.queue_capacity,
            default_timeout: Duration::from_millis(settings.route_timeout_ms),
            sweep_interval: heartbeat,
            orphan_grace: heartbeat * 3,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from_settings(&BrokerSettings::default())
    }
}

/// A message to route.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteRequest {
    /// Sending session.
    pub from_id: SessionId,
    /// Explicit target.
    pub to_id: Option<SessionId>,
    /// Target role for fan-out.
    pub to_role: Option<Role>,
    /// Request or notification.
    pub kind: RouteKind,
    /// Opaque content.
    pub body: Value,
    /// Wait for a correlated response.
    pub requires_response: bool,
    /// Response timeout override.
    pub timeout: Option<Duration>,
    /// Queue priority.
    pub priority: Priority,
}

impl RouteRequest {
    /// Request from `from_id` with default targeting.
    pub fn new(from_id: SessionId, body: Value) -> Self {
        Self {
            from_id,
            to_id: None,
            to_role: None,
            kind: RouteKind::Request,
            body,
            requires_response: false,
            timeout: None,
            priority: Priority::Normal,
        }
    }

    /// From a peer's `route` payload.
    pub fn from_payload(from_id: SessionId, payload: RoutePayload) -> Self {
        Self {
            from_id,
            to_id: payload.to_id.map(SessionId::from),
            to_role: payload.to_role,
            kind: payload.kind,
            body: payload.body,
            requires_response: payload.requires_response,
            timeout: payload.timeout_ms.map(Duration::from_millis),
            priority: payload.priority,
        }
    }

    /// Address a single session.
    #[must_use]
    pub fn target(mut self, id: SessionId) -> Self {
        self.to_id = Some(id);
        self
    }

    /// Address every session of `role`.
    #[must_use]
    pub fn target_role(mut self, role: Role) -> Self {
        self.to_role = Some(role);
        self
    }

    /// Fan out instead of single-target delivery.
    #[must_use]
    pub fn notification(mut self) -> Self {
        self.kind = RouteKind::Notification;
        self
    }

    /// Wait for a correlated response.
    #[must_use]
    pub fn expect_response(mut self, timeout: Option<Duration>) -> Self {
        self.requires_response = true;
        self.timeout = timeout;
        self
    }

    /// Queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A correlated answer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    /// Correlation token.
    pub correlation_id: CorrelationId,
    /// Answering session.
    pub from_id: SessionId,
    /// Answer content.
    pub body: Value,
}

/// What [`Router::route`] returns.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteReply {
    /// Delivered (or queued) without waiting for an answer.
    Ack {
        /// Targets that accepted the message.
        delivered: Vec<SessionId>,
        /// Targets the message was queued for.
        queued: Vec<SessionId>,
    },
    /// The correlated answer.
    Response(RouteResponse),
}

/// How an inbound `response` was handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Completed a pending request.
    Correlated(CorrelationId),
    /// Forwarded to the sender's counterparts.
    Unsolicited {
        /// Sessions that accepted it.
        delivered: usize,
    },
}

struct PendingRoute {
    to_id: SessionId,
    tx: oneshot::Sender<Result<RouteResponse, ParleyError>>,
}

struct QueuedMessage {
    priority: Priority,
    envelope: Envelope,
}

#[derive(Default)]
struct TargetQueue {
    messages: VecDeque<QueuedMessage>,
    /// First time the queue was seen without a registered target.
    orphaned_at: Option<Instant>,
}

/// Routes messages between sessions.
pub struct Router {
    registry: Arc<Registry>,
    breaker: Arc<CircuitBreaker>,
    events: EventBus,
    config: RouterConfig,
    pending: Mutex<HashMap<CorrelationId, PendingRoute>>,
    queues: Mutex<HashMap<SessionId, TargetQueue>>,
}

impl Router {
    /// Router over `registry`. Register it as a session observer so
    /// disconnects settle its pending routes.
    pub fn new(registry: Arc<Registry>, breaker: Arc<CircuitBreaker>, config: RouterConfig, events: EventBus) -> Self {
        Self {
            registry,
            breaker,
            events,
            config,
            pending: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Route a message.
    ///
    /// - notification: fan out to every target; failures are queued and logged
    /// - request: deliver to the first target; a failed send is queued *and* returned
    /// - request with `requires_response`: as request, then wait for the
    ///   correlated response or the timeout
    pub async fn route(&self, request: RouteRequest) -> Result<RouteReply, ParleyError> {
        let source = self
            .registry
            .get(&request.from_id)
            .ok_or_else(|| ParleyError::routing(format!("unknown source session {}", request.from_id)))?;
        let targets = self.resolve_targets(&source, &request)?;

        let kind = match request.kind {
            RouteKind::Notification => "notification",
            RouteKind::Request if request.requires_response => "request_response",
            RouteKind::Request => "request",
        };
        counter!("routes_total", "kind" => kind).increment(1);
        debug!(from_id = %request.from_id, kind, targets = targets.len(), "routing");

        match request.kind {
            RouteKind::Notification => Ok(self.fan_out(&request, &targets)),
            RouteKind::Request if request.requires_response => self.request_response(&request, &targets[0]).await,
            RouteKind::Request => self.deliver_one(&request, &targets[0]),
        }
    }

    /// Handle an inbound `response` from `from_id`.
    ///
    /// Only the session a request was sent to can complete it. A response
    /// carrying someone else's correlation id leaves that request pending
    /// and is forwarded as unsolicited.
    pub fn handle_response(&self, from_id: &SessionId, payload: ResponsePayload) -> ResponseDisposition {
        if let Some(cid) = payload.correlation_id.as_deref() {
            let pending = {
                let mut pending = self.pending.lock();
                let expected = pending.get(cid).map(|p| p.to_id.clone());
                match expected {
                    Some(to_id) if to_id == *from_id => pending.remove(cid),
                    Some(to_id) => {
                        warn!(correlation_id = cid, expected = %to_id, from_id = %from_id, "response from a session the request was not sent to");
                        None
                    }
                    None => None,
                }
            };
            if let Some(pending) = pending {
                let correlation_id = CorrelationId::from(cid);
                let _ = pending.tx.send(Ok(RouteResponse {
                    correlation_id: correlation_id.clone(),
                    from_id: from_id.clone(),
                    body: payload.body,
                }));
                counter!("route_responses_total", "outcome" => "correlated").increment(1);
                return ResponseDisposition::Correlated(correlation_id);
            }
            debug!(correlation_id = cid, "no pending route for response");
        }

        counter!("route_responses_total", "outcome" => "unsolicited").increment(1);
        let Some(sender) = self.registry.get(from_id) else {
            return ResponseDisposition::Unsolicited { delivered: 0 };
        };
        let envelope = Envelope::with_payload(MessageType::Response, &payload);
        let mut delivered = 0;
        for target in self.registry.list_by_role(sender.role.counterpart()) {
            if self.deliver(&target.id, &envelope).is_ok() {
                delivered += 1;
            } else {
                self.enqueue(&target.id, Priority::Normal, envelope.clone());
            }
        }
        ResponseDisposition::Unsolicited { delivered }
    }

    /// Drain `target`'s queue by priority, then enqueue order.
    ///
    /// A failed send puts that message back at the front and stops; the
    /// rest stay queued in order. Returns how many were delivered.
    pub fn process_queued(&self, target: &SessionId) -> usize {
        let Some(TargetQueue { messages: mut queue, .. }) = self.queues.lock().remove(target) else {
            return 0;
        };
        queue.make_contiguous().sort_by_key(|m| m.priority);

        let mut delivered = 0;
        while let Some(message) = queue.pop_front() {
            if let Err(e) = self.deliver(target, &message.envelope) {
                warn!(session_id = %target, error = %e, remaining = queue.len() + 1, "queue drain stopped");
                queue.push_front(message);
                break;
            }
            delivered += 1;
        }

        if !queue.is_empty() {
            let mut queues = self.queues.lock();
            let slot = &mut queues.entry(target.clone()).or_default().messages;
            let newer = std::mem::replace(slot, queue);
            slot.extend(newer);
            while slot.len() > self.config.queue_capacity {
                let _ = slot.pop_front();
            }
        }
        self.update_queue_gauge();
        if delivered > 0 {
            info!(session_id = %target, delivered, "drained queued messages");
        }
        delivered
    }

    /// Messages queued for `target`.
    pub fn queued_count(&self, target: &SessionId) -> usize {
        self.queues.lock().get(target).map_or(0, |q| q.messages.len())
    }

    /// Messages queued across all targets.
    pub fn total_queued(&self) -> usize {
        self.queues.lock().values().map(|q| q.messages.len()).sum()
    }

    /// Targets that currently have a queue.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Drop queues whose target has been unregistered for longer than the
    /// orphan grace. Returns how many queues were dropped.
    pub fn sweep_orphaned_queues(&self) -> usize {
        let targets: Vec<SessionId> = self.queues.lock().keys().cloned().collect();
        let (present, absent): (Vec<SessionId>, Vec<SessionId>) =
            targets.into_iter().partition(|id| self.registry.get(id).is_some());

        let now = Instant::now();
        let mut dropped = Vec::new();
        {
            let mut queues = self.queues.lock();
            for id in &present {
                if let Some(queue) = queues.get_mut(id) {
                    queue.orphaned_at = None;
                }
            }
            for id in absent {
                let Some(queue) = queues.get_mut(&id) else { continue };
                let since = *queue.orphaned_at.get_or_insert(now);
                if now.duration_since(since) >= self.config.orphan_grace {
                    let messages = queues.remove(&id).map_or(0, |q| q.messages.len());
                    dropped.push((id, messages));
                }
            }
        }

        for (id, messages) in &dropped {
            info!(session_id = %id, dropped = messages, "swept queue for departed session");
            counter!("route_queue_dropped_total").increment(u64::try_from(*messages).unwrap_or(u64::MAX));
        }
        if !dropped.is_empty() {
            self.update_queue_gauge();
        }
        dropped.len()
    }

    /// Periodically sweep orphaned queues and expired circuit keys until
    /// `cancel` fires.
    pub async fn run_queue_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let queues = self.sweep_orphaned_queues();
                    let circuits = self.breaker.sweep();
                    if queues > 0 || circuits > 0 {
                        debug!(queues, circuits, "router sweep");
                    }
                }
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Requests awaiting a correlated response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn resolve_targets(&self, source: &Session, request: &RouteRequest) -> Result<Vec<SessionId>, ParleyError> {
        if let Some(to_id) = &request.to_id {
            if self.registry.get(to_id).is_none() {
                return Err(ParleyError::routing(format!("target session {to_id} not found")));
            }
            return Ok(vec![to_id.clone()]);
        }
        let role = request.to_role.unwrap_or_else(|| source.role.counterpart());
        let targets: Vec<SessionId> = self
            .registry
            .list_by_role(role)
            .into_iter()
            .filter(|s| s.id != source.id)
            .map(|s| s.id)
            .collect();
        if targets.is_empty() {
            return Err(ParleyError::routing(format!("no {role} sessions to route to")));
        }
        Ok(targets)
    }

    fn fan_out(&self, request: &RouteRequest, targets: &[SessionId]) -> RouteReply {
        let envelope = routed_envelope(request, None);
        let mut delivered = Vec::new();
        let mut queued = Vec::new();
        for target in targets {
            match self.deliver(target, &envelope) {
                Ok(()) => delivered.push(target.clone()),
                Err(e) => {
                    warn!(session_id = %target, error = %e, "notification delivery failed, queued");
                    self.enqueue(target, request.priority, envelope.clone());
                    queued.push(target.clone());
                }
            }
        }
        self.emit_routed(request, targets, None);
        RouteReply::Ack { delivered, queued }
    }

    fn deliver_one(&self, request: &RouteRequest, target: &SessionId) -> Result<RouteReply, ParleyError> {
        let envelope = routed_envelope(request, None);
        self.emit_routed(request, std::slice::from_ref(target), None);
        match self.deliver(target, &envelope) {
            Ok(()) => Ok(RouteReply::Ack {
                delivered: vec![target.clone()],
                queued: Vec::new(),
            }),
            Err(e) => {
                self.enqueue(target, request.priority, envelope);
                Err(e)
            }
        }
    }

    async fn request_response(&self, request: &RouteRequest, target: &SessionId) -> Result<RouteReply, ParleyError> {
        let cid = CorrelationId::new();
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let (tx, mut rx) = oneshot::channel();
        let _ = self.pending.lock().insert(
            cid.clone(),
            PendingRoute {
                to_id: target.clone(),
                tx,
            },
        );
        let _guard = PendingGuard { router: self, cid: &cid };

        let envelope = routed_envelope(request, Some(&cid));
        self.emit_routed(request, std::slice::from_ref(target), Some(&cid));
        if let Err(e) = self.deliver(target, &envelope) {
            let _ = self.pending.lock().remove(&cid);
            self.enqueue(target, request.priority, envelope);
            return Err(e);
        }
        debug!(correlation_id = %cid, session_id = %target, ?timeout, "awaiting response");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result.map(RouteReply::Response),
            Ok(Err(_)) => Err(ParleyError::system("pending route dropped")),
            Err(_) => {
                let removed = self.pending.lock().remove(&cid).is_some();
                match rx.try_recv() {
                    Ok(result) if !removed => result.map(RouteReply::Response),
                    _ => {
                        counter!("route_timeouts_total").increment(1);
                        let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                        Err(ParleyError::timeout(format!("response to {cid}"), after_ms))
                    }
                }
            }
        }
    }

    fn deliver(&self, target: &SessionId, envelope: &Envelope) -> Result<(), ParleyError> {
        let key = format!("deliver:{target}");
        self.breaker.check(&key)?;
        match self.registry.send(target, envelope) {
            Ok(()) => {
                self.breaker.record_success(&key);
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure(&key);
                Err(e)
            }
        }
    }

    /// Queue `envelope` for `target`. A failed send may already have removed
    /// the target from the registry; such a queue starts its orphan grace now.
    fn enqueue(&self, target: &SessionId, priority: Priority, envelope: Envelope) {
        let registered = self.registry.get(target).is_some();
        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(target.clone()).or_default();
            if !registered && queue.orphaned_at.is_none() {
                queue.orphaned_at = Some(Instant::now());
            }
            if queue.messages.len() >= self.config.queue_capacity {
                let _ = queue.messages.pop_front();
                counter!("route_queue_dropped_total").increment(1);
                warn!(session_id = %target, capacity = self.config.queue_capacity, "queue full, dropped oldest");
            }
            queue.messages.push_back(QueuedMessage { priority, envelope });
        }
        self.update_queue_gauge();
    }

    fn emit_routed(&self, request: &RouteRequest, targets: &[SessionId], cid: Option<&CorrelationId>) {
        self.events.emit(BrokerEvent::MessageRouted {
            from_id: request.from_id.clone(),
            targets: targets.to_vec(),
            correlation_id: cid.cloned(),
        });
    }

    fn update_queue_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        gauge!("route_queue_depth").set(self.total_queued() as f64);
    }
}

impl SessionObserver for Router {
    fn session_disconnected(&self, session: &Session, reason: &str) {
        let rejected: Vec<PendingRoute> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, p)| p.to_id == session.id)
                .map(|(cid, _)| cid.clone())
                .collect();
            ids.iter().filter_map(|cid| pending.remove(cid)).collect()
        };
        let rejected_count = rejected.len();
        for route in rejected {
            let _ = route.tx.send(Err(ParleyError::Disconnected {
                session_id: session.id.to_string(),
            }));
        }

        let dropped = self.queues.lock().remove(&session.id).map_or(0, |q| q.messages.len());
        if rejected_count > 0 || dropped > 0 {
            info!(session_id = %session.id, reason, rejected = rejected_count, dropped, "cleared routes for disconnected session");
            self.update_queue_gauge();
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct PendingGuard<'a> {
    router: &'a Router,
    cid: &'a CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.router.pending.lock().remove(self.cid);
    }
}

fn routed_envelope(request: &RouteRequest, cid: Option<&CorrelationId>) -> Envelope {
    Envelope::with_payload(
        MessageType::Message,
        &RoutedMessage {
            from_id: request.from_id.to_string(),
            kind: request.kind,
            correlation_id: cid.map(ToString::to_string),
            body: request.body.clone(),
        },
    )
}
