//! Session registry.
//!
//! A raw connection is held as *pending* until its identify handshake names
//! a role, then promoted to a [`Session`]. The registry exclusively owns each
//! session's transport; other components refer to sessions by id only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use parley_core::errors::ParleyError;
use parley_core::events::BrokerEvent;
use parley_core::ids::{PendingId, SessionId};
use parley_core::settings::BrokerSettings;
use parley_core::wire::{CLEAN_CLOSE_CODE, Envelope, IdentifyPayload, MessageType, Role};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;

/// Frame handed to a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized envelope.
    Text(String),
    /// Close the connection.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// The write side of a peer connection.
pub trait Transport: Send + Sync {
    /// Queue `text` for delivery. `false` if the transport cannot take it.
    fn send(&self, text: String) -> bool;

    /// Whether the transport still reports itself open.
    fn is_alive(&self) -> bool;

    /// Best-effort close. Idempotent.
    fn close(&self, reason: &str);
}

/// [`Transport`] backed by a bounded channel drained by a writer task.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Transport plus the receiver its writer task should drain.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, text: String) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.tx.try_send(Outbound::Text(text)).is_ok()
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.try_send(Outbound::Close {
            code: CLEAN_CLOSE_CODE,
            reason: reason.to_owned(),
        });
    }
}

/// Snapshot of an identified peer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Role from the identify handshake.
    pub role: Role,
    /// Promotion time.
    pub connected_at: DateTime<Utc>,
    /// Last inbound or outbound message.
    pub last_activity: DateTime<Utc>,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Advertised client version.
    pub client_version: String,
    /// Free-form identify metadata.
    pub metadata: Value,
}

/// Synchronous hook run inside [`Registry::disconnect`] before it returns.
pub trait SessionObserver: Send + Sync {
    /// `session` has been removed.
    fn session_disconnected(&self, session: &Session, reason: &str);
}

/// Registry limits and timing.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Admission limit on identified sessions.
    pub max_sessions: usize,
    /// Heartbeat period; a session is stale after three of them.
    pub heartbeat_interval: Duration,
}

impl RegistryConfig {
    /// Values from broker settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            max_sessions: settings.max_sessions,
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&BrokerSettings::default())
    }
}

struct SessionEntry {
    session: Session,
    transport: Arc<dyn Transport>,
    last_seen: Instant,
    seq: u64,
}

#[derive(Default)]
struct State {
    pending: HashMap<PendingId, Arc<dyn Transport>>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_seq: u64,
}

/// Pending connections and identified sessions.
pub struct Registry {
    config: RegistryConfig,
    state: Mutex<State>,
    observers: RwLock<Vec<Weak<dyn SessionObserver>>>,
    events: EventBus,
}

impl Registry {
    /// Empty registry publishing on `events`.
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            observers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Register a disconnect observer. Held weakly.
    pub fn add_observer(&self, observer: &Arc<dyn SessionObserver>) {
        let mut observers = self.observers.write();
        observers.retain(|o| o.strong_count() > 0);
        observers.push(Arc::downgrade(observer));
    }

    /// Hold a raw connection until it identifies.
    pub fn register_pending(&self, transport: Arc<dyn Transport>) -> PendingId {
        let id = PendingId::new();
        let _ = self.state.lock().pending.insert(id.clone(), transport);
        debug!(pending_id = %id, "connection pending identify");
        id
    }

    /// Send to a connection that has not identified yet.
    pub fn send_pending(&self, pending_id: &PendingId, envelope: &Envelope) -> bool {
        let transport = self.state.lock().pending.get(pending_id).cloned();
        transport.is_some_and(|t| t.send(envelope.to_json()))
    }

    /// Drop a pending connection, closing its transport.
    pub fn discard_pending(&self, pending_id: &PendingId, reason: &str) {
        if let Some(transport) = self.state.lock().pending.remove(pending_id) {
            transport.close(reason);
            debug!(pending_id = %pending_id, reason, "pending connection discarded");
        }
    }

    /// Promote a pending connection to a session.
    ///
    /// A requested `sessionId` is reused when no live session holds it.
    /// On capacity failure the connection stays pending so the caller can
    /// report the error before discarding it.
    pub fn promote(&self, pending_id: &PendingId, identify: IdentifyPayload) -> Result<Session, ParleyError> {
        let session = {
            let mut state = self.state.lock();
            if !state.pending.contains_key(pending_id) {
                return Err(ParleyError::PendingNotFound {
                    pending_id: pending_id.to_string(),
                });
            }
            if state.sessions.len() >= self.config.max_sessions {
                counter!("sessions_rejected_total").increment(1);
                return Err(ParleyError::capacity("sessions", self.config.max_sessions));
            }
            let Some(transport) = state.pending.remove(pending_id) else {
                return Err(ParleyError::PendingNotFound {
                    pending_id: pending_id.to_string(),
                });
            };

            let id = match identify.session_id {
                Some(requested) if !requested.is_empty() && !state.sessions.contains_key(requested.as_str()) => {
                    SessionId::from(requested)
                }
                _ => SessionId::new(),
            };
            let now = Utc::now();
            let session = Session {
                id: id.clone(),
                role: identify.role,
                connected_at: now,
                last_activity: now,
                capabilities: identify.capabilities,
                client_version: identify.client_version,
                metadata: identify.metadata.unwrap_or_default(),
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            let _ = state.sessions.insert(
                id,
                SessionEntry {
                    session: session.clone(),
                    transport,
                    last_seen: Instant::now(),
                    seq,
                },
            );
            #[allow(clippy::cast_precision_loss)]
            gauge!("sessions_active").set(state.sessions.len() as f64);
            session
        };

        counter!("sessions_connected_total", "role" => session.role.as_str()).increment(1);
        info!(session_id = %session.id, role = %session.role, "session identified");
        self.events.emit(BrokerEvent::Connected {
            session_id: session.id.clone(),
            role: session.role,
        });
        Ok(session)
    }

    /// Session by id.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.state.lock().sessions.get(id).map(|e| e.session.clone())
    }

    /// Sessions with `role`, in admission order.
    pub fn list_by_role(&self, role: Role) -> Vec<Session> {
        let state = self.state.lock();
        let mut entries: Vec<&SessionEntry> = state.sessions.values().filter(|e| e.session.role == role).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.session.clone()).collect()
    }

    /// Session of `role` with the latest activity; ties go to the earliest admitted.
    pub fn most_recent_active(&self, role: Role) -> Option<Session> {
        let state = self.state.lock();
        state
            .sessions
            .values()
            .filter(|e| e.session.role == role)
            .max_by(|a, b| a.last_seen.cmp(&b.last_seen).then(b.seq.cmp(&a.seq)))
            .map(|e| e.session.clone())
    }

    /// Number of identified sessions.
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether no session is identified.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identified sessions with `role`.
    pub fn count_by_role(&self, role: Role) -> usize {
        self.state.lock().sessions.values().filter(|e| e.session.role == role).count()
    }

    /// Connections still waiting to identify.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Record inbound activity on `id`. Frames the broker sends do not count.
    pub fn touch(&self, id: &SessionId) {
        if let Some(entry) = self.state.lock().sessions.get_mut(id) {
            entry.last_seen = Instant::now();
            entry.session.last_activity = Utc::now();
        }
    }

    /// Send an envelope to a session.
    ///
    /// A transport that is not alive or refuses the frame disconnects the
    /// session with reason `send_failed`.
    pub fn send(&self, id: &SessionId, envelope: &Envelope) -> Result<(), ParleyError> {
        let transport = self
            .state
            .lock()
            .sessions
            .get(id)
            .map(|e| e.transport.clone())
            .ok_or_else(|| ParleyError::SessionNotFound {
                session_id: id.to_string(),
            })?;

        if transport.is_alive() && transport.send(envelope.to_json()) {
            return Ok(());
        }

        warn!(session_id = %id, message_type = %envelope.message_type, "send failed");
        let _ = self.disconnect(id, "send_failed");
        Err(ParleyError::Disconnected {
            session_id: id.to_string(),
        })
    }

    /// Send to every session with `role`; returns how many accepted it.
    pub fn broadcast(&self, role: Role, envelope: &Envelope) -> usize {
        let targets = self.list_by_role(role);
        let mut delivered = 0;
        for target in &targets {
            match self.send(&target.id, envelope) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(session_id = %target.id, error = %e, "broadcast to session failed"),
            }
        }
        debug!(role = %role, recipients = targets.len(), delivered, "broadcast");
        delivered
    }

    /// Remove a session. Returns `false` if it was already gone.
    ///
    /// Observers run before this returns.
    pub fn disconnect(&self, id: &SessionId, reason: &str) -> bool {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.sessions.remove(id);
            #[allow(clippy::cast_precision_loss)]
            gauge!("sessions_active").set(state.sessions.len() as f64);
            entry
        };
        let Some(entry) = entry else {
            debug!(session_id = %id, reason, "disconnect of unknown session ignored");
            return false;
        };

        entry.transport.close(reason);
        counter!("sessions_disconnected_total", "reason" => reason.to_owned()).increment(1);
        info!(session_id = %id, role = %entry.session.role, reason, "session disconnected");

        let observers: Vec<Arc<dyn SessionObserver>> =
            self.observers.read().iter().filter_map(Weak::upgrade).collect();
        for observer in observers {
            observer.session_disconnected(&entry.session, reason);
        }

        self.events.emit(BrokerEvent::Disconnected {
            session_id: entry.session.id,
            role: entry.session.role,
            reason: reason.to_owned(),
        });
        true
    }

    /// Disconnect every session and discard every pending connection.
    pub fn disconnect_all(&self, reason: &str) -> usize {
        let (ids, pending): (Vec<SessionId>, Vec<PendingId>) = {
            let state = self.state.lock();
            (state.sessions.keys().cloned().collect(), state.pending.keys().cloned().collect())
        };
        for pending_id in &pending {
            self.discard_pending(pending_id, reason);
        }
        ids.iter().filter(|id| self.disconnect(id, reason)).count()
    }

    /// One heartbeat pass; returns the sessions removed as stale.
    ///
    /// A session is stale when it has been silent for more than three
    /// intervals *and* its transport reports not alive. Every other session
    /// gets a best-effort `ping` probe.
    pub fn heartbeat_tick(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let stale_after = self.config.heartbeat_interval * 3;
        let snapshot: Vec<(SessionId, Instant, Arc<dyn Transport>)> = self
            .state
            .lock()
            .sessions
            .iter()
            .map(|(id, e)| (id.clone(), e.last_seen, e.transport.clone()))
            .collect();

        let probe = Envelope::new(MessageType::Ping, serde_json::json!({})).to_json();
        let mut stale = Vec::new();
        for (id, last_seen, transport) in snapshot {
            if now.duration_since(last_seen) > stale_after && !transport.is_alive() {
                if self.disconnect(&id, "stale") {
                    stale.push(id);
                }
            } else if !transport.send(probe.clone()) {
                debug!(session_id = %id, "heartbeat probe not delivered");
            }
        }
        stale
    }

    /// Run [`Registry::heartbeat_tick`] every interval until `cancel` fires.
    pub async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stale = self.heartbeat_tick();
                    if !stale.is_empty() {
                        info!(count = stale.len(), "removed stale sessions");
                    }
                }
                () = cancel.cancelled() => return,
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
