//! Reconnecting bridge client.
//!
//! Opens a transport, performs the identify handshake and keeps the
//! connection alive with periodic `ping` envelopes. An unclean close (any
//! close code other than 1000, or a transport error) triggers reconnection
//! with `base * 2^(attempt - 1)` delays until the attempt budget is spent;
//! the client then reports a fatal error and stays in
//! [`BridgeState::Failed`]. [`BridgeClient::disconnect`] is always clean and
//! never reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use parley_core::errors::ParleyError;
use parley_core::interaction::InteractionResult;
use parley_core::wire::{
    CLEAN_CLOSE_CODE, Envelope, ErrorBody, IdentifyPayload, InteractionRequestPayload, MessageType, ResponsePayload,
    RoutedMessage, StatusPayload, WelcomePayload, parse_envelope,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, BridgeConfigError};
use crate::connector::{Connector, Frame, WsConnector};

const EVENT_CAPACITY: usize = 64;

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    /// Not connected and not trying to.
    Disconnected,
    /// Initial connect in progress.
    Connecting,
    /// Handshake sent; traffic flows.
    Connected,
    /// Waiting out a backoff delay or retrying.
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
}

/// What the client reports to its consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    /// Transport open and identify sent.
    Connected,
    /// The broker accepted the handshake.
    Welcome(WelcomePayload),
    /// Transport closed.
    Disconnected {
        /// Closed by us or with the clean code.
        clean: bool,
        /// Why.
        reason: String,
    },
    /// About to retry after `delay`.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff before this attempt.
        delay: Duration,
    },
    /// Attempts exhausted; the client gave up.
    Failed {
        /// Attempts made.
        attempts: u32,
    },
    /// An interaction to render.
    InteractionRequest(InteractionRequestPayload),
    /// A routed message.
    Message(RoutedMessage),
    /// A response addressed to this peer.
    Response(ResponsePayload),
    /// Broker status notification.
    Status(StatusPayload),
    /// Broker error notification.
    Error(ErrorBody),
}

enum ConnectionEnd {
    Cancelled,
    Clean(String),
    Unclean(String),
}

struct Inner {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    state: RwLock<BridgeState>,
    session_id: RwLock<Option<String>>,
    last_status: RwLock<Option<StatusPayload>>,
    last_error: RwLock<Option<ErrorBody>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    cancel: Mutex<CancellationToken>,
    attempts: AtomicU32,
    events: broadcast::Sender<BridgeEvent>,
}

/// Peer-side client for the broker protocol.
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    /// WebSocket client for `config`.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeConfigError> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Client over a custom transport.
    pub fn with_connector(config: BridgeConfig, connector: Arc<dyn Connector>) -> Result<Self, BridgeConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: RwLock::new(BridgeState::Disconnected),
                session_id: RwLock::new(None),
                last_status: RwLock::new(None),
                last_error: RwLock::new(None),
                outbound: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                attempts: AtomicU32::new(0),
                events,
            }),
        })
    }

    /// Open the transport and send the identify handshake.
    ///
    /// Fails with a timeout if the transport does not open within
    /// `connect_timeout`. A failed initial connect does not reconnect.
    pub async fn connect(&self) -> Result<(), ParleyError> {
        if matches!(self.state(), BridgeState::Connected | BridgeState::Reconnecting) {
            debug!("bridge already connected");
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();
        self.inner.set_state(BridgeState::Connecting);

        match self.inner.open(&cancel).await {
            Ok(incoming) => {
                let _ = tokio::spawn(self.inner.clone().drive(incoming, cancel));
                Ok(())
            }
            Err(err) if cancel.is_cancelled() => {
                debug!(error = %err, "bridge connect abandoned");
                Err(err)
            }
            Err(err) => {
                error!(url = %self.inner.config.url, error = %err, "bridge connect failed");
                self.inner.set_state(BridgeState::Disconnected);
                self.inner.emit(BridgeEvent::Disconnected {
                    clean: false,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Close cleanly. Sends a best-effort `disconnecting` status, closes with
    /// the clean code and cancels every timer. Never reconnects.
    pub fn disconnect(&self) {
        self.inner.cancel.lock().cancel();
        let outbound = self.inner.outbound.lock().take();
        if let Some(tx) = outbound {
            let status = Envelope::with_payload(
                MessageType::Status,
                &StatusPayload {
                    status: "disconnecting".into(),
                    message: None,
                },
            );
            let _ = tx.try_send(Frame::Text(status.to_json()));
            let _ = tx.try_send(Frame::Close {
                code: CLEAN_CLOSE_CODE,
                reason: "client disconnect".into(),
            });
        }
        if self.state() != BridgeState::Disconnected {
            self.inner.set_state(BridgeState::Disconnected);
            self.inner.emit(BridgeEvent::Disconnected {
                clean: true,
                reason: "client disconnect".into(),
            });
            info!("bridge disconnected");
        }
    }

    /// Answer an interaction. Logged and dropped when not connected.
    pub fn send_response(&self, interaction_id: &str, result: &InteractionResult) -> bool {
        let payload = ResponsePayload {
            correlation_id: None,
            interaction_id: Some(interaction_id.to_owned()),
            body: serde_json::to_value(result).unwrap_or_default(),
        };
        self.send(&Envelope::with_payload(MessageType::Response, &payload))
    }

    /// Answer a routed request by correlation id.
    pub fn reply(&self, correlation_id: &str, body: Value) -> bool {
        let payload = ResponsePayload {
            correlation_id: Some(correlation_id.to_owned()),
            interaction_id: None,
            body,
        };
        self.send(&Envelope::with_payload(MessageType::Response, &payload))
    }

    /// Send any envelope. Logged and dropped when not connected.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.inner.send(envelope)
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        *self.inner.state.read()
    }

    /// Session id assigned by the broker's welcome.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    /// Most recent broker status.
    pub fn last_status(&self) -> Option<StatusPayload> {
        self.inner.last_status.read().clone()
    }

    /// Most recent broker error.
    pub fn last_error(&self) -> Option<ErrorBody> {
        self.inner.last_error.read().clone()
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.inner.cancel.lock().cancel();
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn set_state(&self, state: BridgeState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "bridge state");
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, envelope: &Envelope) -> bool {
        if *self.state.read() != BridgeState::Connected {
            error!(message_type = %envelope.message_type, "bridge not connected, message dropped");
            return false;
        }
        let sent = self
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.try_send(Frame::Text(envelope.to_json())).is_ok());
        if !sent {
            warn!(message_type = %envelope.message_type, "bridge transport rejected message");
        }
        sent
    }

    /// Open a transport within the connect timeout and send identify.
    async fn open(&self, cancel: &CancellationToken) -> Result<mpsc::Receiver<Frame>, ParleyError> {
        let timeout = self.config.connect_timeout;
        let connection = match tokio::time::timeout(timeout, self.connector.connect(&self.config.url)).await {
            Ok(result) => result?,
            Err(_) => {
                let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(ParleyError::timeout("bridge connect", after_ms));
            }
        };

        self.attempts.store(0, Ordering::Relaxed);
        let identify = Envelope::with_payload(
            MessageType::Identify,
            &IdentifyPayload {
                role: self.config.role,
                capabilities: self.config.capabilities.clone(),
                client_version: self.config.client_version.clone(),
                session_id: self.session_id.read().clone(),
                metadata: None,
            },
        );
        if connection.outgoing.try_send(Frame::Text(identify.to_json())).is_err() {
            return Err(ParleyError::connection("identify handshake not sent"));
        }
        {
            // `disconnect` cancels before taking the sender, so checking under
            // the same lock leaves no window for a cancelled client to commit.
            let mut outbound = self.outbound.lock();
            if cancel.is_cancelled() {
                let _ = connection.outgoing.try_send(Frame::Close {
                    code: CLEAN_CLOSE_CODE,
                    reason: "client disconnect".into(),
                });
                return Err(ParleyError::connection("bridge disconnected while connecting"));
            }
            *outbound = Some(connection.outgoing);
            self.set_state(BridgeState::Connected);
        }
        info!(url = %self.config.url, role = %self.config.role, "bridge connected");
        self.emit(BridgeEvent::Connected);
        Ok(connection.incoming)
    }

    /// Pump connections until a clean close, a cancel, or exhaustion.
    async fn drive(self: Arc<Self>, mut incoming: mpsc::Receiver<Frame>, cancel: CancellationToken) {
        loop {
            match self.pump(&mut incoming, &cancel).await {
                ConnectionEnd::Cancelled => return,
                ConnectionEnd::Clean(reason) => {
                    info!(reason, "broker closed the connection");
                    let _ = self.outbound.lock().take();
                    self.set_state(BridgeState::Disconnected);
                    self.emit(BridgeEvent::Disconnected { clean: true, reason });
                    return;
                }
                ConnectionEnd::Unclean(reason) => {
                    warn!(reason, "bridge connection lost");
                    let _ = self.outbound.lock().take();
                    self.emit(BridgeEvent::Disconnected { clean: false, reason });
                    match self.reconnect(&cancel).await {
                        Some(next) => incoming = next,
                        None => return,
                    }
                }
            }
        }
    }

    async fn pump(&self, incoming: &mut mpsc::Receiver<Frame>, cancel: &CancellationToken) -> ConnectionEnd {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return ConnectionEnd::Cancelled,
                frame = incoming.recv() => match frame {
                    Some(Frame::Text(text)) => self.handle_inbound(&text),
                    Some(Frame::Close { code, reason }) if code == CLEAN_CLOSE_CODE => {
                        return ConnectionEnd::Clean(reason);
                    }
                    Some(Frame::Close { code, reason }) => {
                        return ConnectionEnd::Unclean(format!("closed with code {code}: {reason}"));
                    }
                    None => return ConnectionEnd::Unclean("transport error".into()),
                },
                _ = ping.tick() => {
                    let _ = self.send(&Envelope::new(MessageType::Ping, json!({})));
                }
            }
        }
    }

    /// Retry with exponential delays. `None` when cancelled or exhausted.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<mpsc::Receiver<Frame>> {
        self.set_state(BridgeState::Reconnecting);
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt > self.config.max_reconnect_attempts {
                let attempts = attempt - 1;
                error!(attempts, url = %self.config.url, "bridge reconnect attempts exhausted, giving up");
                self.attempts.store(attempts, Ordering::Relaxed);
                self.set_state(BridgeState::Failed);
                self.emit(BridgeEvent::Failed { attempts });
                return None;
            }

            let delay = self.config.reconnect_delay(attempt);
            counter!("bridge_reconnects_total").increment(1);
            info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "bridge reconnecting"
            );
            self.emit(BridgeEvent::Reconnecting { attempt, delay });
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return None,
            }

            let opened = tokio::select! {
                result = self.open(cancel) => result,
                () = cancel.cancelled() => return None,
            };
            match opened {
                Ok(incoming) => return Some(incoming),
                Err(_) if cancel.is_cancelled() => return None,
                Err(err) => warn!(attempt, error = %err, "bridge reconnect failed"),
            }
        }
    }

    fn handle_inbound(&self, text: &str) {
        let envelope = match parse_envelope(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "invalid envelope from broker");
                return;
            }
        };
        match envelope.message_type {
            MessageType::Welcome => {
                if let Some(welcome) = self.decode::<WelcomePayload>(&envelope) {
                    *self.session_id.write() = Some(welcome.session_id.clone());
                    debug!(session_id = %welcome.session_id, "bridge welcomed");
                    self.emit(BridgeEvent::Welcome(welcome));
                }
            }
            MessageType::InteractionRequest => {
                if let Some(request) = self.decode::<InteractionRequestPayload>(&envelope) {
                    debug!(interaction_id = %request.interaction_id, "interaction request");
                    self.emit(BridgeEvent::InteractionRequest(request));
                }
            }
            MessageType::Message => {
                if let Some(message) = self.decode::<RoutedMessage>(&envelope) {
                    self.emit(BridgeEvent::Message(message));
                }
            }
            MessageType::Response => {
                if let Some(response) = self.decode::<ResponsePayload>(&envelope) {
                    self.emit(BridgeEvent::Response(response));
                }
            }
            MessageType::Status => {
                if let Some(status) = self.decode::<StatusPayload>(&envelope) {
                    *self.last_status.write() = Some(status.clone());
                    self.emit(BridgeEvent::Status(status));
                }
            }
            MessageType::Error => {
                if let Some(body) = self.decode::<ErrorBody>(&envelope) {
                    warn!(code = %body.code, message = %body.message, "broker reported an error");
                    *self.last_error.write() = Some(body.clone());
                    self.emit(BridgeEvent::Error(body));
                }
            }
            MessageType::Ping => {
                let _ = self.send(&Envelope::new(MessageType::Pong, json!({})));
            }
            other => debug!(message_type = %other, "ignored envelope"),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, envelope: &Envelope) -> Option<T> {
        match envelope.payload_as() {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(message_type = %envelope.message_type, error = %err, "invalid payload from broker");
                None
            }
        }
    }
}
