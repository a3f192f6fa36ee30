//! `WebSocket` session lifecycle: one connected peer from upgrade through
//! disconnect.
//!
//! Inbound text frames go to [`Broker::handle_text`]; everything the broker
//! sends to the peer arrives through a [`ChannelTransport`] drained by a
//! writer task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use parley_broker::{Broker, ChannelTransport, Outbound, Peer};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// How long the writer gets to flush a close frame after the read side ends.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Run a `WebSocket` session for a connected peer.
///
/// 1. Registers the connection with the broker as pending
/// 2. Feeds text (and UTF-8 binary) frames to the broker
/// 3. Forwards outbound envelopes and close requests to the socket
/// 4. Ends when the peer closes, the broker closes the transport, or the
///    broker reports the peer gone
/// 5. Removes the peer from the broker
#[instrument(skip_all, fields(peer))]
pub async fn run_ws_session(ws: WebSocket, broker: Arc<Broker>, queue_capacity: usize) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (transport, outbound_rx) = ChannelTransport::new(queue_capacity);
    let mut peer = broker.connect(transport.clone());
    if let Peer::Pending(id) = &peer {
        let _ = tracing::Span::current().record("peer", tracing::field::display(id));
    }

    let connection_start = Instant::now();
    info!("peer connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(forward_outbound(outbound_rx, ws_tx));
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                debug!("writer finished");
                break;
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(t) => Some(t.as_str().to_owned()),
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(s) => Some(s.to_owned()),
                        Err(_) => {
                            debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                            None
                        }
                    },
                    Message::Close(_) => {
                        info!("peer sent close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => None,
                };
                let Some(text) = text else { continue };
                if !broker.handle_text(&mut peer, &text) {
                    debug!("broker released peer");
                    break;
                }
            }
        }
    }

    broker.disconnect_peer(&peer, "connection closed");
    drop(transport);
    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(session_id = ?peer.session_id(), "peer disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}

/// Drain the transport channel into the socket until a close is requested,
/// the channel closes, or the socket fails.
async fn forward_outbound(mut rx: mpsc::Receiver<Outbound>, mut ws_tx: SplitSink<WebSocket, Message>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let close = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close))).await;
                break;
            }
        }
    }
}
