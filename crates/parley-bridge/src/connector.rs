//! Transport abstraction for the bridge.
//!
//! The client speaks [`Frame`]s over a pair of channels; a [`Connector`]
//! produces one such [`Connection`] per attempt. [`WsConnector`] pumps frames
//! to and from a `tokio-tungstenite` socket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_core::errors::ParleyError;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_CAPACITY: usize = 256;

/// Close code reported when the peer closed without a status.
pub const NO_STATUS_CODE: u16 = 1005;

/// One unit on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Text payload.
    Text(String),
    /// Close handshake.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// One end of an open transport.
///
/// When `incoming` yields `None` the transport failed without a close frame.
#[derive(Debug)]
pub struct Connection {
    /// Frames to the other end.
    pub outgoing: mpsc::Sender<Frame>,
    /// Frames from the other end.
    pub incoming: mpsc::Receiver<Frame>,
}

impl Connection {
    /// Two connected in-memory ends.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Self {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url`. Returns once it is open.
    async fn connect(&self, url: &str) -> Result<Connection, ParleyError>;
}

/// WebSocket connector.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, ParleyError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ParleyError::connection(format!("websocket connect to {url}: {e}")))?;
        let (client, transport) = Connection::pair(FRAME_CAPACITY);
        let _ = tokio::spawn(pump(ws, transport));
        Ok(client)
    }
}

async fn pump(ws: WsStream, mut transport: Connection) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            frame = transport.incoming.recv() => match frame {
                Some(Frame::Text(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Frame::Close { code, reason }) => {
                    let close = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    break;
                }
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if transport.outgoing.send(Frame::Text(text.as_str().to_owned())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((NO_STATUS_CODE, String::new()), |f| {
                        (u16::from(f.code), f.reason.as_str().to_owned())
                    });
                    let _ = transport.outgoing.send(Frame::Close { code, reason }).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    break;
                }
                None => break,
            },
        }
    }
}
