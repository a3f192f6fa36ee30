//! # parley-bridge
//!
//! Peer-side client for the parley broker. It speaks the same wire handshake
//! as any responder (or requester) and survives broker restarts:
//!
//! - [`config`]: URL, role, timeouts and the reconnect policy
//! - [`connector`]: the [`Connector`] seam plus the `tokio-tungstenite` implementation
//! - [`client`]: [`BridgeClient`] with its state machine, liveness probe and reconnect loop
//!
//! The client depends only on `parley-core`; it never links the broker.

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod connector;

pub use client::{BridgeClient, BridgeEvent, BridgeState};
pub use config::{BridgeConfig, BridgeConfigError};
pub use connector::{Connection, Connector, Frame, WsConnector};
