//! # parley-server
//!
//! Axum HTTP + `WebSocket` host for the parley broker.
//!
//! - `/ws`: peer connections, one [`websocket::session`] per socket feeding the broker
//! - `/health`: broker status, uptime, session counts, queues and circuits
//! - `/metrics`: Prometheus text, only when diagnostics are enabled
//! - Graceful shutdown via [`shutdown::ShutdownCoordinator`]

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, ParleyServer, ServerError};
pub use shutdown::{DrainReport, ShutdownCoordinator};
