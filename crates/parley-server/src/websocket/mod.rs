//! `WebSocket` peer sessions.

pub mod session;
