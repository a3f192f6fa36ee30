//! # parley-core
//!
//! Shared vocabulary for the parley broker, which lets tool-calling requester
//! peers ask UI-hosting responder peers for an interaction and receive a
//! correlated answer.
//!
//! - **Branded IDs**: `SessionId`, `InteractionId`, `CorrelationId`, ... as newtypes
//! - **Errors**: [`ParleyError`] with the connection/protocol/routing/timeout/capacity/system taxonomy
//! - **Wire**: the `{type, id, payload, timestamp}` peer envelope and its payloads
//! - **Interactions**: specs, results and the terminal-once status enum
//! - **Events**: the closed set of broker events
//! - **Settings**: defaults, JSON file merge and `PARLEY_*` env overrides
//! - **Logging**: `tracing-subscriber` initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod interaction;
pub mod logging;
pub mod settings;
pub mod wire;

pub use errors::{ErrorKind, ParleyError, Result};
pub use events::BrokerEvent;
pub use ids::{CorrelationId, InteractionId, MessageId, PendingId, SessionId};
pub use interaction::{Interaction, InteractionResult, InteractionSpec, InteractionStatus};
pub use wire::{Envelope, MessageType, Role};
