//! # parley-broker
//!
//! The in-process broker core.
//!
//! - [`registry`]: pending connections, identified sessions, heartbeat
//! - [`interactions`]: the `Pending → Resolved | TimedOut | Cancelled` state machine and its waiters
//! - [`router`]: target resolution, request/response correlation, per-target outbound queues
//! - [`tools`]: the fixed tool-calling surface exposed to requesters
//! - [`broker`]: wires the above together and dispatches inbound envelopes
//!
//! Each registry is guarded by its own lock and never exposes its map.
//! Locks are released before any call into another component.

#![deny(unsafe_code)]

pub mod broker;
pub mod events;
pub mod interactions;
pub mod registry;
pub mod router;
pub mod tools;

pub use broker::{Broker, BrokerSnapshot, Peer, SessionCounts};
pub use events::EventBus;
pub use interactions::{InteractionConfig, InteractionManager, Settlement};
pub use registry::{ChannelTransport, Outbound, Registry, RegistryConfig, Session, SessionObserver, Transport};
pub use router::{ResponseDisposition, RouteReply, RouteRequest, RouteResponse, Router, RouterConfig};
pub use tools::{OperationDescriptor, ToolContext, ToolFailure, ToolOperation, ToolSurface};
