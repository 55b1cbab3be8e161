//! Agent communication protocol for agentmesh.
//!
//! - Message envelopes with correlation IDs
//! - Priorities and well-known message types
//! - Type-keyed publish/subscribe router

pub mod envelope;
pub mod router;
pub mod types;

pub use envelope::Envelope;
pub use router::{DeliveryReport, Handler, HandlerId, Router};
pub use types::{message_types, Priority};
