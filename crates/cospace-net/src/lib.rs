//! `cospace-net` – the sole boundary between the sync engine and the
//! network transport.
//!
//! No other crate in the workspace touches transport addressing or session
//! concepts; they all go through the [`BroadcastHub`] and its synchronous
//! event interface, which is what keeps the rest of the engine testable
//! without a network.
//!
//! # Modules
//!
//! - [`transport`] – the [`SessionTransport`] seam and per-message
//!   delivery-durability tags.
//! - [`hub`] – the per-process [`BroadcastHub`]: outbound broadcasts,
//!   inbound marshaling queue, observer registry.
//! - [`memory`] – an in-process session with durable replay, for tests and
//!   headless demos.

pub mod hub;
pub mod memory;
pub mod transport;

pub use hub::{BroadcastHub, SubscriptionId, SyncEvent};
pub use memory::MemorySession;
pub use transport::{Delivery, SessionTransport};
