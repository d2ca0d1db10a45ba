//! The transport seam.
//!
//! A real deployment plugs a relay-backed or room-based transport in here;
//! tests and demos use [`crate::memory::MemorySession`]. Either way the hub
//! only ever sees this trait.

use cospace_types::{Envelope, SyncError};

/// Delivery durability the hub demands per message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Retained by the session and replayed to peers that join later.
    /// Required for reference announcements: alignment is typically
    /// established once near process start, and a late joiner has no other
    /// way to learn it.
    Durable,
    /// Delivered to currently-connected peers only. Suitable for advisory
    /// notifications and high-rate pose samples.
    BestEffort,
}

/// Outbound half of a session.
///
/// Implementations must deliver envelopes to every *other* joined peer in
/// send order, honouring [`Delivery::Durable`] replay for late joiners.
/// Inbound delivery happens by pushing envelopes into the sender obtained
/// from [`crate::hub::BroadcastHub::delivery_sender`]; that queue is what
/// marshals transport-thread callbacks onto the tick thread.
pub trait SessionTransport {
    fn send(&self, envelope: Envelope, delivery: Delivery) -> Result<(), SyncError>;
}
