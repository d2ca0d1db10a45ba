//! In-process session for tests and headless demos.
//!
//! [`MemorySession`] stands in for a real networked session so the full
//! engine stack can run in CI without any transport: every joined hub's
//! broadcasts fan out to every other joined hub, and durable messages are
//! kept in a replay log that late joiners receive in original send order.
//!
//! # Example
//!
//! ```rust
//! use cospace_net::{BroadcastHub, MemorySession};
//! use cospace_types::PeerId;
//! use nalgebra::{UnitQuaternion, Vector3};
//!
//! let session = MemorySession::new();
//!
//! let mut a = BroadcastHub::new(PeerId(1));
//! session.join(&mut a);
//! a.broadcast_reference(Vector3::zeros(), UnitQuaternion::identity()).unwrap();
//!
//! // B joins after A's announcement and still receives it.
//! let mut b = BroadcastHub::new(PeerId(2));
//! session.join(&mut b);
//! assert_eq!(b.pump().len(), 1);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cospace_types::{Envelope, PeerId, SyncError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::hub::BroadcastHub;
use crate::transport::{Delivery, SessionTransport};

#[derive(Debug, Default)]
struct SessionInner {
    /// Durable messages in send order, replayed to every late joiner.
    durable_log: Vec<Envelope>,
    /// Delivery queue of every currently joined peer.
    peers: HashMap<PeerId, UnboundedSender<Envelope>>,
}

/// A shared in-memory session. Clone it cheaply; all clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    inner: Arc<Mutex<SessionInner>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `hub` to the session: replay the durable log into its delivery
    /// queue, register it for future fan-out, and attach the outbound link.
    pub fn join(&self, hub: &mut BroadcastHub) {
        let peer = hub.local_peer();
        let sender = hub.delivery_sender();
        {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            for envelope in &inner.durable_log {
                // The hub filters envelopes it originally sent itself.
                let _ = sender.send(envelope.clone());
            }
            inner.peers.insert(peer, sender);
        }
        debug!(%peer, "joined in-memory session");
        hub.attach(Box::new(MemoryLink {
            inner: self.inner.clone(),
        }));
    }

    /// Remove a peer's delivery queue. Its hub keeps its transport handle
    /// until it detaches, but nothing is delivered to it any more.
    pub fn leave(&self, peer: PeerId) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        inner.peers.remove(&peer);
        debug!(%peer, "left in-memory session");
    }

    /// Number of retained durable messages.
    pub fn durable_len(&self) -> usize {
        self.inner.lock().expect("session lock poisoned").durable_log.len()
    }
}

struct MemoryLink {
    inner: Arc<Mutex<SessionInner>>,
}

impl SessionTransport for MemoryLink {
    fn send(&self, envelope: Envelope, delivery: Delivery) -> Result<(), SyncError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| SyncError::Channel(e.to_string()))?;
        if delivery == Delivery::Durable {
            inner.durable_log.push(envelope.clone());
        }
        for (peer, sender) in &inner.peers {
            if sender.send(envelope.clone()).is_err() {
                warn!(%peer, "dropping envelope for disconnected peer");
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
