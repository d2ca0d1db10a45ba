//! The per-process broadcast hub.
//!
//! Exactly one [`BroadcastHub`] exists per client process, constructor-
//! injected into every component that needs to broadcast or observe session
//! traffic (never a global). Outbound state changes leave through the typed
//! `broadcast_*` methods; inbound envelopes land on an unbounded marshaling
//! queue that the tick thread drains via [`BroadcastHub::pump`], which
//! re-dispatches each decoded [`SyncEvent`] synchronously to every
//! subscriber. A missing subscriber is not an error.

use cospace_transform::sanitize_orientation;
use cospace_types::{
    EntityId, Envelope, PeerId, Pose, PoseSample, ReferenceFrame, SyncError, SyncMessage, WireQuat,
    WireVec3,
};
use nalgebra::{UnitQuaternion, Vector3};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{trace, warn};

use crate::transport::{Delivery, SessionTransport};

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// A received message, decoded and sanitized, as seen by local subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A peer announced (or re-announced) its reference frame.
    ReferenceReceived { peer: PeerId, frame: ReferenceFrame },
    /// A peer finished an operator-driven anchor reposition.
    AlignmentUpdated {
        peer: PeerId,
        position: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        scale: Vector3<f32>,
    },
    /// A peer entered or left calibration mode. Level-triggered: a late
    /// notification simply reflects the sender's current state.
    ModeChanged { peer: PeerId, enabled: bool },
    /// A raw pose sample for one of a peer's entities, still in the
    /// sender's reference frame.
    PoseReceived {
        peer: PeerId,
        entity: EntityId,
        sample: PoseSample,
    },
}

/// Handle for deterministic unregistration of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnMut(&SyncEvent)>;

// ────────────────────────────────────────────────────────────────────────────
// BroadcastHub
// ────────────────────────────────────────────────────────────────────────────

pub struct BroadcastHub {
    local_peer: PeerId,
    transport: Option<Box<dyn SessionTransport>>,
    inbound_tx: UnboundedSender<Envelope>,
    inbound_rx: UnboundedReceiver<Envelope>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

impl BroadcastHub {
    pub fn new(local_peer: PeerId) -> Self {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        Self {
            local_peer,
            transport: None,
            inbound_tx,
            inbound_rx,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Attach the outbound half of a session. The transport (or the session
    /// it belongs to) delivers inbound envelopes through
    /// [`BroadcastHub::delivery_sender`].
    pub fn attach(&mut self, transport: Box<dyn SessionTransport>) {
        self.transport = Some(transport);
    }

    pub fn detach(&mut self) {
        self.transport = None;
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    /// The sender a transport pushes received envelopes into. Safe to call
    /// from a delivery thread; the tick thread drains it in
    /// [`BroadcastHub::pump`].
    pub fn delivery_sender(&self) -> UnboundedSender<Envelope> {
        self.inbound_tx.clone()
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    /// Announce this client's reference frame. Durable: late joiners must
    /// still receive it.
    pub fn broadcast_reference(
        &self,
        origin: Vector3<f32>,
        orientation: UnitQuaternion<f32>,
    ) -> Result<(), SyncError> {
        self.send(
            SyncMessage::ReferenceAnnouncement {
                origin: origin.into(),
                orientation: orientation.into(),
            },
            Delivery::Durable,
        )
    }

    /// Broadcast an operator-driven anchor update. Durable: a late joiner
    /// needs the current anchor state.
    pub fn broadcast_alignment_update(
        &self,
        position: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        scale: Vector3<f32>,
    ) -> Result<(), SyncError> {
        self.send(
            SyncMessage::AlignmentUpdate {
                position: position.into(),
                rotation: rotation.into(),
                scale: scale.into(),
            },
            Delivery::Durable,
        )
    }

    /// Advisory calibration-mode notification, current peers only.
    pub fn broadcast_mode_changed(&self, enabled: bool) -> Result<(), SyncError> {
        self.send(SyncMessage::ModeChanged { enabled }, Delivery::BestEffort)
    }

    /// Send one raw pose sample for a local entity.
    pub fn broadcast_pose(&self, entity: EntityId, pose: &Pose) -> Result<(), SyncError> {
        self.send(
            SyncMessage::PoseUpdate {
                entity,
                position: pose.position.into(),
                rotation: pose.rotation.into(),
            },
            Delivery::BestEffort,
        )
    }

    fn send(&self, message: SyncMessage, delivery: Delivery) -> Result<(), SyncError> {
        let Some(transport) = self.transport.as_ref() else {
            // Dropped, not retried: the next state-changing event broadcasts
            // again.
            warn!(peer = %self.local_peer, "broadcast while not attached to a session, dropping");
            return Err(SyncError::NotConnected);
        };
        transport.send(Envelope::new(self.local_peer, message), delivery)
    }

    // ── Subscribers ─────────────────────────────────────────────────────────

    /// Register a callback invoked synchronously, on the tick thread, for
    /// every event [`BroadcastHub::pump`] decodes.
    pub fn subscribe(&mut self, callback: impl FnMut(&SyncEvent) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Remove a subscriber. Unknown ids are ignored, so teardown order
    /// never matters.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|(sub, _)| *sub != id);
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    /// Drain the marshaling queue on the tick thread.
    ///
    /// Each envelope is decoded into a [`SyncEvent`] (orientations
    /// sanitized at this boundary), dispatched to every subscriber in
    /// registration order, and returned to the caller driving the engine.
    /// Envelopes this process sent itself are skipped; durable replay can
    /// hand them back after a rejoin.
    pub fn pump(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = self.inbound_rx.try_recv() {
            if envelope.sender == self.local_peer {
                trace!(id = %envelope.id, "skipping self-sent envelope");
                continue;
            }
            events.push(decode_event(envelope));
        }
        for event in &events {
            for (_, subscriber) in self.subscribers.iter_mut() {
                subscriber(event);
            }
        }
        events
    }
}

fn unit(q: WireQuat) -> UnitQuaternion<f32> {
    sanitize_orientation(q.into())
}

fn vec3(v: WireVec3) -> Vector3<f32> {
    v.into()
}

fn decode_event(envelope: Envelope) -> SyncEvent {
    let peer = envelope.sender;
    match envelope.message {
        SyncMessage::ReferenceAnnouncement { origin, orientation } => SyncEvent::ReferenceReceived {
            peer,
            frame: ReferenceFrame::new(vec3(origin), unit(orientation)),
        },
        SyncMessage::AlignmentUpdate {
            position,
            rotation,
            scale,
        } => SyncEvent::AlignmentUpdated {
            peer,
            position: vec3(position),
            rotation: unit(rotation),
            scale: vec3(scale),
        },
        SyncMessage::ModeChanged { enabled } => SyncEvent::ModeChanged { peer, enabled },
        SyncMessage::PoseUpdate {
            entity,
            position,
            rotation,
        } => SyncEvent::PoseReceived {
            peer,
            entity,
            sample: PoseSample::new(
                Pose::new(vec3(position), unit(rotation)),
                envelope.timestamp,
            ),
        },
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const ME: PeerId = PeerId(1);
    const OTHER: PeerId = PeerId(2);

    #[test]
    fn broadcast_without_session_reports_not_connected() {
        let hub = BroadcastHub::new(ME);
        let err = hub
            .broadcast_reference(Vector3::zeros(), UnitQuaternion::identity())
            .unwrap_err();
        assert_eq!(err, SyncError::NotConnected);
    }

    #[test]
    fn pump_dispatches_to_subscribers_in_order() {
        let mut hub = BroadcastHub::new(ME);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen_a = seen.clone();
        hub.subscribe(move |event| {
            if let SyncEvent::ModeChanged { enabled, .. } = event {
                seen_a.borrow_mut().push(("a", *enabled));
            }
        });
        let seen_b = seen.clone();
        hub.subscribe(move |event| {
            if let SyncEvent::ModeChanged { enabled, .. } = event {
                seen_b.borrow_mut().push(("b", *enabled));
            }
        });

        hub.delivery_sender()
            .send(Envelope::new(OTHER, SyncMessage::ModeChanged { enabled: true }))
            .unwrap();
        let events = hub.pump();

        assert_eq!(events.len(), 1);
        assert_eq!(*seen.borrow(), vec![("a", true), ("b", true)]);
    }

    #[test]
    fn unsubscribe_stops_dispatch() {
        let mut hub = BroadcastHub::new(ME);
        let count = Rc::new(RefCell::new(0u32));

        let count_in = count.clone();
        let id = hub.subscribe(move |_| *count_in.borrow_mut() += 1);

        hub.delivery_sender()
            .send(Envelope::new(OTHER, SyncMessage::ModeChanged { enabled: true }))
            .unwrap();
        hub.pump();
        hub.unsubscribe(id);
        hub.delivery_sender()
            .send(Envelope::new(OTHER, SyncMessage::ModeChanged { enabled: false }))
            .unwrap();
        hub.pump();

        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn self_sent_envelopes_are_skipped() {
        let mut hub = BroadcastHub::new(ME);
        hub.delivery_sender()
            .send(Envelope::new(ME, SyncMessage::ModeChanged { enabled: true }))
            .unwrap();
        assert!(hub.pump().is_empty());
    }

    #[test]
    fn degenerate_wire_orientation_decodes_as_identity() {
        let mut hub = BroadcastHub::new(ME);
        hub.delivery_sender()
            .send(Envelope::new(
                OTHER,
                SyncMessage::ReferenceAnnouncement {
                    origin: WireVec3::ZERO,
                    orientation: WireQuat::new(0.0, 0.0, 0.0, 0.0),
                },
            ))
            .unwrap();
        let events = hub.pump();
        match &events[0] {
            SyncEvent::ReferenceReceived { frame, .. } => {
                assert_eq!(frame.orientation, UnitQuaternion::identity());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
