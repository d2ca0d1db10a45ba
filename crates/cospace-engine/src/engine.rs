//! The tick-driven session engine.
//!
//! [`SyncEngine`] owns the one [`BroadcastHub`], the [`FrameRegistry`], and
//! a pipeline per remote entity. Everything mutable lives on the tick
//! thread; network delivery threads only ever touch the hub's marshaling
//! queue. One [`SyncEngine::tick`] per render frame routes received events
//! and advances every entity's interpolation.

use std::collections::HashMap;

use cospace_alignment::FrameRegistry;
use cospace_net::{BroadcastHub, SyncEvent};
use cospace_types::{EntityId, PeerId, Pose};
use nalgebra::{UnitQuaternion, Vector3};
use tracing::{debug, info};

use crate::entity::{EntitySync, Smoothing};

/// Latest shared-anchor state received via an alignment update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorState {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

pub struct SyncEngine {
    hub: BroadcastHub,
    registry: FrameRegistry,
    entities: HashMap<(PeerId, EntityId), EntitySync>,
    default_smoothing: Smoothing,
    calibration_mode: bool,
    remote_calibrating: HashMap<PeerId, bool>,
    shared_anchor: Option<AnchorState>,
}

impl SyncEngine {
    pub fn new(hub: BroadcastHub) -> Self {
        Self {
            hub,
            registry: FrameRegistry::new(),
            entities: HashMap::new(),
            default_smoothing: Smoothing::default(),
            calibration_mode: false,
            remote_calibrating: HashMap::new(),
            shared_anchor: None,
        }
    }

    /// Engine for deployments where all clients already share one physical
    /// frame; peers are trivially aligned and transforms are identity.
    pub fn with_identical_frames(hub: BroadcastHub) -> Self {
        Self {
            registry: FrameRegistry::with_identical_frames(),
            ..Self::new(hub)
        }
    }

    /// The hub, e.g. for joining a session or registering UI subscribers.
    pub fn hub_mut(&mut self) -> &mut BroadcastHub {
        &mut self.hub
    }

    pub fn registry(&self) -> &FrameRegistry {
        &self.registry
    }

    /// Smoothing applied to entities first seen after this call.
    pub fn set_default_smoothing(&mut self, smoothing: Smoothing) {
        self.default_smoothing = smoothing;
    }

    /// Override smoothing for one already-known entity.
    pub fn set_entity_smoothing(&mut self, peer: PeerId, entity: EntityId, smoothing: Smoothing) {
        if let Some(sync) = self.entities.get_mut(&(peer, entity)) {
            sync.set_smoothing(smoothing);
        }
    }

    // ── Local state changes ─────────────────────────────────────────────────

    /// Set this client's reference frame and announce it durably.
    ///
    /// A failed broadcast (no session) is already reported by the hub and
    /// needs no retry here: the frame is re-announced on the next change,
    /// and a session joined later replays nothing stale from us.
    pub fn set_local_reference(&mut self, origin: Vector3<f32>, orientation: UnitQuaternion<f32>) {
        self.registry.set_local_reference(origin, orientation);
        let _ = self.hub.broadcast_reference(origin, orientation);
    }

    /// Publish one of this client's entity poses to the session.
    pub fn publish_local_pose(&self, entity: EntityId, pose: &Pose) {
        let _ = self.hub.broadcast_pose(entity, pose);
    }

    /// Publish an operator-driven shared-anchor update (durable).
    pub fn publish_alignment_update(
        &mut self,
        position: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        scale: Vector3<f32>,
    ) {
        self.shared_anchor = Some(AnchorState {
            position,
            rotation,
            scale,
        });
        let _ = self.hub.broadcast_alignment_update(position, rotation, scale);
    }

    /// Enter or leave calibration mode (level-triggered, advisory).
    pub fn set_calibration_mode(&mut self, enabled: bool) {
        if self.calibration_mode == enabled {
            return;
        }
        self.calibration_mode = enabled;
        info!(enabled, "calibration mode changed");
        let _ = self.hub.broadcast_mode_changed(enabled);
    }

    pub fn calibration_mode(&self) -> bool {
        self.calibration_mode
    }

    /// Whether `peer` last reported being in calibration mode.
    pub fn peer_calibrating(&self, peer: PeerId) -> bool {
        self.remote_calibrating.get(&peer).copied().unwrap_or(false)
    }

    /// Install a synthetic alignment for `peer`, bypassing the exchange.
    pub fn set_manual_alignment(
        &mut self,
        peer: PeerId,
        remote_origin: Vector3<f32>,
        remote_orientation: UnitQuaternion<f32>,
        scale: f32,
    ) {
        self.registry
            .set_manual_alignment(peer, remote_origin, remote_orientation, scale);
    }

    /// Drop every alignment record and cached transform; the next reference
    /// exchange re-derives from scratch.
    pub fn recalibrate(&mut self) {
        info!("recalibrating: clearing all alignment records");
        self.registry.clear();
    }

    /// Forget a disconnected peer: its alignment record and its entities.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.registry.remove_peer(peer);
        self.entities.retain(|(owner, _), _| *owner != peer);
        self.remote_calibrating.remove(&peer);
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn is_aligned(&self) -> bool {
        self.registry.is_aligned()
    }

    pub fn shared_anchor(&self) -> Option<AnchorState> {
        self.shared_anchor
    }

    /// The smoothed local-frame pose for a remote entity, if any sample has
    /// arrived for it yet.
    pub fn rendered_pose(&self, peer: PeerId, entity: EntityId) -> Option<Pose> {
        self.entities
            .get(&(peer, entity))
            .and_then(EntitySync::rendered_pose)
    }

    // ── Tick ────────────────────────────────────────────────────────────────

    /// One cooperative tick: drain and route received events, then advance
    /// every entity's interpolation by `dt` seconds.
    pub fn tick(&mut self, dt: f32) {
        for event in self.hub.pump() {
            self.apply(event);
        }
        for entity in self.entities.values_mut() {
            entity.tick(&mut self.registry, dt);
        }
    }

    fn apply(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::ReferenceReceived { peer, frame } => {
                debug!(%peer, "reference announcement received");
                self.registry
                    .on_remote_reference_received(peer, frame.origin, frame.orientation);
            }
            SyncEvent::AlignmentUpdated {
                peer,
                position,
                rotation,
                scale,
            } => {
                debug!(%peer, "shared anchor updated");
                self.shared_anchor = Some(AnchorState {
                    position,
                    rotation,
                    scale,
                });
            }
            SyncEvent::ModeChanged { peer, enabled } => {
                self.remote_calibrating.insert(peer, enabled);
            }
            SyncEvent::PoseReceived {
                peer,
                entity,
                sample,
            } => {
                self.entities
                    .entry((peer, entity))
                    .or_insert_with(|| EntitySync::new(peer, self.default_smoothing))
                    .submit_sample(sample);
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cospace_net::MemorySession;

    const A: PeerId = PeerId(1);
    const B: PeerId = PeerId(2);
    const HEAD: EntityId = EntityId(10);

    const DT: f32 = 1.0 / 60.0;

    fn joined_engine(session: &MemorySession, peer: PeerId) -> SyncEngine {
        let mut engine = SyncEngine::new(BroadcastHub::new(peer));
        session.join(engine.hub_mut());
        engine
    }

    #[test]
    fn two_peers_align_and_converge() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        let mut b = joined_engine(&session, B);

        a.set_local_reference(Vector3::zeros(), UnitQuaternion::identity());
        b.set_local_reference(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());
        a.tick(DT);
        assert!(a.is_aligned());

        // B's head at its (3,0,0) must land at A's (-2,0,0).
        b.publish_local_pose(
            HEAD,
            &Pose::new(Vector3::new(3.0, 0.0, 0.0), UnitQuaternion::identity()),
        );
        for _ in 0..60 {
            a.tick(DT);
        }
        let pose = a.rendered_pose(B, HEAD).unwrap();
        assert!(
            (pose.position - Vector3::new(-2.0, 0.0, 0.0)).norm() < 1e-3,
            "pose {:?}",
            pose.position
        );
    }

    #[test]
    fn late_joiner_aligns_from_replayed_reference() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        a.set_local_reference(Vector3::zeros(), UnitQuaternion::identity());

        // B joins after A's announcement; A never re-sends.
        let mut b = joined_engine(&session, B);
        b.set_local_reference(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());
        b.tick(DT);
        assert!(b.is_aligned());
        assert!(b.registry().record(A).is_some());
    }

    #[test]
    fn steady_sample_produces_steady_rendered_pose() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        let mut b = joined_engine(&session, B);
        a.set_local_reference(Vector3::zeros(), UnitQuaternion::identity());
        b.set_local_reference(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());

        let head = Pose::new(Vector3::new(3.0, 0.0, 0.0), UnitQuaternion::identity());
        b.publish_local_pose(HEAD, &head);
        a.tick(DT);
        let first = a.rendered_pose(B, HEAD).unwrap();

        // The same pose re-broadcast must not perturb the rendered result:
        // the first sample snapped, nothing changed, so the pose is stable
        // bit-for-bit across further ticks.
        for _ in 0..10 {
            b.publish_local_pose(HEAD, &head);
            a.tick(DT);
            let again = a.rendered_pose(B, HEAD).unwrap();
            assert_eq!(first.position, again.position);
            assert_eq!(
                first.rotation.into_inner(),
                again.rotation.into_inner()
            );
        }
    }

    #[test]
    fn recalibrate_drops_alignment_until_next_exchange() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        let mut b = joined_engine(&session, B);
        a.set_local_reference(Vector3::zeros(), UnitQuaternion::identity());
        b.set_local_reference(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());
        a.tick(DT);
        assert!(a.is_aligned());

        a.recalibrate();
        assert!(!a.is_aligned());

        // B re-announces (say, after an operator recalibration on its side).
        b.set_local_reference(Vector3::new(6.0, 0.0, 0.0), UnitQuaternion::identity());
        a.tick(DT);
        assert!(a.is_aligned());
    }

    #[test]
    fn mode_change_is_tracked_per_peer() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        let mut b = joined_engine(&session, B);

        b.set_calibration_mode(true);
        a.tick(DT);
        assert!(a.peer_calibrating(B));

        b.set_calibration_mode(false);
        a.tick(DT);
        assert!(!a.peer_calibrating(B));
    }

    #[test]
    fn alignment_update_reaches_late_joiner() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        a.publish_alignment_update(
            Vector3::new(1.0, 2.0, 3.0),
            UnitQuaternion::identity(),
            Vector3::new(1.0, 1.0, 1.0),
        );

        let mut b = joined_engine(&session, B);
        b.tick(DT);
        let anchor = b.shared_anchor().unwrap();
        assert!((anchor.position - Vector3::new(1.0, 2.0, 3.0)).norm() < 1e-6);
    }

    #[test]
    fn remove_peer_forgets_entities_and_record() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        let mut b = joined_engine(&session, B);
        a.set_local_reference(Vector3::zeros(), UnitQuaternion::identity());
        b.set_local_reference(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());
        b.publish_local_pose(HEAD, &Pose::identity());
        a.tick(DT);
        assert!(a.rendered_pose(B, HEAD).is_some());

        a.remove_peer(B);
        assert!(a.rendered_pose(B, HEAD).is_none());
        assert!(!a.is_aligned());
    }

    #[test]
    fn unaligned_peer_poses_still_render() {
        let session = MemorySession::new();
        let mut a = joined_engine(&session, A);
        let mut b = joined_engine(&session, B);
        // Neither peer announced a reference; samples pass through untransformed.
        let head = Pose::new(Vector3::new(3.0, 0.0, 0.0), UnitQuaternion::identity());
        b.publish_local_pose(HEAD, &head);
        a.tick(DT);
        let pose = a.rendered_pose(B, HEAD).unwrap();
        assert!((pose.position - head.position).norm() < 1e-6);
    }
}
