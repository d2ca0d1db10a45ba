//! Reference Frame Registry.
//!
//! Owns the belief about how each remote peer's reference frame relates to
//! the local one, and answers "transform this pose from peer X into my
//! frame" without recomputing geometry that has not changed.
//!
//! One [`AlignmentRecord`] per peer, replaced wholesale when a newer
//! reference announcement arrives; only the most recent announcement is
//! authoritative (no averaging), so an operator-triggered recalibration
//! deterministically supersedes prior state.
//!
//! Announcements that arrive before a local reference frame is set are
//! **queued** (newest per peer) and applied when [`FrameRegistry::set_local_reference`]
//! first runs. Identity-fallback was rejected: it would bake a wrong
//! rotation offset into a record that a second announcement then has to
//! repair.

use std::collections::HashMap;

use cospace_transform::rotation_offset;
use cospace_types::{PeerId, Pose, ReferenceFrame};
use nalgebra::{UnitQuaternion, Vector3};
use tracing::{debug, warn};

// ────────────────────────────────────────────────────────────────────────────
// AlignmentRecord
// ────────────────────────────────────────────────────────────────────────────

/// The computed relationship between one remote peer's reference frame and
/// the local one.
///
/// `rotation_offset` is always derived from the two orientations
/// (`local ⊗ remote⁻¹`), never set directly, so it can never disagree with
/// the frames it was built from. Records are immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentRecord {
    peer: PeerId,
    remote_origin: Vector3<f32>,
    remote_orientation: UnitQuaternion<f32>,
    rotation_offset: UnitQuaternion<f32>,
    scale: f32,
}

impl AlignmentRecord {
    fn derive(
        peer: PeerId,
        local: &ReferenceFrame,
        remote_origin: Vector3<f32>,
        remote_orientation: UnitQuaternion<f32>,
        scale: f32,
    ) -> Self {
        Self {
            peer,
            remote_origin,
            remote_orientation,
            rotation_offset: rotation_offset(local.orientation, remote_orientation),
            scale,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The remote peer's reference frame as announced.
    pub fn remote_frame(&self) -> ReferenceFrame {
        ReferenceFrame::new(self.remote_origin, self.remote_orientation)
    }

    /// `local_orientation ⊗ remote_orientation⁻¹` at derivation time.
    pub fn rotation_offset(&self) -> UnitQuaternion<f32> {
        self.rotation_offset
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FrameRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Per-peer store of alignment records, owned by the tick thread.
#[derive(Debug, Default)]
pub struct FrameRegistry {
    local: Option<ReferenceFrame>,
    records: HashMap<PeerId, AlignmentRecord>,
    /// Announcements received before a local frame existed, newest per peer.
    pending: HashMap<PeerId, ReferenceFrame>,
    /// All peers share this client's frame; transforms are the identity.
    identical_frames: bool,
    revision: u64,
    missed_lookups: u64,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry for deployments where every client already tracks in the
    /// same physical frame: trivially aligned, transforms are identity.
    pub fn with_identical_frames() -> Self {
        Self {
            identical_frames: true,
            ..Self::default()
        }
    }

    /// Monotonic counter bumped by every mutation that can change a
    /// transform result. Downstream caches compare revisions instead of
    /// subscribing to the registry.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of `transform_pose_from` calls that found no record.
    pub fn missed_lookups(&self) -> u64 {
        self.missed_lookups
    }

    pub fn local_reference(&self) -> Option<ReferenceFrame> {
        self.local
    }

    /// Install this process's own reference frame.
    ///
    /// Existing records are re-derived against the new frame and any queued
    /// announcements are applied. Broadcasting the new frame to peers is
    /// the hub's job, not the registry's.
    pub fn set_local_reference(&mut self, origin: Vector3<f32>, orientation: UnitQuaternion<f32>) {
        let local = ReferenceFrame::new(origin, orientation);
        self.local = Some(local);

        let rebuilt: Vec<AlignmentRecord> = self
            .records
            .values()
            .map(|r| AlignmentRecord::derive(r.peer, &local, r.remote_origin, r.remote_orientation, r.scale))
            .collect();
        for record in rebuilt {
            self.records.insert(record.peer, record);
        }

        for (peer, frame) in std::mem::take(&mut self.pending) {
            debug!(%peer, "applying queued reference announcement");
            self.records.insert(
                peer,
                AlignmentRecord::derive(peer, &local, frame.origin, frame.orientation, 1.0),
            );
        }

        self.revision += 1;
    }

    /// A reference announcement arrived for `peer`.
    ///
    /// Builds a fresh record against the current local frame, overwriting
    /// any prior record for that peer. With no local frame yet, the
    /// announcement is queued until one is set (never dropped).
    pub fn on_remote_reference_received(
        &mut self,
        peer: PeerId,
        remote_origin: Vector3<f32>,
        remote_orientation: UnitQuaternion<f32>,
    ) {
        let Some(local) = self.local else {
            debug!(%peer, "no local reference frame yet, queueing announcement");
            self.pending
                .insert(peer, ReferenceFrame::new(remote_origin, remote_orientation));
            return;
        };
        self.records.insert(
            peer,
            AlignmentRecord::derive(peer, &local, remote_origin, remote_orientation, 1.0),
        );
        self.revision += 1;
    }

    /// Install a synthetic record bypassing the exchange protocol, for
    /// calibration and testing. Uses the current local frame, or identity
    /// when none is set yet.
    pub fn set_manual_alignment(
        &mut self,
        peer: PeerId,
        remote_origin: Vector3<f32>,
        remote_orientation: UnitQuaternion<f32>,
        scale: f32,
    ) {
        let local = self.local.unwrap_or_else(ReferenceFrame::identity);
        self.records.insert(
            peer,
            AlignmentRecord::derive(peer, &local, remote_origin, remote_orientation, scale),
        );
        self.revision += 1;
    }

    pub fn record(&self, peer: PeerId) -> Option<&AlignmentRecord> {
        self.records.get(&peer)
    }

    /// Transform a pose expressed in `peer`'s frame into the local frame.
    ///
    /// Fails open: with no record for `peer` the input comes back
    /// unchanged, so an unaligned-but-present remote entity still renders.
    /// The miss is reported, not thrown.
    pub fn transform_pose_from(&mut self, peer: PeerId, pose: &Pose) -> Pose {
        if self.identical_frames {
            return *pose;
        }
        let local = self.local.unwrap_or_else(ReferenceFrame::identity);
        let Some(record) = self.records.get(&peer) else {
            self.missed_lookups += 1;
            warn!(%peer, "no alignment record, returning pose untransformed");
            return *pose;
        };

        let position = local.origin
            + (record.rotation_offset * (pose.position - record.remote_origin)) * record.scale;
        let rotation =
            UnitQuaternion::new_normalize((record.rotation_offset * pose.rotation).into_inner());
        Pose::new(position, rotation)
    }

    /// True once any peer is aligned (or frames are configured identical).
    pub fn is_aligned(&self) -> bool {
        self.identical_frames || !self.records.is_empty()
    }

    /// Drop `peer`'s record and any queued announcement (peer disconnect).
    pub fn remove_peer(&mut self, peer: PeerId) {
        let had_record = self.records.remove(&peer).is_some();
        self.pending.remove(&peer);
        if had_record {
            self.revision += 1;
        }
    }

    /// Recalibrate: drop every record and queued announcement, forcing
    /// re-derivation on the next reference exchange.
    pub fn clear(&mut self) {
        self.records.clear();
        self.pending.clear();
        self.revision += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
