//! `cospace-types` – shared data model for the CoSpace sync engine.
//!
//! Every crate in the workspace speaks these types: peer/entity identifiers,
//! poses and reference frames (backed by [`nalgebra`]), the wire-level
//! message families exchanged between peers, and the global error taxonomy.
//!
//! Wire structs ([`WireVec3`], [`WireQuat`]) are data/serialization types
//! only – math happens in `cospace-transform` on the nalgebra
//! representations they convert to.

use chrono::{DateTime, Utc};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────────────────────────────────────

/// Identifies one client process in a shared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Identifies one tracked entity (avatar head, hand, landmark) within a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Poses and reference frames
// ────────────────────────────────────────────────────────────────────────────

/// A position + orientation pair in some reference frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
}

impl Pose {
    pub fn new(position: Vector3<f32>, rotation: UnitQuaternion<f32>) -> Self {
        Self { position, rotation }
    }

    /// Origin position, identity orientation.
    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// Tolerance comparison used to decide whether a freshly received sample
    /// actually moved. Position within `pos_eps` metres and rotation within
    /// `rot_eps` radians count as unchanged.
    pub fn approx_eq(&self, other: &Pose, pos_eps: f32, rot_eps: f32) -> bool {
        (self.position - other.position).norm_squared() <= pos_eps * pos_eps
            && self.rotation.angle_to(&other.rotation) <= rot_eps
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// One client's notion of "world origin": where it believes (0,0,0) and its
/// axes are in physical space. Immutable snapshot taken at broadcast time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceFrame {
    pub origin: Vector3<f32>,
    pub orientation: UnitQuaternion<f32>,
}

impl ReferenceFrame {
    pub fn new(origin: Vector3<f32>, orientation: UnitQuaternion<f32>) -> Self {
        Self { origin, orientation }
    }

    /// Frame coincident with the global origin.
    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }
}

impl Default for ReferenceFrame {
    fn default() -> Self {
        Self::identity()
    }
}

/// A raw pose sample for one entity, expressed in the *sender's* reference
/// frame. Transient: retained only long enough to detect change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    pub pose: Pose,
    pub timestamp: DateTime<Utc>,
}

impl PoseSample {
    pub fn new(pose: Pose, timestamp: DateTime<Utc>) -> Self {
        Self { pose, timestamp }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

/// A scalar triplet on the wire (positions, scales). Single precision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireVec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl WireVec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const ONE: Self = Self::new(1.0, 1.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl From<Vector3<f32>> for WireVec3 {
    fn from(v: Vector3<f32>) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl From<WireVec3> for Vector3<f32> {
    fn from(v: WireVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

/// A quaternion on the wire, stored in `(x, y, z, w)` order for
/// cross-language consistency. Expected (not enforced) to be unit length;
/// `cospace-transform` sanitizes on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireQuat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl WireQuat {
    pub const IDENTITY: Self = Self::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl From<WireQuat> for Quaternion<f32> {
    fn from(q: WireQuat) -> Self {
        // nalgebra's constructor takes w first.
        Quaternion::new(q.w, q.x, q.y, q.z)
    }
}

impl From<UnitQuaternion<f32>> for WireQuat {
    fn from(uq: UnitQuaternion<f32>) -> Self {
        let q = uq.into_inner();
        Self::new(q.i, q.j, q.k, q.w)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Messages
// ────────────────────────────────────────────────────────────────────────────

/// The message families a peer can broadcast into a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum SyncMessage {
    /// The sender's reference frame. Durable: late joiners must replay it.
    ReferenceAnnouncement {
        origin: WireVec3,
        orientation: WireQuat,
    },
    /// One-shot operator-driven anchor update (e.g. a manually repositioned
    /// shared mesh anchor). Durable: a late joiner needs the current anchor.
    AlignmentUpdate {
        position: WireVec3,
        rotation: WireQuat,
        scale: WireVec3,
    },
    /// Level-triggered "entering/exiting calibration mode". Advisory,
    /// best-effort delivery to currently-connected peers only.
    ModeChanged { enabled: bool },
    /// Raw pose sample for one of the sender's entities, in the sender's
    /// reference frame. Best-effort, last-write-wins.
    PoseUpdate {
        entity: EntityId,
        position: WireVec3,
        rotation: WireQuat,
    },
}

/// Transport-level wrapper around a [`SyncMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sender: PeerId,
    pub message: SyncMessage,
}

impl Envelope {
    /// Stamp a fresh envelope from `sender`.
    pub fn new(sender: PeerId, message: SyncMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sender,
            message,
        }
    }
}

/// Encode an envelope for a byte-oriented transport.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(envelope).map_err(|e| SyncError::MalformedMessage(e.to_string()))
}

/// Decode an envelope received from a byte-oriented transport.
///
/// A shape mismatch (wrong field count/type) is the one condition in the
/// engine that surfaces as a hard error: it indicates a protocol version
/// mismatch, not a recoverable runtime state.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, SyncError> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::MalformedMessage(e.to_string()))
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy for the sync engine.
///
/// Everything except [`SyncError::MalformedMessage`] is a local, recoverable
/// condition: callers report it (via `tracing`) and keep running in a
/// degraded-but-safe mode rather than unwinding across component boundaries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// `transform_pose_from` was asked about a peer with no alignment
    /// record. Fails open: the untransformed pose is still usable.
    #[error("no alignment record for {0}")]
    NotAligned(PeerId),

    /// A broadcast was attempted while not attached to a session. The
    /// broadcast is dropped; the next state change will try again.
    #[error("not attached to a session")]
    NotConnected,

    /// An orientation quaternion with near-zero magnitude arrived.
    /// Rejected at the math boundary and replaced with identity.
    #[error("degenerate orientation quaternion (|q| ≈ 0)")]
    DegenerateOrientation,

    /// Wrong field count/type on the wire: protocol version mismatch.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The marshaling channel between transport and tick thread failed.
    #[error("channel error: {0}")]
    Channel(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_announcement_roundtrip() {
        let env = Envelope::new(
            PeerId(7),
            SyncMessage::ReferenceAnnouncement {
                origin: WireVec3::new(1.0, 2.0, 3.0),
                orientation: WireQuat::IDENTITY,
            },
        );
        let bytes = encode_envelope(&env).unwrap();
        let back = decode_envelope(&bytes).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn wire_quat_preserves_xyzw_order() {
        let json = serde_json::to_string(&WireQuat::new(0.1, 0.2, 0.3, 0.9)).unwrap();
        // Field order in the serialized form matches declaration order.
        let x_at = json.find("\"x\"").unwrap();
        let w_at = json.find("\"w\"").unwrap();
        assert!(x_at < w_at);

        let q: Quaternion<f32> = WireQuat::new(0.1, 0.2, 0.3, 0.9).into();
        assert!((q.w - 0.9).abs() < f32::EPSILON);
        assert!((q.i - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn malformed_message_is_a_hard_error() {
        let err = decode_envelope(b"{\"id\": 12}").unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage(_)));
    }

    #[test]
    fn pose_approx_eq_ignores_timestamp_scale_noise() {
        let a = Pose::identity();
        let mut b = Pose::identity();
        b.position.x = 1.0e-8;
        assert!(a.approx_eq(&b, 1.0e-6, 1.0e-6));

        b.position.x = 0.5;
        assert!(!a.approx_eq(&b, 1.0e-6, 1.0e-6));
    }

    #[test]
    fn sync_error_display() {
        assert!(SyncError::NotAligned(PeerId(3)).to_string().contains("peer#3"));
        assert!(SyncError::NotConnected.to_string().contains("session"));
    }
}
