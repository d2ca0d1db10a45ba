//! Rigid-transform math between named reference frames.
//!
//! Pure, stateless, deterministic: given a pose expressed in a source
//! frame's coordinates, produce the equivalent pose in a destination frame,
//! given each frame's origin and orientation plus a uniform scale. Calling
//! any function twice with identical arguments yields bit-identical results;
//! the caching layers upstream depend on that.
//!
//! # Example
//!
//! ```rust
//! use cospace_transform::transform_position;
//! use cospace_types::ReferenceFrame;
//! use nalgebra::{UnitQuaternion, Vector3};
//!
//! // Remote peer's origin sits 5 m along +X of ours, same orientation.
//! let theirs = ReferenceFrame::new(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());
//! let ours = ReferenceFrame::identity();
//!
//! // A point at their (3,0,0) lands at our (-2,0,0).
//! let p = transform_position(Vector3::new(3.0, 0.0, 0.0), &theirs, &ours, 1.0);
//! assert!((p.x - (-2.0)).abs() < 1e-5);
//! ```

use cospace_types::{Pose, ReferenceFrame};
use nalgebra::{Quaternion, Unit, UnitQuaternion, Vector3};
use tracing::warn;

/// Minimum quaternion magnitude accepted before an orientation is treated
/// as degenerate and replaced with identity.
pub const MIN_ORIENTATION_NORM: f32 = 1.0e-6;

// ────────────────────────────────────────────────────────────────────────────
// Frame-to-frame transforms
// ────────────────────────────────────────────────────────────────────────────

/// The unique rotation that re-expresses directions relative to the source
/// frame's axes as directions relative to the destination frame's axes:
/// `dst ⊗ src⁻¹`.
pub fn rotation_offset(
    dst_orientation: UnitQuaternion<f32>,
    src_orientation: UnitQuaternion<f32>,
) -> UnitQuaternion<f32> {
    dst_orientation * src_orientation.inverse()
}

/// Map a position from `src` frame coordinates into `dst` frame
/// coordinates: `dst.origin + scale * (offset ⊗ (p - src.origin))`.
pub fn transform_position(
    src_pos: Vector3<f32>,
    src: &ReferenceFrame,
    dst: &ReferenceFrame,
    scale: f32,
) -> Vector3<f32> {
    let offset = rotation_offset(dst.orientation, src.orientation);
    dst.origin + (offset * (src_pos - src.origin)) * scale
}

/// Map a rotation expressed against `src_orientation` into one expressed
/// against `dst_orientation`.
///
/// The result is renormalized: repeated composition accumulates
/// floating-point drift, and an un-normalized quaternion silently turns
/// into a scaling transform downstream.
pub fn transform_rotation(
    src_rot: UnitQuaternion<f32>,
    src_orientation: UnitQuaternion<f32>,
    dst_orientation: UnitQuaternion<f32>,
) -> UnitQuaternion<f32> {
    let composed = rotation_offset(dst_orientation, src_orientation) * src_rot;
    UnitQuaternion::new_normalize(composed.into_inner())
}

/// Map a whole pose from `src` frame coordinates into `dst` frame
/// coordinates. The inverse mapping is the same call with the frame
/// arguments swapped (and `1.0 / scale`).
pub fn transform_pose(pose: &Pose, src: &ReferenceFrame, dst: &ReferenceFrame, scale: f32) -> Pose {
    Pose::new(
        transform_position(pose.position, src, dst, scale),
        transform_rotation(pose.rotation, src.orientation, dst.orientation),
    )
}

/// Validate a raw wire quaternion at the math boundary.
///
/// A near-zero-magnitude quaternion cannot be normalized (the division is
/// undefined), so it is rejected here: identity comes back and the
/// condition is reported, never propagated.
pub fn sanitize_orientation(raw: Quaternion<f32>) -> UnitQuaternion<f32> {
    match Unit::try_new(raw, MIN_ORIENTATION_NORM) {
        Some(unit) => unit,
        None => {
            warn!(?raw, "degenerate orientation quaternion, substituting identity");
            UnitQuaternion::identity()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interpolation steps
// ────────────────────────────────────────────────────────────────────────────

/// Move `current` a fraction of the remaining distance toward `target`.
pub fn step_position(
    current: Vector3<f32>,
    target: Vector3<f32>,
    fraction: f32,
) -> Vector3<f32> {
    current.lerp(&target, fraction)
}

/// Spherically interpolate `current` toward `target` by `fraction`.
///
/// Slerp, never lerp: component-wise interpolation of quaternions does not
/// follow the shortest angular path and compounds per-axis error into
/// visible wobble. The result is renormalized every step to bound long-run
/// drift; near-antipodal pairs (slerp undefined) snap to the target.
pub fn step_rotation(
    current: UnitQuaternion<f32>,
    target: UnitQuaternion<f32>,
    fraction: f32,
) -> UnitQuaternion<f32> {
    // Already at the target: stepping must not perturb it.
    if current == target {
        return current;
    }
    match current.try_slerp(&target, fraction, MIN_ORIENTATION_NORM) {
        Some(stepped) => UnitQuaternion::new_normalize(stepped.into_inner()),
        None => target,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn yaw(angle: f32) -> UnitQuaternion<f32> {
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angle)
    }

    // ── rotation_offset ─────────────────────────────────────────────────────

    #[test]
    fn offset_between_identical_orientations_is_identity() {
        let q = yaw(0.7);
        let offset = rotation_offset(q, q);
        assert!(offset.angle() < 1e-6);
    }

    #[test]
    fn offset_reexpresses_source_directions() {
        // Source frame yawed 90°; a direction along source +X should come
        // back rotated by -90° when re-expressed in an unrotated frame.
        let offset = rotation_offset(UnitQuaternion::identity(), yaw(FRAC_PI_2));
        let v = offset * Vector3::new(1.0, 0.0, 0.0);
        assert!((v.z - 1.0).abs() < 1e-5, "z={}", v.z);
        assert!(v.x.abs() < 1e-5);
    }

    // ── transform_position ──────────────────────────────────────────────────

    #[test]
    fn translated_frames_shift_positions() {
        let theirs = ReferenceFrame::new(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());
        let ours = ReferenceFrame::identity();
        let p = transform_position(Vector3::new(3.0, 0.0, 0.0), &theirs, &ours, 1.0);
        assert!((p - Vector3::new(-2.0, 0.0, 0.0)).norm() < 1e-5);
    }

    #[test]
    fn scale_applies_to_the_offset_not_the_origin() {
        let theirs = ReferenceFrame::new(Vector3::new(1.0, 0.0, 0.0), UnitQuaternion::identity());
        let ours = ReferenceFrame::new(Vector3::new(10.0, 0.0, 0.0), UnitQuaternion::identity());
        let p = transform_position(Vector3::new(3.0, 0.0, 0.0), &theirs, &ours, 2.0);
        // offset from their origin is (2,0,0); doubled and re-rooted at ours.
        assert!((p - Vector3::new(14.0, 0.0, 0.0)).norm() < 1e-5);
    }

    #[test]
    fn position_round_trips_between_rotated_frames() {
        let a = ReferenceFrame::new(Vector3::new(1.0, 2.0, 3.0), yaw(0.8));
        let b = ReferenceFrame::new(
            Vector3::new(-4.0, 0.5, 7.0),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -0.3),
        );
        let p = Vector3::new(0.25, -1.5, 9.0);
        let there = transform_position(p, &a, &b, 1.0);
        let back = transform_position(there, &b, &a, 1.0);
        assert!((back - p).norm() < 1e-4, "round trip error {}", (back - p).norm());
    }

    // ── transform_rotation ──────────────────────────────────────────────────

    #[test]
    fn rotation_stays_normalized_under_repeated_composition() {
        let src = yaw(0.123);
        let dst = yaw(-1.042);
        let mut rot = yaw(0.5);
        for _ in 0..10_000 {
            rot = transform_rotation(rot, src, dst);
            rot = transform_rotation(rot, dst, src);
        }
        assert!((rot.into_inner().norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rotation_between_identity_frames_is_unchanged() {
        let rot = yaw(1.1);
        let out = transform_rotation(rot, UnitQuaternion::identity(), UnitQuaternion::identity());
        assert!(out.angle_to(&rot) < 1e-6);
    }

    // ── determinism ─────────────────────────────────────────────────────────

    #[test]
    fn identical_inputs_give_bit_identical_outputs() {
        let a = ReferenceFrame::new(Vector3::new(1.0, 2.0, 3.0), yaw(0.8));
        let b = ReferenceFrame::new(Vector3::new(-4.0, 0.5, 7.0), yaw(-0.2));
        let pose = Pose::new(Vector3::new(0.1, 0.2, 0.3), yaw(2.2));

        let first = transform_pose(&pose, &a, &b, 1.0);
        let second = transform_pose(&pose, &a, &b, 1.0);
        assert_eq!(first.position, second.position);
        assert_eq!(first.rotation.into_inner(), second.rotation.into_inner());
    }

    // ── sanitize_orientation ────────────────────────────────────────────────

    #[test]
    fn near_zero_quaternion_becomes_identity() {
        let out = sanitize_orientation(Quaternion::new(1.0e-9, 0.0, 0.0, 0.0));
        assert_eq!(out, UnitQuaternion::identity());
    }

    #[test]
    fn valid_quaternion_is_normalized_not_replaced() {
        // Twice unit length; sanitize should keep the rotation, norm 1.
        let out = sanitize_orientation(Quaternion::new(2.0, 0.0, 0.0, 0.0));
        assert!((out.into_inner().norm() - 1.0).abs() < 1e-6);
        assert!(out.angle() < 1e-6);
    }

    // ── interpolation steps ─────────────────────────────────────────────────

    #[test]
    fn step_position_converges_geometrically() {
        let target = Vector3::new(10.0, 0.0, 0.0);
        let mut current = Vector3::zeros();
        let f = 0.2;
        for n in 1..=20 {
            current = step_position(current, target, f);
            let expected = 10.0 * (1.0 - f).powi(n);
            assert!(
                ((target - current).norm() - expected).abs() < 1e-3,
                "tick {n}: remaining {} expected {expected}",
                (target - current).norm()
            );
        }
    }

    #[test]
    fn step_rotation_stays_unit_and_converges() {
        let target = yaw(1.2);
        let mut current = UnitQuaternion::identity();
        for _ in 0..60 {
            current = step_rotation(current, target, 0.2);
            assert!((current.into_inner().norm() - 1.0).abs() < 1e-5);
        }
        // Within 0.1° after 60 ticks at f = 0.2.
        assert!(current.angle_to(&target) < 0.1_f32.to_radians());
    }
}
