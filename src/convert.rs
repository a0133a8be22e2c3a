//! Pose and IMU conversion from the simulation's axis convention to the backend's
//!
//! The simulation is Z-up with X forward; the backend expects the image
//! convention (X right, Y down, Z forward). Vectors go through the signed
//! axis permutation [`AXIS_REMAP`]. Orientations are conjugated by
//! [`ORIENTATION_REMAP`], the same permutation with the forward axis
//! mirrored, which is the handedness the backend's pose input expects.

use glam::{DMat3, DQuat, DVec3};

/// Maps simulation axes to backend axes: `(x, y, z) -> (-y, -z, x)`.
pub const AXIS_REMAP: DMat3 = DMat3::from_cols(
    DVec3::new(0.0, 0.0, 1.0),
    DVec3::new(-1.0, 0.0, 0.0),
    DVec3::new(0.0, -1.0, 0.0),
);

/// Reflection conjugating simulation rotations into backend rotations:
/// rows `(0, -1, 0)`, `(0, 0, -1)`, `(-1, 0, 0)`.
///
/// Equal to `diag(1, 1, -1) · AXIS_REMAP`, so a converted quaternion is the
/// [`AXIS_REMAP`] conjugate with its x and y components negated.
pub const ORIENTATION_REMAP: DMat3 = DMat3::from_cols(
    DVec3::new(0.0, 0.0, -1.0),
    DVec3::new(-1.0, 0.0, 0.0),
    DVec3::new(0.0, -1.0, 0.0),
);

const DEGENERATE_NORM_SQUARED: f64 = 1e-12;

/// Converts an orientation into the backend frame: `R · M(q) · Rᵀ` with
/// `R` = [`ORIENTATION_REMAP`].
///
/// A zero quaternion carries no orientation and converts to identity.
pub fn remap_orientation(q: DQuat) -> DQuat {
    conjugate(q, ORIENTATION_REMAP)
}

/// Converts a vector (linear acceleration, velocity) into the backend frame.
pub fn remap_vector(v: DVec3) -> DVec3 {
    AXIS_REMAP * v
}

/// Inverse of [`remap_orientation`].
pub fn unmap_orientation(q: DQuat) -> DQuat {
    conjugate(q, ORIENTATION_REMAP.transpose())
}

/// Inverse of [`remap_vector`].
pub fn unmap_vector(v: DVec3) -> DVec3 {
    AXIS_REMAP.transpose() * v
}

fn conjugate(q: DQuat, basis: DMat3) -> DQuat {
    if q.length_squared() < DEGENERATE_NORM_SQUARED || !q.is_finite() {
        return DQuat::IDENTITY;
    }

    let rotation = DMat3::from_quat(q.normalize());
    let converted = orthonormalize(basis * rotation * basis.transpose());

    canonical(DQuat::from_mat3(&converted).normalize())
}

/// Gram-Schmidt over the columns, removing drift from the matrix products.
fn orthonormalize(m: DMat3) -> DMat3 {
    let x = m.x_axis.normalize();
    let y = (m.y_axis - x * x.dot(m.y_axis)).normalize();
    let z = x.cross(y);
    DMat3::from_cols(x, y, z)
}

/// `q` and `-q` encode the same rotation; keep the one with `w >= 0`.
fn canonical(q: DQuat) -> DQuat {
    if q.w < 0.0 {
        -q
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

    const EPS: f64 = 1e-9;

    fn same_rotation(a: DQuat, b: DQuat) -> bool {
        a.dot(b).abs() > 1.0 - EPS
    }

    #[test]
    fn remap_is_a_proper_rotation() {
        assert!((AXIS_REMAP.determinant() - 1.0).abs() < EPS);
        let product = AXIS_REMAP * AXIS_REMAP.transpose();
        assert!(product.abs_diff_eq(DMat3::IDENTITY, EPS));
    }

    #[test]
    fn vector_axes_are_permuted() {
        let v = remap_vector(DVec3::new(1.0, 2.0, 3.0));
        assert!(v.abs_diff_eq(DVec3::new(-2.0, -3.0, 1.0), EPS));
    }

    #[test]
    fn gravity_points_down_the_image() {
        // Simulation gravity reaction along +Z ends up on -Y (image up).
        let v = remap_vector(DVec3::new(0.0, 0.0, 9.81));
        assert!(v.abs_diff_eq(DVec3::new(0.0, -9.81, 0.0), EPS));
    }

    #[test]
    fn identity_stays_identity() {
        assert!(same_rotation(remap_orientation(DQuat::IDENTITY), DQuat::IDENTITY));
    }

    #[test]
    fn orientation_remap_is_a_reflection() {
        assert!((ORIENTATION_REMAP.determinant() + 1.0).abs() < EPS);
        let mirrored = DMat3::from_diagonal(DVec3::new(1.0, 1.0, -1.0)) * AXIS_REMAP;
        assert!(ORIENTATION_REMAP.abs_diff_eq(mirrored, EPS));
    }

    fn assert_wire(q: DQuat, w: f64, x: f64, y: f64, z: f64) {
        let expected = DQuat::from_xyzw(x, y, z, w);
        assert!(q.abs_diff_eq(expected, EPS), "got {q:?}, expected {expected:?}");
    }

    #[test]
    fn yaw_becomes_positive_rotation_about_image_vertical() {
        let s = FRAC_PI_4.sin();
        let c = FRAC_PI_4.cos();
        assert_wire(remap_orientation(DQuat::from_rotation_z(FRAC_PI_2)), c, 0.0, s, 0.0);
        assert_wire(remap_orientation(DQuat::from_rotation_z(-FRAC_PI_2)), c, 0.0, -s, 0.0);
    }

    #[test]
    fn pitch_becomes_positive_rotation_about_image_right() {
        let s = FRAC_PI_4.sin();
        let c = FRAC_PI_4.cos();
        assert_wire(remap_orientation(DQuat::from_rotation_y(FRAC_PI_2)), c, s, 0.0, 0.0);
    }

    #[test]
    fn roll_keeps_its_sign_about_the_optical_axis() {
        let s = FRAC_PI_4.sin();
        let c = FRAC_PI_4.cos();
        assert_wire(remap_orientation(DQuat::from_rotation_x(FRAC_PI_2)), c, 0.0, 0.0, s);
    }

    #[test]
    fn negates_x_and_y_of_the_permuted_rotation() {
        let q = DQuat::from_euler(glam::EulerRot::ZYX, 0.3, -1.1, 2.4);
        let permuted = DQuat::from_mat3(&(AXIS_REMAP * DMat3::from_quat(q) * AXIS_REMAP.transpose()));
        let permuted = if permuted.w < 0.0 { -permuted } else { permuted };
        let expected = DQuat::from_xyzw(-permuted.x, -permuted.y, permuted.z, permuted.w);
        assert_wire(remap_orientation(q), expected.w, expected.x, expected.y, expected.z);
    }

    #[test]
    fn rotation_commutes_with_the_reflection() {
        let q = DQuat::from_euler(glam::EulerRot::ZYX, 0.3, -1.1, 2.4);
        let v = DVec3::new(0.5, -1.5, 2.0);
        let rotated_then_mapped = ORIENTATION_REMAP * (q * v);
        let mapped_then_rotated = remap_orientation(q) * (ORIENTATION_REMAP * v);
        assert!(rotated_then_mapped.abs_diff_eq(mapped_then_rotated, 1e-9));
    }

    #[test]
    fn round_trip_restores_orientation() {
        for (yaw, pitch, roll) in [(0.0, 0.0, 0.0), (0.7, -0.2, 1.3), (3.0, 1.5, -2.9), (-1.2, 0.01, 0.4)] {
            let q = DQuat::from_euler(glam::EulerRot::ZYX, yaw, pitch, roll);
            let back = unmap_orientation(remap_orientation(q));
            assert!(same_rotation(q, back), "{q:?} became {back:?}");
        }
    }

    #[test]
    fn output_is_unit_norm_for_unnormalized_input() {
        let q = DQuat::from_xyzw(0.4, -2.0, 1.0, 3.0);
        assert!((remap_orientation(q).length() - 1.0).abs() < EPS);
    }

    #[test]
    fn output_keeps_non_negative_real_part() {
        let q = -DQuat::from_rotation_x(0.5);
        assert!(remap_orientation(q).w >= 0.0);
    }

    #[test]
    fn zero_quaternion_maps_to_identity() {
        assert_eq!(remap_orientation(DQuat::from_xyzw(0.0, 0.0, 0.0, 0.0)), DQuat::IDENTITY);
    }

    #[test]
    fn vector_round_trip() {
        let v = DVec3::new(-4.0, 0.25, 9.81);
        assert!(unmap_vector(remap_vector(v)).abs_diff_eq(v, EPS));
    }
}
