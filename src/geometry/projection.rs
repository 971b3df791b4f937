//! Pinhole projection in metric (normalized) pixel coordinates.
//!
//! Observations are expressed as `(x/z, y/z)` of the camera-frame point, so no
//! intrinsics are needed here.

use nalgebra::{Matrix2x3, Matrix3, Vector2, Vector3};

/// Project a camera-frame point to metric pixel coordinates.
#[inline]
pub fn project(p_cam: &Vector3<f64>) -> Vector2<f64> {
    Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)
}

/// Lift a metric pixel back to a camera-frame point at the given depth.
#[inline]
pub fn unproject(pixel: &Vector2<f64>, depth: f64) -> Vector3<f64> {
    Vector3::new(pixel.x * depth, pixel.y * depth, depth)
}

/// Bearing of a metric pixel (not normalized).
#[inline]
pub fn bearing(pixel: &Vector2<f64>) -> Vector3<f64> {
    Vector3::new(pixel.x, pixel.y, 1.0)
}

/// Jacobian of the reprojection residual `observed - project(R * p_w + t)`
/// with respect to the world point `p_w`.
///
/// ```text
/// J = -1/z * | 1  0  -x/z | * R_cw
///            | 0  1  -y/z |
/// ```
pub fn jacobian_xyz2uv(p_cam: &Vector3<f64>, r_cw: &Matrix3<f64>) -> Matrix2x3<f64> {
    let z_inv = 1.0 / p_cam.z;
    let z_inv_sq = z_inv * z_inv;

    #[rustfmt::skip]
    let d_proj = Matrix2x3::new(
        z_inv, 0.0,   -p_cam.x * z_inv_sq,
        0.0,   z_inv, -p_cam.y * z_inv_sq,
    );

    -(d_proj * r_cw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_project_unproject() {
        let pixel = Vector2::new(0.12, -0.05);
        let p = unproject(&pixel, 4.0);

        assert_relative_eq!(p.z, 4.0);
        assert_relative_eq!(project(&p), pixel, epsilon = 1e-15);
    }

    #[test]
    fn test_jacobian_matches_numerical() {
        let pose_cw = SE3::new(
            UnitQuaternion::from_euler_angles(0.05, 0.1, -0.2),
            Vector3::new(0.2, -0.1, 0.3),
        );
        let p_w = Vector3::new(0.5, 0.3, 4.0);
        let observed = Vector2::new(0.1, 0.05);

        let residual = |p: &Vector3<f64>| observed - project(&pose_cw.transform_point(p));

        let analytic = jacobian_xyz2uv(&pose_cw.transform_point(&p_w), &pose_cw.rotation_matrix());

        let h = 1e-6;
        for axis in 0..3 {
            let mut delta = Vector3::zeros();
            delta[axis] = h;
            let numeric = (residual(&(p_w + delta)) - residual(&(p_w - delta))) / (2.0 * h);
            assert_relative_eq!(analytic.column(axis).into_owned(), numeric, epsilon = 1e-7);
        }
    }
}
