//! Recursive depth fusion for landmarks.
//!
//! Each new measurement `m = [u, v, d]` with noise `σ = [σu, σv, σd]` is
//! folded into the landmark state with an independent scalar Kalman update
//! per component:
//!
//! ```text
//! K_i   = Σ_ii / (Σ_ii + σ_i)
//! mu_i  = mu_i + K_i (m_i - mu_i)
//! Σ_ii  = (1 - K_i) Σ_ii
//! ```
//!
//! Cross-covariances are ignored here; coupling between the components is
//! recovered later by structure-only refinement.
//!
//! Measurements are produced by [`triangulate_measurement`], which intersects
//! the landmark's reference ray with the ray of a new observation.

use nalgebra::{Matrix2, Vector2, Vector3};

use crate::atlas::map::Landmark;
use crate::config::PointConfig;
use crate::error::{LandmarkError, Result};
use crate::geometry::projection::bearing;
use crate::geometry::SE3;

/// A `[u, v, depth]` measurement in a landmark's reference camera, with the
/// variance of each component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthMeasurement {
    pub value: Vector3<f64>,
    pub sigmas: Vector3<f64>,
}

impl DepthMeasurement {
    pub fn new(value: Vector3<f64>, sigmas: Vector3<f64>) -> Self {
        Self { value, sigmas }
    }
}

impl Landmark {
    /// Bayesian update of the state with one measurement.
    ///
    /// Every noise component must be strictly positive and finite, and the
    /// measurement finite; otherwise `InvalidMeasurement` is returned and
    /// nothing is modified.
    ///
    /// The first update of a guessed landmark resets `min_depth` and
    /// `max_depth` to the measured depth and clears `guessed`; later updates
    /// widen the bounds.
    pub fn update(&mut self, measurement: &Vector3<f64>, sigmas: &Vector3<f64>) -> Result<()> {
        let noise_ok = sigmas.iter().all(|s| s.is_finite() && *s > 0.0);
        if !noise_ok || !measurement.iter().all(|m| m.is_finite()) {
            return Err(LandmarkError::InvalidMeasurement {
                measurement: [measurement.x, measurement.y, measurement.z],
                sigmas: [sigmas.x, sigmas.y, sigmas.z],
            });
        }

        // u, v
        for i in 0..2 {
            let k = self.sigma[(i, i)] / (self.sigma[(i, i)] + sigmas[i]);
            self.mu[i] += k * (measurement[i] - self.mu[i]);
            self.sigma[(i, i)] *= 1.0 - k;
        }

        // d
        let depth = self.depth();
        let k = self.sigma[(2, 2)] / (self.sigma[(2, 2)] + sigmas[2]);
        self.mu[2] = depth + k * (measurement[2] - depth);
        self.sigma[(2, 2)] *= 1.0 - k;

        let measured_depth = measurement[2];
        if self.guessed {
            self.min_depth = measured_depth;
            self.max_depth = measured_depth;
            self.guessed = false;
        } else {
            self.max_depth = self.max_depth.max(measured_depth);
            self.min_depth = self.min_depth.min(measured_depth);
        }

        self.frames_since_depth_update = 0;
        Ok(())
    }

    /// Fuse a measurement taken from the camera at `pose` (T_wc).
    pub fn fuse(&mut self, measurement: &DepthMeasurement, pose: &SE3) -> Result<()> {
        self.update(&measurement.value, &measurement.sigmas)?;
        self.last_update_pose = *pose;
        Ok(())
    }
}

/// Derive a depth measurement from a new observation of `landmark`.
///
/// Intersects (in the least-squares sense) the ray through the landmark's
/// reference pixel with the ray through `pixel` seen from `pose` (T_wc), and
/// expresses the midpoint in the landmark's reference camera. The depth
/// variance grows with depth squared over baseline.
///
/// Returns `None` when the rays are too close to parallel, when the
/// intersection lies behind either camera, or when the system is singular.
pub fn triangulate_measurement(
    landmark: &Landmark,
    pixel: &Vector2<f64>,
    pose: &SE3,
    config: &PointConfig,
) -> Option<DepthMeasurement> {
    let ref_pose = landmark.initial_camera_pose();
    let c1 = ref_pose.center();
    let r1 = ref_pose.rotation * bearing(&landmark.pixel());
    let c2 = pose.center();
    let r2 = pose.rotation * bearing(pixel);

    let cos_parallax = r1.dot(&r2) / (r1.norm() * r2.norm());
    if cos_parallax > config.min_parallax_deg.to_radians().cos() {
        return None;
    }

    // Minimize |c1 + s r1 - (c2 + t r2)|²
    let baseline = c2 - c1;
    #[rustfmt::skip]
    let a = Matrix2::new(
        r1.dot(&r1), -r1.dot(&r2),
        r1.dot(&r2), -r2.dot(&r2),
    );
    let rhs = Vector2::new(r1.dot(&baseline), r2.dot(&baseline));
    let st = a.try_inverse()? * rhs;
    if !(st.x > 0.0 && st.y > 0.0) {
        return None;
    }

    let midpoint = 0.5 * ((c1 + st.x * r1) + (c2 + st.y * r2));
    let p = landmark.initial_camera_pose_inv().transform_point(&midpoint);
    if !(p.z > 0.0) {
        return None;
    }

    let pixel_sigma = config.pixel_noise_variance.sqrt();
    let depth_sigma = pixel_sigma * p.z * p.z / baseline.norm();
    let depth_variance = (depth_sigma * depth_sigma).max(f64::MIN_POSITIVE);
    if !depth_variance.is_finite() {
        return None;
    }

    Some(DepthMeasurement::new(
        Vector3::new(p.x / p.z, p.y / p.z, p.z),
        Vector3::new(
            config.pixel_noise_variance,
            config.pixel_noise_variance,
            depth_variance,
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{FrameBuffer, LandmarkId, Map};
    use crate::geometry::projection::project;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    struct Fixture {
        frames: FrameBuffer,
        map: Map,
        id: LandmarkId,
    }

    fn fixture(pose: SE3, pixel: Vector2<f64>) -> Fixture {
        let mut frames = FrameBuffer::new(8);
        let mut map = Map::new();
        let frame = frames.push(0, pose, true);
        let obs = frames.add_observation(frame, pixel).unwrap();
        let id = map
            .create_landmark(&obs, &frames, &PointConfig::default())
            .unwrap();
        Fixture { frames, map, id }
    }

    #[test]
    fn test_update_shrinks_variance_and_moves_toward_measurement() {
        let mut fx = fixture(SE3::identity(), Vector2::new(0.1, 0.1));
        let lm = fx.map.get_mut(fx.id).unwrap();

        let before_mu = *lm.mu();
        let before_var = lm.variances();
        let m = Vector3::new(0.2, 0.0, 4.0);
        lm.update(&m, &Vector3::new(1e-4, 1e-4, 0.5)).unwrap();

        for i in 0..3 {
            assert!(lm.variances()[i] < before_var[i]);
            let moved = lm.mu()[i] - before_mu[i];
            let wanted = m[i] - before_mu[i];
            assert!(moved * wanted > 0.0);
            assert!(moved.abs() <= wanted.abs());
        }
    }

    #[test]
    fn test_update_gain_values() {
        let mut fx = fixture(SE3::identity(), Vector2::new(0.0, 0.0));
        let lm = fx.map.get_mut(fx.id).unwrap();
        let config = PointConfig::default();

        // Equal prior and measurement variance gives K = 0.5
        let sigmas = Vector3::new(
            config.homogeneous_variance,
            config.homogeneous_variance,
            config.depth_variance,
        );
        lm.update(&Vector3::new(0.2, -0.2, 3.0), &sigmas).unwrap();

        assert_relative_eq!(lm.mu().x, 0.1, epsilon = 1e-12);
        assert_relative_eq!(lm.mu().y, -0.1, epsilon = 1e-12);
        assert_relative_eq!(lm.depth(), 0.5 * (config.default_depth + 3.0), epsilon = 1e-12);
        assert_relative_eq!(lm.depth_variance(), 0.5 * config.depth_variance, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_noise_rejected_without_mutation() {
        let mut fx = fixture(SE3::identity(), Vector2::new(0.1, 0.1));
        let lm = fx.map.get_mut(fx.id).unwrap();

        let mu = *lm.mu();
        let sigma = *lm.sigma();
        for bad in [
            Vector3::new(0.0, 1e-4, 1.0),
            Vector3::new(1e-4, 0.0, 1.0),
            Vector3::new(1e-4, 1e-4, 0.0),
            Vector3::new(1e-4, 1e-4, -1.0),
        ] {
            let err = lm.update(&Vector3::new(0.3, 0.3, 3.0), &bad).unwrap_err();
            assert!(matches!(err, LandmarkError::InvalidMeasurement { .. }));
            assert_eq!(*lm.mu(), mu);
            assert_eq!(*lm.sigma(), sigma);
            assert!(lm.is_guessed());
        }
    }

    #[test]
    fn test_depth_bounds_after_updates() {
        let mut fx = fixture(SE3::identity(), Vector2::new(0.1, 0.1));
        let lm = fx.map.get_mut(fx.id).unwrap();
        let sigmas = Vector3::new(1e-4, 1e-4, 0.5);

        lm.update(&Vector3::new(0.1, 0.1, 4.0), &sigmas).unwrap();
        assert!(!lm.is_guessed());
        assert_eq!(lm.min_depth(), 4.0);
        assert_eq!(lm.max_depth(), 4.0);

        lm.update(&Vector3::new(0.1, 0.1, 6.0), &sigmas).unwrap();
        assert_eq!(lm.min_depth(), 4.0);
        assert_eq!(lm.max_depth(), 6.0);

        lm.update(&Vector3::new(0.1, 0.1, 3.0), &sigmas).unwrap();
        assert_eq!(lm.min_depth(), 3.0);
        assert_eq!(lm.max_depth(), 6.0);
    }

    #[test]
    fn test_fuse_records_pose_and_resets_staleness() {
        let mut fx = fixture(SE3::identity(), Vector2::new(0.1, 0.1));
        let frame = fx.frames.push(1, SE3::identity(), false);
        let obs = fx.frames.add_observation(frame, Vector2::new(0.1, 0.1)).unwrap();
        fx.map.attach_observation(fx.id, &obs).unwrap();

        let lm = fx.map.get_mut(fx.id).unwrap();
        assert_eq!(lm.frames_since_depth_update(), 1);

        let pose = SE3::from_translation(Vector3::new(0.5, 0.0, 0.0));
        let m = DepthMeasurement::new(Vector3::new(0.1, 0.1, 5.0), Vector3::new(1e-4, 1e-4, 1.0));
        lm.fuse(&m, &pose).unwrap();

        assert_eq!(lm.frames_since_depth_update(), 0);
        assert_eq!(*lm.last_update_pose(), pose);
    }

    #[test]
    fn test_triangulate_recovers_depth() {
        let ref_pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.0, 0.0, 0.0),
        );
        let p_world = Vector3::new(0.4, -0.2, 5.0);
        let ref_pixel = project(&ref_pose.inverse().transform_point(&p_world));
        let fx = fixture(ref_pose, ref_pixel);
        let lm = fx.map.get(fx.id).unwrap();

        let pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, -0.03, 0.01),
            Vector3::new(0.5, 0.1, 0.0),
        );
        let pixel = project(&pose.inverse().transform_point(&p_world));

        let m = triangulate_measurement(lm, &pixel, &pose, &PointConfig::default()).unwrap();
        let p_ref = ref_pose.inverse().transform_point(&p_world);

        assert_relative_eq!(m.value.z, p_ref.z, epsilon = 1e-9);
        assert_relative_eq!(m.value.x, ref_pixel.x, epsilon = 1e-9);
        assert_relative_eq!(m.value.y, ref_pixel.y, epsilon = 1e-9);
        assert!(m.sigmas.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn test_triangulate_rejects_low_parallax() {
        let fx = fixture(SE3::identity(), Vector2::new(0.0, 0.0));
        let lm = fx.map.get(fx.id).unwrap();

        // Parallel rays from a slightly shifted camera
        let pose = SE3::from_translation(Vector3::new(0.001, 0.0, 0.0));
        let m = triangulate_measurement(lm, &Vector2::new(0.0, 0.0), &pose, &PointConfig::default());
        assert!(m.is_none());
    }

    #[test]
    fn test_fused_triangulation_converges() {
        let p_world = Vector3::new(0.3, 0.1, 4.0);
        let ref_pixel = project(&p_world);
        let mut fx = fixture(SE3::identity(), ref_pixel);
        let config = PointConfig::default();

        for i in 1..=5 {
            let pose = SE3::from_translation(Vector3::new(0.1 * i as f64, 0.0, 0.0));
            let pixel = project(&pose.inverse().transform_point(&p_world));
            let lm = fx.map.get_mut(fx.id).unwrap();
            let m = triangulate_measurement(lm, &pixel, &pose, &config).unwrap();
            lm.fuse(&m, &pose).unwrap();
        }

        let lm = fx.map.get(fx.id).unwrap();
        assert!(!lm.is_guessed());
        assert_relative_eq!(lm.position(), p_world, epsilon = 1e-3);
    }
}
