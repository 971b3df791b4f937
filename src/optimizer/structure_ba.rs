//! Structure-only bundle adjustment of a single landmark.
//!
//! Refines a landmark's 3D position by minimizing the reprojection error over
//! a bounded set of its keyframe observations, with all camera poses held
//! fixed. Uses Gauss-Newton on the 3-DOF point:
//!
//! ```text
//! e_k   = z_k - π(T_cw_k · p)
//! A     = Σ J_kᵀ J_k
//! b     = -Σ J_kᵀ e_k
//! A·dp  = b
//! ```
//!
//! An iteration whose error grew, or whose step is not finite, rolls the point
//! back to the last accepted estimate and ends the optimization. The result is
//! committed only if it passes the acceptance checks; otherwise the landmark's
//! newest observation is flagged obsolete and the landmark is left for the
//! next sweep to remove.

use nalgebra::{Matrix3, Vector2, Vector3};
use tracing::{debug, trace, warn};

use crate::atlas::map::{FrameBuffer, Landmark};
use crate::config::RefinerConfig;
use crate::error::{LandmarkError, Result};
use crate::geometry::projection::{jacobian_xyz2uv, project};
use crate::geometry::SE3;

/// Summary of an accepted refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineReport {
    /// Number of Gauss-Newton iterations performed.
    pub iterations: usize,
    /// Squared reprojection error of the last accepted estimate.
    pub chi2: f64,
    /// `chi2` divided by the number of keyframe observations.
    pub mean_residual: f64,
    /// Depth of the refined point in the camera of the landmark's newest
    /// observation.
    pub depth: f64,
    /// Number of keyframe observations used.
    pub num_keyframes: usize,
    /// Iteration at which the optimization rolled back, if it did.
    pub failed_at: Option<usize>,
}

/// A keyframe observation taking part in the problem.
struct Vertex {
    pixel: Vector2<f64>,
    pose_inv: SE3,
}

struct Solution {
    point: Vector3<f64>,
    chi2: f64,
    iterations: usize,
    failed_at: Option<usize>,
}

/// Refine `landmark` against its keyframe observations.
///
/// The depth check of the acceptance test is made in the frame of the
/// landmark's newest observation, falling back to the newest selected
/// keyframe when that frame cannot be resolved.
///
/// # Errors
/// * `NotEnoughKeyframes` - fewer than `config.min_keyframes` (and never
///   fewer than one) usable keyframe observations; the landmark is not
///   touched.
/// * `Divergence` - the optimization failed within the first
///   `config.early_failure_window` iterations.
/// * `Rejected` - the result failed the variance, depth or nonzero-error check.
///
/// On `Divergence` and `Rejected` the estimate is left unchanged and the
/// newest observation is flagged obsolete.
pub fn refine_landmark(
    landmark: &mut Landmark,
    frames: &FrameBuffer,
    config: &RefinerConfig,
) -> Result<RefineReport> {
    let vertices = select_keyframe_vertices(landmark, frames, config.max_keyframes);
    let required = config.min_keyframes.max(1);
    let Some(newest_keyframe) = vertices.first().filter(|_| vertices.len() >= required) else {
        debug!(
            "not enough keyframes to refine {}: {} < {}",
            landmark.id(),
            vertices.len(),
            required
        );
        return Err(LandmarkError::NotEnoughKeyframes {
            found: vertices.len(),
            required,
        });
    };

    // Camera of the most recent observation
    let newest_pose_inv = landmark
        .newest_observation()
        .and_then(|obs| frames.get(obs.frame()))
        .map_or(newest_keyframe.pose_inv, |frame| *frame.pose_inv());

    trace!("point before: {:?}", landmark.position());
    let solution = gauss_newton(landmark.position(), config, |point| {
        build_normal_equations(point, &vertices)
    });

    let depth = newest_pose_inv.transform_point(&solution.point).z;
    let mean_residual = solution.chi2 / vertices.len() as f64;
    let verdict = check_acceptance(&solution, depth, mean_residual, config);

    if verdict.is_ok() && commit(landmark, &solution.point) {
        debug!(
            "refined {}: depth {:.3}, variance {:.3e} after {} iterations",
            landmark.id(),
            depth,
            mean_residual,
            solution.iterations
        );
        return Ok(RefineReport {
            iterations: solution.iterations,
            chi2: solution.chi2,
            mean_residual,
            depth,
            num_keyframes: vertices.len(),
            failed_at: solution.failed_at,
        });
    }

    warn!(
        "landmark {} failed to converge, flagging for removal. depth: {:.3} variance: {:.3e}",
        landmark.id(),
        depth,
        mean_residual
    );
    // The caller may be iterating the map; defer the actual deletion.
    landmark.mark_obsolete();

    Err(match verdict {
        Err(e) => e,
        // Passed the checks but lies behind the reference camera
        Ok(()) => LandmarkError::Rejected {
            depth,
            variance: mean_residual,
            chi2: solution.chi2,
        },
    })
}

/// Acceptance test on a finished optimization.
fn check_acceptance(
    solution: &Solution,
    depth: f64,
    mean_residual: f64,
    config: &RefinerConfig,
) -> Result<()> {
    if let Some(iteration) = solution.failed_at {
        if iteration < config.early_failure_window {
            return Err(LandmarkError::Divergence {
                iteration,
                chi2: solution.chi2,
            });
        }
    }

    let accepted = mean_residual < config.max_variance
        && depth > config.min_depth
        && depth < config.max_depth
        && solution.chi2 != 0.0;
    if accepted {
        Ok(())
    } else {
        Err(LandmarkError::Rejected {
            depth,
            variance: mean_residual,
            chi2: solution.chi2,
        })
    }
}

/// Collect keyframe observations, newest first.
///
/// Stops at `max_keyframes`, at the buffer's final frame, or at the first
/// observation whose frame no longer resolves.
fn select_keyframe_vertices(
    landmark: &Landmark,
    frames: &FrameBuffer,
    max_keyframes: usize,
) -> Vec<Vertex> {
    let mut vertices = Vec::with_capacity(max_keyframes);

    for obs in landmark.observations() {
        let Some(frame) = frames.get(obs.frame()) else {
            debug!("stopping keyframe search: frame left the buffer");
            break;
        };

        if frame.is_keyframe {
            vertices.push(Vertex {
                pixel: *obs.pixel(),
                pose_inv: *frame.pose_inv(),
            });
            if vertices.len() >= max_keyframes {
                break;
            }
        }

        if frame.is_final_frame() {
            debug!("stopping keyframe search at the final frame");
            break;
        }
    }

    vertices
}

/// Accumulate the normal equations at `point`.
fn build_normal_equations(
    point: &Vector3<f64>,
    vertices: &[Vertex],
) -> (Matrix3<f64>, Vector3<f64>, f64) {
    let mut a = Matrix3::zeros();
    let mut b = Vector3::zeros();
    let mut chi2 = 0.0;

    for vertex in vertices {
        let p_in_f = vertex.pose_inv.transform_point(point);
        let j = jacobian_xyz2uv(&p_in_f, &vertex.pose_inv.rotation_matrix());
        let e = vertex.pixel - project(&p_in_f);

        chi2 += e.norm_squared();
        a += j.transpose() * j;
        b -= j.transpose() * e;
    }

    (a, b, chi2)
}

/// Gauss-Newton with rollback.
///
/// `normal_equations` returns `(A, b, chi2)` evaluated at a point.
fn gauss_newton<F>(initial: Vector3<f64>, config: &RefinerConfig, mut normal_equations: F) -> Solution
where
    F: FnMut(&Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>, f64),
{
    let mut point = initial;
    // Point at which `chi2` was evaluated
    let mut best_point = initial;
    let mut chi2 = 0.0;
    let mut failed_at = None;
    let mut iterations = 0;

    for i in 0..config.max_iterations {
        iterations = i + 1;

        let (a, b, new_chi2) = normal_equations(&point);
        let step = a.cholesky().map(|llt| llt.solve(&b));

        let increased = i > 0 && new_chi2 > chi2;
        let dp = match step {
            Some(dp) if !increased && new_chi2.is_finite() && dp.iter().all(|x| x.is_finite()) => dp,
            _ => {
                trace!("it {} FAILURE new_chi2 = {}", i, new_chi2);
                failed_at = Some(i);
                point = best_point;
                break;
            }
        };

        best_point = point;
        chi2 = new_chi2;
        point += dp;

        trace!("it {} success new_chi2 = {} norm(b) = {}", i, new_chi2, b.norm());

        if dp.norm() <= config.convergence_eps {
            break;
        }
    }

    Solution {
        point,
        chi2,
        iterations,
        failed_at,
    }
}

/// Write the refined point into the landmark and mark it mature.
fn commit(landmark: &mut Landmark, point: &Vector3<f64>) -> bool {
    if !landmark.set_position(point) {
        return false;
    }

    let depth = landmark.depth();
    if landmark.guessed {
        landmark.min_depth = depth;
        landmark.max_depth = depth;
    } else {
        landmark.min_depth = landmark.min_depth.min(depth);
        landmark.max_depth = landmark.max_depth.max(depth);
    }
    landmark.immature = false;
    landmark.guessed = false;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{LandmarkId, LandmarkStatus, Map};
    use crate::config::PointConfig;
    use approx::assert_relative_eq;

    /// Binary-exact values so that the true point reprojects with exactly zero
    /// error.
    const TRUE_POINT: Vector3<f64> = Vector3::new(0.5, -0.25, 4.0);

    struct Scene {
        frames: FrameBuffer,
        map: Map,
        id: LandmarkId,
    }

    /// One landmark observed from cameras translated along x. The first camera
    /// sits at the origin and seeds the landmark.
    fn scene(camera_x: &[f64], keyframes: &[bool]) -> Scene {
        let mut frames = FrameBuffer::new(16);
        let mut map = Map::new();
        let mut id = None;

        for (t, (&x, &is_kf)) in camera_x.iter().zip(keyframes).enumerate() {
            let pose = SE3::from_translation(Vector3::new(x, 0.0, 0.0));
            let frame = frames.push(t as u64, pose, is_kf);
            let pose_inv = *frames.get(frame).unwrap().pose_inv();
            let pixel = project(&pose_inv.transform_point(&TRUE_POINT));
            let obs = frames.add_observation(frame, pixel).unwrap();

            match id {
                None => {
                    id = Some(map.create_landmark(&obs, &frames, &PointConfig::default()).unwrap())
                }
                Some(id) => map.attach_observation(id, &obs).unwrap(),
            }
        }

        Scene {
            frames,
            map,
            id: id.unwrap(),
        }
    }

    fn test_config() -> RefinerConfig {
        RefinerConfig {
            convergence_eps: 1e-6,
            ..RefinerConfig::default()
        }
    }

    #[test]
    fn test_converges_to_true_point() {
        let mut s = scene(&[0.0, 0.5, 1.0, -0.5], &[true; 4]);
        let lm = s.map.get_mut(s.id).unwrap();
        assert!(lm.set_depth_guess(3.0));

        let report = refine_landmark(lm, &s.frames, &test_config()).unwrap();

        assert_relative_eq!(lm.position(), TRUE_POINT, epsilon = 1e-6);
        assert!(report.chi2 > 0.0);
        assert!(report.mean_residual < test_config().max_variance);
        assert!(report.iterations <= test_config().max_iterations);
        assert_eq!(report.num_keyframes, 4);
        assert!(!lm.is_immature());
        assert!(!lm.is_guessed());
        assert_eq!(lm.status(), LandmarkStatus::Mature);
        assert!(!lm.is_obsolete());
    }

    #[test]
    fn test_exact_solution_with_zero_chi2_rejected() {
        let mut s = scene(&[0.0, 0.5, 1.0], &[true; 3]);
        let lm = s.map.get_mut(s.id).unwrap();
        assert!(lm.set_depth_guess(TRUE_POINT.z));
        assert_eq!(lm.position(), TRUE_POINT);

        let err = refine_landmark(lm, &s.frames, &test_config()).unwrap_err();

        assert!(matches!(err, LandmarkError::Rejected { chi2, .. } if chi2 == 0.0));
        assert!(lm.is_immature());
        assert!(lm.is_obsolete());
        assert_eq!(lm.position(), TRUE_POINT);
    }

    #[test]
    fn test_not_enough_keyframes_leaves_landmark_untouched() {
        let mut s = scene(&[0.0, 0.5, 1.0], &[true, false, false]);
        let lm = s.map.get_mut(s.id).unwrap();
        assert!(lm.set_depth_guess(3.0));
        let mu = *lm.mu();
        let sigma = *lm.sigma();

        let err = refine_landmark(lm, &s.frames, &test_config()).unwrap_err();

        assert_eq!(
            err,
            LandmarkError::NotEnoughKeyframes {
                found: 1,
                required: 2
            }
        );
        assert_eq!(*lm.mu(), mu);
        assert_eq!(*lm.sigma(), sigma);
        assert!(!lm.is_obsolete());
        assert!(lm.is_immature());
    }

    #[test]
    fn test_keyframe_count_capped() {
        let mut s = scene(&[0.0, 0.5, 1.0, -0.5, 0.25], &[true; 5]);
        let lm = s.map.get_mut(s.id).unwrap();
        assert!(lm.set_depth_guess(3.0));

        let config = RefinerConfig {
            max_keyframes: 2,
            ..test_config()
        };
        let report = refine_landmark(lm, &s.frames, &config).unwrap();
        assert_eq!(report.num_keyframes, 2);
    }

    #[test]
    fn test_non_finite_first_iteration_is_divergence() {
        // The second camera sits on the initial point estimate: 0/0 projection
        let mut s = scene(&[0.0, 0.5, 1.0], &[true; 3]);
        let lm = s.map.get_mut(s.id).unwrap();
        assert!(lm.set_depth_guess(3.0));
        let start = lm.position();
        let on_point = SE3::from_translation(start);
        let newest = lm.newest_observation().unwrap().frame();
        s.frames.get_mut(newest).unwrap().set_pose(on_point);

        let err = refine_landmark(lm, &s.frames, &test_config()).unwrap_err();

        assert!(matches!(err, LandmarkError::Divergence { iteration: 0, .. }));
        assert_eq!(lm.position(), start);
        assert!(lm.is_obsolete());
        assert!(lm.is_immature());
    }

    #[test]
    fn test_depth_out_of_range_rejected() {
        let mut s = scene(&[0.0, 0.5, 1.0], &[true; 3]);
        let lm = s.map.get_mut(s.id).unwrap();
        assert!(lm.set_depth_guess(3.0));
        let start = lm.position();

        let config = RefinerConfig {
            max_depth: 2.0,
            ..test_config()
        };
        let err = refine_landmark(lm, &s.frames, &config).unwrap_err();

        assert!(matches!(err, LandmarkError::Rejected { depth, .. } if depth > 2.0));
        assert_eq!(lm.position(), start);
        assert!(lm.is_obsolete());
    }

    #[test]
    fn test_selection_stops_at_evicted_frames() {
        let mut frames = FrameBuffer::new(2);
        let mut map = Map::new();
        let f0 = frames.push(0, SE3::identity(), true);
        let obs0 = frames.add_observation(f0, project(&TRUE_POINT)).unwrap();
        let id = map.create_landmark(&obs0, &frames, &PointConfig::default()).unwrap();
        drop(obs0);

        for (t, x) in [(1, 0.5), (2, 1.0)] {
            let pose = SE3::from_translation(Vector3::new(x, 0.0, 0.0));
            let f = frames.push(t, pose, true);
            let pixel = project(&frames.get(f).unwrap().pose_inv().transform_point(&TRUE_POINT));
            let obs = frames.add_observation(f, pixel).unwrap();
            map.attach_observation(id, &obs).unwrap();
        }

        // The seeding frame was evicted; only two keyframes remain usable
        let lm = map.get(id).unwrap();
        assert_eq!(select_keyframe_vertices(lm, &frames, 5).len(), 2);

        let s = scene(&[0.0, 0.5, 1.0], &[true; 3]);
        let lm = s.map.get(s.id).unwrap();
        assert_eq!(select_keyframe_vertices(lm, &s.frames, 5).len(), 3);
    }

    /// Normal equations with `A = I`, a unit step along x and a scripted
    /// error sequence.
    fn scripted(chi2s: &'static [f64]) -> impl FnMut(&Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>, f64) {
        let mut calls = 0;
        move |_| {
            let chi2 = chi2s[calls.min(chi2s.len() - 1)];
            calls += 1;
            (Matrix3::identity(), Vector3::new(1.0, 0.0, 0.0), chi2)
        }
    }

    #[test]
    fn test_error_increase_rolls_back_to_best_point() {
        let initial = Vector3::new(0.0, 0.0, 5.0);
        let solution = gauss_newton(initial, &test_config(), scripted(&[4.0, 1.0, 2.0]));

        assert_eq!(solution.failed_at, Some(2));
        assert_eq!(solution.iterations, 3);
        assert_eq!(solution.chi2, 1.0);
        // The point where chi2 = 1 was evaluated, not the one where it grew
        assert_eq!(solution.point, Vector3::new(1.0, 0.0, 5.0));
    }

    #[test]
    fn test_error_increase_at_second_iteration() {
        let initial = Vector3::new(0.0, 0.0, 5.0);
        let solution = gauss_newton(initial, &test_config(), scripted(&[4.0, 5.0]));

        assert_eq!(solution.failed_at, Some(1));
        assert_eq!(solution.chi2, 4.0);
        assert_eq!(solution.point, initial);
    }

    #[test]
    fn test_iteration_cap_without_failure() {
        let config = RefinerConfig {
            max_iterations: 4,
            ..test_config()
        };
        let solution = gauss_newton(Vector3::zeros(), &config, scripted(&[3.0, 2.0, 1.0, 0.5]));

        assert_eq!(solution.failed_at, None);
        assert_eq!(solution.iterations, 4);
        assert_eq!(solution.chi2, 0.5);
        assert_eq!(solution.point, Vector3::new(4.0, 0.0, 0.0));
    }

    fn solution(failed_at: Option<usize>) -> Solution {
        Solution {
            point: TRUE_POINT,
            chi2: 1e-9,
            iterations: 3,
            failed_at,
        }
    }

    #[test]
    fn test_acceptance_early_failure_window() {
        let config = test_config();
        assert_eq!(config.early_failure_window, 2);

        let err = check_acceptance(&solution(Some(1)), 4.0, 1e-9, &config).unwrap_err();
        assert_eq!(
            err,
            LandmarkError::Divergence {
                iteration: 1,
                chi2: 1e-9
            }
        );

        // A later rollback keeps the best estimate, which may still pass
        check_acceptance(&solution(Some(2)), 4.0, 1e-9, &config).unwrap();
        check_acceptance(&solution(None), 4.0, 1e-9, &config).unwrap();

        let err = check_acceptance(&solution(Some(2)), 200.0, 1e-9, &config).unwrap_err();
        assert!(matches!(err, LandmarkError::Rejected { .. }));
        let err = check_acceptance(&solution(None), 4.0, 1.0, &config).unwrap_err();
        assert!(matches!(err, LandmarkError::Rejected { .. }));
    }

    #[test]
    fn test_zero_min_keyframes_without_keyframes() {
        let mut s = scene(&[0.0], &[false]);
        let lm = s.map.get_mut(s.id).unwrap();
        let mu = *lm.mu();

        let config = RefinerConfig {
            min_keyframes: 0,
            ..test_config()
        };
        let err = refine_landmark(lm, &s.frames, &config).unwrap_err();

        assert_eq!(
            err,
            LandmarkError::NotEnoughKeyframes {
                found: 0,
                required: 1
            }
        );
        assert_eq!(*lm.mu(), mu);
        assert!(!lm.is_obsolete());
    }

    #[test]
    fn test_depth_checked_in_newest_observation_frame() {
        let mut s = scene(&[0.0, 0.5, 1.0, 0.25], &[true, true, true, false]);
        let lm = s.map.get_mut(s.id).unwrap();
        assert!(lm.set_depth_guess(3.0));

        // Move the newest (non-key) frame right in front of the point
        let newest = lm.newest_observation().unwrap().frame();
        let close = SE3::from_translation(Vector3::new(0.0, 0.0, 3.95));
        s.frames.get_mut(newest).unwrap().set_pose(close);

        let err = refine_landmark(lm, &s.frames, &test_config()).unwrap_err();

        match err {
            LandmarkError::Rejected { depth, .. } => {
                assert_relative_eq!(depth, TRUE_POINT.z - 3.95, epsilon = 1e-4)
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(lm.is_obsolete());
    }
}
