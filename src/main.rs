use std::time::Duration;

use anyhow::{Context, Result};
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use vio_landmarks::atlas::map::LandmarkId;
use vio_landmarks::geometry::projection::project;
use vio_landmarks::geometry::SE3;
use vio_landmarks::logger::init_logger;
use vio_landmarks::system::{FrameMsg, LandmarkSystem, TrackedObservation};
use vio_landmarks::LandmarkConfig;

const NUM_FRAMES: u64 = 80;
const NUM_POINTS: usize = 150;
const KEYFRAME_EVERY: u64 = 4;
const FRAME_PERIOD_NS: u64 = 50_000_000;
/// Half-width of the metric image plane.
const FIELD_OF_VIEW: f64 = 0.6;
/// Uniform metric pixel noise amplitude.
const PIXEL_NOISE: f64 = 5e-4;

/// Camera pose (T_wc) along a gentle sideways arc.
fn camera_pose(t: u64) -> SE3 {
    let s = t as f64 * 0.05;
    let yaw = 0.1 * (0.5 * s).sin();
    SE3::new(
        UnitQuaternion::from_euler_angles(0.0, yaw, 0.0),
        Vector3::new(s, 0.05 * s.sin(), 0.1 * s),
    )
}

fn main() -> Result<()> {
    init_logger();

    let config = match std::env::args().nth(1) {
        Some(path) => LandmarkConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => LandmarkConfig::default(),
    };

    let mut rng = StdRng::seed_from_u64(7);
    let points: Vec<Vector3<f64>> = (0..NUM_POINTS)
        .map(|_| {
            Vector3::new(
                rng.gen_range(-2.0..6.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(3.0..10.0),
            )
        })
        .collect();
    let mut handles: Vec<Option<LandmarkId>> = vec![None; NUM_POINTS];

    let mut system = LandmarkSystem::new(config)?;
    let mut matured = 0;
    let mut swept = 0;

    for t in 0..NUM_FRAMES {
        let pose = camera_pose(t);
        let pose_inv = pose.inverse();

        let mut visible = Vec::new();
        let mut observations = Vec::new();
        {
            let map = system.shared_state().map.read();
            for (i, p) in points.iter().enumerate() {
                let p_cam = pose_inv.transform_point(p);
                if p_cam.z <= 0.0 {
                    continue;
                }
                let uv = project(&p_cam);
                if uv.x.abs() > FIELD_OF_VIEW || uv.y.abs() > FIELD_OF_VIEW {
                    continue;
                }
                let noisy = uv
                    + Vector2::new(
                        rng.gen_range(-PIXEL_NOISE..PIXEL_NOISE),
                        rng.gen_range(-PIXEL_NOISE..PIXEL_NOISE),
                    );

                let tracked = handles[i].filter(|id| map.contains(*id));
                observations.push(match tracked {
                    Some(id) => TrackedObservation::tracked(noisy, id),
                    None => TrackedObservation::new_feature(noisy),
                });
                visible.push(i);
            }
        }

        system.submit(FrameMsg {
            timestamp_ns: t * FRAME_PERIOD_NS,
            pose,
            is_keyframe: t % KEYFRAME_EVERY == 0,
            observations,
        })?;

        let Some(report) = system.recv_report(Duration::from_secs(2)) else {
            warn!("no report for frame {}", t);
            continue;
        };
        for (idx, id) in &report.created {
            handles[visible[*idx]] = Some(*id);
        }
        matured += report.matured;
        swept += report.swept;
    }

    system.shutdown();

    let map = system.shared_state().map.read();
    let errors: Vec<f64> = handles
        .iter()
        .zip(&points)
        .filter_map(|(id, p)| {
            let lm = map.get((*id)?)?;
            (!lm.is_immature()).then(|| (lm.position() - p).norm())
        })
        .collect();
    let mean_error = if errors.is_empty() {
        0.0
    } else {
        errors.iter().sum::<f64>() / errors.len() as f64
    };

    info!(
        "processed {} frames: {} landmarks in map, {} matured, {} swept",
        NUM_FRAMES,
        map.len(),
        matured,
        swept
    );
    info!(
        "{} mature landmarks still tracked, mean position error {:.4} m",
        errors.len(),
        mean_error
    );

    Ok(())
}
