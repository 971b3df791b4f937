//! Landmark - a 3D point estimated from a sequence of 2D observations.
//!
//! The state is parametrized in the camera of the first observation:
//! `mu = [u, v, depth]` where `(u, v)` is the metric pixel in that camera.
//! Each state component has its own variance on the diagonal of `sigma`;
//! off-diagonal terms are not used by the depth filter.
//!
//! Observations are stored newest-first as weak references. The frame buffer
//! owns them, so a reference to an evicted frame simply stops resolving.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::config::PointConfig;
use crate::error::{LandmarkError, Result};
use crate::geometry::projection::unproject;
use crate::geometry::SE3;

use super::observation::Observation;
use super::types::LandmarkId;

/// Coarse lifecycle state of a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkStatus {
    /// Depth is still the initial guess.
    Guessed,
    /// Depth has been measured but the refiner has not accepted it yet.
    Immature,
    /// Passed structure-only refinement.
    Mature,
    /// Flagged for removal by the next sweep.
    Obsolete,
    /// Removed from its map.
    Deleted,
}

/// A landmark tracked by the map.
pub struct Landmark {
    id: LandmarkId,

    /// `[u, v, depth]` in the first observing camera.
    pub(crate) mu: Vector3<f64>,

    /// Per-component variances on the diagonal.
    pub(crate) sigma: Matrix3<f64>,

    /// Newest first.
    observations: VecDeque<Weak<Observation>>,

    /// Sequence number of the newest observation's frame.
    newest_sequence: u64,

    max_observations: usize,

    pub(crate) min_depth: f64,
    pub(crate) max_depth: f64,

    pub(crate) immature: bool,
    pub(crate) guessed: bool,
    deleted: bool,
    moba_candidate: bool,

    pub(crate) frames_since_depth_update: u32,

    initial_camera_pose: SE3,
    initial_camera_pose_inv: SE3,

    /// Pose of the frame that produced the last fused measurement.
    pub(crate) last_update_pose: SE3,
}

impl Landmark {
    /// Create a landmark seeded by its first observation.
    ///
    /// The pixel components of the state come from the observation, the
    /// depth from `config.default_depth`. The landmark starts guessed and
    /// immature with `min_depth == max_depth == depth`.
    ///
    /// # Arguments
    /// * `id` - Slot handle assigned by the owning map
    /// * `first` - The seeding observation
    /// * `camera_pose` - Pose (T_wc) of the frame that produced `first`
    /// * `config` - Priors for the state and its variances
    pub(crate) fn new(
        id: LandmarkId,
        first: &Arc<Observation>,
        camera_pose: &SE3,
        config: &PointConfig,
    ) -> Self {
        let pixel = first.pixel();
        let depth = config.default_depth;

        let mut sigma = Matrix3::identity();
        sigma[(0, 0)] = config.homogeneous_variance;
        sigma[(1, 1)] = config.homogeneous_variance;
        sigma[(2, 2)] = config.depth_variance;

        let mut observations = VecDeque::new();
        observations.push_front(Arc::downgrade(first));

        Self {
            id,
            mu: Vector3::new(pixel.x, pixel.y, depth),
            sigma,
            observations,
            newest_sequence: first.sequence(),
            max_observations: config.max_observations,
            min_depth: depth,
            max_depth: depth,
            immature: true,
            guessed: true,
            deleted: false,
            moba_candidate: false,
            frames_since_depth_update: 0,
            initial_camera_pose: *camera_pose,
            initial_camera_pose_inv: camera_pose.inverse(),
            last_update_pose: *camera_pose,
        }
    }

    pub fn id(&self) -> LandmarkId {
        self.id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn mu(&self) -> &Vector3<f64> {
        &self.mu
    }

    pub fn sigma(&self) -> &Matrix3<f64> {
        &self.sigma
    }

    /// Metric pixel of the landmark in its first observing camera.
    pub fn pixel(&self) -> Vector2<f64> {
        Vector2::new(self.mu.x, self.mu.y)
    }

    /// Current depth estimate in the first observing camera.
    pub fn depth(&self) -> f64 {
        self.mu.z
    }

    /// Per-component variances `[σu, σv, σd]`.
    pub fn variances(&self) -> Vector3<f64> {
        self.sigma.diagonal()
    }

    pub fn depth_variance(&self) -> f64 {
        self.sigma[(2, 2)]
    }

    /// Scalar uncertainty: the trace of `sigma`.
    pub fn variance(&self) -> f64 {
        self.sigma.trace()
    }

    /// 3D position in the world frame.
    pub fn position(&self) -> Vector3<f64> {
        self.initial_camera_pose
            .transform_point(&unproject(&self.pixel(), self.depth()))
    }

    /// Depth of the landmark in a camera given by its T_cw.
    pub fn depth_in(&self, pose_inv: &SE3) -> f64 {
        pose_inv.transform_point(&self.position()).z
    }

    /// Re-express a world point in the landmark's state parametrization.
    ///
    /// Returns false (leaving the state untouched) if the point is not in
    /// front of the first observing camera.
    pub(crate) fn set_position(&mut self, p_world: &Vector3<f64>) -> bool {
        let p = self.initial_camera_pose_inv.transform_point(p_world);
        if !(p.z > 0.0) {
            return false;
        }
        self.mu = Vector3::new(p.x / p.z, p.y / p.z, p.z);
        true
    }

    /// Replace the initial depth guess.
    ///
    /// Only valid while the landmark is still guessed; keeps
    /// `min_depth == max_depth == depth`.
    pub fn set_depth_guess(&mut self, depth: f64) -> bool {
        if !self.guessed || !(depth > 0.0) || !depth.is_finite() {
            return false;
        }
        self.mu.z = depth;
        self.min_depth = depth;
        self.max_depth = depth;
        true
    }

    pub fn min_depth(&self) -> f64 {
        self.min_depth
    }

    pub fn max_depth(&self) -> f64 {
        self.max_depth
    }

    pub fn initial_camera_pose(&self) -> &SE3 {
        &self.initial_camera_pose
    }

    pub fn initial_camera_pose_inv(&self) -> &SE3 {
        &self.initial_camera_pose_inv
    }

    pub fn last_update_pose(&self) -> &SE3 {
        &self.last_update_pose
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Flags
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_immature(&self) -> bool {
        self.immature
    }

    pub fn is_guessed(&self) -> bool {
        self.guessed
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_moba_candidate(&self) -> bool {
        self.moba_candidate
    }

    pub fn set_moba_candidate(&mut self, candidate: bool) {
        self.moba_candidate = candidate;
    }

    pub fn frames_since_depth_update(&self) -> u32 {
        self.frames_since_depth_update
    }

    /// Set `deleted`. Write-once: a second call is a `DoubleDeletion`.
    pub(crate) fn mark_deleted(&mut self) -> Result<()> {
        if self.deleted {
            return Err(LandmarkError::DoubleDeletion(self.id));
        }
        self.deleted = true;
        Ok(())
    }

    pub fn status(&self) -> LandmarkStatus {
        if self.deleted {
            LandmarkStatus::Deleted
        } else if self.is_obsolete() {
            LandmarkStatus::Obsolete
        } else if self.guessed {
            LandmarkStatus::Guessed
        } else if self.immature {
            LandmarkStatus::Immature
        } else {
            LandmarkStatus::Mature
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a new observation at the front.
    ///
    /// The observation must come from a strictly newer frame than every
    /// observation already held. A landmark marked obsolete refuses new
    /// observations so that the mark survives until the next sweep. Oldest references beyond the configured
    /// maximum are dropped, as are expired references at the tail.
    pub fn add_observation(&mut self, obs: &Arc<Observation>) -> Result<()> {
        // A pending removal request lives on the newest observation
        if self.is_obsolete() {
            return Err(LandmarkError::MarkedObsolete(self.id));
        }
        if obs.sequence() <= self.newest_sequence {
            return Err(LandmarkError::OutOfOrderObservation {
                got: obs.sequence(),
                newest: self.newest_sequence,
            });
        }

        self.observations.push_front(Arc::downgrade(obs));
        self.newest_sequence = obs.sequence();
        self.frames_since_depth_update += 1;

        self.observations.truncate(self.max_observations);
        while self.observations.len() > 1
            && self
                .observations
                .back()
                .is_some_and(|w| w.strong_count() == 0)
        {
            self.observations.pop_back();
        }
        Ok(())
    }

    /// Live observations, newest first. Expired references are skipped.
    pub fn observations(&self) -> impl Iterator<Item = Arc<Observation>> + '_ {
        self.observations.iter().filter_map(Weak::upgrade)
    }

    /// Number of stored references, including expired ones.
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn live_observation_count(&self) -> usize {
        self.observations.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// The most recent observation, if its frame is still buffered.
    pub fn newest_observation(&self) -> Option<Arc<Observation>> {
        self.observations.front().and_then(Weak::upgrade)
    }

    /// Frames are evicted oldest first, so if the newest observation expired
    /// every older one has too.
    pub fn has_live_observations(&self) -> bool {
        self.newest_observation().is_some()
    }

    pub fn is_obsolete(&self) -> bool {
        self.newest_observation()
            .is_some_and(|obs| obs.is_obsolete())
    }

    /// Flag the newest observation obsolete so the landmark is removed by the
    /// next sweep. Safe to call from a shared traversal.
    ///
    /// Returns false if no live observation remains (the sweep removes such
    /// landmarks anyway).
    pub fn mark_obsolete(&self) -> bool {
        match self.newest_observation() {
            Some(obs) => {
                obs.mark_obsolete();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Landmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Landmark")
            .field("id", &self.id)
            .field("mu", &self.mu)
            .field("variances", &self.variances())
            .field("observations", &self.observations.len())
            .field("status", &self.status())
            .finish()
    }
}
