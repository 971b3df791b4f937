//! Inter-thread message types.
//!
//! Frames travel from the front end to the landmark mapper over a bounded
//! channel; the mapper answers each processed frame with a [`MapperReport`].

use nalgebra::Vector2;

use crate::atlas::map::LandmarkId;
use crate::geometry::SE3;
use crate::local_mapping::DepthMeasurement;

/// A feature observed in a frame.
#[derive(Debug, Clone)]
pub struct TrackedObservation {
    /// Metric pixel (normalized image plane coordinates).
    pub pixel: Vector2<f64>,

    /// The landmark this feature was matched to, or `None` to seed a new one.
    pub landmark: Option<LandmarkId>,

    /// Depth measurement in the landmark's reference frame, if the front end
    /// has one. Without it the mapper triangulates against the first
    /// observation.
    pub measurement: Option<DepthMeasurement>,
}

impl TrackedObservation {
    /// A feature with no landmark yet.
    pub fn new_feature(pixel: Vector2<f64>) -> Self {
        Self {
            pixel,
            landmark: None,
            measurement: None,
        }
    }

    /// A feature matched to an existing landmark.
    pub fn tracked(pixel: Vector2<f64>, landmark: LandmarkId) -> Self {
        Self {
            pixel,
            landmark: Some(landmark),
            measurement: None,
        }
    }

    pub fn with_measurement(mut self, measurement: DepthMeasurement) -> Self {
        self.measurement = Some(measurement);
        self
    }
}

/// Message sent to the landmark mapper for every frame.
#[derive(Debug, Clone)]
pub struct FrameMsg {
    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose estimate from the front end (T_wc: camera to world).
    pub pose: SE3,

    /// Whether the front end selected this frame as a keyframe.
    pub is_keyframe: bool,

    pub observations: Vec<TrackedObservation>,
}

/// What the mapper did with one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapperReport {
    /// Sequence number the frame was assigned in the buffer.
    pub sequence: u64,

    /// Landmarks seeded by this frame, as `(observation index, handle)`.
    pub created: Vec<(usize, LandmarkId)>,

    /// Observations whose landmark handle was stale or out of order.
    pub dropped: usize,

    /// Depth measurements fused.
    pub fused: usize,

    /// Refinement attempts that had enough keyframes to run.
    pub refined: usize,

    /// Refinements that were accepted.
    pub matured: usize,

    /// Refinements that were rejected.
    pub rejected: usize,

    /// Guessed landmarks flagged obsolete for never receiving a depth update.
    pub stale: usize,

    /// Landmarks erased by the sweep.
    pub swept: usize,
}
