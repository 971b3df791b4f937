//! Atlas module - the shared map of landmarks and the frames they refer to.

pub mod map;

pub use map::{Frame, FrameBuffer, FrameId, Landmark, LandmarkId, LandmarkStatus, Map, Observation};
