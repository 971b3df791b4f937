//! Landmark mapping: depth fusion and the mapper thread.
//!
//! The mapper thread is responsible for:
//! - Inserting new frames into the frame buffer
//! - Attaching observations and fusing depth measurements
//! - Seeding new landmarks from unmatched features
//! - Running structure-only refinement on immature landmarks
//! - Sweeping landmarks flagged for removal

pub mod depth_filter;
mod local_mapper;

pub use depth_filter::{triangulate_measurement, DepthMeasurement};
pub use local_mapper::LandmarkMapper;
