//! Optimization module for landmark refinement.
//!
//! Implements Gauss-Newton optimization for:
//! - Structure-only bundle adjustment (one landmark position, poses fixed)

pub mod structure_ba;

pub use structure_ba::{refine_landmark, RefineReport};
