//! Geometry utilities: SE3 transforms, pinhole projection.

pub mod projection;
pub mod se3;

pub use se3::SE3;
