pub mod atlas;
pub mod config;
pub mod error;
pub mod geometry;
pub mod local_mapping;
pub mod logger;
pub mod optimizer;
pub mod system;

pub use config::LandmarkConfig;
pub use error::{LandmarkError, Result};
