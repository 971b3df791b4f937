//! System orchestration and thread management.
//!
//! This module contains the top-level `LandmarkSystem` that spawns and
//! coordinates the mapper thread, along with shared state and inter-thread
//! messaging types.

mod landmark_system;
pub mod messages;
pub mod shared_state;

pub use landmark_system::LandmarkSystem;
pub use messages::{FrameMsg, MapperReport, TrackedObservation};
pub use shared_state::SharedState;
