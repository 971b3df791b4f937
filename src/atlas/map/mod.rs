//! Map module - landmark and frame data structures.
//!
//! This module contains:
//! - [`Observation`] - A 2D measurement owned by a frame
//! - [`FrameBuffer`] - The bounded window of frames observations refer to
//! - [`Landmark`] - A 3D point estimated from its observations
//! - [`Map`] - Arena of landmarks with stable handles and deferred removal
//!
//! # Ownership
//!
//! Frames own observations (`Arc`), landmarks hold weak references to them,
//! and the map owns landmarks. Nothing holds a raw reference into another
//! structure: cross references go through generation-checked handles
//! ([`FrameId`], [`LandmarkId`]) or `Weak` pointers.
//!
//! # Example
//!
//! ```
//! use nalgebra::Vector2;
//! use vio_landmarks::atlas::map::{FrameBuffer, Map};
//! use vio_landmarks::config::PointConfig;
//! use vio_landmarks::geometry::SE3;
//!
//! let mut frames = FrameBuffer::new(10);
//! let mut map = Map::new();
//!
//! let frame = frames.push(0, SE3::identity(), true);
//! let obs = frames.add_observation(frame, Vector2::new(0.1, 0.0)).unwrap();
//! let id = map.create_landmark(&obs, &frames, &PointConfig::default()).unwrap();
//!
//! assert!(map.get(id).unwrap().is_guessed());
//! ```

pub mod frame;
pub mod landmark;
pub mod map;
pub mod observation;
pub mod types;

pub use frame::{Frame, FrameBuffer};
pub use landmark::{Landmark, LandmarkStatus};
pub use map::Map;
pub use observation::Observation;
pub use types::{FrameId, LandmarkId};
