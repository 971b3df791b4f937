//! Shared state between the front end and the landmark mapper.
//!
//! The `SharedState` struct holds the map and the frame buffer, each behind a
//! `RwLock`. Readers may traverse under the read lock and flag landmarks
//! obsolete; every structural change happens on the mapper thread under the
//! write lock. When both locks are needed, `frames` is taken before `map`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::map::{FrameBuffer, Map};

/// Shared state accessible by the front end and the mapper thread.
pub struct SharedState {
    /// The landmark map. The mapper is its only writer.
    pub map: RwLock<Map>,

    /// The window of frames observations refer to.
    pub frames: RwLock<FrameBuffer>,

    /// Request the mapper to stop without draining its queue.
    pub shutdown_requested: AtomicBool,
}

impl SharedState {
    /// Create a new SharedState with an empty map.
    ///
    /// # Arguments
    /// * `frame_buffer_size` - Number of frames retained before eviction
    pub fn new(frame_buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(Map::new()),
            frames: RwLock::new(FrameBuffer::new(frame_buffer_size)),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Request shutdown of the mapper thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
