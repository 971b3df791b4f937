//! Observation - a single 2D measurement of a landmark from one frame.
//!
//! Observations are owned by their frame (through `Arc`) and referenced
//! weakly by landmarks. Once the frame leaves the buffer, the landmark's
//! reference stops resolving instead of dangling.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector2;

use super::types::FrameId;

/// A metric pixel measurement taken in one frame.
///
/// Immutable after creation except for the `obsolete` flag, which is the
/// only cross-component signal used to defer deletion of a landmark. The flag
/// is atomic so it can be raised while other readers traverse the frame's
/// observation list.
#[derive(Debug)]
pub struct Observation {
    pixel: Vector2<f64>,
    frame: FrameId,
    sequence: u64,
    obsolete: AtomicBool,
}

impl Observation {
    /// Create an observation.
    ///
    /// # Arguments
    /// * `pixel` - Metric (normalized) pixel coordinates
    /// * `frame` - Handle of the frame that owns this observation
    /// * `sequence` - Monotonic sequence number of that frame
    pub fn new(pixel: Vector2<f64>, frame: FrameId, sequence: u64) -> Self {
        Self {
            pixel,
            frame,
            sequence,
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn pixel(&self) -> &Vector2<f64> {
        &self.pixel
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Sequence number of the owning frame; increases with time.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Flag this observation so that its landmark is removed by the next sweep.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use std::sync::Arc;

    #[test]
    fn test_obsolete_flag_visible_through_shared_refs() {
        let mut frames: SlotMap<FrameId, ()> = SlotMap::with_key();
        let frame = frames.insert(());

        let obs = Arc::new(Observation::new(Vector2::new(0.1, 0.2), frame, 7));
        let weak = Arc::downgrade(&obs);

        assert!(!obs.is_obsolete());
        weak.upgrade().unwrap().mark_obsolete();
        assert!(obs.is_obsolete());
        assert_eq!(obs.sequence(), 7);
        assert_eq!(obs.frame(), frame);
    }
}
