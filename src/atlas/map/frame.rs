//! Frame and FrameBuffer - the bounded window of frames observations refer to.
//!
//! Frames own their observations. When a frame is evicted from the buffer its
//! observations are dropped, so every landmark's weak reference to them stops
//! resolving. The oldest retained frame carries the `final_frame` flag: a scan
//! walking a landmark's observations from newest to oldest must not go past it.

use std::collections::VecDeque;
use std::sync::Arc;

use nalgebra::Vector2;
use slotmap::SlotMap;
use tracing::debug;

use crate::error::{LandmarkError, Result};
use crate::geometry::SE3;

use super::observation::Observation;
use super::types::FrameId;

/// A camera frame retained for landmark estimation.
#[derive(Debug)]
pub struct Frame {
    /// Handle of this frame in its buffer.
    pub id: FrameId,

    /// Monotonic sequence number, assigned on insertion.
    pub sequence: u64,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose: transform from camera to world (T_wc).
    pose: SE3,

    /// Cached inverse pose (T_cw).
    pose_inv: SE3,

    /// Whether this frame was selected as a keyframe upstream.
    pub is_keyframe: bool,

    /// Set on the oldest frame still in the buffer.
    final_frame: bool,

    observations: Vec<Arc<Observation>>,
}

impl Frame {
    fn new(id: FrameId, sequence: u64, timestamp_ns: u64, pose: SE3, is_keyframe: bool) -> Self {
        Self {
            id,
            sequence,
            timestamp_ns,
            pose,
            pose_inv: pose.inverse(),
            is_keyframe,
            final_frame: false,
            observations: Vec::new(),
        }
    }

    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    pub fn pose_inv(&self) -> &SE3 {
        &self.pose_inv
    }

    /// Replace the pose (e.g. after upstream re-estimation).
    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = pose;
        self.pose_inv = pose.inverse();
    }

    pub fn is_final_frame(&self) -> bool {
        self.final_frame
    }

    pub fn observations(&self) -> &[Arc<Observation>] {
        &self.observations
    }
}

/// Bounded buffer of the most recent frames, oldest evicted first.
pub struct FrameBuffer {
    frames: SlotMap<FrameId, Frame>,

    /// Frame handles in temporal order (front = oldest).
    order: VecDeque<FrameId>,

    capacity: usize,

    next_sequence: u64,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: SlotMap::with_key(),
            order: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(1),
            next_sequence: 0,
        }
    }

    /// Append a frame, evicting the oldest frames beyond capacity.
    ///
    /// Evicted frames drop their observations.
    pub fn push(&mut self, timestamp_ns: u64, pose: SE3, is_keyframe: bool) -> FrameId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let id = self
            .frames
            .insert_with_key(|id| Frame::new(id, sequence, timestamp_ns, pose, is_keyframe));
        self.order.push_back(id);

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                if let Some(frame) = self.frames.remove(evicted) {
                    debug!(
                        "evicted frame #{} with {} observations",
                        frame.sequence,
                        frame.observations.len()
                    );
                }
            }
        }

        self.update_final_frame();
        id
    }

    fn update_final_frame(&mut self) {
        let oldest = self.order.front().copied();
        for (id, frame) in self.frames.iter_mut() {
            frame.final_frame = Some(id) == oldest;
        }
    }

    /// Create an observation owned by `frame`.
    pub fn add_observation(&mut self, frame: FrameId, pixel: Vector2<f64>) -> Result<Arc<Observation>> {
        let f = self
            .frames
            .get_mut(frame)
            .ok_or(LandmarkError::FrameNotFound(frame))?;
        let obs = Arc::new(Observation::new(pixel, frame, f.sequence));
        f.observations.push(Arc::clone(&obs));
        Ok(obs)
    }

    /// Resolve a frame handle. `None` once the frame has been evicted.
    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(id)
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.frames.contains_key(id)
    }

    pub fn newest(&self) -> Option<&Frame> {
        self.order.back().and_then(|id| self.frames.get(*id))
    }

    pub fn oldest(&self) -> Option<&Frame> {
        self.order.front().and_then(|id| self.frames.get(*id))
    }

    /// Frames in temporal order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.order.iter().filter_map(move |id| self.frames.get(*id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.order.len())
            .field("capacity", &self.capacity)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}
