//! Map - the shared container of landmarks.
//!
//! Landmarks live in a generation-checked slot arena, so:
//! - A [`LandmarkId`] stays valid while other landmarks are erased.
//! - A handle to an erased landmark never resolves again.
//!
//! Removal follows a two-phase protocol. Phase 1 ("mark") flags a landmark's
//! newest observation obsolete and only needs shared access, so it can run in
//! the middle of any traversal. Phase 2 ([`Map::sweep`]) erases marked
//! landmarks and needs `&mut Map`, i.e. no traversal can be active.
//! [`Map::delete`] is the single erasure entry point.

use std::sync::Arc;

use slotmap::SlotMap;
use tracing::debug;

use crate::config::PointConfig;
use crate::error::{LandmarkError, Result};

use super::frame::FrameBuffer;
use super::landmark::Landmark;
use super::observation::Observation;
use super::types::LandmarkId;

/// The landmark map.
pub struct Map {
    landmarks: SlotMap<LandmarkId, Landmark>,

    /// Total landmarks erased over the lifetime of the map.
    deleted_count: usize,
}

impl Map {
    pub fn new() -> Self {
        Self {
            landmarks: SlotMap::with_key(),
            deleted_count: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creation and access
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a landmark seeded by `observation`.
    ///
    /// The observation's frame must still be in `frames`; its pose becomes the
    /// landmark's reference pose.
    pub fn create_landmark(
        &mut self,
        observation: &Arc<Observation>,
        frames: &FrameBuffer,
        config: &PointConfig,
    ) -> Result<LandmarkId> {
        let frame = frames
            .get(observation.frame())
            .ok_or(LandmarkError::FrameNotFound(observation.frame()))?;
        let pose = *frame.pose();

        let id = self
            .landmarks
            .insert_with_key(|id| Landmark::new(id, observation, &pose, config));
        Ok(id)
    }

    pub fn get(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(id)
    }

    pub fn get_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(id)
    }

    /// Like [`Map::get`], but a stale handle is reported as an error.
    pub fn landmark(&self, id: LandmarkId) -> Result<&Landmark> {
        self.landmarks.get(id).ok_or(LandmarkError::StaleHandle(id))
    }

    pub fn landmark_mut(&mut self, id: LandmarkId) -> Result<&mut Landmark> {
        self.landmarks
            .get_mut(id)
            .ok_or(LandmarkError::StaleHandle(id))
    }

    pub fn contains(&self, id: LandmarkId) -> bool {
        self.landmarks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    pub fn iter(&self) -> impl Iterator<Item = (LandmarkId, &Landmark)> {
        self.landmarks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (LandmarkId, &mut Landmark)> {
        self.landmarks.iter_mut()
    }

    /// Snapshot of all handles, for passes that mutate or erase while walking.
    pub fn ids(&self) -> Vec<LandmarkId> {
        self.landmarks.keys().collect()
    }

    /// Append an observation to an existing landmark.
    pub fn attach_observation(&mut self, id: LandmarkId, observation: &Arc<Observation>) -> Result<()> {
        self.landmark_mut(id)?.add_observation(observation)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────

    /// Phase 1: flag a landmark for deferred removal.
    ///
    /// Needs only shared access. Fails with `ExpiredObservation` if the
    /// landmark has no live observation left to carry the flag; the sweep
    /// removes such landmarks anyway.
    pub fn mark_obsolete(&self, id: LandmarkId) -> Result<()> {
        if self.landmark(id)?.mark_obsolete() {
            Ok(())
        } else {
            Err(LandmarkError::ExpiredObservation)
        }
    }

    /// Delete a landmark and erase it from the map.
    ///
    /// Sets `deleted` first, then frees the slot. Deleting an already deleted
    /// landmark reports `DoubleDeletion` and leaves the map untouched.
    pub fn delete(&mut self, id: LandmarkId) -> Result<Landmark> {
        let landmark = self
            .landmarks
            .get_mut(id)
            .ok_or(LandmarkError::DoubleDeletion(id))?;

        debug!(
            "deleting landmark {} with {} observations",
            id,
            landmark.observation_count()
        );
        landmark.mark_deleted()?;

        let removed = self
            .landmarks
            .remove(id)
            .ok_or(LandmarkError::DoubleDeletion(id))?;
        self.deleted_count += 1;
        Ok(removed)
    }

    /// Landmarks whose removal has been requested or whose observations have
    /// all left the frame buffer.
    pub fn removable_ids(&self) -> Vec<LandmarkId> {
        self.landmarks
            .iter()
            .filter(|(_, lm)| lm.is_obsolete() || !lm.has_live_observations())
            .map(|(id, _)| id)
            .collect()
    }

    /// Phase 2: erase every removable landmark. Returns the number erased.
    pub fn sweep(&mut self) -> usize {
        let mut removed = 0;
        for id in self.removable_ids() {
            if self.delete(id).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("swept {} landmarks, {} remain", removed, self.landmarks.len());
        }
        removed
    }

    pub fn clear(&mut self) {
        self.deleted_count += self.landmarks.len();
        self.landmarks.clear();
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_landmarks", &self.landmarks.len())
            .field("deleted_count", &self.deleted_count)
            .finish()
    }
}
