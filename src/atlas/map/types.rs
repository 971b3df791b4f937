//! Handle types for the map structures.
//!
//! Landmarks and frames live in generation-checked slot arenas. A handle stays
//! valid across removal of any other entry, and a handle to a removed entry
//! never resolves again, even if its slot is reused.

use slotmap::new_key_type;

new_key_type! {
    /// Handle to a landmark in a [`Map`](super::Map).
    pub struct LandmarkId;

    /// Handle to a frame in a [`FrameBuffer`](super::FrameBuffer).
    pub struct FrameId;
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{:?}", self.0)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{:?}", self.0)
    }
}
