//! Landmark Mapper - the single writer of the landmark map.
//!
//! Processes frames received from the front end:
//! 1. Inserts the frame into the frame buffer (evicting the oldest)
//! 2. Attaches tracked observations and fuses their depth measurements
//! 3. Seeds new landmarks from unmatched features
//! 4. Flags guessed landmarks that never received a depth update
//! 5. Refines immature landmarks every `refine_interval` keyframes
//! 6. Sweeps landmarks flagged obsolete or left without observations

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::atlas::map::{FrameBuffer, FrameId, LandmarkId, Map};
use crate::config::LandmarkConfig;
use crate::error::LandmarkError;
use crate::geometry::SE3;
use crate::optimizer::refine_landmark;
use crate::system::messages::{FrameMsg, MapperReport, TrackedObservation};
use crate::system::shared_state::SharedState;

use super::depth_filter::triangulate_measurement;

/// Timeout for receiving frames. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Landmark mapping thread state.
pub struct LandmarkMapper {
    config: LandmarkConfig,

    /// Keyframes processed since the last refinement pass.
    keyframes_since_refine: usize,

    /// Channel sender for per-frame reports.
    report_sender: Option<Sender<MapperReport>>,
}

impl LandmarkMapper {
    /// Create a new LandmarkMapper.
    ///
    /// # Arguments
    /// * `config` - Estimation parameters
    /// * `report_sender` - Optional sender receiving one report per frame
    pub fn new(config: LandmarkConfig, report_sender: Option<Sender<MapperReport>>) -> Self {
        Self {
            config,
            keyframes_since_refine: 0,
            report_sender,
        }
    }

    pub fn config(&self) -> &LandmarkConfig {
        &self.config
    }

    /// Main thread loop: receive frames and process them.
    ///
    /// Runs until shutdown is requested or every sender is dropped. Frames
    /// already queued when the senders go away are still processed.
    pub fn run(&mut self, frame_receiver: Receiver<FrameMsg>, shared: Arc<SharedState>) {
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            match frame_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    let report = self.process_frame(msg, &shared);
                    if let Some(ref sender) = self.report_sender {
                        let _ = sender.send(report);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let map = shared.map.read();
        info!(
            "landmark mapper stopped: {} landmarks, {} deleted",
            map.len(),
            map.deleted_count()
        );
    }

    /// Process a single frame message under the write locks.
    pub fn process_frame(&mut self, msg: FrameMsg, shared: &SharedState) -> MapperReport {
        let mut frames = shared.frames.write();
        let mut map = shared.map.write();
        self.process_frame_locked(msg, &mut frames, &mut map)
    }

    /// Process a single frame with the buffer and map already borrowed.
    pub fn process_frame_locked(
        &mut self,
        msg: FrameMsg,
        frames: &mut FrameBuffer,
        map: &mut Map,
    ) -> MapperReport {
        let mut report = MapperReport::default();

        // Step 1: Insert the frame
        let frame_id = frames.push(msg.timestamp_ns, msg.pose, msg.is_keyframe);
        if let Some(frame) = frames.get(frame_id) {
            report.sequence = frame.sequence;
        }

        // Step 2 and 3: Attach, fuse and seed
        let depth_guess = scene_depth(&msg, map);
        let mut observed = Vec::with_capacity(msg.observations.len());
        for (idx, tracked) in msg.observations.into_iter().enumerate() {
            match tracked.landmark {
                Some(id) => observed.extend(self.attach(
                    id,
                    tracked,
                    frame_id,
                    &msg.pose,
                    frames,
                    map,
                    &mut report,
                )),
                None => self.seed(idx, tracked, frame_id, depth_guess, frames, map, &mut report),
            }
        }

        // Step 4: Flag stale guesses
        report.stale = self.flag_stale_guesses(map);

        if msg.is_keyframe {
            for id in &observed {
                if let Some(lm) = map.get_mut(*id) {
                    lm.set_moba_candidate(!lm.is_immature());
                }
            }

            // Step 5: Refinement
            self.keyframes_since_refine += 1;
            if self.keyframes_since_refine >= self.config.mapper.refine_interval {
                self.keyframes_since_refine = 0;
                self.refine_immature(frames, map, &mut report);
            }
        }

        // Step 6: Deferred deletion
        report.swept = map.sweep();

        debug!(
            "frame #{}: created {}, fused {}, matured {}/{}, swept {}, map size {}",
            report.sequence,
            report.created.len(),
            report.fused,
            report.matured,
            report.refined,
            report.swept,
            map.len()
        );
        report
    }

    /// Append an observation to a tracked landmark and fuse its depth.
    #[allow(clippy::too_many_arguments)]
    fn attach(
        &self,
        id: LandmarkId,
        tracked: TrackedObservation,
        frame_id: FrameId,
        pose: &SE3,
        frames: &mut FrameBuffer,
        map: &mut Map,
        report: &mut MapperReport,
    ) -> Option<LandmarkId> {
        let obs = match frames.add_observation(frame_id, tracked.pixel) {
            Ok(obs) => obs,
            Err(e) => {
                warn!("cannot record observation: {}", e);
                return None;
            }
        };

        if let Err(e) = map.attach_observation(id, &obs) {
            debug!("dropping observation of {}: {}", id, e);
            report.dropped += 1;
            return None;
        }

        let lm = map.get_mut(id)?;
        let measurement = tracked
            .measurement
            .or_else(|| triangulate_measurement(lm, &tracked.pixel, pose, &self.config.point));

        if let Some(m) = measurement {
            match lm.fuse(&m, pose) {
                Ok(()) => report.fused += 1,
                Err(e) => debug!("not fusing into {}: {}", id, e),
            }
        }
        Some(id)
    }

    /// Create a landmark from an unmatched feature.
    #[allow(clippy::too_many_arguments)]
    fn seed(
        &self,
        idx: usize,
        tracked: TrackedObservation,
        frame_id: FrameId,
        depth_guess: Option<f64>,
        frames: &mut FrameBuffer,
        map: &mut Map,
        report: &mut MapperReport,
    ) {
        let obs = match frames.add_observation(frame_id, tracked.pixel) {
            Ok(obs) => obs,
            Err(e) => {
                warn!("cannot record observation: {}", e);
                return;
            }
        };
        let id = match map.create_landmark(&obs, frames, &self.config.point) {
            Ok(id) => id,
            Err(e) => {
                warn!("cannot seed landmark: {}", e);
                return;
            }
        };
        report.created.push((idx, id));

        let Some(lm) = map.get_mut(id) else {
            return;
        };
        if let Some(depth) = depth_guess {
            lm.set_depth_guess(depth);
        }
        if let Some(m) = tracked.measurement {
            let pose = *lm.initial_camera_pose();
            match lm.fuse(&m, &pose) {
                Ok(()) => report.fused += 1,
                Err(e) => debug!("not fusing into new {}: {}", id, e),
            }
        }
    }

    /// Flag guessed landmarks that went too many observations without a
    /// depth update.
    fn flag_stale_guesses(&self, map: &Map) -> usize {
        let max_stale = self.config.mapper.max_stale_frames;
        map.iter()
            .filter(|(_, lm)| {
                lm.is_guessed() && lm.frames_since_depth_update() > max_stale && !lm.is_obsolete()
            })
            .filter(|(_, lm)| lm.mark_obsolete())
            .count()
    }

    /// Run the refiner on every immature landmark not already flagged.
    fn refine_immature(&self, frames: &FrameBuffer, map: &mut Map, report: &mut MapperReport) {
        for id in map.ids() {
            let Some(lm) = map.get_mut(id) else {
                continue;
            };
            if !lm.is_immature() || lm.is_obsolete() {
                continue;
            }

            match refine_landmark(lm, frames, &self.config.refiner) {
                Ok(_) => {
                    report.refined += 1;
                    report.matured += 1;
                }
                Err(LandmarkError::NotEnoughKeyframes { .. }) => {}
                Err(e) => {
                    debug!("refinement of {} rejected: {}", id, e);
                    report.refined += 1;
                    report.rejected += 1;
                }
            }
        }
    }
}

/// Mean depth of the non-guessed landmarks tracked in this frame, used to
/// seed new landmarks.
fn scene_depth(msg: &FrameMsg, map: &Map) -> Option<f64> {
    let pose_inv = msg.pose.inverse();
    let depths: Vec<f64> = msg
        .observations
        .iter()
        .filter_map(|t| t.landmark)
        .filter_map(|id| map.get(id))
        .filter(|lm| !lm.is_guessed())
        .map(|lm| lm.depth_in(&pose_inv))
        .filter(|d| *d > 0.0 && d.is_finite())
        .collect();

    if depths.is_empty() {
        None
    } else {
        Some(depths.iter().sum::<f64>() / depths.len() as f64)
    }
}
