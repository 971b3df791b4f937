//! Landmark System - main entry point and thread orchestration.
//!
//! The `LandmarkSystem` is the top-level struct that users interact with.
//! It owns the shared state and spawns the mapper thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::config::LandmarkConfig;
use crate::local_mapping::LandmarkMapper;

use super::messages::{FrameMsg, MapperReport};
use super::shared_state::SharedState;

/// Landmark system orchestrating the mapper thread.
pub struct LandmarkSystem {
    /// Shared state (map, frame buffer, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// Channel sender for frames (front end -> mapper). Dropped on shutdown
    /// so the mapper drains its queue and exits.
    frame_sender: Option<Sender<FrameMsg>>,

    /// One report per processed frame.
    report_receiver: Receiver<MapperReport>,

    /// Handle to the mapper thread.
    mapper_handle: Option<JoinHandle<()>>,
}

impl LandmarkSystem {
    /// Create a new landmark system.
    ///
    /// This validates the configuration, creates the shared state and spawns
    /// the mapper thread.
    pub fn new(config: LandmarkConfig) -> Result<Self> {
        config.validate().context("invalid landmark configuration")?;

        let shared = SharedState::new(config.mapper.frame_buffer_size);

        // Bounded channel: the front end blocks when the mapper falls behind
        let (frame_sender, frame_receiver) = bounded::<FrameMsg>(config.mapper.channel_capacity);
        let (report_sender, report_receiver) = unbounded::<MapperReport>();

        let mapper_handle =
            Self::spawn_mapper(shared.clone(), frame_receiver, report_sender, config)?;

        Ok(Self {
            shared,
            frame_sender: Some(frame_sender),
            report_receiver,
            mapper_handle: Some(mapper_handle),
        })
    }

    /// Spawn the mapper thread.
    fn spawn_mapper(
        shared: Arc<SharedState>,
        frame_receiver: Receiver<FrameMsg>,
        report_sender: Sender<MapperReport>,
        config: LandmarkConfig,
    ) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("landmark-mapper".into())
            .spawn(move || {
                let mut mapper = LandmarkMapper::new(config, Some(report_sender));
                mapper.run(frame_receiver, shared);
            })
            .context("failed to spawn mapper thread")
    }

    /// Queue a frame for the mapper. Blocks while the queue is full.
    pub fn submit(&self, msg: FrameMsg) -> Result<()> {
        let sender = self
            .frame_sender
            .as_ref()
            .ok_or_else(|| anyhow!("landmark system is shut down"))?;
        sender
            .send(msg)
            .map_err(|_| anyhow!("mapper thread has exited"))
    }

    /// Wait up to `timeout` for the next frame report.
    pub fn recv_report(&self, timeout: Duration) -> Option<MapperReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    /// Reports that are already available, without blocking.
    pub fn drain_reports(&self) -> Vec<MapperReport> {
        self.report_receiver.try_iter().collect()
    }

    /// Get a reference to the shared state for readers.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Shutdown the system gracefully.
    ///
    /// Closes the frame channel, lets the mapper process what is already
    /// queued and waits for it.
    pub fn shutdown(&mut self) {
        self.frame_sender.take();

        if let Some(handle) = self.mapper_handle.take() {
            let _ = handle.join();
        }
    }

    /// Stop the mapper without processing queued frames.
    pub fn abort(&mut self) {
        self.shared.request_shutdown();
        self.shutdown();
    }
}

impl Drop for LandmarkSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
