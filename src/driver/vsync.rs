//! Vsync stage: sends generated frames to the panel.
//!
//! Consumes frame slabs from the generator, copies each frame into the
//! next scanout slot and issues a vsync-synchronous page flip. Powers
//! the panel down after a quiet period and finalizes updates once
//! their last frame has reached the panel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::panel::PanelController;
use crate::update::now_micros;

use super::handoff::{FrameSlab, SlabReceiver};
use super::DriverShared;

pub(crate) struct VsyncStage {
    shared: Arc<DriverShared>,
    controller: PanelController,
    slabs: SlabReceiver,

    /// Quiet period after which the panel is switched off.
    idle_timeout: Duration,
}

impl VsyncStage {
    pub(crate) fn new(
        shared: Arc<DriverShared>,
        controller: PanelController,
        slabs: SlabReceiver,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            controller,
            slabs,
            idle_timeout,
        }
    }

    /// Wait for the next slab, powering the panel down if none arrives
    /// within the idle timeout. Returns `None` once the generator has
    /// exited.
    fn next_slab(&mut self) -> Option<FrameSlab> {
        match self.slabs.recv_timeout(self.idle_timeout) {
            Ok(slab) => Some(slab),
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(timeout = ?self.idle_timeout, "no updates, powering panel down");

                if let Err(err) = self.controller.set_power(false) {
                    tracing::warn!(%err, "failed to power panel down");
                }

                self.slabs.recv().ok()
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("vsync thread started");

        // Timestamps for frames of the in-flight update; appended to
        // the record once its final slab retires
        let mut vsync_start: Vec<i64> = Vec::new();
        let mut vsync_end: Vec<i64> = Vec::new();

        while let Some(slab) = self.next_slab() {
            if let Err(err) = self.controller.set_power(true) {
                tracing::error!(%err, "cannot power panel on, vsync thread exiting");
                return;
            }

            match self.controller.temperature() {
                Ok(value) => self.shared.temperature.store(value, Ordering::SeqCst),
                Err(err) => tracing::warn!(%err, "temperature refresh failed"),
            }

            let mut failed = false;

            for frame in &slab.frames {
                vsync_start.push(now_micros());

                let copy = self
                    .controller
                    .back_buffer()
                    .map(|slot| slot.copy_from_slice(frame));

                let result = copy.and_then(|()| self.controller.page_flip());

                if let Err(err) = result {
                    tracing::error!(%err, "page flip failed, vsync thread exiting");
                    failed = true;
                    break;
                }

                vsync_end.push(now_micros());
            }

            if let Some(mut update) = slab.finalize {
                update.timing.vsync_start.append(&mut vsync_start);
                update.timing.vsync_end.append(&mut vsync_end);

                if let Some(report) = self.shared.perf.lock().as_mut() {
                    if let Err(err) = report.record(&update) {
                        tracing::warn!(%err, "failed to write performance record");
                    }
                }

                // Every id carried by the update retires atomically
                let mut in_flight = self.shared.in_flight.lock();
                for id in &update.ids {
                    in_flight.remove(id);
                }
                drop(in_flight);
                self.shared.in_flight_cv.notify_all();
            }

            self.slabs.give_back(slab.frames);

            if failed {
                // Never propagate device errors across the thread
                // boundary; the generator unblocks on disconnect
                return;
            }
        }

        tracing::debug!("vsync thread exiting");
    }
}
