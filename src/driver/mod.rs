//! Display driver: public client API and worker thread lifecycle.
//!
//! Clients submit rectangular updates through a thread-safe API and
//! optionally await their completion. Two long-lived worker threads do
//! the actual driving: the generator turns updates into phase frames
//! and the vsync stage copies them into the scanout buffer in lockstep
//! with the panel refresh.

mod generator;
mod handoff;
mod vsync;

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::panel::{PanelController, PanelError, PanelGeometry};
use crate::perf::PerfReport;
use crate::update::{now_micros, Region, Update, UpdateId};
use crate::waveform::{Intensity, ModeId, ModeKind, WaveformTable, INTENSITY_MASK};

use generator::Generator;
use handoff::slab_channel;
use vsync::VsyncStage;

/// Driver tunables.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Quiet period after which the panel is powered down.
    pub idle_timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3),
        }
    }
}

/// State shared between clients and the worker threads.
pub(crate) struct DriverShared {
    /// Updates waiting to be processed.
    queue: Mutex<VecDeque<Update>>,
    queue_cv: Condvar,

    /// Raised once to shut the pipeline down.
    stopping: AtomicBool,

    /// Ids of updates accepted but not yet finalized.
    in_flight: Mutex<HashSet<UpdateId>>,
    in_flight_cv: Condvar,

    /// Last panel temperature published by the vsync stage.
    temperature: AtomicI32,

    /// Optional CSV performance sink.
    perf: Mutex<Option<PerfReport>>,
}

/// Handle to a running display driver.
///
/// Dropping the driver stops the worker threads; updates remaining in
/// the queue are discarded. Call [`Driver::wait_for_all`] first to let
/// in-flight work finish cleanly.
pub struct Driver {
    shared: Arc<DriverShared>,
    table: Arc<WaveformTable>,
    geometry: PanelGeometry,
    next_id: AtomicU32,

    generator: Mutex<Option<JoinHandle<()>>>,
    vsync: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    /// Start driving a panel.
    ///
    /// Powers the controller on, validates its geometry and spawns the
    /// worker threads. The controller is owned by the vsync thread from
    /// here on.
    pub fn start(
        mut controller: PanelController,
        table: WaveformTable,
        options: DriverOptions,
    ) -> Result<Self, PanelError> {
        controller.start()?;

        let temperature = controller.temperature()?;
        let geometry = *controller.geometry();
        let blank_frame = controller.blank_frame().to_vec();
        let table = Arc::new(table);

        let shared = Arc::new(DriverShared {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            stopping: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            in_flight_cv: Condvar::new(),
            temperature: AtomicI32::new(temperature),
            perf: Mutex::new(None),
        });

        let (slab_tx, slab_rx) = slab_channel();

        let generator = Generator::new(
            Arc::clone(&shared),
            Arc::clone(&table),
            geometry,
            blank_frame,
            slab_tx,
        );
        let vsync = VsyncStage::new(Arc::clone(&shared), controller, slab_rx, options.idle_timeout);

        let generator = std::thread::Builder::new()
            .name("epdfb-generator".into())
            .spawn(move || generator.run())
            .map_err(|err| PanelError::io("spawn generator thread", err))?;

        let vsync = std::thread::Builder::new()
            .name("epdfb-vsync".into())
            .spawn(move || vsync.run())
            .map_err(|err| PanelError::io("spawn vsync thread", err))?;

        Ok(Self {
            shared,
            table,
            geometry,
            next_id: AtomicU32::new(0),
            generator: Mutex::new(Some(generator)),
            vsync: Mutex::new(Some(vsync)),
        })
    }

    /// The waveform table the driver was started with.
    pub fn table(&self) -> &WaveformTable {
        &self.table
    }

    /// The geometry of the driven panel.
    pub fn geometry(&self) -> &PanelGeometry {
        &self.geometry
    }

    /// Queue an update selected by mode kind.
    ///
    /// Returns the id to await, or `None` if the update is invalid:
    /// unsupported kind, buffer size mismatch or rectangle outside the
    /// visible area.
    pub fn submit(
        &self,
        kind: ModeKind,
        immediate: bool,
        region: Region,
        buffer: &[Intensity],
    ) -> Option<UpdateId> {
        let mode = match self.table.mode_id(kind) {
            Ok(mode) => mode,
            Err(err) => {
                tracing::warn!(%err, "update rejected");
                return None;
            }
        };

        self.submit_by_id(mode, immediate, region, buffer)
    }

    /// Queue an update selected by raw mode id.
    pub fn submit_by_id(
        &self,
        mode: ModeId,
        immediate: bool,
        region: Region,
        buffer: &[Intensity],
    ) -> Option<UpdateId> {
        if mode >= self.table.mode_count() {
            tracing::warn!(mode, "update rejected: unknown mode");
            return None;
        }

        if buffer.len() as u64 != u64::from(region.width) * u64::from(region.height) {
            tracing::warn!(
                expected = u64::from(region.width) * u64::from(region.height),
                actual = buffer.len(),
                "update rejected: buffer size mismatch"
            );
            return None;
        }

        // Input coordinates are in host space: the panel's visible grid
        // with both axes swapped
        let host_width = self.geometry.visible_height;
        let host_height = self.geometry.visible_width;

        if u64::from(region.left) + u64::from(region.width) > u64::from(host_width)
            || u64::from(region.top) + u64::from(region.height) > u64::from(host_height)
        {
            tracing::warn!(?region, "update rejected: outside the visible area");
            return None;
        }

        if self.shared.stopping.load(Ordering::SeqCst) {
            return None;
        }

        let (region, buffer) = transform_update(
            region,
            buffer,
            self.geometry.visible_width,
            self.geometry.visible_height,
        );

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut update = Update::new(id, mode, immediate, region, buffer);
        update.timing.enqueue.push(now_micros());

        self.shared.in_flight.lock().insert(id);
        self.shared.queue.lock().push_back(update);
        self.shared.queue_cv.notify_one();

        Some(id)
    }

    /// Block until the given update has been finalized.
    ///
    /// Returns early if the driver is stopping.
    pub fn wait_for(&self, id: UpdateId) {
        let mut in_flight = self.shared.in_flight.lock();

        while in_flight.contains(&id) && !self.shared.stopping.load(Ordering::SeqCst) {
            self.shared.in_flight_cv.wait(&mut in_flight);
        }
    }

    /// Block until every accepted update has been finalized.
    pub fn wait_for_all(&self) {
        let mut in_flight = self.shared.in_flight.lock();

        while !in_flight.is_empty() && !self.shared.stopping.load(Ordering::SeqCst) {
            self.shared.in_flight_cv.wait(&mut in_flight);
        }
    }

    /// Write a CSV performance record for every finalized update to the
    /// given sink.
    pub fn enable_perf_report<W: Write + Send + 'static>(&self, sink: W) -> std::io::Result<()> {
        *self.shared.perf.lock() = Some(PerfReport::new(Box::new(sink))?);
        Ok(())
    }

    /// Stop writing performance records, flushing the sink.
    pub fn disable_perf_report(&self) {
        if let Some(mut report) = self.shared.perf.lock().take() {
            if let Err(err) = report.flush() {
                tracing::warn!(%err, "failed to flush performance report");
            }
        }
    }

    /// Stop the worker threads.
    ///
    /// Updates still in the queue are discarded; an update whose frames
    /// have begun emission may remain partially displayed. Waiters are
    /// released with a definite end state.
    pub fn stop(&self) {
        let generator = self.generator.lock().take();
        let vsync = self.vsync.lock().take();

        if generator.is_none() && vsync.is_none() {
            return;
        }

        tracing::info!("stopping display driver");

        self.shared.stopping.store(true, Ordering::SeqCst);

        let discarded: Vec<UpdateId> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).flat_map(|update| update.ids).collect()
        };
        self.shared.queue_cv.notify_all();

        {
            let mut in_flight = self.shared.in_flight.lock();
            for id in discarded {
                in_flight.remove(&id);
            }
        }
        self.shared.in_flight_cv.notify_all();

        if let Some(generator) = generator {
            let _ = generator.join();
        }

        if let Some(vsync) = vsync {
            let _ = vsync.join();
        }

        // Whatever was mid-emission when the threads exited is gone
        self.shared.in_flight.lock().clear();
        self.shared.in_flight_cv.notify_all();

        self.disable_perf_report();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Transform an update from host coordinates to panel coordinates.
///
/// Host coordinates are in portrait "tablet" space; the panel scans the
/// same grid with the axes swapped and both directions flipped.
/// Intensities are masked to their 5 usable bits on the way through.
pub(crate) fn transform_update(
    region: Region,
    buffer: &[Intensity],
    panel_width: u32,
    panel_height: u32,
) -> (Region, Vec<Intensity>) {
    let width = region.width as usize;
    let height = region.height as usize;

    let mut transformed = vec![0; buffer.len()];

    for (k, value) in transformed.iter_mut().enumerate() {
        let i = height - (k % height) - 1;
        let j = width - (k / height) - 1;
        *value = buffer[i * width + j] & INTENSITY_MASK;
    }

    let transformed_region = Region {
        top: panel_height - region.left - region.width,
        left: panel_width - region.top - region.height,
        width: region.height,
        height: region.width,
    };

    (transformed_region, transformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_swaps_axes_and_flips() {
        // Host space 2 wide, 1 tall; panel space 1 wide, 2 tall
        let region = Region::new(0, 0, 2, 1);
        let (transformed_region, transformed) = transform_update(region, &[10, 20], 1, 2);

        assert_eq!(transformed_region, Region::new(0, 0, 1, 2));
        assert_eq!(transformed, vec![20, 10]);
    }

    #[test]
    fn transform_masks_intensities() {
        let region = Region::new(0, 0, 1, 1);
        let (_, transformed) = transform_update(region, &[0xFF], 1, 1);
        assert_eq!(transformed, vec![0x1F]);
    }

    #[test]
    fn transform_is_self_inverse_composed_with_the_mirror() {
        // Host space 3 wide, 2 tall mapped onto a 2x3 panel and back
        let buffer: Vec<u8> = vec![0, 2, 4, 6, 8, 10];
        let region = Region::new(0, 0, 3, 2);

        let (panel_region, panel_buffer) = transform_update(region, &buffer, 2, 3);
        assert_eq!(panel_region, Region::new(0, 0, 2, 3));

        let (back_region, back_buffer) = transform_update(panel_region, &panel_buffer, 3, 2);
        assert_eq!(back_region, region);
        assert_eq!(back_buffer, buffer);
    }

    #[test]
    fn transform_offsets_sub_rectangles() {
        // A 1x1 rect at host (top=0, left=1) on a 2x2 grid lands at
        // panel (top=0, left=1) after the flip of both axes
        let region = Region::new(0, 1, 1, 1);
        let (transformed_region, _) = transform_update(region, &[0], 2, 2);
        assert_eq!(transformed_region, Region::new(0, 1, 1, 1));

        let region = Region::new(1, 0, 1, 1);
        let (transformed_region, _) = transform_update(region, &[0], 2, 2);
        assert_eq!(transformed_region, Region::new(1, 0, 1, 1));
    }
}
