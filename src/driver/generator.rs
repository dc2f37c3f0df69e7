//! Frame generation from update requests.
//!
//! The generator thread dequeues updates, folds compatible pending
//! updates into them, and produces phase frames for the vsync stage.
//! Batch updates have all their frames generated before any is sent;
//! immediate updates emit one frame at a time, accepting merges
//! mid-stroke.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::panel::PanelGeometry;
use crate::update::{now_micros, Region, Update};
use crate::waveform::{Intensity, Phase, PhaseMatrix, Waveform, WaveformTable};

use super::handoff::{Disconnected, FrameSlab, SlabSender};
use super::DriverShared;

/// Waveform step index of each cell during immediate updates.
///
/// Zero for idle cells; otherwise the next matrix to apply.
pub(crate) type StepArray = Vec<u16>;

pub(crate) struct Generator {
    shared: Arc<DriverShared>,
    table: Arc<WaveformTable>,
    geometry: PanelGeometry,

    /// Frame template carrying the panel's sync-byte pattern.
    blank_frame: Vec<u8>,

    slabs: SlabSender,

    /// Last committed intensity of every cell.
    current: Vec<Intensity>,

    /// Staged target intensities during an update.
    next: Vec<Intensity>,

    /// Per-cell waveform progress for immediate updates.
    steps: StepArray,

    /// Drained frame buffers reclaimed from the vsync stage.
    pool: Vec<Vec<u8>>,
}

impl Generator {
    pub(crate) fn new(
        shared: Arc<DriverShared>,
        table: Arc<WaveformTable>,
        geometry: PanelGeometry,
        blank_frame: Vec<u8>,
        slabs: SlabSender,
    ) -> Self {
        let cells = geometry.visible_size as usize;

        Self {
            shared,
            table,
            geometry,
            blank_frame,
            slabs,
            // Cell contents are unknown until the first INIT update
            current: vec![0; cells],
            next: vec![0; cells],
            steps: vec![0; cells],
            pool: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("generator thread started");

        while let Some(update) = self.pop() {
            let result = if update.immediate {
                self.generate_immediate(update)
            } else {
                self.generate_batch(update)
            };

            if result.is_err() {
                // The vsync stage is gone; nothing left to drive
                break;
            }
        }

        tracing::debug!("generator thread exiting");
    }

    /// Remove the next update from the queue, waiting while it is
    /// empty. Returns `None` once the driver is stopping.
    fn pop(&self) -> Option<Update> {
        let mut queue = self.shared.queue.lock();

        loop {
            if self.shared.stopping.load(Ordering::SeqCst) {
                return None;
            }

            if let Some(mut update) = queue.pop_front() {
                update.timing.dequeue.push(now_micros());
                return Some(update);
            }

            self.shared.queue_cv.wait(&mut queue);
        }
    }

    /// Fold compatible queued updates into the in-flight one.
    ///
    /// Candidates are applied into the staging array and merged into
    /// the record until the head of the queue stops being compatible.
    /// The immediate-mode compatibility check runs inside the queue
    /// critical section so no client can slip an update in between.
    fn merge_updates(&mut self, update: &mut Update) {
        let mut queue = self.shared.queue.lock();

        loop {
            let compatible = match queue.front() {
                Some(head) => {
                    head.immediate == update.immediate
                        && head.mode == update.mode
                        && (!update.immediate
                            || immediate_merge_allowed(
                                head,
                                &self.next,
                                &self.steps,
                                self.geometry.visible_width,
                            ))
                }
                None => false,
            };

            if !compatible {
                return;
            }

            if let Some(mut head) = queue.pop_front() {
                head.timing.dequeue.push(now_micros());
                head.apply(&mut self.next, self.geometry.visible_width);
                update.merge_with(head);
            }
        }
    }

    /// Take a blank frame to draw into, reusing drained buffers.
    fn take_frame(&mut self) -> Vec<u8> {
        if self.pool.is_empty() {
            self.pool = self.slabs.reclaim();
        }

        let mut frame = self.pool.pop().unwrap_or_default();
        frame.clear();
        frame.extend_from_slice(&self.blank_frame);
        frame
    }

    /// Commit staged intensities for a region.
    fn commit_region(&mut self, region: &Region) {
        let stride = self.geometry.visible_width as usize;
        let width = region.width as usize;

        for y in 0..region.height as usize {
            let row = (region.top as usize + y) * stride + region.left as usize;
            self.current[row..row + width].copy_from_slice(&self.next[row..row + width]);
        }
    }

    /// Drop an update that cannot be processed, releasing its waiters.
    fn abandon(&self, update: Update) {
        let mut in_flight = self.shared.in_flight.lock();
        for id in &update.ids {
            in_flight.remove(id);
        }
        drop(in_flight);
        self.shared.in_flight_cv.notify_all();
    }

    /// Generate and send every frame of a batch update.
    fn generate_batch(&mut self, mut update: Update) -> Result<(), Disconnected> {
        self.next.copy_from_slice(&self.current);
        update.apply(&mut self.next, self.geometry.visible_width);
        self.merge_updates(&mut update);

        let region = align_region(update.region, self.geometry.packed_pixels);
        let temperature = self.shared.temperature.load(Ordering::SeqCst);
        let table = Arc::clone(&self.table);

        let waveform = match table.lookup(update.mode, temperature) {
            Ok(waveform) => waveform,
            Err(err) => {
                tracing::error!(%err, ids = ?update.ids, "dropping update without a usable waveform");
                self.abandon(update);
                return Ok(());
            }
        };

        let mut frames = Vec::with_capacity(waveform.len());

        for matrix in waveform.iter() {
            update.timing.generate_start.push(now_micros());
            let mut frame = self.take_frame();
            pack_batch_frame(
                &mut frame,
                &self.geometry,
                &region,
                matrix,
                &self.current,
                &self.next,
            );
            frames.push(frame);
            update.timing.generate_end.push(now_micros());
        }

        self.commit_region(&region);
        self.send_frames(frames, Some(update))
    }

    /// Emit frames for an immediate update one at a time, merging new
    /// work in mid-stroke, until every touched cell has completed its
    /// waveform.
    fn generate_immediate(&mut self, mut update: Update) -> Result<(), Disconnected> {
        self.next.copy_from_slice(&self.current);
        update.apply(&mut self.next, self.geometry.visible_width);
        self.steps.fill(0);

        let table = Arc::clone(&self.table);

        loop {
            if self.shared.stopping.load(Ordering::SeqCst) {
                // Mid-stroke cancellation; stop() releases the waiters
                return Ok(());
            }

            self.merge_updates(&mut update);

            let region = align_region(update.region, self.geometry.packed_pixels);
            let temperature = self.shared.temperature.load(Ordering::SeqCst);

            let waveform = match table.lookup(update.mode, temperature) {
                Ok(waveform) if waveform.is_empty() => {
                    tracing::error!(mode = update.mode, "empty waveform, dropping update");
                    self.abandon(update);
                    return Ok(());
                }
                Ok(waveform) => waveform,
                Err(err) => {
                    tracing::error!(%err, ids = ?update.ids, "dropping update without a usable waveform");
                    self.abandon(update);
                    return Ok(());
                }
            };

            update.timing.generate_start.push(now_micros());
            let mut frame = self.take_frame();
            let (active, finished) = pack_immediate_frame(
                &mut frame,
                &self.geometry,
                &region,
                waveform,
                &mut self.current,
                &self.next,
                &mut self.steps,
            );
            update.timing.generate_end.push(now_micros());

            if finished {
                return self.send_frames(vec![frame], Some(update));
            }

            self.send_frames(vec![frame], None)?;

            // Subsequent frames only scan cells still in motion
            update.set_region(active);
        }
    }

    fn send_frames(&mut self, frames: Vec<Vec<u8>>, finalize: Option<Update>) -> Result<(), Disconnected> {
        self.slabs.send(FrameSlab { frames, finalize })
    }
}

/// Align a region so both ends of every line fall on a packed-pixel
/// boundary.
///
/// Cells added by the padding are left unchanged by generation since
/// their staged value equals their current one.
pub(crate) fn align_region(region: Region, packed_pixels: u32) -> Region {
    let mask = packed_pixels - 1;

    if region.left & mask == 0 && region.width & mask == 0 {
        return region;
    }

    let left = region.left & !mask;
    let pad_left = region.left & mask;
    let width = (pad_left + region.width + mask) & !mask;

    Region {
        top: region.top,
        left,
        width,
        height: region.height,
    }
}

/// Check that merging `candidate` cannot re-target a cell that is
/// already mid-waveform.
///
/// A cell whose target changed while `steps` is nonzero would
/// desynchronize its step index from the drive history and leave a
/// permanent ghost.
pub(crate) fn immediate_merge_allowed(
    candidate: &Update,
    next: &[Intensity],
    steps: &[u16],
    row_stride: u32,
) -> bool {
    let stride = row_stride as usize;
    let region = &candidate.region;
    let width = region.width as usize;

    for y in 0..region.height as usize {
        let row = (region.top as usize + y) * stride + region.left as usize;

        for x in 0..width {
            let target = candidate.buffer[y * width + x];

            if target != next[row + x] && steps[row + x] != 0 {
                return false;
            }
        }
    }

    true
}

/// Write the phases for one batch step into a frame.
///
/// Each packed-pixel column becomes a 16-bit little-endian word: the
/// high byte carries the first four phases, the low byte the last four.
pub(crate) fn pack_batch_frame(
    frame: &mut [u8],
    geometry: &PanelGeometry,
    region: &Region,
    matrix: &PhaseMatrix,
    current: &[Intensity],
    next: &[Intensity],
) {
    let stride = geometry.stride as usize;
    let depth = geometry.depth as usize;
    let packed = geometry.packed_pixels as usize;
    let row_stride = geometry.visible_width as usize;

    let base = (geometry.upper_margin + region.top) as usize * stride
        + (geometry.left_margin as usize + region.left as usize / packed) * depth;

    for y in 0..region.height as usize {
        let mut offset = base + y * stride;
        let mut cell = (region.top as usize + y) * row_stride + region.left as usize;

        for _ in 0..region.width as usize / packed {
            let mut word = 0u16;

            for _ in 0..packed {
                let phase = matrix[current[cell] as usize][next[cell] as usize];
                word = (word << 2) | phase as u16;
                cell += 1;
            }

            frame[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
            offset += depth;
        }
    }
}

/// Write one immediate-mode frame, advancing per-cell waveform steps.
///
/// Cells whose staged value differs from their committed value emit
/// their next phase and advance; a cell reaching the end of the
/// waveform commits and returns to the idle step. Returns the region
/// of cells that emitted phases and whether every cell has completed.
pub(crate) fn pack_immediate_frame(
    frame: &mut [u8],
    geometry: &PanelGeometry,
    region: &Region,
    waveform: &Waveform,
    current: &mut [Intensity],
    next: &[Intensity],
    steps: &mut [u16],
) -> (Region, bool) {
    let stride = geometry.stride as usize;
    let depth = geometry.depth as usize;
    let packed = geometry.packed_pixels as usize;
    let row_stride = geometry.visible_width as usize;

    let base = (geometry.upper_margin + region.top) as usize * stride
        + (geometry.left_margin as usize + region.left as usize / packed) * depth;

    let mut active = Region::default();
    let mut finished = true;

    for y in 0..region.height as usize {
        let mut offset = base + y * stride;
        let row = (region.top as usize + y) * row_stride + region.left as usize;

        for column in 0..region.width as usize / packed {
            let mut word = 0u16;

            for pixel in 0..packed {
                let x = column * packed + pixel;
                let cell = row + x;
                let mut phase = Phase::Noop;

                if next[cell] != current[cell] {
                    let step = steps[cell] as usize;
                    phase = waveform[step][current[cell] as usize][next[cell] as usize];
                    active.extend_point(region.left + x as u32, region.top + y as u32);

                    steps[cell] += 1;

                    if steps[cell] as usize == waveform.len() {
                        current[cell] = next[cell];
                        steps[cell] = 0;
                    } else {
                        finished = false;
                    }
                }

                word = (word << 2) | phase as u16;
            }

            frame[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
            offset += depth;
        }
    }

    (active, finished)
}
