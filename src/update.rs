//! Update records flowing through the driver pipeline.
//!
//! An update is created by a client, waits in the pending queue, is
//! processed by the generator and finalized by the vsync stage. Merged
//! updates carry the id lists and timing marks of every request that
//! was folded into them.

use crate::waveform::{Intensity, ModeId};

/// Identifier assigned to each accepted update.
pub type UpdateId = u32;

/// Rectangular region, in cell coordinates.
///
/// For compatibility with other drivers, the `top` (y) field comes
/// before the `left` (x) field, even though `width` comes before
/// `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(top: u32, left: u32, width: u32, height: u32) -> Self {
        Self {
            top,
            left,
            width,
            height,
        }
    }

    /// A region covering no cells.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Extend this region to encompass another one.
    ///
    /// An empty region is the identity: extending an empty region by
    /// `other` yields `other`, and extending by an empty region is a
    /// no-op.
    pub fn extend(&mut self, other: &Region) {
        if other.is_empty() {
            return;
        }

        if self.is_empty() {
            *self = *other;
            return;
        }

        let bottom = (self.top + self.height).max(other.top + other.height);
        let right = (self.left + self.width).max(other.left + other.width);
        self.top = self.top.min(other.top);
        self.left = self.left.min(other.left);
        self.width = right - self.left;
        self.height = bottom - self.top;
    }

    /// Extend this region to encompass a single cell.
    pub fn extend_point(&mut self, x: u32, y: u32) {
        self.extend(&Region::new(y, x, 1, 1));
    }

    /// Check whether this region contains a cell.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.left + self.width && y >= self.top && y < self.top + self.height
    }
}

/// Per-stage timing marks, in microseconds since the Unix epoch.
///
/// Each vector grows by one entry per frame (generate/vsync pairs) or
/// per merged request (enqueue/dequeue).
#[derive(Debug, Clone, Default)]
pub struct UpdateTiming {
    pub enqueue: Vec<i64>,
    pub dequeue: Vec<i64>,
    pub generate_start: Vec<i64>,
    pub generate_end: Vec<i64>,
    pub vsync_start: Vec<i64>,
    pub vsync_end: Vec<i64>,
}

impl UpdateTiming {
    fn append(&mut self, other: &mut UpdateTiming) {
        self.enqueue.append(&mut other.enqueue);
        self.dequeue.append(&mut other.dequeue);
        self.generate_start.append(&mut other.generate_start);
        self.generate_end.append(&mut other.generate_end);
        self.vsync_start.append(&mut other.vsync_start);
        self.vsync_end.append(&mut other.vsync_end);
    }
}

/// Current microsecond timestamp for timing marks.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// A display update request.
#[derive(Debug, Clone)]
pub struct Update {
    /// Ids carried by this record. A singleton at creation; grows when
    /// other updates are merged in.
    pub ids: Vec<UpdateId>,

    /// Waveform mode to use.
    pub mode: ModeId,

    /// Whether to process this update in immediate mode.
    pub immediate: bool,

    /// Affected region, in panel coordinates.
    pub region: Region,

    /// Target intensities for the region, row-major,
    /// `width * height` entries.
    pub buffer: Vec<Intensity>,

    /// Pipeline timing marks.
    pub timing: UpdateTiming,
}

impl Update {
    pub fn new(
        id: UpdateId,
        mode: ModeId,
        immediate: bool,
        region: Region,
        buffer: Vec<Intensity>,
    ) -> Self {
        Self {
            ids: vec![id],
            mode,
            immediate,
            region,
            buffer,
            timing: UpdateTiming::default(),
        }
    }

    /// Fold another update into this one.
    ///
    /// Extends the region to the bounding union and concatenates the id
    /// list and timing vectors. The intensity buffer is left untouched:
    /// merge decisions and target staging are made by the generator
    /// against its own state, never by resampling buffers.
    pub fn merge_with(&mut self, mut other: Update) {
        self.region.extend(&other.region);
        self.ids.append(&mut other.ids);
        self.timing.append(&mut other.timing);
    }

    /// Copy this update's target intensities into a staging array laid
    /// out as the full panel grid with row stride `target_width`.
    pub fn apply(&self, target: &mut [Intensity], target_width: u32) {
        let width = self.region.width as usize;
        let stride = target_width as usize;
        let mut src = 0;
        let mut dst = self.region.top as usize * stride + self.region.left as usize;

        for _ in 0..self.region.height {
            target[dst..dst + width].copy_from_slice(&self.buffer[src..src + width]);
            src += width;
            dst += stride;
        }
    }

    /// Shrink the region scanned by subsequent immediate-mode frames.
    pub fn set_region(&mut self, region: Region) {
        self.region = region;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_region_is_extend_identity() {
        let mut region = Region::default();
        region.extend(&Region::new(10, 20, 30, 40));
        assert_eq!(region, Region::new(10, 20, 30, 40));

        let mut region = Region::new(10, 20, 30, 40);
        region.extend(&Region::default());
        assert_eq!(region, Region::new(10, 20, 30, 40));
    }

    #[test]
    fn extend_takes_bounding_union() {
        let mut region = Region::new(0, 0, 100, 100);
        region.extend(&Region::new(200, 200, 100, 100));
        assert_eq!(region, Region::new(0, 0, 300, 300));
    }

    #[test]
    fn extend_point_grows_by_unit_cells() {
        let mut region = Region::default();
        region.extend_point(5, 7);
        assert_eq!(region, Region::new(7, 5, 1, 1));
        region.extend_point(2, 9);
        assert_eq!(region, Region::new(7, 2, 4, 3));
    }

    #[test]
    fn contains_is_half_open() {
        let region = Region::new(10, 20, 5, 5);
        assert!(region.contains(20, 10));
        assert!(region.contains(24, 14));
        assert!(!region.contains(25, 10));
        assert!(!region.contains(20, 15));
    }

    #[test]
    fn merge_with_empty_region_keeps_original() {
        let mut update = Update::new(1, 2, false, Region::new(0, 0, 10, 10), vec![0; 100]);
        let other = Update::new(2, 2, false, Region::default(), Vec::new());
        update.merge_with(other);
        assert_eq!(update.region, Region::new(0, 0, 10, 10));
        assert_eq!(update.ids, vec![1, 2]);
    }

    #[test]
    fn merge_disjoint_unions_region_and_concatenates_ids() {
        let mut update = Update::new(7, 3, false, Region::new(0, 0, 100, 100), vec![0; 10_000]);
        let other = Update::new(8, 3, false, Region::new(200, 200, 100, 100), vec![0; 10_000]);
        let buffer_before = update.buffer.clone();
        update.merge_with(other);
        assert_eq!(update.region, Region::new(0, 0, 300, 300));
        assert_eq!(update.ids, vec![7, 8]);
        // Merging never resamples the carried buffer
        assert_eq!(update.buffer, buffer_before);
    }

    #[test]
    fn apply_copies_rows_at_region_offset() {
        let mut target = vec![0u8; 8 * 4];
        let update = Update::new(1, 0, false, Region::new(1, 2, 3, 2), vec![10, 12, 14, 16, 18, 20]);
        update.apply(&mut target, 8);

        assert_eq!(&target[8 + 2..8 + 5], &[10, 12, 14]);
        assert_eq!(&target[16 + 2..16 + 5], &[16, 18, 20]);
        // Cells outside the region stay untouched
        assert_eq!(target[0], 0);
        assert_eq!(target[8 + 5], 0);
    }
}
