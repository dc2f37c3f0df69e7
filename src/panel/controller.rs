//! EPD panel controller.
//!
//! Owns the memory-mapped scanout buffer, the vsync page flip, panel
//! power and the temperature sensor. Assumes exclusive access to the
//! panel device; concurrent access leads to unpredictable behavior.

use std::path::Path;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use memmap2::MmapMut;
use thiserror::Error;

use super::framebuffer::{FbFixScreeninfo, FbVarScreeninfo, FramebufferDevice};
use super::sensor::TemperatureSensor;

/// Interval at which panel temperature readings are refreshed.
const TEMPERATURE_READ_INTERVAL: Duration = Duration::from_secs(30);

/// Panel device errors.
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("framebuffer has invalid dimensions: {field} is {actual}, expected {expected}")]
    Geometry {
        field: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("panel controller is not started")]
    NotStarted,
}

impl PanelError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

bitflags! {
    /// Flags carried by the third byte of every scanout buffer pixel.
    ///
    /// Every generated frame must preserve the per-row pattern of these
    /// flags; the two data bytes are the only part of a pixel that
    /// update content may touch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u8 {
        const FRAME_SYNC = 0x01;
        const FRAME_BEGIN = 0x02;
        const FRAME_DATA = 0x04;
        const FRAME_END = 0x08;
        const LINE_SYNC = 0x10;
        const LINE_BEGIN = 0x20;
        const LINE_DATA = 0x40;
        const LINE_END = 0x80;
    }
}

/// Scanout buffer dimensions and blanking margins.
#[derive(Debug, Clone, Copy)]
pub struct PanelGeometry {
    /// Number of buffer pixels in a frame line.
    pub width: u32,

    /// Number of bytes per buffer pixel.
    pub depth: u32,

    /// Number of bytes per frame line.
    pub stride: u32,

    /// Number of display cells packed inside one buffer pixel.
    pub packed_pixels: u32,

    /// Number of lines in a frame.
    pub height: u32,

    /// Number of bytes per frame.
    pub frame_size: u32,

    /// Number of frame slots allocated in the scanout buffer.
    pub frame_count: u32,

    /// Number of bytes in the whole scanout buffer.
    pub total_size: u32,

    /// Blanking margins within each frame.
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,

    /// Number of usable display cells in a line.
    pub visible_width: u32,

    /// Number of usable lines in a frame.
    pub visible_height: u32,

    /// Number of usable display cells in a frame.
    pub visible_size: u32,
}

impl PanelGeometry {
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        width: u32,
        depth: u32,
        packed_pixels: u32,
        height: u32,
        frame_count: u32,
        left_margin: u32,
        right_margin: u32,
        upper_margin: u32,
        lower_margin: u32,
    ) -> Self {
        let stride = width * depth;
        let frame_size = stride * height;
        let visible_width = (width - left_margin - right_margin) * packed_pixels;
        let visible_height = height - upper_margin - lower_margin;

        Self {
            width,
            depth,
            stride,
            packed_pixels,
            height,
            frame_size,
            frame_count,
            total_size: frame_size * frame_count,
            left_margin,
            right_margin,
            upper_margin,
            lower_margin,
            visible_width,
            visible_height,
            visible_size: visible_width * visible_height,
        }
    }

    /// Geometry of the reMarkable 2 panel.
    pub const REMARKABLE2: PanelGeometry = PanelGeometry::new(260, 4, 8, 1408, 17, 26, 0, 3, 1);
}

/// Build the blank frame template for the given geometry.
///
/// The blank frame drives the panel's sync machinery while leaving
/// every cell idle: the two data bytes of each pixel are zero and the
/// third byte carries the per-row sync pattern expected by the panel.
pub(crate) fn build_blank_frame(geometry: &PanelGeometry) -> Vec<u8> {
    use SyncFlags as F;

    let mut frame = vec![0u8; geometry.frame_size as usize];
    let depth = geometry.depth as usize;

    // Cursor over the sync byte (third byte) of consecutive pixels
    let mut offset = 2usize;
    let mut put = |frame: &mut Vec<u8>, count: usize, flags: SyncFlags| {
        for _ in 0..count {
            frame[offset] = flags.bits();
            offset += depth;
        }
    };

    // First line
    put(&mut frame, 20, F::FRAME_SYNC | F::FRAME_BEGIN | F::LINE_DATA);
    put(
        &mut frame,
        20,
        F::FRAME_SYNC | F::FRAME_BEGIN | F::FRAME_DATA | F::LINE_DATA,
    );
    put(&mut frame, 63, F::FRAME_SYNC | F::FRAME_DATA | F::LINE_DATA);
    put(
        &mut frame,
        40,
        F::FRAME_SYNC | F::FRAME_BEGIN | F::FRAME_DATA | F::LINE_DATA,
    );
    put(&mut frame, 117, F::FRAME_SYNC | F::FRAME_BEGIN | F::LINE_DATA);

    // Second and third lines
    for _ in 1..3 {
        put(&mut frame, 8, F::FRAME_SYNC | F::LINE_DATA);
        put(&mut frame, 11, F::FRAME_SYNC | F::LINE_BEGIN | F::LINE_DATA);
        put(&mut frame, 36, F::FRAME_SYNC | F::LINE_DATA);
        put(&mut frame, 200, F::FRAME_SYNC | F::FRAME_BEGIN | F::LINE_DATA);
        put(&mut frame, 5, F::FRAME_SYNC | F::LINE_DATA);
    }

    // Following lines
    for _ in 3..geometry.height {
        put(&mut frame, 8, F::FRAME_SYNC | F::LINE_DATA);
        put(&mut frame, 11, F::FRAME_SYNC | F::LINE_BEGIN | F::LINE_DATA);
        put(&mut frame, 7, F::FRAME_SYNC | F::LINE_DATA);
        put(&mut frame, 29, F::FRAME_SYNC | F::LINE_SYNC | F::LINE_DATA);
        put(
            &mut frame,
            200,
            F::FRAME_SYNC | F::FRAME_BEGIN | F::LINE_SYNC | F::LINE_DATA,
        );
        put(&mut frame, 5, F::FRAME_SYNC | F::LINE_SYNC | F::LINE_DATA);
    }

    frame
}

/// Interface to the EPD controller.
///
/// Provides panel power control, throttled temperature readings, access
/// to the scanout back buffer and the vsync-synchronous page flip.
pub struct PanelController {
    device: FramebufferDevice,
    sensor: TemperatureSensor,
    geometry: PanelGeometry,

    var_info: FbVarScreeninfo,
    #[allow(dead_code)]
    fix_info: FbFixScreeninfo,

    /// Memory-mapped scanout region; present while started.
    scanout: Option<MmapMut>,

    /// Frame slot currently displayed; `None` before the first flip and
    /// after every power-down.
    front_index: Option<usize>,

    /// Frame slot safe to write. Always 0 or 1: the remaining slots,
    /// including the hardware's null-frame slot, are never redrawn.
    back_index: usize,

    /// Frame that leaves the display contents unchanged.
    blank_frame: Vec<u8>,

    powered: bool,

    temperature: i32,
    temperature_read_at: Option<Instant>,
}

impl PanelController {
    /// Open a controller with the given device paths.
    pub fn open(
        framebuffer_path: impl AsRef<Path>,
        sensor_path: impl AsRef<Path>,
        geometry: PanelGeometry,
    ) -> Result<Self, PanelError> {
        let device = FramebufferDevice::open(framebuffer_path)
            .map_err(|err| PanelError::io("open framebuffer device", err))?;
        let sensor = TemperatureSensor::open(sensor_path)
            .map_err(|err| PanelError::io("open temperature sensor", err))?;

        Ok(Self {
            device,
            sensor,
            geometry,
            var_info: FbVarScreeninfo::default(),
            fix_info: FbFixScreeninfo::default(),
            scanout: None,
            front_index: None,
            back_index: 0,
            blank_frame: Vec::new(),
            powered: false,
            temperature: 0,
            temperature_read_at: None,
        })
    }

    /// Power the panel on, validate its geometry, map the scanout
    /// region and preload every frame slot with the blank frame.
    pub fn start(&mut self) -> Result<(), PanelError> {
        self.set_power(true)?;
        self.temperature()?;

        self.var_info = self
            .device
            .var_screeninfo()
            .map_err(|err| PanelError::io("fetch variable screen info", err))?;
        self.fix_info = self
            .device
            .fix_screeninfo()
            .map_err(|err| PanelError::io("fetch fixed screen info", err))?;

        self.validate_geometry()?;

        let mut scanout = self
            .device
            .map(self.fix_info.smem_len as usize)
            .map_err(|err| PanelError::io("map framebuffer memory", err))?;

        self.blank_frame = build_blank_frame(&self.geometry);

        let frame_size = self.geometry.frame_size as usize;
        for slot in 0..self.geometry.frame_count as usize {
            let start = slot * frame_size;
            scanout[start..start + frame_size].copy_from_slice(&self.blank_frame);
        }

        self.scanout = Some(scanout);
        self.front_index = None;
        self.back_index = 0;

        tracing::info!(
            width = self.geometry.visible_width,
            height = self.geometry.visible_height,
            temperature = self.temperature,
            "panel started"
        );

        Ok(())
    }

    /// Unmap the scanout region and power the panel down.
    pub fn stop(&mut self) {
        self.scanout = None;

        if let Err(err) = self.set_power(false) {
            tracing::warn!(%err, "failed to power panel down");
        }
    }

    fn validate_geometry(&self) -> Result<(), PanelError> {
        let checks = [
            ("xres", self.geometry.width, self.var_info.xres),
            ("yres", self.geometry.height, self.var_info.yres),
            (
                "xres_virtual",
                self.geometry.width,
                self.var_info.xres_virtual,
            ),
            (
                "yres_virtual",
                self.geometry.height * self.geometry.frame_count,
                self.var_info.yres_virtual,
            ),
        ];

        for (field, expected, actual) in checks {
            if expected != actual {
                return Err(PanelError::Geometry {
                    field,
                    expected,
                    actual,
                });
            }
        }

        if self.fix_info.smem_len < self.geometry.total_size {
            return Err(PanelError::Geometry {
                field: "smem_len",
                expected: self.geometry.total_size,
                actual: self.fix_info.smem_len,
            });
        }

        Ok(())
    }

    /// Turn the panel power on or off.
    ///
    /// Idempotent: the blanking ioctl is only issued on transitions. On
    /// failure the recorded power state is left unchanged.
    pub fn set_power(&mut self, power: bool) -> Result<(), PanelError> {
        if power != self.powered {
            self.device
                .blank(power)
                .map_err(|err| PanelError::io("set panel power", err))?;
            self.powered = power;
        }

        if !self.powered {
            // The next flip after a power-up schedules a fresh frame
            self.front_index = None;
        }

        Ok(())
    }

    /// Get the panel temperature, in Celsius.
    ///
    /// Readings are refreshed at most every 30 seconds and only while
    /// the panel is powered; the cached value is returned otherwise.
    pub fn temperature(&mut self) -> Result<i32, PanelError> {
        let stale = self
            .temperature_read_at
            .is_none_or(|at| at.elapsed() > TEMPERATURE_READ_INTERVAL);

        if self.powered && stale {
            self.temperature = self
                .sensor
                .read()
                .map_err(|err| PanelError::io("read panel temperature", err))?;
            self.temperature_read_at = Some(Instant::now());
        }

        Ok(self.temperature)
    }

    /// Get the framebuffer geometry.
    pub fn geometry(&self) -> &PanelGeometry {
        &self.geometry
    }

    /// Get the blank frame template.
    pub fn blank_frame(&self) -> &[u8] {
        &self.blank_frame
    }

    /// Access the frame slot currently safe to write.
    pub fn back_buffer(&mut self) -> Result<&mut [u8], PanelError> {
        debug_assert!(self.back_index < 2, "back buffer outside double buffer");

        let frame_size = self.geometry.frame_size as usize;
        let start = self.back_index * frame_size;

        match self.scanout.as_mut() {
            Some(scanout) => Ok(&mut scanout[start..start + frame_size]),
            None => Err(PanelError::NotStarted),
        }
    }

    /// Schedule the back buffer for display and swap buffers.
    ///
    /// The first flip after power-up programs the screen info; later
    /// flips pan the display, blocking until the panel's next vsync
    /// interval.
    pub fn page_flip(&mut self) -> Result<(), PanelError> {
        if self.scanout.is_none() {
            return Err(PanelError::NotStarted);
        }

        self.var_info.yoffset = self.back_index as u32 * self.geometry.height;

        let result = match self.front_index {
            None => self.device.put_vscreeninfo(&self.var_info),
            Some(_) => self.device.pan_display(&self.var_info),
        };

        result.map_err(|err| PanelError::io("page flip", err))?;

        self.front_index = Some(self.back_index);
        self.back_index = (self.back_index + 1) % 2;
        Ok(())
    }
}

impl Drop for PanelController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_derives_sizes() {
        let geometry = PanelGeometry::REMARKABLE2;
        assert_eq!(geometry.stride, 1040);
        assert_eq!(geometry.frame_size, 1040 * 1408);
        assert_eq!(geometry.total_size, 1040 * 1408 * 17);
        assert_eq!(geometry.visible_width, 1872);
        assert_eq!(geometry.visible_height, 1404);
        assert_eq!(geometry.visible_size, 1872 * 1404);
    }

    fn sync_byte(frame: &[u8], geometry: &PanelGeometry, row: usize, column: usize) -> u8 {
        frame[row * geometry.stride as usize + column * geometry.depth as usize + 2]
    }

    #[test]
    fn blank_frame_row_patterns() {
        let geometry = PanelGeometry::REMARKABLE2;
        let frame = build_blank_frame(&geometry);
        assert_eq!(frame.len(), geometry.frame_size as usize);

        // First line: frame sync bursts
        assert_eq!(sync_byte(&frame, &geometry, 0, 0), 0b0100_0011);
        assert_eq!(sync_byte(&frame, &geometry, 0, 20), 0b0100_0111);
        assert_eq!(sync_byte(&frame, &geometry, 0, 40), 0b0100_0101);
        assert_eq!(sync_byte(&frame, &geometry, 0, 103), 0b0100_0111);
        assert_eq!(sync_byte(&frame, &geometry, 0, 143), 0b0100_0011);
        assert_eq!(sync_byte(&frame, &geometry, 0, 259), 0b0100_0011);

        // Second line: line begin burst, no line sync yet
        assert_eq!(sync_byte(&frame, &geometry, 1, 0), 0b0100_0001);
        assert_eq!(sync_byte(&frame, &geometry, 1, 8), 0b0110_0001);
        assert_eq!(sync_byte(&frame, &geometry, 1, 19), 0b0100_0001);
        assert_eq!(sync_byte(&frame, &geometry, 1, 55), 0b0100_0011);
        assert_eq!(sync_byte(&frame, &geometry, 1, 255), 0b0100_0001);

        // Steady-state line: line sync pattern
        assert_eq!(sync_byte(&frame, &geometry, 3, 0), 0b0100_0001);
        assert_eq!(sync_byte(&frame, &geometry, 3, 8), 0b0110_0001);
        assert_eq!(sync_byte(&frame, &geometry, 3, 19), 0b0100_0001);
        assert_eq!(sync_byte(&frame, &geometry, 3, 26), 0b0101_0001);
        assert_eq!(sync_byte(&frame, &geometry, 3, 55), 0b0101_0011);
        assert_eq!(sync_byte(&frame, &geometry, 3, 255), 0b0101_0001);
        assert_eq!(
            sync_byte(&frame, &geometry, geometry.height as usize - 1, 100),
            0b0101_0011
        );
    }

    #[test]
    fn blank_frame_keeps_data_and_reserved_bytes_zero() {
        let geometry = PanelGeometry::REMARKABLE2;
        let frame = build_blank_frame(&geometry);

        for pixel in frame.chunks_exact(geometry.depth as usize) {
            assert_eq!(pixel[0], 0);
            assert_eq!(pixel[1], 0);
            assert_eq!(pixel[3], 0);
        }
    }
}
