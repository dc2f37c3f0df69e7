//! Low-level framebuffer device access.
//!
//! Thin wrapper around the Linux fbdev ioctl interface: screen-info
//! queries, display panning, blanking and memory mapping of the scanout
//! region. The screeninfo structs mirror the kernel ABI in `linux/fb.h`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOPUT_VSCREENINFO: libc::c_ulong = 0x4601;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;
const FBIOPAN_DISPLAY: libc::c_ulong = 0x4606;
const FBIOBLANK: libc::c_ulong = 0x4611;

const FB_BLANK_UNBLANK: libc::c_int = 0;
const FB_BLANK_POWERDOWN: libc::c_int = 4;

/// Mirror of the kernel's `fb_bitfield`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

/// Mirror of the kernel's `fb_var_screeninfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FbVarScreeninfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// Mirror of the kernel's `fb_fix_screeninfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FbFixScreeninfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub fb_type: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

impl Default for FbFixScreeninfo {
    fn default() -> Self {
        // Safety: the struct is plain old data; all-zero is a valid value
        unsafe { std::mem::zeroed() }
    }
}

/// An open framebuffer device node.
pub struct FramebufferDevice {
    file: File,
}

impl FramebufferDevice {
    /// Open the framebuffer device for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    fn ioctl<T>(&self, request: libc::c_ulong, argument: *mut T) -> io::Result<()> {
        // Safety: the request codes paired with their argument types
        // match the fbdev ABI, and the pointer outlives the call
        let result = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, argument) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Fetch the variable screen information.
    pub fn var_screeninfo(&self) -> io::Result<FbVarScreeninfo> {
        let mut info = FbVarScreeninfo::default();
        self.ioctl(FBIOGET_VSCREENINFO, &mut info)?;
        Ok(info)
    }

    /// Fetch the fixed screen information.
    pub fn fix_screeninfo(&self) -> io::Result<FbFixScreeninfo> {
        let mut info = FbFixScreeninfo::default();
        self.ioctl(FBIOGET_FSCREENINFO, &mut info)?;
        Ok(info)
    }

    /// Program the variable screen information, scheduling the first
    /// frame.
    pub fn put_vscreeninfo(&self, info: &FbVarScreeninfo) -> io::Result<()> {
        let mut copy = *info;
        self.ioctl(FBIOPUT_VSCREENINFO, &mut copy)
    }

    /// Pan the display to the offset in the given screen information.
    ///
    /// Blocks until the panel's next vsync interval.
    pub fn pan_display(&self, info: &FbVarScreeninfo) -> io::Result<()> {
        let mut copy = *info;
        self.ioctl(FBIOPAN_DISPLAY, &mut copy)
    }

    /// Power the panel up or down through the blanking ioctl.
    pub fn blank(&self, power: bool) -> io::Result<()> {
        let level = if power {
            FB_BLANK_UNBLANK
        } else {
            FB_BLANK_POWERDOWN
        };

        // Safety: FBIOBLANK takes an integer argument, not a pointer
        let result =
            unsafe { libc::ioctl(self.file.as_raw_fd(), FBIOBLANK as _, level as libc::c_ulong) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Map the scanout memory into the process address space.
    pub fn map(&self, length: usize) -> io::Result<MmapMut> {
        // Safety: the mapping is backed by the open device node and
        // the driver assumes exclusive ownership of the panel
        unsafe { MmapOptions::new().len(length).map_mut(&self.file) }
    }
}
