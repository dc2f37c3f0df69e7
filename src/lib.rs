//! Userspace grayscale driver for electrophoretic display panels.
//!
//! The driver accepts rectangular update requests and drives a
//! memory-mapped panel framebuffer at the panel's native refresh rate,
//! telling every cell on each frame whether to pull black, pull white
//! or hold. A single logical update expands into a temperature- and
//! mode-dependent sequence of phase frames sourced from a vendor
//! waveform table.
//!
//! The pipeline:
//!
//! - clients submit updates through [`Driver::submit`];
//! - the generator thread coalesces compatible pending updates and
//!   produces phase frames, in batch or immediate mode;
//! - the vsync thread copies each frame into the scanout double buffer
//!   and page-flips in lockstep with the panel, powering it down after
//!   idle periods.

pub mod config;
pub mod driver;
pub mod panel;
pub mod perf;
pub mod update;
pub mod waveform;

pub use config::Config;
pub use driver::{Driver, DriverOptions};
pub use panel::{PanelController, PanelError, PanelGeometry};
pub use update::{Region, UpdateId};
pub use waveform::{Intensity, ModeKind, WaveformError, WaveformTable};
