//! Panel device access: framebuffer plumbing, temperature sensor and
//! the display controller built on top of them.

pub mod controller;
pub mod framebuffer;
pub mod sensor;

pub use controller::{PanelController, PanelError, PanelGeometry, SyncFlags};

use std::fs;
use std::path::PathBuf;

/// Name under which the panel controller registers its framebuffer.
const FRAMEBUFFER_NAME: &str = "mxs-lcdif";

/// Name under which the panel temperature sensor registers.
const TEMPERATURE_SENSOR_NAME: &str = "sy7636a_temperature";

fn sysfs_name(entry: &fs::DirEntry) -> Option<String> {
    let name = fs::read_to_string(entry.path().join("name")).ok()?;
    Some(name.trim_end().to_owned())
}

/// Discover the framebuffer device node for the panel controller.
///
/// Scans `/sys/class/graphics` for an entry whose `name` matches the
/// panel controller and maps its device number to a `/dev/fb` node.
pub fn discover_framebuffer() -> Option<PathBuf> {
    for entry in fs::read_dir("/sys/class/graphics").ok()?.flatten() {
        if sysfs_name(&entry).as_deref() != Some(FRAMEBUFFER_NAME) {
            continue;
        }

        let dev = fs::read_to_string(entry.path().join("dev")).ok()?;
        let minor = dev.trim_end().split(':').nth(1)?;
        let dev_path = PathBuf::from(format!("/dev/fb{minor}"));

        if dev_path.exists() {
            return Some(dev_path);
        }
    }

    None
}

/// Discover the temperature sensor file for the panel.
///
/// Scans `/sys/class/hwmon` for an entry whose `name` matches the
/// panel's sensor and returns its `temp0` attribute.
pub fn discover_temperature_sensor() -> Option<PathBuf> {
    for entry in fs::read_dir("/sys/class/hwmon").ok()?.flatten() {
        if sysfs_name(&entry).as_deref() != Some(TEMPERATURE_SENSOR_NAME) {
            continue;
        }

        let sensor_path = entry.path().join("temp0");

        if sensor_path.exists() {
            return Some(sensor_path);
        }
    }

    None
}
