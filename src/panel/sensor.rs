//! Panel temperature sensor access.
//!
//! The sensor is a pseudo-file yielding the panel temperature as an
//! ASCII decimal in Celsius. Each reading re-seeks to the start of the
//! file; the controller throttles how often readings are taken.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// An open temperature sensor pseudo-file.
pub struct TemperatureSensor {
    file: File,
}

impl TemperatureSensor {
    /// Open the sensor file for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self { file })
    }

    /// Take a fresh reading, in Celsius.
    pub fn read(&mut self) -> io::Result<i32> {
        self.file.seek(SeekFrom::Start(0))?;

        let mut buffer = [0u8; 12];
        let size = self.file.read(&mut buffer)?;

        let text = std::str::from_utf8(&buffer[..size])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        text.trim()
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
