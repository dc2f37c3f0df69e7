//! WBF waveform file parsing.
//!
//! The WBF format is widely used for storing waveform data, but no
//! official description has been published by E-Ink. This decoder is
//! based on the following unofficial sources:
//!
//! - <https://www.waveshare.net/w/upload/c/c4/E-paper-mode-declaration.pdf>
//! - <https://github.com/fread-ink/inkwave>
//! - <https://github.com/torvalds/linux/blob/master/drivers/video/fbdev/metronomefb.c>
//! - <https://github.com/julbouln/ice40_eink_controller/blob/master/utils/wbf_dump/wbf_dump.c>
//!
//! All multi-byte values are little-endian.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{Phase, PhaseMatrix, Temperature, Waveform, INTENSITY_VALUES};

/// Structural violations encountered while decoding a WBF file.
#[derive(Error, Debug)]
pub enum WbfError {
    #[error("failed to read waveform file: {0}")]
    Io(#[from] std::io::Error),

    #[error("too short to be a WBF file: {actual} bytes, minimum header size is {expected}")]
    TooShort { actual: usize, expected: usize },

    #[error("truncated WBF section at offset {offset}")]
    Truncated { offset: usize },

    #[error("corrupted WBF header: expected {field} {expected:#04x}, actual {actual:#04x}")]
    HeaderChecksum {
        field: &'static str,
        expected: u8,
        actual: u8,
    },

    #[error("corrupted WBF file: expected CRC32 {expected:#010x}, actual {actual:#010x}")]
    FileChecksum { expected: u32, actual: u32 },

    #[error("invalid filesize in WBF header: specified {expected} bytes, actual {actual}")]
    FileSize { expected: u32, actual: usize },

    #[error("invalid {field} in WBF header: expected {expected}, actual {actual}")]
    UnexpectedField {
        field: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("corrupted WBF temperature table: expected checksum {expected:#04x}, actual {actual:#04x}")]
    TemperatureChecksum { expected: u8, actual: u8 },

    #[error("corrupted WBF section pointer: expected checksum {expected:#04x}, actual {actual:#04x}")]
    PointerChecksum { expected: u8, actual: u8 },
}

/// Size of the fixed WBF header.
pub(crate) const HEADER_SIZE: usize = 48;

// Header values that are not expected to vary between supported panels.
// Since their precise meaning is unknown, operation does not proceed if
// they differ from the values found in the file.
const EXPECTED_RUN_TYPE: u8 = 17;
const EXPECTED_FPL_PLATFORM: u8 = 0;
const EXPECTED_ADHESIVE_RUN: u8 = 25;
const EXPECTED_WAVEFORM_TYPE: u8 = 81;
const EXPECTED_WAVEFORM_REVISION: u8 = 0;
const EXPECTED_VCOM_OFFSET: u8 = 0;
const EXPECTED_FVSN: u8 = 1;
const EXPECTED_LUTS: u8 = 4;
const EXPECTED_ADVANCED_WFM_FLAGS: u8 = 3;

/// Fields of the fixed WBF header used by the driver.
#[derive(Debug, Clone)]
pub(crate) struct WbfHeader {
    pub checksum: u32,
    pub filesize: u32,
    pub fpl_lot: u16,
    pub frame_rate: u8,
    /// Index of the last mode.
    pub mode_count: u8,
    /// Index of the last temperature range.
    pub temp_range_count: u8,
}

/// Everything the waveform table needs out of a WBF file.
pub(crate) struct WbfContents {
    pub frame_rate: u8,
    pub mode_count: u8,
    pub temperatures: Vec<Temperature>,
    pub waveforms: Vec<Waveform>,
    /// `lookup[mode][temp_range]` indexes into `waveforms`.
    pub lookup: Vec<Vec<usize>>,
}

/// Sum-mod-256 checksum used throughout WBF files.
fn basic_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Table for the reflected CRC-32 (IEEE) used by the file checksum.
const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

/// Incremental CRC-32, zlib-compatible: `crc32(crc32(0, a), b)` equals
/// the checksum of `a ++ b`.
fn crc32(crc: u32, bytes: &[u8]) -> u32 {
    let mut value = !crc;
    for &byte in bytes {
        value = CRC32_TABLE[((value ^ byte as u32) & 0xFF) as usize] ^ (value >> 8);
    }
    !value
}

/// Byte cursor over the file contents.
struct Reader<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    fn at(buffer: &'a [u8], pos: usize) -> Self {
        Self { buffer, pos }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], WbfError> {
        let end = self.pos.checked_add(count).filter(|&e| e <= self.buffer.len());
        match end {
            Some(end) => {
                let slice = &self.buffer[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(WbfError::Truncated { offset: self.pos }),
        }
    }

    fn u8(&mut self) -> Result<u8, WbfError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, WbfError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, WbfError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u24_le(&mut self) -> Result<u32, WbfError> {
        let bytes = self.take(3)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    /// Read a 24-bit section pointer followed by its checksum byte.
    fn pointer(&mut self) -> Result<u32, WbfError> {
        let bytes = self.take(3)?;
        let expected = bytes[0].wrapping_add(bytes[1]).wrapping_add(bytes[2]);
        let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
        let actual = self.u8()?;

        if expected != actual {
            return Err(WbfError::PointerChecksum { expected, actual });
        }

        Ok(value)
    }
}

fn check_field(field: &'static str, expected: u8, actual: u8) -> Result<(), WbfError> {
    if expected != actual {
        return Err(WbfError::UnexpectedField {
            field,
            expected: expected.into(),
            actual: actual.into(),
        });
    }
    Ok(())
}

/// Parse the fixed header of a WBF file and check its integrity.
pub(crate) fn parse_header(buffer: &[u8]) -> Result<WbfHeader, WbfError> {
    if buffer.len() < HEADER_SIZE {
        return Err(WbfError::TooShort {
            actual: buffer.len(),
            expected: HEADER_SIZE,
        });
    }

    let mut reader = Reader::new(buffer);
    let checksum = reader.u32_le()?;
    let filesize = reader.u32_le()?;
    let _serial = reader.u32_le()?;
    let run_type = reader.u8()?;
    let fpl_platform = reader.u8()?;
    let fpl_lot = reader.u16_le()?;
    let adhesive_run = reader.u8()?;
    let _waveform_version = reader.u8()?;
    let _waveform_subversion = reader.u8()?;
    let waveform_type = reader.u8()?;
    let _fpl_size = reader.u8()?;
    let _mfg_code = reader.u8()?;
    let waveform_revision = reader.u8()?;
    let _old_frame_rate = reader.u8()?;
    let frame_rate = reader.u8()?;
    let vcom_offset = reader.u8()?;
    let _reserved1 = reader.u16_le()?;
    let _extra_info_addr = reader.u24_le()?;
    let checksum1 = reader.u8()?;
    let _wmta = reader.u24_le()?;
    let fvsn = reader.u8()?;
    let luts = reader.u8()?;
    let mode_count = reader.u8()?;
    let temp_range_count = reader.u8()?;
    let advanced_wfm_flags = reader.u8()?;
    let _eb = reader.u8()?;
    let _sb = reader.u8()?;
    let _reserved = reader.take(5)?;
    let checksum2 = reader.u8()?;

    // Byte checksums over the two header sub-ranges. The first covers
    // bytes 8-30 (everything after the CRC and filesize), the second
    // bytes 32-46.
    let checksum1_verif = basic_checksum(&buffer[8..31]);

    if checksum1 != checksum1_verif {
        return Err(WbfError::HeaderChecksum {
            field: "checksum1",
            expected: checksum1,
            actual: checksum1_verif,
        });
    }

    let checksum2_verif = basic_checksum(&buffer[32..47]);

    if checksum2 != checksum2_verif {
        return Err(WbfError::HeaderChecksum {
            field: "checksum2",
            expected: checksum2,
            actual: checksum2_verif,
        });
    }

    check_field("run type", EXPECTED_RUN_TYPE, run_type)?;
    check_field("FPL platform", EXPECTED_FPL_PLATFORM, fpl_platform)?;
    check_field("adhesive run", EXPECTED_ADHESIVE_RUN, adhesive_run)?;
    check_field("waveform type", EXPECTED_WAVEFORM_TYPE, waveform_type)?;
    check_field(
        "waveform revision",
        EXPECTED_WAVEFORM_REVISION,
        waveform_revision,
    )?;
    check_field("VCOM offset", EXPECTED_VCOM_OFFSET, vcom_offset)?;
    check_field("FVSN", EXPECTED_FVSN, fvsn)?;
    check_field("LUTS", EXPECTED_LUTS, luts)?;
    check_field(
        "advanced waveform flags",
        EXPECTED_ADVANCED_WFM_FLAGS,
        advanced_wfm_flags,
    )?;

    Ok(WbfHeader {
        checksum,
        filesize,
        fpl_lot,
        frame_rate,
        mode_count,
        temp_range_count,
    })
}

/// Parse the temperature threshold table.
fn parse_temperatures(
    header: &WbfHeader,
    reader: &mut Reader<'_>,
) -> Result<Vec<Temperature>, WbfError> {
    let count = header.temp_range_count as usize + 2;
    let bytes = reader.take(count)?;
    let expected = basic_checksum(bytes);
    let result = bytes.iter().map(|&b| b as Temperature).collect();
    let actual = reader.u8()?;

    if expected != actual {
        return Err(WbfError::TemperatureChecksum { expected, actual });
    }

    Ok(result)
}

/// Decode one run-length-encoded waveform block into its sequence of
/// phase matrices.
///
/// Each payload byte packs four phases. In repeat mode (the initial
/// state) it is followed by a repetition count minus one; a `0xFC` byte
/// toggles repeat mode and a `0xFF` byte in repeat mode terminates the
/// block. Phases fill the matrices column-major: the source intensity
/// varies fastest.
fn parse_waveform(block: &[u8]) -> Waveform {
    // The last two bytes of a block are not phase data
    let end = block.len().saturating_sub(2);
    let mut bytes = block[..end].iter();

    let mut matrix: PhaseMatrix = [[Phase::Noop; INTENSITY_VALUES]; INTENSITY_VALUES];
    let mut result = Waveform::new();

    let mut from: usize = 0;
    let mut to: usize = 0;
    let mut repeat_mode = true;

    while let Some(&byte) = bytes.next() {
        if byte == 0xFC {
            repeat_mode = !repeat_mode;
            continue;
        }

        let phases = [
            Phase::from_bits(byte >> 6),
            Phase::from_bits(byte >> 4),
            Phase::from_bits(byte >> 2),
            Phase::from_bits(byte),
        ];

        let mut repeat = 1usize;

        if repeat_mode {
            match bytes.next() {
                Some(&count) => {
                    repeat = count as usize + 1;
                    if byte == 0xFF {
                        break;
                    }
                }
                None => break,
            }
        }

        for _ in 0..repeat {
            for phase in phases {
                matrix[from][to] = phase;
                from += 1;

                if from == INTENSITY_VALUES {
                    from = 0;
                    to += 1;
                }

                if to == INTENSITY_VALUES {
                    to = 0;
                    result.push(matrix);
                }
            }
        }
    }

    result
}

/// Parse a complete WBF file held in memory.
pub(crate) fn parse(buffer: &[u8]) -> Result<WbfContents, WbfError> {
    let header = parse_header(buffer)?;

    if header.filesize as usize != buffer.len() {
        return Err(WbfError::FileSize {
            expected: header.filesize,
            actual: buffer.len(),
        });
    }

    // CRC-32 over the whole file with the checksum field zeroed out
    let mut crc_verif = crc32(0, &[0, 0, 0, 0]);
    crc_verif = crc32(crc_verif, &buffer[4..]);

    if header.checksum != crc_verif {
        return Err(WbfError::FileChecksum {
            expected: header.checksum,
            actual: crc_verif,
        });
    }

    let mut reader = Reader::at(buffer, HEADER_SIZE);
    let temperatures = parse_temperatures(&header, &mut reader)?;

    // Skip the extra-info string (its contents duplicate the file name)
    let extra_len = buffer
        .get(reader.pos)
        .copied()
        .ok_or(WbfError::Truncated { offset: reader.pos })? as usize;
    let mut table = Reader::at(buffer, reader.pos + extra_len + 2);

    let mode_count = header.mode_count as usize + 1;
    let temp_count = header.temp_range_count as usize + 1;

    // Two-level pointer table: one pointer per mode, each addressing a
    // per-temperature table of waveform block pointers. Several entries
    // may share one block.
    let mut addresses: Vec<Vec<u32>> = Vec::with_capacity(mode_count);

    for _ in 0..mode_count {
        let mode_offset = table.pointer()? as usize;
        let mut mode_reader = Reader::at(buffer, mode_offset);
        let mut per_temp = Vec::with_capacity(temp_count);

        for _ in 0..temp_count {
            per_temp.push(mode_reader.pointer()?);
        }

        addresses.push(per_temp);
    }

    let blocks: Vec<u32> = addresses
        .iter()
        .flatten()
        .copied()
        .collect::<BTreeSet<u32>>()
        .into_iter()
        .collect();

    let mut waveforms = Vec::with_capacity(blocks.len());

    for (index, &start) in blocks.iter().enumerate() {
        let end = blocks
            .get(index + 1)
            .map(|&next| next as usize)
            .unwrap_or(buffer.len());
        let start = start as usize;

        if start > end || end > buffer.len() {
            return Err(WbfError::Truncated { offset: start });
        }

        waveforms.push(parse_waveform(&buffer[start..end]));
    }

    let lookup = addresses
        .iter()
        .map(|per_temp| {
            per_temp
                .iter()
                .map(|&address| blocks.partition_point(|&block| block < address))
                .collect()
        })
        .collect();

    Ok(WbfContents {
        frame_rate: if header.frame_rate == 0 {
            85
        } else {
            header.frame_rate
        },
        mode_count: header.mode_count + 1,
        temperatures,
        waveforms,
        lookup,
    })
}

/// Where vendor firmware installs the panel's waveform files.
const WBF_DIRECTORY: &str = "/usr/share/remarkable";

/// Block device holding the length-prefixed panel metadata fields.
const METADATA_DEVICE: &str = "/dev/mmcblk2boot1";

/// Read the set of length-prefixed metadata fields from the metadata
/// device. The fourth field contains a barcode identifying the EPD.
fn read_metadata(path: &Path) -> std::io::Result<Vec<Vec<u8>>> {
    let mut device = File::open(path)?;
    let mut result = Vec::new();

    loop {
        let mut length = [0u8; 4];
        if device.read_exact(&mut length).is_err() {
            break;
        }

        let length = u32::from_be_bytes(length) as usize;
        if length == 0 {
            break;
        }

        let mut data = vec![0u8; length];
        device.read_exact(&mut data)?;
        result.push(data);
    }

    Ok(result)
}

/// Map a barcode symbol to its numeric value.
fn barcode_symbol_to_int(symbol: u8) -> Option<i16> {
    match symbol {
        b'0'..=b'9' => Some((symbol - b'0') as i16),
        // A-H map to 10-17
        b'A'..=b'H' => Some((symbol - b'A') as i16 + 10),
        // J-N map to 18-22
        b'J'..=b'N' => Some((symbol - b'J') as i16 + 18),
        // Q-Z map to 23-32
        b'Q'..=b'Z' => Some((symbol - b'Q') as i16 + 23),
        _ => None,
    }
}

/// Decode the front panel laminate lot number out of the EPD barcode.
fn decode_fpl_number(barcode: &[u8]) -> Option<i16> {
    if barcode.len() < 8 {
        return None;
    }

    let d6 = barcode_symbol_to_int(barcode[6])?;
    let d7 = barcode_symbol_to_int(barcode[7])?;

    if d7 < 10 {
        // Values from 0 to 329
        Some(d7 + d6 * 10)
    } else {
        // Values from 330 to 858
        Some(d7 + 320 + (d6 - 10) * 23)
    }
}

/// Discover the WBF file matching the installed panel.
///
/// Reads the panel barcode from the metadata device, decodes its FPL
/// lot number and returns the first vendor waveform file whose header
/// carries the same lot. Malformed candidates are skipped.
pub fn discover_wbf_file() -> Option<PathBuf> {
    let metadata = read_metadata(Path::new(METADATA_DEVICE)).ok()?;

    if metadata.len() < 4 {
        return None;
    }

    let fpl_lot = decode_fpl_number(&metadata[3])?;

    for entry in std::fs::read_dir(WBF_DIRECTORY).ok()?.flatten() {
        let path = entry.path();

        if path.extension().is_none_or(|ext| ext != "wbf") {
            continue;
        }

        let mut buffer = vec![0u8; HEADER_SIZE];
        let read = File::open(&path).and_then(|mut file| file.read_exact(&mut buffer));

        if read.is_err() {
            continue;
        }

        match parse_header(&buffer) {
            Ok(header) if header.fpl_lot == fpl_lot as u16 => return Some(path),
            _ => continue,
        }
    }

    None
}
