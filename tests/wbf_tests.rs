//! Integration tests for WBF parsing, waveform lookup and mode-kind
//! classification, using synthetic waveform files built in memory.

use epdfb::waveform::{ModeKind, Phase, WaveformError, WaveformTable, WbfError};

/// Phase encodings used when building blocks.
const NOOP: u8 = 0b00;
const BLACK: u8 = 0b01;
const WHITE: u8 = 0b10;

/// Reference CRC-32 (reflected, IEEE), reimplemented here so the tests
/// do not depend on the implementation under test.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

fn basic_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Append a 24-bit pointer and its checksum byte.
fn push_pointer(out: &mut Vec<u8>, value: u32) {
    let bytes = value.to_le_bytes();
    out.extend_from_slice(&bytes[..3]);
    out.push(bytes[0].wrapping_add(bytes[1]).wrapping_add(bytes[2]));
}

/// Encode one waveform block without run-length compression: a repeat
/// mode toggle followed by 256 packed bytes per step and the two
/// trailing bytes every block carries.
fn encode_block(steps: usize, phase: impl Fn(usize, usize, usize) -> u8) -> Vec<u8> {
    let mut block = vec![0xFC];

    for step in 0..steps {
        for index in 0..256 {
            let mut byte = 0u8;
            for offset in 0..4 {
                let linear = index * 4 + offset;
                // Phases are laid out column-major: source varies fastest
                let from = linear % 32;
                let to = linear / 32;
                byte = (byte << 2) | (phase(step, from, to) & 0b11);
            }
            block.push(byte);
        }
    }

    block.extend([0, 0]);
    block
}

/// Assemble a complete WBF file: header, temperature table, empty
/// extra-info section, the two-level pointer table and one waveform
/// block per mode (shared across its temperature ranges).
fn build_wbf(temperatures: &[i8], blocks: &[Vec<u8>]) -> Vec<u8> {
    let mode_count = blocks.len();
    let range_count = temperatures.len() - 1;

    let mut header = vec![0u8; 48];
    header[12] = 17; // run_type
    header[13] = 0; // fpl_platform
    header[14] = 0x34; // fpl_lot (low byte)
    header[16] = 25; // adhesive_run
    header[19] = 81; // waveform_type
    header[22] = 0; // waveform_revision
    header[23] = 0x85; // old_frame_rate
    header[24] = 85; // frame_rate
    header[25] = 0; // vcom_offset
    header[35] = 1; // fvsn
    header[36] = 4; // luts
    header[37] = (mode_count - 1) as u8;
    header[38] = (range_count - 1) as u8;
    header[39] = 3; // advanced_wfm_flags

    let mut body = Vec::new();

    // Temperature thresholds plus their checksum
    let temp_bytes: Vec<u8> = temperatures.iter().map(|&t| t as u8).collect();
    body.extend_from_slice(&temp_bytes);
    body.push(basic_checksum(&temp_bytes));

    // Empty extra-info section: length byte plus checksum byte
    body.extend([0, 0]);

    // Section offsets are absolute within the file
    let table_offset = header.len() + body.len();
    let mode_tables_offset = table_offset + mode_count * 4;
    let blocks_offset = mode_tables_offset + mode_count * range_count * 4;

    // Top-level table: one pointer per mode
    for mode in 0..mode_count {
        push_pointer(
            &mut body,
            (mode_tables_offset + mode * range_count * 4) as u32,
        );
    }

    // Per-mode tables: one block pointer per temperature range
    let mut block_offset = blocks_offset;
    for block in blocks {
        for _ in 0..range_count {
            push_pointer(&mut body, block_offset as u32);
        }
        block_offset += block.len();
    }

    for block in blocks {
        body.extend_from_slice(block);
    }

    let mut file = header;
    file.extend_from_slice(&body);

    let filesize = file.len() as u32;
    file[4..8].copy_from_slice(&filesize.to_le_bytes());

    file[31] = basic_checksum(&file[8..31]);
    file[47] = basic_checksum(&file[32..47]);

    let mut crc_input = file.clone();
    crc_input[..4].fill(0);
    let crc = crc32(&crc_input);
    file[..4].copy_from_slice(&crc.to_le_bytes());

    file
}

/// An INIT-style block (every transition identical) and a DU-style
/// block (every source drives only toward black).
fn sample_file(temperatures: &[i8]) -> Vec<u8> {
    let init = encode_block(2, |_, _, _| BLACK);
    let du = encode_block(3, |_, _, to| if to == 0 { BLACK } else { NOOP });
    build_wbf(temperatures, &[init, du])
}

#[test]
fn parse_round_trips_header_fields() {
    let table = WaveformTable::from_bytes(&sample_file(&[0, 10, 20, 30])).unwrap();

    assert_eq!(table.frame_rate(), 85);
    assert_eq!(table.mode_count(), 2);
    assert_eq!(table.temperatures(), &[0, 10, 20, 30]);
}

#[test]
fn lookup_yields_stable_waveforms_with_valid_phases() {
    let table = WaveformTable::from_bytes(&sample_file(&[0, 10, 20, 30])).unwrap();

    for (mode, expected_len) in [(0u8, 2usize), (1, 3)] {
        for temperature in [0, 9, 15, 29] {
            let waveform = table.lookup(mode, temperature).unwrap();
            assert_eq!(waveform.len(), expected_len);

            // Lookup is pure: a second call sees the identical waveform
            assert_eq!(table.lookup(mode, temperature).unwrap().len(), expected_len);

            for matrix in waveform {
                for row in matrix.iter() {
                    for &phase in row.iter() {
                        assert!(matches!(phase, Phase::Noop | Phase::Black | Phase::White));
                    }
                }
            }
        }
    }
}

#[test]
fn lookup_decodes_the_encoded_transitions() {
    let table = WaveformTable::from_bytes(&sample_file(&[0, 10, 20, 30])).unwrap();

    let du = table.lookup(1, 21).unwrap();
    for matrix in du {
        assert_eq!(matrix[16][0], Phase::Black);
        assert_eq!(matrix[16][30], Phase::Noop);
        assert_eq!(matrix[0][0], Phase::Black);
    }
}

#[test]
fn out_of_range_temperatures_are_rejected() {
    let table = WaveformTable::from_bytes(&sample_file(&[0, 10, 20, 30])).unwrap();

    assert!(matches!(
        table.lookup(0, 50),
        Err(WaveformError::TemperatureTooHigh { value: 50, .. })
    ));
    assert!(matches!(
        table.lookup(0, 30),
        Err(WaveformError::TemperatureTooHigh { .. })
    ));
    assert!(matches!(
        table.lookup(0, -5),
        Err(WaveformError::TemperatureTooLow { .. })
    ));
    assert!(table.lookup(0, 29).is_ok());
}

#[test]
fn modes_are_classified_from_their_no_op_sets() {
    let table = WaveformTable::from_bytes(&sample_file(&[0, 10, 20, 30])).unwrap();

    assert_eq!(table.mode_kind(0).unwrap(), ModeKind::Init);
    assert_eq!(table.mode_kind(1).unwrap(), ModeKind::Du);
    assert_eq!(table.mode_id(ModeKind::Init).unwrap(), 0);
    assert_eq!(table.mode_id(ModeKind::Du).unwrap(), 1);
    assert!(table.mode_id(ModeKind::A2).is_err());
}

#[test]
fn a2_style_blocks_classify_as_a2() {
    let a2 = encode_block(4, |_, from, to| match (from, to) {
        (0, 30) => WHITE,
        (30, 0) => BLACK,
        _ => NOOP,
    });
    let table = WaveformTable::from_bytes(&build_wbf(&[0, 50], &[a2])).unwrap();

    assert_eq!(table.mode_kind(0).unwrap(), ModeKind::A2);
    assert_eq!(table.lookup(0, 21).unwrap().len(), 4);
}

#[test]
fn corrupted_crc_is_fatal() {
    let mut file = sample_file(&[0, 10, 20, 30]);
    let last = file.len() - 1;
    file[last] ^= 0xFF;

    assert!(matches!(
        WaveformTable::from_bytes(&file),
        Err(WaveformError::Parse(WbfError::FileChecksum { .. }))
    ));
}

#[test]
fn unexpected_sentinel_is_fatal() {
    let mut file = sample_file(&[0, 10, 20, 30]);
    file[12] = 18; // run_type
    file[31] = basic_checksum(&file[8..31]);
    let mut crc_input = file.clone();
    crc_input[..4].fill(0);
    let crc = crc32(&crc_input);
    file[..4].copy_from_slice(&crc.to_le_bytes());

    assert!(matches!(
        WaveformTable::from_bytes(&file),
        Err(WaveformError::Parse(WbfError::UnexpectedField {
            field: "run type",
            ..
        }))
    ));
}

#[test]
fn truncated_files_are_rejected() {
    assert!(matches!(
        WaveformTable::from_bytes(&[0u8; 16]),
        Err(WaveformError::Parse(WbfError::TooShort { .. }))
    ));

    let file = sample_file(&[0, 10, 20, 30]);
    assert!(matches!(
        WaveformTable::from_bytes(&file[..file.len() - 10]),
        Err(WaveformError::Parse(WbfError::FileSize { .. }))
    ));
}

#[test]
fn corrupted_temperature_checksum_is_fatal() {
    let mut file = sample_file(&[0, 10, 20, 30]);

    // The temperature table follows the 48-byte header; flip its
    // checksum byte and refresh the file-level CRC so the failure is
    // attributed to the right section
    file[48 + 4] ^= 0x55;
    let mut crc_input = file.clone();
    crc_input[..4].fill(0);
    let crc = crc32(&crc_input);
    file[..4].copy_from_slice(&crc.to_le_bytes());

    assert!(matches!(
        WaveformTable::from_bytes(&file),
        Err(WaveformError::Parse(WbfError::TemperatureChecksum { .. }))
    ));
}
