//! Waveform table lookup and mode-kind classification.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use super::wbf::{self, WbfError};
use super::{ModeKind, ModeId, Phase, Temperature, Waveform, INTENSITY_VALUES};

/// Temperature used to sample each mode when classifying its kind.
///
/// The no-op pattern of a mode could in principle differ at extreme
/// temperatures; classification always samples at this temperature
/// unless overridden through [`WaveformTable::from_wbf_at`].
pub const DEFAULT_CLASSIFY_TEMPERATURE: Temperature = 21;

/// Errors raised by waveform loading and lookup.
#[derive(Error, Debug)]
pub enum WaveformError {
    #[error(transparent)]
    Parse(#[from] WbfError),

    #[error("mode {mode} not supported, available modes are 0-{max}")]
    UnknownMode { mode: ModeId, max: ModeId },

    #[error("mode kind {0} is not supported by this waveform table")]
    UnknownKind(ModeKind),

    #[error("temperature {value} °C too low, minimum operating temperature is {min} °C")]
    TemperatureTooLow { value: i32, min: Temperature },

    #[error("temperature {value} °C too high, maximum operating temperature is {max} °C")]
    TemperatureTooHigh { value: i32, max: Temperature },
}

/// Indexed waveform storage for one panel.
///
/// Immutable after load. Waveforms are shared: several (mode,
/// temperature) combinations may reuse the same underlying sequence.
pub struct WaveformTable {
    /// Panel refresh rate advertised by the waveform file, in Hz.
    frame_rate: u8,

    /// Number of available modes.
    mode_count: ModeId,

    /// Mapping of mode ids to kinds, and the first id found per kind.
    mode_kind_by_id: Vec<ModeKind>,
    mode_id_by_kind: HashMap<ModeKind, ModeId>,

    /// Temperature thresholds. Range `i` covers `[t_i, t_{i+1})`; the
    /// last value is the maximal operating temperature.
    temperatures: Vec<Temperature>,

    /// Deduplicated waveform storage plus the per-mode, per-range
    /// indices into it.
    waveforms: Vec<Waveform>,
    waveform_lookup: Vec<Vec<usize>>,
}

impl WaveformTable {
    /// Load a waveform table from a WBF file, classifying mode kinds at
    /// the default sample temperature.
    pub fn from_wbf(path: impl AsRef<Path>) -> Result<Self, WaveformError> {
        Self::from_wbf_at(path, DEFAULT_CLASSIFY_TEMPERATURE)
    }

    /// Load a waveform table from a WBF file, classifying mode kinds at
    /// the given sample temperature.
    pub fn from_wbf_at(
        path: impl AsRef<Path>,
        classify_temperature: Temperature,
    ) -> Result<Self, WaveformError> {
        let buffer = std::fs::read(path).map_err(WbfError::from)?;
        Self::from_bytes_at(&buffer, classify_temperature)
    }

    /// Parse a waveform table from in-memory WBF contents.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self, WaveformError> {
        Self::from_bytes_at(buffer, DEFAULT_CLASSIFY_TEMPERATURE)
    }

    /// Parse a waveform table from in-memory WBF contents, classifying
    /// mode kinds at the given sample temperature.
    pub fn from_bytes_at(
        buffer: &[u8],
        classify_temperature: Temperature,
    ) -> Result<Self, WaveformError> {
        let contents = wbf::parse(buffer)?;

        let mut table = Self {
            frame_rate: contents.frame_rate,
            mode_count: contents.mode_count,
            mode_kind_by_id: Vec::new(),
            mode_id_by_kind: HashMap::new(),
            temperatures: contents.temperatures,
            waveforms: contents.waveforms,
            waveform_lookup: contents.lookup,
        };

        table.populate_mode_kinds(classify_temperature);
        Ok(table)
    }

    /// Lookup the waveform for the given mode and temperature.
    ///
    /// The temperature selects the half-open range `[t_i, t_{i+1})`
    /// containing the reading; values outside the table's operating
    /// range are an error.
    pub fn lookup(&self, mode: ModeId, temperature: i32) -> Result<&Waveform, WaveformError> {
        if mode >= self.mode_count {
            return Err(WaveformError::UnknownMode {
                mode,
                max: self.mode_count - 1,
            });
        }

        // First threshold strictly greater than the reading
        let upper = self
            .temperatures
            .partition_point(|&t| i32::from(t) <= temperature);

        if upper == 0 {
            return Err(WaveformError::TemperatureTooLow {
                value: temperature,
                min: self.temperatures.first().copied().unwrap_or(Temperature::MAX),
            });
        }

        if upper == self.temperatures.len() {
            return Err(WaveformError::TemperatureTooHigh {
                value: temperature,
                max: self.temperatures.last().map(|&t| t - 1).unwrap_or(0),
            });
        }

        let range = upper - 1;
        Ok(&self.waveforms[self.waveform_lookup[mode as usize][range]])
    }

    /// Get the display frame rate advertised by the waveform file.
    pub fn frame_rate(&self) -> u8 {
        self.frame_rate
    }

    /// Get the available operating temperature thresholds.
    pub fn temperatures(&self) -> &[Temperature] {
        &self.temperatures
    }

    /// Get the number of available modes.
    pub fn mode_count(&self) -> ModeId {
        self.mode_count
    }

    /// Get the kind classified for a mode id.
    pub fn mode_kind(&self, mode: ModeId) -> Result<ModeKind, WaveformError> {
        self.mode_kind_by_id
            .get(mode as usize)
            .copied()
            .ok_or(WaveformError::UnknownMode {
                mode,
                max: self.mode_count - 1,
            })
    }

    /// Find the first mode id classified as the given kind.
    pub fn mode_id(&self, kind: ModeKind) -> Result<ModeId, WaveformError> {
        self.mode_id_by_kind
            .get(&kind)
            .copied()
            .ok_or(WaveformError::UnknownKind(kind))
    }

    /// Scan available modes and assign them kinds based on which
    /// transitions they support.
    fn populate_mode_kinds(&mut self, sample_temperature: Temperature) {
        self.mode_kind_by_id = Vec::with_capacity(self.mode_count as usize);
        self.mode_id_by_kind.clear();

        for mode in 0..self.mode_count {
            let kind = match self.lookup(mode, sample_temperature.into()) {
                Ok(waveform) => classify_mode_kind(waveform),
                Err(err) => {
                    tracing::warn!(mode, %err, "cannot sample mode for classification");
                    ModeKind::Unknown
                }
            };

            if kind == ModeKind::Unknown {
                // Unclassified modes stay accessible by id
                tracing::warn!(mode, "could not detect mode kind");
            } else {
                self.mode_id_by_kind.entry(kind).or_insert(mode);
            }

            self.mode_kind_by_id.push(kind);
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        frame_rate: u8,
        temperatures: Vec<Temperature>,
        waveforms: Vec<Waveform>,
        waveform_lookup: Vec<Vec<usize>>,
        classify_temperature: Temperature,
    ) -> Self {
        let mut table = Self {
            frame_rate,
            mode_count: waveform_lookup.len() as ModeId,
            mode_kind_by_id: Vec::new(),
            mode_id_by_kind: HashMap::new(),
            temperatures,
            waveforms,
            waveform_lookup,
        };
        table.populate_mode_kinds(classify_temperature);
        table
    }
}

/// Use heuristics to classify a mode into a kind from one of its
/// waveforms.
pub(crate) fn classify_mode_kind(waveform: &Waveform) -> ModeKind {
    // INIT waveforms drive every transition identically, regardless of
    // the source or target intensity
    let reference = waveform
        .first()
        .map(|matrix| matrix[0][0])
        .unwrap_or(Phase::Noop);

    let is_init = waveform
        .iter()
        .all(|matrix| matrix.iter().all(|row| row.iter().all(|&p| p == reference)));

    if is_init {
        return ModeKind::Init;
    }

    // Detect which intensity transitions are no-ops across every step
    let mut no_ops = [[true; INTENSITY_VALUES]; INTENSITY_VALUES];

    for (from, row) in no_ops.iter_mut().enumerate() {
        for (to, no_op) in row.iter_mut().enumerate() {
            *no_op = waveform
                .iter()
                .all(|matrix| matrix[from][to] == Phase::Noop);
        }
    }

    // "Regal" waveforms support special transitions into odd targets
    let regalable = [28, 29, 30]
        .iter()
        .all(|&from| [29, 31].iter().all(|&to| !no_ops[from][to as usize]));

    // Quantify the supported source and target intensities
    let mut sources = 0u32;
    let mut targets = 0u32;

    for row in &no_ops {
        let row_targets = row.iter().filter(|&&no_op| !no_op).count() as u32;

        if row_targets > 0 {
            sources += 1;
            targets += row_targets;
        }
    }

    if sources == 0 {
        return ModeKind::Unknown;
    }

    let avg_targets = f64::from(targets) / f64::from(sources);

    if sources >= 16 {
        if avg_targets < 2.0 {
            return ModeKind::Du;
        }

        if avg_targets < 4.0 {
            return ModeKind::Du4;
        }

        if avg_targets >= 16.0 {
            return if regalable {
                ModeKind::Glr16
            } else {
                ModeKind::Gc16
            };
        }
    }

    if sources <= 8 && avg_targets <= 1.0 {
        return ModeKind::A2;
    }

    ModeKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::PhaseMatrix;

    fn matrix_with<F: Fn(usize, usize) -> Phase>(f: F) -> PhaseMatrix {
        let mut matrix = [[Phase::Noop; INTENSITY_VALUES]; INTENSITY_VALUES];
        for (from, row) in matrix.iter_mut().enumerate() {
            for (to, cell) in row.iter_mut().enumerate() {
                *cell = f(from, to);
            }
        }
        matrix
    }

    #[test]
    fn classify_init() {
        let waveform = vec![matrix_with(|_, _| Phase::Black); 3];
        assert_eq!(classify_mode_kind(&waveform), ModeKind::Init);
    }

    #[test]
    fn classify_a2() {
        // Only black<->white transitions defined: 2 sources, 1 target each
        let waveform = vec![matrix_with(|from, to| match (from, to) {
            (0, 30) => Phase::White,
            (30, 0) => Phase::Black,
            _ => Phase::Noop,
        })];
        assert_eq!(classify_mode_kind(&waveform), ModeKind::A2);
    }

    #[test]
    fn classify_du() {
        // Every source drives toward black only
        let waveform = vec![matrix_with(|_, to| {
            if to == 0 {
                Phase::Black
            } else {
                Phase::Noop
            }
        })];
        assert_eq!(classify_mode_kind(&waveform), ModeKind::Du);
    }

    #[test]
    fn classify_du4() {
        // Three gray targets per source
        let waveform = vec![matrix_with(|_, to| match to {
            0 | 14 | 30 => Phase::Black,
            _ => Phase::Noop,
        })];
        assert_eq!(classify_mode_kind(&waveform), ModeKind::Du4);
    }

    #[test]
    fn classify_gc16_and_glr16() {
        // All even targets defined, odd targets no-op: not regalable
        let gc16 = vec![matrix_with(|_, to| {
            if to % 2 == 0 {
                Phase::Black
            } else {
                Phase::Noop
            }
        })];
        assert_eq!(classify_mode_kind(&gc16), ModeKind::Gc16);

        // Same plus the regal transitions into odd targets 29 and 31
        let glr16 = vec![matrix_with(|from, to| {
            if to % 2 == 0 || ((28..=30).contains(&from) && (to == 29 || to == 31)) {
                Phase::Black
            } else {
                Phase::Noop
            }
        })];
        assert_eq!(classify_mode_kind(&glr16), ModeKind::Glr16);
    }

    fn black_waveform(steps: usize) -> Waveform {
        vec![matrix_with(|_, _| Phase::Black); steps]
    }

    fn two_mode_table() -> WaveformTable {
        WaveformTable::from_parts(
            85,
            vec![0, 10, 20, 30],
            vec![black_waveform(2), black_waveform(5)],
            vec![vec![0, 0, 1], vec![1, 1, 1]],
            21,
        )
    }

    #[test]
    fn lookup_selects_half_open_ranges() {
        let table = two_mode_table();

        assert_eq!(table.lookup(0, 0).unwrap().len(), 2);
        assert_eq!(table.lookup(0, 9).unwrap().len(), 2);
        assert_eq!(table.lookup(0, 19).unwrap().len(), 2);
        assert_eq!(table.lookup(0, 20).unwrap().len(), 5);
        assert_eq!(table.lookup(0, 29).unwrap().len(), 5);
    }

    #[test]
    fn lookup_rejects_out_of_range_temperatures() {
        let table = two_mode_table();

        assert!(matches!(
            table.lookup(0, 50),
            Err(WaveformError::TemperatureTooHigh { value: 50, max: 29 })
        ));
        assert!(matches!(
            table.lookup(0, 30),
            Err(WaveformError::TemperatureTooHigh { .. })
        ));
        assert!(matches!(
            table.lookup(0, -1),
            Err(WaveformError::TemperatureTooLow { value: -1, min: 0 })
        ));
    }

    #[test]
    fn lookup_rejects_unknown_modes() {
        let table = two_mode_table();
        assert!(matches!(
            table.lookup(2, 21),
            Err(WaveformError::UnknownMode { mode: 2, max: 1 })
        ));
    }

    #[test]
    fn mode_kind_mappings_pick_first_id() {
        // Both modes classify as INIT; the kind maps to the first id
        let table = two_mode_table();
        assert_eq!(table.mode_kind(0).unwrap(), ModeKind::Init);
        assert_eq!(table.mode_kind(1).unwrap(), ModeKind::Init);
        assert_eq!(table.mode_id(ModeKind::Init).unwrap(), 0);
        assert!(matches!(
            table.mode_id(ModeKind::A2),
            Err(WaveformError::UnknownKind(ModeKind::A2))
        ));
    }
}
