//! Waveform data model for electrophoretic displays.
//!
//! An EPD cell is driven by a sequence of per-frame commands (phases).
//! The mapping from a (source intensity, target intensity) pair to the
//! phase to apply on each frame is stored in vendor waveform tables,
//! indexed by update mode and panel temperature.

pub mod table;
pub mod wbf;

pub use table::{WaveformError, WaveformTable};
pub use wbf::WbfError;

use std::fmt;
use std::str::FromStr;

/// Cell grayscale intensity (5 bits).
///
/// Only even values are used. 0 denotes full black, 30 full white.
pub type Intensity = u8;

/// Number of representable intensity levels.
pub const INTENSITY_VALUES: usize = 1 << 5;

/// Mask applied to client-supplied intensities.
pub const INTENSITY_MASK: u8 = (INTENSITY_VALUES - 1) as u8;

/// Waveform mode identifier, an index into the waveform file.
pub type ModeId = u8;

/// Temperature in Celsius.
///
/// The panel temperature selects which waveform variant to use for a
/// given mode.
pub type Temperature = i8;

/// Command sent to an individual EPD cell in one frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Leave the cell in its present state.
    #[default]
    Noop = 0b00,

    /// Apply a current to bring black particles to the top.
    Black = 0b01,

    /// Apply a current to bring white particles to the top.
    White = 0b10,
}

impl Phase {
    /// Decode a phase from the two low-order bits of a byte.
    pub fn from_bits(bits: u8) -> Phase {
        match bits & 0b11 {
            0b01 => Phase::Black,
            0b10 => Phase::White,
            _ => Phase::Noop,
        }
    }
}

/// Lookup table giving the phase to apply to transition between two
/// intensities, indexed `[from][to]`.
pub type PhaseMatrix = [[Phase; INTENSITY_VALUES]; INTENSITY_VALUES];

/// An ordered sequence of phase matrices.
///
/// Its length equals the number of frames needed to complete a
/// transition at the temperature the waveform was selected for.
pub type Waveform = Vec<PhaseMatrix>;

/// Semantic waveform families.
///
/// Users choose between several kinds of waveforms trading off image
/// fidelity against rendering speed. Kinds are inferred heuristically
/// from the shape of each mode's no-op set; several mode ids may map to
/// the same kind.
///
/// See <https://www.waveshare.com/w/upload/c/c4/E-paper-mode-declaration.pdf>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    Unknown,

    /// Initialization mode used to force all pixels back to a known
    /// white state.
    Init,

    /// Fast, non-flashy update that only supports transitions to black
    /// or white.
    Du,

    /// Same as DU but supports 4 gray tones.
    Du4,

    /// Faster than DU, only supports transitions *between* black and
    /// white.
    A2,

    /// Full resolution mode (16 gray tones).
    Gc16,

    /// Full resolution mode with support for Regal.
    Glr16,
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModeKind::Init => "INIT",
            ModeKind::Du => "DU",
            ModeKind::Du4 => "DU4",
            ModeKind::A2 => "A2",
            ModeKind::Gc16 => "GC16",
            ModeKind::Glr16 => "GLR16",
            ModeKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

impl FromStr for ModeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INIT" => Ok(ModeKind::Init),
            "DU" => Ok(ModeKind::Du),
            "DU4" => Ok(ModeKind::Du4),
            "A2" => Ok(ModeKind::A2),
            "GC16" => Ok(ModeKind::Gc16),
            "GLR16" => Ok(ModeKind::Glr16),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_bit_decoding() {
        assert_eq!(Phase::from_bits(0b00), Phase::Noop);
        assert_eq!(Phase::from_bits(0b01), Phase::Black);
        assert_eq!(Phase::from_bits(0b10), Phase::White);
        // Reserved encoding falls back to no-op
        assert_eq!(Phase::from_bits(0b11), Phase::Noop);
        // Only the two low-order bits matter
        assert_eq!(Phase::from_bits(0b110), Phase::White);
    }

    #[test]
    fn mode_kind_round_trips_through_names() {
        for kind in [
            ModeKind::Init,
            ModeKind::Du,
            ModeKind::Du4,
            ModeKind::A2,
            ModeKind::Gc16,
            ModeKind::Glr16,
        ] {
            assert_eq!(kind.to_string().parse::<ModeKind>(), Ok(kind));
        }
        assert!("NOPE".parse::<ModeKind>().is_err());
    }
}
