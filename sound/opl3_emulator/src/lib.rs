//! # OPL3 Emulator
//!
//! A Rust implementation of the Yamaha YMF262 (OPL3) FM synthesis chip with
//! YM3812 (OPL2) compatibility, in the DOSBox DBOPL lineage.
//!
//! The emulated part exposes 36 two-operator channels arranged as two OPL3
//! cores. The first core (register banks 0 and 1) is a complete OPL3 with
//! 4-operator voices and rhythm/percussion mode. The second core (banks 2 and
//! 3) adds another 18 plain 2-operator channels, so a driver can address
//! `channel / 9` as the bank and `channel % 9` as the register offset for all
//! 36 voices.
//!
//! ## Features
//!
//! - Register level OPL2/OPL3 compatibility including 4-op and rhythm modes
//! - Integer-only sample path, identical output across platforms
//! - Interleaved stereo output in both modes (OPL2 mode is mono, duplicated)
//! - Shadow registers: a write only recomputes state when the value changed
//! - Three compile-time wave generation methods, see below
//!
//! ## Architecture
//!
//! - **Chip**: register decoder, LFO and noise generators, block generation
//! - **Channel**: two operators, feedback and the active [`SynthMode`]
//! - **Operator**: envelope generator, phase accumulator and waveform lookup
//!
//! Channels live in one contiguous array. Operators belonging to a 4-op voice
//! or to the percussion set are addressed as `(channel index, slot)` pairs
//! instead of pointer arithmetic across channels.
//!
//! ## Usage
//!
//! ```rust
//! use opl3_emulator::Chip;
//!
//! let mut chip = Chip::new(44100);
//! chip.write_reg(0x105, 0x01); // OPL3 mode
//! chip.write_reg(0x20, 0x01); // modulator multiplier
//! chip.write_reg(0x23, 0x01); // carrier multiplier
//! chip.write_reg(0x40, 0x10); // modulator level
//! chip.write_reg(0x43, 0x00); // carrier level
//! chip.write_reg(0x60, 0xF0); // attack/decay
//! chip.write_reg(0x63, 0xF0);
//! chip.write_reg(0x80, 0x77); // sustain/release
//! chip.write_reg(0x83, 0x77);
//! chip.write_reg(0xC0, 0x30); // both speakers, FM
//! chip.write_reg(0xA0, 0x41); // fnum low
//! chip.write_reg(0xB0, 0x32); // key on, block 4
//!
//! // Interleaved stereo, accumulated into the buffer
//! let mut output = vec![0i32; 1024 * 2];
//! chip.generate(1024, &mut output);
//! ```
//!
//! ## Wave generation methods
//!
//! Selected with cargo features, exactly one is compiled:
//!
//! - default: linear wavetable multiplied by an exponential volume table
//! - `wave_tablelog`: logarithmic wavetable added to the attenuation, then
//!   converted through an exponential table
//! - `wave_handler`: one handler per waveform over a log-sine table
//!
//! ## Register Reference
//!
//! Bits 8-9 of the address select the bank (`0x000`, `0x100`, `0x200`,
//! `0x300`).
//!
//! - `0x01`: waveform select enable (OPL2)
//! - `0x08`: note select (keyboard split)
//! - `0x20-0x35`: AM/VIB/EG/KSR/MULT
//! - `0x40-0x55`: KSL/TL
//! - `0x60-0x75`: AR/DR
//! - `0x80-0x95`: SL/RR
//! - `0xA0-0xA8`: F-number low byte
//! - `0xB0-0xB8`: key on, block, F-number high bits
//! - `0xBD`: tremolo/vibrato depth, rhythm mode and drum key-ons
//! - `0xC0-0xC8`: output routing, feedback and connection
//! - `0xE0-0xF5`: waveform select
//! - `0x104`: 4-operator enable mask
//! - `0x105`: OPL3 mode enable

#[cfg(not(feature = "wave_handler"))]
use std::f64::consts::PI;
use std::sync::OnceLock;

pub mod channel;
pub mod chip;
pub mod operator;

pub use chip::Chip;

/// The base OPL clock rate in Hz (approximately 49.716 kHz)
pub const OPL_RATE: f64 = 14318180.0 / 288.0;

/// Total addressable 2-operator channels
pub const NUM_CHANNELS: usize = 36;
/// Channels per OPL3 core (two register banks)
pub const CORE_CHANNELS: usize = 18;
/// Channels per core generated while OPL3 mode is off
const OPL2_CHANNELS: usize = 9;

/// Size of the tremolo lookup table
const TREMOLO_TABLE: usize = 52;

/// Number of bits used for the waveform phase
const WAVE_BITS: u32 = 10;
/// Wave calculation shift amount
const WAVE_SH: u32 = 32 - WAVE_BITS;
/// Wave mask for modulo operations
const WAVE_MASK: u32 = (1 << WAVE_SH) - 1;

/// LFO (Low Frequency Oscillator) shift amount
const LFO_SH: u32 = WAVE_SH - 10;
/// Maximum LFO counter value
const LFO_MAX: u32 = 256 << LFO_SH;

/// Number of bits for envelope calculations
const ENV_BITS: u32 = 9;
/// Minimum envelope value (loudest)
const ENV_MIN: i32 = 0;
/// Extra envelope precision bits
const ENV_EXTRA: u32 = ENV_BITS - 9;
/// Maximum envelope value (silent)
const ENV_MAX: i32 = 511 << ENV_EXTRA;
/// Envelope silence threshold
const ENV_LIMIT: i32 = (12 * 256) >> (3 - ENV_EXTRA);

/// Rate counter shift amount
const RATE_SH: u32 = 24;
/// Rate counter mask
const RATE_MASK: u32 = (1 << RATE_SH) - 1;
/// Multiplication table shift amount
#[cfg(not(any(feature = "wave_handler", feature = "wave_tablelog")))]
const MUL_SH: u32 = 16;

/// Current phase of an operator's envelope generator.
///
/// The discriminant doubles as the bit index into the operator's
/// `rate_zero` mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatorState {
    /// Silent, the envelope is at maximum attenuation
    Off = 0,
    /// Attenuation rising towards silence after key off
    Release = 1,
    /// Holding at the sustain level, or decaying further if sustain is off
    Sustain = 2,
    /// Attenuation rising towards the sustain level
    Decay = 3,
    /// Attenuation falling exponentially towards full volume
    Attack = 4,
}

/// How a channel combines its operators.
///
/// Variants after `Sm4Start` span two channels, variants after `Sm6Start`
/// span three. The ordering is used for those range checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SynthMode {
    /// Additive, mono output
    Sm2AM,
    /// Modulator into carrier, mono output
    Sm2FM,
    /// Additive, stereo masked output
    Sm3AM,
    /// Modulator into carrier, stereo masked output
    Sm3FM,
    /// Marker, never assigned
    Sm4Start,
    /// 4-op: op0 -> op1 -> op2 -> op3
    Sm3FMFM,
    /// 4-op: op0 + (op1 -> op2 -> op3)
    Sm3AMFM,
    /// 4-op: (op0 -> op1) + (op2 -> op3)
    Sm3FMAM,
    /// 4-op: op0 + (op1 -> op2) + op3
    Sm3AMAM,
    /// Marker, never assigned
    Sm6Start,
    /// Rhythm section on channels 6-8, mono output
    Sm2Percussion,
    /// Rhythm section on channels 6-8, stereo output
    Sm3Percussion,
}

/// Bit shift amount for KSL base value in channel data
const SHIFT_KSLBASE: u32 = 16;
/// Bit shift amount for key code in channel data
const SHIFT_KEYCODE: u32 = 24;

/// Register mask for Key Scale Rate (KSR) bit
const MASK_KSR: u8 = 0x10;
/// Register mask for sustain bit
const MASK_SUSTAIN: u8 = 0x20;
/// Register mask for vibrato bit
const MASK_VIBRATO: u8 = 0x40;

/// Checks if an envelope value represents silence
pub fn env_silent(x: i32) -> bool {
    x >= ENV_LIMIT
}

static KSL_CREATE_TABLE: [u8; 16] = [64, 32, 24, 19, 16, 12, 11, 10, 8, 6, 5, 4, 3, 2, 1, 0];

/// Frequency multipliers, doubled so the 0.5 multiplier stays integral
static FREQ_CREATE_TABLE: [u8; 16] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30];

/// Samples an attack takes on the real chip, used to fit the attack rates
static ATTACK_SAMPLES_TABLE: [u8; 13] = [69, 55, 46, 40, 35, 29, 23, 20, 19, 15, 11, 10, 9];

static ENVELOPE_INCREASE_TABLE: [u8; 13] = [4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 32];

/// Vibrato steps: low 3 bits are the shift, bit 7 the sign
static VIBRATO_TABLE: [i8; 8] = [1, 0, 1, 30, -127, -128, -127, -98];

static KSL_SHIFT_TABLE: [u8; 4] = [31, 1, 2, 0];

//	|    |//\\|____|WAV7|//__|/\  |____|/\/\|
//	|\\//|    |    |WAV7|    |  \/|    |    |
//	|06  |0126|17  |7   |3   |4   |4 5 |5   |
//
// 6 is just 0 shifted and masked
static WAVE_BASE_TABLE: [u16; 8] = [0x000, 0x200, 0x200, 0x800, 0xa00, 0xc00, 0x100, 0x400];
static WAVE_MASK_TABLE: [u16; 8] = [1023, 1023, 511, 511, 1023, 1023, 512, 1023];
static WAVE_START_TABLE: [u16; 8] = [512, 0, 0, 0, 0, 512, 512, 256];

/// Sample rate independent lookup tables, built once per process
pub(crate) struct Tables {
    #[cfg(not(feature = "wave_handler"))]
    pub(crate) wave_table: [i16; 8 * 512],
    #[cfg(not(any(feature = "wave_handler", feature = "wave_tablelog")))]
    pub(crate) mul_table: [u16; 384],
    #[cfg(any(feature = "wave_handler", feature = "wave_tablelog"))]
    pub(crate) exp_table: [u16; 256],
    #[cfg(feature = "wave_handler")]
    pub(crate) sin_table: [u16; 512],
    pub(crate) ksl_table: [u8; 8 * 16],
    pub(crate) tremolo_table: [u8; TREMOLO_TABLE],
    /// Channel register index to channel within a core
    pub(crate) chan_offset_table: [Option<u8>; 32],
    /// Operator register index to `(channel, operator)` within a core
    pub(crate) op_offset_table: [Option<(u8, u8)>; 64],
}

static TABLES: OnceLock<Tables> = OnceLock::new();

/// Shared lookup tables, created on first use
pub(crate) fn tables() -> &'static Tables {
    TABLES.get_or_init(Tables::new)
}

impl Tables {
    fn new() -> Self {
        #[cfg(any(feature = "wave_handler", feature = "wave_tablelog"))]
        let exp_table = {
            let mut table = [0u16; 256];
            for (i, e) in table.iter_mut().enumerate() {
                // Stored in reverse, preshifted once so the volume can shift right
                let v = (0.5 + (2.0_f64.powf((255 - i) as f64 / 256.0) - 1.0) * 1024.0) as u16;
                *e = (v + 1024) * 2;
            }
            table
        };

        #[cfg(feature = "wave_handler")]
        let sin_table = {
            let mut table = [0u16; 512];
            for (i, s) in table.iter_mut().enumerate() {
                *s = (0.5 - (((i as f64 + 0.5) * (std::f64::consts::PI / 512.0)).sin().log2() * 256.0))
                    as u16;
            }
            table
        };

        #[cfg(not(any(feature = "wave_handler", feature = "wave_tablelog")))]
        let mul_table = {
            let mut table = [0u16; 384];
            for (i, m) in table.iter_mut().enumerate() {
                let s = (i * 8) as f64;
                let val = 0.5 + 2.0_f64.powf(-1.0 + (255.0 - s) / 256.0) * (1 << MUL_SH) as f64;
                *m = val as u16;
            }
            table
        };

        #[cfg(not(feature = "wave_handler"))]
        let wave_table = {
            let mut table = [0i16; 8 * 512];
            #[cfg(not(feature = "wave_tablelog"))]
            {
                for i in 0..512 {
                    table[0x0200 + i] = (((i as f64 + 0.5) * (PI / 512.0)).sin() * 4084.0) as i16;
                    table[i] = -table[0x0200 + i];
                }
                for i in 0..256 {
                    table[0x0700 + i] = (0.5
                        + 2.0_f64.powf(-1.0 + (255.0 - i as f64 * 8.0) / 256.0) * 4085.0)
                        as i16;
                    table[0x06ff - i] = -table[0x0700 + i];
                }
            }
            #[cfg(feature = "wave_tablelog")]
            {
                const NEG: i16 = 0x8000_u16 as i16;
                for i in 0..512 {
                    table[0x0200 + i] =
                        (0.5 - ((i as f64 + 0.5) * (PI / 512.0)).sin().log2() * 256.0) as i16;
                    table[i] = NEG | table[0x0200 + i];
                }
                for i in 0..256 {
                    table[0x0700 + i] = (i * 8) as i16;
                    table[0x06ff - i] = NEG | (i * 8) as i16;
                }
            }
            for i in 0..256 {
                // silence gaps
                table[0x400 + i] = table[0];
                table[0x500 + i] = table[0];
                table[0x900 + i] = table[0];
                table[0xc00 + i] = table[0];
                table[0xd00 + i] = table[0];
                table[0x800 + i] = table[0x200 + i];
                // double speed sines
                table[0xa00 + i] = table[0x200 + i * 2];
                table[0xb00 + i] = table[i * 2];
                table[0xe00 + i] = table[0x200 + i * 2];
                table[0xf00 + i] = table[0x200 + i * 2];
            }
            table
        };

        let mut ksl_table = [0u8; 8 * 16];
        for oct in 0..8 {
            let base = oct as i32 * 8;
            for (i, create) in KSL_CREATE_TABLE.iter().enumerate() {
                let val = (base - *create as i32).max(0);
                // *4 to match the attenuation range
                ksl_table[oct * 16 + i] = (val * 4) as u8;
            }
        }

        let mut tremolo_table = [0u8; TREMOLO_TABLE];
        for i in 0..TREMOLO_TABLE / 2 {
            let val = (i << ENV_EXTRA) as u8;
            tremolo_table[i] = val;
            tremolo_table[TREMOLO_TABLE - 1 - i] = val;
        }

        let mut chan_offset_table = [None; 32];
        for (i, slot) in chan_offset_table.iter_mut().enumerate() {
            let mut index = i & 0xf;
            if index >= 9 {
                continue;
            }
            // 4-op pairs have to sit next to each other
            if index < 6 {
                index = (index % 3) * 2 + (index / 3);
            }
            if i >= 16 {
                index += 9;
            }
            *slot = Some(index as u8);
        }

        let op_offset_table = std::array::from_fn(|i| {
            if i % 8 >= 6 || (i / 8) % 4 == 3 {
                return None;
            }
            let mut ch_num = (i / 8) * 3 + (i % 8) % 3;
            if ch_num >= 12 {
                ch_num += 16 - 12;
            }
            let op_num = ((i % 8) / 3) as u8;
            chan_offset_table[ch_num].map(|chan| (chan, op_num))
        });

        Self {
            #[cfg(not(feature = "wave_handler"))]
            wave_table,
            #[cfg(not(any(feature = "wave_handler", feature = "wave_tablelog")))]
            mul_table,
            #[cfg(any(feature = "wave_handler", feature = "wave_tablelog"))]
            exp_table,
            #[cfg(feature = "wave_handler")]
            sin_table,
            ksl_table,
            tremolo_table,
            chan_offset_table,
            op_offset_table,
        }
    }
}

/// Rate dependent tables, one set per chip
#[derive(Debug, Clone)]
pub(crate) struct RateTables {
    /// Frequency scales for the different multiplications
    pub(crate) freq_mul: [u32; 16],
    /// Rates for decay and release at this sample rate
    pub(crate) linear_rates: [u32; 76],
    /// Best match attack rates at this sample rate
    pub(crate) attack_rates: [u32; 76],
}

/// Current output of the LFO, copied into every block
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LfoState {
    pub(crate) vibrato_sign: i8,
    pub(crate) vibrato_shift: u8,
    pub(crate) tremolo_value: u8,
}

/// Global chip flags a channel write depends on
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ChipFlags {
    pub(crate) reg104: u8,
    pub(crate) reg08: u8,
    pub(crate) reg_bd: u8,
    pub(crate) wave_form_mask: u8,
    /// `0xff` when OPL3 mode is enabled, else `0`
    pub(crate) opl3_active: u8,
}

/// A single FM operator: envelope generator, phase accumulator and waveform
/// selection.
#[derive(Debug, Clone)]
pub struct Operator {
    /// Offset of the selected waveform in the wave table
    wave_base: usize,
    /// Mask for waveform table indexing
    wave_mask: u32,
    /// Phase the waveform starts at on key on
    wave_start: u32,
    /// Phase accumulator
    wave_index: u32,
    /// Phase increment per sample
    wave_add: u32,
    /// Phase increment including vibrato for the current block
    wave_current: u32,
    /// Selected waveform, 0-7
    wave_form: u8,
    /// Channel frequency, key code and KSL base, see `SHIFT_*`
    chan_data: u32,
    freq_mul: u32,
    /// Vibrato depth scaled to the current frequency
    vibrato: u32,
    sustain_level: i32,
    /// Total level plus key scaling attenuation
    total_level: i32,
    /// Total level plus tremolo for the current block
    current_level: i32,
    /// Envelope attenuation
    volume: i32,
    attack_add: u32,
    decay_add: u32,
    release_add: u32,
    rate_index: u32,
    /// Bit per [`OperatorState`], set when that state cannot change the volume
    rate_zero: u8,
    /// Bit 0 set by the channel key on, bit 1 by the rhythm section
    key_on: u8,
    reg20: u8,
    reg40: u8,
    reg60: u8,
    reg80: u8,
    reg_e0: u8,
    state: OperatorState,
    tremolo_mask: u8,
    vib_strength: u8,
    ksr: u8,
}

impl Default for Operator {
    fn default() -> Self {
        Self {
            wave_base: WAVE_BASE_TABLE[0] as usize,
            wave_mask: WAVE_MASK_TABLE[0] as u32,
            wave_start: (WAVE_START_TABLE[0] as u32) << WAVE_SH,
            wave_index: 0,
            wave_add: 0,
            wave_current: 0,
            wave_form: 0,
            chan_data: 0,
            freq_mul: 0,
            vibrato: 0,
            sustain_level: ENV_MAX,
            total_level: ENV_MAX,
            current_level: ENV_MAX,
            volume: ENV_MAX,
            attack_add: 0,
            decay_add: 0,
            release_add: 0,
            rate_index: 0,
            rate_zero: 1 << OperatorState::Off as u8,
            key_on: 0,
            reg20: 0,
            reg40: 0,
            reg60: 0,
            reg80: 0,
            reg_e0: 0,
            state: OperatorState::Off,
            tremolo_mask: 0,
            vib_strength: 0,
            ksr: 0,
        }
    }
}

/// Two operators plus the shared synthesis configuration of one voice.
#[derive(Debug, Clone)]
pub struct Channel {
    op: [Operator; 2],
    synth: SynthMode,
    chan_data: u32,
    /// Last two modulator outputs, for feedback
    old: [i32; 2],
    /// Right shift applied to the feedback sum, 31 disables feedback
    feedback: u8,
    reg_b0: u8,
    reg_c0: u8,
    /// Bits 0-5: the 0x104 bit pairing this channel, 0x80: second half of a
    /// pair, 0x40: rhythm channel
    four_mask: u8,
    mask_left: i32,
    mask_right: i32,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            op: [Operator::default(), Operator::default()],
            synth: SynthMode::Sm2FM,
            chan_data: 0,
            old: [0, 0],
            feedback: 31,
            reg_b0: 0,
            reg_c0: 0,
            four_mask: 0,
            mask_left: -1,
            mask_right: -1,
        }
    }
}

/// Splits a rate table index into the increase table index and shift.
fn envelope_select(val: u8) -> (u8, u8) {
    if val < 13 * 4 {
        // rate 0 - 12
        (val & 3, 12 - (val >> 2))
    } else if val < 15 * 4 {
        // rate 13 - 14
        (val - 12 * 4, 0)
    } else {
        // rate 15 and up
        (12, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_select() {
        assert_eq!(envelope_select(0), (0, 12));
        assert_eq!(envelope_select(13 * 4 - 1), (3, 0));
        assert_eq!(envelope_select(13 * 4), (4, 0));
        assert_eq!(envelope_select(15 * 4 + 3), (12, 0));
    }

    #[test]
    fn test_env_silent() {
        assert!(!env_silent(0));
        assert!(!env_silent(ENV_LIMIT - 1));
        assert!(env_silent(ENV_LIMIT));
        assert!(env_silent(ENV_MAX));
    }

    #[test]
    fn test_operator_default() {
        let op = Operator::default();
        assert_eq!(op.state, OperatorState::Off);
        assert_eq!(op.volume, ENV_MAX);
        assert_eq!(op.sustain_level, ENV_MAX);
        assert_eq!(op.rate_zero, 1);
    }

    #[test]
    fn test_channel_default() {
        let ch = Channel::default();
        assert_eq!(ch.feedback, 31);
        assert_eq!(ch.synth, SynthMode::Sm2FM);
        assert_eq!((ch.mask_left, ch.mask_right), (-1, -1));
    }

    #[test]
    fn test_synth_mode_ordering() {
        assert!(SynthMode::Sm3FMFM > SynthMode::Sm4Start);
        assert!(SynthMode::Sm3AMAM < SynthMode::Sm6Start);
        assert!(SynthMode::Sm3Percussion > SynthMode::Sm6Start);
        assert!(SynthMode::Sm3FM < SynthMode::Sm4Start);
    }

    #[test]
    fn test_chan_offset_pairs_four_op_channels() {
        let t = tables();
        // registers 0xC0..0xC5 become channels 0,2,4,1,3,5
        let mapped: Vec<_> = (0..6).map(|i| t.chan_offset_table[i].unwrap()).collect();
        assert_eq!(mapped, vec![0, 2, 4, 1, 3, 5]);
        assert_eq!(t.chan_offset_table[8], Some(8));
        assert_eq!(t.chan_offset_table[9], None);
        // second bank
        assert_eq!(t.chan_offset_table[16], Some(9));
        assert_eq!(t.chan_offset_table[16 + 8], Some(17));
    }

    #[test]
    fn test_op_offset_slots() {
        let t = tables();
        // slot 0 and 3 are the modulator and carrier of register channel 0
        assert_eq!(t.op_offset_table[0], Some((0, 0)));
        assert_eq!(t.op_offset_table[3], Some((0, 1)));
        // slot 8 is register channel 3, placed after channel 0
        assert_eq!(t.op_offset_table[8], Some((1, 0)));
        assert_eq!(t.op_offset_table[0x12], Some((8, 0)));
        assert_eq!(t.op_offset_table[0x15], Some((8, 1)));
        assert_eq!(t.op_offset_table[6], None);
        assert_eq!(t.op_offset_table[0x18], None);
    }

    #[test]
    fn test_tremolo_table_is_triangle() {
        let t = tables();
        assert_eq!(t.tremolo_table[0], 0);
        assert_eq!(t.tremolo_table[TREMOLO_TABLE / 2 - 1], 25);
        assert_eq!(t.tremolo_table[TREMOLO_TABLE - 1], 0);
    }

    #[test]
    fn test_ksl_table() {
        let t = tables();
        assert_eq!(t.ksl_table[0], 0);
        // octave 7, highest fnum bits
        assert_eq!(t.ksl_table[7 * 16 + 15], 56 * 4);
    }

    #[cfg(not(feature = "wave_handler"))]
    #[test]
    fn test_wave_table_shape() {
        let t = tables();
        #[cfg(not(feature = "wave_tablelog"))]
        {
            assert!(t.wave_table[0x200 + 256] > 4000);
            assert!(t.wave_table[256] < -4000);
        }
        #[cfg(feature = "wave_tablelog")]
        {
            // peak of the sine has no attenuation, negative half flagged
            assert_eq!(t.wave_table[0x200 + 256], 0);
            assert!(t.wave_table[256] < 0);
        }
    }
}
