//! # Channel Implementation
//!
//! Channels pair two operators. A 4-op voice spans a channel and its
//! neighbour, the rhythm section spans channels 6, 7 and 8 of the first core.
//! Functions that reach across channels take the core's channel slice and a
//! channel index, operator `k` of a voice starting at channel `c` lives at
//! `chans[c + k / 2].op[k % 2]`.

use crate::chip::Noise;
use crate::*;

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn synth_mode(&self) -> SynthMode {
        self.synth
    }

    pub fn operator(&self, index: usize) -> &Operator {
        &self.op[index & 1]
    }

    pub(crate) fn op_mut(&mut self, index: usize) -> &mut Operator {
        &mut self.op[index & 1]
    }

    pub(crate) fn set_four_mask(&mut self, mask: u8) {
        self.four_mask = mask;
    }

    pub(crate) fn set_synth(&mut self, mode: SynthMode) {
        self.synth = mode;
    }

    /// Stores the new frequency data in the channel and both operators.
    ///
    /// The frequency is always recalculated, attenuation only when the KSL
    /// base moved and the envelope rates only when the key code moved.
    fn set_chan_data(&mut self, rates: &RateTables, data: u32) {
        let change = self.chan_data ^ data;
        self.chan_data = data;
        for op in self.op.iter_mut() {
            op.set_chan_data(data);
            op.update_frequency();
        }
        if change & (0xff << SHIFT_KSLBASE) != 0 {
            for op in self.op.iter_mut() {
                op.update_attenuation();
            }
        }
        if change & (0xff << SHIFT_KEYCODE) != 0 {
            for op in self.op.iter_mut() {
                op.update_rates(rates);
            }
        }
    }

    fn key_on(&mut self, mask: u8) {
        self.op[0].key_on(mask);
        self.op[1].key_on(mask);
    }

    fn key_off(&mut self, mask: u8) {
        self.op[0].key_off(mask);
        self.op[1].key_off(mask);
    }

    /// 4-op state of this channel: bits 0-5 when paired, 0x80 when second in a
    /// pair. A value above 0x80 means the channel is driven by its partner.
    fn four_op(&self, flags: ChipFlags) -> u8 {
        flags.reg104 & flags.opl3_active & self.four_mask
    }
}

fn op(chans: &mut [Channel], c: usize, k: usize) -> &mut Operator {
    &mut chans[c + (k >> 1)].op[k & 1]
}

fn op_silent(chans: &[Channel], c: usize, k: usize) -> bool {
    chans[c + (k >> 1)].op[k & 1].silent()
}

/// Derives key code and KSL base from the frequency bits and pushes them to
/// the channel, and to its partner in 4-op mode.
fn update_frequency(chans: &mut [Channel], c: usize, rates: &RateTables, flags: ChipFlags, four_op: u8) {
    let mut data = chans[c].chan_data & 0xffff;
    let ksl_base = tables().ksl_table[(data >> 6) as usize] as u32;
    let mut key_code = (data & 0x1c00) >> 9;
    if flags.reg08 & 0x40 != 0 {
        key_code |= (data & 0x100) >> 8;
    } else {
        key_code |= (data & 0x200) >> 9;
    }
    data |= (key_code << SHIFT_KEYCODE) | (ksl_base << SHIFT_KSLBASE);
    chans[c].set_chan_data(rates, data);
    if four_op & 0x3f != 0 {
        chans[c + 1].set_chan_data(rates, data);
    }
}

/// F-number low byte
pub(crate) fn write_a0(chans: &mut [Channel], c: usize, rates: &RateTables, flags: ChipFlags, val: u8) {
    let four_op = chans[c].four_op(flags);
    if four_op > 0x80 {
        return;
    }
    let change = (chans[c].chan_data ^ val as u32) & 0xff;
    if change != 0 {
        chans[c].chan_data ^= change;
        update_frequency(chans, c, rates, flags, four_op);
    }
}

/// Key on, block and F-number high bits
pub(crate) fn write_b0(chans: &mut [Channel], c: usize, rates: &RateTables, flags: ChipFlags, val: u8) {
    let four_op = chans[c].four_op(flags);
    if four_op > 0x80 {
        return;
    }
    let change = (chans[c].chan_data ^ ((val as u32) << 8)) & 0x1f00;
    if change != 0 {
        chans[c].chan_data ^= change;
        update_frequency(chans, c, rates, flags, four_op);
    }
    if (val ^ chans[c].reg_b0) & 0x20 == 0 {
        return;
    }
    chans[c].reg_b0 = val;
    let pair = four_op & 0x3f != 0;
    if val & 0x20 != 0 {
        chans[c].key_on(0x1);
        if pair {
            chans[c + 1].key_on(0x1);
        }
    } else {
        chans[c].key_off(0x1);
        if pair {
            chans[c + 1].key_off(0x1);
        }
    }
}

/// Output routing, feedback and connection
pub(crate) fn write_c0(chans: &mut [Channel], c: usize, flags: ChipFlags, val: u8) {
    let ch = &mut chans[c];
    if val ^ ch.reg_c0 == 0 {
        return;
    }
    ch.reg_c0 = val;
    let feedback = (val >> 1) & 7;
    // Shift the input to the 10 bit wave index range
    ch.feedback = if feedback != 0 { 9 - feedback } else { 31 };
    update_synth(chans, c, flags);
}

/// Selects the synth mode from the connection bits, 4-op pairing and OPL3
/// state. Rhythm channels are left alone while rhythm mode is on.
pub(crate) fn update_synth(chans: &mut [Channel], c: usize, flags: ChipFlags) {
    let four_mask = chans[c].four_mask;
    let percussion = four_mask & 0x40 != 0 && flags.reg_bd & 0x20 != 0;
    if flags.opl3_active != 0 {
        if (flags.reg104 & four_mask) & 0x3f != 0 {
            let first = if four_mask & 0x80 == 0 { c } else { c - 1 };
            let synth = (chans[first].reg_c0 & 1) | ((chans[first + 1].reg_c0 & 1) << 1);
            chans[first].synth = match synth {
                0 => SynthMode::Sm3FMFM,
                1 => SynthMode::Sm3AMFM,
                2 => SynthMode::Sm3FMAM,
                _ => SynthMode::Sm3AMAM,
            };
        } else if !percussion {
            chans[c].synth = if chans[c].reg_c0 & 1 != 0 {
                SynthMode::Sm3AM
            } else {
                SynthMode::Sm3FM
            };
        }
        let ch = &mut chans[c];
        ch.mask_left = if ch.reg_c0 & 0x10 != 0 { -1 } else { 0 };
        ch.mask_right = if ch.reg_c0 & 0x20 != 0 { -1 } else { 0 };
    } else if !percussion {
        chans[c].synth = if chans[c].reg_c0 & 1 != 0 {
            SynthMode::Sm2AM
        } else {
            SynthMode::Sm2FM
        };
    }
}

/// Generates `samples` stereo frames for the voice starting at channel `c`,
/// adding into `output`. Returns how many channels the voice used.
pub(crate) fn synth_block(
    chans: &mut [Channel],
    c: usize,
    lfo: LfoState,
    noise: &mut Noise,
    samples: usize,
    output: &mut [i32],
) -> usize {
    let mode = chans[c].synth;
    let step = match mode {
        SynthMode::Sm2Percussion | SynthMode::Sm3Percussion => 3,
        m if m > SynthMode::Sm4Start => 2,
        _ => 1,
    };
    let silent = match mode {
        SynthMode::Sm2AM | SynthMode::Sm3AM => op_silent(chans, c, 0) && op_silent(chans, c, 1),
        SynthMode::Sm2FM | SynthMode::Sm3FM => op_silent(chans, c, 1),
        SynthMode::Sm3FMFM => op_silent(chans, c, 3),
        SynthMode::Sm3AMFM => op_silent(chans, c, 0) && op_silent(chans, c, 3),
        SynthMode::Sm3FMAM => op_silent(chans, c, 1) && op_silent(chans, c, 3),
        SynthMode::Sm3AMAM => {
            op_silent(chans, c, 0) && op_silent(chans, c, 2) && op_silent(chans, c, 3)
        }
        _ => false,
    };
    if silent {
        chans[c].old = [0, 0];
        return step;
    }

    for k in 0..step * 2 {
        op(chans, c, k).prepare(lfo);
    }

    for frame in output.chunks_exact_mut(2).take(samples) {
        if step == 3 {
            let sample = percussion_sample(chans, c, noise);
            frame[0] += sample;
            frame[1] += sample;
            continue;
        }

        let ch = &mut chans[c];
        // Unsigned shift so a feedback of 31 clears the sum
        let modulation = ((ch.old[0] + ch.old[1]) as u32 >> ch.feedback) as i32;
        ch.old[0] = ch.old[1];
        ch.old[1] = ch.op[0].get_sample(modulation);
        let out0 = ch.old[0];

        let sample = match mode {
            SynthMode::Sm2AM | SynthMode::Sm3AM => out0 + op(chans, c, 1).get_sample(0),
            SynthMode::Sm2FM | SynthMode::Sm3FM => op(chans, c, 1).get_sample(out0),
            SynthMode::Sm3FMFM => {
                let next = op(chans, c, 1).get_sample(out0);
                let next = op(chans, c, 2).get_sample(next);
                op(chans, c, 3).get_sample(next)
            }
            SynthMode::Sm3AMFM => {
                let next = op(chans, c, 1).get_sample(0);
                let next = op(chans, c, 2).get_sample(next);
                out0 + op(chans, c, 3).get_sample(next)
            }
            SynthMode::Sm3FMAM => {
                let sample = op(chans, c, 1).get_sample(out0);
                let next = op(chans, c, 2).get_sample(0);
                sample + op(chans, c, 3).get_sample(next)
            }
            SynthMode::Sm3AMAM => {
                let next = op(chans, c, 1).get_sample(0);
                let sample = out0 + op(chans, c, 2).get_sample(next);
                sample + op(chans, c, 3).get_sample(0)
            }
            _ => 0,
        };

        match mode {
            SynthMode::Sm2AM | SynthMode::Sm2FM => {
                frame[0] += sample;
                frame[1] += sample;
            }
            _ => {
                let ch = &chans[c];
                frame[0] += sample & ch.mask_left;
                frame[1] += sample & ch.mask_right;
            }
        }
    }
    step
}

/// One sample of the rhythm section: bass drum on channel `c`, hi-hat and
/// snare on `c + 1`, tom-tom and cymbal on `c + 2`.
fn percussion_sample(chans: &mut [Channel], c: usize, noise: &mut Noise) -> i32 {
    let ch = &mut chans[c];
    let modulation = ((ch.old[0] + ch.old[1]) as u32 >> ch.feedback) as i32;
    ch.old[0] = ch.old[1];
    ch.old[1] = ch.op[0].get_sample(modulation);
    // In AM mode the first bass drum operator is ignored
    let modulation = if ch.reg_c0 & 1 != 0 { 0 } else { ch.old[0] };
    let mut sample = ch.op[1].get_sample(modulation);

    let noise_bit = noise.forward() & 0x1;
    let c2 = op(chans, c, 2).forward_wave();
    let c5 = op(chans, c, 5).forward_wave();
    let phase_bit: u32 = if (((c2 & 0x88) ^ ((c2 << 5) & 0x80)) | ((c5 ^ (c5 << 2)) & 0x20)) != 0 {
        0x02
    } else {
        0x00
    };

    let hh = op(chans, c, 2);
    let hh_vol = hh.forward_volume();
    if !env_silent(hh_vol as i32) {
        let hh_index = (phase_bit << 8) | (0x34 << (phase_bit ^ (noise_bit << 1)));
        sample += hh.get_wave(hh_index, hh_vol);
    }

    let sd = op(chans, c, 3);
    let sd_vol = sd.forward_volume();
    if !env_silent(sd_vol as i32) {
        let sd_index = (0x100 + (c2 & 0x100)) ^ (noise_bit << 8);
        sample += sd.get_wave(sd_index, sd_vol);
    }

    sample += op(chans, c, 4).get_sample(0);

    let tc = op(chans, c, 5);
    let tc_vol = tc.forward_volume();
    if !env_silent(tc_vol as i32) {
        let tc_index = (1 + phase_bit) << 8;
        sample += tc.get_wave(tc_index, tc_vol);
    }

    sample << 1
}

/// Applies the drum key bits of register 0xBD to channels 6-8
pub(crate) fn rhythm_keys(chans: &mut [Channel], val: u8) {
    let keys: [(usize, usize, u8); 6] = [
        (6, 0, 0x10), // bass drum
        (6, 1, 0x10),
        (7, 0, 0x01), // hi-hat
        (7, 1, 0x08), // snare
        (8, 0, 0x04), // tom-tom
        (8, 1, 0x02), // top cymbal
    ];
    for (c, k, bit) in keys {
        if val & bit != 0 {
            chans[c].op[k].key_on(0x2);
        } else {
            chans[c].op[k].key_off(0x2);
        }
    }
}

/// Releases the rhythm key bits when rhythm mode is switched off
pub(crate) fn rhythm_release(chans: &mut [Channel]) {
    for ch in &mut chans[6..9] {
        ch.key_off(0x2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Vec<Channel> {
        let mut chans = vec![Channel::new(); CORE_CHANNELS];
        for (i, ch) in chans.iter_mut().take(6).enumerate() {
            ch.set_four_mask(((i as u8 & 1) << 7) | (1 << (i / 2)));
        }
        for ch in &mut chans[6..9] {
            ch.set_four_mask(0x40);
        }
        chans
    }

    fn opl3() -> ChipFlags {
        ChipFlags {
            opl3_active: 0xff,
            reg104: 0x80,
            ..Default::default()
        }
    }

    #[test]
    fn test_feedback_shift() {
        let mut chans = core();
        write_c0(&mut chans, 0, opl3(), 0x0E);
        assert_eq!(chans[0].feedback, 2);
        write_c0(&mut chans, 0, opl3(), 0x30);
        assert_eq!(chans[0].feedback, 31);
    }

    #[test]
    fn test_update_synth_two_op() {
        let mut chans = core();
        write_c0(&mut chans, 0, opl3(), 0x31);
        assert_eq!(chans[0].synth_mode(), SynthMode::Sm3AM);
        assert_eq!((chans[0].mask_left, chans[0].mask_right), (-1, -1));
        write_c0(&mut chans, 0, opl3(), 0x10);
        assert_eq!(chans[0].synth_mode(), SynthMode::Sm3FM);
        assert_eq!((chans[0].mask_left, chans[0].mask_right), (-1, 0));

        write_c0(&mut chans, 2, ChipFlags::default(), 0x01);
        assert_eq!(chans[2].synth_mode(), SynthMode::Sm2AM);
    }

    #[test]
    fn test_update_synth_four_op() {
        let mut chans = core();
        let flags = ChipFlags {
            reg104: 0x81,
            ..opl3()
        };
        write_c0(&mut chans, 0, flags, 0x31);
        assert_eq!(chans[0].synth_mode(), SynthMode::Sm3AMFM);
        // the second half selects the mode of the first
        write_c0(&mut chans, 1, flags, 0x31);
        assert_eq!(chans[0].synth_mode(), SynthMode::Sm3AMAM);
        write_c0(&mut chans, 0, flags, 0x30);
        assert_eq!(chans[0].synth_mode(), SynthMode::Sm3FMAM);
    }

    #[test]
    fn test_second_of_pair_ignores_frequency() {
        let mut chans = core();
        let rates = RateTables::new(44100);
        let flags = ChipFlags {
            reg104: 0x81,
            ..opl3()
        };
        write_a0(&mut chans, 1, &rates, flags, 0x55);
        assert_eq!(chans[1].chan_data & 0xff, 0);
        // the first half drives both
        write_a0(&mut chans, 0, &rates, flags, 0x55);
        assert_eq!(chans[1].chan_data & 0xff, 0x55);
    }

    #[test]
    fn test_key_code_and_ksl_in_chan_data() {
        let mut chans = core();
        let rates = RateTables::new(44100);
        write_a0(&mut chans, 0, &rates, opl3(), 0x00);
        // block 7, fnum 0x3ff
        write_a0(&mut chans, 0, &rates, opl3(), 0xff);
        write_b0(&mut chans, 0, &rates, opl3(), 0x1f);
        let data = chans[0].chan_data;
        assert_eq!(data & 0x1fff, 0x1fff);
        assert_eq!(data >> SHIFT_KEYCODE, 0xf);
        assert_eq!((data >> SHIFT_KSLBASE) & 0xff, 56 * 4);
    }

    #[test]
    fn test_key_on_follows_bit() {
        let mut chans = core();
        let rates = RateTables::new(44100);
        write_b0(&mut chans, 3, &rates, opl3(), 0x20);
        assert_eq!(chans[3].operator(0).state(), OperatorState::Attack);
        assert_eq!(chans[3].operator(1).state(), OperatorState::Attack);
        write_b0(&mut chans, 3, &rates, opl3(), 0x00);
        assert_eq!(chans[3].operator(1).state(), OperatorState::Release);
    }

    #[test]
    fn test_rhythm_keys() {
        let mut chans = core();
        rhythm_keys(&mut chans, 0x10 | 0x02);
        assert_eq!(chans[6].operator(0).state(), OperatorState::Attack);
        assert_eq!(chans[6].operator(1).state(), OperatorState::Attack);
        assert_eq!(chans[7].operator(0).state(), OperatorState::Off);
        assert_eq!(chans[8].operator(1).state(), OperatorState::Attack);
        rhythm_release(&mut chans);
        assert_eq!(chans[6].operator(0).state(), OperatorState::Release);
    }

    #[test]
    fn test_silent_voice_skips() {
        let mut chans = core();
        let mut noise = Noise::new(1 << LFO_SH);
        let mut out = vec![0i32; 64];
        chans[0].old = [5, 7];
        let step = synth_block(&mut chans, 0, LfoState::default(), &mut noise, 32, &mut out);
        assert_eq!(step, 1);
        assert_eq!(chans[0].old, [0, 0]);
        assert!(out.iter().all(|s| *s == 0));
    }
}
