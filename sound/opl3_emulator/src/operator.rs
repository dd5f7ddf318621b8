//! # Operator Implementation
//!
//! An operator is a phase accumulator feeding a waveform lookup, scaled by an
//! envelope generator. Each channel owns two; 4-op voices and the rhythm
//! section borrow operators from neighbouring channels.

use crate::*;

impl Operator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current envelope phase
    pub fn state(&self) -> OperatorState {
        self.state
    }

    /// Current envelope attenuation, `0` is full volume
    pub fn envelope(&self) -> i32 {
        self.volume
    }

    fn set_state(&mut self, state: OperatorState) {
        self.state = state;
    }

    fn rate_forward(&mut self, add: u32) -> i32 {
        self.rate_index = self.rate_index.wrapping_add(add);
        let ret = self.rate_index >> RATE_SH;
        self.rate_index &= RATE_MASK;
        ret as i32
    }

    /// Recalculates the attack increment from register 0x60 bits 4-7
    pub(crate) fn update_attack(&mut self, rates: &RateTables) {
        let rate = self.reg60 >> 4;
        if rate != 0 {
            let val = (rate << 2) + self.ksr;
            self.attack_add = rates.attack_rates[val as usize];
            self.rate_zero &= !(1 << OperatorState::Attack as u8);
        } else {
            self.attack_add = 0;
            self.rate_zero |= 1 << OperatorState::Attack as u8;
        }
    }

    /// Recalculates the decay increment from register 0x60 bits 0-3
    pub(crate) fn update_decay(&mut self, rates: &RateTables) {
        let rate = self.reg60 & 0xf;
        if rate != 0 {
            let val = (rate << 2) + self.ksr;
            self.decay_add = rates.linear_rates[val as usize];
            self.rate_zero &= !(1 << OperatorState::Decay as u8);
        } else {
            self.decay_add = 0;
            self.rate_zero |= 1 << OperatorState::Decay as u8;
        }
    }

    /// Recalculates the release increment from register 0x80 bits 0-3.
    ///
    /// Without the sustain bit the sustain phase keeps releasing, so its
    /// rate-zero bit follows the release rate.
    pub(crate) fn update_release(&mut self, rates: &RateTables) {
        let rate = self.reg80 & 0xf;
        let sustain = OperatorState::Sustain as u8;
        if rate != 0 {
            let val = (rate << 2) + self.ksr;
            self.release_add = rates.linear_rates[val as usize];
            self.rate_zero &= !(1 << OperatorState::Release as u8);
            if self.reg20 & MASK_SUSTAIN == 0 {
                self.rate_zero &= !(1 << sustain);
            }
        } else {
            self.rate_zero |= 1 << OperatorState::Release as u8;
            self.release_add = 0;
            if self.reg20 & MASK_SUSTAIN == 0 {
                self.rate_zero |= 1 << sustain;
            }
        }
    }

    /// Total level plus key scale attenuation
    pub(crate) fn update_attenuation(&mut self) {
        let ksl_base = (self.chan_data >> SHIFT_KSLBASE) & 0xff;
        let tl = (self.reg40 & 0x3f) as u32;
        let ksl_shift = KSL_SHIFT_TABLE[(self.reg40 >> 6) as usize] as u32;
        // Total level sits 2 bits below the envelope range
        let mut total = tl << (ENV_BITS - 7);
        total += (ksl_base << ENV_EXTRA) >> ksl_shift;
        self.total_level = total as i32;
    }

    pub(crate) fn update_frequency(&mut self) {
        let freq = self.chan_data & ((1 << 10) - 1);
        let block = (self.chan_data >> 10) & 0xff;
        self.wave_add = (freq << block).wrapping_mul(self.freq_mul);
        if self.reg20 & MASK_VIBRATO != 0 {
            self.vib_strength = (freq >> 7) as u8;
            self.vibrato = ((self.vib_strength as u32) << block).wrapping_mul(self.freq_mul);
        } else {
            self.vib_strength = 0;
            self.vibrato = 0;
        }
    }

    /// Key scale rate changed, recalculate all envelope increments
    pub(crate) fn update_rates(&mut self, rates: &RateTables) {
        let mut new_ksr = ((self.chan_data >> SHIFT_KEYCODE) & 0xff) as u8;
        if self.reg20 & MASK_KSR == 0 {
            new_ksr >>= 2;
        }
        if self.ksr == new_ksr {
            return;
        }
        self.ksr = new_ksr;
        self.update_attack(rates);
        self.update_decay(rates);
        self.update_release(rates);
    }

    pub(crate) fn set_chan_data(&mut self, data: u32) {
        self.chan_data = data;
    }

    /// Advances the envelope one sample for the current phase
    fn template_volume(&mut self) -> i32 {
        let mut vol = self.volume;
        match self.state {
            OperatorState::Off => return ENV_MAX,
            OperatorState::Attack => {
                let change = self.rate_forward(self.attack_add);
                if change == 0 {
                    return vol;
                }
                vol += ((!vol) * change) >> 3;
                if vol < ENV_MIN {
                    self.volume = ENV_MIN;
                    self.rate_index = 0;
                    self.set_state(OperatorState::Decay);
                    return ENV_MIN;
                }
            }
            OperatorState::Decay => {
                vol += self.rate_forward(self.decay_add);
                if vol >= self.sustain_level {
                    if vol >= ENV_MAX {
                        self.volume = ENV_MAX;
                        self.set_state(OperatorState::Off);
                        return ENV_MAX;
                    }
                    self.rate_index = 0;
                    self.set_state(OperatorState::Sustain);
                }
            }
            OperatorState::Sustain if self.reg20 & MASK_SUSTAIN != 0 => return vol,
            OperatorState::Sustain | OperatorState::Release => {
                vol += self.rate_forward(self.release_add);
                if vol >= ENV_MAX {
                    self.volume = ENV_MAX;
                    self.set_state(OperatorState::Off);
                    return ENV_MAX;
                }
            }
        }
        self.volume = vol;
        vol
    }

    pub(crate) fn forward_volume(&mut self) -> u32 {
        (self.current_level + self.template_volume()) as u32
    }

    pub(crate) fn forward_wave(&mut self) -> u32 {
        self.wave_index = self.wave_index.wrapping_add(self.wave_current);
        self.wave_index >> WAVE_SH
    }

    pub(crate) fn write_20(&mut self, rates: &RateTables, val: u8) {
        let change = self.reg20 ^ val;
        if change == 0 {
            return;
        }
        self.reg20 = val;
        // Tremolo bit spread over the whole mask
        self.tremolo_mask = ((val as i8) >> 7) as u8;
        self.tremolo_mask &= !((1 << ENV_EXTRA) - 1);
        if change & MASK_KSR != 0 {
            self.update_rates(rates);
        }
        // With sustain enabled the volume doesn't change
        if self.reg20 & MASK_SUSTAIN != 0 || self.release_add == 0 {
            self.rate_zero |= 1 << OperatorState::Sustain as u8;
        } else {
            self.rate_zero &= !(1 << OperatorState::Sustain as u8);
        }
        if change & (0xf | MASK_VIBRATO) != 0 {
            self.freq_mul = rates.freq_mul[(val & 0xf) as usize];
            self.update_frequency();
        }
    }

    pub(crate) fn write_40(&mut self, val: u8) {
        if self.reg40 ^ val == 0 {
            return;
        }
        self.reg40 = val;
        self.update_attenuation();
    }

    pub(crate) fn write_60(&mut self, rates: &RateTables, val: u8) {
        let change = self.reg60 ^ val;
        self.reg60 = val;
        if change & 0x0f != 0 {
            self.update_decay(rates);
        }
        if change & 0xf0 != 0 {
            self.update_attack(rates);
        }
    }

    pub(crate) fn write_80(&mut self, rates: &RateTables, val: u8) {
        let change = self.reg80 ^ val;
        if change == 0 {
            return;
        }
        self.reg80 = val;
        let mut sustain = (val >> 4) as i32;
        // 0xf becomes 0x1f
        sustain |= (sustain + 1) & 0x10;
        self.sustain_level = sustain << (ENV_BITS - 5);
        if change & 0x0f != 0 {
            self.update_release(rates);
        }
    }

    /// Waveform select. OPL3 mode can always select all 8 waveforms,
    /// OPL2 mode needs the enable bit in register 0x01.
    pub(crate) fn write_e0(&mut self, flags: ChipFlags, val: u8) {
        if self.reg_e0 ^ val == 0 {
            return;
        }
        let wave_form = val & ((0x3 & flags.wave_form_mask) | (0x7 & flags.opl3_active));
        self.reg_e0 = val;
        self.wave_form = wave_form;
        #[cfg(not(feature = "wave_handler"))]
        {
            self.wave_base = WAVE_BASE_TABLE[wave_form as usize] as usize;
            self.wave_start = (WAVE_START_TABLE[wave_form as usize] as u32) << WAVE_SH;
            self.wave_mask = WAVE_MASK_TABLE[wave_form as usize] as u32;
        }
    }

    /// Whether the operator is inaudible and will stay that way
    pub fn silent(&self) -> bool {
        if !env_silent(self.total_level + self.volume) {
            return false;
        }
        self.rate_zero & (1 << self.state as u8) != 0
    }

    /// Latches tremolo and vibrato for the next block
    pub(crate) fn prepare(&mut self, lfo: LfoState) {
        self.current_level = self.total_level + (lfo.tremolo_value & self.tremolo_mask) as i32;
        self.wave_current = self.wave_add;
        if self.vib_strength >> lfo.vibrato_shift != 0 {
            let mut add = (self.vibrato >> lfo.vibrato_shift) as i32;
            // Negate with the sign, -1 or 0
            let neg = lfo.vibrato_sign as i32;
            add = (add ^ neg) - neg;
            self.wave_current = self.wave_current.wrapping_add(add as u32);
        }
    }

    /// Starts the attack phase. `mask` is 1 for a channel key on and 2 for a
    /// rhythm key on, the operator keeps sounding while either is held.
    pub fn key_on(&mut self, mask: u8) {
        if self.key_on == 0 {
            #[cfg(not(feature = "wave_handler"))]
            {
                self.wave_index = self.wave_start;
            }
            #[cfg(feature = "wave_handler")]
            {
                self.wave_index = 0;
            }
            self.rate_index = 0;
            self.set_state(OperatorState::Attack);
        }
        self.key_on |= mask;
    }

    pub fn key_off(&mut self, mask: u8) {
        self.key_on &= !mask;
        if self.key_on == 0 && self.state != OperatorState::Off {
            self.set_state(OperatorState::Release);
        }
    }

    #[cfg(not(any(feature = "wave_handler", feature = "wave_tablelog")))]
    pub(crate) fn get_wave(&self, index: u32, vol: u32) -> i32 {
        let t = tables();
        let wave = t.wave_table[self.wave_base + (index & self.wave_mask) as usize] as i32;
        let mul = t.mul_table[(vol >> ENV_EXTRA) as usize] as i32;
        (wave * mul) >> MUL_SH
    }

    #[cfg(all(feature = "wave_tablelog", not(feature = "wave_handler")))]
    pub(crate) fn get_wave(&self, index: u32, vol: u32) -> i32 {
        let t = tables();
        let wave = t.wave_table[self.wave_base + (index & self.wave_mask) as usize] as i32;
        let total = (wave as u32 & 0x7fff) + (vol << (3 - ENV_EXTRA));
        let sig = t.exp_table[(total & 0xff) as usize] as i32;
        let exp = total >> 8;
        let neg = wave >> 16;
        let mag = sig.checked_shr(exp).unwrap_or(0);
        (mag ^ neg) - neg
    }

    #[cfg(feature = "wave_handler")]
    pub(crate) fn get_wave(&self, index: u32, vol: u32) -> i32 {
        wave_form(self.wave_form, index, vol << (3 - ENV_EXTRA))
    }

    /// Produces one sample, `modulation` is added to the phase
    pub(crate) fn get_sample(&mut self, modulation: i32) -> i32 {
        let vol = self.forward_volume();
        if env_silent(vol as i32) {
            // Keep the phase moving
            self.wave_index = self.wave_index.wrapping_add(self.wave_current);
            0
        } else {
            let index = self.forward_wave().wrapping_add(modulation as u32);
            self.get_wave(index, vol)
        }
    }
}

#[cfg(feature = "wave_handler")]
fn make_volume(wave: u32, volume: u32) -> i32 {
    let total = wave + volume;
    let sig = tables().exp_table[(total & 0xff) as usize] as u32;
    sig.checked_shr(total >> 8).unwrap_or(0) as i32
}

/// All ones in the low 12 bits when `bit` is clear in `i`, pushing the
/// attenuation past audible
#[cfg(feature = "wave_handler")]
fn mute_unless(i: u32, bit: u32) -> u32 {
    ((i ^ bit) & bit).wrapping_sub(1) >> (32 - 12)
}

#[cfg(feature = "wave_handler")]
fn wave_form(form: u8, i: u32, volume: u32) -> i32 {
    let sin = &tables().sin_table;
    match form {
        0 => {
            let neg = 0i32.wrapping_sub(((i >> 9) & 1) as i32);
            let wave = sin[(i & 511) as usize] as u32;
            (make_volume(wave, volume) ^ neg) - neg
        }
        1 => {
            let wave = sin[(i & 511) as usize] as u32 | mute_unless(i, 512);
            make_volume(wave, volume)
        }
        2 => make_volume(sin[(i & 511) as usize] as u32, volume),
        3 => {
            let wave = sin[(i & 255) as usize] as u32 | mute_unless(i, 256);
            make_volume(wave, volume)
        }
        4 => {
            // twice as fast
            let i = i << 1;
            let neg = 0i32.wrapping_sub(((i >> 9) & 1) as i32);
            let wave = sin[(i & 511) as usize] as u32 | mute_unless(i, 512);
            (make_volume(wave, volume) ^ neg) - neg
        }
        5 => {
            let i = i << 1;
            let wave = sin[(i & 511) as usize] as u32 | mute_unless(i, 512);
            make_volume(wave, volume)
        }
        6 => {
            let neg = 0i32.wrapping_sub(((i >> 9) & 1) as i32);
            (make_volume(0, volume) ^ neg) - neg
        }
        _ => {
            // Negative is reversed here, and the volume runs backwards
            let neg = ((i >> 9) & 1) as i32 - 1;
            let wave = (((i << 3) as i32 ^ neg) - neg) as u32 & 4095;
            (make_volume(wave, volume) ^ neg) - neg
        }
    }
}
