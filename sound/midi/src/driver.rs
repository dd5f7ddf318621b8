//! General MIDI voice driver on top of the OPL3 emulator.
//!
//! MIDI notes are mapped onto the 36 two-operator chip channels ("voices").
//! Voice `i` lives in register bank `i / 9` at channel offset `i % 9`, so
//! voices 0-8 and 9-17 are the two banks of the first core and 18-35 the
//! second core. In OPL2 mode only the first nine channels of each core sound,
//! which leaves voices 0-8 and 18-26.

use log::{debug, trace};
use opl3_emulator::{Chip, NUM_CHANNELS};

use crate::instruments::InstrumentBank;
use crate::sequencer::{EventSink, MidiEvent};

pub const MIDI_CHANNELS: usize = 16;
pub const PERCUSSION_CHANNEL: u8 = 9;
/// Output scaling in percent, 100 leaves the chip output as is
pub const DEFAULT_VOLUME_PERCENT: i32 = 100;

const BEND_CENTRE: u16 = 8192;
/// Semitones either side of centre at full bend
const BEND_RANGE: f64 = 2.0;
/// Modulator slot of each channel within a bank, the carrier is 3 above
const SLOT_OFFSETS: [u32; 9] = [0, 1, 2, 8, 9, 10, 16, 17, 18];
const REGISTER_SPACE: usize = 0x400;
const KEY_ON: u8 = 0x20;

const CC_MODULATION: u8 = 1;
const CC_VOLUME: u8 = 7;
const CC_PAN: u8 = 10;
const CC_EXPRESSION: u8 = 11;
const CC_ALL_SOUND_OFF: u8 = 120;
const CC_RESET_CONTROLLERS: u8 = 121;
const CC_ALL_NOTES_OFF: u8 = 123;

#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    active: bool,
    channel: u8,
    note: u8,
    /// Note actually keyed, differs from `note` for fixed-pitch drums
    key: u8,
    instrument: usize,
    velocity: u8,
    /// Sample clock at note on
    started: u64,
}

/// Controller state of one MIDI channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    pub program: u8,
    pub volume: u8,
    pub pan: u8,
    pub expression: u8,
    pub bend: u16,
    pub modulation: u8,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            program: 0,
            volume: 127,
            pan: 64,
            expression: 127,
            bend: BEND_CENTRE,
            modulation: 0,
        }
    }
}

impl ChannelState {
    /// Channel volume scaled by expression
    pub fn effective_volume(&self) -> u8 {
        (self.volume as u32 * self.expression as u32 / 127) as u8
    }

    fn bend_semitones(&self) -> f64 {
        (self.bend as f64 - BEND_CENTRE as f64) / BEND_CENTRE as f64 * BEND_RANGE
    }
}

/// F-number low byte and the block/F-number high bits of register 0xB0
/// (without the key-on bit) for a possibly fractional MIDI note.
pub fn frequency_regs(note: f64) -> (u8, u8) {
    let freq = 440.0 * 2f64.powf((note - 69.0) / 12.0);
    let block = (note.floor() as i32 / 12 - 1).clamp(0, 7);
    let fnum = ((freq * (1u32 << (20 - block)) as f64 / 49716.0) as i32).clamp(0, 1023);
    ((fnum & 0xff) as u8, ((block << 2) | ((fnum >> 8) & 3)) as u8)
}

#[derive(Debug, Clone)]
pub struct OplDriver {
    chip: Chip,
    /// Last value written to each register, for key-off and inspection
    regs: Box<[u8; REGISTER_SPACE]>,
    bank: InstrumentBank,
    voices: [Voice; NUM_CHANNELS],
    channels: [ChannelState; MIDI_CHANNELS],
    opl3: bool,
    volume: i32,
    /// Frames generated so far
    clock: u64,
    mix: Vec<i32>,
}

impl OplDriver {
    pub fn new(sample_rate: u32, opl3: bool) -> Self {
        let mut driver = Self {
            chip: Chip::new(sample_rate),
            regs: Box::new([0; REGISTER_SPACE]),
            bank: InstrumentBank::general_midi(),
            voices: [Voice::default(); NUM_CHANNELS],
            channels: [ChannelState::default(); MIDI_CHANNELS],
            opl3,
            volume: DEFAULT_VOLUME_PERCENT,
            clock: 0,
            mix: Vec::new(),
        };
        if opl3 {
            driver.write(0x105, 0x01);
        }
        driver
    }

    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    pub fn sample_rate(&self) -> u32 {
        self.chip.sample_rate()
    }

    pub fn is_opl3(&self) -> bool {
        self.opl3
    }

    /// Last value written to `reg`
    pub fn register(&self, reg: u32) -> u8 {
        self.regs.get(reg as usize).copied().unwrap_or(0)
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    /// Output scaling in percent
    pub fn set_volume(&mut self, percent: i32) {
        self.volume = percent.max(0);
    }

    pub fn channel_state(&self, channel: u8) -> &ChannelState {
        &self.channels[(channel & 0x0f) as usize]
    }

    /// `(voice, channel, note)` of every sounding voice
    pub fn active_notes(&self) -> impl Iterator<Item = (usize, u8, u8)> + '_ {
        self.voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.active)
            .map(|(i, v)| (i, v.channel, v.note))
    }

    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    fn write(&mut self, reg: u32, val: u8) {
        if let Some(r) = self.regs.get_mut(reg as usize) {
            *r = val;
        }
        self.chip.write_reg(reg, val);
    }

    fn usable(&self, voice: usize) -> bool {
        self.opl3 || (voice / 9) % 2 == 0
    }

    /// Channel register offset and modulator slot offset of a voice
    fn voice_regs(voice: usize) -> (u32, u32) {
        let bank = (voice / 9) as u32 * 0x100;
        let i = voice % 9;
        (bank + i as u32, bank + SLOT_OFFSETS[i])
    }

    /// Picks a voice for a new note: a free one, else the one already playing
    /// this note, else the lowest `velocity * 10 + age` outside percussion.
    fn allocate(&self, channel: u8, note: u8) -> usize {
        let usable = || (0..NUM_CHANNELS).filter(|&i| self.usable(i));

        if let Some(i) = usable().find(|&i| !self.voices[i].active) {
            return i;
        }
        if let Some(i) = usable().find(|&i| {
            let v = &self.voices[i];
            v.channel == channel && v.note == note
        }) {
            return i;
        }

        let rate = self.sample_rate().max(1) as u64;
        let priority = |i: usize| {
            let v = &self.voices[i];
            v.velocity as u64 * 10 + (self.clock - v.started) / rate
        };
        usable()
            .filter(|&i| self.voices[i].channel != PERCUSSION_CHANNEL)
            .min_by_key(|&i| priority(i))
            .or_else(|| usable().min_by_key(|&i| priority(i)))
            .unwrap_or(0)
    }

    fn load_instrument(&mut self, voice: usize) {
        let patch = *self.bank.get(self.voices[voice].instrument);
        let (chan, slot) = Self::voice_regs(voice);
        for (k, base) in [0x20, 0x40, 0x60, 0x80, 0xe0].into_iter().enumerate() {
            self.write(base + slot, patch.mod_char[k]);
            self.write(base + slot + 3, patch.car_char[k]);
        }
        self.write(0xc0 + chan, patch.fb_conn);
    }

    /// Total levels from velocity and channel volume, keeping the KSL bits.
    /// The modulator moves half as far.
    fn apply_volume(&mut self, voice: usize) {
        let v = self.voices[voice];
        let patch = *self.bank.get(v.instrument);
        let volume = self.channels[v.channel as usize].effective_volume();
        let quiet = 1.0 - (v.velocity as f64 / 127.0) * (volume as f64 / 127.0);

        let car = patch.car_level() as i32;
        let car = (car + ((63 - car) as f64 * quiet) as i32).clamp(0, 63);
        let modulator = patch.mod_level() as i32;
        let modulator = (modulator + ((63 - modulator) as f64 * quiet * 0.5) as i32).clamp(0, 63);

        let (_, slot) = Self::voice_regs(voice);
        self.write(0x40 + slot, (patch.mod_char[1] & 0xc0) | modulator as u8);
        self.write(0x43 + slot, (patch.car_char[1] & 0xc0) | car as u8);
    }

    fn apply_pan(&mut self, voice: usize) {
        let v = self.voices[voice];
        let fb_conn = self.bank.get(v.instrument).fb_conn;
        let sides = match self.channels[v.channel as usize].pan {
            0..48 => 0x10,
            81.. => 0x20,
            _ => 0x30,
        };
        let (chan, _) = Self::voice_regs(voice);
        self.write(0xc0 + chan, (fb_conn & 0x0f) | sides);
    }

    fn set_frequency(&mut self, voice: usize, note: f64, key_on: bool) {
        let (a0, b0) = frequency_regs(note);
        let (chan, _) = Self::voice_regs(voice);
        self.write(0xa0 + chan, a0);
        self.write(0xb0 + chan, if key_on { b0 | KEY_ON } else { b0 });
    }

    /// Releases the voice, the envelope carries on through its release
    fn key_off(&mut self, voice: usize) {
        let (chan, _) = Self::voice_regs(voice);
        let b0 = self.register(0xb0 + chan) & !KEY_ON;
        self.write(0xb0 + chan, b0);
        self.voices[voice].active = false;
    }

    fn bent_key(&self, voice: usize) -> f64 {
        let v = &self.voices[voice];
        v.key as f64 + self.channels[v.channel as usize].bend_semitones()
    }

    fn voices_on(&self, channel: u8) -> Vec<usize> {
        (0..NUM_CHANNELS)
            .filter(|&i| self.voices[i].active && self.voices[i].channel == channel)
            .collect()
    }

    pub fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        let channel = channel & 0x0f;
        let percussion = channel == PERCUSSION_CHANNEL;
        let instrument = if percussion {
            self.bank.percussion_index(note)
        } else {
            self.bank.melodic_index(self.channels[channel as usize].program)
        };

        let voice = self.allocate(channel, note);
        if self.voices[voice].active {
            let old = self.voices[voice];
            debug!(
                "Voice {voice} taken from channel {} note {} for channel {channel} note {note}",
                old.channel, old.note
            );
            self.key_off(voice);
        }

        let perc_note = self.bank.get(instrument).perc_note;
        self.voices[voice] = Voice {
            active: true,
            channel,
            note,
            key: if percussion && perc_note != 0 {
                perc_note
            } else {
                note
            },
            instrument,
            velocity,
            started: self.clock,
        };
        self.load_instrument(voice);
        self.apply_volume(voice);
        self.apply_pan(voice);
        self.set_frequency(voice, self.bent_key(voice), true);
    }

    /// Releases the first voice playing `note` on `channel`
    pub fn note_off(&mut self, channel: u8, note: u8) {
        let channel = channel & 0x0f;
        if let Some(voice) = (0..NUM_CHANNELS).find(|&i| {
            let v = &self.voices[i];
            v.active && v.channel == channel && v.note == note
        }) {
            self.key_off(voice);
        }
    }

    /// Stores the program and reloads sounding melodic voices of the channel
    pub fn program_change(&mut self, channel: u8, program: u8) {
        let channel = channel & 0x0f;
        self.channels[channel as usize].program = program;
        if channel == PERCUSSION_CHANNEL {
            return;
        }
        let instrument = self.bank.melodic_index(program);
        for voice in self.voices_on(channel) {
            self.voices[voice].instrument = instrument;
            self.load_instrument(voice);
            self.apply_volume(voice);
            self.apply_pan(voice);
        }
    }

    pub fn controller(&mut self, channel: u8, controller: u8, value: u8) {
        let channel = channel & 0x0f;
        let state = &mut self.channels[channel as usize];
        match controller {
            CC_MODULATION => state.modulation = value,
            CC_VOLUME => {
                state.volume = value;
                self.refresh_volume(channel);
            }
            CC_PAN => {
                state.pan = value;
                for voice in self.voices_on(channel) {
                    self.apply_pan(voice);
                }
            }
            CC_EXPRESSION => {
                state.expression = value;
                self.refresh_volume(channel);
            }
            CC_ALL_SOUND_OFF => self.reset(),
            CC_RESET_CONTROLLERS => {
                state.bend = BEND_CENTRE;
                state.modulation = 0;
                state.expression = 127;
                self.refresh_volume(channel);
                self.refresh_pitch(channel);
            }
            CC_ALL_NOTES_OFF => {
                for voice in self.voices_on(channel) {
                    self.key_off(voice);
                }
            }
            _ => trace!("Channel {channel}: controller {controller} = {value} ignored"),
        }
    }

    /// Aftertouch scales the channel like expression does
    pub fn channel_pressure(&mut self, channel: u8, pressure: u8) {
        let channel = channel & 0x0f;
        self.channels[channel as usize].expression = pressure;
        self.refresh_volume(channel);
    }

    /// Re-pitches sounding voices without retriggering them
    pub fn pitch_bend(&mut self, channel: u8, value: u16) {
        let channel = channel & 0x0f;
        self.channels[channel as usize].bend = value.min(0x3fff);
        self.refresh_pitch(channel);
    }

    fn refresh_volume(&mut self, channel: u8) {
        for voice in self.voices_on(channel) {
            self.apply_volume(voice);
        }
    }

    fn refresh_pitch(&mut self, channel: u8) {
        for voice in self.voices_on(channel) {
            self.set_frequency(voice, self.bent_key(voice), true);
        }
    }

    /// Keys off every sounding voice
    pub fn reset(&mut self) {
        for voice in 0..NUM_CHANNELS {
            if self.voices[voice].active {
                self.key_off(voice);
            }
        }
    }

    /// Programs, volumes, pans and bends back to their power-on values
    pub fn reset_channels(&mut self) {
        self.channels = [ChannelState::default(); MIDI_CHANNELS];
    }

    /// Renders `frames` interleaved stereo frames into `out`, scaled by the
    /// volume percentage and clipped to 16 bits.
    pub fn generate(&mut self, frames: usize, out: &mut [i16]) {
        let frames = frames.min(out.len() / 2);
        self.mix.clear();
        self.mix.resize(frames * 2, 0);
        self.chip.generate(frames, &mut self.mix);

        let gain = self.volume as f64 / 100.0;
        for (o, s) in out.iter_mut().zip(self.mix.iter()) {
            *o = ((*s as f64 * gain) as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        self.clock += frames as u64;
    }
}

impl EventSink for OplDriver {
    fn handle_event(&mut self, event: MidiEvent) {
        match event {
            MidiEvent::NoteOff { channel, note } => self.note_off(channel, note),
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } => self.note_on(channel, note, velocity),
            MidiEvent::PolyPressure { .. } => {}
            MidiEvent::Controller {
                channel,
                controller,
                value,
            } => self.controller(channel, controller, value),
            MidiEvent::ProgramChange { channel, program } => self.program_change(channel, program),
            MidiEvent::ChannelPressure { channel, pressure } => {
                self.channel_pressure(channel, pressure)
            }
            MidiEvent::PitchBend { channel, value } => self.pitch_bend(channel, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> OplDriver {
        OplDriver::new(44100, true)
    }

    fn peak(buf: &[i16]) -> i32 {
        buf.iter().map(|s| (*s as i32).abs()).max().unwrap_or(0)
    }

    #[test]
    fn note_frequency() {
        // Middle C, block 4
        assert_eq!(frequency_regs(60.0), (0x58, 0x11));
        // A4 440 Hz
        assert_eq!(frequency_regs(69.0), (0x44, 0x12));
        // Clamped block and F-number
        assert_eq!(frequency_regs(127.0), (0xff, 0x1f));
        assert_eq!(frequency_regs(0.0).1 >> 2, 0);
    }

    #[test]
    fn note_on_programs_voice() {
        let mut drv = driver();
        assert_eq!(drv.register(0x105), 1);
        drv.note_on(0, 60, 127);

        let piano = *InstrumentBank::general_midi().melodic(0);
        assert_eq!(drv.register(0x20), piano.mod_char[0]);
        assert_eq!(drv.register(0x23), piano.car_char[0]);
        assert_eq!(drv.register(0x63), piano.car_char[2]);
        assert_eq!(drv.register(0xe0), piano.mod_char[4]);
        // Full velocity and volume leave the patch levels alone
        assert_eq!(drv.register(0x40), piano.mod_char[1]);
        assert_eq!(drv.register(0x43), piano.car_char[1]);
        assert_eq!(drv.register(0xc0), (piano.fb_conn & 0x0f) | 0x30);
        assert_eq!(drv.register(0xa0), 0x58);
        assert_eq!(drv.register(0xb0), 0x31);
        assert_eq!(drv.active_notes().collect::<Vec<_>>(), vec![(0, 0, 60)]);
    }

    #[test]
    fn voices_use_slot_map_and_banks() {
        let mut drv = driver();
        for note in 0..11 {
            drv.note_on(0, 40 + note, 100);
        }
        let piano = *InstrumentBank::general_midi().melodic(0);
        // Voice 3 modulator is slot 8, carrier slot 11
        assert_eq!(drv.register(0x28), piano.mod_char[0]);
        assert_eq!(drv.register(0x2b), piano.car_char[0]);
        // Voice 10 is channel 1 of the second bank
        assert_eq!(drv.register(0x121), piano.mod_char[0]);
        assert_eq!(drv.register(0x164), piano.car_char[2]);
        assert_eq!(drv.register(0x1b1) & KEY_ON, KEY_ON);
    }

    #[test]
    fn velocity_scales_levels() {
        let mut drv = driver();
        drv.note_on(0, 60, 64);
        // quiet = 63/127: carrier 6 + 28, modulator 15 + 11
        assert_eq!(drv.register(0x43), 34);
        assert_eq!(drv.register(0x40), 0x80 | 26);

        drv.controller(0, CC_VOLUME, 0);
        assert_eq!(drv.register(0x43), 63);
        assert_eq!(drv.register(0x40) & 0xc0, 0x80);

        drv.controller(0, CC_VOLUME, 127);
        drv.controller(0, CC_EXPRESSION, 0);
        assert_eq!(drv.register(0x43), 63);
        assert_eq!(drv.channel_state(0).effective_volume(), 0);

        drv.controller(0, CC_RESET_CONTROLLERS, 0);
        assert_eq!(drv.register(0x43), 34);
    }

    #[test]
    fn pan_bits() {
        let mut drv = driver();
        drv.note_on(2, 60, 100);
        let fb = InstrumentBank::general_midi().melodic(0).fb_conn & 0x0f;
        drv.controller(2, CC_PAN, 0);
        assert_eq!(drv.register(0xc0), fb | 0x10);
        drv.controller(2, CC_PAN, 127);
        assert_eq!(drv.register(0xc0), fb | 0x20);
        drv.controller(2, CC_PAN, 48);
        assert_eq!(drv.register(0xc0), fb | 0x30);
        drv.controller(2, CC_PAN, 80);
        assert_eq!(drv.register(0xc0), fb | 0x30);
        // Other channels are untouched
        drv.controller(3, CC_PAN, 0);
        assert_eq!(drv.register(0xc0), fb | 0x30);
    }

    #[test]
    fn note_off_releases_first_match() {
        let mut drv = driver();
        drv.note_on(0, 60, 100);
        drv.note_on(0, 60, 100);
        drv.note_on(1, 60, 100);
        drv.note_off(0, 60);
        assert_eq!(drv.register(0xb0) & KEY_ON, 0);
        assert_eq!(drv.register(0xb1) & KEY_ON, KEY_ON);
        assert_eq!(drv.active_voices(), 2);
        // Frequency bits survive the key off
        assert_eq!(drv.register(0xb0), 0x11);
        drv.note_off(5, 60);
        assert_eq!(drv.active_voices(), 2);
    }

    #[test]
    fn no_voice_is_shared() {
        let mut drv = driver();
        for n in 0..100u8 {
            drv.note_on(n % 16, n, 1 + n % 127);
            if n % 7 == 0 && n >= 3 {
                drv.note_off((n - 3) % 16, n - 3);
            }
            let mut seen = [false; NUM_CHANNELS];
            for (voice, _, _) in drv.active_notes() {
                assert!(!seen[voice]);
                seen[voice] = true;
            }
        }
        assert_eq!(drv.active_voices(), NUM_CHANNELS);
    }

    #[test]
    fn steals_lowest_priority() {
        let mut drv = driver();
        for i in 0..NUM_CHANNELS as u8 {
            drv.note_on(0, 30 + i, if i == 5 { 10 } else { 100 });
        }
        drv.note_on(1, 100, 100);
        let stolen: Vec<_> = drv.active_notes().filter(|(v, _, _)| *v == 5).collect();
        assert_eq!(stolen, vec![(5, 1, 100)]);
    }

    #[test]
    fn older_notes_score_higher() {
        let mut drv = driver();
        let mut buf = vec![0i16; 44100 * 2];
        drv.note_on(0, 40, 50);
        // Two seconds later the first note scores 502
        drv.generate(44100, &mut buf);
        drv.generate(44100, &mut buf);
        for i in 1..NUM_CHANNELS as u8 {
            drv.note_on(0, 40 + i, 50);
        }
        drv.note_on(1, 100, 100);
        assert!(drv.active_notes().any(|(_, c, n)| c == 0 && n == 40));
        assert!(!drv.active_notes().any(|(v, c, n)| v == 1 && c == 0 && n == 41));
    }

    #[test]
    fn percussion_is_stolen_last() {
        let mut drv = driver();
        for i in 0..NUM_CHANNELS as u8 - 1 {
            drv.note_on(PERCUSSION_CHANNEL, 35 + i % 40, 1);
        }
        drv.note_on(0, 60, 127);
        drv.note_on(1, 61, 127);
        // The only melodic voice goes even though the drums are quieter
        assert_eq!(
            drv.active_notes()
                .filter(|(_, c, _)| *c != PERCUSSION_CHANNEL)
                .collect::<Vec<_>>(),
            vec![(35, 1, 61)]
        );

        // All drums, the lowest one is taken
        let mut drv = driver();
        for i in 0..NUM_CHANNELS as u8 {
            drv.note_on(PERCUSSION_CHANNEL, 35 + i, if i == 7 { 1 } else { 90 });
        }
        drv.note_on(PERCUSSION_CHANNEL, 80, 90);
        assert!(drv.active_notes().any(|(v, _, n)| v == 7 && n == 80));
    }

    #[test]
    fn repeated_note_reuses_voice() {
        let mut drv = driver();
        for i in 0..NUM_CHANNELS as u8 {
            drv.note_on(0, 30 + i, 100);
        }
        drv.note_on(0, 40, 127);
        assert_eq!(drv.active_notes().filter(|(_, _, n)| *n == 40).count(), 1);
        assert_eq!(drv.active_voices(), NUM_CHANNELS);
    }

    #[test]
    fn program_change_reloads_melodic_voices() {
        let bank = InstrumentBank::general_midi();
        let mut drv = driver();
        drv.note_on(0, 60, 127);
        drv.note_on(PERCUSSION_CHANNEL, 36, 127);
        drv.program_change(0, 40);
        assert_eq!(drv.register(0x20), bank.get(40).mod_char[0]);
        assert_eq!(drv.register(0x23), bank.get(40).car_char[0]);
        assert_eq!(drv.channel_state(0).program, 40);

        drv.program_change(PERCUSSION_CHANNEL, 3);
        assert_eq!(drv.register(0x21), bank.percussion(36).mod_char[0]);

        // Later notes on the channel use the new program
        drv.note_on(0, 62, 127);
        assert_eq!(drv.register(0x22), bank.get(40).mod_char[0]);
        // instrument= text events reach past the melodic range
        drv.program_change(1, 150);
        drv.note_on(1, 50, 127);
        assert_eq!(drv.register(0x28), bank.get(150).mod_char[0]);
    }

    #[test]
    fn fixed_pitch_drums() {
        let bank = InstrumentBank::general_midi();
        let mut drv = driver();
        let drum = bank.percussion(37);
        assert_ne!(drum.perc_note, 0);
        assert_ne!(drum.perc_note, 37);
        drv.note_on(PERCUSSION_CHANNEL, 37, 100);
        let (a0, b0) = frequency_regs(drum.perc_note as f64);
        assert_eq!(drv.register(0xa0), a0);
        assert_eq!(drv.register(0xb0), b0 | KEY_ON);
        assert_eq!(drv.register(0x20), drum.mod_char[0]);
    }

    #[test]
    fn pitch_bend_holds_key() {
        let mut drv = driver();
        drv.note_on(0, 60, 100);
        drv.pitch_bend(0, 0x3fff);
        let (a0, b0) = frequency_regs(60.0 + (0x3fff as f64 - 8192.0) / 8192.0 * 2.0);
        assert_eq!(drv.register(0xa0), a0);
        assert_eq!(drv.register(0xb0), b0 | KEY_ON);
        assert_ne!(a0, 0x58);

        drv.pitch_bend(0, 0);
        assert_eq!(drv.register(0xa0), frequency_regs(58.0).0);
        drv.pitch_bend(0, BEND_CENTRE);
        assert_eq!(drv.register(0xa0), 0x58);
        assert_eq!(drv.active_voices(), 1);
    }

    #[test]
    fn channel_mode_messages() {
        let mut drv = driver();
        drv.note_on(0, 60, 100);
        drv.note_on(0, 64, 100);
        drv.note_on(1, 60, 100);
        drv.controller(0, CC_ALL_NOTES_OFF, 0);
        assert_eq!(drv.active_notes().collect::<Vec<_>>(), vec![(2, 1, 60)]);
        drv.controller(0, CC_MODULATION, 90);
        assert_eq!(drv.channel_state(0).modulation, 90);
        drv.controller(5, CC_ALL_SOUND_OFF, 0);
        assert_eq!(drv.active_voices(), 0);
        assert_eq!(drv.register(0xb2) & KEY_ON, 0);
    }

    #[test]
    fn pressure_acts_as_expression() {
        let mut drv = driver();
        drv.note_on(0, 60, 127);
        drv.handle_event(MidiEvent::ChannelPressure {
            channel: 0,
            pressure: 0,
        });
        assert_eq!(drv.register(0x43), 63);
        drv.handle_event(MidiEvent::PolyPressure {
            channel: 0,
            note: 60,
            pressure: 127,
        });
        assert_eq!(drv.register(0x43), 63);
    }

    #[test]
    fn opl2_uses_eighteen_voices() {
        let mut drv = OplDriver::new(44100, false);
        assert_eq!(drv.register(0x105), 0);
        for i in 0..18 {
            drv.note_on(0, 40 + i, 100);
        }
        let voices: Vec<usize> = drv.active_notes().map(|(v, _, _)| v).collect();
        assert_eq!(voices, (0..9).chain(18..27).collect::<Vec<_>>());
        drv.note_on(0, 90, 100);
        assert_eq!(drv.active_voices(), 18);
    }

    #[test]
    fn generate_scales_and_counts() {
        let mut drv = driver();
        let mut buf = vec![0i16; 2048];
        drv.generate(1024, &mut buf);
        assert_eq!(peak(&buf), 0);

        drv.note_on(0, 69, 127);
        drv.generate(1024, &mut buf);
        let loud = peak(&buf);
        assert!(loud > 0);

        let mut quiet = drv.clone();
        quiet.set_volume(10);
        let mut a = vec![0i16; 2048];
        let mut b = vec![0i16; 2048];
        drv.generate(1024, &mut a);
        quiet.generate(1024, &mut b);
        assert!(peak(&b) < peak(&a));
        assert_eq!(drv.clock, 3072);
    }

    #[test]
    fn reset_keys_off_everything() {
        let mut drv = driver();
        for i in 0..5 {
            drv.note_on(i, 60, 100);
        }
        drv.controller(0, CC_PAN, 0);
        drv.reset();
        assert_eq!(drv.active_voices(), 0);
        for chan in 0..5 {
            assert_eq!(drv.register(0xb0 + chan) & KEY_ON, 0);
        }
        drv.reset_channels();
        assert_eq!(*drv.channel_state(0), ChannelState::default());
    }

    /// The voice `allocate` must pick, worked out from scratch over the
    /// voice table: first free, else first one already on this note, else
    /// the first lowest score, leaving percussion alone while anything else
    /// is playing.
    fn expected_voice(drv: &OplDriver, channel: u8, note: u8) -> usize {
        let rate = drv.sample_rate() as u64;
        let usable: Vec<usize> = (0..NUM_CHANNELS)
            .filter(|&i| drv.opl3 || matches!(i / 9, 0 | 2))
            .collect();
        if let Some(&i) = usable.iter().find(|&&i| !drv.voices[i].active) {
            return i;
        }
        if let Some(&i) = usable.iter().find(|&&i| {
            let v = &drv.voices[i];
            v.channel == channel && v.note == note
        }) {
            return i;
        }
        let score = |i: usize| {
            let v = &drv.voices[i];
            v.velocity as u64 * 10 + (drv.clock - v.started) / rate
        };
        let melodic: Vec<usize> = usable
            .iter()
            .copied()
            .filter(|&i| drv.voices[i].channel != PERCUSSION_CHANNEL)
            .collect();
        let pool = if melodic.is_empty() { &usable } else { &melodic };
        let lowest = pool.iter().map(|&i| score(i)).min().unwrap();
        pool.iter().copied().find(|&i| score(i) == lowest).unwrap()
    }

    fn random_allocation(opl3: bool, seed: u64) {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(seed);
        let mut drv = OplDriver::new(44100, opl3);
        let usable = if opl3 { NUM_CHANNELS } else { NUM_CHANNELS / 2 };
        let mut held: Vec<(u8, u8)> = Vec::new();
        let mut steals = 0;

        for step in 0..3000 {
            // Time passes on the driver's own clock
            drv.clock += rng.random_range(0..3 * 44100u64 / 4);

            if held.is_empty() || rng.random_bool(0.75) {
                // Drums show up often so they get stolen too
                let channel = if rng.random_bool(0.3) {
                    PERCUSSION_CHANNEL
                } else {
                    rng.random_range(0..MIDI_CHANNELS as u8)
                };
                let note = rng.random_range(35..82);
                let velocity = rng.random_range(1..128);

                let expected = expected_voice(&drv, channel, note);
                if drv.active_voices() == usable {
                    steals += 1;
                }
                drv.note_on(channel, note, velocity);
                held.push((channel, note));

                let v = drv.voices[expected];
                assert!(v.active, "step {step}");
                assert_eq!(
                    (v.channel, v.note, v.velocity, v.started),
                    (channel, note, velocity, drv.clock),
                    "step {step}: expected voice {expected}"
                );
            } else {
                let (channel, note) = held.swap_remove(rng.random_range(0..held.len()));
                drv.note_off(channel, note);
            }

            let mut seen = [false; NUM_CHANNELS];
            for (voice, _, _) in drv.active_notes() {
                assert!(!seen[voice], "step {step}: voice {voice} listed twice");
                seen[voice] = true;
                assert!(drv.usable(voice), "step {step}: voice {voice} is not wired");
            }
            assert!(drv.active_voices() <= usable);
        }
        assert!(steals > 100, "only {steals} steals");
    }

    #[test]
    fn random_notes_opl3() {
        for seed in [1, 7, 0x5eed] {
            random_allocation(true, seed);
        }
    }

    #[test]
    fn random_notes_opl2() {
        for seed in [2, 11, 0xface] {
            random_allocation(false, seed);
        }
    }
}
