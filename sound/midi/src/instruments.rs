//! FM patch definitions and the General MIDI bank lookups.

use crate::gm_bank::GM_BANK;

/// Number of melodic programs at the start of the bank
pub const MELODIC_COUNT: usize = 128;
/// Total patches, melodic plus percussion
pub const INSTRUMENT_COUNT: usize = 181;
/// Bank index of the first percussion patch
pub const PERCUSSION_BASE: usize = MELODIC_COUNT;
/// GM key number of the first percussion patch (Acoustic Bass Drum)
pub const PERCUSSION_FIRST_KEY: u8 = 35;

/// One two-operator FM patch.
///
/// `mod_char` and `car_char` hold the values for registers 0x20, 0x40, 0x60,
/// 0x80 and 0xE0 of the modulator and carrier. `fb_conn` is the 0xC0 value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmInstrument {
    pub name: &'static str,
    pub mod_char: [u8; 5],
    pub car_char: [u8; 5],
    pub fb_conn: u8,
    /// Fixed key for drums, 0 plays the incoming note
    pub perc_note: u8,
}

impl FmInstrument {
    pub const fn new(
        name: &'static str,
        mod_char: [u8; 5],
        car_char: [u8; 5],
        fb_conn: u8,
        perc_note: u8,
    ) -> Self {
        Self {
            name,
            mod_char,
            car_char,
            fb_conn,
            perc_note,
        }
    }

    /// Modulator total level, 0 loudest to 63 silent
    pub fn mod_level(&self) -> u8 {
        self.mod_char[1] & 0x3f
    }

    pub fn car_level(&self) -> u8 {
        self.car_char[1] & 0x3f
    }
}

/// Read-only view over a patch table laid out as 128 melodic programs
/// followed by percussion keyed from note 35.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentBank {
    patches: &'static [FmInstrument],
}

impl Default for InstrumentBank {
    fn default() -> Self {
        Self::general_midi()
    }
}

impl InstrumentBank {
    /// The built-in 181 patch General MIDI bank
    pub fn general_midi() -> Self {
        Self { patches: &GM_BANK }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Patch by bank index, anything out of range gives patch 0
    pub fn get(&self, index: usize) -> &FmInstrument {
        self.patches
            .get(index)
            .unwrap_or(&self.patches[0])
    }

    /// Bank index for a program number. Programs past the end fall back to 0.
    /// Values 128 and up are reachable through `instrument=N` text events.
    pub fn melodic_index(&self, program: u8) -> usize {
        let index = program as usize;
        if index < self.patches.len() { index } else { 0 }
    }

    /// Bank index for a percussion key, `128 + note - 35`. Keys outside the
    /// percussion range fall back to the first drum.
    pub fn percussion_index(&self, note: u8) -> usize {
        match (note as usize + PERCUSSION_BASE).checked_sub(PERCUSSION_FIRST_KEY as usize) {
            Some(index) if index >= PERCUSSION_BASE && index < self.patches.len() => index,
            _ => PERCUSSION_BASE,
        }
    }

    pub fn melodic(&self, program: u8) -> &FmInstrument {
        self.get(self.melodic_index(program))
    }

    pub fn percussion(&self, note: u8) -> &FmInstrument {
        self.get(self.percussion_index(note))
    }
}
