//! SDL2 sound server for the OPL MIDI engine
//!
//! The server owns a [`SharedSession`] that the SDL audio thread renders
//! from. Every request arrives as a [`SoundAction`] on the server's channel
//! and is applied under the session lock between two device callbacks, so a
//! foreground thread never touches chip or mixer state directly.
//!
//! Sound effects are addressed by their id in the session's
//! [`opl_midi::SfxBank`], music by a loaded [`MidiFile`].

use std::error::Error;
use std::path::Path;
use std::sync::mpsc::{Receiver, Sender, channel};

use log::{info, warn};
use opl_midi::{MidiFile, Session, SessionConfig, SessionError, SharedSession};
use sdl2::AudioSubsystem;
use sdl2::audio::AudioDevice;
use sound_traits::{InitResult, SoundAction, SoundServer, SoundServerTic};

use crate::callback::{SessionCallback, open_playback};

mod callback;
#[cfg(test)]
mod test_sdl2;

pub type SndServerRx = Receiver<SoundAction<usize, MidiFile>>;
pub type SndServerTx = Sender<SoundAction<usize, MidiFile>>;

pub struct Snd {
    _audio: AudioSubsystem,
    device: AudioDevice<SessionCallback>,
    session: SharedSession,
    rx: SndServerRx,
    tx: SndServerTx,
}

unsafe impl Send for Snd {}

impl Snd {
    pub fn new(audio: AudioSubsystem, config: SessionConfig) -> Result<Self, Box<dyn Error>> {
        let session = Session::new(config)?.shared();
        let device = open_playback(&audio, &session)?;
        info!("Using sound driver: {}", audio.current_audio_driver());
        device.resume();

        let (tx, rx) = channel();
        Ok(Self {
            _audio: audio,
            device,
            session,
            rx,
            tx,
        })
    }

    /// The session the device renders from, for status queries
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Decodes a WAV file into the effect bank and returns its id
    pub fn load_sfx(&mut self, path: impl AsRef<Path>) -> Result<usize, SessionError> {
        let mut session = self.session.lock().map_err(|_| SessionError::Poisoned)?;
        session.sfx_bank_mut().load_file(path)
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        match self.session.lock() {
            Ok(mut session) => Some(f(&mut session)),
            Err(_) => {
                warn!("Sound session lock poisoned, request dropped");
                None
            }
        }
    }
}

impl SoundServer<usize, MidiFile, SessionError> for Snd {
    fn init(&mut self) -> InitResult<usize, MidiFile, SessionError> {
        Ok(self.tx.clone())
    }

    fn start_sound(&mut self, uid: usize, sfx: usize, volume: f32, pan: f32) {
        self.with_session(|s| {
            // One sound per owner
            s.stop_sfx(uid);
            s.start_sfx(uid, sfx, volume, pan)
        });
    }

    fn stop_sound(&mut self, uid: usize) {
        self.with_session(|s| s.stop_sfx(uid));
    }

    fn stop_sound_all(&mut self) {
        self.with_session(Session::stop_sfx_all);
    }

    fn set_sfx_volume(&mut self, volume: i32) {
        self.with_session(|s| s.set_sfx_volume(volume));
    }

    fn get_sfx_volume(&mut self) -> i32 {
        self.with_session(|s| s.sfx_volume()).unwrap_or_default()
    }

    fn start_music(&mut self, music: MidiFile, looping: bool) {
        self.with_session(|s| {
            s.load(music);
            s.play(looping);
        });
    }

    fn pause_music(&mut self) {
        self.with_session(Session::pause);
    }

    fn resume_music(&mut self) {
        self.with_session(Session::resume);
    }

    fn change_music(&mut self, music: MidiFile, looping: bool) {
        self.stop_music();
        self.start_music(music, looping);
    }

    fn stop_music(&mut self) {
        self.with_session(Session::stop);
    }

    fn set_mus_volume(&mut self, volume: i32) {
        self.with_session(|s| s.set_volume(volume));
    }

    fn get_mus_volume(&mut self) -> i32 {
        self.with_session(|s| s.volume()).unwrap_or_default()
    }

    fn set_normalize(&mut self, normalize: bool) {
        self.with_session(|s| s.set_normalize(normalize));
    }

    fn update_self(&mut self) {}

    fn get_rx(&mut self) -> &mut SndServerRx {
        &mut self.rx
    }

    fn shutdown_sound(&mut self) {
        info!("Shutdown sound server");
        self.stop_sound_all();
        self.stop_music();
        self.device.pause();
    }
}

impl SoundServerTic<usize, MidiFile, SessionError> for Snd {}
