//! A playback session: sequencer, OPL driver and mixer tied together.
//!
//! The music goes through one mixer channel of its own, sound effects each
//! claim another for as long as they play. `render` is the only place audio
//! is produced, so the WAV writer and the real-time callback share the same
//! path through the engine.

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use virtual_mixer::Mixer;

use crate::driver::{OplDriver, DEFAULT_VOLUME_PERCENT};
use crate::error::SessionError;
use crate::sequencer::Sequencer;
use crate::sfx::SfxBank;
use crate::smf::MidiFile;

pub const SAMPLE_RATE: u32 = 44100;
/// Frames produced per render call by the offline converter
pub const AUDIO_BUFFER_FRAMES: usize = 1024;
/// How far ahead of the audio the real-time player dispatches events
pub const PLAYER_LOOKAHEAD: f64 = 0.1;

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub sample_rate: u32,
    /// 1 or 2
    pub channels: usize,
    /// Music output scaling in percent
    pub volume: i32,
    pub normalize: bool,
    /// False restricts the chip to nine channels per core
    pub opl3: bool,
    /// Seconds of events dispatched ahead of the audio clock
    pub lookahead: f64,
    /// Number of times a loop marker pair is honoured, `None` loops forever
    pub loop_limit: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 2,
            volume: DEFAULT_VOLUME_PERCENT,
            normalize: false,
            opl3: true,
            lookahead: 0.0,
            loop_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
struct SfxVoice {
    uid: usize,
    channel: usize,
    data: Arc<[i16]>,
    pos: usize,
}

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    driver: OplDriver,
    sequencer: Option<Sequencer>,
    mixer: Mixer,
    music_channel: usize,
    sfx: SfxBank,
    sfx_voices: Vec<SfxVoice>,
    /// Global effect gain, 0..1
    sfx_volume: f32,
    playing: bool,
    paused: bool,
    /// Plays that ran to the end of the song
    finished: u64,
    /// Driver output, always stereo
    opl: Vec<i16>,
    downmix: Vec<i16>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let config = SessionConfig {
            channels: config.channels.clamp(1, 2),
            ..config
        };
        let mut mixer = Mixer::new(config.sample_rate, config.channels, config.normalize);
        let music_channel = mixer
            .allocate_channel()
            .ok_or(SessionError::NoMixerChannel)?;
        let mut driver = OplDriver::new(config.sample_rate, config.opl3);
        driver.set_volume(config.volume);
        debug!(
            "Session at {} Hz, {} channel(s), {}",
            config.sample_rate,
            config.channels,
            if config.opl3 { "OPL3" } else { "OPL2" }
        );

        Ok(Self {
            sfx: SfxBank::new(config.sample_rate, config.channels),
            config,
            driver,
            sequencer: None,
            mixer,
            music_channel,
            sfx_voices: Vec::new(),
            sfx_volume: 1.0,
            playing: false,
            paused: false,
            finished: 0,
            opl: Vec::new(),
            downmix: Vec::new(),
        })
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn driver(&self) -> &OplDriver {
        &self.driver
    }

    pub fn sequencer(&self) -> Option<&Sequencer> {
        self.sequencer.as_ref()
    }

    /// Replaces the current song. Playback stops until `play` is called.
    pub fn load(&mut self, file: MidiFile) {
        self.stop();
        let mut sequencer = Sequencer::new(file);
        sequencer.set_loop_limit(self.config.loop_limit);
        self.sequencer = Some(sequencer);
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        self.load(MidiFile::open(path)?);
        Ok(())
    }

    /// Starts the loaded song from the top with a silent chip and default
    /// controllers. `repeat` restarts the song whenever it ends.
    pub fn play(&mut self, repeat: bool) {
        let Some(sequencer) = self.sequencer.as_mut() else {
            warn!("Nothing loaded to play");
            return;
        };
        sequencer.rewind();
        sequencer.set_repeat(repeat);
        self.driver.reset();
        self.driver.reset_channels();
        self.playing = true;
        self.paused = false;
        info!("Playing, repeat {}", if repeat { "on" } else { "off" });
    }

    pub fn pause(&mut self) {
        if self.playing {
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Returns true when now paused
    pub fn toggle_pause(&mut self) -> bool {
        if self.paused {
            self.resume();
        } else {
            self.pause();
        }
        self.paused
    }

    /// Silences the chip. The song stays loaded.
    pub fn stop(&mut self) {
        self.playing = false;
        self.paused = false;
        self.driver.reset();
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Counts plays that reached the end of the song on their own. Stays
    /// put on `stop`, so a caller can take it before starting a song and
    /// compare afterwards without having to observe `is_playing` go high.
    pub fn finished_plays(&self) -> u64 {
        self.finished
    }

    /// Seconds of song rendered since `play`
    pub fn play_time(&self) -> f64 {
        self.sequencer.as_ref().map_or(0.0, Sequencer::play_time)
    }

    pub fn volume(&self) -> i32 {
        self.driver.volume()
    }

    pub fn set_volume(&mut self, percent: i32) {
        self.driver.set_volume(percent);
    }

    pub fn normalize(&self) -> bool {
        self.mixer.normalize()
    }

    pub fn set_normalize(&mut self, normalize: bool) {
        self.mixer.set_normalize(normalize);
    }

    pub fn sfx_bank(&self) -> &SfxBank {
        &self.sfx
    }

    pub fn sfx_bank_mut(&mut self) -> &mut SfxBank {
        &mut self.sfx
    }

    /// Global effect gain in percent, clamped to 0..100
    pub fn set_sfx_volume(&mut self, percent: i32) {
        self.sfx_volume = percent.clamp(0, 100) as f32 / 100.0;
    }

    pub fn sfx_volume(&self) -> i32 {
        (self.sfx_volume * 100.0).round() as i32
    }

    /// Starts effect `id` on a fresh mixer channel. `uid` tags the instance
    /// for `stop_sfx`, `volume` is 0..1 and `pan` -1..1. Returns false when
    /// the effect is unknown or no channel is free.
    pub fn start_sfx(&mut self, uid: usize, id: usize, volume: f32, pan: f32) -> bool {
        let Some(sample) = self.sfx.get(id) else {
            warn!("No sound effect with id {id}");
            return false;
        };
        let data = sample.data().clone();
        let Some(channel) = self.mixer.allocate_channel() else {
            warn!("No free mixer channel for sound effect {id}");
            return false;
        };
        self.mixer
            .set_channel_volume(channel, volume * self.sfx_volume, pan);
        self.sfx_voices.push(SfxVoice {
            uid,
            channel,
            data,
            pos: 0,
        });
        true
    }

    pub fn stop_sfx(&mut self, uid: usize) {
        let mixer = &mut self.mixer;
        self.sfx_voices.retain(|v| {
            if v.uid == uid {
                mixer.release_channel(v.channel);
            }
            v.uid != uid
        });
    }

    pub fn stop_sfx_all(&mut self) {
        for voice in self.sfx_voices.drain(..) {
            self.mixer.release_channel(voice.channel);
        }
    }

    pub fn active_sfx(&self) -> usize {
        self.sfx_voices.len()
    }

    /// Fills `out` with interleaved frames in the session's channel layout.
    ///
    /// Returns how many frames of music were generated, 0 when stopped,
    /// paused, or once the song ended before this block. Effects are mixed
    /// in either way and anything not produced is silence.
    pub fn render(&mut self, out: &mut [i16]) -> usize {
        let stride = self.config.channels;
        let frames = out.len() / stride;
        let music = self.render_music(frames);

        self.feed_sfx(frames);
        self.mixer.mix();
        let output = self.mixer.output();
        let n = output.len().min(out.len());
        out[..n].copy_from_slice(&output[..n]);
        out[n..].fill(0);
        self.release_finished_sfx();
        music
    }

    fn render_music(&mut self, frames: usize) -> usize {
        if !self.playing || self.paused {
            return 0;
        }
        let Some(sequencer) = self.sequencer.as_mut() else {
            return 0;
        };
        sequencer.dispatch_due(self.config.lookahead, &mut self.driver);
        if sequencer.is_finished() {
            info!("Playback finished after {:.1} seconds", sequencer.play_time());
            self.playing = false;
            self.finished += 1;
            return 0;
        }

        self.opl.resize(frames * 2, 0);
        self.driver.generate(frames, &mut self.opl);
        if self.config.channels == 1 {
            self.downmix.clear();
            self.downmix.extend(
                self.opl
                    .chunks_exact(2)
                    .map(|f| ((f[0] as i32 + f[1] as i32) / 2) as i16),
            );
            self.mixer.write_channel(self.music_channel, &self.downmix);
        } else {
            self.mixer.write_channel(self.music_channel, &self.opl);
        }

        sequencer.elapse(frames as f64 / self.config.sample_rate as f64);
        frames
    }

    fn feed_sfx(&mut self, frames: usize) {
        let len = frames * self.config.channels;
        for voice in &mut self.sfx_voices {
            let end = (voice.pos + len).min(voice.data.len());
            self.mixer.write_channel(voice.channel, &voice.data[voice.pos..end]);
            voice.pos = end;
        }
    }

    fn release_finished_sfx(&mut self) {
        let mixer = &mut self.mixer;
        self.sfx_voices.retain(|v| {
            let done = v.pos >= v.data.len();
            if done {
                mixer.release_channel(v.channel);
            }
            !done
        });
    }
}
