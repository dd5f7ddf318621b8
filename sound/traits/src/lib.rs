//! Message protocol between a player front end and its sound server.
//!
//! The front end only holds the `Sender` returned by [`SoundServer::init`].
//! The server lives on its own thread and calls [`SoundServerTic::tic`] in a
//! loop, which applies one queued [`SoundAction`] per call.

use std::fmt::Debug;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// How long one `tic` waits for a request
pub const TIC_TIMEOUT: Duration = Duration::from_micros(500);

/// `S` identifies a sound effect, `M` is a music source, `E` the server's
/// error type
pub type InitResult<S, M, E> = Result<Sender<SoundAction<S, M>>, E>;

pub enum SoundAction<S: Debug + Copy, M: Debug> {
    StartSfx {
        /// Owner of the sound. Starting another sound for the same owner
        /// replaces it, `StopSfx` stops it.
        uid: usize,
        sfx: S,
        /// 0.0 silent to 1.0 full
        volume: f32,
        /// -1.0 left to 1.0 right
        pan: f32,
    },
    StopSfx {
        uid: usize,
    },
    StopSfxAll,
    /// Effects gain in percent
    SfxVolume(i32),
    /// Music gain in percent, 100 leaves the synth output unscaled
    MusicVolume(i32),
    /// Start a song, repeating it when the flag is set
    StartMusic(M, bool),
    PauseMusic,
    ResumeMusic,
    /// Stop the current song and start another
    ChangeMusic(M, bool),
    StopMusic,
    /// Divide the mix by the number of active mixer channels
    Normalize(bool),
    Shutdown,
}

/// Operations a sound backend provides. Implementors also add the one-line
/// `impl SoundServerTic<S, M, E> for Backend {}` to get the request loop.
pub trait SoundServer<S, M, E>
where
    S: Debug + Copy,
    M: Debug,
    E: std::error::Error,
{
    /// Hands out a sender for requests, clone it as needed
    fn init(&mut self) -> InitResult<S, M, E>;

    fn start_sound(&mut self, uid: usize, sfx: S, volume: f32, pan: f32);

    fn stop_sound(&mut self, uid: usize);

    fn stop_sound_all(&mut self);

    fn set_sfx_volume(&mut self, volume: i32);

    fn get_sfx_volume(&mut self) -> i32;

    fn start_music(&mut self, music: M, looping: bool);

    fn pause_music(&mut self);

    fn resume_music(&mut self);

    fn change_music(&mut self, music: M, looping: bool);

    fn stop_music(&mut self);

    fn set_mus_volume(&mut self, volume: i32);

    fn get_mus_volume(&mut self) -> i32;

    fn set_normalize(&mut self, normalize: bool);

    /// Housekeeping run once per `tic`, with or without a request
    fn update_self(&mut self);

    /// The receiving end of the channel handed out by `init`
    fn get_rx(&mut self) -> &mut Receiver<SoundAction<S, M>>;

    /// Silence everything and let go of the output device
    fn shutdown_sound(&mut self);
}

/// The request loop of a [`SoundServer`]
pub trait SoundServerTic<S, M, E>
where
    Self: SoundServer<S, M, E>,
    S: Debug + Copy,
    M: Debug,
    E: std::error::Error,
{
    /// Waits up to [`TIC_TIMEOUT`] for a request and applies it. Returns
    /// false once the server has shut down, either by request or because
    /// every sender is gone.
    fn tic(&mut self) -> bool {
        let running = match self.get_rx().recv_timeout(TIC_TIMEOUT) {
            Ok(action) => self.apply(action),
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => {
                self.shutdown_sound();
                false
            }
        };
        if running {
            self.update_self();
        }
        running
    }

    /// Routes one request to its `SoundServer` method
    fn apply(&mut self, action: SoundAction<S, M>) -> bool {
        match action {
            SoundAction::StartSfx {
                uid,
                sfx,
                volume,
                pan,
            } => self.start_sound(uid, sfx, volume, pan),
            SoundAction::StopSfx { uid } => self.stop_sound(uid),
            SoundAction::StopSfxAll => self.stop_sound_all(),
            SoundAction::SfxVolume(v) => self.set_sfx_volume(v),
            SoundAction::MusicVolume(v) => self.set_mus_volume(v),
            SoundAction::StartMusic(music, looping) => self.start_music(music, looping),
            SoundAction::PauseMusic => self.pause_music(),
            SoundAction::ResumeMusic => self.resume_music(),
            SoundAction::ChangeMusic(music, looping) => self.change_music(music, looping),
            SoundAction::StopMusic => self.stop_music(),
            SoundAction::Normalize(on) => self.set_normalize(on),
            SoundAction::Shutdown => {
                self.shutdown_sound();
                return false;
            }
        }
        true
    }
}
