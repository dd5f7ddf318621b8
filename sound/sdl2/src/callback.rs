use std::sync::Arc;

use log::info;
use opl_midi::SharedSession;
use opl_midi::session::AUDIO_BUFFER_FRAMES;
use sdl2::AudioSubsystem;
use sdl2::audio::{AudioCallback, AudioDevice, AudioSpecDesired};

/// Pulls each device buffer straight out of the session. A poisoned lock
/// plays silence.
pub struct SessionCallback {
    session: SharedSession,
}

impl AudioCallback for SessionCallback {
    type Channel = i16;

    fn callback(&mut self, out: &mut [i16]) {
        if let Ok(mut session) = self.session.lock() {
            session.render(out);
        } else {
            out.fill(0);
        }
    }
}

/// Opens a paused playback device matching the session's rate and channel
/// count. SDL converts if the hardware wants something else.
pub fn open_playback(
    audio: &AudioSubsystem,
    session: &SharedSession,
) -> Result<AudioDevice<SessionCallback>, String> {
    let (freq, channels) = {
        let session = session.lock().map_err(|e| e.to_string())?;
        (
            session.config().sample_rate as i32,
            session.config().channels as u8,
        )
    };
    let desired_spec = AudioSpecDesired {
        freq: Some(freq),
        channels: Some(channels),
        samples: Some(AUDIO_BUFFER_FRAMES as u16),
    };

    let callback_session = Arc::clone(session);
    audio.open_playback(None, &desired_spec, |spec| {
        info!(
            "Audio device opened: {} Hz, {} channel(s), {} sample buffer",
            spec.freq, spec.channels, spec.samples
        );
        SessionCallback {
            session: callback_session,
        }
    })
}
