use thiserror::Error;

/// Failures while loading a Standard MIDI File. Anything past the chunk
/// headers is decoded best-effort and never produces an error.
#[derive(Debug, Error)]
pub enum MidiError {
    #[error("could not read MIDI data: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a MIDI file, missing MThd")]
    BadHeaderMagic,
    #[error("MIDI header length is {0}, expected 6")]
    BadHeaderLength(u32),
    #[error("{0} tracks, at most {max} are supported", max = crate::smf::MAX_TRACKS)]
    TooManyTracks(usize),
    #[error("track {0} does not start with MTrk")]
    BadTrackMagic(usize),
    #[error("track {0} header is cut short")]
    TruncatedTrack(usize),
    #[error("time division is zero")]
    ZeroDivision,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Midi(#[from] MidiError),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("sound effect '{name}' is {bits}-bit {format}, only 8 or 16-bit PCM is supported")]
    UnsupportedSfx {
        name: String,
        bits: u16,
        format: &'static str,
    },
    #[error("no free mixer channel")]
    NoMixerChannel,
    #[error("session lock poisoned by a panicked audio thread")]
    Poisoned,
}
