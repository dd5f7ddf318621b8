//! 16-bit PCM WAV output and the offline render loop.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Mutex;

use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, info};

use crate::error::SessionError;
use crate::session::{Session, AUDIO_BUFFER_FRAMES};

/// Streams samples into a WAV file. The RIFF and data sizes are patched in
/// by `finish`, so a sink dropped early leaves a header claiming no data.
pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
    samples: u64,
}

impl WavSink {
    pub fn create(
        path: impl AsRef<Path>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, SessionError> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)?;
        debug!(
            "Writing {} Hz, {channels} channel WAV to {}",
            sample_rate,
            path.as_ref().display()
        );
        Ok(Self { writer, samples: 0 })
    }

    /// Appends interleaved samples
    pub fn write(&mut self, samples: &[i16]) -> Result<(), SessionError> {
        let mut block = self.writer.get_i16_writer(samples.len() as u32);
        for s in samples {
            block.write_sample(*s);
        }
        block.flush()?;
        self.samples += samples.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    /// Finalises the header and returns the number of samples written
    pub fn finish(self) -> Result<u64, SessionError> {
        self.writer.finalize()?;
        Ok(self.samples)
    }
}

/// Renders a playing session into `path` until the song ends.
///
/// The lock is taken once per block. `progress` gets the song position in
/// seconds after each block is written.
pub fn render_to_wav(
    session: &Mutex<Session>,
    path: impl AsRef<Path>,
    mut progress: impl FnMut(f64),
) -> Result<u64, SessionError> {
    let (sample_rate, channels) = {
        let session = session.lock().map_err(|_| SessionError::Poisoned)?;
        (session.config().sample_rate, session.config().channels)
    };
    let mut sink = WavSink::create(path, sample_rate, channels as u16)?;
    let mut buffer = vec![0i16; AUDIO_BUFFER_FRAMES * channels];

    loop {
        let play_time = {
            let mut session = session.lock().map_err(|_| SessionError::Poisoned)?;
            if !session.is_playing() || session.render(&mut buffer) == 0 {
                break;
            }
            session.play_time()
        };
        sink.write(&buffer)?;
        progress(play_time);
    }

    let samples = sink.finish()?;
    info!(
        "Rendered {:.1} seconds of audio",
        samples as f64 / channels as f64 / sample_rate as f64
    );
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("opl-midi-{}-{name}", std::process::id()))
    }

    #[test]
    fn sink_writes_header_and_data() {
        let path = temp_path("sink.wav");
        let mut sink = WavSink::create(&path, 22050, 2).unwrap();
        sink.write(&[1, -1, 2, -2]).unwrap();
        sink.write(&[3, -3]).unwrap();
        assert_eq!(sink.samples_written(), 6);
        assert_eq!(sink.finish().unwrap(), 6);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        let u32_at = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        let u16_at = |i: usize| u16::from_le_bytes(bytes[i..i + 2].try_into().unwrap());
        assert_eq!(u16_at(20), 1, "PCM");
        assert_eq!(u16_at(22), 2);
        assert_eq!(u32_at(24), 22050);
        assert_eq!(u32_at(28), 22050 * 4);
        assert_eq!(u16_at(34), 16);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(u32_at(40), 12);
        assert_eq!(u32_at(4), 12 + 36);
        assert_eq!(bytes.len(), 44 + 12);
        assert_eq!(i16::from_le_bytes([bytes[46], bytes[47]]), -1);
    }

    #[test]
    fn stopped_session_writes_empty_file() {
        let path = temp_path("empty.wav");
        let session = Mutex::new(Session::new(Default::default()).unwrap());
        let mut calls = 0;
        let samples = render_to_wav(&session, &path, |_| calls += 1).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        std::fs::remove_file(&path).ok();
        assert_eq!(samples, 0);
        assert_eq!(calls, 0);
        assert_eq!(len, 44);
    }
}
