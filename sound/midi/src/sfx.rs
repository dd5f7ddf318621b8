//! Sound effects decoded from WAV data into the session's frame layout.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use hound::{SampleFormat, WavReader};
use log::{debug, warn};

use crate::error::SessionError;

#[derive(Debug, Clone)]
pub struct SfxSample {
    name: String,
    /// Interleaved in the bank's channel count
    data: Arc<[i16]>,
}

impl SfxSample {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Arc<[i16]> {
        &self.data
    }
}

/// Decoded effects, all converted to one channel count. Sample rates are
/// not converted.
#[derive(Debug, Clone)]
pub struct SfxBank {
    sample_rate: u32,
    channels: usize,
    samples: Vec<SfxSample>,
}

impl SfxBank {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.clamp(1, 2),
            samples: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&SfxSample> {
        self.samples.get(id)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.samples.iter().position(|s| s.name == name)
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<usize, SessionError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| SessionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.load_bytes(&name, &bytes)
    }

    /// Decodes an 8 or 16-bit PCM WAV image and returns the new effect id
    pub fn load_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<usize, SessionError> {
        let mut reader = WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();
        let unsupported = |format| SessionError::UnsupportedSfx {
            name: name.to_string(),
            bits: spec.bits_per_sample,
            format,
        };
        let raw: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
            (SampleFormat::Int, 8) => reader
                .samples::<i8>()
                .map(|s| s.map(|s| (s as i16) << 8))
                .collect::<Result<_, _>>()?,
            (SampleFormat::Int, _) => return Err(unsupported("integer")),
            (SampleFormat::Float, _) => return Err(unsupported("float")),
        };

        if spec.sample_rate != self.sample_rate {
            warn!(
                "Sound effect '{name}' is {} Hz, playing it at {} Hz",
                spec.sample_rate, self.sample_rate
            );
        }

        let src = spec.channels.max(1) as usize;
        let data: Vec<i16> = raw
            .chunks_exact(src)
            .flat_map(|frame| {
                let left = frame[0];
                let right = frame[src.min(2) - 1];
                match self.channels {
                    1 => vec![((left as i32 + right as i32) / 2) as i16],
                    _ => vec![left, right],
                }
            })
            .collect();

        debug!(
            "Loaded sound effect '{name}', {} frames",
            data.len() / self.channels
        );
        self.samples.push(SfxSample {
            name: name.to_string(),
            data: data.into(),
        });
        Ok(self.samples.len() - 1)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    /// In-memory 16-bit WAV image
    pub(crate) fn wav_bytes(channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut buf = Vec::new();
        let spec = WavSpec {
            channels,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
        buf
    }

    #[test]
    fn mono_to_stereo() {
        let mut bank = SfxBank::new(44100, 2);
        let id = bank.load_bytes("beep", &wav_bytes(1, &[100, -200, 300])).unwrap();
        assert_eq!(id, 0);
        assert_eq!(&bank.get(id).unwrap().data()[..], &[100, 100, -200, -200, 300, 300]);
        assert_eq!(bank.find("beep"), Some(0));
        assert_eq!(bank.find("boop"), None);
    }

    #[test]
    fn stereo_to_mono() {
        let mut bank = SfxBank::new(44100, 1);
        let id = bank.load_bytes("pair", &wav_bytes(2, &[100, 300, -10, -30])).unwrap();
        assert_eq!(&bank.get(id).unwrap().data()[..], &[200, -20]);
    }

    #[test]
    fn eight_bit_is_widened() {
        let mut buf = Vec::new();
        let spec = WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 8,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
        for s in [64i8, -64] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let mut bank = SfxBank::new(44100, 2);
        let id = bank.load_bytes("low", &buf).unwrap();
        assert_eq!(&bank.get(id).unwrap().data()[..], &[64 << 8, -64 << 8]);
    }

    #[test]
    fn rejects_float_and_garbage() {
        let mut buf = Vec::new();
        let spec = WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        let mut bank = SfxBank::new(44100, 2);
        assert!(matches!(
            bank.load_bytes("float", &buf),
            Err(SessionError::UnsupportedSfx { bits: 32, .. })
        ));
        assert!(matches!(
            bank.load_bytes("junk", b"not a wav file"),
            Err(SessionError::Wav(_))
        ));
        assert!(bank.is_empty());
    }

    #[test]
    fn missing_file() {
        let mut bank = SfxBank::new(44100, 2);
        assert!(matches!(
            bank.load_file("/nonexistent/opl-midi/missing.wav"),
            Err(SessionError::Io { .. })
        ));
    }
}
