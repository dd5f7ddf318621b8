//! Standard MIDI File chunk loader and variable-length quantities.
//!
//! Only the `MThd` header and the `MTrk` chunk boundaries are validated here.
//! Events are decoded lazily by the sequencer as playback reaches them.

use std::ops::Range;
use std::path::Path;

use log::{info, warn};

use crate::error::MidiError;

pub const MAX_TRACKS: usize = 100;

const HEADER_MAGIC: &[u8; 4] = b"MThd";
const TRACK_MAGIC: &[u8; 4] = b"MTrk";
const HEADER_LEN: u32 = 6;

/// A loaded file. Track events stay in their encoded form inside `data`.
#[derive(Debug, Clone)]
pub struct MidiFile {
    data: Vec<u8>,
    format: u16,
    division: u16,
    tracks: Vec<Range<usize>>,
}

impl MidiFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MidiError> {
        let data = std::fs::read(path.as_ref())?;
        let file = Self::parse(data)?;
        info!(
            "MIDI file loaded: {}, format {}, {} tracks, division {}",
            path.as_ref().display(),
            file.format,
            file.tracks.len(),
            file.division
        );
        Ok(file)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self, MidiError> {
        if data.get(..4) != Some(HEADER_MAGIC.as_slice()) {
            return Err(MidiError::BadHeaderMagic);
        }
        let header_len = read_u32(&data, 4).ok_or(MidiError::BadHeaderLength(0))?;
        if header_len != HEADER_LEN {
            return Err(MidiError::BadHeaderLength(header_len));
        }
        let (Some(format), Some(count), Some(division)) =
            (read_u16(&data, 8), read_u16(&data, 10), read_u16(&data, 12))
        else {
            return Err(MidiError::BadHeaderLength(header_len));
        };

        let count = count as usize;
        if count > MAX_TRACKS {
            return Err(MidiError::TooManyTracks(count));
        }
        if division == 0 {
            return Err(MidiError::ZeroDivision);
        }

        let mut tracks = Vec::with_capacity(count);
        let mut pos = 14;
        for track in 0..count {
            let magic = data.get(pos..pos + 4).ok_or(MidiError::TruncatedTrack(track))?;
            if magic != TRACK_MAGIC.as_slice() {
                return Err(MidiError::BadTrackMagic(track));
            }
            let len = read_u32(&data, pos + 4).ok_or(MidiError::TruncatedTrack(track))? as usize;
            let start = pos + 8;
            let mut end = start.saturating_add(len);
            if end > data.len() {
                warn!(
                    "Track {track} declares {len} bytes but only {} remain",
                    data.len() - start
                );
                end = data.len();
            }
            tracks.push(start..end);
            pos = end;
        }

        Ok(Self {
            data,
            format,
            division,
            tracks,
        })
    }

    pub fn format(&self) -> u16 {
        self.format
    }

    /// Ticks per quarter note
    pub fn division(&self) -> u16 {
        self.division
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Byte range of each track body within `data`
    pub fn tracks(&self) -> &[Range<usize>] {
        &self.tracks
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decodes a variable-length quantity at `*pos`, stopping at `end`.
///
/// Running out of data mid-value returns what was accumulated so far, and
/// nothing at all reads as 0.
pub fn read_var_len(data: &[u8], pos: &mut usize, end: usize) -> u32 {
    let end = end.min(data.len());
    let mut value = 0u32;
    while *pos < end {
        let byte = data[*pos];
        *pos += 1;
        value = (value << 7) | (byte & 0x7f) as u32;
        if byte & 0x80 == 0 {
            break;
        }
    }
    value
}

/// Encodes `value` as a variable-length quantity. Only the low 28 bits are
/// representable in the four bytes MIDI allows.
pub fn encode_var_len(value: u32) -> Vec<u8> {
    let value = value & 0x0fff_ffff;
    let mut out = vec![(value & 0x7f) as u8];
    let mut rest = value >> 7;
    while rest > 0 {
        out.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    out.reverse();
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds an in-memory SMF from encoded track bodies
    pub(crate) fn smf(format: u16, division: u16, tracks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&division.to_be_bytes());
        for body in tracks {
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    /// Track body builder, events are appended with their delta time
    #[derive(Default)]
    pub(crate) struct Track(pub Vec<u8>);

    impl Track {
        pub(crate) fn event(mut self, delta: u32, bytes: &[u8]) -> Self {
            self.0.extend(encode_var_len(delta));
            self.0.extend_from_slice(bytes);
            self
        }

        pub(crate) fn meta(mut self, delta: u32, kind: u8, payload: &[u8]) -> Self {
            self.0.extend(encode_var_len(delta));
            self.0.extend_from_slice(&[0xff, kind]);
            self.0.extend(encode_var_len(payload.len() as u32));
            self.0.extend_from_slice(payload);
            self
        }

        pub(crate) fn text(self, delta: u32, text: &str) -> Self {
            self.meta(delta, 0x01, text.as_bytes())
        }

        pub(crate) fn tempo(self, delta: u32, micros: u32) -> Self {
            self.meta(delta, 0x51, &micros.to_be_bytes()[1..])
        }

        pub(crate) fn end(self, delta: u32) -> Vec<u8> {
            self.meta(delta, 0x2f, &[]).0
        }
    }

    #[test]
    fn var_len_known_values() {
        let cases: [(u32, &[u8]); 8] = [
            (0x00, &[0x00]),
            (0x40, &[0x40]),
            (0x7f, &[0x7f]),
            (0x80, &[0x81, 0x00]),
            (0x2000, &[0xc0, 0x00]),
            (0x3fff, &[0xff, 0x7f]),
            (0x10_0000, &[0xc0, 0x80, 0x00]),
            (0x0fff_ffff, &[0xff, 0xff, 0xff, 0x7f]),
        ];
        for (value, bytes) in cases {
            assert_eq!(encode_var_len(value), bytes);
            let mut pos = 0;
            assert_eq!(read_var_len(bytes, &mut pos, bytes.len()), value);
            assert_eq!(pos, bytes.len());
        }
    }

    #[test]
    fn var_len_round_trip() {
        let mut value = 1u32;
        while value <= 0x0fff_ffff {
            for v in [value - 1, value, value + 1] {
                let bytes = encode_var_len(v);
                let mut pos = 0;
                assert_eq!(read_var_len(&bytes, &mut pos, bytes.len()), v & 0x0fff_ffff);
            }
            value <<= 1;
        }
    }

    #[test]
    fn var_len_truncated() {
        let mut pos = 0;
        assert_eq!(read_var_len(&[], &mut pos, 0), 0);
        // Continuation bit set on the last byte available
        let data = [0x81, 0x82];
        let mut pos = 0;
        assert_eq!(read_var_len(&data, &mut pos, data.len()), (1 << 7) | 2);
        assert_eq!(pos, 2);
        // Stops at the range end even when more data follows
        let data = [0x81, 0x00];
        let mut pos = 0;
        assert_eq!(read_var_len(&data, &mut pos, 1), 1);
    }

    #[test]
    fn parse_tracks() {
        let a = Track::default().event(0, &[0x90, 60, 100]).end(10);
        let b = Track::default().end(0);
        let file = MidiFile::parse(smf(1, 480, &[a.clone(), b.clone()])).unwrap();
        assert_eq!(file.format(), 1);
        assert_eq!(file.division(), 480);
        assert_eq!(file.track_count(), 2);
        assert_eq!(file.tracks()[0], 22..22 + a.len());
        assert_eq!(file.tracks()[1].len(), b.len());
        assert_eq!(&file.data()[file.tracks()[0].clone()], a.as_slice());
    }

    #[test]
    fn header_errors() {
        assert!(matches!(
            MidiFile::parse(b"RIFF....".to_vec()),
            Err(MidiError::BadHeaderMagic)
        ));
        assert!(matches!(MidiFile::parse(Vec::new()), Err(MidiError::BadHeaderMagic)));

        let mut data = smf(0, 96, &[]);
        data[7] = 8;
        assert!(matches!(
            MidiFile::parse(data),
            Err(MidiError::BadHeaderLength(8))
        ));

        let data = smf(0, 0, &[]);
        assert!(matches!(MidiFile::parse(data), Err(MidiError::ZeroDivision)));

        let mut data = smf(1, 96, &[]);
        data[10..12].copy_from_slice(&101u16.to_be_bytes());
        assert!(matches!(
            MidiFile::parse(data),
            Err(MidiError::TooManyTracks(101))
        ));
    }

    #[test]
    fn track_errors() {
        let mut data = smf(0, 96, &[Track::default().end(0)]);
        data[14..18].copy_from_slice(b"MTrx");
        assert!(matches!(MidiFile::parse(data), Err(MidiError::BadTrackMagic(0))));

        // Declares two tracks but only carries one
        let mut data = smf(1, 96, &[Track::default().end(0)]);
        data[10..12].copy_from_slice(&2u16.to_be_bytes());
        assert!(matches!(MidiFile::parse(data), Err(MidiError::TruncatedTrack(1))));
    }

    #[test]
    fn short_track_is_clamped() {
        let mut data = smf(0, 96, &[Track::default().end(0)]);
        let len = data.len();
        data[18..22].copy_from_slice(&1000u32.to_be_bytes());
        let file = MidiFile::parse(data).unwrap();
        assert_eq!(file.tracks()[0], 22..len);
    }
}
