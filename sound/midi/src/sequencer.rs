//! Tempo-driven event scheduler over the tracks of a [`MidiFile`].
//!
//! Each track keeps a byte cursor, the ticks left until its next event and
//! its running status. A scheduling step dispatches every event that is due,
//! then advances all tracks by the smallest remaining delay and converts
//! those ticks to seconds of wait using the current tempo.
//!
//! The text markers `loopStart` and `loopEnd` save and restore a snapshot of
//! every track cursor. `volume=N` and `instrument=N` text events are applied
//! to the last channel the track addressed.

use log::{debug, trace, warn};

use crate::smf::{MidiFile, read_var_len};

/// Microseconds per quarter note until a tempo event says otherwise (120 BPM)
pub const DEFAULT_TEMPO: u32 = 500_000;
/// Scheduling steps allowed in one `advance` call before giving up on the
/// block. Protects against loops that take no time.
pub const MAX_STEPS_PER_ADVANCE: usize = 10_000;
/// Longest text event examined for markers
const MAX_TEXT_LEN: usize = 255;

const META_EVENT: u8 = 0xff;
const META_TEXT: u8 = 0x01;
const META_END_OF_TRACK: u8 = 0x2f;
const META_TEMPO: u8 = 0x51;

/// A channel voice message, with `instrument=N`/`volume=N` text events
/// translated into program and controller changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOff { channel: u8, note: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit value, 8192 is centre
    PitchBend { channel: u8, value: u16 },
}

impl MidiEvent {
    pub fn channel(&self) -> u8 {
        match *self {
            MidiEvent::NoteOff { channel, .. }
            | MidiEvent::NoteOn { channel, .. }
            | MidiEvent::PolyPressure { channel, .. }
            | MidiEvent::Controller { channel, .. }
            | MidiEvent::ProgramChange { channel, .. }
            | MidiEvent::ChannelPressure { channel, .. }
            | MidiEvent::PitchBend { channel, .. } => channel,
        }
    }
}

/// Whatever turns decoded events into sound
pub trait EventSink {
    fn handle_event(&mut self, event: MidiEvent);
}

impl EventSink for Vec<MidiEvent> {
    fn handle_event(&mut self, event: MidiEvent) {
        self.push(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackCursor {
    pos: usize,
    end: usize,
    /// Ticks until the next event
    delay: u64,
    /// Last channel voice status, reused for running status
    status: Option<u8>,
    /// Channel of the last channel voice event, target of text commands
    channel: u8,
    ended: bool,
}

impl TrackCursor {
    fn new(data: &[u8], start: usize, end: usize) -> Self {
        let mut pos = start;
        let delay = read_var_len(data, &mut pos, end) as u64;
        Self {
            pos,
            end,
            delay,
            status: None,
            channel: 0,
            ended: pos >= end,
        }
    }

    fn is_active(&self) -> bool {
        !self.ended
    }

    fn read_byte(&mut self, data: &[u8]) -> Option<u8> {
        if self.pos >= self.end {
            return None;
        }
        let byte = data[self.pos];
        self.pos += 1;
        Some(byte)
    }

    fn skip(&mut self, len: usize) {
        self.pos = self.pos.saturating_add(len).min(self.end);
    }
}

/// Track state saved by a `loopStart` marker
#[derive(Debug, Clone, PartialEq)]
struct LoopPoint {
    tracks: Vec<TrackCursor>,
    playwait: f64,
    tempo: u32,
}

#[derive(Debug, Clone)]
pub struct Sequencer {
    file: MidiFile,
    tracks: Vec<TrackCursor>,
    tempo: u32,
    /// Seconds until the next scheduling step is due
    playwait: f64,
    play_time: f64,
    loop_start: bool,
    loop_end: bool,
    loop_point: Option<LoopPoint>,
    /// Marker loops taken so far and the allowed maximum, `None` is unlimited
    loops_taken: u32,
    loop_limit: Option<u32>,
    /// Restart from the top when the song ends without a loop marker
    repeat: bool,
    finished: bool,
}

impl Sequencer {
    pub fn new(file: MidiFile) -> Self {
        let mut seq = Self {
            tracks: Vec::new(),
            file,
            tempo: DEFAULT_TEMPO,
            playwait: 0.0,
            play_time: 0.0,
            loop_start: false,
            loop_end: false,
            loop_point: None,
            loops_taken: 0,
            loop_limit: None,
            repeat: false,
            finished: false,
        };
        seq.rewind();
        seq
    }

    /// Back to the first event of every track with the default tempo
    pub fn rewind(&mut self) {
        let data = self.file.data();
        self.tracks = self
            .file
            .tracks()
            .iter()
            .map(|r| TrackCursor::new(data, r.start, r.end))
            .collect();
        self.tempo = DEFAULT_TEMPO;
        self.playwait = 0.0;
        self.play_time = 0.0;
        self.loop_start = false;
        self.loop_end = false;
        self.loop_point = None;
        self.loops_taken = 0;
        self.finished = self.tracks.iter().all(|t| t.ended);
    }

    pub fn file(&self) -> &MidiFile {
        &self.file
    }

    /// Microseconds per quarter note
    pub fn tempo(&self) -> u32 {
        self.tempo
    }

    pub fn playwait(&self) -> f64 {
        self.playwait
    }

    /// Seconds of playback covered by `advance`
    pub fn play_time(&self) -> f64 {
        self.play_time
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_loop_point(&self) -> bool {
        self.loop_point.is_some()
    }

    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    /// How many times `loopEnd` may jump back, `None` for no limit. Once
    /// used up the markers are ignored and the song plays to its end.
    pub fn set_loop_limit(&mut self, limit: Option<u32>) {
        self.loop_limit = limit;
    }

    fn may_loop(&self) -> bool {
        self.loop_limit.is_none_or(|max| self.loops_taken < max)
    }

    /// Converts a tick count to seconds at the current tempo
    pub fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        ticks as f64 * self.tempo as f64 / (self.file.division() as f64 * 1_000_000.0)
    }

    /// Dispatches every event due within `lookahead` seconds, then counts
    /// `elapsed` seconds off the wait.
    pub fn advance(&mut self, elapsed: f64, lookahead: f64, sink: &mut impl EventSink) {
        self.dispatch_due(lookahead, sink);
        self.elapse(elapsed);
    }

    /// Counts generated audio off the wait without dispatching anything
    pub fn elapse(&mut self, seconds: f64) {
        self.play_time += seconds;
        self.playwait -= seconds;
    }

    /// Runs scheduling steps until the next one lies beyond `lookahead`
    pub fn dispatch_due(&mut self, lookahead: f64, sink: &mut impl EventSink) {
        let mut steps = 0;
        while !self.finished && self.playwait <= lookahead {
            self.process_events(sink);
            steps += 1;
            if steps >= MAX_STEPS_PER_ADVANCE {
                warn!("No time passed in {steps} scheduling steps, deferring the rest");
                break;
            }
        }
    }

    /// One scheduling step: dispatch due events, apply loop markers, then
    /// wait for the next event across all tracks.
    pub fn process_events(&mut self, sink: &mut impl EventSink) {
        if self.finished {
            return;
        }
        let snapshot = self.tracks.clone();
        for tk in 0..self.tracks.len() {
            if self.tracks[tk].is_active() && self.tracks[tk].delay == 0 {
                self.handle_event(tk, sink);
            }
        }

        if self.loop_start {
            self.loop_start = false;
            debug!("Loop start saved at {:.3}s", self.play_time);
            self.loop_point = Some(LoopPoint {
                tracks: snapshot,
                playwait: self.playwait,
                tempo: self.tempo,
            });
        } else if self.loop_end {
            self.loop_end = false;
            if self.may_loop() {
                self.restore_loop();
            }
        }

        if self.tracks.iter().all(|t| t.ended) {
            if self.loop_point.is_some() && self.may_loop() {
                self.restore_loop();
            } else if self.repeat {
                debug!("Song ended, repeating");
                let play_time = self.play_time;
                self.rewind();
                self.play_time = play_time;
            } else {
                self.finished = true;
                return;
            }
        }

        let Some(next) = self
            .tracks
            .iter()
            .filter(|t| t.is_active())
            .map(|t| t.delay)
            .min()
        else {
            self.finished = true;
            return;
        };
        for track in self.tracks.iter_mut().filter(|t| t.is_active()) {
            track.delay -= next;
        }
        self.playwait += self.ticks_to_seconds(next);
    }

    fn restore_loop(&mut self) {
        if let Some(point) = &self.loop_point {
            debug!("Loop end, back to the saved point");
            self.tracks.clone_from(&point.tracks);
            self.playwait = point.playwait;
            self.tempo = point.tempo;
            self.loops_taken += 1;
        } else {
            debug!("Loop end without a loop start, ignored");
        }
    }

    /// Decodes one event of track `tk` and reads the following delay
    fn handle_event(&mut self, tk: usize, sink: &mut impl EventSink) {
        let data = self.file.data();
        let track = &mut self.tracks[tk];

        let Some(mut status) = track.read_byte(data) else {
            track.ended = true;
            return;
        };
        if status < 0x80 {
            match track.status {
                Some(running) => {
                    // The byte was data, read it again
                    track.pos -= 1;
                    status = running;
                }
                None => {
                    trace!("Track {tk}: data byte {status:#04x} without a status");
                    Self::next_delay(track, data);
                    return;
                }
            }
        } else if status < 0xf0 {
            track.status = Some(status);
        }

        let channel = status & 0x0f;
        let kind = status & 0xf0;
        if kind < 0xf0 {
            track.channel = channel;
        }

        let event = match kind {
            0x80 | 0x90 | 0xa0 | 0xb0 | 0xe0 => {
                let (Some(d1), Some(d2)) = (track.read_byte(data), track.read_byte(data)) else {
                    track.ended = true;
                    return;
                };
                let (d1, d2) = (d1 & 0x7f, d2 & 0x7f);
                Some(match kind {
                    0x80 => MidiEvent::NoteOff { channel, note: d1 },
                    0x90 if d2 == 0 => MidiEvent::NoteOff { channel, note: d1 },
                    0x90 => MidiEvent::NoteOn {
                        channel,
                        note: d1,
                        velocity: d2,
                    },
                    0xa0 => MidiEvent::PolyPressure {
                        channel,
                        note: d1,
                        pressure: d2,
                    },
                    0xb0 => MidiEvent::Controller {
                        channel,
                        controller: d1,
                        value: d2,
                    },
                    _ => MidiEvent::PitchBend {
                        channel,
                        value: ((d2 as u16) << 7) | d1 as u16,
                    },
                })
            }
            0xc0 | 0xd0 => {
                let Some(d1) = track.read_byte(data) else {
                    track.ended = true;
                    return;
                };
                let d1 = d1 & 0x7f;
                Some(if kind == 0xc0 {
                    MidiEvent::ProgramChange {
                        channel,
                        program: d1,
                    }
                } else {
                    MidiEvent::ChannelPressure {
                        channel,
                        pressure: d1,
                    }
                })
            }
            _ if status == META_EVENT => {
                let Some(kind) = track.read_byte(data) else {
                    track.ended = true;
                    return;
                };
                let len = read_var_len(data, &mut track.pos, track.end) as usize;
                let start = track.pos;
                track.skip(len);
                let payload = &data[start..track.pos];
                match kind {
                    META_END_OF_TRACK => {
                        track.ended = true;
                        return;
                    }
                    META_TEMPO => {
                        let tempo = payload
                            .iter()
                            .take(4)
                            .fold(0u32, |acc, b| (acc << 8) | *b as u32);
                        if tempo > 0 {
                            debug!("Tempo {tempo} us per quarter");
                            self.tempo = tempo;
                        }
                        None
                    }
                    META_TEXT => {
                        let text = &payload[..payload.len().min(MAX_TEXT_LEN)];
                        let channel = track.channel;
                        match text_command(text) {
                            Some(TextCommand::LoopStart) => {
                                self.loop_start = true;
                                None
                            }
                            Some(TextCommand::LoopEnd) => {
                                self.loop_end = true;
                                None
                            }
                            Some(TextCommand::Volume(value)) => Some(MidiEvent::Controller {
                                channel,
                                controller: 7,
                                value,
                            }),
                            Some(TextCommand::Instrument(program)) => {
                                Some(MidiEvent::ProgramChange { channel, program })
                            }
                            None => None,
                        }
                    }
                    _ => {
                        debug!("Track {tk}: skipped meta event {kind:#04x}, {len} bytes");
                        None
                    }
                }
            }
            _ => {
                // Sysex and other system messages carry a length
                let len = read_var_len(data, &mut track.pos, track.end) as usize;
                track.skip(len);
                None
            }
        };

        if let Some(event) = event {
            sink.handle_event(event);
        }
        let track = &mut self.tracks[tk];
        Self::next_delay(track, data);
    }

    fn next_delay(track: &mut TrackCursor, data: &[u8]) {
        if track.pos >= track.end {
            track.ended = true;
            return;
        }
        track.delay += read_var_len(data, &mut track.pos, track.end) as u64;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TextCommand {
    LoopStart,
    LoopEnd,
    Volume(u8),
    Instrument(u8),
}

fn text_command(text: &[u8]) -> Option<TextCommand> {
    let text = std::str::from_utf8(text).ok()?.trim_end_matches('\0');
    match text {
        "loopStart" => return Some(TextCommand::LoopStart),
        "loopEnd" => return Some(TextCommand::LoopEnd),
        _ => {}
    }
    if let Some(value) = text.strip_prefix("volume=") {
        let value: u8 = value.trim().parse().ok()?;
        return (value <= 127).then_some(TextCommand::Volume(value));
    }
    if let Some(value) = text.strip_prefix("instrument=") {
        let value: u8 = value.trim().parse().ok()?;
        return ((value as usize) < crate::instruments::INSTRUMENT_COUNT)
            .then_some(TextCommand::Instrument(value));
    }
    None
}
