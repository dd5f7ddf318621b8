//! General MIDI playback on an emulated OPL3.
//!
//! [`MidiFile`] loads a Standard MIDI File, [`Sequencer`] walks its tracks
//! on the song clock and hands decoded events to an [`EventSink`]. The
//! [`OplDriver`] is the sink that turns them into chip register writes using
//! the built-in 181 patch [`InstrumentBank`]. A [`Session`] ties these to a
//! [`virtual_mixer::Mixer`] together with any sound effects, and produces
//! the final interleaved 16-bit frames for either a [`WavSink`] or a
//! real-time audio callback.
//!
//! ```no_run
//! use opl_midi::{render_to_wav, Session, SessionConfig};
//!
//! let mut session = Session::new(SessionConfig::default())?;
//! session.load_file("song.mid")?;
//! session.play(false);
//! let session = session.shared();
//! render_to_wav(&session, "song.wav", |secs| println!("{secs:.0}"))?;
//! # Ok::<(), opl_midi::SessionError>(())
//! ```

pub mod driver;
pub mod error;
mod gm_bank;
pub mod instruments;
pub mod sequencer;
pub mod session;
pub mod sfx;
pub mod smf;
pub mod wav;

pub use driver::{ChannelState, OplDriver};
pub use error::{MidiError, SessionError};
pub use instruments::{FmInstrument, InstrumentBank};
pub use sequencer::{EventSink, MidiEvent, Sequencer};
pub use session::{Session, SessionConfig, SharedSession};
pub use sfx::SfxBank;
pub use smf::MidiFile;
pub use wav::{render_to_wav, WavSink};
