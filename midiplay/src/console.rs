//! Raw-mode keyboard control of a running sound server.

use std::error::Error;
use std::io::Write;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use opl_midi::SharedSession;
use sound_sdl2::SndServerTx;
use sound_traits::SoundAction;

use crate::config::{MAX_VOLUME, MIN_VOLUME, UserConfig, VOLUME_STEP};

/// Effect uids are this plus the key slot, one sound per key
const SFX_UID_BASE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TogglePause,
    VolumeUp,
    VolumeDown,
    ToggleNormalize,
    Sfx(usize),
    Quit,
}

pub fn command_for(code: KeyCode, modifiers: KeyModifiers) -> Option<Command> {
    match code {
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => Some(Command::Quit),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(Command::Quit),
        KeyCode::Char(' ') => Some(Command::TogglePause),
        KeyCode::Char('+') | KeyCode::Char('=') => Some(Command::VolumeUp),
        KeyCode::Char('-') | KeyCode::Char('_') => Some(Command::VolumeDown),
        KeyCode::Char('n') | KeyCode::Char('N') => Some(Command::ToggleNormalize),
        KeyCode::Char(c @ '1'..='9') => Some(Command::Sfx(c as usize - '1' as usize)),
        _ => None,
    }
}

/// True once a play started after `baseline` was taken has run to the end.
/// A panicked audio thread also ends playback.
pub fn song_finished(session: &SharedSession, baseline: u64) -> bool {
    session
        .lock()
        .map(|s| s.finished_plays() > baseline)
        .unwrap_or(true)
}

/// Prints a line in raw mode
fn status(line: &str) {
    print!("{line}\r\n");
    std::io::stdout().flush().ok();
}

/// Reads keys until the song ends or the user quits. `baseline` is the
/// session's `finished_plays` from before the song was sent. The terminal is
/// put back into cooked mode before returning, also on error.
pub fn run(
    tx: &SndServerTx,
    session: &SharedSession,
    baseline: u64,
    config: &mut UserConfig,
    sfx: &[usize],
) -> Result<(), Box<dyn Error>> {
    println!("Controls: space pause/resume, +/- volume, n normalization, q quit");
    if !sfx.is_empty() {
        println!("Keys 1-{} play the loaded sound effects", sfx.len());
    }
    enable_raw_mode()?;
    let result = event_loop(tx, session, baseline, config, sfx);
    disable_raw_mode()?;
    result
}

fn event_loop(
    tx: &SndServerTx,
    session: &SharedSession,
    baseline: u64,
    config: &mut UserConfig,
    sfx: &[usize],
) -> Result<(), Box<dyn Error>> {
    let mut paused = false;

    loop {
        if song_finished(session, baseline) {
            status("Playback finished");
            return Ok(());
        }

        if !event::poll(Duration::from_millis(10))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match command_for(key.code, key.modifiers) {
            Some(Command::Quit) => return Ok(()),
            Some(Command::TogglePause) => {
                paused = !paused;
                if paused {
                    tx.send(SoundAction::PauseMusic)?;
                    status("Paused");
                } else {
                    tx.send(SoundAction::ResumeMusic)?;
                    status("Resumed");
                }
            }
            Some(cmd @ (Command::VolumeUp | Command::VolumeDown)) => {
                let step = if cmd == Command::VolumeUp {
                    VOLUME_STEP
                } else {
                    -VOLUME_STEP
                };
                config.volume = (config.volume + step).clamp(MIN_VOLUME, MAX_VOLUME);
                tx.send(SoundAction::MusicVolume(config.volume))?;
                status(&format!("Volume: {}%", config.volume));
            }
            Some(Command::ToggleNormalize) => {
                config.normalize = !config.normalize;
                tx.send(SoundAction::Normalize(config.normalize))?;
                status(&format!(
                    "Normalization: {}",
                    if config.normalize { "ON" } else { "OFF" }
                ));
            }
            Some(Command::Sfx(slot)) => {
                if let Some(id) = sfx.get(slot) {
                    tx.send(SoundAction::StartSfx {
                        uid: SFX_UID_BASE + slot,
                        sfx: *id,
                        volume: 1.0,
                        pan: 0.0,
                    })?;
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use opl_midi::{MidiFile, Session, SessionConfig};

    use super::*;

    #[test]
    fn empty_song_is_seen_finished() {
        // One track holding only End of Track
        let mut data = b"MThd\0\0\0\x06\0\0\0\x01\0\x60MTrk\0\0\0\x04".to_vec();
        data.extend_from_slice(&[0x00, 0xff, 0x2f, 0x00]);
        let mut session = Session::new(SessionConfig::default()).unwrap();
        session.load(MidiFile::parse(data).unwrap());
        let session = session.shared();

        let baseline = session.lock().unwrap().finished_plays();
        assert!(!song_finished(&session, baseline));

        // Started and ended before anyone looked at `is_playing`
        {
            let mut s = session.lock().unwrap();
            s.play(false);
            let mut buf = vec![0i16; 2048];
            s.render(&mut buf);
            assert!(!s.is_playing());
        }
        assert!(song_finished(&session, baseline));
    }

    #[test]
    fn key_map() {
        let none = KeyModifiers::NONE;
        assert_eq!(command_for(KeyCode::Char(' '), none), Some(Command::TogglePause));
        assert_eq!(command_for(KeyCode::Char('q'), none), Some(Command::Quit));
        assert_eq!(
            command_for(KeyCode::Char('c'), KeyModifiers::CONTROL),
            Some(Command::Quit)
        );
        assert_eq!(command_for(KeyCode::Char('c'), none), None);
        assert_eq!(command_for(KeyCode::Char('='), none), Some(Command::VolumeUp));
        assert_eq!(command_for(KeyCode::Char('-'), none), Some(Command::VolumeDown));
        assert_eq!(command_for(KeyCode::Char('n'), none), Some(Command::ToggleNormalize));
        assert_eq!(command_for(KeyCode::Char('1'), none), Some(Command::Sfx(0)));
        assert_eq!(command_for(KeyCode::Char('9'), none), Some(Command::Sfx(8)));
        assert_eq!(command_for(KeyCode::Char('0'), none), None);
    }
}
