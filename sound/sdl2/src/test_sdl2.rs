use std::time::Duration;

use opl_midi::smf::encode_var_len;
use opl_midi::{MidiFile, SessionConfig};
use sound_traits::{SoundAction, SoundServer, SoundServerTic};

use crate::Snd;

fn scale() -> MidiFile {
    let mut body = Vec::new();
    for note in [60u8, 62, 64, 65, 67] {
        body.extend(encode_var_len(0));
        body.extend_from_slice(&[0x90, note, 100]);
        body.extend(encode_var_len(240));
        body.extend_from_slice(&[0x80, note, 0]);
    }
    body.extend_from_slice(&[0x00, 0xff, 0x2f, 0x00]);

    let mut data = b"MThd".to_vec();
    data.extend_from_slice(&[0, 0, 0, 6, 0, 0, 0, 1, 0x01, 0xe0]);
    data.extend_from_slice(b"MTrk");
    data.extend_from_slice(&(body.len() as u32).to_be_bytes());
    data.extend(body);
    MidiFile::parse(data).unwrap()
}

#[test]
#[ignore = "needs an audio device"]
fn play_scale() {
    let sdl = sdl2::init().unwrap();
    let config = SessionConfig {
        lookahead: opl_midi::session::PLAYER_LOOKAHEAD,
        ..SessionConfig::default()
    };
    let mut snd = Snd::new(sdl.audio().unwrap(), config).unwrap();
    let tx = snd.init().unwrap();
    let session = snd.session().clone();

    let thread = std::thread::spawn(move || {
        while snd.tic() {
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    tx.send(SoundAction::StartMusic(scale(), false)).unwrap();
    tx.send(SoundAction::MusicVolume(300)).unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    assert!(session.lock().unwrap().play_time() > 1.0);

    tx.send(SoundAction::Shutdown).unwrap();
    thread.join().unwrap();
}
