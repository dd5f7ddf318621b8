//! Interactive MIDI player on the SDL2 sound server

mod cli;
mod config;
mod console;

use std::error::Error;
use std::process::exit;

use cli::*;
use log::{LevelFilter, error, info, warn};
use opl_midi::session::PLAYER_LOOKAHEAD;
use opl_midi::{MidiFile, SessionConfig};
use simplelog::TermLogger;
use sound_traits::{SoundAction, SoundServer, SoundServerTic};

use crate::config::UserConfig;

const MAX_SFX: usize = 9;

fn main() {
    let mut options: CLIOptions = argh::from_env();

    if let Err(e) = TermLogger::init(
        options.verbose.unwrap_or(LevelFilter::Info),
        simplelog::ConfigBuilder::default()
            .set_time_level(LevelFilter::Trace)
            .build(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    ) {
        eprintln!("Could not start logging: {e}");
    }

    let mut user_config = UserConfig::load();
    user_config.sync_cli(&mut options);
    user_config.write();

    if let Err(e) = play(&options, &mut user_config) {
        error!("{e}");
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn play(options: &CLIOptions, user_config: &mut UserConfig) -> Result<(), Box<dyn Error>> {
    let file = MidiFile::open(&options.input)?;

    let sdl_ctx = sdl2::init()?;
    info!("Init SDL2 main");
    let snd_ctx = sdl_ctx.audio()?;
    info!("Init SDL2 sound");

    let config = SessionConfig {
        volume: user_config.volume,
        normalize: user_config.normalize,
        opl3: user_config.opl3,
        lookahead: PLAYER_LOOKAHEAD,
        ..SessionConfig::default()
    };
    let mut snd = sound_sdl2::Snd::new(snd_ctx, config)?;

    if options.sfx.len() > MAX_SFX {
        warn!("Only the first {MAX_SFX} sound effects get a key");
    }
    let sfx: Vec<usize> = options
        .sfx
        .iter()
        .take(MAX_SFX)
        .filter_map(|path| match snd.load_sfx(path) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Skipping sound effect {path}: {e}");
                None
            }
        })
        .collect();

    let session = snd.session().clone();
    let tx = snd.init()?;
    let server = std::thread::spawn(move || {
        loop {
            if !snd.tic() {
                break;
            }
        }
    });

    let baseline = session.lock().map(|s| s.finished_plays()).unwrap_or(0);
    println!("Playing {}", options.input);
    tx.send(SoundAction::StartMusic(file, options.repeat))?;
    let result = console::run(&tx, &session, baseline, user_config, &sfx);

    tx.send(SoundAction::Shutdown)?;
    if server.join().is_err() {
        warn!("Sound server thread panicked");
    }
    user_config.write();
    result
}
