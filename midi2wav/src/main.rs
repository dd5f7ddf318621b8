//! Offline MIDI to WAV converter

mod cli;

use std::error::Error;
use std::io::Write;
use std::process::exit;

use cli::CLIOptions;
use log::{LevelFilter, error, info};
use opl_midi::{MidiFile, Session, SessionConfig, render_to_wav};
use simplelog::TermLogger;

/// Percent, the raw chip output is quiet
const DEFAULT_VOLUME: i32 = 500;
const SAMPLE_RATES: std::ops::RangeInclusive<u32> = 8_000..=192_000;

fn log_level(verbose: Option<LevelFilter>) -> LevelFilter {
    verbose.unwrap_or(LevelFilter::Info)
}

fn main() {
    let options: CLIOptions = argh::from_env();

    if let Err(e) = TermLogger::init(
        log_level(options.verbose),
        simplelog::ConfigBuilder::default()
            .set_time_level(LevelFilter::Trace)
            .build(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    ) {
        eprintln!("Could not start logging: {e}");
    }

    let volume = parse_volume(options.volume.as_deref());
    println!(
        "Converting {} to {} (Volume: {volume}%)...",
        options.input, options.output
    );

    if let Err(e) = convert(&options, volume) {
        println!();
        error!("Conversion failed: {e}");
        eprintln!("Error: {e}");
        exit(1);
    }
    println!("\nConversion completed successfully.");
}

/// Missing gives the default, anything unparsable or not positive warns and
/// gives the default
fn parse_volume(arg: Option<&str>) -> i32 {
    let Some(arg) = arg else {
        return DEFAULT_VOLUME;
    };
    match arg.trim().parse::<i32>() {
        Ok(v) if v > 0 => v,
        _ => {
            println!("Warning: Invalid volume. Using default ({DEFAULT_VOLUME}%).");
            DEFAULT_VOLUME
        }
    }
}

fn convert(options: &CLIOptions, volume: i32) -> Result<(), Box<dyn Error>> {
    if !SAMPLE_RATES.contains(&options.sample_rate) {
        return Err(format!(
            "sample rate {} is outside {}..={}",
            options.sample_rate,
            SAMPLE_RATES.start(),
            SAMPLE_RATES.end()
        )
        .into());
    }

    let file = MidiFile::open(&options.input)?;
    let config = SessionConfig {
        sample_rate: options.sample_rate,
        volume,
        opl3: !options.opl2,
        loop_limit: Some(options.loops),
        ..SessionConfig::default()
    };
    let mut session = Session::new(config)?;
    session.load(file);
    session.play(false);
    let session = session.shared();

    let mut shown = None;
    let samples = render_to_wav(&session, &options.output, |seconds| {
        let whole = seconds as u64;
        if shown != Some(whole) {
            shown = Some(whole);
            print!("\rConverting... {whole} seconds");
            // Progress is best effort
            std::io::stdout().flush().ok();
        }
    })?;
    info!("{samples} samples written to {}", options.output);
    Ok(())
}
