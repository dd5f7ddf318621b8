use argh::FromArgs;

/// Render a MIDI file to a 16-bit stereo WAV file through the OPL3 emulator
#[derive(Debug, Clone, FromArgs)]
pub struct CLIOptions {
    /// verbose level: off, error, warn, info, debug
    #[argh(option)]
    pub verbose: Option<log::LevelFilter>,
    /// output sample rate in Hz
    #[argh(option, default = "opl_midi::session::SAMPLE_RATE")]
    pub sample_rate: u32,
    /// restrict the chip to the OPL2 channel set
    #[argh(switch)]
    pub opl2: bool,
    /// how many times a loopStart/loopEnd section repeats
    #[argh(option, default = "1")]
    pub loops: u32,
    /// MIDI file to convert
    #[argh(positional)]
    pub input: String,
    /// WAV file to write
    #[argh(positional)]
    pub output: String,
    /// output volume in percent
    #[argh(positional)]
    pub volume: Option<String>,
}
