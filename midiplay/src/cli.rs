use argh::FromArgs;

/// Play a MIDI file through the OPL3 emulator
#[derive(Debug, Clone, FromArgs)]
pub struct CLIOptions {
    /// verbose level: off, error, warn, info, debug
    #[argh(option)]
    pub verbose: Option<log::LevelFilter>,
    /// music volume in percent, 10 to 300
    #[argh(option)]
    pub volume: Option<i32>,
    /// divide the mix by the number of active sources <true, false>
    #[argh(option)]
    pub normalize: Option<bool>,
    /// use only the OPL2 channel set <true, false>
    #[argh(option)]
    pub opl2: Option<bool>,
    /// start the song again when it ends
    #[argh(switch, long = "loop")]
    pub repeat: bool,
    /// WAV sound effect, can be given up to nine times. Keys 1-9 play them
    #[argh(option)]
    pub sfx: Vec<String>,
    /// MIDI file to play
    #[argh(positional)]
    pub input: String,
}
