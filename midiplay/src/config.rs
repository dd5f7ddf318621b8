//! User configuration options.

use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use dirs::config_dir;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::CLIOptions;

const LOG_TAG: &str = "UserConfig";
const BASE_DIR: &str = "opl-midi";

pub const MIN_VOLUME: i32 = 10;
pub const MAX_VOLUME: i32 = 300;
pub const VOLUME_STEP: i32 = 10;

fn get_cfg_file() -> Option<PathBuf> {
    let Some(mut dir) = config_dir() else {
        warn!(target: LOG_TAG, "No user config dir on this system");
        return None;
    };
    dir.push(BASE_DIR);
    if let Err(e) = create_dir_all(&dir) {
        warn!(target: LOG_TAG, "Couldn't create {dir:?}: {e}");
        return None;
    }
    dir.push("user.toml");
    Some(dir)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Music volume in percent
    pub volume: i32,
    pub normalize: bool,
    pub opl3: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            volume: 100,
            normalize: false,
            opl3: true,
        }
    }
}

impl UserConfig {
    /// Reads the config file, creating it with defaults when missing or
    /// unreadable. Without a usable config dir the defaults are used as is.
    pub fn load() -> Self {
        let Some(path) = get_cfg_file() else {
            return Self::default();
        };

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) => {
                warn!(target: LOG_TAG, "Couldn't open {path:?}: {e}");
                return Self::default();
            }
        };
        let mut buf = String::new();
        if let Ok(read_len) = file.read_to_string(&mut buf) {
            if read_len > 0 {
                match Self::parse(&buf) {
                    Some(config) => {
                        info!(target: LOG_TAG, "Loaded user config file");
                        return config;
                    }
                    None => warn!(target: LOG_TAG, "Could not deserialise {path:?} recreating config"),
                }
            }
        }
        Self::create_default(&path)
    }

    fn parse(data: &str) -> Option<Self> {
        let mut config: Self = toml::from_str(data).ok()?;
        config.volume = config.volume.clamp(MIN_VOLUME, MAX_VOLUME);
        Some(config)
    }

    fn create_default(path: &Path) -> Self {
        let config = Self::default();
        config.write_to(path);
        info!(target: LOG_TAG, "Created default user config file");
        config
    }

    pub fn write(&self) {
        if let Some(path) = get_cfg_file() {
            self.write_to(&path);
        }
    }

    fn write_to(&self, path: &Path) {
        let data = match toml::to_string_pretty(self) {
            Ok(d) => d,
            Err(e) => {
                error!(target: LOG_TAG, "Could not serialise config: {e}");
                return;
            }
        };
        match File::create(path).and_then(|mut f| f.write_all(data.as_bytes())) {
            Ok(_) => info!(target: LOG_TAG, "Saved user config to {path:?}"),
            Err(e) => error!(target: LOG_TAG, "Could not write config: {e}"),
        }
    }

    /// Sync the CLI options and UserOptions with each other
    pub fn sync_cli(&mut self, cli: &mut CLIOptions) {
        info!(target: LOG_TAG, "Checking CLI options");

        if let Some(v) = cli.volume {
            let v = v.clamp(MIN_VOLUME, MAX_VOLUME);
            if v != self.volume {
                self.volume = v;
                info!(target: LOG_TAG, "Volume changed to: {v}%");
            }
        }
        cli.volume = Some(self.volume);

        if let Some(n) = cli.normalize {
            if n != self.normalize {
                self.normalize = n;
            }
        } else {
            cli.normalize = Some(self.normalize);
        }

        if let Some(opl2) = cli.opl2 {
            if opl2 == self.opl3 {
                self.opl3 = !opl2;
            }
        } else {
            cli.opl2 = Some(!self.opl3);
        }
    }
}
