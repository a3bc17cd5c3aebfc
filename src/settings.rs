use std::{fs, path::Path};

use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    input::{control_address, ControlAddress},
    mapping::{CoordinateMapper, NoteGrid, GRID_COLUMNS, PRESET_ROW_BASES, SCENE_ROW_BASES},
};

pub const DEFAULT_TICK_MS: u64 = 10;
/// One day
pub const MAX_PING_INTERVAL: f64 = 86_400.0;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = "Launchpad to lighting software MIDI bridge")]
pub struct Cli {
    #[arg(long = "loglevel",default_value_t=String::from("info"))]
    pub log_level: String,

    /// Layout, colours and key bindings (JSON); defaults are used if missing
    #[arg(long = "config",default_value_t=String::from("./config.json"))]
    pub config_path: String,

    /// Stored presets and sequences
    #[arg(long = "project",default_value_t=String::from("./lightpad.project.json"))]
    pub project_path: String,

    /// Substring of the grid controller's MIDI port name (used for input and output)
    #[arg(long = "midi.launchpad",default_value_t=String::from("Launchpad MK2"))]
    pub launchpad_port: String,

    /// Substring of the port the lighting software sends feedback on
    #[arg(long = "midi.software.in",default_value_t=String::from("LightSoftware_out"))]
    pub software_in_port: String,

    /// Substring of the port the lighting software listens to
    #[arg(long = "midi.software.out",default_value_t=String::from("LightSoftware_in"))]
    pub software_out_port: String,

    /// Sleep between dispatch passes when there was nothing to do, in ms
    #[arg(long = "tick", default_value_t=DEFAULT_TICK_MS)]
    pub tick_ms: u64,

    /// Flag to run without the Tether remote control plug
    #[arg(long = "tether.disable")]
    pub tether_disable: bool,
}

/// Launchpad palette velocities for each lamp role
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LampColours {
    pub off: u8,
    pub scene_on: u8,
    pub preset_on: u8,
    pub save_mode: u8,
    pub save_shift_mode: u8,
    pub playback_playing: u8,
    pub playback_paused: u8,
    pub next_step: u8,
    pub pilot_on: u8,
    pub pilot_off: u8,
}

impl Default for LampColours {
    fn default() -> Self {
        LampColours {
            off: 0,
            scene_on: 21,
            preset_on: 53,
            save_mode: 5,
            save_shift_mode: 17,
            playback_playing: 21,
            playback_paused: 9,
            next_step: 45,
            pilot_on: 21,
            pilot_off: 9,
        }
    }
}

/// Control buttons, as absolute `[x, y]` on the 9x9 surface
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyBindings {
    pub save: (u8, u8),
    pub save_shift: (u8, u8),
    pub playback_toggle: (u8, u8),
    pub next_step: (u8, u8),
    pub clear: (u8, u8),
    pub pilot_toggle: (u8, u8),
}

impl Default for KeyBindings {
    fn default() -> Self {
        KeyBindings {
            save: (0, 0),
            save_shift: (1, 0),
            playback_toggle: (8, 7),
            next_step: (8, 6),
            clear: (8, 8),
            pilot_toggle: (5, 0),
        }
    }
}

impl KeyBindings {
    pub fn all(&self) -> [(&'static str, (u8, u8)); 6] {
        [
            ("save", self.save),
            ("saveShift", self.save_shift),
            ("playbackToggle", self.playback_toggle),
            ("nextStep", self.next_step),
            ("clear", self.clear),
            ("pilotToggle", self.pilot_toggle),
        ]
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub columns: u8,
    pub scene_row_bases: Vec<u8>,
    pub preset_row_bases: Vec<u8>,
    /// Whether animated presets start over after their last step
    pub loop_sequences: bool,
    /// Seconds between connection pings to the lighting software
    pub ping_interval: f64,
    pub pilot_enabled: bool,
    pub colours: LampColours,
    pub key_bindings: KeyBindings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            columns: GRID_COLUMNS,
            scene_row_bases: SCENE_ROW_BASES.to_vec(),
            preset_row_bases: PRESET_ROW_BASES.to_vec(),
            loop_sequences: true,
            ping_interval: 5.0,
            pilot_enabled: false,
            colours: LampColours::default(),
            key_bindings: KeyBindings::default(),
        }
    }
}

impl Config {
    /// Falls back to defaults when the file does not exist; a file that exists but
    /// does not parse or validate is an error.
    pub fn load(path: &str) -> anyhow::Result<Config> {
        if !Path::new(path).exists() {
            warn!("No config at \"{}\"; using defaults", path);
            return Ok(Config::default());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        info!("Found config {}; parsing...", path);
        let config: Config =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?;
        config.validate()?;
        info!("...config loaded OK");
        Ok(config)
    }

    pub fn mapper(&self) -> anyhow::Result<CoordinateMapper> {
        CoordinateMapper::new(
            NoteGrid::new(self.columns, &self.scene_row_bases)?,
            NoteGrid::new(self.columns, &self.preset_row_bases)?,
        )
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mapper = self.mapper()?;

        if !(self.ping_interval > 0.0 && self.ping_interval <= MAX_PING_INTERVAL) {
            bail!(
                "pingInterval must be between 0 and {} seconds, got {}",
                MAX_PING_INTERVAL,
                self.ping_interval
            );
        }

        let bindings = self.key_bindings.all();
        for (i, (name, (x, y))) in bindings.iter().enumerate() {
            if control_address(*x, *y).is_none() {
                bail!("key binding {} at ({},{}) is not a button", name, x, y);
            }
            if let Some((other, _)) = bindings[..i].iter().find(|(_, c)| *c == (*x, *y)) {
                bail!("key bindings {} and {} share ({},{})", other, name, x, y);
            }
            if let Some(ControlAddress::Note(note)) = control_address(*x, *y) {
                if let Some((block, ..)) = mapper.locate(note) {
                    bail!("key binding {} overlaps the {:?} block", name, block);
                }
            }
        }
        Ok(())
    }

    pub fn scene_rows(&self) -> u8 {
        self.scene_row_bases.len() as u8
    }

    pub fn preset_rows(&self) -> u8 {
        self.preset_row_bases.len() as u8
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.scene_rows(), 5);
        assert_eq!(config.preset_rows(), 3);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "loopSequences": false, "keyBindings": {{ "clear": [8, 5] }} }}"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert!(!config.loop_sequences);
        assert_eq!(config.key_bindings.clear, (8, 5));
        assert_eq!(config.key_bindings.save, (0, 0));
        assert_eq!(config.scene_row_bases, SCENE_ROW_BASES.to_vec());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn bindings_inside_a_block_are_rejected() {
        let mut config = Config::default();
        config.key_bindings.clear = (0, 1);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.key_bindings.clear = config.key_bindings.save;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.preset_row_bases = vec![81];
        assert!(config.validate().is_err());
    }

    #[test]
    fn ping_interval_is_bounded() {
        for bad in [0.0, -1.0, 1e20, f64::NAN, f64::INFINITY] {
            let config = Config {
                ping_interval: bad,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "{} accepted", bad);
        }
        let config = Config {
            ping_interval: MAX_PING_INTERVAL,
            ..Config::default()
        };
        config.validate().unwrap();
    }
}
