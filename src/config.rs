use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::{focus::TitleMatch, keymap::KeyLayout};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("could not serialize settings: {0}")]
    Serialize(#[from] ron::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub target: TitleMatch,
    pub transposition: i8,
    /// Replace `transposition` with a suggestion whenever a score is loaded
    pub auto_transpose: bool,
    pub layout: KeyLayout,
    /// Tracks enabled on load; `None` enables all of them
    pub enabled_tracks: Option<Vec<u32>>,
    pub focus_poll_ms: u64,
    pub progress_interval_ms: u64,
    /// Longest the scheduler sleeps without looking at its queues
    pub max_wait_ms: u64,
    /// Pause instead of stopping when the target merely loses focus
    pub pause_on_focus_loss: bool,
    pub probe_program: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target: TitleMatch::default(),
            transposition: 0,
            auto_transpose: false,
            layout: KeyLayout::default(),
            enabled_tracks: None,
            focus_poll_ms: 250,
            progress_interval_ms: 100,
            max_wait_ms: 50,
            pause_on_focus_loss: false,
            probe_program: "xdotool".to_string(),
        }
    }
}

impl Settings {
    /// Reads settings from a RON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ron_string = fs::read_to_string(path)?;
        let settings: Settings = ron::from_str(&ron_string)?;

        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;

        Ok(())
    }

    pub fn focus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.focus_poll_ms.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.max(1))
    }
}
