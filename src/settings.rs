use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{recordings_dir, CAPTURE_FRAME_SAMPLES};
use crate::classification::DEFAULT_CLASSIFIER_MODEL;
use crate::store::write_atomic;
use crate::streaming::DEFAULT_LIVE_MODEL;

const APP_DIR_NAME: &str = "live-agent";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variables checked for the realtime credential, in order
pub const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Realtime speech model, e.g. `models/gemini-2.5-flash-native-audio-preview-09-2025`
    pub model: String,

    /// Samples per outbound microphone frame (16 kHz)
    pub frame_samples: usize,

    /// Text model used to label a finished call
    pub classifier_model: String,

    /// When disabled, every saved call is Neutral.
    pub sentiment_enabled: bool,

    /// Classification that takes longer than this leaves the call Neutral.
    pub classification_timeout_secs: u64,

    /// Where conversation WAVs go (default: `<data_dir>/recordings`)
    pub recordings_dir: Option<PathBuf>,

    /// Where agent and call stores live (default: platform data dir)
    pub data_dir: Option<PathBuf>,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_LIVE_MODEL.to_string(),
            frame_samples: CAPTURE_FRAME_SAMPLES,
            classifier_model: DEFAULT_CLASSIFIER_MODEL.to_string(),
            sentiment_enabled: true,
            classification_timeout_secs: 10,
            recordings_dir: None,
            data_dir: None,
        }
    }
}

impl LiveSettings {
    pub fn classification_timeout(&self) -> Duration {
        Duration::from_secs(self.classification_timeout_secs)
    }

    /// Data directory override, else the platform default
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(default_data_dir)
    }

    pub fn resolved_recordings_dir(&self) -> Option<PathBuf> {
        self.recordings_dir
            .clone()
            .or_else(|| self.resolved_data_dir().map(|dir| recordings_dir(&dir)))
    }
}

/// `<data_local_dir>/live-agent`
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(APP_DIR_NAME))
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> LiveSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            LiveSettings::default()
        }
    }
}

/// Missing or unreadable files fall back to defaults
pub fn load_settings_from(path: &Path) -> LiveSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<LiveSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                LiveSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => LiveSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            LiveSettings::default()
        }
    }
}

pub fn save_settings(settings: &LiveSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &LiveSettings) -> Result<(), String> {
    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    write_atomic(path, &contents).map_err(|e| format!("Write settings {:?}: {}", path, e))
}

/// Realtime credential from the environment; blank values count as missing
pub fn api_key_from_env() -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}
