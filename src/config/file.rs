//! TOML configuration file loading
//!
//! Supports `~/.config/voice-tutor/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::metrics::ScoringParams;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TutorConfigFile {
    /// Learner settings
    #[serde(default)]
    pub tutor: TutorFileConfig,

    /// Remote endpoints
    #[serde(default)]
    pub service: ServiceFileConfig,

    /// Reply playback
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Pronunciation history
    #[serde(default)]
    pub history: HistoryFileConfig,

    /// Human review
    #[serde(default)]
    pub escalation: EscalationFileConfig,

    /// Scoring heuristics; omitted keys keep their defaults
    #[serde(default)]
    pub scoring: Option<ScoringParams>,
}

/// Learner settings
#[derive(Debug, Default, Deserialize)]
pub struct TutorFileConfig {
    /// CEFR level (e.g. "B1")
    pub level: Option<String>,

    /// "hybrid" or "immersive"
    pub practice_mode: Option<String>,

    /// Opening assistant message shown before the first turn
    pub greeting: Option<String>,
}

/// Remote endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ServiceFileConfig {
    /// Base URL of the metrics and escalation API
    pub api_url: Option<String>,

    /// Base URL of the transcription and reply service
    pub inference_url: Option<String>,

    /// Seconds without a snapshot before the turn times out
    pub stream_timeout_sec: Option<u64>,

    /// Transcription attempts, including the first
    pub retry_limit: Option<u32>,

    /// Base backoff between transcription attempts
    pub retry_backoff_ms: Option<u64>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Delay between decode and playback start
    pub settle_ms: Option<u64>,
}

/// History configuration
#[derive(Debug, Default, Deserialize)]
pub struct HistoryFileConfig {
    /// Retained entries
    pub capacity: Option<usize>,

    /// JSON file holding the history
    pub path: Option<String>,
}

/// Escalation configuration
#[derive(Debug, Default, Deserialize)]
pub struct EscalationFileConfig {
    pub enabled: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TutorConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TutorConfigFile {
    let Some(path) = config_file_path() else {
        return TutorConfigFile::default();
    };

    if !path.exists() {
        return TutorConfigFile::default();
    }

    load_from(&path)
}

/// Load a config file from an explicit path, falling back to defaults on error
pub fn load_from(path: &Path) -> TutorConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                TutorConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TutorConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voice-tutor/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-tutor").join("config.toml"))
}
