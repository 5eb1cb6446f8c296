//! Configuration management for the voice tutor
//!
//! Values resolve env > TOML file > defaults.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::history::DEFAULT_CAPACITY;
use crate::metrics::ScoringParams;
use crate::stream::retry::RetryPolicy;
use crate::voice::DEFAULT_SETTLE_DELAY;
use crate::{Error, Level, PracticeMode, Result};

use self::file::TutorConfigFile;

/// Default inactivity timeout for a streaming reply
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_INFERENCE_URL: &str = "http://127.0.0.1:7860";
const DEFAULT_GREETING: &str =
    "Hi! I'm your speaking tutor. Press Enter, say something, and press Enter again when you're done.";

/// Voice tutor configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the metrics and escalation API
    pub api_base_url: String,

    /// Base URL of the transcription and reply service
    pub inference_url: String,

    /// Learner proficiency
    pub level: Level,

    /// How reply audio is surfaced
    pub practice_mode: PracticeMode,

    /// Inactivity timeout while awaiting a reply
    pub stream_timeout: Duration,

    /// Delay between decode and playback start
    pub playback_settle: Duration,

    /// Retained pronunciation history entries
    pub history_capacity: usize,

    /// Durable history slot
    pub history_path: PathBuf,

    /// Allow escalating turns for human review
    pub escalation_enabled: bool,

    /// Transcription attempts, including the first
    pub transcription_retries: u32,

    /// Base backoff between transcription attempts
    pub retry_backoff: Duration,

    /// Opening assistant message, if any
    pub greeting: Option<String>,

    /// Scoring heuristics
    pub scoring: ScoringParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            inference_url: DEFAULT_INFERENCE_URL.to_string(),
            level: Level::default(),
            practice_mode: PracticeMode::default(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            playback_settle: DEFAULT_SETTLE_DELAY,
            history_capacity: DEFAULT_CAPACITY,
            history_path: default_history_path(),
            escalation_enabled: false,
            transcription_retries: 2,
            retry_backoff: Duration::from_millis(500),
            greeting: Some(DEFAULT_GREETING.to_string()),
            scoring: ScoringParams::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a level or practice mode value is not recognized
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with values from `env`
    ///
    /// # Errors
    ///
    /// Returns error if a level or practice mode value is not recognized
    pub fn resolve(fc: TutorConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let default = Self::default();

        let level = env("TUTOR_LEVEL")
            .or(fc.tutor.level)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(default.level);

        let practice_mode = env("TUTOR_PRACTICE_MODE")
            .or(fc.tutor.practice_mode)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(default.practice_mode);

        let stream_timeout = env("TUTOR_STREAM_TIMEOUT_SEC")
            .map(|s| parse_number::<u64>("TUTOR_STREAM_TIMEOUT_SEC", &s))
            .transpose()?
            .or(fc.service.stream_timeout_sec)
            .map_or(default.stream_timeout, Duration::from_secs);
        if stream_timeout.is_zero() {
            return Err(Error::Config("stream timeout must be positive".to_string()));
        }

        let transcription_retries = env("TUTOR_STREAM_RETRY_LIMIT")
            .map(|s| parse_number::<u32>("TUTOR_STREAM_RETRY_LIMIT", &s))
            .transpose()?
            .or(fc.service.retry_limit)
            .unwrap_or(default.transcription_retries);

        let retry_backoff = env("TUTOR_STREAM_RETRY_BACKOFF_MS")
            .map(|s| parse_number::<u64>("TUTOR_STREAM_RETRY_BACKOFF_MS", &s))
            .transpose()?
            .or(fc.service.retry_backoff_ms)
            .map_or(default.retry_backoff, Duration::from_millis);

        let escalation_enabled = env("TUTOR_ENABLE_ESCALATION")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(fc.escalation.enabled)
            .unwrap_or(default.escalation_enabled);

        let greeting = match fc.tutor.greeting {
            Some(text) if text.trim().is_empty() => None,
            Some(text) => Some(text),
            None => default.greeting,
        };

        Ok(Self {
            api_base_url: env("TUTOR_API_URL")
                .or(fc.service.api_url)
                .unwrap_or(default.api_base_url),
            inference_url: env("TUTOR_INFERENCE_URL")
                .or(fc.service.inference_url)
                .unwrap_or(default.inference_url),
            level,
            practice_mode,
            stream_timeout,
            playback_settle: fc
                .playback
                .settle_ms
                .map_or(default.playback_settle, Duration::from_millis),
            history_capacity: fc
                .history
                .capacity
                .unwrap_or(default.history_capacity)
                .max(1),
            history_path: fc
                .history
                .path
                .map_or(default.history_path, PathBuf::from),
            escalation_enabled,
            transcription_retries,
            retry_backoff,
            greeting,
            scoring: fc.scoring.unwrap_or(default.scoring),
        })
    }

    /// Transcription retry policy
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.transcription_retries,
            base_delay: self.retry_backoff,
            ..RetryPolicy::default()
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got {value:?}")))
}

/// Default history slot: `<data_dir>/voice-tutor/pronunciation_history.json`
fn default_history_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".voice-tutor/pronunciation_history.json"),
        |d| {
            d.data_dir()
                .join("voice-tutor")
                .join("pronunciation_history.json")
        },
    )
}
