//! Error types for the voice tutor

use thiserror::Error;

/// Result type alias for voice tutor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a spoken turn
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access was refused
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The recording assembled to zero bytes
    #[error("recording is empty")]
    EmptyRecording,

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Transcription phase failed
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Streaming reply failed
    #[error("stream error: {0}")]
    Stream(String),

    /// No snapshot arrived before the watchdog expired
    #[error("timed out after {0:?} without a reply")]
    Timeout(std::time::Duration),

    /// Reply playback failed
    #[error("playback error: {0}")]
    Playback(String),

    /// Speaking metrics request failed
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Escalation submission failed
    #[error("escalation error: {0}")]
    Escalation(String),

    /// Escalation is turned off in configuration
    #[error("escalation is disabled")]
    EscalationDisabled,

    /// Operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error terminates the active turn
    ///
    /// Playback, metrics and escalation failures never abort a turn.
    #[must_use]
    pub const fn is_turn_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transcription(_)
                | Self::Stream(_)
                | Self::Timeout(_)
                | Self::Http(_)
                | Self::Serialization(_)
        )
    }
}
