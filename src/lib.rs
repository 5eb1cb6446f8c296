//! Voice Tutor - spoken-conversation turn controller for language practice
//!
//! This library drives one learner's spoken practice session:
//! - Microphone capture and reply playback
//! - Transcription plus a streaming, incrementally merged tutor reply
//! - Speaking metrics, badges and a persisted pronunciation history
//! - Optional escalation of a turn for human review
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 SessionController                    │
//! │   Turn state  │  Watchdog  │  Snapshot merge         │
//! └──────┬──────────────┬──────────────┬────────────────┘
//!        │              │              │
//! ┌──────▼─────┐ ┌──────▼──────┐ ┌─────▼──────────────┐
//! │   Voice    │ │   Stream    │ │ Metrics / History  │
//! │ capture,   │ │ transcribe, │ │ Escalation         │
//! │ playback   │ │ NDJSON reply│ │                    │
//! └────────────┘ └─────────────┘ └────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod escalation;
pub mod history;
pub mod metrics;
pub mod session;
pub mod stream;
pub mod voice;
pub mod watchdog;

pub use config::Config;
pub use conversation::{
    AudioRef, ConversationMessage, Level, MessageContent, PracticeMode, Role, assistant_has_text,
    last_user_transcript,
};
pub use error::{Error, Result};
pub use escalation::{EscalationDraft, EscalationManager, EscalationRecord, EscalationRequest};
pub use history::{PronunciationHistory, PronunciationHistoryEntry, ProgressSummary};
pub use metrics::{BadgeSet, ScoringParams, SpeakingMetrics, TurnScore, score_turn};
pub use session::{SessionController, SessionOptions, SessionServices, TurnOutcome, TurnState};
pub use stream::{InferenceService, Snapshot, StreamEvent, StreamHandle, StreamingClient};
pub use watchdog::Watchdog;
