//! Speaking metrics, derived badges and pronunciation scoring
//!
//! Raw acoustic measurements come from the remote metrics endpoint
//! ([`MetricsService`]); everything derived from them is computed locally by
//! the pure [`score_turn`] function.

mod client;
mod scoring;

pub use client::{HttpMetricsClient, MetricsRequest, MetricsService};
pub use scoring::{
    PauseThreshold, RhythmAnalysis, RhythmIssue, ScoringParams, TurnScore, VolumeLadder, Window,
    analyze_rhythm, score_band, score_turn,
};

use serde::{Deserialize, Serialize};

use crate::Level;

/// Acoustic and lexical measurements for one recorded utterance
///
/// Produced by the metrics endpoint; consumed, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakingMetrics {
    pub duration_sec: f64,
    pub speaking_time_sec: f64,
    pub speech_ratio: f64,
    pub pause_ratio: f64,
    pub rms_dbfs: f64,
    pub peak_dbfs: f64,
    pub clipping_ratio: f64,

    #[serde(default)]
    pub words: Option<u32>,

    #[serde(default, alias = "wpm")]
    pub words_per_minute: Option<f64>,

    #[serde(default)]
    pub level: Option<Level>,

    /// Score from the metrics service itself, 0-100
    #[serde(default)]
    pub pronunciation_score: Option<f64>,

    /// Explanations accompanying `pronunciation_score`
    #[serde(default)]
    pub pronunciation_reasons: Vec<String>,

    #[serde(default)]
    pub suggested_escalation: bool,

    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Badge severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Good,
    Warn,
    Bad,
}

/// Short labelled verdict shown next to a user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub label: String,
    pub tone: Tone,
    pub tooltip: String,
}

impl Badge {
    pub(crate) fn new(label: &str, tone: Tone, tooltip: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            tone,
            tooltip: tooltip.into(),
        }
    }
}

/// The badges derived for one turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeSet {
    pub speed: Badge,
    pub clarity: Badge,
    pub volume: Badge,
    pub pronunciation: Badge,
}
