//! Pronunciation history
//!
//! A bounded, newest-first log of past pronunciation scores with a recency
//! summary. Persisted through a [`HistoryStore`] after every append.

mod store;

pub use store::{FileHistoryStore, HistoryStore, MemoryHistoryStore};

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Level;
use crate::metrics::RhythmIssue;

/// Default number of retained entries
pub const DEFAULT_CAPACITY: usize = 20;

/// Entries averaged for `ProgressSummary::average`
const AVERAGE_WINDOW: usize = 5;

/// Entries in each trend window
const TREND_WINDOW: usize = 3;

/// Minimum difference between windows to call a trend
const TREND_BAND: f64 = 5.0;

/// One recorded score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PronunciationHistoryEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Final blended score
    pub score: f64,

    /// Score reported by the metrics service, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_score: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhythm_score: Option<f64>,

    #[serde(default)]
    pub issues: Vec<RhythmIssue>,

    pub level: Level,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "transcription")]
    pub transcript: Option<String>,
}

impl PronunciationHistoryEntry {
    /// Entry with only a score, stamped now
    #[must_use]
    pub fn scored(score: f64, level: Level) -> Self {
        Self {
            timestamp: Utc::now(),
            score,
            original_score: None,
            rhythm_score: None,
            issues: Vec::new(),
            level,
            transcript: None,
        }
    }
}

/// Direction of recent scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// Recency summary of the history
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressSummary {
    /// Newest score
    pub recent: Option<f64>,
    /// Mean of up to the five newest scores
    pub average: Option<f64>,
    /// `None` with fewer than three entries
    pub trend: Option<Trend>,
}

/// Capped ring buffer of scores, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PronunciationHistory {
    entries: VecDeque<PronunciationHistoryEntry>,

    #[serde(rename = "maxEntries")]
    capacity: usize,
}

impl Default for PronunciationHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl PronunciationHistory {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the front and drop the oldest entries beyond capacity
    pub fn append(&mut self, entry: PronunciationHistoryEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Change the capacity, truncating if needed
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.entries.truncate(self.capacity);
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, newest first
    pub fn entries(&self) -> impl Iterator<Item = &PronunciationHistoryEntry> {
        self.entries.iter()
    }

    /// Shallow copy of the newest `n` entries
    #[must_use]
    pub fn snapshot(&self, n: usize) -> Vec<PronunciationHistoryEntry> {
        self.entries.iter().take(n).cloned().collect()
    }

    #[must_use]
    pub fn summary(&self) -> ProgressSummary {
        let Some(newest) = self.entries.front() else {
            return ProgressSummary::default();
        };

        let average = mean(self.entries.iter().take(AVERAGE_WINDOW).map(|e| e.score));

        let trend = if self.entries.len() >= TREND_WINDOW {
            let recent = mean(self.entries.iter().take(TREND_WINDOW).map(|e| e.score));
            let older = if self.entries.len() >= TREND_WINDOW * 2 {
                mean(
                    self.entries
                        .iter()
                        .skip(TREND_WINDOW)
                        .take(TREND_WINDOW)
                        .map(|e| e.score),
                )
            } else {
                self.entries.back().map(|e| e.score)
            };
            recent.zip(older).map(|(r, o)| classify_trend(r, o))
        } else {
            None
        };

        ProgressSummary {
            recent: Some(newest.score),
            average,
            trend,
        }
    }
}

fn classify_trend(recent: f64, older: f64) -> Trend {
    if recent >= older + TREND_BAND {
        Trend::Up
    } else if recent <= older - TREND_BAND {
        Trend::Down
    } else {
        Trend::Stable
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / f64::from(count))
}
