//! Badge derivation and level-aware pronunciation scoring
//!
//! All thresholds are heuristic and live in [`ScoringParams`] so they can be
//! tuned from configuration. Functions here are deterministic and side-effect
//! free.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::{Badge, BadgeSet, SpeakingMetrics, Tone};
use crate::Level;

/// Inclusive numeric range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub min: f64,
    pub max: f64,
}

impl Window {
    const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Pause-ratio limits for one level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PauseThreshold {
    /// At or below: no pause issue
    pub acceptable: f64,
    /// Above: long pauses
    pub excessive: f64,
}

impl PauseThreshold {
    const fn new(acceptable: f64, excessive: f64) -> Self {
        Self {
            acceptable,
            excessive,
        }
    }
}

/// RMS dBFS ladder for the volume badge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeLadder {
    pub very_low: f64,
    pub low: f64,
    pub too_loud: f64,
    pub loud: f64,
}

/// Tunable scoring constants, indexed by [`Level::index`] where per-level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    pub wpm_windows: [Window; 6],
    pub wpm_tolerance: f64,
    pub clipping_limit: f64,
    pub clarity_pause_limit: f64,
    pub volume: VolumeLadder,
    pub pause_thresholds: [PauseThreshold; 6],
    pub phrase_lengths: [Window; 6],
    /// Phrases longer than `max * run_on_factor` are run-on
    pub run_on_factor: f64,
    /// Lower bound of the pause-derived base score
    pub base_floor: f64,
    pub level_bonus: [f64; 6],
    pub issue_penalty: f64,
    /// Weight of the service's own score when blending
    pub external_weight: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            wpm_windows: [
                Window::new(80.0, 140.0),
                Window::new(100.0, 160.0),
                Window::new(110.0, 180.0),
                Window::new(120.0, 200.0),
                Window::new(130.0, 210.0),
                Window::new(140.0, 220.0),
            ],
            wpm_tolerance: 15.0,
            clipping_limit: 0.02,
            clarity_pause_limit: 0.6,
            volume: VolumeLadder {
                very_low: -40.0,
                low: -28.0,
                too_loud: -6.0,
                loud: -10.0,
            },
            pause_thresholds: [
                PauseThreshold::new(0.50, 0.70),
                PauseThreshold::new(0.45, 0.65),
                PauseThreshold::new(0.40, 0.60),
                PauseThreshold::new(0.35, 0.55),
                PauseThreshold::new(0.30, 0.50),
                PauseThreshold::new(0.25, 0.45),
            ],
            phrase_lengths: [
                Window::new(2.0, 4.0),
                Window::new(3.0, 5.0),
                Window::new(4.0, 7.0),
                Window::new(5.0, 10.0),
                Window::new(6.0, 12.0),
                Window::new(7.0, 15.0),
            ],
            run_on_factor: 1.5,
            base_floor: 50.0,
            level_bonus: [10.0, 10.0, 5.0, 5.0, 0.0, 0.0],
            issue_penalty: 5.0,
            external_weight: 0.7,
        }
    }
}

/// Discrete rhythm problem detected in an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RhythmIssue {
    ExcessivePauses,
    LongPauses,
    ShortPhrases,
    RunOnSentences,
}

impl RhythmIssue {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExcessivePauses => "excessive_pauses",
            Self::LongPauses => "long_pauses",
            Self::ShortPhrases => "short_phrases",
            Self::RunOnSentences => "run_on_sentences",
        }
    }

    /// Practice tip shown to the learner
    #[must_use]
    pub const fn tip(self) -> &'static str {
        match self {
            Self::ExcessivePauses => "Try to connect words more smoothly.",
            Self::LongPauses => "Practice speaking in complete thoughts without stopping.",
            Self::ShortPhrases => "Try to build longer, connected phrases.",
            Self::RunOnSentences => "Add appropriate pauses between complete thoughts.",
        }
    }
}

/// Output of [`analyze_rhythm`]
#[derive(Debug, Clone, PartialEq)]
pub struct RhythmAnalysis {
    pub issues: Vec<RhythmIssue>,
    pub pause_feedback: String,
    /// Level-adjusted rhythm score, 0-100
    pub score: f64,
}

/// Everything derived from one metrics record
#[derive(Debug, Clone, PartialEq)]
pub struct TurnScore {
    pub badges: BadgeSet,
    /// Final pronunciation score, 0-100
    pub pronunciation_score: f64,
    pub rhythm_score: f64,
    pub external_score: Option<f64>,
    pub issues: Vec<RhythmIssue>,
    pub reasons: Vec<String>,
}

/// Label for a pronunciation score
#[must_use]
pub fn score_band(score: f64) -> (&'static str, Tone) {
    if score >= 80.0 {
        ("Excellent", Tone::Good)
    } else if score >= 65.0 {
        ("Good", Tone::Good)
    } else if score >= 50.0 {
        ("Fair", Tone::Warn)
    } else {
        ("Needs Work", Tone::Bad)
    }
}

/// Level-aware pause and phrase-length analysis
#[must_use]
pub fn analyze_rhythm(m: &SpeakingMetrics, level: Level, params: &ScoringParams) -> RhythmAnalysis {
    let idx = level.index();
    let pause = params.pause_thresholds[idx];
    let mut issues = Vec::new();

    let pause_feedback = if m.pause_ratio <= pause.acceptable {
        "Good pause pattern for your level.".to_string()
    } else if m.pause_ratio <= pause.excessive {
        issues.push(RhythmIssue::ExcessivePauses);
        format!("Slightly too many pauses for {level} level. Try to connect your phrases.")
    } else {
        issues.push(RhythmIssue::LongPauses);
        format!("Too many or too long pauses for {level} level. Practice connecting your thoughts.")
    };

    // Phrase count is approximated from the pause ratio
    if let Some(words) = m.words.filter(|w| *w > 0)
        && m.speaking_time_sec > 0.0
    {
        let avg_words_per_phrase = f64::from(words) / (m.pause_ratio * 10.0).max(1.0);
        let expected = params.phrase_lengths[idx];
        if avg_words_per_phrase < expected.min {
            issues.push(RhythmIssue::ShortPhrases);
        } else if avg_words_per_phrase > expected.max * params.run_on_factor {
            issues.push(RhythmIssue::RunOnSentences);
        }
    }

    let base = (100.0 - m.pause_ratio * 100.0).max(params.base_floor);
    #[allow(clippy::cast_precision_loss)]
    let penalty = issues.len() as f64 * params.issue_penalty;
    let score = (base + params.level_bonus[idx] - penalty).clamp(0.0, 100.0);

    RhythmAnalysis {
        issues,
        pause_feedback,
        score,
    }
}

/// Derive badges and the blended pronunciation score for one turn
#[must_use]
pub fn score_turn(m: &SpeakingMetrics, level: Level, params: &ScoringParams) -> TurnScore {
    let rhythm = analyze_rhythm(m, level, params);

    let mut reasons = Vec::new();
    let pronunciation_score = match m.pronunciation_score {
        Some(external) => {
            reasons.extend(m.pronunciation_reasons.iter().cloned());
            external.mul_add(
                params.external_weight,
                rhythm.score * (1.0 - params.external_weight),
            )
        }
        None => rhythm.score,
    }
    .clamp(0.0, 100.0);

    reasons.push(rhythm.pause_feedback.clone());
    reasons.extend(rhythm.issues.iter().map(|i| i.tip().to_string()));

    let badges = BadgeSet {
        speed: speed_badge(m, level, params),
        clarity: clarity_badge(m, params),
        volume: volume_badge(m, params),
        pronunciation: pronunciation_badge(pronunciation_score, &reasons),
    };

    TurnScore {
        badges,
        pronunciation_score,
        rhythm_score: rhythm.score,
        external_score: m.pronunciation_score,
        issues: rhythm.issues,
        reasons,
    }
}

fn speed_badge(m: &SpeakingMetrics, level: Level, params: &ScoringParams) -> Badge {
    let Window { min, max } = params.wpm_windows[level.index()];
    let tol = params.wpm_tolerance;

    match m.words_per_minute.filter(|w| w.is_finite()) {
        None => Badge::new("—", Tone::Warn, "No transcript yet to compute WPM"),
        Some(wpm) if wpm < min - tol => {
            Badge::new("Slow", Tone::Warn, format!("WPM {wpm:.0} (below {min:.0})"))
        }
        Some(wpm) if wpm > max + tol => {
            Badge::new("Fast", Tone::Warn, format!("WPM {wpm:.0} (above {max:.0})"))
        }
        Some(wpm) => Badge::new(
            "Good",
            Tone::Good,
            format!("WPM {wpm:.0} in target range ({min:.0}-{max:.0})"),
        ),
    }
}

fn clarity_badge(m: &SpeakingMetrics, params: &ScoringParams) -> Badge {
    if m.clipping_ratio > params.clipping_limit {
        Badge::new(
            "Clipping",
            Tone::Bad,
            format!("Clipping {:.2}%", m.clipping_ratio * 100.0),
        )
    } else if m.pause_ratio > params.clarity_pause_limit {
        Badge::new(
            "Pauses",
            Tone::Warn,
            format!("Pause {:.0}% (high)", m.pause_ratio * 100.0),
        )
    } else {
        Badge::new(
            "Clear",
            Tone::Good,
            format!("Speech {:.0}%", m.speech_ratio * 100.0),
        )
    }
}

fn volume_badge(m: &SpeakingMetrics, params: &ScoringParams) -> Badge {
    let rms = m.rms_dbfs;
    let ladder = params.volume;
    let (label, tone) = if rms <= ladder.very_low {
        ("Very Low", Tone::Bad)
    } else if rms <= ladder.low {
        ("Low", Tone::Warn)
    } else if rms >= ladder.too_loud {
        ("Too Loud", Tone::Bad)
    } else if rms >= ladder.loud {
        ("Loud", Tone::Warn)
    } else {
        ("Good", Tone::Good)
    };
    Badge::new(label, tone, format!("RMS {rms:.1} dBFS"))
}

fn pronunciation_badge(score: f64, reasons: &[String]) -> Badge {
    let (label, tone) = score_band(score);
    let mut tooltip = format!("Pronunciation: {score:.0}/100");
    for reason in reasons {
        let _ = write!(tooltip, "\n• {reason}");
    }
    Badge::new(label, tone, tooltip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> SpeakingMetrics {
        SpeakingMetrics {
            duration_sec: 6.0,
            speaking_time_sec: 4.5,
            speech_ratio: 0.75,
            pause_ratio: 0.25,
            rms_dbfs: -20.0,
            peak_dbfs: -3.0,
            clipping_ratio: 0.0,
            words: Some(12),
            words_per_minute: Some(130.0),
            ..SpeakingMetrics::default()
        }
    }

    fn params() -> ScoringParams {
        ScoringParams::default()
    }

    #[test]
    fn high_pause_ratio_warns_on_clarity() {
        let m = SpeakingMetrics {
            pause_ratio: 0.7,
            clipping_ratio: 0.0,
            ..metrics()
        };
        let score = score_turn(&m, Level::B1, &params());
        assert_eq!(score.badges.clarity.tone, Tone::Warn);
        assert_eq!(score.badges.clarity.label, "Pauses");
    }

    #[test]
    fn clipping_takes_precedence_over_pauses() {
        let m = SpeakingMetrics {
            pause_ratio: 0.9,
            clipping_ratio: 0.05,
            ..metrics()
        };
        let badges = score_turn(&m, Level::B1, &params()).badges;
        assert_eq!(badges.clarity.tone, Tone::Bad);
        assert_eq!(badges.clarity.label, "Clipping");
    }

    #[test]
    fn volume_ladder() {
        let cases = [
            (-45.0, Tone::Bad, "Very Low"),
            (-40.0, Tone::Bad, "Very Low"),
            (-30.0, Tone::Warn, "Low"),
            (-20.0, Tone::Good, "Good"),
            (-8.0, Tone::Warn, "Loud"),
            (-3.0, Tone::Bad, "Too Loud"),
        ];
        for (rms, tone, label) in cases {
            let m = SpeakingMetrics {
                rms_dbfs: rms,
                ..metrics()
            };
            let badge = score_turn(&m, Level::B1, &params()).badges.volume;
            assert_eq!(badge.tone, tone, "rms {rms}");
            assert_eq!(badge.label, label, "rms {rms}");
        }
    }

    #[test]
    fn speed_badge_uses_level_window_with_tolerance() {
        // B1 window is 110-180, tolerance 15
        let slow = SpeakingMetrics {
            words_per_minute: Some(94.0),
            ..metrics()
        };
        let edge = SpeakingMetrics {
            words_per_minute: Some(96.0),
            ..metrics()
        };
        let fast = SpeakingMetrics {
            words_per_minute: Some(196.0),
            ..metrics()
        };
        assert_eq!(score_turn(&slow, Level::B1, &params()).badges.speed.label, "Slow");
        assert_eq!(score_turn(&edge, Level::B1, &params()).badges.speed.label, "Good");
        assert_eq!(score_turn(&fast, Level::B1, &params()).badges.speed.label, "Fast");
    }

    #[test]
    fn missing_wpm_gives_unknown_speed() {
        let m = SpeakingMetrics {
            words_per_minute: None,
            ..metrics()
        };
        let badge = score_turn(&m, Level::B1, &params()).badges.speed;
        assert_eq!(badge.label, "—");
        assert!(badge.tooltip.contains("No transcript"));
    }

    #[test]
    fn pause_thresholds_tighten_with_level() {
        let m = SpeakingMetrics {
            pause_ratio: 0.48,
            words: None,
            ..metrics()
        };
        assert!(analyze_rhythm(&m, Level::A1, &params()).issues.is_empty());
        assert_eq!(
            analyze_rhythm(&m, Level::B1, &params()).issues,
            vec![RhythmIssue::ExcessivePauses]
        );
        assert_eq!(
            analyze_rhythm(&m, Level::C2, &params()).issues,
            vec![RhythmIssue::LongPauses]
        );
    }

    #[test]
    fn phrase_length_issues() {
        // 3 words over max(1, 2.5) phrases = 1.2 words/phrase, below B1 min 4
        let short = SpeakingMetrics {
            words: Some(3),
            ..metrics()
        };
        assert!(
            analyze_rhythm(&short, Level::B1, &params())
                .issues
                .contains(&RhythmIssue::ShortPhrases)
        );

        // 40 words / 2.5 = 16 > 7 * 1.5
        let run_on = SpeakingMetrics {
            words: Some(40),
            ..metrics()
        };
        assert!(
            analyze_rhythm(&run_on, Level::B1, &params())
                .issues
                .contains(&RhythmIssue::RunOnSentences)
        );
    }

    #[test]
    fn rhythm_score_applies_bonus_and_penalty() {
        // base 75, B1 bonus 5, no issues
        let clean = analyze_rhythm(&metrics(), Level::B1, &params());
        assert!(clean.issues.is_empty());
        assert!((clean.score - 80.0).abs() < 1e-9);

        // base 100 - 55 = 45 floored to 50, C2 bonus 0, long pauses -5
        let m = SpeakingMetrics {
            pause_ratio: 0.55,
            words: None,
            ..metrics()
        };
        let rough = analyze_rhythm(&m, Level::C2, &params());
        assert!((rough.score - 45.0).abs() < 1e-9);
    }

    #[test]
    fn external_score_is_blended() {
        let m = SpeakingMetrics {
            pronunciation_score: Some(90.0),
            pronunciation_reasons: vec!["Clear vowels".into()],
            ..metrics()
        };
        let score = score_turn(&m, Level::B1, &params());
        // 90 * 0.7 + 80 * 0.3
        assert!((score.pronunciation_score - 87.0).abs() < 1e-9);
        assert_eq!(score.reasons[0], "Clear vowels");
        assert_eq!(score.badges.pronunciation.label, "Excellent");
        assert!(score.badges.pronunciation.tooltip.contains("• Clear vowels"));
    }

    #[test]
    fn issues_contribute_tips() {
        let m = SpeakingMetrics {
            pause_ratio: 0.8,
            words: None,
            ..metrics()
        };
        let score = score_turn(&m, Level::B1, &params());
        assert_eq!(score.issues, vec![RhythmIssue::LongPauses]);
        assert!(
            score
                .reasons
                .iter()
                .any(|r| r == RhythmIssue::LongPauses.tip())
        );
    }

    #[test]
    fn bands() {
        assert_eq!(score_band(80.0).0, "Excellent");
        assert_eq!(score_band(65.0).0, "Good");
        assert_eq!(score_band(50.0).0, "Fair");
        assert_eq!(score_band(49.9), ("Needs Work", Tone::Bad));
    }

    #[test]
    fn scoring_is_deterministic() {
        let m = metrics();
        assert_eq!(
            score_turn(&m, Level::C1, &params()),
            score_turn(&m, Level::C1, &params())
        );
    }
}
