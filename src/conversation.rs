//! Conversation model shared by the controller and the inference transport
//!
//! Messages travel on the wire as `{ role, content, auxiliaryText? }` where
//! `content` is `null` while pending, a string for text, or `{ "file": ... }`
//! for a reply-audio reference.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// CEFR proficiency tier used to parameterize thresholds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    A1,
    A2,
    #[default]
    B1,
    B2,
    C1,
    C2,
}

impl Level {
    /// All levels, lowest first
    pub const ALL: [Self; 6] = [Self::A1, Self::A2, Self::B1, Self::B2, Self::C1, Self::C2];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A1 => "A1",
            Self::A2 => "A2",
            Self::B1 => "B1",
            Self::B2 => "B2",
            Self::C1 => "C1",
            Self::C2 => "C2",
        }
    }

    /// Zero-based position, A1 = 0
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == upper)
            .ok_or_else(|| Error::Config(format!("unknown level: {s}")))
    }
}

/// How reply audio is surfaced during a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PracticeMode {
    /// Text and audio; every new audio reference plays as it arrives
    #[default]
    Hybrid,
    /// Audio-first; only the final audio reference of a turn is surfaced
    Immersive,
}

impl PracticeMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Immersive => "immersive",
        }
    }

    /// Capitalized label used in escalation records
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Hybrid => "Hybrid",
            Self::Immersive => "Immersive",
        }
    }
}

impl fmt::Display for PracticeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PracticeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "immersive" => Ok(Self::Immersive),
            other => Err(Error::Config(format!("unknown practice mode: {other}"))),
        }
    }
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Opaque reference to a remote audio asset
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Server-side path, served under `<base>/file=<path>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl AudioRef {
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            path: None,
        }
    }

    /// Resolve to a fetchable URL, preferring an explicit `url`
    #[must_use]
    pub fn resolve(&self, base_url: &str) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Some(url.to_string());
        }
        self.path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/file={p}", base_url.trim_end_matches('/')))
    }
}

/// Content of a conversation message
///
/// Starts as `Pending` and transitions at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MessageContent {
    #[default]
    Pending,
    Text(String),
    Audio(AudioRef),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    File { file: AudioRef },
}

impl From<MessageContent> for Option<WireContent> {
    fn from(content: MessageContent) -> Self {
        match content {
            MessageContent::Pending => None,
            MessageContent::Text(text) => Some(WireContent::Text(text)),
            MessageContent::Audio(file) => Some(WireContent::File { file }),
        }
    }
}

impl From<Option<WireContent>> for MessageContent {
    fn from(wire: Option<WireContent>) -> Self {
        match wire {
            None => Self::Pending,
            Some(WireContent::Text(text)) => Self::Text(text),
            Some(WireContent::File { file }) => Self::Audio(file),
        }
    }
}

impl Serialize for MessageContent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Option::<WireContent>::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<WireContent>::deserialize(deserializer).map(Self::from)
    }
}

/// One entry in the visible conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: Role,

    #[serde(default)]
    pub content: MessageContent,

    /// Text alternative for audio content
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "text_for_llm")]
    pub auxiliary_text: Option<String>,
}

impl ConversationMessage {
    #[must_use]
    pub const fn pending(role: Role) -> Self {
        Self {
            role,
            content: MessageContent::Pending,
            auxiliary_text: None,
        }
    }

    #[must_use]
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            auxiliary_text: None,
        }
    }

    #[must_use]
    pub const fn audio(role: Role, audio: AudioRef) -> Self {
        Self {
            role,
            content: MessageContent::Audio(audio),
            auxiliary_text: None,
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.content, MessageContent::Pending)
    }

    /// Fill a pending message; returns false if content was already set
    pub fn fill(&mut self, content: MessageContent) -> bool {
        if !self.is_pending() || matches!(content, MessageContent::Pending) {
            return false;
        }
        self.content = content;
        true
    }

    /// Displayable text: the text content, else the auxiliary text
    #[must_use]
    pub fn text_content(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text.as_str()),
            _ => self.auxiliary_text.as_deref(),
        }
    }

    /// Whether the message carries textual content
    #[must_use]
    pub fn has_text(&self) -> bool {
        match &self.content {
            MessageContent::Text(text) if !text.trim().is_empty() => true,
            _ => self.auxiliary_text.is_some(),
        }
    }

    #[must_use]
    pub const fn audio_ref(&self) -> Option<&AudioRef> {
        match &self.content {
            MessageContent::Audio(audio) => Some(audio),
            _ => None,
        }
    }
}

/// Whether any assistant message already has textual content
#[must_use]
pub fn assistant_has_text(messages: &[ConversationMessage]) -> bool {
    messages
        .iter()
        .any(|m| m.role == Role::Assistant && m.has_text())
}

/// Index and text of the most recent user message with a non-blank transcript
#[must_use]
pub fn last_user_transcript(messages: &[ConversationMessage]) -> Option<(usize, &str)> {
    messages
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, m)| m.role == Role::User)
        .find_map(|(i, m)| match &m.content {
            MessageContent::Text(text) if !text.trim().is_empty() => Some((i, text.as_str())),
            _ => None,
        })
}
