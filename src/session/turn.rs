//! Per-turn state
//!
//! Everything mutable about one record-transcribe-reply cycle lives on a
//! [`Turn`], built fresh when recording starts and dropped when the next one
//! begins.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::voice::RecordedAudio;
use crate::watchdog::Watchdog;
use crate::{ConversationMessage, Role};

/// Lifecycle of a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TurnState {
    #[default]
    Idle,
    Recording,
    ProcessingUpload,
    AwaitingReply,
    Cancelled,
    TimedOut,
    Errored,
}

impl TurnState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::ProcessingUpload => "processing_upload",
            Self::AwaitingReply => "awaiting_reply",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
        }
    }

    /// Between recording start and the end of the reply
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Recording | Self::ProcessingUpload | Self::AwaitingReply
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut | Self::Errored)
    }

    /// Whether `next` is a legal successor
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Idle, Self::Recording)
            | (Self::Recording, Self::ProcessingUpload)
            | (Self::ProcessingUpload, Self::AwaitingReply)
            | (Self::AwaitingReply, Self::Idle) => true,
            (from, Self::Idle) => from.is_terminal(),
            (from, to) => to.is_terminal() && from.is_active(),
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Errored,
}

impl TurnOutcome {
    /// Terminal state recorded for this outcome
    #[must_use]
    pub const fn state(self) -> TurnState {
        match self {
            Self::Completed => TurnState::Idle,
            Self::Cancelled => TurnState::Cancelled,
            Self::TimedOut => TurnState::TimedOut,
            Self::Errored => TurnState::Errored,
        }
    }
}

/// One active turn
#[derive(Debug)]
pub struct Turn {
    pub id: u64,
    state: TurnState,
    /// Index in the visible list where this turn's messages begin
    pub base: usize,
    /// Messages sent as history; the server echoes them first
    pub sent_len: usize,
    /// Index of this turn's user message
    pub user_index: Option<usize>,
    pub recording: Option<RecordedAudio>,
    /// Metrics with a transcript already requested
    pub transcript_sent: bool,
    pub assistant_has_text: bool,
    /// Cancels the streaming subscription and suppresses further mutation
    pub cancel: CancellationToken,
    /// Triggered by the watchdog
    pub expired: CancellationToken,
    pub watchdog: Watchdog,
}

impl Turn {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: TurnState::Recording,
            base: 0,
            sent_len: 0,
            user_index: None,
            recording: None,
            transcript_sent: false,
            assistant_has_text: false,
            cancel: CancellationToken::new(),
            expired: CancellationToken::new(),
            watchdog: Watchdog::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Move to `next`; illegal transitions are ignored and return false
    pub fn transition(&mut self, next: TurnState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(turn = self.id, from = %self.state, to = %next, "ignored transition");
            return false;
        }
        tracing::debug!(turn = self.id, from = %self.state, to = %next, "turn transition");
        self.state = next;
        true
    }

    /// Whether snapshots and events may still mutate the session
    #[must_use]
    pub fn accepts_updates(&self) -> bool {
        self.state.is_active() && !self.cancel.is_cancelled()
    }

    /// End the turn in `terminal`, clearing the watchdog and cancelling the stream
    pub fn terminate(&mut self, terminal: TurnState) {
        self.watchdog.clear();
        self.cancel.cancel();
        if self.transition(terminal) {
            self.transition(TurnState::Idle);
        }
    }
}

/// Result of merging one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merge {
    pub user_index: Option<usize>,
    pub assistant_has_text: bool,
    pub placeholder: bool,
}

/// Rebuild the turn's part of `visible` from the messages the server added
///
/// Messages before `base` are never touched. Server-side pending assistant
/// slots are dropped, and a single local placeholder is kept at the end until
/// an assistant message with text follows the user's message.
pub fn merge_snapshot(
    visible: &mut Vec<ConversationMessage>,
    base: usize,
    added: &[ConversationMessage],
) -> Merge {
    let mut tail: Vec<ConversationMessage> = added
        .iter()
        .filter(|m| !(m.role == Role::Assistant && m.is_pending()))
        .cloned()
        .collect();

    // Transcript not in yet: keep the optimistic user slot
    if !tail.iter().any(|m| m.role == Role::User) {
        tail.insert(0, ConversationMessage::pending(Role::User));
    }

    let user_pos = tail.iter().rposition(|m| m.role == Role::User);
    let assistant_has_text = user_pos.is_some_and(|pos| {
        tail[pos + 1..]
            .iter()
            .any(|m| m.role == Role::Assistant && m.has_text())
    });

    let placeholder = !assistant_has_text;
    if placeholder {
        tail.push(ConversationMessage::pending(Role::Assistant));
    }

    visible.truncate(base);
    visible.extend(tail);

    Merge {
        user_index: user_pos.map(|pos| base + pos),
        assistant_has_text,
        placeholder,
    }
}

/// Fill the trailing placeholder with `text`, or append it as a new message
pub fn post_notice(visible: &mut Vec<ConversationMessage>, text: &str) {
    if let Some(last) = visible.last_mut()
        && last.role == Role::Assistant
        && last.is_pending()
    {
        last.fill(crate::MessageContent::Text(text.to_string()));
        return;
    }
    visible.push(ConversationMessage::text(Role::Assistant, text));
}

/// Count of pending assistant messages
#[must_use]
pub fn placeholder_count(visible: &[ConversationMessage]) -> usize {
    visible
        .iter()
        .filter(|m| m.role == Role::Assistant && m.is_pending())
        .count()
}
