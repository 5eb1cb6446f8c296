//! Escalation of a turn for human review
//!
//! A request is a point-in-time copy of the turn: the learner's transcript,
//! the reply text and audio if any, and a trimmed preview of the conversation.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ConversationMessage, Error, Level, MessageContent, PracticeMode, Result, Role};

/// Messages kept in the history preview
pub const PREVIEW_MESSAGES: usize = 8;

/// Characters kept per previewed message
pub const PREVIEW_CHARS: usize = 500;

/// Snapshot submitted to the escalation endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub source: &'static str,
    pub practice_mode: &'static str,
    pub level: Level,
    #[serde(rename = "messageIndex")]
    pub turn_index: usize,
    pub reasons: Vec<String>,
    #[serde(rename = "userNote", skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(rename = "userLastText")]
    pub user_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_text: Option<String>,
    pub audio_url: Option<String>,
    #[serde(rename = "historyPreview")]
    pub history_snapshot: Vec<ConversationMessage>,
}

/// Inputs chosen by the learner when escalating
#[derive(Debug, Clone, Default)]
pub struct EscalationDraft {
    pub turn_index: usize,
    pub reasons: Vec<String>,
    pub note: Option<String>,
}

/// Where the turn was taken
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub level: Level,
    pub mode: PracticeMode,
    /// Most recently played reply URL
    pub last_played_url: Option<&'a str>,
    /// Base URL for resolving server-side file paths
    pub file_base_url: &'a str,
}

impl EscalationRequest {
    /// Package the turn at `draft.turn_index`
    ///
    /// # Errors
    ///
    /// Returns `Escalation` if no reason is given or the index is not a user message
    pub fn build(
        messages: &[ConversationMessage],
        draft: EscalationDraft,
        ctx: TurnContext<'_>,
    ) -> Result<Self> {
        if draft.reasons.is_empty() {
            return Err(Error::Escalation("at least one reason is required".to_string()));
        }
        let user = messages
            .get(draft.turn_index)
            .filter(|m| m.role == Role::User)
            .ok_or_else(|| {
                Error::Escalation(format!("message {} is not a user turn", draft.turn_index))
            })?;

        let assistant = messages[draft.turn_index + 1..]
            .iter()
            .find(|m| m.role == Role::Assistant);

        let audio_url = assistant
            .and_then(ConversationMessage::audio_ref)
            .and_then(|a| a.resolve(ctx.file_base_url))
            .or_else(|| ctx.last_played_url.map(str::to_string));

        Ok(Self {
            source: "speaking",
            practice_mode: ctx.mode.label(),
            level: ctx.level,
            turn_index: draft.turn_index,
            reasons: draft.reasons,
            note: draft.note.filter(|n| !n.trim().is_empty()),
            user_text: user.text_content().unwrap_or_default().to_string(),
            assistant_text: assistant.and_then(|m| m.text_content()).map(str::to_string),
            audio_url,
            history_snapshot: trim_preview(messages),
        })
    }
}

/// Keep the newest messages, truncating long text
fn trim_preview(messages: &[ConversationMessage]) -> Vec<ConversationMessage> {
    let start = messages.len().saturating_sub(PREVIEW_MESSAGES);
    messages[start..]
        .iter()
        .cloned()
        .map(|mut m| {
            if let MessageContent::Text(text) = &mut m.content
                && text.chars().count() > PREVIEW_CHARS
            {
                *text = text.chars().take(PREVIEW_CHARS).chain(['…']).collect();
            }
            m
        })
        .collect()
}

/// Review state of a stored escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Queued,
    Resolved,
}

/// Record returned by the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub status: EscalationStatus,
    pub created_at: String,
    #[serde(default)]
    pub message_index: Option<usize>,
}

/// Escalation endpoint
#[async_trait]
pub trait EscalationService: Send + Sync {
    /// Store the request for review
    ///
    /// # Errors
    ///
    /// Returns `Escalation` if the endpoint rejects or cannot be reached
    async fn create(&self, request: &EscalationRequest) -> Result<EscalationRecord>;
}

/// HTTP client for `POST /api/escalations`
#[derive(Clone)]
pub struct HttpEscalationClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEscalationClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EscalationService for HttpEscalationClient {
    async fn create(&self, request: &EscalationRequest) -> Result<EscalationRecord> {
        let response = self
            .client
            .post(format!("{}/api/escalations", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Escalation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Escalation(format!("{status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Escalation(format!("invalid record: {e}")))
    }
}

/// Submits escalations and remembers which turns were escalated
pub struct EscalationManager {
    service: Arc<dyn EscalationService>,
    enabled: bool,
    escalated: Mutex<BTreeSet<usize>>,
}

impl EscalationManager {
    #[must_use]
    pub fn new(service: Arc<dyn EscalationService>, enabled: bool) -> Self {
        Self {
            service,
            enabled,
            escalated: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Send the request once; marks its turn as escalated on success
    ///
    /// # Errors
    ///
    /// Returns `EscalationDisabled` when turned off, or the endpoint's error
    pub async fn submit(&self, request: EscalationRequest) -> Result<EscalationRecord> {
        if !self.enabled {
            return Err(Error::EscalationDisabled);
        }

        let index = request.turn_index;
        let record = self.service.create(&request).await.inspect_err(|e| {
            tracing::warn!(turn = index, error = %e, "escalation failed");
        })?;

        if let Ok(mut escalated) = self.escalated.lock() {
            escalated.insert(index);
        }
        tracing::info!(turn = index, id = %record.id, "turn escalated");
        Ok(record)
    }

    #[must_use]
    pub fn is_escalated(&self, turn_index: usize) -> bool {
        self.escalated
            .lock()
            .is_ok_and(|escalated| escalated.contains(&turn_index))
    }

    /// Escalated turn indices in ascending order
    #[must_use]
    pub fn escalated(&self) -> Vec<usize> {
        self.escalated
            .lock()
            .map(|escalated| escalated.iter().copied().collect())
            .unwrap_or_default()
    }
}
