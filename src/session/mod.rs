//! Session controller
//!
//! Owns the visible conversation and drives one [`Turn`] at a time through
//! recording, upload, streaming reply and teardown. Side effects (metrics,
//! playback, escalation) run beside the turn and never abort it.

mod turn;

pub use turn::{
    Merge, Turn, TurnOutcome, TurnState, merge_snapshot, placeholder_count, post_notice,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::escalation::{
    EscalationDraft, EscalationManager, EscalationRecord, EscalationRequest, EscalationService,
    TurnContext,
};
use crate::history::{
    HistoryStore, ProgressSummary, PronunciationHistory, PronunciationHistoryEntry,
};
use crate::metrics::{
    BadgeSet, MetricsRequest, MetricsService, ScoringParams, SpeakingMetrics, TurnScore,
    score_turn,
};
use crate::stream::{InferenceService, Snapshot, StreamEvent, StreamHandle, StreamingClient};
use crate::voice::{AudioFetcher, AudioSink, AudioSource, PlaybackEngine};
use crate::{ConversationMessage, Error, Level, MessageContent, PracticeMode, Result, Role};

/// Shown when the reply stream fails
pub const ERROR_NOTICE: &str = "Sorry, an error occurred.";

/// Shown when the watchdog fires
pub const TIMEOUT_NOTICE: &str = "Connection timed out. Please try again.";

/// Shown when a recording holds no audio
pub const EMPTY_RECORDING_NOTICE: &str =
    "I didn't catch any audio. Hold the button a little longer and try again.";

/// Collaborators used by a session
pub struct SessionServices {
    pub source: Box<dyn AudioSource>,
    pub inference: Arc<dyn InferenceService>,
    pub metrics: Arc<dyn MetricsService>,
    pub escalation: Arc<dyn EscalationService>,
    pub history: Arc<dyn HistoryStore>,
    pub fetcher: Arc<dyn AudioFetcher>,
    pub sink: Arc<dyn AudioSink>,
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub level: Level,
    pub mode: PracticeMode,
    pub stream_timeout: Duration,
    pub playback_settle: Duration,
    pub history_capacity: usize,
    pub escalation_enabled: bool,
    pub greeting: Option<String>,
    pub scoring: ScoringParams,
    /// Base for resolving server-side audio paths
    pub file_base_url: String,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            level: config.level,
            mode: config.practice_mode,
            stream_timeout: config.stream_timeout,
            playback_settle: config.playback_settle,
            history_capacity: config.history_capacity,
            escalation_enabled: config.escalation_enabled,
            greeting: config.greeting.clone(),
            scoring: config.scoring.clone(),
            file_base_url: config.inference_url.clone(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Latest metrics for the current turn
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsBanner {
    pub turn: u64,
    pub metrics: SpeakingMetrics,
    pub score: TurnScore,
}

/// Awaitable result of a submitted turn
#[derive(Debug)]
pub struct TurnHandle {
    id: u64,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the turn to end
    pub async fn outcome(self) -> TurnOutcome {
        self.task.await.unwrap_or(TurnOutcome::Cancelled)
    }
}

struct SessionState {
    messages: Vec<ConversationMessage>,
    turn: Option<Turn>,
    level: Level,
    mode: PracticeMode,
    badges: BTreeMap<usize, BadgeSet>,
    banner: Option<MetricsBanner>,
    history: PronunciationHistory,
    last_outcome: Option<TurnOutcome>,
    shut_down: bool,
}

impl SessionState {
    fn current(&mut self, turn_id: u64) -> Option<&mut Turn> {
        self.turn
            .as_mut()
            .filter(|t| t.id == turn_id && t.accepts_updates())
    }

    fn is_current(&self, turn_id: u64) -> bool {
        self.turn.as_ref().is_some_and(|t| t.id == turn_id)
    }
}

struct Inner {
    state: Mutex<SessionState>,
    source: std::sync::Mutex<Box<dyn AudioSource>>,
    client: StreamingClient,
    metrics: Arc<dyn MetricsService>,
    history_store: Arc<dyn HistoryStore>,
    playback: PlaybackEngine,
    escalation: EscalationManager,
    options: SessionOptions,
    next_turn: AtomicU64,
}

/// Drives spoken turns for one learner
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Build a session, loading persisted history
    ///
    /// A missing or unreadable history slot starts empty.
    #[must_use]
    pub fn new(services: SessionServices, options: SessionOptions) -> Self {
        let history = match services.history.load() {
            Ok(Some(mut history)) => {
                history.set_capacity(options.history_capacity);
                tracing::debug!(entries = history.len(), "history loaded");
                history
            }
            Ok(None) => PronunciationHistory::with_capacity(options.history_capacity),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load history, starting empty");
                PronunciationHistory::with_capacity(options.history_capacity)
            }
        };

        let messages = options
            .greeting
            .iter()
            .map(|g| ConversationMessage::text(Role::Assistant, g.clone()))
            .collect();

        let state = SessionState {
            messages,
            turn: None,
            level: options.level,
            mode: options.mode,
            badges: BTreeMap::new(),
            banner: None,
            history,
            last_outcome: None,
            shut_down: false,
        };

        let inner = Inner {
            state: Mutex::new(state),
            source: std::sync::Mutex::new(services.source),
            client: StreamingClient::new(services.inference),
            metrics: services.metrics,
            history_store: services.history,
            playback: PlaybackEngine::new(services.fetcher, services.sink, options.playback_settle),
            escalation: EscalationManager::new(services.escalation, options.escalation_enabled),
            options,
            next_turn: AtomicU64::new(1),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Begin a new turn, cancelling any active one
    ///
    /// Slots a cancelled turn left pending stay where they are, so every
    /// message keeps its index for the rest of the session.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` if the microphone cannot be acquired; no turn
    /// is created in that case.
    pub async fn start_recording(&self) -> Result<u64> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.shut_down {
            return Err(Error::Cancelled);
        }

        if let Some(turn) = state.turn.as_mut()
            && turn.state().is_active()
        {
            tracing::info!(turn = turn.id, "new recording cancels active turn");
            self.inner.release_source(turn.state());
            turn.terminate(TurnState::Cancelled);
            state.last_outcome = Some(TurnOutcome::Cancelled);
        }

        self.inner.with_source(|s| s.start())?;

        let id = self.inner.next_turn.fetch_add(1, Ordering::SeqCst);
        state.turn = Some(Turn::new(id));
        state.banner = None;
        self.inner.playback.reset_turn();

        tracing::info!(turn = id, "recording started");
        Ok(id)
    }

    /// Finish recording and submit the turn
    ///
    /// # Errors
    ///
    /// Returns `EmptyRecording` (after posting a notice) if nothing was
    /// captured, or an audio error if no turn is recording.
    pub async fn stop_recording(&self) -> Result<TurnHandle> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let Some(turn) = state
            .turn
            .as_mut()
            .filter(|t| t.state() == TurnState::Recording)
        else {
            return Err(Error::Audio("not recording".to_string()));
        };

        let audio = match self.inner.with_source(|s| s.stop()) {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) | Err(Error::EmptyRecording) => {
                tracing::info!(turn = turn.id, "empty recording");
                turn.terminate(TurnState::Errored);
                state.last_outcome = Some(TurnOutcome::Errored);
                state
                    .messages
                    .push(ConversationMessage::text(Role::Assistant, EMPTY_RECORDING_NOTICE));
                return Err(Error::EmptyRecording);
            }
            Err(e) => {
                tracing::warn!(turn = turn.id, error = %e, "recording failed");
                turn.terminate(TurnState::Errored);
                state.last_outcome = Some(TurnOutcome::Errored);
                return Err(e);
            }
        };

        turn.transition(TurnState::ProcessingUpload);
        tracing::info!(turn = turn.id, bytes = audio.len(), "recording submitted");

        let history: Vec<ConversationMessage> = state
            .messages
            .iter()
            .filter(|m| !m.is_pending())
            .cloned()
            .collect();

        // Optimistic slots until the transcript arrives
        turn.base = state.messages.len();
        turn.sent_len = history.len();
        turn.user_index = Some(turn.base);
        state.messages.push(ConversationMessage::pending(Role::User));
        state.messages.push(ConversationMessage::pending(Role::Assistant));
        turn.recording = Some(audio.clone());

        let turn_id = turn.id;
        let user_index = turn.base;
        let stream = self
            .inner
            .client
            .start(audio.clone(), history, state.level, state.mode);

        let expired = turn.expired.clone();
        turn.watchdog
            .arm(self.inner.options.stream_timeout, move || expired.cancel());

        let cancel = turn.cancel.clone();
        let expired = turn.expired.clone();
        let level = state.level;
        drop(guard);

        let request = MetricsRequest::inline(&audio.bytes, &audio.mime_type, level);
        Inner::spawn_metrics(&self.inner, turn_id, user_index, request);

        let task = tokio::spawn(Inner::run_turn(
            Arc::clone(&self.inner),
            turn_id,
            stream,
            cancel,
            expired,
        ));

        Ok(TurnHandle { id: turn_id, task })
    }

    /// Cancel the active turn; returns false when nothing was active
    ///
    /// No message-list mutation from the cancelled turn happens after this
    /// returns. The microphone is released before returning.
    pub async fn cancel_turn(&self) -> bool {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(turn) = state.turn.as_mut().filter(|t| t.state().is_active()) else {
            return false;
        };

        tracing::info!(turn = turn.id, state = %turn.state(), "turn cancelled");
        self.inner.release_source(turn.state());
        turn.terminate(TurnState::Cancelled);
        state.last_outcome = Some(TurnOutcome::Cancelled);
        true
    }

    /// Cancel outstanding work and release the playback resource
    pub async fn shutdown(&self) {
        self.cancel_turn().await;
        let mut state = self.inner.state.lock().await;
        if let Some(turn) = state.turn.as_mut() {
            turn.watchdog.clear();
        }
        state.shut_down = true;
        self.inner.playback.dispose();
        tracing::debug!("session shut down");
    }

    /// Switch practice mode; entering immersive mode replays the last reply
    pub async fn set_mode(&self, mode: PracticeMode) {
        let mut state = self.inner.state.lock().await;
        let previous = std::mem::replace(&mut state.mode, mode);
        if previous == mode {
            return;
        }
        tracing::info!(from = %previous, to = %mode, "practice mode changed");

        if mode != PracticeMode::Immersive || self.inner.playback.is_speaking() {
            return;
        }

        let last_reply = state
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(ConversationMessage::audio_ref)
            .and_then(|a| a.resolve(&self.inner.options.file_base_url));

        if let Some(url) = last_reply
            && self.inner.playback.last_played_url().as_deref() != Some(url.as_str())
        {
            Inner::spawn_playback(&self.inner, url);
        }
    }

    pub async fn set_level(&self, level: Level) {
        self.inner.state.lock().await.level = level;
    }

    /// Submit the turn at `draft.turn_index` for human review
    ///
    /// Failure never changes turn state.
    ///
    /// # Errors
    ///
    /// Returns `EscalationDisabled`, or `Escalation` if packaging or sending fails
    pub async fn escalate(&self, draft: EscalationDraft) -> Result<EscalationRecord> {
        let request = {
            let state = self.inner.state.lock().await;
            let last_played = self.inner.playback.last_played_url();
            EscalationRequest::build(
                &state.messages,
                draft,
                TurnContext {
                    level: state.level,
                    mode: state.mode,
                    last_played_url: last_played.as_deref(),
                    file_base_url: &self.inner.options.file_base_url,
                },
            )?
        };
        self.inner.escalation.submit(request).await
    }

    /// Visible conversation
    pub async fn messages(&self) -> Vec<ConversationMessage> {
        self.inner.state.lock().await.messages.clone()
    }

    /// State of the current turn; `Idle` when none is active
    pub async fn state(&self) -> TurnState {
        self.inner
            .state
            .lock()
            .await
            .turn
            .as_ref()
            .map_or(TurnState::Idle, Turn::state)
    }

    pub async fn last_outcome(&self) -> Option<TurnOutcome> {
        self.inner.state.lock().await.last_outcome
    }

    pub async fn level(&self) -> Level {
        self.inner.state.lock().await.level
    }

    pub async fn mode(&self) -> PracticeMode {
        self.inner.state.lock().await.mode
    }

    /// Badges computed for the user message at `index`
    pub async fn badges_for(&self, index: usize) -> Option<BadgeSet> {
        self.inner.state.lock().await.badges.get(&index).cloned()
    }

    pub async fn banner(&self) -> Option<MetricsBanner> {
        self.inner.state.lock().await.banner.clone()
    }

    pub async fn history_summary(&self) -> ProgressSummary {
        self.inner.state.lock().await.history.summary()
    }

    /// Newest `n` history entries
    pub async fn history(&self, n: usize) -> Vec<PronunciationHistoryEntry> {
        self.inner.state.lock().await.history.snapshot(n)
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.inner.playback.is_speaking()
    }

    #[must_use]
    pub fn last_played_url(&self) -> Option<String> {
        self.inner.playback.last_played_url()
    }

    #[must_use]
    pub fn escalated(&self) -> Vec<usize> {
        self.inner.escalation.escalated()
    }

    #[must_use]
    pub fn escalation_enabled(&self) -> bool {
        self.inner.escalation.is_enabled()
    }
}

impl Inner {
    fn with_source<T>(&self, f: impl FnOnce(&mut dyn AudioSource) -> Result<T>) -> Result<T> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| Error::Audio("audio source lock poisoned".to_string()))?;
        f(source.as_mut())
    }

    /// Stop capture without keeping the recording
    fn release_source(&self, state: TurnState) {
        if state != TurnState::Recording {
            return;
        }
        if let Err(e) = self.with_source(|s| s.stop().map(drop)) {
            tracing::debug!(error = %e, "discarded recording");
        }
    }

    async fn run_turn(
        self: Arc<Self>,
        turn_id: u64,
        mut stream: StreamHandle,
        cancel: CancellationToken,
        expired: CancellationToken,
    ) -> TurnOutcome {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    stream.cancel();
                    return TurnOutcome::Cancelled;
                }
                () = expired.cancelled() => {
                    stream.cancel();
                    let timeout = Error::Timeout(self.options.stream_timeout);
                    return self.finish(turn_id, Err(timeout)).await;
                }
                event = stream.next() => match event {
                    Some(StreamEvent::Snapshot(snapshot)) => self.apply_snapshot(turn_id, snapshot).await,
                    Some(StreamEvent::Complete) | None => {
                        return self.finish(turn_id, Ok(())).await;
                    }
                    Some(StreamEvent::Error(e)) if e.is_turn_fatal() => {
                        stream.cancel();
                        return self.finish(turn_id, Err(e)).await;
                    }
                    // The reply ended early; keep what arrived
                    Some(StreamEvent::Error(e)) => {
                        tracing::warn!(turn = turn_id, error = %e, "reply stream ended by non-fatal error");
                        return self.finish(turn_id, Ok(())).await;
                    }
                }
            }
        }
    }

    async fn apply_snapshot(self: &Arc<Self>, turn_id: u64, snapshot: Snapshot) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(turn) = state
            .turn
            .as_mut()
            .filter(|t| t.id == turn_id && t.accepts_updates())
        else {
            tracing::trace!(turn = turn_id, "dropping snapshot for inactive turn");
            return;
        };

        turn.watchdog.arm(self.options.stream_timeout, {
            let expired = turn.expired.clone();
            move || expired.cancel()
        });
        if turn.state() == TurnState::ProcessingUpload {
            turn.transition(TurnState::AwaitingReply);
        }

        let added = snapshot.messages.get(turn.sent_len..).unwrap_or_default();
        let merge = merge_snapshot(&mut state.messages, turn.base, added);
        turn.assistant_has_text = merge.assistant_has_text;
        if merge.user_index.is_some() {
            turn.user_index = merge.user_index;
        }

        // Refine metrics once the transcript is known
        let transcript = turn
            .user_index
            .and_then(|i| state.messages.get(i))
            .and_then(|m| match &m.content {
                MessageContent::Text(text) if !text.trim().is_empty() => Some(text.clone()),
                _ => None,
            });
        let refine = match (transcript, turn.recording.as_ref(), turn.user_index) {
            (Some(text), Some(audio), Some(index)) if !turn.transcript_sent => {
                turn.transcript_sent = true;
                let request = MetricsRequest::inline(&audio.bytes, &audio.mime_type, state.level)
                    .with_transcript(text);
                Some((index, request))
            }
            _ => None,
        };

        let audio_url = snapshot
            .audio_ref
            .and_then(|a| a.resolve(&self.options.file_base_url));
        drop(guard);

        if let Some((index, request)) = refine {
            Self::spawn_metrics(self, turn_id, index, request);
        }
        if let Some(url) = audio_url {
            Self::spawn_playback(self, url);
        }
    }

    /// End the turn with the stream's result; stale turns report `Cancelled`
    async fn finish(&self, turn_id: u64, result: Result<()>) -> TurnOutcome {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(turn) = state.current(turn_id) else {
            return TurnOutcome::Cancelled;
        };

        let outcome = match result {
            Ok(()) => {
                turn.watchdog.clear();
                turn.transition(TurnState::AwaitingReply);
                turn.transition(TurnState::Idle);
                tracing::info!(turn = turn_id, "turn complete");
                TurnOutcome::Completed
            }
            Err(e @ Error::Timeout(_)) => {
                tracing::warn!(turn = turn_id, error = %e, "turn timed out");
                turn.terminate(TurnState::TimedOut);
                post_notice(&mut state.messages, TIMEOUT_NOTICE);
                TurnOutcome::TimedOut
            }
            Err(e) => {
                tracing::error!(turn = turn_id, error = %e, "turn failed");
                turn.terminate(TurnState::Errored);
                post_notice(&mut state.messages, ERROR_NOTICE);
                TurnOutcome::Errored
            }
        };

        state.last_outcome = Some(outcome);
        outcome
    }

    /// Request metrics without blocking the turn; failures are only logged
    fn spawn_metrics(this: &Arc<Self>, turn_id: u64, user_index: usize, request: MetricsRequest) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            match inner.metrics.analyze(&request).await {
                Ok(metrics) => {
                    inner
                        .apply_metrics(turn_id, user_index, request, metrics)
                        .await;
                }
                Err(e) => tracing::warn!(turn = turn_id, error = %e, "metrics unavailable"),
            }
        });
    }

    async fn apply_metrics(
        &self,
        turn_id: u64,
        user_index: usize,
        request: MetricsRequest,
        metrics: SpeakingMetrics,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let level = request.level;
        let score = score_turn(&metrics, level, &self.options.scoring);

        // The transcript may have moved the user message since the request
        let user_index = state
            .turn
            .as_ref()
            .filter(|t| t.id == turn_id)
            .and_then(|t| t.user_index)
            .unwrap_or(user_index);
        state.badges.insert(user_index, score.badges.clone());

        if request.transcript.is_some() {
            let mut entry = PronunciationHistoryEntry::scored(score.pronunciation_score, level);
            entry.original_score = score.external_score;
            entry.rhythm_score = Some(score.rhythm_score);
            entry.issues.clone_from(&score.issues);
            entry.transcript = request.transcript.clone();
            state.history.append(entry);

            if let Err(e) = self.history_store.save(&state.history) {
                tracing::warn!(error = %e, "failed to persist history");
            }
            tracing::info!(
                turn = turn_id,
                score = score.pronunciation_score,
                "pronunciation scored"
            );
        }

        if state.is_current(turn_id) {
            state.banner = Some(MetricsBanner {
                turn: turn_id,
                metrics,
                score,
            });
        }
    }

    fn spawn_playback(this: &Arc<Self>, url: String) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.playback.play(&url).await;
        });
    }
}
