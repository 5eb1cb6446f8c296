//! Streaming response client
//!
//! One call to [`StreamingClient::start`] runs the two-phase exchange with the
//! inference service: a blocking transcription, then a stream of conversation
//! snapshots. Events arrive on a [`StreamHandle`] in order; cancelling the
//! handle stops the network work and suppresses any further events.

mod http;
pub mod retry;

pub use http::HttpInferenceService;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::voice::RecordedAudio;
use crate::{AudioRef, ConversationMessage, Error, Level, PracticeMode, Result};

/// Buffered events per stream before the producer waits
const EVENT_BUFFER: usize = 32;

/// One incremental server conversation state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Full message list to date
    pub messages: Vec<ConversationMessage>,

    /// Reply audio surfaced with this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<AudioRef>,
}

impl Snapshot {
    #[must_use]
    pub const fn new(messages: Vec<ConversationMessage>) -> Self {
        Self {
            messages,
            audio_ref: None,
        }
    }

    #[must_use]
    pub fn with_audio(mut self, audio_ref: AudioRef) -> Self {
        self.audio_ref = Some(audio_ref);
        self
    }
}

/// Event delivered to the consumer of a [`StreamHandle`]
#[derive(Debug)]
pub enum StreamEvent {
    Snapshot(Snapshot),
    Complete,
    Error(Error),
}

/// Remote transcription and reply generation
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Transcribe the recording; returns `history` with the learner's message appended
    ///
    /// # Errors
    ///
    /// Returns `Transcription` if the service rejects or cannot process the audio
    async fn transcribe(
        &self,
        audio: &RecordedAudio,
        history: &[ConversationMessage],
        level: Level,
    ) -> Result<Vec<ConversationMessage>>;

    /// Begin generating the reply to `messages`
    ///
    /// # Errors
    ///
    /// Returns `Stream` if the reply stream cannot be opened
    async fn reply(
        &self,
        messages: Vec<ConversationMessage>,
        level: Level,
        mode: PracticeMode,
    ) -> Result<BoxStream<'static, Result<Snapshot>>>;
}

/// Decides which audio references reach the consumer
#[derive(Debug)]
struct AudioPolicy {
    mode: PracticeMode,
    surfaced: HashSet<AudioRef>,
    held: Option<AudioRef>,
}

impl AudioPolicy {
    fn new(mode: PracticeMode) -> Self {
        Self {
            mode,
            surfaced: HashSet::new(),
            held: None,
        }
    }

    /// Hybrid surfaces each new reference; immersive holds the latest one back
    fn filter(&mut self, snapshot: &mut Snapshot) {
        let Some(audio) = snapshot.audio_ref.take() else {
            return;
        };
        match self.mode {
            PracticeMode::Hybrid => {
                if self.surfaced.insert(audio.clone()) {
                    snapshot.audio_ref = Some(audio);
                }
            }
            PracticeMode::Immersive => self.held = Some(audio),
        }
    }

    fn take_held(&mut self) -> Option<AudioRef> {
        self.held.take()
    }
}

/// Starts streaming exchanges against an [`InferenceService`]
#[derive(Clone)]
pub struct StreamingClient {
    service: Arc<dyn InferenceService>,
}

impl StreamingClient {
    #[must_use]
    pub fn new(service: Arc<dyn InferenceService>) -> Self {
        Self { service }
    }

    /// Submit `audio` after `history` and begin receiving events
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        &self,
        audio: RecordedAudio,
        history: Vec<ConversationMessage>,
        level: Level,
        mode: PracticeMode,
    ) -> StreamHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let producer = Producer {
            service: Arc::clone(&self.service),
            tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(producer.run(audio, history, level, mode));

        StreamHandle {
            events: rx,
            cancel,
            task,
        }
    }
}

struct Producer {
    service: Arc<dyn InferenceService>,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl Producer {
    async fn run(
        self,
        audio: RecordedAudio,
        history: Vec<ConversationMessage>,
        level: Level,
        mode: PracticeMode,
    ) {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("stream cancelled");
            }
            result = self.exchange(&audio, &history, level, mode) => {
                let event = match result {
                    Ok(()) => StreamEvent::Complete,
                    Err(e) => StreamEvent::Error(e),
                };
                self.emit(event).await;
            }
        }
    }

    async fn exchange(
        &self,
        audio: &RecordedAudio,
        history: &[ConversationMessage],
        level: Level,
        mode: PracticeMode,
    ) -> Result<()> {
        let messages = self.service.transcribe(audio, history, level).await?;
        tracing::debug!(messages = messages.len(), "transcription received");
        self.emit(StreamEvent::Snapshot(Snapshot::new(messages.clone())))
            .await;

        let mut replies = self.service.reply(messages, level, mode).await?;
        let mut policy = AudioPolicy::new(mode);
        let mut latest = Vec::new();

        while let Some(snapshot) = replies.next().await {
            let mut snapshot = snapshot?;
            policy.filter(&mut snapshot);
            latest.clone_from(&snapshot.messages);
            tracing::trace!(
                messages = snapshot.messages.len(),
                audio = snapshot.audio_ref.is_some(),
                "snapshot received"
            );
            self.emit(StreamEvent::Snapshot(snapshot)).await;
        }

        if let Some(audio) = policy.take_held() {
            self.emit(StreamEvent::Snapshot(Snapshot::new(latest).with_audio(audio)))
                .await;
        }
        Ok(())
    }

    async fn emit(&self, event: StreamEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        // Receiver gone means the consumer stopped listening
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
        }
    }
}

/// Consumer side of one streaming exchange
pub struct StreamHandle {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Next event in arrival order; `None` once finished or cancelled
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Stop the exchange; safe to call more than once
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("cancelling stream");
        }
        self.cancel.cancel();
        self.task.abort();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
