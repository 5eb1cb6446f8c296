//! Shared test utilities
//!
//! In-process fakes for every collaborator of a session, so turns can run
//! without audio hardware or network access.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use voice_tutor::escalation::{
    EscalationRecord, EscalationRequest, EscalationService, EscalationStatus,
};
use voice_tutor::history::{HistoryStore, MemoryHistoryStore};
use voice_tutor::metrics::{MetricsRequest, MetricsService};
use voice_tutor::voice::{
    AudioFetcher, AudioSink, AudioSource, DecodedAudio, RecordedAudio, samples_to_wav,
};
use voice_tutor::{
    AudioRef, ConversationMessage, Error, Level, PracticeMode, Result, Role, SessionController,
    SessionOptions, SessionServices, Snapshot, SpeakingMetrics,
};

/// Base URL the fakes resolve server-side audio paths against
pub const FILE_BASE: &str = "http://tutor.test";

/// Microphone that returns canned bytes
#[derive(Default)]
pub struct FakeSource {
    pub bytes: Vec<u8>,
    pub deny: bool,
    capturing: bool,
    pub starts: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            ..Self::default()
        }
    }

    /// Source whose device access is always refused
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }
}

impl AudioSource for FakeSource {
    fn start(&mut self) -> Result<()> {
        if self.deny {
            return Err(Error::PermissionDenied("denied by test".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.capturing = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<RecordedAudio> {
        self.capturing = false;
        if self.bytes.is_empty() {
            return Err(Error::EmptyRecording);
        }
        Ok(RecordedAudio {
            bytes: self.bytes.clone(),
            mime_type: "audio/wav".into(),
        })
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }
}

/// Increments a counter when the reply stream it lives in is dropped
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted inference service
///
/// `transcribe` echoes the history plus `transcript`. Each `reply` call pops
/// the next script; snapshots there list only the messages after the user's,
/// and are prefixed with the full conversation before being yielded.
pub struct FakeInference {
    pub transcript: String,
    pub fail_transcription: bool,
    /// Time each transcription takes
    pub transcribe_delay: Duration,
    scripts: Mutex<VecDeque<Vec<Result<Snapshot>>>>,
    /// Leave the reply stream open after the script runs out
    pub hang: bool,
    /// Pause between scripted snapshots
    pub pace: Duration,
    pub transcribe_calls: AtomicUsize,
    pub reply_drops: Arc<AtomicUsize>,
}

impl FakeInference {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: transcript.to_string(),
            fail_transcription: false,
            transcribe_delay: Duration::ZERO,
            scripts: Mutex::new(VecDeque::new()),
            hang: false,
            pace: Duration::ZERO,
            transcribe_calls: AtomicUsize::new(0),
            reply_drops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue the snapshots for the next reply
    pub fn script(self, replies: Vec<Result<Snapshot>>) -> Self {
        self.scripts.lock().unwrap().push_back(replies);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn slow_transcription(mut self, delay: Duration) -> Self {
        self.transcribe_delay = delay;
        self
    }

    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn transcribe_calls(&self) -> usize {
        self.transcribe_calls.load(Ordering::SeqCst)
    }

    pub fn reply_drops(&self) -> usize {
        self.reply_drops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl voice_tutor::InferenceService for FakeInference {
    async fn transcribe(
        &self,
        _audio: &RecordedAudio,
        history: &[ConversationMessage],
        _level: Level,
    ) -> Result<Vec<ConversationMessage>> {
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.transcribe_delay.is_zero() {
            tokio::time::sleep(self.transcribe_delay).await;
        }
        if self.fail_transcription {
            return Err(Error::Transcription("503 Service Unavailable".into()));
        }
        let mut messages = history.to_vec();
        messages.push(ConversationMessage::text(Role::User, &self.transcript));
        Ok(messages)
    }

    async fn reply(
        &self,
        messages: Vec<ConversationMessage>,
        _level: Level,
        _mode: PracticeMode,
    ) -> Result<BoxStream<'static, Result<Snapshot>>> {
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let pace = self.pace;
        let guard = DropCounter(Arc::clone(&self.reply_drops));

        let prefixed = script.into_iter().map(move |item| {
            item.map(|mut snapshot| {
                let mut full = messages.clone();
                full.append(&mut snapshot.messages);
                snapshot.messages = full;
                snapshot
            })
        });
        let head = stream::iter(prefixed).then(move |item| async move {
            if !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
            item
        });
        let tail = if self.hang {
            stream::pending::<Result<Snapshot>>().boxed()
        } else {
            stream::empty::<Result<Snapshot>>().boxed()
        };

        Ok(head
            .chain(tail)
            .map(move |item| {
                let _keep = &guard;
                item
            })
            .boxed())
    }
}

/// Metrics service returning the same record for every request
pub struct FakeMetrics {
    pub metrics: SpeakingMetrics,
    pub fail: AtomicBool,
    pub requests: Mutex<Vec<MetricsRequest>>,
    /// Answer for the next request, returned after a delay
    delayed: Mutex<Option<(Duration, SpeakingMetrics)>>,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self {
            metrics: sample_metrics(),
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            delayed: Mutex::new(None),
        }
    }

    /// Make the next request return `metrics` after `delay`
    pub fn delay_next(&self, delay: Duration, metrics: SpeakingMetrics) {
        *self.delayed.lock().unwrap() = Some((delay, metrics));
    }

    pub fn transcripts(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.transcript.clone())
            .collect()
    }
}

#[async_trait]
impl MetricsService for FakeMetrics {
    async fn analyze(&self, request: &MetricsRequest) -> Result<SpeakingMetrics> {
        self.requests.lock().unwrap().push(request.clone());
        let delayed = self.delayed.lock().unwrap().take();
        if let Some((delay, metrics)) = delayed {
            tokio::time::sleep(delay).await;
            return Ok(metrics);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Metrics("503".into()));
        }
        Ok(self.metrics.clone())
    }
}

/// Serves a short WAV clip for any URL
#[derive(Default)]
pub struct FakeFetcher {
    pub fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(url.to_string());
        samples_to_wav(&[0.0; 160], 16_000)
    }
}

/// Output device that only counts clips
#[derive(Default)]
pub struct FakeSink {
    pub played: AtomicUsize,
}

impl AudioSink for FakeSink {
    fn play(&self, _audio: &DecodedAudio) -> Result<()> {
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Escalation endpoint that stores every request
#[derive(Default)]
pub struct FakeEscalation {
    pub requests: Mutex<Vec<EscalationRequest>>,
}

#[async_trait]
impl EscalationService for FakeEscalation {
    async fn create(&self, request: &EscalationRequest) -> Result<EscalationRecord> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(EscalationRecord {
            id: format!("esc-{}", requests.len()),
            status: EscalationStatus::Queued,
            created_at: "2026-10-15T09:00:00Z".into(),
            message_index: Some(request.turn_index),
        })
    }
}

/// A session wired to fakes, with handles to inspect them
pub struct Harness {
    pub session: SessionController,
    pub inference: Arc<FakeInference>,
    pub metrics: Arc<FakeMetrics>,
    pub fetcher: Arc<FakeFetcher>,
    pub sink: Arc<FakeSink>,
    pub escalation: Arc<FakeEscalation>,
    pub history: Arc<MemoryHistoryStore>,
}

impl Harness {
    pub fn new(inference: FakeInference) -> Self {
        Self::build(FakeSource::with_bytes(vec![1, 2, 3, 4]), inference, test_options())
    }

    pub fn build(source: FakeSource, inference: FakeInference, options: SessionOptions) -> Self {
        let inference = Arc::new(inference);
        let metrics = Arc::new(FakeMetrics::new());
        let fetcher = Arc::new(FakeFetcher::default());
        let sink = Arc::new(FakeSink::default());
        let escalation = Arc::new(FakeEscalation::default());
        let history = Arc::new(MemoryHistoryStore::new());

        let services = SessionServices {
            source: Box::new(source),
            inference: Arc::clone(&inference) as Arc<dyn voice_tutor::InferenceService>,
            metrics: Arc::clone(&metrics) as Arc<dyn MetricsService>,
            escalation: Arc::clone(&escalation) as Arc<dyn EscalationService>,
            history: Arc::clone(&history) as Arc<dyn HistoryStore>,
            fetcher: Arc::clone(&fetcher) as Arc<dyn AudioFetcher>,
            sink: Arc::clone(&sink) as Arc<dyn AudioSink>,
        };

        Self {
            session: SessionController::new(services, options),
            inference,
            metrics,
            fetcher,
            sink,
            escalation,
            history,
        }
    }

    pub fn played(&self) -> usize {
        self.sink.played.load(Ordering::SeqCst)
    }
}

/// Options with no playback delay and a known greeting
pub fn test_options() -> SessionOptions {
    SessionOptions {
        playback_settle: Duration::ZERO,
        stream_timeout: Duration::from_secs(30),
        greeting: Some("Hi! Ready to practice?".into()),
        escalation_enabled: true,
        file_base_url: FILE_BASE.into(),
        ..SessionOptions::default()
    }
}

/// Reply snapshot holding the assistant's text so far
pub fn reply_text(text: &str) -> Result<Snapshot> {
    Ok(Snapshot::new(vec![ConversationMessage::text(
        Role::Assistant,
        text,
    )]))
}

/// Reply snapshot with text and a reply clip
pub fn reply_with_audio(text: &str, url: &str) -> Result<Snapshot> {
    Ok(Snapshot::new(vec![
        ConversationMessage::text(Role::Assistant, text),
        ConversationMessage::audio(Role::Assistant, AudioRef::from_url(url)),
    ])
    .with_audio(AudioRef::from_url(url)))
}

/// Metrics for a steady B1 utterance
pub fn sample_metrics() -> SpeakingMetrics {
    SpeakingMetrics {
        duration_sec: 4.0,
        speaking_time_sec: 3.4,
        speech_ratio: 0.85,
        pause_ratio: 0.15,
        rms_dbfs: -20.0,
        peak_dbfs: -3.0,
        clipping_ratio: 0.0,
        words: Some(8),
        words_per_minute: Some(120.0),
        pronunciation_score: Some(82.0),
        ..SpeakingMetrics::default()
    }
}

/// Let spawned side tasks (metrics, playback) run to completion
pub async fn settle() {
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
