//! HTTP inference transport
//!
//! Transcription is a multipart upload answered with the updated message list.
//! Replies stream back as newline-delimited JSON, one snapshot per line.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use super::retry::{self, RetryPolicy};
use super::{InferenceService, Snapshot};
use crate::voice::RecordedAudio;
use crate::{ConversationMessage, Error, Level, PracticeMode, Result};

#[derive(Deserialize)]
struct TranscriptionResponse {
    messages: Vec<ConversationMessage>,
}

#[derive(Serialize)]
struct ReplyRequest<'a> {
    messages: &'a [ConversationMessage],
    level: Level,
    mode: PracticeMode,
}

/// One NDJSON line of the reply stream
#[derive(Deserialize)]
#[serde(untagged)]
enum ReplyLine {
    Failure { error: String },
    Snapshot(Snapshot),
}

/// Inference service reached over HTTP
#[derive(Clone)]
pub struct HttpInferenceService {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpInferenceService {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn transcription_form(
        audio: &RecordedAudio,
        history: &[ConversationMessage],
        level: Level,
    ) -> Result<Form> {
        let part = Part::bytes(audio.bytes.clone())
            .file_name("recording.wav")
            .mime_str(&audio.mime_type)
            .map_err(|e| Error::Transcription(e.to_string()))?;

        Ok(Form::new()
            .part("audio", part)
            .text("history", serde_json::to_string(history)?)
            .text("level", level.as_str().to_string()))
    }
}

#[async_trait]
impl InferenceService for HttpInferenceService {
    async fn transcribe(
        &self,
        audio: &RecordedAudio,
        history: &[ConversationMessage],
        level: Level,
    ) -> Result<Vec<ConversationMessage>> {
        let url = format!("{}/api/transcribe", self.base_url);
        let attempts = self.retry.attempts();
        tracing::debug!(audio_bytes = audio.len(), %level, "starting transcription");

        for attempt in 0..attempts {
            let is_last = attempt + 1 == attempts;
            let form = Self::transcription_form(audio, history, level)?;

            let response = match self.client.post(&url).multipart(form).send().await {
                Ok(response) => response,
                Err(e) if !is_last && retry::is_recoverable_error(&e) => {
                    let delay = retry::delay_for_attempt(&self.retry, attempt, None);
                    tracing::warn!(attempt, error = %e, ?delay, "transcription request failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(Error::Transcription(e.to_string())),
            };

            let status = response.status();
            if status.is_success() {
                let result: TranscriptionResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Transcription(format!("invalid response: {e}")))?;
                tracing::info!(messages = result.messages.len(), "transcription complete");
                return Ok(result.messages);
            }

            if !is_last && retry::is_recoverable_status(status.as_u16()) {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(retry::parse_retry_after);
                let delay = retry::delay_for_attempt(&self.retry, attempt, retry_after);
                tracing::warn!(attempt, %status, ?delay, "transcription unavailable, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "transcription rejected");
            return Err(Error::Transcription(format!("{status}: {body}")));
        }

        Err(Error::Transcription("no attempts made".to_string()))
    }

    async fn reply(
        &self,
        messages: Vec<ConversationMessage>,
        level: Level,
        mode: PracticeMode,
    ) -> Result<BoxStream<'static, Result<Snapshot>>> {
        let url = format!("{}/api/reply", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ReplyRequest {
                messages: &messages,
                level,
                mode,
            })
            .send()
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stream(format!("{status}: {body}")));
        }

        tracing::debug!(%mode, "reply stream opened");
        Ok(ndjson_snapshots(response.bytes_stream()).boxed())
    }
}

struct LineState<B, E> {
    stream: BoxStream<'static, std::result::Result<B, E>>,
    buf: Vec<u8>,
    done: bool,
}

/// Split a byte stream into NDJSON snapshots, buffering partial lines
fn ndjson_snapshots<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<Snapshot>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = LineState {
        stream: byte_stream.boxed(),
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }

        loop {
            if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                match parse_line(&line) {
                    None => continue,
                    Some(Ok(snapshot)) => return Some((Ok(snapshot), st)),
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                }
            }

            match st.stream.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(Error::Stream(e.to_string())), st));
                }
                None => {
                    // Trailing line without a newline
                    st.done = true;
                    let rest = std::mem::take(&mut st.buf);
                    return parse_line(&rest).map(|item| (item, st));
                }
            }
        }
    })
}

fn parse_line(line: &[u8]) -> Option<Result<Snapshot>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(Error::Stream(format!("invalid utf-8 in stream: {e}")))),
    };
    if text.is_empty() {
        return None;
    }

    Some(match serde_json::from_str::<ReplyLine>(text) {
        Ok(ReplyLine::Snapshot(snapshot)) => Ok(snapshot),
        Ok(ReplyLine::Failure { error }) => Err(Error::Stream(error)),
        Err(e) => Err(Error::Stream(format!("malformed snapshot: {e}"))),
    })
}
