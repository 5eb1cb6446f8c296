//! Client for the speaking metrics endpoint

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;

use super::SpeakingMetrics;
use crate::{Error, Level, Result};

/// Body of `POST /api/speaking/metrics`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,

    pub level: Level,
}

impl MetricsRequest {
    /// Build a request carrying the audio inline as a data URL
    #[must_use]
    pub fn inline(audio: &[u8], mime_type: &str, level: Level) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        Self {
            audio_base64: Some(format!("data:{mime_type};base64,{encoded}")),
            audio_url: None,
            transcript: None,
            level,
        }
    }

    #[must_use]
    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }
}

/// Remote computation of acoustic metrics for a recording
#[async_trait]
pub trait MetricsService: Send + Sync {
    /// Analyze one recording
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the response is malformed
    async fn analyze(&self, request: &MetricsRequest) -> Result<SpeakingMetrics>;
}

/// HTTP implementation of [`MetricsService`]
#[derive(Clone)]
pub struct HttpMetricsClient {
    client: Client,
    base_url: String,
}

impl HttpMetricsClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MetricsService for HttpMetricsClient {
    async fn analyze(&self, request: &MetricsRequest) -> Result<SpeakingMetrics> {
        let response = self
            .client
            .post(format!("{}/api/speaking/metrics", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Metrics(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Metrics(format!("{status} - {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Metrics(format!("invalid metrics response: {e}")))
    }
}
