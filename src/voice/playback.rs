//! Reply audio playback
//!
//! [`PlaybackEngine`] fetches a remote clip, decodes it and hands samples to an
//! [`AudioSink`]. It plays each distinct URL at most once per turn and never
//! propagates failures to the caller.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Delay between decode and playback start
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);

/// Decoded mono PCM
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.samples.len() as u64 * 1000 / u64::from(self.sample_rate))
    }
}

/// Retrieves remote audio assets
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    /// Download the asset at `url`
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or returns a non-success status
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetches audio over HTTP
#[derive(Clone, Default)]
pub struct HttpAudioFetcher {
    client: reqwest::Client,
}

impl HttpAudioFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioFetcher for HttpAudioFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Playback(format!(
                "fetch {url} failed: {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Output device; `play` blocks until the clip has finished
pub trait AudioSink: Send + Sync {
    /// Play decoded audio to completion
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or playback fails
    fn play(&self, audio: &DecodedAudio) -> Result<()>;
}

/// Plays audio to the default output device
pub struct CpalSink;

impl CpalSink {
    /// Verify an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            "audio playback initialized"
        );
        Ok(Self)
    }

    fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
        let rate = SampleRate(sample_rate);
        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        };

        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            })
            .ok_or_else(|| {
                Error::Audio(format!("no output config for {sample_rate} Hz"))
            })?;

        Ok(supported.with_sample_rate(rate).config())
    }
}

impl AudioSink for CpalSink {
    fn play(&self, audio: &DecodedAudio) -> Result<()> {
        if audio.samples.is_empty() {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))?;
        let config = Self::output_config(&device, audio.sample_rate)?;
        let channels = usize::from(config.channels);

        let samples = Arc::new(audio.samples.clone());
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let finished = Arc::clone(&finished);
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for frame in data.chunks_mut(channels) {
                            let pos = position.load(Ordering::Relaxed);
                            let sample = samples.get(pos).copied().unwrap_or_else(|| {
                                finished.store(true, Ordering::Release);
                                0.0
                            });
                            frame.fill(sample);
                            if pos < samples.len() {
                                position.store(pos + 1, Ordering::Relaxed);
                            }
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        // Poll for completion with timeout
        let start = std::time::Instant::now();
        let timeout = audio.duration() + Duration::from_millis(500);
        while !finished.load(Ordering::Acquire) {
            if start.elapsed() > timeout {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        // Small delay to ensure audio finishes
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = samples.len(), "playback complete");
        Ok(())
    }
}

/// Result of a `play` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Played,
    /// URL already played, or playing, this turn
    Skipped,
    /// Fetch, decode or device failure; already logged
    Failed,
    /// Engine has been disposed
    Disposed,
}

/// Session-scoped playback resource
pub struct PlaybackEngine {
    fetcher: Arc<dyn AudioFetcher>,
    sink: Arc<dyn AudioSink>,
    settle: Duration,
    speaking: Arc<AtomicBool>,
    log: Mutex<PlayLog>,
    disposed: AtomicBool,
}

/// Per-turn record of clips
#[derive(Debug, Default)]
struct PlayLog {
    /// Played or in flight; a failed attempt is released again
    claimed: HashSet<String>,
    /// Last clip that reached the device
    last_played: Option<String>,
}

/// Clears the speaking flag however playback ends
struct SpeakingGuard(Arc<AtomicBool>);

impl SpeakingGuard {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PlaybackEngine {
    #[must_use]
    pub fn new(fetcher: Arc<dyn AudioFetcher>, sink: Arc<dyn AudioSink>, settle: Duration) -> Self {
        Self {
            fetcher,
            sink,
            settle,
            speaking: Arc::new(AtomicBool::new(false)),
            log: Mutex::new(PlayLog::default()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Play the clip at `url` unless it already played this turn
    pub async fn play(&self, url: &str) -> PlayOutcome {
        if self.disposed.load(Ordering::SeqCst) {
            return PlayOutcome::Disposed;
        }

        {
            let Ok(mut log) = self.log.lock() else {
                return PlayOutcome::Failed;
            };
            if !log.claimed.insert(url.to_string()) {
                tracing::debug!(url, "skipping playback: URL already played this turn");
                return PlayOutcome::Skipped;
            }
        }

        let result = self.fetch_and_play(url).await;
        let Ok(mut log) = self.log.lock() else {
            return PlayOutcome::Failed;
        };
        match result {
            Ok(()) => {
                log.last_played = Some(url.to_string());
                PlayOutcome::Played
            }
            Err(Error::Cancelled) => {
                log.claimed.remove(url);
                PlayOutcome::Disposed
            }
            Err(e) => {
                log.claimed.remove(url);
                tracing::warn!(url, error = %e, "playback failed");
                PlayOutcome::Failed
            }
        }
    }

    async fn fetch_and_play(&self, url: &str) -> Result<()> {
        let data = self.fetcher.fetch(url).await?;
        tracing::debug!(url, bytes = data.len(), "audio fetched");

        let audio = decode(&data)?;
        tracing::debug!(duration = ?audio.duration(), "audio decoded");

        // Starting immediately after decode garbles the first samples on some devices
        tokio::time::sleep(self.settle).await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let _speaking = SpeakingGuard::raise(&self.speaking);
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.play(&audio))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }

    /// Forget this turn's clips so the next turn can play them again
    pub fn reset_turn(&self) {
        if let Ok(mut log) = self.log.lock() {
            *log = PlayLog::default();
        }
    }

    /// Last clip that played through to the device this turn
    #[must_use]
    pub fn last_played_url(&self) -> Option<String> {
        self.log.lock().ok().and_then(|l| l.last_played.clone())
    }

    /// Whether a clip is currently audible
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Refuse further playback; in-flight clips finish on their own
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Decode WAV or MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is neither valid WAV nor MP3
pub fn decode(data: &[u8]) -> Result<DecodedAudio> {
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_mp3(data)
    }
}

fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let mut reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Playback(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Playback(e.to_string()))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| {
                    #[allow(clippy::cast_precision_loss)]
                    let v = v as f32;
                    v / scale
                }))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(e.to_string()))?
        }
    };

    Ok(DecodedAudio {
        samples: downmix(&interleaved, channels),
        sample_rate: spec.sample_rate,
    })
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                #[allow(clippy::cast_sign_loss)]
                {
                    sample_rate = frame.sample_rate as u32;
                }
                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&pcm, frame.channels.max(1)));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(Error::Playback("no audio frames decoded".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Average interleaved channels down to mono
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let n = channels as f32;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / n)
        .collect()
}
