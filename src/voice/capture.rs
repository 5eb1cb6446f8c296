//! Audio capture from microphone

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, PlayStreamError, SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Capture is buffered in slices of this length
pub const SLICE_MS: u32 = 250;

const SLICE_SAMPLES: usize = (SAMPLE_RATE * SLICE_MS / 1000) as usize;

/// One finished recording, encoded for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl RecordedAudio {
    /// Encode mono samples as 16-bit WAV
    ///
    /// # Errors
    ///
    /// Returns `EmptyRecording` for no samples, or an audio error if encoding fails
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::EmptyRecording);
        }
        Ok(Self {
            bytes: samples_to_wav(samples, sample_rate)?,
            mime_type: "audio/wav".to_string(),
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Exclusive microphone input
pub trait AudioSource: Send {
    /// Acquire the input device and begin buffering
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` if the device cannot be acquired
    fn start(&mut self) -> Result<()>;

    /// Release the device and return the assembled recording
    ///
    /// # Errors
    ///
    /// Returns `EmptyRecording` if nothing was captured
    fn stop(&mut self) -> Result<RecordedAudio>;

    /// Whether the device is currently held
    fn is_capturing(&self) -> bool;
}

/// Accumulates samples into fixed-length slices
///
/// The trailing partial slice is kept on `finish`, so very short recordings
/// still produce audio.
#[derive(Debug, Default)]
pub struct SliceBuffer {
    slices: Vec<Vec<f32>>,
    current: Vec<f32>,
}

impl SliceBuffer {
    pub fn push(&mut self, mut data: &[f32]) {
        while !data.is_empty() {
            let room = SLICE_SAMPLES - self.current.len();
            let (head, tail) = data.split_at(room.min(data.len()));
            self.current.extend_from_slice(head);
            if self.current.len() == SLICE_SAMPLES {
                self.slices.push(std::mem::take(&mut self.current));
            }
            data = tail;
        }
    }

    /// Number of completed slices
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Current samples without clearing
    #[must_use]
    pub fn peek(&self) -> Vec<f32> {
        self.slices
            .iter()
            .flatten()
            .chain(self.current.iter())
            .copied()
            .collect()
    }

    /// Drain all samples, including the partial slice
    pub fn finish(&mut self) -> Vec<f32> {
        let samples = self.peek();
        self.slices.clear();
        self.current.clear();
        samples
    }
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Captures audio from the default input device
///
/// The cpal stream lives on a dedicated thread, which keeps this type `Send`
/// and lets `stop` release the device synchronously.
pub struct AudioCapture {
    buffer: Arc<Mutex<SliceBuffer>>,
    worker: Option<CaptureWorker>,
}

impl AudioCapture {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(SliceBuffer::default())),
            worker: None,
        }
    }

    /// Current samples without clearing
    #[must_use]
    pub fn peek_buffer(&self) -> Vec<f32> {
        self.buffer.lock().map(|b| b.peek()).unwrap_or_default()
    }

    /// Drop buffered samples
    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.finish();
        }
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn open_stream(buffer: Arc<Mutex<SliceBuffer>>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::PermissionDenied("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config: StreamConfig = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            "opening input stream"
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.push(data);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| match e {
                BuildStreamError::DeviceNotAvailable => {
                    Error::PermissionDenied("input device not available".to_string())
                }
                other => Error::Audio(other.to_string()),
            })?;

        stream.play().map_err(|e| match e {
            PlayStreamError::DeviceNotAvailable => {
                Error::PermissionDenied("input device not available".to_string())
            }
            other => Error::Audio(other.to_string()),
        })?;

        Ok(stream)
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for AudioCapture {
    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.clear_buffer();

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let buffer = Arc::clone(&self.buffer);

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || match Self::open_stream(buffer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hold the device until stop is requested or the sender drops
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop_tx, thread });
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("capture thread exited".to_string()))
            }
        }
    }

    fn stop(&mut self) -> Result<RecordedAudio> {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                tracing::warn!("audio capture thread panicked");
            }
            tracing::debug!("audio capture stopped");
        }

        let samples = self
            .buffer
            .lock()
            .map(|mut b| b.finish())
            .unwrap_or_default();

        tracing::debug!(samples = samples.len(), "recording assembled");
        RecordedAudio::from_samples(&samples, SAMPLE_RATE)
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
        }
    }
}

/// Convert f32 samples to WAV bytes for upload
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// RMS and peak level of a sample block in dBFS
#[must_use]
pub fn level_dbfs(samples: &[f32]) -> (f32, f32) {
    if samples.is_empty() {
        return (f32::NEG_INFINITY, f32::NEG_INFINITY);
    }
    #[allow(clippy::cast_precision_loss)]
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    (10.0 * mean_square.log10(), 20.0 * peak.log10())
}
