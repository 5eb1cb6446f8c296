//! Voice I/O
//!
//! Microphone capture for the learner's utterance and playback of the
//! tutor's reply audio.

mod capture;
mod playback;

pub use capture::{
    AudioCapture, AudioSource, RecordedAudio, SAMPLE_RATE, SLICE_MS, SliceBuffer, level_dbfs,
    samples_to_wav,
};
pub use playback::{
    AudioFetcher, AudioSink, CpalSink, DEFAULT_SETTLE_DELAY, DecodedAudio, HttpAudioFetcher,
    PlayOutcome, PlaybackEngine, decode,
};
