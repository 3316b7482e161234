//! Boundary to the platform Audio Engine and the glue that moves PCM
//! between it and the transport.
//!
//! - `pcm`: base64 transcoding of little-endian PCM16.
//! - `backlog`: bounded drop-oldest queue of encoded chunks awaiting transport capacity.

pub mod backlog;
pub mod pcm;

pub use backlog::{AudioBacklog, FlushOutcome};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::AudioConfig;
use crate::error::AudioCaptureError;

/// Constraints requested from the capture device.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub enable_vad: bool,
    pub speech_threshold: f32,
}

impl From<&AudioConfig> for CaptureConstraints {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            enable_vad: config.enable_vad,
            speech_threshold: config.speech_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeData {
    pub volume: f32,
    pub is_speaking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechStateData {
    pub is_speaking: bool,
    pub timestamp: i64,
}

/// One captured block of mono PCM16 samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub timestamp: i64,
}

/// Events produced by the engine while capture is running.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEngineEvent {
    Volume(VolumeData),
    SpeechState(SpeechStateData),
    Chunk(AudioChunk),
}

/// Microphone and speaker access, implemented outside this crate.
///
/// `start_input` acquires the capture device with the given constraints and
/// returns the stream of capture events; the stream ends when capture stops.
/// `stop_input` stops capture and releases the device. It must be safe to
/// call when nothing is capturing. Volumes are gains in `0.0..=1.0`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioEngine: Send + Sync {
    async fn start_input(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<mpsc::Receiver<AudioEngineEvent>, AudioCaptureError>;

    fn stop_input(&self);

    /// Queues little-endian PCM16 bytes for playback.
    fn enqueue_playback(&self, pcm: Bytes);

    fn set_input_volume(&self, volume: f32);

    fn set_output_volume(&self, volume: f32);
}
