//! Audio engine for hosts without a capture device.
//!
//! Capture always reports the device as unavailable. Inbound PCM16 is
//! optionally appended to a raw file that can be played back later, e.g.
//! `ffplay -f s16le -ar 16000 -ac 1 <file>`. Writes happen on a separate
//! task so the session never waits on the disk.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use synapse_core::AudioCaptureError;
use synapse_core::audio::{AudioEngine, AudioEngineEvent, CaptureConstraints};

const WRITE_QUEUE: usize = 64;

enum Write {
    Pcm(Bytes),
    Flush(oneshot::Sender<()>),
}

pub struct FilePlayback {
    writer: Option<mpsc::Sender<Write>>,
    /// Output gain as `f32` bits.
    gain: AtomicU32,
}

impl FilePlayback {
    /// An engine that discards inbound audio.
    pub fn discard() -> Self {
        Self {
            writer: None,
            gain: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// An engine that appends inbound audio to `path`, creating it if needed.
    pub async fn to_file(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        let (tx, mut rx) = mpsc::channel(WRITE_QUEUE);
        tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                match write {
                    Write::Pcm(pcm) => {
                        if let Err(e) = file.write_all(&pcm).await {
                            warn!(error = %e, "Failed to write playback audio; further audio is discarded");
                            return;
                        }
                    }
                    Write::Flush(done) => {
                        if let Err(e) = file.flush().await {
                            warn!(error = %e, "Failed to flush playback file");
                        }
                        let _ = done.send(());
                    }
                }
            }
        });
        Ok(Self {
            writer: Some(tx),
            gain: AtomicU32::new(1.0f32.to_bits()),
        })
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    /// Waits until everything queued so far has reached the file.
    pub async fn flush(&self) {
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        let (done, flushed) = oneshot::channel();
        if writer.send(Write::Flush(done)).await.is_ok() {
            let _ = flushed.await;
        }
    }
}

#[async_trait]
impl AudioEngine for FilePlayback {
    async fn start_input(
        &self,
        _constraints: CaptureConstraints,
    ) -> Result<mpsc::Receiver<AudioEngineEvent>, AudioCaptureError> {
        Err(AudioCaptureError::DeviceUnavailable(
            "this build has no capture device".to_string(),
        ))
    }

    fn stop_input(&self) {}

    fn enqueue_playback(&self, pcm: Bytes) {
        let Some(writer) = self.writer.as_ref() else {
            debug!(len = pcm.len(), "Discarding inbound audio");
            return;
        };
        let pcm = scale_pcm16(pcm, self.gain());
        match writer.try_send(Write::Pcm(pcm)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Playback writer is behind; audio chunk dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Playback writer stopped; audio chunk dropped");
            }
        }
    }

    fn set_input_volume(&self, volume: f32) {
        debug!(volume, "No capture device; input volume ignored");
    }

    fn set_output_volume(&self, volume: f32) {
        self.gain.store(volume.to_bits(), Ordering::Relaxed);
    }
}

/// Applies `gain` to little-endian PCM16. A trailing odd byte is kept as is.
fn scale_pcm16(pcm: Bytes, gain: f32) -> Bytes {
    if gain == 1.0 {
        return pcm;
    }
    let mut scaled = Vec::with_capacity(pcm.len());
    let mut samples = pcm.chunks_exact(2);
    for sample in &mut samples {
        let value = i16::from_le_bytes([sample[0], sample[1]]) as f32 * gain;
        let value = value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        scaled.extend_from_slice(&value.to_le_bytes());
    }
    scaled.extend_from_slice(samples.remainder());
    Bytes::from(scaled)
}
