//! Speech recognition wrapper.
//!
//! The concrete recognizer is a capability: anything that can turn a PCM
//! segment into text with word timings plugs in behind [`Recognizer`].
//! The engine owns timeout handling, the warm-up grace for the first
//! inference, word-timing sanitization, and failure accounting.

pub mod mock;

use crate::config::{AsrConfig, Device};
use crate::error::{LiveError, Result};
use crate::pipeline::messages::{SpeechSegment, WordTiming};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Raw recognition output before post-processing.
#[derive(Debug, Clone, Default)]
pub struct Recognition {
    pub text: String,
    /// Word timings relative to the segment start, seconds.
    pub words: Vec<WordTiming>,
    /// Mean confidence in [0, 1].
    pub mean_confidence: f32,
}

/// Recognition model capability.
///
/// Implementations are synchronous and CPU-bound; the engine calls them on
/// the blocking pool.
pub trait Recognizer: Send + Sync + 'static {
    /// Recognize one segment of PCM16 audio.
    ///
    /// # Errors
    ///
    /// Returns an error when inference fails; the engine counts and
    /// swallows it.
    fn recognize(&self, pcm: &[i16], sample_rate: u32) -> Result<Recognition>;

    /// Whether `words` timings are populated.
    fn supports_word_timings(&self) -> bool;

    /// Sample rate the model expects.
    fn expected_sample_rate(&self) -> u32;
}

/// Compute device actually used for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedDevice {
    Cpu,
    Cuda,
}

/// Resolve the device preference order: configured > CUDA if present > CPU.
pub fn resolve_device(pref: Device) -> ResolvedDevice {
    match pref {
        Device::Cpu => ResolvedDevice::Cpu,
        Device::Cuda => ResolvedDevice::Cuda,
        Device::Auto => {
            if cuda_available() {
                ResolvedDevice::Cuda
            } else {
                ResolvedDevice::Cpu
            }
        }
    }
}

fn cuda_available() -> bool {
    std::path::Path::new("/proc/driver/nvidia/version").exists()
}

/// Engine wrapping a recognizer with timeouts and warm-up accounting.
pub struct AsrEngine {
    recognizer: Arc<dyn Recognizer>,
    config: AsrConfig,
    device: ResolvedDevice,
    started: Instant,
    first_done: AtomicBool,
}

impl std::fmt::Debug for AsrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsrEngine")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("started", &self.started)
            .field("first_done", &self.first_done)
            .finish()
    }
}

impl AsrEngine {
    /// Create the engine around a recognizer capability.
    ///
    /// # Errors
    ///
    /// Returns a config error when the recognizer's expected sample rate
    /// differs from the pipeline rate.
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        config: &AsrConfig,
        pipeline_rate: u32,
    ) -> Result<Self> {
        if recognizer.expected_sample_rate() != pipeline_rate {
            return Err(LiveError::Config(format!(
                "recognizer expects {} Hz, pipeline runs at {pipeline_rate} Hz",
                recognizer.expected_sample_rate()
            )));
        }
        let device = resolve_device(config.device);
        info!(?device, "ASR engine ready");
        Ok(Self {
            recognizer,
            config: config.clone(),
            device,
            started: Instant::now(),
            first_done: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> ResolvedDevice {
        self.device
    }

    /// True while the first inference has not completed inside the warm-up
    /// window; surfaced through `status()` as `model_loading`.
    pub fn model_loading(&self) -> bool {
        !self.first_done.load(Ordering::Relaxed)
            && self.started.elapsed().as_secs_f64() < self.config.warmup_sec
    }

    /// Recognize one segment.
    ///
    /// Returns `Ok(None)` for a successful empty recognition (a non-event)
    /// and `Err` on failure or timeout.
    pub async fn transcribe(&self, segment: &SpeechSegment) -> Result<Option<Recognition>> {
        let pcm = segment.pcm.clone();
        let rate = self.recognizer.expected_sample_rate();
        let recognizer = Arc::clone(&self.recognizer);
        let duration = segment.duration() as f32;

        // The first inference may still be paging in model weights.
        let mut budget = Duration::from_secs_f64(self.config.timeout_sec);
        if !self.first_done.load(Ordering::Relaxed) {
            budget += Duration::from_secs_f64(self.config.warmup_sec);
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            budget,
            tokio::task::spawn_blocking(move || recognizer.recognize(&pcm, rate)),
        )
        .await;

        let recognition = match outcome {
            Err(_) => {
                warn!(segment_id = %segment.segment_id, "recognition timed out");
                return Err(LiveError::Asr("recognition timed out".to_owned()));
            }
            Ok(Err(join)) => {
                return Err(LiveError::Asr(format!("recognition task failed: {join}")));
            }
            Ok(Ok(Err(e))) => {
                warn!(segment_id = %segment.segment_id, "recognition failed: {e}");
                return Err(e);
            }
            Ok(Ok(Ok(r))) => r,
        };

        self.first_done.store(true, Ordering::Relaxed);
        let latency_ms = started.elapsed().as_millis();
        if recognition.text.trim().is_empty() {
            return Ok(None);
        }
        info!(
            segment_id = %segment.segment_id,
            latency_ms,
            text = %recognition.text,
            "segment recognized"
        );

        let mut recognition = recognition;
        recognition.mean_confidence = recognition.mean_confidence.clamp(0.0, 1.0);
        recognition.words = sanitize_words(recognition.words, duration);
        Ok(Some(recognition))
    }
}

/// Clamp word timings into the segment and force monotonic ordering.
fn sanitize_words(words: Vec<WordTiming>, duration: f32) -> Vec<WordTiming> {
    let mut out: Vec<WordTiming> = Vec::with_capacity(words.len());
    let mut cursor = 0.0f32;
    for mut w in words {
        w.start = w.start.clamp(cursor, duration);
        w.end = w.end.clamp(w.start, duration);
        cursor = w.end;
        out.push(w);
    }
    out
}
