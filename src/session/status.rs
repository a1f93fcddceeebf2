//! Session counters and the externally visible status snapshot.

use crate::config::{SessionMode, VadConfig};
use crate::diarizer::DiarizerSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters incremented by the pipeline stages.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub total_audio_chunks: AtomicU64,
    pub successful_transcriptions: AtomicU64,
    pub failed_transcriptions: AtomicU64,
    /// Sum of confidences in micro-units, for the global mean.
    confidence_sum_micros: AtomicU64,
    pub relay_dropped: AtomicU64,
    pub analysis_skipped: AtomicU64,
    pub persist_failed: AtomicU64,
}

impl SessionMetrics {
    /// Record one successful transcription with its confidence.
    pub fn record_transcription(&self, confidence: f32) {
        let _ = self.successful_transcriptions.fetch_add(1, Ordering::Relaxed);
        let micros = (f64::from(confidence.clamp(0.0, 1.0)) * 1e6) as u64;
        let _ = self.confidence_sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Global mean confidence over all successful transcriptions.
    pub fn average_confidence(&self) -> f32 {
        let n = self.successful_transcriptions.load(Ordering::Relaxed);
        if n == 0 {
            return 0.0;
        }
        (self.confidence_sum_micros.load(Ordering::Relaxed) as f64 / 1e6 / n as f64) as f32
    }
}

/// Lifecycle state of the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Relay connection state surfaced through status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Connecting,
    Running,
    Reconnecting,
    Stopped,
    Failed,
}

/// Counter block of the status payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusStats {
    pub total_audio_chunks: u64,
    pub successful_transcriptions: u64,
    pub failed_transcriptions: u64,
    pub average_confidence: f32,
    pub relay_dropped: u64,
    pub analysis_skipped: u64,
    pub persist_failed: u64,
}

impl StatusStats {
    pub fn snapshot(metrics: &SessionMetrics) -> Self {
        Self {
            total_audio_chunks: metrics.total_audio_chunks.load(Ordering::Relaxed),
            successful_transcriptions: metrics.successful_transcriptions.load(Ordering::Relaxed),
            failed_transcriptions: metrics.failed_transcriptions.load(Ordering::Relaxed),
            average_confidence: metrics.average_confidence(),
            relay_dropped: metrics.relay_dropped.load(Ordering::Relaxed),
            analysis_skipped: metrics.analysis_skipped.load(Ordering::Relaxed),
            persist_failed: metrics.persist_failed.load(Ordering::Relaxed),
        }
    }
}

/// Advanced-parameter block of the status payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusAdvanced {
    pub persist_enabled: bool,
    pub persist_root: String,
    pub save_audio: bool,
    pub agc_enabled: bool,
    pub agc_gain: f32,
    pub diarizer: DiarizerSnapshot,
    pub max_speakers: usize,
    pub last_speaker: String,
    pub vad: VadConfig,
    pub model_loading: bool,
}

/// Full status snapshot handed to the external facade.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub is_running: bool,
    pub state: LifecycleState,
    pub session_id: Option<String>,
    pub room_id: Option<String>,
    pub live_url: Option<String>,
    pub mode: SessionMode,
    /// Epoch seconds.
    pub started_at: Option<f64>,
    pub relay: RelayState,
    pub stats: StatusStats,
    pub advanced: Option<StatusAdvanced>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            is_running: false,
            state: LifecycleState::Idle,
            session_id: None,
            room_id: None,
            live_url: None,
            mode: SessionMode::Stable,
            started_at: None,
            relay: RelayState::Stopped,
            stats: StatusStats::default(),
            advanced: None,
            last_error: None,
        }
    }
}
