//! Configuration types for the live-analytics pipeline.
//!
//! Every section has serde defaults so a partial TOML file (or none at all)
//! yields a runnable configuration. Environment variables from the `LIVE_*`
//! table override file values; `validate()` enforces the documented ranges
//! and is called both at session start and on advanced-parameter updates.

use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for one analytics session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Audio ingest (muxer subprocess) settings.
    pub ingest: IngestConfig,
    /// Automatic gain control settings.
    pub agc: AgcConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech recognition settings.
    pub asr: AsrConfig,
    /// Speaker diarization settings.
    pub diarizer: DiarizerConfig,
    /// Transcript post-processing settings.
    pub text: TextConfig,
    /// Live-room event relay settings.
    pub relay: RelayConfig,
    /// Rolling analysis window settings.
    pub window: WindowConfig,
    /// LLM analysis workflow settings.
    pub analysis: AnalysisConfig,
    /// LLM provider connection settings.
    pub llm: LlmConfig,
    /// Artifact persistence settings.
    pub persist: PersistConfig,
    /// Session lifecycle settings.
    pub session: SessionConfig,
}

/// Audio ingest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Path to the muxer binary (ffmpeg-compatible CLI).
    pub muxer_bin: String,
    /// Frame duration in seconds. Range 0.2–2.0.
    pub chunk_sec: f64,
    /// Pipeline sample rate in Hz. The muxer is asked for this rate.
    pub sample_rate: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            muxer_bin: "ffmpeg".to_owned(),
            chunk_sec: 0.6,
            sample_rate: 16_000,
        }
    }
}

/// Automatic gain control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcConfig {
    /// Whether gain normalization is applied (gain = 1 when disabled).
    pub enabled: bool,
    /// Rolling RMS estimation window in seconds.
    pub window_sec: f64,
    /// Target RMS on the normalized [-1, 1] scale.
    pub target_rms: f32,
    /// RMS floor below which gain is not raised further.
    pub floor: f32,
    /// Minimum gain.
    pub g_min: f32,
    /// Maximum gain.
    pub g_max: f32,
    /// One-pole smoothing factor for gain changes.
    pub alpha: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_sec: 3.0,
            target_rms: 0.08,
            floor: 0.005,
            g_min: 0.5,
            g_max: 4.0,
            alpha: 0.1,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS threshold for classifying a frame as voiced. Range 0.001–0.2.
    pub min_rms: f32,
    /// Cumulative voiced duration required to open a segment. Range 0.2–2.5.
    pub min_speech_sec: f64,
    /// Silence duration that closes a segment. Range 0.2–2.5.
    pub min_silence_sec: f64,
    /// Grace period after speech drops below threshold. Range 0.1–1.5.
    pub hangover_sec: f64,
    /// Maximum segment duration before a forced cut. Range 2.0–15.0.
    pub force_flush_sec: f64,
    /// Audio tail carried into the next segment after a forced cut. Range 0.0–1.5.
    pub force_flush_overlap_sec: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            min_rms: 0.008,
            min_speech_sec: 0.4,
            min_silence_sec: 0.6,
            hangover_sec: 0.4,
            force_flush_sec: 8.0,
            force_flush_overlap_sec: 0.5,
        }
    }
}

/// Compute device preference for recognition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Probe for CUDA, fall back to CPU.
    #[default]
    Auto,
    /// Force CPU inference.
    Cpu,
    /// Force CUDA inference.
    Cuda,
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Compute device preference.
    pub device: Device,
    /// Per-segment recognition timeout in seconds.
    pub timeout_sec: f64,
    /// Grace period after session start during which slow first inference
    /// is reported as model loading rather than failure.
    pub warmup_sec: f64,
    /// Model weight cache directory (falls back to `MODEL_CACHE_DIR` / `HF_HOME`).
    pub model_cache_dir: Option<PathBuf>,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            device: Device::Auto,
            timeout_sec: 30.0,
            warmup_sec: 30.0,
            model_cache_dir: None,
        }
    }
}

/// Speaker diarization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiarizerConfig {
    /// Whether diarization runs at all (all segments `unknown` when off).
    pub enabled: bool,
    /// Maximum number of tracked speakers. Range 1–4.
    pub max_speakers: usize,
    /// Voiced audio required before the host label is fixed. Range 1–20.
    pub enroll_sec: f64,
    /// Voiced audio below which segments are labeled `unknown`. Range 0–20.
    /// Defaults to 0.75 × `enroll_sec` when absent.
    pub warmup_sec: Option<f64>,
    /// EMA factor for centroid updates. Range 0.05–0.6.
    pub smooth: f32,
    /// Cosine distance above which a new centroid is created.
    pub new_speaker_distance: f32,
}

impl Default for DiarizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_speakers: 2,
            enroll_sec: 4.0,
            warmup_sec: None,
            smooth: 0.2,
            new_speaker_distance: 0.35,
        }
    }
}

impl DiarizerConfig {
    /// Effective warmup duration in seconds.
    pub fn effective_warmup_sec(&self) -> f64 {
        self.warmup_sec.unwrap_or(0.75 * self.enroll_sec)
    }
}

/// Transcript post-processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    /// Whether the short-filler noise filter is active.
    pub noise_filter: bool,
    /// Minimum character count below which all-filler text is dropped. Range 1–12.
    pub min_chars: usize,
    /// Run length at which repeated characters are collapsed. Range 2–10.
    pub repeat_limit: usize,
    /// Characters considered filler for the noise filter.
    pub filler_chars: String,
    /// Domain vocabulary corrections, misheard form → canonical form.
    pub vocabulary: BTreeMap<String, String>,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            noise_filter: true,
            min_chars: 3,
            repeat_limit: 3,
            filler_chars: "嗯啊哦呃呀哈嘿哟唉诶".to_owned(),
            vocabulary: BTreeMap::new(),
        }
    }
}

/// Live-room event relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bounded event queue capacity.
    pub queue_capacity: usize,
    /// Heartbeat ping interval in seconds.
    pub ping_interval_sec: f64,
    /// Deduplication window for event ids across reconnects, in seconds.
    pub dedup_window_sec: f64,
    /// Initial reconnect back-off in seconds (doubles, capped).
    pub backoff_initial_sec: f64,
    /// Reconnect back-off cap in seconds.
    pub backoff_cap_sec: f64,
    /// Consecutive reconnects within `failure_window_sec` that mark the relay failed.
    pub max_reconnects: usize,
    /// Window for counting consecutive reconnects, in seconds.
    pub failure_window_sec: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            ping_interval_sec: 5.0,
            dedup_window_sec: 300.0,
            backoff_initial_sec: 1.0,
            backoff_cap_sec: 30.0,
            max_reconnects: 10,
            failure_window_sec: 60.0,
        }
    }
}

/// Rolling analysis window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window length and tick period in seconds. Range 30–600.
    pub window_sec: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { window_sec: 30.0 }
    }
}

/// LLM analysis workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Per-tick LLM timeout in seconds.
    pub timeout_sec: f64,
    /// Answer-script LLM timeout in seconds.
    pub answer_timeout_sec: f64,
    /// Transcript sentences fed to the signal collector.
    pub transcript_tail: usize,
    /// Maximum topic candidates reported per tick.
    pub max_topics: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout_sec: 45.0,
            answer_timeout_sec: 30.0,
            transcript_tail: 6,
            max_topics: 5,
        }
    }
}

/// LLM provider connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider base URL (chat-completions compatible).
    pub api_url: String,
    /// API key, sent as a bearer token when non-empty.
    pub api_key: String,
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Response token cap.
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            temperature: 0.6,
            max_tokens: 1024,
        }
    }
}

/// Artifact persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Whether JSONL artifacts are written at all.
    pub enabled: bool,
    /// Root directory for session artifacts.
    pub root: PathBuf,
    /// Whether WAV files are written for every speech segment.
    pub save_audio: bool,
    /// Flush-and-fsync interval in seconds.
    pub flush_interval_sec: f64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("records"),
            save_audio: false,
            flush_interval_sec: 5.0,
        }
    }
}

/// Processing mode requested by the operator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Favor latency: shorter silence windows, earlier flushes.
    Fast,
    /// Favor transcript quality: longer segments.
    #[default]
    Stable,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Processing mode.
    pub mode: SessionMode,
    /// Drain budget for a cooperative stop, in seconds.
    pub stop_drain_sec: f64,
    /// A restarted muxer stream that keeps producing for this long counts
    /// as recovered and resets the consecutive-failure budget.
    pub stream_restart_sec: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Stable,
            stop_drain_sec: 10.0,
            stream_restart_sec: 5.0,
        }
    }
}

fn range_err(name: &str, lo: f64, hi: f64) -> LiveError {
    LiveError::Config(format!("{name} out of range [{lo}, {hi}]"))
}

fn check(name: &str, value: f64, lo: f64, hi: f64) -> Result<()> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(range_err(name, lo, hi));
    }
    Ok(())
}

impl LiveConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LiveError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| LiveError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Apply `LIVE_*` environment-variable overrides on top of file values.
    pub fn apply_env(&mut self) {
        env_f64("LIVE_VAD_CHUNK_SEC", &mut self.ingest.chunk_sec);
        env_f32("LIVE_VAD_MIN_RMS", &mut self.vad.min_rms);
        env_f64("LIVE_VAD_MIN_SPEECH_SEC", &mut self.vad.min_speech_sec);
        env_f64("LIVE_VAD_MIN_SILENCE_SEC", &mut self.vad.min_silence_sec);
        env_f64("LIVE_VAD_HANGOVER_SEC", &mut self.vad.hangover_sec);
        env_f64("LIVE_VAD_FORCE_FLUSH_SEC", &mut self.vad.force_flush_sec);
        env_f64(
            "LIVE_VAD_FORCE_FLUSH_OVERLAP",
            &mut self.vad.force_flush_overlap_sec,
        );
        env_usize("LIVE_VAD_MIN_SENTENCE_CHARS", &mut self.text.min_chars);
        env_usize("LIVE_DIARIZER_MAX_SPEAKERS", &mut self.diarizer.max_speakers);
        env_f64("LIVE_DIARIZER_ENROLL_SEC", &mut self.diarizer.enroll_sec);
        if let Some(v) = env_parse::<f64>("LIVE_DIARIZER_WARMUP_SEC") {
            self.diarizer.warmup_sec = Some(v);
        }
        env_f32("LIVE_DIARIZER_SMOOTH", &mut self.diarizer.smooth);
        if let Some(v) = env_parse::<u8>("LIVE_TEXT_NOISE_FILTER") {
            self.text.noise_filter = v != 0;
        }
        env_usize("LIVE_TEXT_NOISE_MIN_CHARS", &mut self.text.min_chars);
        env_usize("LIVE_TEXT_NOISE_REPEAT", &mut self.text.repeat_limit);
        if let Ok(dev) = std::env::var("LIVE_FORCE_DEVICE") {
            // `cuda:0` style suffixes select the same backend.
            let dev = dev.to_ascii_lowercase();
            if dev == "cpu" {
                self.asr.device = Device::Cpu;
            } else if dev == "cuda" || dev.starts_with("cuda:") {
                self.asr.device = Device::Cuda;
            }
        }
        if self.asr.model_cache_dir.is_none() {
            self.asr.model_cache_dir = std::env::var("MODEL_CACHE_DIR")
                .or_else(|_| std::env::var("HF_HOME"))
                .ok()
                .map(PathBuf::from);
        }
        if let Ok(v) = std::env::var("LIVE_LLM_API_URL") {
            self.llm.api_url = v;
        }
        if let Ok(v) = std::env::var("LIVE_LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("LIVE_LLM_MODEL") {
            self.llm.model = v;
        }
    }

    /// Validate all parameters against their documented ranges.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::Config` naming the first offending parameter.
    pub fn validate(&self) -> Result<()> {
        check("ingest.chunk_sec", self.ingest.chunk_sec, 0.2, 2.0)?;
        check("vad.min_rms", f64::from(self.vad.min_rms), 0.001, 0.2)?;
        check("vad.min_speech_sec", self.vad.min_speech_sec, 0.2, 2.5)?;
        check("vad.min_silence_sec", self.vad.min_silence_sec, 0.2, 2.5)?;
        check("vad.hangover_sec", self.vad.hangover_sec, 0.1, 1.5)?;
        check("vad.force_flush_sec", self.vad.force_flush_sec, 2.0, 15.0)?;
        check(
            "vad.force_flush_overlap_sec",
            self.vad.force_flush_overlap_sec,
            0.0,
            1.5,
        )?;
        if self.vad.force_flush_overlap_sec >= self.vad.force_flush_sec {
            return Err(LiveError::Config(
                "vad.force_flush_overlap_sec must be smaller than vad.force_flush_sec".to_owned(),
            ));
        }
        check(
            "diarizer.max_speakers",
            self.diarizer.max_speakers as f64,
            1.0,
            4.0,
        )?;
        check("diarizer.enroll_sec", self.diarizer.enroll_sec, 1.0, 20.0)?;
        check(
            "diarizer.warmup_sec",
            self.diarizer.effective_warmup_sec(),
            0.0,
            20.0,
        )?;
        check("diarizer.smooth", f64::from(self.diarizer.smooth), 0.05, 0.6)?;
        check("text.min_chars", self.text.min_chars as f64, 1.0, 12.0)?;
        check("text.repeat_limit", self.text.repeat_limit as f64, 2.0, 10.0)?;
        check("window.window_sec", self.window.window_sec, 30.0, 600.0)?;
        if self.relay.queue_capacity == 0 {
            return Err(LiveError::Config("relay.queue_capacity must be > 0".to_owned()));
        }
        if self.persist.flush_interval_sec <= 0.0 {
            return Err(LiveError::Config(
                "persist.flush_interval_sec must be > 0".to_owned(),
            ));
        }
        if self.session.stream_restart_sec <= 0.0 {
            return Err(LiveError::Config(
                "session.stream_restart_sec must be > 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Samples per audio frame at the configured rate and chunk duration.
    pub fn frame_samples(&self) -> usize {
        (f64::from(self.ingest.sample_rate) * self.ingest.chunk_sec).round() as usize
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_f64(name: &str, slot: &mut f64) {
    if let Some(v) = env_parse::<f64>(name) {
        *slot = v;
    }
}

fn env_f32(name: &str, slot: &mut f32) {
    if let Some(v) = env_parse::<f32>(name) {
        *slot = v;
    }
}

fn env_usize(name: &str, slot: &mut usize) {
    if let Some(v) = env_parse::<usize>(name) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = LiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_samples(), 9600);
    }

    #[test]
    fn out_of_range_chunk_rejected() {
        let mut config = LiveConfig::default();
        config.ingest.chunk_sec = 5.0;
        assert!(matches!(config.validate(), Err(LiveError::Config(_))));
    }

    #[test]
    fn overlap_must_stay_below_flush_window() {
        let mut config = LiveConfig::default();
        config.vad.force_flush_sec = 2.0;
        config.vad.force_flush_overlap_sec = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn warmup_defaults_to_three_quarters_of_enroll() {
        let config = DiarizerConfig::default();
        assert!((config.effective_warmup_sec() - 3.0).abs() < f64::EPSILON);
    }
}
