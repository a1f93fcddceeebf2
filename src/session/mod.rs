//! Session controller: lifecycle and task wiring for one live room.
//!
//! `start` probes the muxer, resolves the room id, opens the artifact
//! sinks, and spawns one task per stage connected by bounded channels:
//! chunker → audio pipeline (AGC → VAD → diarizer → ASR → postprocess),
//! relay → event drain, window ticker → analysis. `stop` flushes the VAD,
//! drains within the configured budget, then force-closes what is left.

pub mod status;

use crate::analysis::answers::{AnswerBundle, AnswerRequest, AnswerScriptGenerator};
use crate::analysis::AnalysisWorkflow;
use crate::asr::{AsrEngine, Recognizer};
use crate::audio::{Agc, AudioChunker};
use crate::config::{LiveConfig, SessionMode, VadConfig};
use crate::diarizer::{Diarizer, DiarizerSnapshot};
use crate::error::{LiveError, Result};
use crate::llm::LlmClient;
use crate::persist::ArtifactPersister;
use crate::pipeline::messages::{
    now_ts, AnalysisPayload, ChatEvent, SpeechSegment, Transcript, WindowSnapshot,
};
use crate::relay::credentials::CredentialProvider;
use crate::relay::EventRelay;
use crate::text::TextPostprocessor;
use crate::vad::VadGate;
use crate::window::WindowAccumulator;
use status::{
    LifecycleState, RelayState, SessionMetrics, SessionStatus, StatusAdvanced, StatusStats,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Channel buffer sizes.
const FRAME_CHANNEL_SIZE: usize = 64;
const SEGMENT_CHANNEL_SIZE: usize = 8;
const PERSIST_CHANNEL_SIZE: usize = 256;
const BUS_CAPACITY: usize = 256;

/// Capabilities injected into a session.
pub struct SessionDeps {
    pub recognizer: Arc<dyn Recognizer>,
    pub llm: Arc<dyn LlmClient>,
    pub credentials: Arc<dyn CredentialProvider>,
}

/// Runtime-adjustable parameters for `update_advanced`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct AdvancedUpdate {
    pub persist_enabled: Option<bool>,
    pub persist_root: Option<std::path::PathBuf>,
    pub save_audio: Option<bool>,
    pub agc_enabled: Option<bool>,
    pub diarization: Option<bool>,
    pub max_speakers: Option<usize>,
    pub vad_min_rms: Option<f32>,
    pub vad_min_speech_sec: Option<f64>,
    pub vad_min_silence_sec: Option<f64>,
    pub vad_hangover_sec: Option<f64>,
    pub vad_force_flush_sec: Option<f64>,
    pub vad_force_flush_overlap_sec: Option<f64>,
}

impl AdvancedUpdate {
    /// Apply onto a config copy; the caller validates the result.
    fn apply_to(&self, config: &mut LiveConfig) {
        if let Some(v) = self.persist_enabled {
            config.persist.enabled = v;
        }
        if let Some(v) = &self.persist_root {
            config.persist.root = v.clone();
        }
        if let Some(v) = self.save_audio {
            config.persist.save_audio = v;
        }
        if let Some(v) = self.agc_enabled {
            config.agc.enabled = v;
        }
        if let Some(v) = self.diarization {
            config.diarizer.enabled = v;
        }
        if let Some(v) = self.max_speakers {
            config.diarizer.max_speakers = v;
        }
        let vad = &mut config.vad;
        if let Some(v) = self.vad_min_rms {
            vad.min_rms = v;
        }
        if let Some(v) = self.vad_min_speech_sec {
            vad.min_speech_sec = v;
        }
        if let Some(v) = self.vad_min_silence_sec {
            vad.min_silence_sec = v;
        }
        if let Some(v) = self.vad_hangover_sec {
            vad.hangover_sec = v;
        }
        if let Some(v) = self.vad_force_flush_sec {
            vad.force_flush_sec = v;
        }
        if let Some(v) = self.vad_force_flush_overlap_sec {
            vad.force_flush_overlap_sec = v;
        }
    }
}

/// Command applied by the running pipeline tasks.
enum PipelineCommand {
    Apply(AdvancedUpdate, VadConfig),
}

/// State the pipeline tasks publish for `status()`.
struct Observable {
    state: std::sync::Mutex<LifecycleState>,
    last_error: std::sync::Mutex<Option<String>>,
    /// f32 bit pattern of the current AGC gain.
    agc_gain_bits: AtomicU32,
    diarizer: std::sync::Mutex<Option<DiarizerSnapshot>>,
    relay_state: std::sync::Mutex<RelayState>,
    latest_analysis: std::sync::Mutex<Option<AnalysisPayload>>,
    model_loading: AtomicBool,
}

impl Observable {
    fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(LifecycleState::Idle),
            last_error: std::sync::Mutex::new(None),
            agc_gain_bits: AtomicU32::new(1.0f32.to_bits()),
            diarizer: std::sync::Mutex::new(None),
            relay_state: std::sync::Mutex::new(RelayState::Stopped),
            latest_analysis: std::sync::Mutex::new(None),
            model_loading: AtomicBool::new(false),
        }
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().expect("state lock") = state;
    }

    fn state(&self) -> LifecycleState {
        *self.state.lock().expect("state lock")
    }

    fn set_error(&self, message: String) {
        *self.last_error.lock().expect("error lock") = Some(message);
    }
}

/// Per-session bookkeeping held while running.
struct Running {
    session_id: String,
    room_id: String,
    live_url: String,
    mode: SessionMode,
    started_at: f64,
    cancel: CancellationToken,
    metrics: Arc<SessionMetrics>,
    handles: Vec<JoinHandle<()>>,
    commands: mpsc::Sender<PipelineCommand>,
}

/// Controller owning the lifecycle of one session at a time.
pub struct SessionController {
    deps: SessionDeps,
    config: std::sync::Mutex<LiveConfig>,
    running: tokio::sync::Mutex<Option<Running>>,
    observable: Arc<Observable>,
    transcripts_tx: broadcast::Sender<Transcript>,
    events_tx: broadcast::Sender<ChatEvent>,
    analysis_tx: broadcast::Sender<AnalysisPayload>,
}

impl SessionController {
    pub fn new(deps: SessionDeps, config: LiveConfig) -> Self {
        let (transcripts_tx, _) = broadcast::channel(BUS_CAPACITY);
        let (events_tx, _) = broadcast::channel(BUS_CAPACITY);
        let (analysis_tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            deps,
            config: std::sync::Mutex::new(config),
            running: tokio::sync::Mutex::new(None),
            observable: Arc::new(Observable::new()),
            transcripts_tx,
            events_tx,
            analysis_tx,
        }
    }

    /// Subscribe to finalized transcripts.
    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<Transcript> {
        self.transcripts_tx.subscribe()
    }

    /// Subscribe to normalized chat events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to per-window analysis payloads.
    pub fn subscribe_analysis(&self) -> broadcast::Receiver<AnalysisPayload> {
        self.analysis_tx.subscribe()
    }

    /// Start a session for the live URL.
    ///
    /// # Errors
    ///
    /// Returns config errors synchronously; `MuxerUnavailable` when the
    /// muxer binary cannot run; a session error when already running.
    pub async fn start(&self, live_url: &str) -> Result<()> {
        let mut slot = self.running.lock().await;
        if slot.is_some() {
            return Err(LiveError::Session("session already running".to_owned()));
        }
        self.observable.set_state(LifecycleState::Starting);
        *self.observable.last_error.lock().expect("error lock") = None;

        let result = self.start_inner(live_url).await;
        match result {
            Ok(running) => {
                info!(session_id = %running.session_id, room_id = %running.room_id, "session running");
                *slot = Some(running);
                self.observable.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                self.observable.set_state(LifecycleState::Idle);
                Err(e)
            }
        }
    }

    async fn start_inner(&self, live_url: &str) -> Result<Running> {
        let config = self.config.lock().expect("config lock").clone();
        config.validate()?;

        // 1. Muxer must exist before anything else spins up.
        AudioChunker::probe(&config.ingest).await?;
        // 2. Room identity comes from the live URL.
        let room_id = resolve_room_id(live_url)?;

        let session_id = Uuid::new_v4().to_string();
        let started_at = now_ts();
        let cancel = CancellationToken::new();
        let metrics = Arc::new(SessionMetrics::default());
        let (commands_tx, commands_rx) = mpsc::channel(8);

        // 3. Inner components (C2–C6, C11) before the producers.
        let engine = Arc::new(AsrEngine::new(
            Arc::clone(&self.deps.recognizer),
            &config.asr,
            config.ingest.sample_rate,
        )?);
        let persister =
            ArtifactPersister::open(&config.persist, &room_id, Arc::clone(&metrics));

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        let (segments_tx, segments_rx) = mpsc::channel::<(SpeechSegment, crate::diarizer::Assignment)>(SEGMENT_CHANNEL_SIZE);
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_CHANNEL_SIZE);
        let (window_tx, window_rx) = mpsc::channel::<WindowItem>(PERSIST_CHANNEL_SIZE);

        let mut handles = Vec::new();

        // Persister task: the only writer of the artifact files.
        handles.push(tokio::spawn(persist_task(
            persister,
            persist_rx,
            config.persist.flush_interval_sec,
        )));

        // Audio pipeline: AGC → VAD → (diarizer, ASR) → postprocess.
        handles.push(tokio::spawn(audio_task(AudioTaskCtx {
            config: config.clone(),
            frames_rx,
            segments_tx,
            commands_rx,
            metrics: Arc::clone(&metrics),
            observable: Arc::clone(&self.observable),
            cancel: cancel.clone(),
        })));
        handles.push(tokio::spawn(asr_task(AsrTaskCtx {
            engine: Arc::clone(&engine),
            text: Arc::new(TextPostprocessor::new(&config.text)),
            segments_rx,
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            started_at,
            metrics: Arc::clone(&metrics),
            observable: Arc::clone(&self.observable),
            transcripts_tx: self.transcripts_tx.clone(),
            persist_tx: persist_tx.clone(),
            window_tx: window_tx.clone(),
            save_audio: config.persist.save_audio,
        })));

        // C1: the muxer tap. Terminal failure cancels the whole session.
        let chunker =
            AudioChunker::new(&config.ingest, live_url, config.session.stream_restart_sec);
        let chunker_cancel = cancel.clone();
        let chunker_observable = Arc::clone(&self.observable);
        handles.push(tokio::spawn(async move {
            if let Err(e) = chunker.run(frames_tx, chunker_cancel.clone()).await {
                error!("audio ingest terminal failure: {e}");
                chunker_observable.set_error(e.to_string());
                chunker_observable.set_state(LifecycleState::Failed);
                chunker_cancel.cancel();
            }
        }));

        // C7: relay plus its drain into buses, window, and persister.
        let (relay, relay_status_rx) = EventRelay::new(
            &config.relay,
            &room_id,
            Arc::clone(&self.deps.credentials),
            Arc::clone(&metrics),
        );
        let relay_queue = relay.queue();
        let relay_cancel = cancel.clone();
        let relay_observable = Arc::clone(&self.observable);
        handles.push(tokio::spawn(async move {
            if let Err(e) = relay.run(relay_cancel.clone()).await {
                error!("relay terminal failure: {e}");
                relay_observable.set_error(e.to_string());
                relay_observable.set_state(LifecycleState::Failed);
                relay_cancel.cancel();
            }
        }));
        handles.push(tokio::spawn(relay_state_task(
            relay_status_rx,
            Arc::clone(&self.observable),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(event_drain_task(
            relay_queue,
            self.events_tx.clone(),
            window_tx.clone(),
            persist_tx.clone(),
            cancel.clone(),
        )));

        // C8 + C9: window accumulation and the periodic analysis tick.
        let workflow = AnalysisWorkflow::new(
            Arc::clone(&self.deps.llm),
            &config.analysis,
            config.persist.root.clone(),
            &room_id,
        );
        handles.push(tokio::spawn(window_task(WindowTaskCtx {
            window_sec: config.window.window_sec,
            window_rx,
            workflow: Arc::new(workflow),
            metrics: Arc::clone(&metrics),
            observable: Arc::clone(&self.observable),
            analysis_tx: self.analysis_tx.clone(),
            cancel: cancel.clone(),
        })));

        Ok(Running {
            session_id,
            room_id,
            live_url: live_url.to_owned(),
            mode: config.session.mode,
            started_at,
            cancel,
            metrics,
            handles,
            commands: commands_tx,
        })
    }

    /// Stop the running session, draining within `stop_drain_sec`.
    ///
    /// # Errors
    ///
    /// Returns a session error when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.running.lock().await;
        let Some(running) = slot.take() else {
            return Err(LiveError::Session("no session running".to_owned()));
        };
        self.observable.set_state(LifecycleState::Stopping);
        running.cancel.cancel();

        let drain = self.config.lock().expect("config lock").session.stop_drain_sec;
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(drain);
        for handle in running.handles {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("stop drain deadline passed, aborting task");
                abort.abort();
            }
        }
        if self.observable.state() != LifecycleState::Failed {
            self.observable.set_state(LifecycleState::Idle);
        }
        *self.observable.relay_state.lock().expect("relay lock") = RelayState::Stopped;
        info!(session_id = %running.session_id, "session stopped");
        Ok(())
    }

    /// Validate and apply runtime-adjustable parameters.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::Config` when a value falls outside its range;
    /// nothing is applied in that case.
    pub async fn update_advanced(&self, update: AdvancedUpdate) -> Result<()> {
        let mut candidate = self.config.lock().expect("config lock").clone();
        update.apply_to(&mut candidate);
        candidate.validate()?;
        let vad = candidate.vad.clone();
        *self.config.lock().expect("config lock") = candidate;

        let slot = self.running.lock().await;
        if let Some(running) = slot.as_ref() {
            running
                .commands
                .send(PipelineCommand::Apply(update, vad))
                .await
                .map_err(|_| LiveError::Channel("pipeline command channel closed".to_owned()))?;
        }
        Ok(())
    }

    /// Generate answer scripts, filling style/vibe from the latest analysis
    /// when the request leaves them empty.
    ///
    /// # Errors
    ///
    /// Returns a config error for an empty or over-long question list.
    pub async fn generate_answers(&self, mut request: AnswerRequest) -> Result<AnswerBundle> {
        let latest = self
            .observable
            .latest_analysis
            .lock()
            .expect("analysis lock")
            .clone();
        if let Some(latest) = latest {
            if request.style_profile.is_empty() {
                request.style_profile = latest.style_profile.clone();
            }
            if request.vibe.is_none() {
                request.vibe = Some(latest.vibe.clone());
            }
        }
        let config = self.config.lock().expect("config lock").analysis.clone();
        let generator = AnswerScriptGenerator::new(Arc::clone(&self.deps.llm), &config);
        generator.generate(&request).await
    }

    /// Compose the full status snapshot.
    pub async fn status(&self) -> SessionStatus {
        let slot = self.running.lock().await;
        let config = self.config.lock().expect("config lock").clone();
        let state = self.observable.state();
        let mut out = SessionStatus::idle();
        out.state = state;
        out.is_running = state == LifecycleState::Running;
        out.mode = config.session.mode;
        out.relay = *self.observable.relay_state.lock().expect("relay lock");
        out.last_error = self.observable.last_error.lock().expect("error lock").clone();

        if let Some(running) = slot.as_ref() {
            out.session_id = Some(running.session_id.clone());
            out.room_id = Some(running.room_id.clone());
            out.live_url = Some(running.live_url.clone());
            out.mode = running.mode;
            out.started_at = Some(running.started_at);
            out.stats = StatusStats::snapshot(&running.metrics);
            let diarizer = self
                .observable
                .diarizer
                .lock()
                .expect("diarizer lock")
                .clone()
                .unwrap_or(DiarizerSnapshot {
                    active: config.diarizer.enabled,
                    centroids: 0,
                    total_voiced_sec: 0.0,
                    enrolled: false,
                    last_speaker: "unknown".to_owned(),
                });
            out.advanced = Some(StatusAdvanced {
                persist_enabled: config.persist.enabled,
                persist_root: config.persist.root.display().to_string(),
                save_audio: config.persist.save_audio,
                agc_enabled: config.agc.enabled,
                agc_gain: f32::from_bits(self.observable.agc_gain_bits.load(Ordering::Relaxed)),
                max_speakers: config.diarizer.max_speakers,
                last_speaker: diarizer.last_speaker.clone(),
                diarizer,
                vad: config.vad.clone(),
                model_loading: self.observable.model_loading.load(Ordering::Relaxed),
            });
        }
        out
    }
}

/// Extract the room id from a live URL: the last non-empty path segment.
fn resolve_room_id(live_url: &str) -> Result<String> {
    let url = url::Url::parse(live_url)
        .map_err(|e| LiveError::Config(format!("bad live url: {e}")))?;
    url.path_segments()
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_owned)
        .ok_or_else(|| LiveError::Config("cannot resolve room id from live url".to_owned()))
}

// ---------------------------------------------------------------------------
// Stage tasks
// ---------------------------------------------------------------------------

struct AudioTaskCtx {
    config: LiveConfig,
    frames_rx: mpsc::Receiver<crate::pipeline::messages::AudioFrame>,
    segments_tx: mpsc::Sender<(SpeechSegment, crate::diarizer::Assignment)>,
    commands_rx: mpsc::Receiver<PipelineCommand>,
    metrics: Arc<SessionMetrics>,
    observable: Arc<Observable>,
    cancel: CancellationToken,
}

/// AGC → VAD → diarizer. Emits closed, speaker-labeled segments downstream.
async fn audio_task(mut ctx: AudioTaskCtx) {
    let chunk_sec = ctx.config.ingest.chunk_sec;
    let mut agc = Agc::new(&ctx.config.agc, chunk_sec);
    let mut vad = VadGate::new(&ctx.config.vad, chunk_sec);
    let mut diarizer = Diarizer::new(&ctx.config.diarizer);

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            command = ctx.commands_rx.recv() => {
                // A closed command channel means the controller is gone.
                let Some(PipelineCommand::Apply(update, vad_config)) = command else { break };
                vad.set_config(&vad_config);
                if let Some(enabled) = update.agc_enabled {
                    agc.set_enabled(enabled);
                }
                if let Some(enabled) = update.diarization {
                    diarizer.set_enabled(enabled);
                }
                if let Some(max) = update.max_speakers {
                    diarizer.set_max_speakers(max);
                }
                info!("advanced parameters applied to audio pipeline");
            }
            frame = ctx.frames_rx.recv() => {
                let Some(mut frame) = frame else { break };
                let _ = ctx.metrics.total_audio_chunks.fetch_add(1, Ordering::Relaxed);
                agc.process(&mut frame);
                ctx.observable
                    .agc_gain_bits
                    .store(agc.gain().to_bits(), Ordering::Relaxed);
                if let Some(segment) = vad.process(&frame) {
                    // Embedding + clustering are CPU-bound; hand the diarizer
                    // to the worker pool and take it back with the label.
                    let handoff = tokio::task::spawn_blocking(move || {
                        let mut diarizer = diarizer;
                        let assignment = diarizer.observe(&segment);
                        (diarizer, segment, assignment)
                    })
                    .await;
                    let Ok((returned, segment, assignment)) = handoff else {
                        warn!("diarizer worker failed, audio pipeline stopping");
                        return;
                    };
                    diarizer = returned;
                    *ctx.observable.diarizer.lock().expect("diarizer lock") =
                        Some(diarizer.snapshot());
                    if ctx.segments_tx.send((segment, assignment)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Session end flushes the in-flight segment.
    if let Some(segment) = vad.flush() {
        let handoff = tokio::task::spawn_blocking(move || {
            let mut diarizer = diarizer;
            let assignment = diarizer.observe(&segment);
            (diarizer, segment, assignment)
        })
        .await;
        if let Ok((diarizer, segment, assignment)) = handoff {
            *ctx.observable.diarizer.lock().expect("diarizer lock") = Some(diarizer.snapshot());
            let _ = ctx.segments_tx.send((segment, assignment)).await;
        }
    }
}

struct AsrTaskCtx {
    engine: Arc<AsrEngine>,
    text: Arc<TextPostprocessor>,
    segments_rx: mpsc::Receiver<(SpeechSegment, crate::diarizer::Assignment)>,
    room_id: String,
    session_id: String,
    started_at: f64,
    metrics: Arc<SessionMetrics>,
    observable: Arc<Observable>,
    transcripts_tx: broadcast::Sender<Transcript>,
    persist_tx: mpsc::Sender<PersistItem>,
    window_tx: mpsc::Sender<WindowItem>,
    save_audio: bool,
}

/// Recognize each labeled segment, post-process, and fan out.
async fn asr_task(mut ctx: AsrTaskCtx) {
    while let Some((segment, assignment)) = ctx.segments_rx.recv().await {
        ctx.observable
            .model_loading
            .store(ctx.engine.model_loading(), Ordering::Relaxed);

        if ctx.save_audio {
            let _ = ctx.persist_tx.send(PersistItem::Segment(segment.clone())).await;
        }

        let recognition = match ctx.engine.transcribe(&segment).await {
            Ok(Some(recognition)) => recognition,
            Ok(None) => continue,
            Err(_) => {
                let _ = ctx.metrics.failed_transcriptions.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        // Post-processing is CPU-bound string work; keep it off the event
        // loop. Noise-filtered text discards the whole segment.
        let postprocessor = Arc::clone(&ctx.text);
        let raw_text = recognition.text.clone();
        let processed =
            match tokio::task::spawn_blocking(move || postprocessor.process(&raw_text)).await {
                Ok(processed) => processed,
                Err(_) => {
                    warn!("postprocess worker failed");
                    continue;
                }
            };
        let Some(text) = processed else {
            continue;
        };

        let transcript = Transcript {
            segment_id: segment.segment_id,
            text,
            confidence: recognition.mean_confidence,
            words: recognition.words,
            is_final: true,
            speaker: assignment.speaker,
            speaker_debug: assignment.debug,
            room_id: ctx.room_id.clone(),
            session_id: ctx.session_id.clone(),
            timestamp: ctx.started_at + segment.end_ts,
        };
        ctx.metrics.record_transcription(transcript.confidence);
        let _ = ctx.transcripts_tx.send(transcript.clone());
        let _ = ctx.window_tx.send(WindowItem::Transcript(transcript.clone())).await;
        let _ = ctx.persist_tx.send(PersistItem::Transcript(transcript)).await;
    }
}

/// Items routed to the persister task.
enum PersistItem {
    Transcript(Transcript),
    Event(ChatEvent),
    Segment(SpeechSegment),
}

/// Runs until every producer hangs up, so the final transcripts of a
/// stopping session still land before the last flush.
async fn persist_task(
    mut persister: ArtifactPersister,
    mut rx: mpsc::Receiver<PersistItem>,
    flush_interval_sec: f64,
) {
    let mut flush = tokio::time::interval(Duration::from_secs_f64(flush_interval_sec));
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = flush.tick() => persister.flush(),
            item = rx.recv() => match item {
                None => break,
                Some(PersistItem::Transcript(t)) => persister.append_transcript(&t),
                Some(PersistItem::Event(e)) => persister.append_event(&e),
                Some(PersistItem::Segment(s)) => persister.save_segment(&s),
            }
        }
    }
    persister.flush();
}

/// Items routed to the window accumulator.
enum WindowItem {
    Transcript(Transcript),
    Event(ChatEvent),
}

/// Mirror the relay's status watch into the observable state.
async fn relay_state_task(
    mut rx: watch::Receiver<RelayState>,
    observable: Arc<Observable>,
    cancel: CancellationToken,
) {
    loop {
        *observable.relay_state.lock().expect("relay lock") = *rx.borrow();
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Drain the relay queue into the event bus, window, and persister.
async fn event_drain_task(
    queue: Arc<crate::relay::EventQueue>,
    events_tx: broadcast::Sender<ChatEvent>,
    window_tx: mpsc::Sender<WindowItem>,
    persist_tx: mpsc::Sender<PersistItem>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = queue.pop() => event,
        };
        let _ = events_tx.send(event.clone());
        let _ = window_tx.send(WindowItem::Event(event.clone())).await;
        let _ = persist_tx.send(PersistItem::Event(event)).await;
    }
}

struct WindowTaskCtx {
    window_sec: f64,
    window_rx: mpsc::Receiver<WindowItem>,
    workflow: Arc<AnalysisWorkflow>,
    metrics: Arc<SessionMetrics>,
    observable: Arc<Observable>,
    analysis_tx: broadcast::Sender<AnalysisPayload>,
    cancel: CancellationToken,
}

/// Accumulate window entries and run the analysis workflow on each tick.
/// A tick due while the previous run is still in flight is skipped.
async fn window_task(mut ctx: WindowTaskCtx) {
    let mut accumulator = WindowAccumulator::new(ctx.window_sec);
    let mut tick = tokio::time::interval(Duration::from_secs_f64(ctx.window_sec));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The interval fires immediately; swallow the first tick.
    let _ = tick.tick().await;
    let busy = Arc::new(AtomicBool::new(false));

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            item = ctx.window_rx.recv() => match item {
                None => break,
                Some(WindowItem::Transcript(t)) => accumulator.push_transcript(t),
                Some(WindowItem::Event(e)) => accumulator.push_event(e),
            },
            _ = tick.tick() => {
                if busy.swap(true, Ordering::AcqRel) {
                    let _ = ctx.metrics.analysis_skipped.fetch_add(1, Ordering::Relaxed);
                    warn!("analysis tick skipped: previous run still in flight");
                    continue;
                }
                let snapshot: WindowSnapshot = accumulator.snapshot(ctx.window_sec, now_ts());
                let workflow = Arc::clone(&ctx.workflow);
                let analysis_tx = ctx.analysis_tx.clone();
                let observable = Arc::clone(&ctx.observable);
                let busy_flag = Arc::clone(&busy);
                let _ = tokio::spawn(async move {
                    match workflow.run_tick(&snapshot).await {
                        Ok(payload) => {
                            *observable.latest_analysis.lock().expect("analysis lock") =
                                Some(payload.clone());
                            let _ = analysis_tx.send(payload);
                        }
                        Err(e) => warn!("analysis tick failed: {e}"),
                    }
                    busy_flag.store(false, Ordering::Release);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_comes_from_the_last_path_segment() {
        assert_eq!(
            resolve_room_id("https://live.example.com/123456").unwrap(),
            "123456"
        );
        assert_eq!(
            resolve_room_id("https://live.example.com/room/98765?from=share").unwrap(),
            "98765"
        );
        assert!(resolve_room_id("https://live.example.com/").is_err());
        assert!(resolve_room_id("not a url").is_err());
    }

    #[test]
    fn advanced_update_applies_onto_config() {
        let mut config = LiveConfig::default();
        let update = AdvancedUpdate {
            agc_enabled: Some(false),
            max_speakers: Some(3),
            vad_min_rms: Some(0.02),
            ..AdvancedUpdate::default()
        };
        update.apply_to(&mut config);
        assert!(!config.agc.enabled);
        assert_eq!(config.diarizer.max_speakers, 3);
        assert!((config.vad.min_rms - 0.02).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_advanced_update_is_rejected_by_validate() {
        let mut config = LiveConfig::default();
        let update = AdvancedUpdate {
            max_speakers: Some(9),
            ..AdvancedUpdate::default()
        };
        update.apply_to(&mut config);
        assert!(config.validate().is_err());
    }
}
