//! Error types for the livescope pipeline.

/// Top-level error type for the live-analytics engine.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Audio ingest error (muxer subprocess, frame reads).
    #[error("audio error: {0}")]
    Audio(String),

    /// The configured muxer binary is missing or exited immediately.
    #[error("muxer unavailable: {0}")]
    MuxerUnavailable(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech recognition error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Speaker diarization error.
    #[error("diarizer error: {0}")]
    Diarizer(String),

    /// Live-room event relay error.
    #[error("relay error: {0}")]
    Relay(String),

    /// LLM request or response error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Analysis workflow error.
    #[error("analysis error: {0}")]
    Analysis(String),

    /// Artifact persistence error.
    #[error("persist error: {0}")]
    Persist(String),

    /// Configuration error (invalid parameter or missing required value).
    #[error("config error: {0}")]
    Config(String),

    /// Session lifecycle error.
    #[error("session error: {0}")]
    Session(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LiveError>;
