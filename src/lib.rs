//! livescope: real-time live-room analytics engine.
//!
//! One session taps a live room's audio stream and chat relay, runs
//! low-latency speech recognition with diarization, fuses transcripts with
//! chat events over rolling windows, and drives an LLM workflow that emits
//! structured analysis cards plus on-demand answer scripts.
//!
//! # Architecture
//!
//! Independent stages connected by bounded async channels:
//! - **Audio ingest**: muxer subprocess tap with AGC (`audio`)
//! - **VAD**: energy-based speech segmentation (`vad`)
//! - **ASR**: pluggable recognizer capability (`asr`)
//! - **Diarizer**: online MFCC clustering (`diarizer`)
//! - **Relay**: live-room websocket → normalized events (`relay`)
//! - **Window + analysis**: rolling snapshots → LLM cards (`window`, `analysis`)
//! - **Persistence**: append-only JSONL + WAV artifacts (`persist`)
//! - **Controller**: lifecycle and status (`session`)

pub mod analysis;
pub mod asr;
pub mod audio;
pub mod config;
pub mod diarizer;
pub mod error;
pub mod llm;
pub mod persist;
pub mod pipeline;
pub mod relay;
pub mod session;
pub mod text;
pub mod vad;
pub mod window;

pub use config::LiveConfig;
pub use error::{LiveError, Result};
pub use session::status::SessionStatus;
pub use session::{AdvancedUpdate, SessionController, SessionDeps};
