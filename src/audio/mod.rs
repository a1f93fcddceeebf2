//! Live-audio ingest: muxer subprocess tap and gain normalization.
//!
//! The chunker pulls PCM16 mono audio from the live URL through an external
//! muxer process and emits fixed-duration frames; the AGC stage normalizes
//! frame amplitude before voice-activity detection.

pub mod agc;
pub mod chunker;

pub use agc::Agc;
pub use chunker::AudioChunker;
