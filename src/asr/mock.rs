//! Scripted recognizer for tests and dry runs.

use super::{Recognition, Recognizer};
use crate::error::{LiveError, Result};
use crate::pipeline::messages::WordTiming;
use std::collections::VecDeque;
use std::sync::Mutex;

enum Step {
    Ok(Recognition),
    Err(String),
}

/// Recognizer that replays a scripted sequence of results, falling back to
/// a fixed default once the script is exhausted.
pub struct MockRecognizer {
    script: Mutex<VecDeque<Step>>,
    default: Option<Recognition>,
    default_error: Option<String>,
    sample_rate: u32,
    word_timings: bool,
}

impl MockRecognizer {
    /// Always returns `text` with per-character word timings.
    pub fn fixed(text: &str, confidence: f32) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Some(recognition(text, confidence)),
            default_error: None,
            sample_rate: 16_000,
            word_timings: true,
        }
    }

    /// Always fails with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: None,
            default_error: Some(message.to_owned()),
            sample_rate: 16_000,
            word_timings: true,
        }
    }

    /// Start from an empty script; results queued with `push_*` are
    /// consumed in order, then the default applies.
    pub fn scripted(default_text: &str, confidence: f32) -> Self {
        Self::fixed(default_text, confidence)
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn push_text(&self, text: &str, confidence: f32) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Step::Ok(recognition(text, confidence)));
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Step::Err(message.to_owned()));
    }
}

fn recognition(text: &str, confidence: f32) -> Recognition {
    // Evenly spaced per-character timings, 0.25 s per character.
    let words = text
        .chars()
        .enumerate()
        .map(|(i, c)| WordTiming {
            word: c.to_string(),
            start: i as f32 * 0.25,
            end: (i + 1) as f32 * 0.25,
        })
        .collect();
    Recognition {
        text: text.to_owned(),
        words,
        mean_confidence: confidence,
    }
}

impl Recognizer for MockRecognizer {
    fn recognize(&self, _pcm: &[i16], _sample_rate: u32) -> Result<Recognition> {
        if let Some(step) = self.script.lock().expect("mock script lock").pop_front() {
            return match step {
                Step::Ok(r) => Ok(r),
                Step::Err(m) => Err(LiveError::Asr(m)),
            };
        }
        if let Some(m) = &self.default_error {
            return Err(LiveError::Asr(m.clone()));
        }
        Ok(self.default.clone().unwrap_or_default())
    }

    fn supports_word_timings(&self) -> bool {
        self.word_timings
    }

    fn expected_sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
