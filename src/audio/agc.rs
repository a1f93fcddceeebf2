//! Online automatic gain control.
//!
//! Tracks a rolling RMS estimate over the last few seconds of frames and
//! nudges a smoothed gain toward `target_rms / observed_rms`, clamped to the
//! configured range. Samples are scaled with i16 saturation.

use crate::config::AgcConfig;
use crate::pipeline::messages::AudioFrame;
use std::collections::VecDeque;

/// RMS-based gain normalizer applied to every frame before VAD.
pub struct Agc {
    config: AgcConfig,
    /// Per-frame RMS history for the rolling window.
    history: VecDeque<f32>,
    /// Frames kept in the rolling window (`window_sec / chunk_sec`).
    window_frames: usize,
    /// One-pole smoothed gain.
    gain: f32,
}

impl Agc {
    pub fn new(config: &AgcConfig, chunk_sec: f64) -> Self {
        let window_frames = ((config.window_sec / chunk_sec).round() as usize).max(1);
        Self {
            config: config.clone(),
            history: VecDeque::with_capacity(window_frames),
            window_frames,
            gain: 1.0,
        }
    }

    /// Toggle gain normalization at runtime.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled {
            self.gain = 1.0;
            self.history.clear();
        }
    }

    /// Current smoothed gain, surfaced through `status()`.
    pub fn gain(&self) -> f32 {
        if self.config.enabled {
            self.gain
        } else {
            1.0
        }
    }

    /// Apply gain to a frame in place and refresh its RMS.
    pub fn process(&mut self, frame: &mut AudioFrame) {
        if !self.config.enabled {
            return;
        }

        self.history.push_back(frame.rms);
        while self.history.len() > self.window_frames {
            let _ = self.history.pop_front();
        }

        let window_rms = self.history.iter().sum::<f32>() / self.history.len() as f32;
        let target = self.config.target_rms / window_rms.max(self.config.floor);
        let target = target.clamp(self.config.g_min, self.config.g_max);
        self.gain += self.config.alpha * (target - self.gain);

        for sample in &mut frame.pcm {
            let scaled = f32::from(*sample) * self.gain;
            *sample = scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        }
        frame.rms = AudioFrame::compute_rms(&frame.pcm);
    }
}
