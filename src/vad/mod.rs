//! Voice activity detection using energy-based analysis.
//!
//! A three-state gate (silence / speech / hangover) over AGC-normalized
//! frames. Entry into speech requires `min_speech_sec` of cumulative voiced
//! audio inside a sliding window of twice that length, so a brief click does
//! not open a segment. Long utterances are cut at `force_flush_sec` with an
//! overlap tail carried into the next segment to preserve boundary words.

use crate::config::VadConfig;
use crate::pipeline::messages::{AudioFrame, FlushReason, SpeechSegment};
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Silence,
    Speech,
    Hangover,
}

/// Speech/silence segmentation gate.
pub struct VadGate {
    config: VadConfig,
    /// Frame duration in seconds.
    chunk_sec: f64,
    mode: Mode,
    /// Sliding entry window kept while in silence.
    pending: VecDeque<AudioFrame>,
    /// PCM accumulated for the open segment.
    seg_pcm: Vec<i16>,
    seg_start_ts: f64,
    seg_end_ts: f64,
    /// Voiced / total sample counts for `voiced_ratio`.
    seg_voiced_samples: usize,
    seg_total_samples: usize,
    /// Continuous silence observed in the hangover state, seconds.
    hang_silence_sec: f64,
}

impl VadGate {
    pub fn new(config: &VadConfig, chunk_sec: f64) -> Self {
        Self {
            config: config.clone(),
            chunk_sec,
            mode: Mode::Silence,
            pending: VecDeque::new(),
            seg_pcm: Vec::new(),
            seg_start_ts: 0.0,
            seg_end_ts: 0.0,
            seg_voiced_samples: 0,
            seg_total_samples: 0,
            hang_silence_sec: 0.0,
        }
    }

    /// Whether a segment is currently open.
    pub fn in_speech(&self) -> bool {
        self.mode != Mode::Silence
    }

    /// Swap in updated thresholds; the open segment, if any, is kept.
    pub fn set_config(&mut self, config: &VadConfig) {
        self.config = config.clone();
    }

    /// Feed one frame; returns a completed segment when one closed on it.
    pub fn process(&mut self, frame: &AudioFrame) -> Option<SpeechSegment> {
        let voiced = frame.rms >= self.config.min_rms;

        match self.mode {
            Mode::Silence => {
                self.push_pending(frame.clone());
                if voiced && self.pending_voiced_sec() >= self.config.min_speech_sec {
                    self.open_segment_from_pending();
                }
                None
            }
            Mode::Speech => {
                if voiced {
                    self.append(frame, true);
                    self.try_force_flush(frame)
                } else {
                    self.mode = Mode::Hangover;
                    self.hang_silence_sec = 0.0;
                    // Tail silence within the hangover grace stays in the segment.
                    self.append(frame, false);
                    self.hang_silence_sec += self.chunk_sec;
                    self.close_if_silence_elapsed()
                        .or_else(|| self.try_force_flush(frame))
                }
            }
            Mode::Hangover => {
                if voiced {
                    if self.hang_silence_sec > self.config.hangover_sec {
                        // The gap outlived the resume grace: close the old
                        // segment and start collecting toward a new one.
                        let closed = self.close_segment(FlushReason::Hangover);
                        self.mode = Mode::Silence;
                        self.pending.clear();
                        self.push_pending(frame.clone());
                        if self.pending_voiced_sec() >= self.config.min_speech_sec {
                            self.open_segment_from_pending();
                        }
                        return closed;
                    }
                    self.mode = Mode::Speech;
                    self.append(frame, true);
                    self.try_force_flush(frame)
                } else {
                    if self.hang_silence_sec < self.config.hangover_sec {
                        self.append(frame, false);
                    } else {
                        // Beyond the grace the silence still runs the close
                        // timer but is no longer kept in the segment audio.
                        self.seg_end_ts = self.seg_end_ts.max(frame.captured_at);
                    }
                    self.hang_silence_sec += self.chunk_sec;
                    self.close_if_silence_elapsed()
                }
            }
        }
    }

    /// Flush any open segment at session end.
    pub fn flush(&mut self) -> Option<SpeechSegment> {
        if self.mode == Mode::Silence {
            return None;
        }
        self.mode = Mode::Silence;
        self.pending.clear();
        self.take_segment(FlushReason::SessionEnd)
    }

    fn push_pending(&mut self, frame: AudioFrame) {
        self.pending.push_back(frame);
        let window = 2.0 * self.config.min_speech_sec;
        while self.pending.len() as f64 * self.chunk_sec > window && self.pending.len() > 1 {
            let _ = self.pending.pop_front();
        }
    }

    fn pending_voiced_sec(&self) -> f64 {
        self.pending
            .iter()
            .filter(|f| f.rms >= self.config.min_rms)
            .count() as f64
            * self.chunk_sec
    }

    fn open_segment_from_pending(&mut self) {
        // The segment begins at the first voiced frame inside the window.
        let first_voiced = self
            .pending
            .iter()
            .position(|f| f.rms >= self.config.min_rms)
            .unwrap_or(0);
        self.seg_pcm.clear();
        self.seg_voiced_samples = 0;
        self.seg_total_samples = 0;
        let mut start_ts = None;
        for frame in self.pending.iter().skip(first_voiced) {
            if start_ts.is_none() {
                start_ts = Some(frame.captured_at);
            }
            self.seg_pcm.extend_from_slice(&frame.pcm);
            self.seg_total_samples += frame.pcm.len();
            if frame.rms >= self.config.min_rms {
                self.seg_voiced_samples += frame.pcm.len();
            }
            self.seg_end_ts = frame.captured_at + self.chunk_sec;
        }
        self.seg_start_ts = start_ts.unwrap_or(0.0);
        self.pending.clear();
        self.mode = Mode::Speech;
        self.hang_silence_sec = 0.0;
        debug!(start_ts = self.seg_start_ts, "speech segment opened");
    }

    fn append(&mut self, frame: &AudioFrame, voiced: bool) {
        self.seg_pcm.extend_from_slice(&frame.pcm);
        self.seg_total_samples += frame.pcm.len();
        if voiced {
            self.seg_voiced_samples += frame.pcm.len();
        }
        self.seg_end_ts = frame.captured_at + self.chunk_sec;
    }

    fn close_if_silence_elapsed(&mut self) -> Option<SpeechSegment> {
        if self.hang_silence_sec + 1e-9 >= self.config.min_silence_sec {
            self.mode = Mode::Silence;
            self.pending.clear();
            return self.close_segment(FlushReason::Natural);
        }
        None
    }

    /// Close with the minimum-duration guard: a stub left over from a
    /// force-flush carry can be shorter than `min_speech_sec` and is
    /// discarded rather than emitted.
    fn close_segment(&mut self, reason: FlushReason) -> Option<SpeechSegment> {
        let segment = self.take_segment(reason)?;
        if segment.duration() + 1e-9 < self.config.min_speech_sec {
            debug!("sub-minimum segment discarded at close");
            return None;
        }
        Some(segment)
    }

    fn try_force_flush(&mut self, frame: &AudioFrame) -> Option<SpeechSegment> {
        let duration = self.seg_end_ts - self.seg_start_ts;
        if duration < self.config.force_flush_sec {
            return None;
        }

        let overlap_sec = self.config.force_flush_overlap_sec;
        let overlap_samples = ((overlap_sec / self.chunk_sec)
            * frame.pcm.len() as f64)
            .round() as usize;
        let overlap_samples = overlap_samples.min(self.seg_pcm.len());

        let segment = self.take_segment(FlushReason::ForceFlush);

        // Carry the tail as the head of the next segment so a word straddling
        // the cut is recognized in at least one of the two.
        if let Some(seg) = &segment {
            let tail = seg.pcm[seg.pcm.len() - overlap_samples..].to_vec();
            self.seg_pcm = tail;
            self.seg_total_samples = overlap_samples;
            self.seg_voiced_samples = overlap_samples;
            self.seg_start_ts = seg.end_ts - overlap_sec;
            self.seg_end_ts = seg.end_ts;
            self.mode = Mode::Speech;
            self.hang_silence_sec = 0.0;
        }
        segment
    }

    fn take_segment(&mut self, flush_reason: FlushReason) -> Option<SpeechSegment> {
        if self.seg_pcm.is_empty() {
            return None;
        }
        let voiced_ratio = if self.seg_total_samples == 0 {
            0.0
        } else {
            self.seg_voiced_samples as f32 / self.seg_total_samples as f32
        };
        let segment = SpeechSegment {
            segment_id: Uuid::new_v4(),
            start_ts: self.seg_start_ts,
            end_ts: self.seg_end_ts,
            pcm: std::mem::take(&mut self.seg_pcm),
            voiced_ratio,
            flush_reason,
        };
        self.seg_voiced_samples = 0;
        self.seg_total_samples = 0;
        debug!(
            start_ts = segment.start_ts,
            end_ts = segment.end_ts,
            reason = ?segment.flush_reason,
            "speech segment closed"
        );
        Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VadConfig;

    const CHUNK: f64 = 0.6;
    const SAMPLES: usize = 9600;

    fn frame(seq: u64, rms: f32) -> AudioFrame {
        let amplitude = (rms * 32768.0) as i16;
        AudioFrame {
            seq,
            pcm: vec![amplitude; SAMPLES],
            captured_at: seq as f64 * CHUNK,
            rms,
        }
    }

    fn config() -> VadConfig {
        VadConfig {
            min_rms: 0.008,
            min_speech_sec: 0.4,
            min_silence_sec: 0.6,
            hangover_sec: 0.4,
            force_flush_sec: 4.0,
            force_flush_overlap_sec: 0.5,
        }
    }

    #[test]
    fn quiet_start_then_single_utterance() {
        let mut vad = VadGate::new(&config(), CHUNK);
        let mut segments = Vec::new();
        let mut seq = 0;
        // ~10 s of near-silence.
        for _ in 0..17 {
            if let Some(s) = vad.process(&frame(seq, 0.0005)) {
                segments.push(s);
            }
            seq += 1;
        }
        // 1.2 s of speech.
        for _ in 0..2 {
            if let Some(s) = vad.process(&frame(seq, 0.05)) {
                segments.push(s);
            }
            seq += 1;
        }
        // 1.2 s of silence closes the segment.
        for _ in 0..2 {
            if let Some(s) = vad.process(&frame(seq, 0.0005)) {
                segments.push(s);
            }
            seq += 1;
        }
        assert_eq!(segments.len(), 1);
        let seg = &segments[0];
        assert_eq!(seg.flush_reason, FlushReason::Natural);
        assert!((seg.start_ts - 17.0 * CHUNK).abs() < 1e-9);
        assert!(seg.duration() >= 0.4);
        assert!(seg.voiced_ratio > 0.5);
    }

    #[test]
    fn long_utterance_is_force_flushed_with_overlap() {
        let mut vad = VadGate::new(&config(), CHUNK);
        let mut segments = Vec::new();
        // 9 s of continuous speech.
        for seq in 0..15 {
            if let Some(s) = vad.process(&frame(seq, 0.05)) {
                segments.push(s);
            }
        }
        // Trailing silence closes the last piece.
        for seq in 15..17 {
            if let Some(s) = vad.process(&frame(seq, 0.0005)) {
                segments.push(s);
            }
        }
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].flush_reason, FlushReason::ForceFlush);
        assert_eq!(segments[1].flush_reason, FlushReason::ForceFlush);
        assert_eq!(segments[2].flush_reason, FlushReason::Natural);
        // Pairwise overlap of ~0.5 s.
        assert!((segments[0].end_ts - segments[1].start_ts - 0.5).abs() < 1e-6);
        assert!((segments[1].end_ts - segments[2].start_ts - 0.5).abs() < 1e-6);
        // One-frame grace on the force-flush bound.
        for seg in &segments {
            assert!(seg.duration() <= 4.0 + CHUNK + 1e-9);
        }
    }

    #[test]
    fn brief_click_does_not_open_a_segment() {
        let cfg = VadConfig {
            min_speech_sec: 1.0,
            ..config()
        };
        let mut vad = VadGate::new(&cfg, CHUNK);
        // A single voiced frame (0.6 s) is below the 1 s cumulative entry bar.
        assert!(vad.process(&frame(0, 0.05)).is_none());
        assert!(!vad.in_speech());
        for seq in 1..6 {
            assert!(vad.process(&frame(seq, 0.0005)).is_none());
        }
        assert!(!vad.in_speech());
    }

    #[test]
    fn non_contiguous_voiced_frames_accumulate_within_window() {
        let cfg = VadConfig {
            min_speech_sec: 1.0,
            ..config()
        };
        let mut vad = VadGate::new(&cfg, CHUNK);
        // voiced, silent, voiced inside the 2 s window: 1.2 s cumulative.
        assert!(vad.process(&frame(0, 0.05)).is_none());
        assert!(vad.process(&frame(1, 0.001)).is_none());
        assert!(vad.process(&frame(2, 0.05)).is_none());
        assert!(vad.in_speech());
    }

    #[test]
    fn speech_resumes_within_hangover_grace() {
        let cfg = VadConfig {
            min_silence_sec: 1.3,
            hangover_sec: 0.7,
            ..config()
        };
        let mut vad = VadGate::new(&cfg, CHUNK);
        assert!(vad.process(&frame(0, 0.05)).is_none());
        assert!(vad.process(&frame(1, 0.001)).is_none());
        assert!(vad.process(&frame(2, 0.05)).is_none());
        assert!(vad.in_speech());
        // Close with enough silence.
        assert!(vad.process(&frame(3, 0.001)).is_none());
        assert!(vad.process(&frame(4, 0.001)).is_none());
        let seg = vad.process(&frame(5, 0.001)).expect("segment closes");
        assert_eq!(seg.flush_reason, FlushReason::Natural);
    }

    #[test]
    fn late_resume_closes_with_hangover_reason() {
        let cfg = VadConfig {
            min_silence_sec: 2.0,
            hangover_sec: 0.5,
            ..config()
        };
        let mut vad = VadGate::new(&cfg, CHUNK);
        assert!(vad.process(&frame(0, 0.05)).is_none());
        // Two silent frames: 1.2 s > hangover 0.5 but < min_silence 2.0.
        assert!(vad.process(&frame(1, 0.001)).is_none());
        assert!(vad.process(&frame(2, 0.001)).is_none());
        // Voice resumes too late: previous segment closes as hangover.
        let seg = vad.process(&frame(3, 0.05)).expect("stale segment closes");
        assert_eq!(seg.flush_reason, FlushReason::Hangover);
        // And the resumed voice opens a fresh segment.
        assert!(vad.in_speech());
    }

    #[test]
    fn session_end_flushes_open_segment() {
        let mut vad = VadGate::new(&config(), CHUNK);
        assert!(vad.process(&frame(0, 0.05)).is_none());
        let seg = vad.flush().expect("open segment flushed");
        assert_eq!(seg.flush_reason, FlushReason::SessionEnd);
        assert!(vad.flush().is_none());
    }

    #[test]
    fn silence_only_never_emits() {
        let mut vad = VadGate::new(&config(), CHUNK);
        for seq in 0..50 {
            assert!(vad.process(&frame(seq, 0.0005)).is_none());
        }
        assert!(vad.flush().is_none());
    }
}
