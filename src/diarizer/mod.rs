//! Online speaker diarization.
//!
//! Clusters MFCC embeddings of speech segments into at most `max_speakers`
//! centroids. The centroid holding the most voiced audio at enrollment time
//! becomes `host` for the rest of the session; later centroids are
//! `guest_2`, `guest_3`, ... in creation order. Until warmup has seen
//! enough voiced audio, every segment is labeled `unknown`.

pub mod embedding;

use crate::config::DiarizerConfig;
use crate::pipeline::messages::{SpeakerLabel, SpeechSegment};
use std::collections::BTreeMap;
use tracing::{debug, info};

struct Centroid {
    vector: Vec<f32>,
    /// Voiced audio attributed to this centroid, seconds.
    voiced_sec: f64,
    /// Permanent label once enrollment has happened.
    label: Option<SpeakerLabel>,
}

/// Result of assigning one segment.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub speaker: SpeakerLabel,
    /// Centroid label → cosine similarity with this segment's embedding.
    pub debug: BTreeMap<String, f32>,
}

impl Assignment {
    fn unknown() -> Self {
        Self {
            speaker: SpeakerLabel::Unknown,
            debug: BTreeMap::new(),
        }
    }
}

/// Status snapshot for the external facade.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiarizerSnapshot {
    pub active: bool,
    pub centroids: usize,
    pub total_voiced_sec: f64,
    pub enrolled: bool,
    pub last_speaker: String,
}

/// Online clustering diarizer.
pub struct Diarizer {
    config: DiarizerConfig,
    centroids: Vec<Centroid>,
    total_voiced_sec: f64,
    enrolled: bool,
    next_guest: u8,
    last_speaker: SpeakerLabel,
}

impl Diarizer {
    pub fn new(config: &DiarizerConfig) -> Self {
        Self {
            config: config.clone(),
            centroids: Vec::new(),
            total_voiced_sec: 0.0,
            enrolled: false,
            next_guest: 2,
            last_speaker: SpeakerLabel::Unknown,
        }
    }

    /// Reduce or raise the speaker cap mid-session. Existing clusters are
    /// kept either way; a lower cap only refuses new ones.
    pub fn set_max_speakers(&mut self, max_speakers: usize) {
        self.config.max_speakers = max_speakers;
    }

    /// Toggle diarization; disabling keeps cluster state for a later re-enable.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn snapshot(&self) -> DiarizerSnapshot {
        DiarizerSnapshot {
            active: self.config.enabled,
            centroids: self.centroids.len(),
            total_voiced_sec: self.total_voiced_sec,
            enrolled: self.enrolled,
            last_speaker: self.last_speaker.as_str(),
        }
    }

    /// Assign a speaker label to one segment, updating cluster state.
    pub fn observe(&mut self, segment: &SpeechSegment) -> Assignment {
        if !self.config.enabled {
            return Assignment::unknown();
        }
        let embedding = match embedding::mfcc_embedding(&segment.pcm, 16_000) {
            Ok(e) => e,
            Err(e) => {
                debug!("embedding skipped: {e}");
                return Assignment::unknown();
            }
        };

        let voiced_sec = segment.duration() * f64::from(segment.voiced_ratio);
        self.total_voiced_sec += voiced_sec;

        let index = self.assign_centroid(&embedding, voiced_sec);
        self.maybe_enroll();

        let speaker = if self.total_voiced_sec < self.config.effective_warmup_sec() {
            SpeakerLabel::Unknown
        } else {
            self.resolve_label(index)
        };
        self.last_speaker = speaker;
        Assignment {
            speaker,
            debug: self.debug_map(&embedding),
        }
    }

    /// Match against existing centroids or create a new one, then EMA-update.
    fn assign_centroid(&mut self, embedding: &[f32], voiced_sec: f64) -> usize {
        let best = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, embedding::similarity(embedding, &c.vector)))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let index = match best {
            Some((i, sim)) if 1.0 - sim <= self.config.new_speaker_distance => i,
            _ if self.centroids.len() < self.config.max_speakers => {
                self.centroids.push(Centroid {
                    vector: embedding.to_vec(),
                    voiced_sec: 0.0,
                    label: None,
                });
                self.centroids.len() - 1
            }
            // Cap reached: fall back to the nearest centroid.
            Some((i, _)) => i,
            None => {
                self.centroids.push(Centroid {
                    vector: embedding.to_vec(),
                    voiced_sec: 0.0,
                    label: None,
                });
                0
            }
        };

        let centroid = &mut self.centroids[index];
        centroid.voiced_sec += voiced_sec;
        let smooth = self.config.smooth;
        for (v, e) in centroid.vector.iter_mut().zip(embedding.iter()) {
            *v = (1.0 - smooth) * *v + smooth * *e;
        }
        let norm = centroid.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut centroid.vector {
                *v /= norm;
            }
        }
        index
    }

    /// Fix labels permanently once enough voiced audio has been seen.
    fn maybe_enroll(&mut self) {
        if self.enrolled || self.total_voiced_sec < self.config.enroll_sec {
            return;
        }
        let Some(dominant) = self
            .centroids
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.voiced_sec.total_cmp(&b.1.voiced_sec))
            .map(|(i, _)| i)
        else {
            return;
        };
        for (i, centroid) in self.centroids.iter_mut().enumerate() {
            if i == dominant {
                centroid.label = Some(SpeakerLabel::Host);
            } else {
                centroid.label = Some(SpeakerLabel::Guest(self.next_guest));
                self.next_guest += 1;
            }
        }
        self.enrolled = true;
        info!(
            centroids = self.centroids.len(),
            voiced_sec = self.total_voiced_sec,
            "diarizer enrolled, host fixed"
        );
    }

    /// Label for a centroid, provisional before enrollment.
    fn resolve_label(&mut self, index: usize) -> SpeakerLabel {
        if let Some(label) = self.centroids[index].label {
            return label;
        }
        if self.enrolled {
            // Created after enrollment: next guest number, permanently.
            let label = SpeakerLabel::Guest(self.next_guest);
            self.next_guest += 1;
            self.centroids[index].label = Some(label);
            return label;
        }
        // Past warmup but before enrollment: the dominant centroid reads as
        // host provisionally, everything else as a provisional guest.
        let dominant = self
            .centroids
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.voiced_sec.total_cmp(&b.1.voiced_sec))
            .map(|(i, _)| i);
        if dominant == Some(index) {
            SpeakerLabel::Host
        } else {
            let rank = self
                .centroids
                .iter()
                .enumerate()
                .filter(|&(i, _)| Some(i) != dominant && i < index)
                .count();
            SpeakerLabel::Guest(2 + rank as u8)
        }
    }

    fn debug_map(&self, embedding: &[f32]) -> BTreeMap<String, f32> {
        self.centroids
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let key = match c.label {
                    Some(label) => label.as_str(),
                    None => format!("cluster_{i}"),
                };
                (key, embedding::similarity(embedding, &c.vector))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::embedding::sine_pcm;
    use super::*;
    use crate::pipeline::messages::FlushReason;
    use uuid::Uuid;

    fn segment(freq: f32, seconds: f64, start: f64) -> SpeechSegment {
        SpeechSegment {
            segment_id: Uuid::new_v4(),
            start_ts: start,
            end_ts: start + seconds,
            pcm: sine_pcm(freq, seconds, 16_000),
            voiced_ratio: 1.0,
            flush_reason: FlushReason::Natural,
        }
    }

    fn config() -> DiarizerConfig {
        DiarizerConfig {
            enroll_sec: 4.0,
            warmup_sec: Some(3.0),
            max_speakers: 2,
            ..DiarizerConfig::default()
        }
    }

    #[test]
    fn warmup_emits_unknown_then_host() {
        let mut d = Diarizer::new(&config());
        // 2 s < warmup: unknown.
        let a = d.observe(&segment(300.0, 2.0, 0.0));
        assert_eq!(a.speaker, SpeakerLabel::Unknown);
        // 4 s ≥ warmup and ≥ enroll: host.
        let b = d.observe(&segment(300.0, 2.0, 2.0));
        assert_eq!(b.speaker, SpeakerLabel::Host);
        assert!(d.snapshot().enrolled);
    }

    #[test]
    fn provisional_host_between_warmup_and_enrollment() {
        // warmup 3 s, enroll 4 s: a segment landing the voiced total inside
        // [3, 4) must already read host, before the label is locked.
        let mut d = Diarizer::new(&config());
        let a = d.observe(&segment(300.0, 2.0, 0.0));
        assert_eq!(a.speaker, SpeakerLabel::Unknown);

        let b = d.observe(&segment(300.0, 1.5, 2.0));
        assert_eq!(b.speaker, SpeakerLabel::Host);
        assert!(!d.snapshot().enrolled, "host label still provisional");

        // Crossing the enrollment bar fixes the same label permanently.
        let c = d.observe(&segment(300.0, 1.0, 3.5));
        assert_eq!(c.speaker, SpeakerLabel::Host);
        assert!(d.snapshot().enrolled);
    }

    #[test]
    fn second_voice_becomes_guest_and_stays() {
        let mut d = Diarizer::new(&config());
        // 20 s of host speech in 2 s segments.
        let mut t = 0.0;
        for _ in 0..10 {
            let a = d.observe(&segment(300.0, 2.0, t));
            t += 2.0;
            if t >= 4.0 {
                assert_eq!(a.speaker, SpeakerLabel::Host);
            }
        }
        // 20 s of a distinct voice.
        for _ in 0..10 {
            let a = d.observe(&segment(2400.0, 2.0, t));
            t += 2.0;
            assert_eq!(a.speaker, SpeakerLabel::Guest(2));
            assert!(a.debug.contains_key("host"));
            assert!(a.debug.contains_key("guest_2"));
        }
        // Host resumes and keeps the host label.
        let a = d.observe(&segment(300.0, 2.0, t));
        assert_eq!(a.speaker, SpeakerLabel::Host);
    }

    #[test]
    fn speaker_cap_refuses_new_clusters() {
        let mut d = Diarizer::new(&DiarizerConfig {
            max_speakers: 1,
            ..config()
        });
        for i in 0..3 {
            let _ = d.observe(&segment(300.0, 2.0, f64::from(i) * 2.0));
        }
        // A very different voice must still map onto the single cluster.
        let a = d.observe(&segment(2400.0, 2.0, 6.0));
        assert_eq!(a.speaker, SpeakerLabel::Host);
        assert_eq!(d.snapshot().centroids, 1);
    }

    #[test]
    fn lowering_cap_keeps_existing_clusters() {
        let mut d = Diarizer::new(&config());
        let mut t = 0.0;
        for _ in 0..3 {
            let _ = d.observe(&segment(300.0, 2.0, t));
            t += 2.0;
        }
        let _ = d.observe(&segment(2400.0, 2.0, t));
        assert_eq!(d.snapshot().centroids, 2);
        d.set_max_speakers(1);
        let a = d.observe(&segment(2400.0, 2.0, t + 2.0));
        assert_eq!(d.snapshot().centroids, 2);
        assert_eq!(a.speaker, SpeakerLabel::Guest(2));
    }

    #[test]
    fn disabled_diarizer_reports_unknown() {
        let mut d = Diarizer::new(&DiarizerConfig {
            enabled: false,
            ..config()
        });
        let a = d.observe(&segment(300.0, 5.0, 0.0));
        assert_eq!(a.speaker, SpeakerLabel::Unknown);
        assert!(!d.snapshot().active);
    }
}
