//! Message types passed between pipeline stages and pushed to subscribers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Absolute wall-clock timestamp in fractional seconds since the Unix epoch.
pub fn now_ts() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

/// A fixed-duration chunk of PCM16 mono audio from the muxer.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic frame index, starting at 0.
    pub seq: u64,
    /// PCM16 samples at the pipeline rate.
    pub pcm: Vec<i16>,
    /// Seconds since session start (`seq * chunk_sec`).
    pub captured_at: f64,
    /// RMS on the normalized [-1, 1] scale.
    pub rms: f32,
}

impl AudioFrame {
    /// RMS of PCM16 samples on the normalized [-1, 1] scale.
    pub fn compute_rms(pcm: &[i16]) -> f32 {
        if pcm.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = pcm
            .iter()
            .map(|&s| {
                let x = f64::from(s) / 32768.0;
                x * x
            })
            .sum();
        (sum_sq / pcm.len() as f64).sqrt() as f32
    }
}

/// Why a speech segment was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Silence exceeded the configured minimum.
    Natural,
    /// Closed out of the hangover state.
    Hangover,
    /// Segment hit the maximum duration and was cut.
    ForceFlush,
    /// Session shutdown flushed the in-flight segment.
    SessionEnd,
}

/// Contiguous speech between VAD-detected boundaries.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub segment_id: Uuid,
    /// Seconds since session start.
    pub start_ts: f64,
    pub end_ts: f64,
    /// Concatenated frame PCM.
    pub pcm: Vec<i16>,
    /// Fraction of frames at or above the VAD threshold.
    pub voiced_ratio: f32,
    pub flush_reason: FlushReason,
}

impl SpeechSegment {
    /// Segment duration in seconds.
    pub fn duration(&self) -> f64 {
        self.end_ts - self.start_ts
    }
}

/// Per-word timing relative to the segment start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    /// Seconds from segment start.
    pub start: f32,
    pub end: f32,
}

/// Speaker label assigned by the diarizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpeakerLabel {
    /// Warmup not reached, or diarization disabled.
    Unknown,
    /// The dominant voice at enrollment time.
    Host,
    /// Additional voices in creation order, starting at 2.
    Guest(u8),
}

impl SpeakerLabel {
    /// Wire/persisted form: `unknown`, `host`, `guest_2`, ...
    pub fn as_str(&self) -> String {
        match self {
            Self::Unknown => "unknown".to_owned(),
            Self::Host => "host".to_owned(),
            Self::Guest(k) => format!("guest_{k}"),
        }
    }

    /// Parse the wire form back into a label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "host" => Some(Self::Host),
            _ => s
                .strip_prefix("guest_")
                .and_then(|k| k.parse::<u8>().ok())
                .filter(|&k| k >= 2)
                .map(Self::Guest),
        }
    }
}

impl Serialize for SpeakerLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for SpeakerLabel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("bad speaker label: {s}")))
    }
}

/// Final recognition result bound to one speech segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub segment_id: Uuid,
    pub text: String,
    /// Recognizer confidence in [0, 1], propagated verbatim.
    pub confidence: f32,
    /// Word timings relative to the segment, non-decreasing.
    pub words: Vec<WordTiming>,
    /// Always true once post-processing has run.
    pub is_final: bool,
    pub speaker: SpeakerLabel,
    /// Centroid label → cosine similarity at assignment time.
    pub speaker_debug: BTreeMap<String, f32>,
    pub room_id: String,
    pub session_id: String,
    /// Absolute epoch seconds.
    pub timestamp: f64,
}

/// Live-room message kinds after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Chat,
    Gift,
    Like,
    MemberEnter,
    Follow,
    RoomStats,
    HostLiveStatus,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Gift => "gift",
            Self::Like => "like",
            Self::MemberEnter => "member_enter",
            Self::Follow => "follow",
            Self::RoomStats => "room_stats",
            Self::HostLiveStatus => "host_live_status",
        }
    }
}

/// One decoded live-room message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Source-provided id, used for cross-reconnect deduplication.
    pub event_id: String,
    pub kind: EventKind,
    pub user_id: String,
    pub user_name: String,
    /// Message text for `chat`; empty otherwise.
    pub content: String,
    /// Kind-specific fields (gift name, counts, totals, ...).
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Server-side timestamp, epoch seconds.
    pub server_ts: f64,
    /// Local receive timestamp, epoch seconds.
    pub ingest_ts: f64,
    pub room_id: String,
}

/// Derived statistics for one window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub chat_count: usize,
    pub dm_per_min: f32,
    pub gift_count: usize,
    pub gift_total_price: f64,
    pub unique_users: usize,
    pub question_count: usize,
}

/// Snapshot of the last `window_sec` seconds of transcripts and events.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub window_id: u64,
    /// Absolute epoch seconds.
    pub start_ts: f64,
    pub end_ts: f64,
    /// Ascending by timestamp.
    pub transcripts: Vec<Transcript>,
    /// Ascending by ingest timestamp, all kinds.
    pub events: Vec<ChatEvent>,
    pub stats: WindowStats,
}

/// Crowd mood estimate for one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vibe {
    /// 冷清 | 平稳 | 热烈 | 火爆
    pub level: String,
    /// 0–100.
    pub score: f32,
    pub trends: Vec<String>,
}

impl Default for Vibe {
    fn default() -> Self {
        Self {
            level: "平稳".to_owned(),
            score: 50.0,
            trends: Vec::new(),
        }
    }
}

/// A detected topic with its relative weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicCandidate {
    pub topic: String,
    pub confidence: f32,
}

/// Audience mood block inside an analysis card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceSentiment {
    /// 冷 | 平稳 | 热
    pub label: String,
    pub signals: Vec<String>,
}

impl Default for AudienceSentiment {
    fn default() -> Self {
        Self {
            label: "平稳".to_owned(),
            signals: Vec::new(),
        }
    }
}

/// LLM analysis result for one window. The five fields are required in
/// every card, including the degraded one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCard {
    pub analysis_overview: String,
    pub audience_sentiment: AudienceSentiment,
    pub engagement_highlights: Vec<String>,
    pub risks: Vec<String>,
    pub next_actions: Vec<String>,
    pub confidence: f32,
}

impl AnalysisCard {
    /// The card emitted when the LLM response could not be parsed twice.
    pub fn degraded() -> Self {
        Self {
            analysis_overview: "解析失败，已降级".to_owned(),
            audience_sentiment: AudienceSentiment::default(),
            engagement_highlights: Vec::new(),
            risks: Vec::new(),
            next_actions: Vec::new(),
            confidence: 0.0,
        }
    }
}

/// Full analysis payload delivered to subscribers after the Summary node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPayload {
    #[serde(flatten)]
    pub card: AnalysisCard,
    pub topic_candidates: Vec<TopicCandidate>,
    pub vibe: Vibe,
    pub style_profile: String,
    pub analysis_focus: String,
    /// Absolute epoch seconds.
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_scripts: Option<Vec<AnswerScript>>,
}

/// One host-voice reply suggestion for a viewer question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerScript {
    pub question: String,
    /// 暖心 | 直接 | 调侃 | 专业 | 幽默 | ...
    pub style: String,
    pub line: String,
    #[serde(default)]
    pub notes: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_label_round_trips() {
        for label in [
            SpeakerLabel::Unknown,
            SpeakerLabel::Host,
            SpeakerLabel::Guest(2),
            SpeakerLabel::Guest(4),
        ] {
            assert_eq!(SpeakerLabel::parse(&label.as_str()), Some(label));
        }
        assert_eq!(SpeakerLabel::parse("guest_1"), None);
        assert_eq!(SpeakerLabel::parse("narrator"), None);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(AudioFrame::compute_rms(&[0; 960]), 0.0);
    }

    #[test]
    fn rms_of_full_scale_square_wave_is_one() {
        let pcm: Vec<i16> = (0..960)
            .map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN + 1 })
            .collect();
        let rms = AudioFrame::compute_rms(&pcm);
        assert!((rms - 1.0).abs() < 0.01, "rms = {rms}");
    }

    #[test]
    fn degraded_card_has_zero_confidence() {
        let card = AnalysisCard::degraded();
        assert_eq!(card.analysis_overview, "解析失败，已降级");
        assert_eq!(card.confidence, 0.0);
    }

    #[test]
    fn analysis_payload_flattens_card_keys() {
        let payload = AnalysisPayload {
            card: AnalysisCard::degraded(),
            topic_candidates: Vec::new(),
            vibe: Vibe::default(),
            style_profile: "自然".to_owned(),
            analysis_focus: "关注提问".to_owned(),
            timestamp: 1_700_000_000.0,
            answer_scripts: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        for key in [
            "analysis_overview",
            "audience_sentiment",
            "engagement_highlights",
            "risks",
            "next_actions",
            "confidence",
            "vibe",
            "topic_candidates",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert!(value.get("answer_scripts").is_none());
    }
}
