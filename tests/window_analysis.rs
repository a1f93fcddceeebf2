//! Window tick with mixed signals through the full analysis workflow.

use livescope::analysis::AnalysisWorkflow;
use livescope::config::AnalysisConfig;
use livescope::llm::MockLlm;
use livescope::pipeline::messages::{ChatEvent, EventKind, SpeakerLabel, Transcript};
use livescope::window::WindowAccumulator;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

fn transcript(ts: f64, text: &str) -> Transcript {
    Transcript {
        segment_id: Uuid::new_v4(),
        text: text.to_owned(),
        confidence: 0.9,
        words: Vec::new(),
        is_final: true,
        speaker: SpeakerLabel::Host,
        speaker_debug: Default::default(),
        room_id: "7".to_owned(),
        session_id: "s".to_owned(),
        timestamp: ts,
    }
}

fn chat(ts: f64, id: u32, content: &str) -> ChatEvent {
    ChatEvent {
        event_id: format!("e{id}"),
        kind: EventKind::Chat,
        user_id: format!("u{id}"),
        user_name: format!("观众{id}"),
        content: content.to_owned(),
        payload: serde_json::Map::new(),
        server_ts: ts,
        ingest_ts: ts,
        room_id: "7".to_owned(),
    }
}

const CARD: &str = r#"{
    "analysis_overview": "色号提问密集，节奏稳定",
    "audience_sentiment": {"label": "热", "signals": ["弹幕密集", "提问集中"]},
    "engagement_highlights": ["蓝色色号讨论"],
    "risks": ["提问积压"],
    "next_actions": ["逐条回应色号问题"],
    "confidence": 0.85
}"#;

#[tokio::test]
async fn mixed_window_drives_card_and_vibe() {
    let base = 10_000.0;
    let mut accumulator = WindowAccumulator::new(30.0);
    accumulator.push_transcript(transcript(base + 5.0, "这个颜色有蓝色吗"));
    // 20 chat messages over 30 s, 5 carrying question markers.
    for i in 0..20u32 {
        let content = if i < 5 {
            format!("蓝色有货吗{i}")
        } else {
            format!("好看爱了{i}")
        };
        accumulator.push_event(chat(base + f64::from(i) * 1.4, i, &content));
    }

    let snapshot = accumulator.snapshot(30.0, base + 30.0);
    assert!((snapshot.stats.dm_per_min - 40.0).abs() < 1e-3);
    assert_eq!(snapshot.stats.question_count, 5);
    assert_eq!(snapshot.stats.unique_users, 20);
    assert_eq!(snapshot.transcripts.len(), 1);

    let workflow = AnalysisWorkflow::new(
        Arc::new(MockLlm::new(CARD)),
        &AnalysisConfig::default(),
        PathBuf::from("/nonexistent"),
        "7",
    );
    let payload = workflow.run_tick(&snapshot).await.unwrap();

    assert!(
        payload.vibe.level == "平稳" || payload.vibe.level == "热烈",
        "vibe = {} ({})",
        payload.vibe.level,
        payload.vibe.score
    );
    assert_eq!(payload.card.audience_sentiment.label, "热");
    assert!((payload.card.confidence - 0.85).abs() < 1e-6);
    assert!(!payload.analysis_focus.is_empty());
    assert!(!payload.topic_candidates.is_empty());
    // The dominant bigram across chat and transcript is the color word.
    assert!(payload
        .topic_candidates
        .iter()
        .any(|t| t.topic.contains("蓝色")));

    // Serialized payload carries the card keys at the top level.
    let value = serde_json::to_value(&payload).unwrap();
    for key in [
        "analysis_overview",
        "audience_sentiment",
        "engagement_highlights",
        "risks",
        "next_actions",
        "confidence",
        "topic_candidates",
        "vibe",
        "style_profile",
        "analysis_focus",
        "timestamp",
    ] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
}

#[tokio::test]
async fn empty_window_still_produces_a_payload() {
    let mut accumulator = WindowAccumulator::new(30.0);
    let snapshot = accumulator.snapshot(30.0, 1000.0);
    assert_eq!(snapshot.stats.chat_count, 0);

    let workflow = AnalysisWorkflow::new(
        Arc::new(MockLlm::new(CARD)),
        &AnalysisConfig::default(),
        PathBuf::from("/nonexistent"),
        "7",
    );
    let payload = workflow.run_tick(&snapshot).await.unwrap();
    assert_eq!(payload.vibe.level, "冷清");
    assert!(payload.topic_candidates.is_empty());
}
