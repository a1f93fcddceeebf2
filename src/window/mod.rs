//! Rolling window over transcripts and chat events.
//!
//! Ring buffers retain slightly more than the largest allowed window; a
//! snapshot is a shallow copy of the entries inside the requested window,
//! sorted ascending, with derived stats computed inline.

use crate::pipeline::messages::{ChatEvent, EventKind, Transcript, WindowSnapshot, WindowStats};
use std::collections::{HashSet, VecDeque};

/// Extra retention beyond the largest window, seconds.
const RETENTION_MARGIN_SEC: f64 = 60.0;
/// Windows may be widened at runtime up to this bound.
const MAX_WINDOW_SEC: f64 = 600.0;

/// Accumulates recent transcripts and events for periodic snapshots.
pub struct WindowAccumulator {
    transcripts: VecDeque<Transcript>,
    events: VecDeque<ChatEvent>,
    retention_sec: f64,
    next_window_id: u64,
}

impl WindowAccumulator {
    pub fn new(window_sec: f64) -> Self {
        Self {
            transcripts: VecDeque::new(),
            events: VecDeque::new(),
            retention_sec: window_sec.max(MAX_WINDOW_SEC) + RETENTION_MARGIN_SEC,
            next_window_id: 0,
        }
    }

    pub fn push_transcript(&mut self, transcript: Transcript) {
        self.transcripts.push_back(transcript);
        let cutoff = self.newest_ts() - self.retention_sec;
        while self
            .transcripts
            .front()
            .is_some_and(|t| t.timestamp < cutoff)
        {
            let _ = self.transcripts.pop_front();
        }
    }

    pub fn push_event(&mut self, event: ChatEvent) {
        self.events.push_back(event);
        let cutoff = self.newest_ts() - self.retention_sec;
        while self.events.front().is_some_and(|e| e.ingest_ts < cutoff) {
            let _ = self.events.pop_front();
        }
    }

    fn newest_ts(&self) -> f64 {
        let t = self.transcripts.back().map_or(f64::MIN, |t| t.timestamp);
        let e = self.events.back().map_or(f64::MIN, |e| e.ingest_ts);
        t.max(e)
    }

    /// Snapshot the last `window_sec` seconds ending at `now`.
    pub fn snapshot(&mut self, window_sec: f64, now: f64) -> WindowSnapshot {
        let start = now - window_sec;
        let mut transcripts: Vec<Transcript> = self
            .transcripts
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp <= now)
            .cloned()
            .collect();
        transcripts.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let mut events: Vec<ChatEvent> = self
            .events
            .iter()
            .filter(|e| e.ingest_ts >= start && e.ingest_ts <= now)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.ingest_ts.total_cmp(&b.ingest_ts));

        let stats = compute_stats(&events, window_sec);
        let window_id = self.next_window_id;
        self.next_window_id += 1;
        WindowSnapshot {
            window_id,
            start_ts: start,
            end_ts: now,
            transcripts,
            events,
            stats,
        }
    }
}

fn compute_stats(events: &[ChatEvent], window_sec: f64) -> WindowStats {
    let mut stats = WindowStats::default();
    let mut users: HashSet<&str> = HashSet::new();
    for event in events {
        if !event.user_id.is_empty() {
            let _ = users.insert(event.user_id.as_str());
        }
        match event.kind {
            EventKind::Chat => {
                stats.chat_count += 1;
                if has_question_marker(&event.content) {
                    stats.question_count += 1;
                }
            }
            EventKind::Gift => {
                let count = event
                    .payload
                    .get("count")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(1) as usize;
                stats.gift_count += count;
                stats.gift_total_price += event
                    .payload
                    .get("total_price")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
            }
            _ => {}
        }
    }
    stats.unique_users = users.len();
    if window_sec > 0.0 {
        stats.dm_per_min = (stats.chat_count as f64 / window_sec * 60.0) as f32;
    }
    stats
}

/// Whether a chat message reads as a question.
pub fn has_question_marker(content: &str) -> bool {
    if content.contains('？') || content.contains('?') {
        return true;
    }
    const MARKERS: &[&str] = &[
        "吗", "嘛", "怎么", "什么", "哪", "多少", "几号", "能不能", "可不可以", "有没有", "是不是",
    ];
    MARKERS.iter().any(|m| content.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::messages::SpeakerLabel;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn transcript(ts: f64, text: &str) -> Transcript {
        Transcript {
            segment_id: Uuid::new_v4(),
            text: text.to_owned(),
            confidence: 0.9,
            words: Vec::new(),
            is_final: true,
            speaker: SpeakerLabel::Host,
            speaker_debug: BTreeMap::new(),
            room_id: "r".to_owned(),
            session_id: "s".to_owned(),
            timestamp: ts,
        }
    }

    fn chat(ts: f64, id: &str, user: &str, content: &str) -> ChatEvent {
        ChatEvent {
            event_id: id.to_owned(),
            kind: EventKind::Chat,
            user_id: user.to_owned(),
            user_name: user.to_owned(),
            content: content.to_owned(),
            payload: serde_json::Map::new(),
            server_ts: ts,
            ingest_ts: ts,
            room_id: "r".to_owned(),
        }
    }

    fn gift(ts: f64, id: &str, user: &str, count: u64, total: f64) -> ChatEvent {
        let mut payload = serde_json::Map::new();
        let _ = payload.insert("gift_name".to_owned(), "小心心".into());
        let _ = payload.insert("count".to_owned(), count.into());
        let _ = payload.insert("total_price".to_owned(), total.into());
        ChatEvent {
            event_id: id.to_owned(),
            kind: EventKind::Gift,
            user_id: user.to_owned(),
            user_name: user.to_owned(),
            content: String::new(),
            payload,
            server_ts: ts,
            ingest_ts: ts,
            room_id: "r".to_owned(),
        }
    }

    #[test]
    fn snapshot_is_bounded_and_sorted() {
        let mut acc = WindowAccumulator::new(30.0);
        acc.push_transcript(transcript(100.0, "太早了"));
        acc.push_transcript(transcript(1005.0, "这个颜色有蓝色吗"));
        acc.push_transcript(transcript(1002.0, "先到的"));
        acc.push_event(chat(1001.0, "e1", "u1", "主播好"));
        acc.push_event(chat(990.0, "e0", "u2", "太早了"));

        let snap = acc.snapshot(30.0, 1010.0);
        assert_eq!(snap.transcripts.len(), 2);
        assert!((snap.transcripts[0].timestamp - 1002.0).abs() < 1e-9);
        assert_eq!(snap.events.len(), 2);
        assert!(snap.events[0].ingest_ts <= snap.events[1].ingest_ts);
        assert_eq!(snap.window_id, 0);
        assert_eq!(acc.snapshot(30.0, 1010.0).window_id, 1);
    }

    #[test]
    fn stats_match_mixed_signals() {
        let mut acc = WindowAccumulator::new(30.0);
        // 20 chat messages in 30 s, 5 question-like.
        for i in 0..20 {
            let content = if i < 5 { format!("有蓝色吗{i}") } else { format!("好看{i}") };
            acc.push_event(chat(1000.0 + f64::from(i), &format!("e{i}"), &format!("u{i}"), &content));
        }
        acc.push_event(gift(1020.0, "g1", "u0", 3, 8.8));

        let snap = acc.snapshot(30.0, 1025.0);
        assert_eq!(snap.stats.chat_count, 20);
        assert!((snap.stats.dm_per_min - 40.0).abs() < 1e-3);
        assert_eq!(snap.stats.question_count, 5);
        assert_eq!(snap.stats.gift_count, 3);
        assert!((snap.stats.gift_total_price - 8.8).abs() < 1e-9);
        assert_eq!(snap.stats.unique_users, 20);
    }

    #[test]
    fn old_entries_are_pruned_past_retention() {
        let mut acc = WindowAccumulator::new(30.0);
        acc.push_event(chat(0.0, "old", "u", "远古弹幕"));
        acc.push_event(chat(1000.0, "new", "u", "新弹幕"));
        assert_eq!(acc.events.len(), 1);
    }

    #[test]
    fn question_markers() {
        assert!(has_question_marker("这个颜色有蓝色吗"));
        assert!(has_question_marker("怎么拍"));
        assert!(has_question_marker("多少钱?"));
        assert!(!has_question_marker("主播好漂亮"));
    }
}
