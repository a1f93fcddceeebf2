//! Rolling analysis workflow.
//!
//! A fixed-order node chain over a [`GraphState`]: MemoryLoader →
//! SignalCollector → TopicDetector → MoodEstimator → Planner →
//! AnalysisGenerator → Summary. Nodes neither fork nor join; each one reads
//! the state and fills in its own slot. Only the generator node performs
//! I/O (one LLM call, with a single retry on unparsable output).

pub mod answers;
pub mod nodes;
pub mod persona;

use crate::config::AnalysisConfig;
use crate::error::{LiveError, Result};
use crate::llm::LlmClient;
use crate::pipeline::messages::{
    now_ts, AnalysisCard, AnalysisPayload, TopicCandidate, Vibe, WindowSnapshot,
};
use nodes::ChatSignals;
use persona::Persona;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// State threaded through the node chain for one tick.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub persona: Persona,
    pub signals: ChatSignals,
    pub topics: Vec<TopicCandidate>,
    pub vibe: Vibe,
    pub analysis_focus: String,
    pub card: Option<AnalysisCard>,
}

/// Workflow driver, one instance per session.
pub struct AnalysisWorkflow {
    llm: Arc<dyn LlmClient>,
    config: AnalysisConfig,
    persist_root: PathBuf,
    room_id: String,
}

impl AnalysisWorkflow {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        config: &AnalysisConfig,
        persist_root: PathBuf,
        room_id: &str,
    ) -> Self {
        Self {
            llm,
            config: config.clone(),
            persist_root,
            room_id: room_id.to_owned(),
        }
    }

    /// Run the full chain for one window snapshot.
    ///
    /// # Errors
    ///
    /// Node failures other than generation propagate; the caller skips the
    /// tick. Generation failure never propagates — it degrades the card.
    pub async fn run_tick(&self, snapshot: &WindowSnapshot) -> Result<AnalysisPayload> {
        let mut state = GraphState::default();

        // MemoryLoader: stateless re-read; a missing file is an empty persona.
        state.persona = persona::load(&self.persist_root, &self.room_id);
        // SignalCollector.
        state.signals = nodes::collect_signals(snapshot, self.config.transcript_tail);
        // TopicDetector.
        state.topics = nodes::detect_topics(snapshot, self.config.max_topics);
        // MoodEstimator.
        let chat_texts: Vec<String> = state
            .signals
            .categorized
            .iter()
            .map(|(_, text)| text.clone())
            .collect();
        state.vibe = nodes::estimate_vibe(&snapshot.stats, &chat_texts);
        // Planner.
        state.analysis_focus = nodes::plan_focus(&state.topics, &state.vibe, &snapshot.stats);
        // AnalysisGenerator.
        state.card = Some(self.generate_card(&state).await);
        // Summary.
        Ok(self.summarize(state))
    }

    /// One LLM call with a single retry; both failures degrade the card.
    async fn generate_card(&self, state: &GraphState) -> AnalysisCard {
        let system = build_system_prompt(&state.persona);
        let user = build_user_prompt(state);
        let timeout = Duration::from_secs_f64(self.config.timeout_sec);

        for attempt in 0..2 {
            match self.llm.complete(&system, &user, timeout).await {
                Ok(raw) => match parse_card(&raw) {
                    Ok(card) => {
                        info!(attempt, confidence = card.confidence, "analysis card generated");
                        return card;
                    }
                    Err(e) => warn!(attempt, "analysis card parse failed: {e}"),
                },
                Err(e) => warn!(attempt, "analysis call failed: {e}"),
            }
        }
        warn!("analysis degraded after retry");
        AnalysisCard::degraded()
    }

    fn summarize(&self, state: GraphState) -> AnalysisPayload {
        let card = state.card.unwrap_or_else(AnalysisCard::degraded);
        AnalysisPayload {
            card,
            topic_candidates: state.topics,
            vibe: state.vibe,
            style_profile: state.persona.style_profile(),
            analysis_focus: state.analysis_focus,
            timestamp: now_ts(),
            answer_scripts: None,
        }
    }
}

fn build_system_prompt(persona: &Persona) -> String {
    let mut prompt = String::from(
        "你是直播间实时运营分析师。根据主播人设、近期语音转写与弹幕信号，输出一份简洁的直播分析卡。\
         只输出严格合法的 JSON 对象，不要任何额外文字或代码块标记。JSON 必须包含：\
         analysis_overview（字符串）、audience_sentiment（对象，含 label ∈ {冷, 平稳, 热} 与 signals 数组）、\
         engagement_highlights（字符串数组）、risks（字符串数组）、next_actions（字符串数组）、\
         confidence（0 到 1 的数字）。",
    );
    if !persona.tone.is_empty() {
        prompt.push_str(&format!("主播语气：{}。", persona.tone));
    }
    if !persona.taboos.is_empty() {
        prompt.push_str(&format!("禁忌话术：{}。", persona.taboos.join("、")));
    }
    prompt
}

fn build_user_prompt(state: &GraphState) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("分析重点：{}\n", state.analysis_focus));
    prompt.push_str(&format!(
        "氛围：{}（{:.0} 分），趋势：{}\n",
        state.vibe.level,
        state.vibe.score,
        state.vibe.trends.join("；")
    ));
    if !state.topics.is_empty() {
        let topics: Vec<String> = state
            .topics
            .iter()
            .map(|t| format!("{}({:.2})", t.topic, t.confidence))
            .collect();
        prompt.push_str(&format!("候选话题：{}\n", topics.join("、")));
    }
    let stats = &state.signals.stats;
    prompt.push_str(&format!(
        "窗口统计：弹幕 {} 条/分钟，提问 {} 条，礼物 {} 件，独立用户 {}\n",
        stats.dm_per_min, stats.question_count, stats.gift_count, stats.unique_users
    ));
    if !state.signals.recent_transcript.is_empty() {
        prompt.push_str("近期口播：\n");
        for line in &state.signals.recent_transcript {
            prompt.push_str(line);
            prompt.push('\n');
        }
    }
    if !state.signals.categorized.is_empty() {
        prompt.push_str("弹幕（含分类）：\n");
        for (category, text) in state.signals.categorized.iter().take(30) {
            prompt.push_str(&format!("[{}] {}\n", category.as_str(), text));
        }
    }
    prompt
}

/// Parse a strict-JSON analysis card, tolerating fenced or padded output.
pub(crate) fn parse_card(raw: &str) -> Result<AnalysisCard> {
    let json = extract_json_object(raw)
        .ok_or_else(|| LiveError::Analysis("no JSON object in response".to_owned()))?;
    let mut card: AnalysisCard = serde_json::from_str(json)
        .map_err(|e| LiveError::Analysis(format!("card schema mismatch: {e}")))?;
    card.confidence = card.confidence.clamp(0.0, 1.0);
    Ok(card)
}

/// The first balanced `{...}` block in the text.
pub(crate) fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::pipeline::messages::WindowStats;

    fn snapshot() -> WindowSnapshot {
        WindowSnapshot {
            window_id: 0,
            start_ts: 0.0,
            end_ts: 30.0,
            transcripts: Vec::new(),
            events: Vec::new(),
            stats: WindowStats::default(),
        }
    }

    const GOOD_CARD: &str = r#"{
        "analysis_overview": "互动平稳，提问集中在色号",
        "audience_sentiment": {"label": "平稳", "signals": ["弹幕节奏稳定"]},
        "engagement_highlights": ["色号讨论活跃"],
        "risks": [],
        "next_actions": ["先回答色号问题"],
        "confidence": 0.8
    }"#;

    #[test]
    fn parses_plain_and_fenced_json() {
        let card = parse_card(GOOD_CARD).unwrap();
        assert_eq!(card.audience_sentiment.label, "平稳");

        let fenced = format!("```json\n{GOOD_CARD}\n```");
        let card = parse_card(&fenced).unwrap();
        assert!((card.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = GOOD_CARD.replace("0.8", "3.5");
        let card = parse_card(&raw).unwrap();
        assert!((card.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn non_json_is_an_error() {
        assert!(parse_card("抱歉，我无法输出 JSON").is_err());
        assert!(parse_card("{\"analysis_overview\": 3}").is_err());
    }

    #[tokio::test]
    async fn double_parse_failure_degrades() {
        let llm = MockLlm::new("still not json");
        llm.push_response("也不是 JSON");
        llm.push_response("第二次还不是");
        let workflow = AnalysisWorkflow::new(
            Arc::new(llm),
            &AnalysisConfig::default(),
            PathBuf::from("/nonexistent"),
            "1",
        );
        let payload = workflow.run_tick(&snapshot()).await.unwrap();
        assert_eq!(payload.card.analysis_overview, "解析失败，已降级");
        assert_eq!(payload.card.confidence, 0.0);
    }

    #[tokio::test]
    async fn retry_recovers_from_one_bad_response() {
        let llm = MockLlm::new(GOOD_CARD);
        llm.push_response("not json");
        let workflow = AnalysisWorkflow::new(
            Arc::new(llm),
            &AnalysisConfig::default(),
            PathBuf::from("/nonexistent"),
            "1",
        );
        let payload = workflow.run_tick(&snapshot()).await.unwrap();
        assert!((payload.card.confidence - 0.8).abs() < 1e-6);
    }
}
