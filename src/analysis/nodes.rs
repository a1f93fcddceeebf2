//! Heuristic workflow nodes: signal collection, topic detection, mood
//! estimation, and focus planning.
//!
//! These run before the LLM call and shape its prompt. All of them are pure
//! functions over the window snapshot; only the generator node talks to the
//! network.

use crate::pipeline::messages::{EventKind, TopicCandidate, Vibe, WindowSnapshot, WindowStats};
use crate::window::has_question_marker;
use std::collections::HashMap;

/// Category assigned to each chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatCategory {
    Question,
    Product,
    Support,
    Emotion,
    Other,
}

impl ChatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Product => "product",
            Self::Support => "support",
            Self::Emotion => "emotion",
            Self::Other => "other",
        }
    }
}

const PRODUCT_MARKERS: &[&str] = &[
    "链接", "价格", "多少钱", "优惠", "券", "库存", "尺码", "色号", "型号", "发货", "快递", "买",
];
const SUPPORT_MARKERS: &[&str] = &["加油", "支持", "喜欢你", "关注了", "粉丝", "来了", "冲"];
const EMOTION_MARKERS: &[&str] = &["哈哈", "笑死", "心疼", "感动", "生气", "无语", "爱了"];

/// Keyword + heuristic classification of one chat message.
pub fn categorize(content: &str) -> ChatCategory {
    if has_question_marker(content) {
        return ChatCategory::Question;
    }
    if PRODUCT_MARKERS.iter().any(|m| content.contains(m)) {
        return ChatCategory::Product;
    }
    if SUPPORT_MARKERS.iter().any(|m| content.contains(m)) {
        return ChatCategory::Support;
    }
    if EMOTION_MARKERS.iter().any(|m| content.contains(m)) {
        return ChatCategory::Emotion;
    }
    ChatCategory::Other
}

/// Collected signals for the prompt builder.
#[derive(Debug, Clone, Default)]
pub struct ChatSignals {
    /// Last few host/guest sentences, oldest first.
    pub recent_transcript: Vec<String>,
    /// (category, content) per chat message, window order.
    pub categorized: Vec<(ChatCategory, String)>,
    /// Chat messages classified as questions, window order.
    pub questions: Vec<String>,
    pub stats: WindowStats,
}

/// Merge transcripts and events into prompt-ready signals.
pub fn collect_signals(snapshot: &WindowSnapshot, transcript_tail: usize) -> ChatSignals {
    let recent_transcript: Vec<String> = snapshot
        .transcripts
        .iter()
        .rev()
        .take(transcript_tail)
        .map(|t| format!("[{}] {}", t.speaker.as_str(), t.text))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let mut categorized = Vec::new();
    let mut questions = Vec::new();
    for event in &snapshot.events {
        if event.kind != EventKind::Chat {
            continue;
        }
        let category = categorize(&event.content);
        if category == ChatCategory::Question {
            questions.push(event.content.clone());
        }
        categorized.push((category, event.content.clone()));
    }

    ChatSignals {
        recent_transcript,
        categorized,
        questions,
        stats: snapshot.stats.clone(),
    }
}

const STOP_TOKENS: &[&str] = &[
    "主播", "一个", "这个", "那个", "什么", "没有", "就是", "我们", "你们", "可以", "不是",
    "的", "了", "是", "我", "你", "他", "她", "吗", "啊", "哈哈",
];

/// Term-frequency topic extraction over transcripts plus chat text.
///
/// Tokens are ASCII words and CJK bigrams; confidence is the token share of
/// the winning term, so the list is comparable across windows.
pub fn detect_topics(snapshot: &WindowSnapshot, max_topics: usize) -> Vec<TopicCandidate> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;

    let mut feed = |text: &str| {
        for token in tokenize(text) {
            if STOP_TOKENS.contains(&token.as_str()) {
                continue;
            }
            *counts.entry(token).or_insert(0) += 1;
            total += 1;
        }
    };
    for t in &snapshot.transcripts {
        feed(&t.text);
    }
    for e in &snapshot.events {
        if e.kind == EventKind::Chat {
            feed(&e.content);
        }
    }

    if total == 0 {
        return Vec::new();
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().filter(|&(_, n)| n > 1).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(max_topics)
        .map(|(topic, n)| TopicCandidate {
            topic,
            confidence: (n as f32 / total as f32).min(1.0),
        })
        .collect()
}

/// ASCII words and CJK character bigrams.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut ascii = String::new();
    let mut prev_cjk: Option<char> = None;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            ascii.push(c.to_ascii_lowercase());
            prev_cjk = None;
            continue;
        }
        if !ascii.is_empty() {
            if ascii.chars().count() > 1 {
                tokens.push(std::mem::take(&mut ascii));
            } else {
                ascii.clear();
            }
        }
        if is_cjk(c) {
            if let Some(p) = prev_cjk {
                tokens.push(format!("{p}{c}"));
            }
            prev_cjk = Some(c);
        } else {
            prev_cjk = None;
        }
    }
    if ascii.chars().count() > 1 {
        tokens.push(ascii);
    }
    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}')
}

const POSITIVE_WORDS: &[&str] = &[
    "好看", "喜欢", "漂亮", "不错", "爱了", "好用", "支持", "加油", "真香", "哈哈", "期待", "棒",
];
const NEGATIVE_WORDS: &[&str] = &[
    "难看", "贵", "假的", "骗", "退货", "差评", "失望", "无语", "垃圾", "翻车", "别买",
];

/// Weighted crowd-mood estimate: density 40%, interaction quality 35%,
/// sentiment 25%.
pub fn estimate_vibe(stats: &WindowStats, chat_texts: &[String]) -> Vibe {
    let density = 40.0 * (f64::from(stats.dm_per_min) / 80.0).min(1.0) as f32;

    let chat = stats.chat_count.max(1) as f32;
    let user_spread = (stats.unique_users as f32 / chat).min(1.0);
    let question_ratio = (stats.question_count as f32 / chat).min(1.0);
    let gift_bonus = (stats.gift_count as f32 * 0.1).min(0.3);
    let interaction = 35.0 * (0.6 * user_spread + 0.4 * question_ratio + gift_bonus).min(1.0);

    let mut positive = 0usize;
    let mut negative = 0usize;
    for text in chat_texts {
        positive += POSITIVE_WORDS.iter().filter(|w| text.contains(*w)).count();
        negative += NEGATIVE_WORDS.iter().filter(|w| text.contains(*w)).count();
    }
    let polarity = if positive + negative == 0 {
        0.0
    } else {
        (positive as f32 - negative as f32) / (positive + negative) as f32
    };
    let sentiment = 25.0 * (0.5 + 0.5 * polarity);

    let score = (density + interaction + sentiment).clamp(0.0, 100.0);
    let level = match score {
        s if s < 25.0 => "冷清",
        s if s < 55.0 => "平稳",
        s if s < 80.0 => "热烈",
        _ => "火爆",
    };

    let mut trends = Vec::new();
    if stats.dm_per_min >= 40.0 {
        trends.push("弹幕密度高".to_owned());
    } else if stats.dm_per_min < 5.0 {
        trends.push("弹幕稀少".to_owned());
    }
    if stats.question_count >= 3 {
        trends.push("提问集中".to_owned());
    }
    if stats.gift_count > 0 {
        trends.push("有礼物进账".to_owned());
    }
    if negative > positive {
        trends.push("负面情绪抬头".to_owned());
    }

    Vibe {
        level: level.to_owned(),
        score,
        trends,
    }
}

/// One-sentence Chinese focus statement for the generator prompt.
pub fn plan_focus(topics: &[TopicCandidate], vibe: &Vibe, stats: &WindowStats) -> String {
    let chat = stats.chat_count.max(1);
    let question_heavy = stats.question_count * 3 >= chat;
    match (topics.first(), question_heavy) {
        (Some(top), true) => format!(
            "当前氛围{}，观众围绕「{}」提问较多，优先梳理并逐条回应这些问题。",
            vibe.level, top.topic
        ),
        (Some(top), false) => format!(
            "当前氛围{}，话题集中在「{}」，围绕它组织讲解并带动互动。",
            vibe.level, top.topic
        ),
        (None, true) => format!("当前氛围{}，提问密度偏高，先集中答疑再推进节奏。", vibe.level),
        (None, false) => format!("当前氛围{}，暂无明显话题，保持节奏并主动抛出互动点。", vibe.level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorize_covers_the_buckets() {
        assert_eq!(categorize("这个有蓝色吗"), ChatCategory::Question);
        assert_eq!(categorize("上链接"), ChatCategory::Product);
        assert_eq!(categorize("主播加油"), ChatCategory::Support);
        assert_eq!(categorize("笑死我了"), ChatCategory::Emotion);
        assert_eq!(categorize("路过"), ChatCategory::Other);
    }

    #[test]
    fn tokenizer_emits_cjk_bigrams_and_ascii_words() {
        let tokens = tokenize("蓝色sku123好看");
        assert!(tokens.contains(&"蓝色".to_owned()));
        assert!(tokens.contains(&"sku123".to_owned()));
        assert!(tokens.contains(&"好看".to_owned()));
    }

    #[test]
    fn hot_window_scores_warm_or_hot() {
        let stats = WindowStats {
            chat_count: 20,
            dm_per_min: 40.0,
            gift_count: 0,
            gift_total_price: 0.0,
            unique_users: 20,
            question_count: 5,
        };
        let vibe = estimate_vibe(&stats, &[]);
        assert!(
            vibe.level == "平稳" || vibe.level == "热烈",
            "level = {} score = {}",
            vibe.level,
            vibe.score
        );
    }

    #[test]
    fn dead_room_is_cold() {
        let stats = WindowStats::default();
        let vibe = estimate_vibe(&stats, &[]);
        assert_eq!(vibe.level, "冷清");
    }

    #[test]
    fn negative_chat_drags_the_score() {
        let stats = WindowStats {
            chat_count: 10,
            dm_per_min: 20.0,
            unique_users: 10,
            ..WindowStats::default()
        };
        let happy = estimate_vibe(&stats, &["真香好看".to_owned()]);
        let angry = estimate_vibe(&stats, &["翻车了退货".to_owned()]);
        assert!(angry.score < happy.score);
        assert!(angry.trends.contains(&"负面情绪抬头".to_owned()));
    }

    #[test]
    fn focus_mentions_top_topic() {
        let topics = vec![TopicCandidate {
            topic: "蓝色".to_owned(),
            confidence: 0.4,
        }];
        let vibe = Vibe::default();
        let stats = WindowStats {
            chat_count: 10,
            question_count: 5,
            ..WindowStats::default()
        };
        let focus = plan_focus(&topics, &vibe, &stats);
        assert!(focus.contains("蓝色"));
        assert!(focus.contains("提问"));
    }
}
