//! On-demand answer-script generation.
//!
//! Given a handful of viewer questions plus the current style profile and
//! vibe, asks the LLM for host-voice reply scripts in a few styles. This is
//! driven by the external facade, never by the windowed workflow.

use crate::config::AnalysisConfig;
use crate::error::LiveError;
use crate::llm::LlmClient;
use crate::pipeline::messages::{AnswerScript, Vibe};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Maximum questions accepted per request.
pub const MAX_QUESTIONS: usize = 5;

/// Request for answer scripts.
#[derive(Debug, Clone, Default)]
pub struct AnswerRequest {
    pub questions: Vec<String>,
    /// Recent transcript snippet for grounding, optional.
    pub transcript: String,
    pub style_profile: String,
    pub vibe: Option<Vibe>,
}

/// Result bundle; `error` is non-fatal and accompanies an empty list.
#[derive(Debug, Clone, Default)]
pub struct AnswerBundle {
    pub scripts: Vec<AnswerScript>,
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct ScriptsEnvelope {
    scripts: Vec<AnswerScript>,
}

/// Generates host-voice reply scripts on demand.
pub struct AnswerScriptGenerator {
    llm: Arc<dyn LlmClient>,
    config: AnalysisConfig,
}

impl AnswerScriptGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, config: &AnalysisConfig) -> Self {
        Self {
            llm,
            config: config.clone(),
        }
    }

    /// Produce scripts for up to [`MAX_QUESTIONS`] questions.
    ///
    /// # Errors
    ///
    /// Only an over-long or empty question list is an error; LLM failures
    /// come back as an empty bundle with a message.
    pub async fn generate(&self, request: &AnswerRequest) -> crate::error::Result<AnswerBundle> {
        if request.questions.is_empty() {
            return Err(LiveError::Config("no questions supplied".to_owned()));
        }
        if request.questions.len() > MAX_QUESTIONS {
            return Err(LiveError::Config(format!(
                "at most {MAX_QUESTIONS} questions per request"
            )));
        }

        let system = build_system_prompt(&request.style_profile);
        let user = build_user_prompt(request);
        let timeout = Duration::from_secs_f64(self.config.answer_timeout_sec);

        let raw = match self.llm.complete(&system, &user, timeout).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("answer generation failed: {e}");
                return Ok(AnswerBundle {
                    scripts: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        };

        let Some(json) = super::extract_json_object(&raw) else {
            return Ok(malformed("response carried no JSON object"));
        };
        match serde_json::from_str::<ScriptsEnvelope>(json) {
            Ok(envelope) => Ok(AnswerBundle {
                scripts: envelope.scripts,
                error: None,
            }),
            Err(e) => Ok(malformed(&format!("script schema mismatch: {e}"))),
        }
    }
}

fn malformed(message: &str) -> AnswerBundle {
    warn!("answer scripts degraded: {message}");
    AnswerBundle {
        scripts: Vec::new(),
        error: Some(message.to_owned()),
    }
}

fn build_system_prompt(style_profile: &str) -> String {
    let mut prompt = String::from(
        "你是带货主播的话术助手。针对观众问题，用主播的口吻给出可直接照念的回复。\
         每个问题给 2 到 4 条回复，覆盖 2 到 3 种风格（如 暖心、直接、调侃、专业、幽默）。\
         只输出严格合法的 JSON 对象：{\"scripts\": [{\"question\": ..., \"style\": ..., \
         \"line\": ..., \"notes\": ...}]}，不要任何额外文字。",
    );
    if !style_profile.is_empty() {
        prompt.push_str(&format!("主播风格：{style_profile}。"));
    }
    prompt
}

fn build_user_prompt(request: &AnswerRequest) -> String {
    let mut prompt = String::from("观众问题：\n");
    for (i, q) in request.questions.iter().enumerate() {
        prompt.push_str(&format!("{}. {q}\n", i + 1));
    }
    if let Some(vibe) = &request.vibe {
        prompt.push_str(&format!("当前氛围：{}（{:.0} 分）\n", vibe.level, vibe.score));
    }
    if !request.transcript.is_empty() {
        prompt.push_str(&format!("近期口播片段：\n{}\n", request.transcript));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn request(n: usize) -> AnswerRequest {
        AnswerRequest {
            questions: (0..n).map(|i| format!("问题{i}？")).collect(),
            ..AnswerRequest::default()
        }
    }

    #[tokio::test]
    async fn well_formed_scripts_pass_through() {
        let llm = MockLlm::new(
            r#"{"scripts": [
                {"question": "有蓝色吗", "style": "直接", "line": "蓝色现货，三号链接直接拍。", "notes": "库存 200"},
                {"question": "有蓝色吗", "style": "调侃", "line": "蓝色当然有，不然我穿的这是什么？", "notes": ""}
            ]}"#,
        );
        let generator = AnswerScriptGenerator::new(Arc::new(llm), &AnalysisConfig::default());
        let bundle = generator.generate(&request(1)).await.unwrap();
        assert_eq!(bundle.scripts.len(), 2);
        assert!(bundle.error.is_none());
        assert_eq!(bundle.scripts[0].style, "直接");
    }

    #[tokio::test]
    async fn malformed_response_yields_empty_bundle() {
        let llm = MockLlm::new("这不是 JSON");
        let generator = AnswerScriptGenerator::new(Arc::new(llm), &AnalysisConfig::default());
        let bundle = generator.generate(&request(2)).await.unwrap();
        assert!(bundle.scripts.is_empty());
        assert!(bundle.error.is_some());
    }

    #[tokio::test]
    async fn llm_failure_is_non_fatal() {
        let llm = MockLlm::new("ignored");
        llm.push_error("provider down");
        let generator = AnswerScriptGenerator::new(Arc::new(llm), &AnalysisConfig::default());
        let bundle = generator.generate(&request(1)).await.unwrap();
        assert!(bundle.scripts.is_empty());
        assert!(bundle.error.unwrap().contains("provider down"));
    }

    #[tokio::test]
    async fn question_cap_is_enforced() {
        let llm = MockLlm::new("{}");
        let generator = AnswerScriptGenerator::new(Arc::new(llm), &AnalysisConfig::default());
        assert!(generator.generate(&request(6)).await.is_err());
        assert!(generator.generate(&request(0)).await.is_err());
    }
}
