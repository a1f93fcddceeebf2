//! HTTP contract tests for the LLM client and the degraded-card path.

use livescope::analysis::AnalysisWorkflow;
use livescope::config::{AnalysisConfig, LlmConfig};
use livescope::llm::{HttpLlm, LlmClient};
use livescope::pipeline::messages::{WindowSnapshot, WindowStats};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
}

fn llm_config(server: &MockServer) -> LlmConfig {
    LlmConfig {
        api_url: server.uri(),
        api_key: "sk-test".to_owned(),
        model: "qwen-plus".to_owned(),
        ..LlmConfig::default()
    }
}

fn empty_snapshot() -> WindowSnapshot {
    WindowSnapshot {
        window_id: 0,
        start_ts: 0.0,
        end_ts: 30.0,
        transcripts: Vec::new(),
        events: Vec::new(),
        stats: WindowStats::default(),
    }
}

#[tokio::test]
async fn client_sends_model_and_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "qwen-plus",
            "stream": false,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("收到")))
        .expect(1)
        .mount(&server)
        .await;

    let llm = HttpLlm::new(&llm_config(&server)).unwrap();
    let out = llm
        .complete("system", "user", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(out, "收到");
}

#[tokio::test]
async fn provider_error_status_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let llm = HttpLlm::new(&llm_config(&server)).unwrap();
    let err = llm
        .complete("s", "u", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("429"));
}

#[tokio::test]
async fn missing_content_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": []
        })))
        .mount(&server)
        .await;

    let llm = HttpLlm::new(&llm_config(&server)).unwrap();
    assert!(llm.complete("s", "u", Duration::from_secs(5)).await.is_err());
}

/// Scenario: the provider answers twice with non-JSON prose. The workflow
/// retries once, then emits the degraded card with zero confidence.
#[tokio::test]
async fn two_bad_responses_degrade_the_card() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "抱歉，我更愿意用自然语言描述这场直播。",
        )))
        .expect(2)
        .mount(&server)
        .await;

    let llm = Arc::new(HttpLlm::new(&llm_config(&server)).unwrap());
    let workflow = AnalysisWorkflow::new(
        llm,
        &AnalysisConfig::default(),
        PathBuf::from("/nonexistent"),
        "7",
    );
    let payload = workflow.run_tick(&empty_snapshot()).await.unwrap();
    assert_eq!(payload.card.analysis_overview, "解析失败，已降级");
    assert_eq!(payload.card.confidence, 0.0);
    // The degraded card still satisfies the required schema.
    let value = serde_json::to_value(&payload).unwrap();
    assert!(value.get("audience_sentiment").is_some());
    assert!(value.get("next_actions").is_some());
}

/// A fenced JSON card on the second attempt recovers the tick.
#[tokio::test]
async fn fenced_json_on_retry_recovers() {
    let server = MockServer::start().await;
    let card = r#"```json
{"analysis_overview": "恢复", "audience_sentiment": {"label": "平稳", "signals": []},
 "engagement_highlights": [], "risks": [], "next_actions": [], "confidence": 0.5}
```"#;
    let responses = std::sync::Arc::new(std::sync::Mutex::new(vec![
        completion_body("第一次：不是 JSON"),
        completion_body(card),
    ]));
    Mock::given(method("POST"))
        .respond_with(move |_req: &Request| {
            let mut responses = responses.lock().unwrap();
            let body = responses.remove(0);
            ResponseTemplate::new(200).set_body_json(body)
        })
        .expect(2)
        .mount(&server)
        .await;

    let llm = Arc::new(HttpLlm::new(&llm_config(&server)).unwrap());
    let workflow = AnalysisWorkflow::new(
        llm,
        &AnalysisConfig::default(),
        PathBuf::from("/nonexistent"),
        "7",
    );
    let payload = workflow.run_tick(&empty_snapshot()).await.unwrap();
    assert_eq!(payload.card.analysis_overview, "恢复");
    assert!((payload.card.confidence - 0.5).abs() < 1e-6);
}
