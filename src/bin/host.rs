//! Headless session host.
//!
//! Runs one analytics session against a live URL and prints transcripts,
//! events, and analysis cards to the log until Ctrl-C. The HTTP/SSE facade
//! lives elsewhere; this binary is the operational smoke path.
//!
//! Usage: `livescope-host <live_url> [config.toml] [--dry-run]`

use anyhow::{bail, Context};
use livescope::analysis::answers::AnswerRequest;
use livescope::asr::mock::MockRecognizer;
use livescope::llm::{HttpLlm, LlmClient, MockLlm};
use livescope::relay::credentials::{RoomCredentials, StaticCredentialProvider};
use livescope::{LiveConfig, SessionController, SessionDeps};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut live_url = None;
    let mut config_path = None;
    let mut dry_run = false;
    for arg in &args {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--help" | "-h" => {
                eprintln!("usage: livescope-host <live_url> [config.toml] [--dry-run]");
                return Ok(());
            }
            other if live_url.is_none() => live_url = Some(other.to_owned()),
            other => config_path = Some(other.to_owned()),
        }
    }
    let Some(live_url) = live_url else {
        bail!("usage: livescope-host <live_url> [config.toml] [--dry-run]");
    };

    let mut config = match &config_path {
        Some(path) => LiveConfig::load(Path::new(path)).context("loading config")?,
        None => LiveConfig::default(),
    };
    config.apply_env();
    config.validate().context("validating config")?;

    // The recognizer is a capability; the host wires the scripted one until
    // a production model crate is linked in.
    let recognizer = Arc::new(MockRecognizer::fixed("", 0.0));
    let llm: Arc<dyn LlmClient> = if dry_run || config.llm.api_url.is_empty() {
        if !dry_run {
            warn!("LLM endpoint not configured, analysis cards will be degraded");
        }
        Arc::new(MockLlm::new("{}"))
    } else {
        Arc::new(HttpLlm::new(&config.llm)?)
    };
    let credentials = Arc::new(StaticCredentialProvider::new(RoomCredentials {
        endpoint: std::env::var("LIVE_RELAY_ENDPOINT")
            .unwrap_or_else(|_| "wss://webcast-ws.example.com/ws".to_owned()),
        ttwid: std::env::var("LIVE_RELAY_TTWID").unwrap_or_default(),
        signature: std::env::var("LIVE_RELAY_SIGNATURE").unwrap_or_default(),
        a_bogus: std::env::var("LIVE_RELAY_A_BOGUS").unwrap_or_default(),
        cookies: String::new(),
    }));

    let controller = Arc::new(SessionController::new(
        SessionDeps {
            recognizer,
            llm,
            credentials,
        },
        config,
    ));

    let mut transcripts = controller.subscribe_transcripts();
    let mut events = controller.subscribe_events();
    let mut analysis = controller.subscribe_analysis();

    controller.start(&live_url).await?;
    info!("session started, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            t = transcripts.recv() => if let Ok(t) = t {
                info!(speaker = %t.speaker.as_str(), confidence = t.confidence, "transcript: {}", t.text);
            },
            e = events.recv() => if let Ok(e) = e {
                info!(kind = e.kind.as_str(), user = %e.user_name, "event: {}", e.content);
            },
            a = analysis.recv() => if let Ok(a) = a {
                info!(
                    vibe = %a.vibe.level,
                    confidence = a.card.confidence,
                    "analysis: {}",
                    a.card.analysis_overview
                );
                if let Some(first) = a.topic_candidates.first() {
                    info!("top topic: {} ({:.2})", first.topic, first.confidence);
                }
                // Demonstrate the on-demand path once per card in dry runs.
                if dry_run {
                    let request = AnswerRequest {
                        questions: vec!["这个怎么买？".to_owned()],
                        ..AnswerRequest::default()
                    };
                    match controller.generate_answers(request).await {
                        Ok(bundle) => info!("answer scripts: {}", bundle.scripts.len()),
                        Err(e) => warn!("answer generation rejected: {e}"),
                    }
                }
            },
        }
    }

    info!("stopping session");
    controller.stop().await?;
    let status = controller.status().await;
    info!(
        "final stats: {} chunks, {} ok / {} failed transcriptions, mean confidence {:.2}",
        status.stats.total_audio_chunks,
        status.stats.successful_transcriptions,
        status.stats.failed_transcriptions,
        status.stats.average_confidence
    );
    Ok(())
}
