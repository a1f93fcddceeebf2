//! Relay reconnect scenario against an in-process websocket server:
//! events before the disconnect are kept, duplicates after the reconnect
//! are suppressed, and the status walks running → reconnecting → running.

use futures_util::{SinkExt, StreamExt};
use livescope::config::RelayConfig;
use livescope::pipeline::messages::EventKind;
use livescope::relay::credentials::{RoomCredentials, StaticCredentialProvider};
use livescope::relay::{wire, EventRelay};
use livescope::session::status::{RelayState, SessionMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

fn chat_frame(msg_id: u64, content: &str) -> Vec<u8> {
    let payload = wire::encode_chat_payload(msg_id, 777, 1_700_000_000_000 + msg_id, msg_id, "观众", content);
    wire::encode_response_frame(
        msg_id,
        &[("WebcastChatMessage".to_owned(), payload)],
        false,
        "",
        true,
    )
}

#[tokio::test]
async fn reconnect_dedupes_and_recovers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Server: first connection pushes 50 chats then drops; second pushes
    // 10 duplicates and 10 fresh ones, then idles until the client leaves.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for i in 0..50u64 {
            ws.send(WsMessage::Binary(chat_frame(i, &format!("弹幕{i}"))))
                .await
                .unwrap();
        }
        // Abrupt close, no handshake.
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for i in 40..60u64 {
            ws.send(WsMessage::Binary(chat_frame(i, &format!("弹幕{i}"))))
                .await
                .unwrap();
        }
        // Drain client traffic (heartbeats) until it disconnects.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = RelayConfig {
        backoff_initial_sec: 0.05,
        backoff_cap_sec: 0.2,
        ..RelayConfig::default()
    };
    let provider = Arc::new(StaticCredentialProvider::new(RoomCredentials {
        endpoint: format!("ws://127.0.0.1:{port}/ws"),
        ttwid: "t".to_owned(),
        signature: "s".to_owned(),
        a_bogus: "a".to_owned(),
        cookies: String::new(),
    }));
    let metrics = Arc::new(SessionMetrics::default());
    let (relay, mut status_rx) = EventRelay::new(&config, "777", provider, metrics);
    let queue = relay.queue();

    // Record every status transition.
    let transitions = Arc::new(std::sync::Mutex::new(vec![*status_rx.borrow()]));
    let transitions_task = Arc::clone(&transitions);
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            transitions_task
                .lock()
                .unwrap()
                .push(*status_rx.borrow());
        }
    });

    let cancel = CancellationToken::new();
    let relay_cancel = cancel.clone();
    let relay_task = tokio::spawn(async move { relay.run(relay_cancel).await });

    // Collect 60 unique events (50 + 10 fresh; 10 duplicates suppressed).
    let mut events = Vec::new();
    let collect = async {
        while events.len() < 60 {
            events.push(queue.pop().await);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("expected 60 unique events");

    // No more events should surface; duplicates were dropped by id.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.is_empty());

    let mut ids: Vec<u64> = events
        .iter()
        .map(|e| e.event_id.parse::<u64>().unwrap())
        .collect();
    assert!(events.iter().all(|e| e.kind == EventKind::Chat));
    // The first 50 arrive in server order before the reconnect.
    assert_eq!(ids[..50], (0..50).collect::<Vec<u64>>()[..]);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 60);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), relay_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
    // Let the status watcher drain the final transition.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = transitions.lock().unwrap().clone();
    let reconnecting_at = seen
        .iter()
        .position(|s| *s == RelayState::Reconnecting)
        .expect("relay observed the disconnect");
    let recovered = seen[reconnecting_at..]
        .iter()
        .position(|s| *s == RelayState::Running);
    assert!(recovered.is_some(), "relay recovered after reconnect: {seen:?}");
    assert_eq!(seen.last(), Some(&RelayState::Stopped), "transitions: {seen:?}");
}
