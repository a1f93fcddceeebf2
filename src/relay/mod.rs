//! Live-room event relay.
//!
//! Long-lived websocket client: acquires signed credentials, subscribes to
//! the room's push stream, decodes frames, and fans normalized events into
//! a bounded queue with a chat-first drop policy. Disconnects reconnect
//! with exponential back-off; a burst of reconnects inside the failure
//! window parks the relay in `failed` until an explicit restart.

pub mod credentials;
pub mod wire;

use crate::config::RelayConfig;
use crate::error::{LiveError, Result};
use crate::pipeline::messages::{now_ts, ChatEvent, EventKind};
use crate::session::status::{RelayState, SessionMetrics};
use credentials::{CredentialProvider, RoomCredentials};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a chat producer blocks on a full queue before counting a drop.
const CHAT_BLOCK_BUDGET: Duration = Duration::from_millis(50);
/// A connection older than this resets the back-off schedule.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Dedupe across reconnects
// ---------------------------------------------------------------------------

/// Sliding-window `event_id` deduplicator.
pub struct EventDeduper {
    window_sec: f64,
    seen: HashMap<String, f64>,
    order: VecDeque<(f64, String)>,
}

impl EventDeduper {
    pub fn new(window_sec: f64) -> Self {
        Self {
            window_sec,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when the id has not been seen inside the window.
    pub fn insert(&mut self, event_id: &str, now: f64) -> bool {
        let cutoff = now - self.window_sec;
        while self.order.front().is_some_and(|(ts, _)| *ts < cutoff) {
            if let Some((ts, id)) = self.order.pop_front() {
                // Only forget the id if no fresher sighting exists.
                if self.seen.get(&id).is_some_and(|&seen_ts| seen_ts <= ts) {
                    let _ = self.seen.remove(&id);
                }
            }
        }
        if self.seen.contains_key(event_id) {
            return false;
        }
        let _ = self.seen.insert(event_id.to_owned(), now);
        self.order.push_back((now, event_id.to_owned()));
        true
    }
}

// ---------------------------------------------------------------------------
// Bounded fan-out queue
// ---------------------------------------------------------------------------

/// Bounded event queue with the relay's drop policy: on overflow the oldest
/// non-chat entry goes first; chat blocks briefly and is only dropped with
/// the counter incremented, never silently.
pub struct EventQueue {
    inner: std::sync::Mutex<VecDeque<ChatEvent>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one event under the drop policy.
    pub async fn push(&self, event: ChatEvent, metrics: &SessionMetrics) {
        let deadline = Instant::now() + CHAT_BLOCK_BUDGET;
        loop {
            {
                let mut queue = self.inner.lock().expect("queue lock");
                if queue.len() < self.capacity {
                    queue.push_back(event);
                    drop(queue);
                    self.readable.notify_one();
                    return;
                }
                if let Some(idx) = queue.iter().position(|e| e.kind != EventKind::Chat) {
                    let _ = queue.remove(idx);
                    queue.push_back(event);
                    drop(queue);
                    let _ = metrics.relay_dropped.fetch_add(1, Ordering::Relaxed);
                    self.readable.notify_one();
                    return;
                }
                if event.kind != EventKind::Chat {
                    // Queue is all chat; the incoming non-chat event loses.
                    let _ = metrics.relay_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            // Incoming chat against a queue full of chat: wait for room.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = metrics.relay_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %event.event_id, "chat event dropped after block budget");
                return;
            }
            let _ = tokio::time::timeout(remaining, self.writable.notified()).await;
        }
    }

    /// Dequeue, waiting until an event is available.
    pub async fn pop(&self) -> ChatEvent {
        loop {
            if let Some(event) = self.inner.lock().expect("queue lock").pop_front() {
                self.writable.notify_one();
                return event;
            }
            self.readable.notified().await;
        }
    }

    /// Non-blocking dequeue.
    pub fn try_pop(&self) -> Option<ChatEvent> {
        let event = self.inner.lock().expect("queue lock").pop_front();
        if event.is_some() {
            self.writable.notify_one();
        }
        event
    }
}

// ---------------------------------------------------------------------------
// Reconnect bookkeeping
// ---------------------------------------------------------------------------

/// Counts reconnects inside the failure window.
struct ReconnectWindow {
    times: VecDeque<Instant>,
    max: usize,
    window: Duration,
}

impl ReconnectWindow {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            times: VecDeque::new(),
            max,
            window,
        }
    }

    /// Record one reconnect; false means the relay must park as failed.
    fn record(&mut self, now: Instant) -> bool {
        while self
            .times
            .front()
            .is_some_and(|&t| now.duration_since(t) > self.window)
        {
            let _ = self.times.pop_front();
        }
        self.times.push_back(now);
        self.times.len() < self.max
    }

    fn reset(&mut self) {
        self.times.clear();
    }
}

// ---------------------------------------------------------------------------
// Relay client
// ---------------------------------------------------------------------------

enum ConnectionEnd {
    Cancelled,
    Disconnected(String),
}

/// Websocket relay for one live room.
pub struct EventRelay {
    config: RelayConfig,
    room_id: String,
    provider: Arc<dyn CredentialProvider>,
    queue: Arc<EventQueue>,
    metrics: Arc<SessionMetrics>,
    status_tx: watch::Sender<RelayState>,
}

impl EventRelay {
    pub fn new(
        config: &RelayConfig,
        room_id: &str,
        provider: Arc<dyn CredentialProvider>,
        metrics: Arc<SessionMetrics>,
    ) -> (Self, watch::Receiver<RelayState>) {
        let (status_tx, status_rx) = watch::channel(RelayState::Connecting);
        let relay = Self {
            config: config.clone(),
            room_id: room_id.to_owned(),
            provider,
            queue: Arc::new(EventQueue::new(config.queue_capacity)),
            metrics,
            status_tx,
        };
        (relay, status_rx)
    }

    /// Shared handle to the outgoing event queue.
    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    /// Run the connect/reconnect loop until cancelled or failed.
    ///
    /// # Errors
    ///
    /// Returns a relay error after `max_reconnects` reconnects inside the
    /// failure window.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut deduper = EventDeduper::new(self.config.dedup_window_sec);
        let mut failures = ReconnectWindow::new(
            self.config.max_reconnects,
            Duration::from_secs_f64(self.config.failure_window_sec),
        );
        let mut backoff = Duration::from_secs_f64(self.config.backoff_initial_sec);
        let backoff_cap = Duration::from_secs_f64(self.config.backoff_cap_sec);
        let mut first_attempt = true;

        loop {
            if cancel.is_cancelled() {
                let _ = self.status_tx.send(RelayState::Stopped);
                return Ok(());
            }
            let _ = self.status_tx.send(if first_attempt {
                RelayState::Connecting
            } else {
                RelayState::Reconnecting
            });
            first_attempt = false;

            let connected_at = Instant::now();
            let end = self.connect_once(&mut deduper, &cancel).await;
            match end {
                Ok(ConnectionEnd::Cancelled) => {
                    let _ = self.status_tx.send(RelayState::Stopped);
                    return Ok(());
                }
                Ok(ConnectionEnd::Disconnected(reason)) => {
                    warn!(room_id = %self.room_id, "relay disconnected: {reason}");
                }
                Err(e) => {
                    warn!(room_id = %self.room_id, "relay connect failed: {e}");
                }
            }

            if connected_at.elapsed() >= STABLE_CONNECTION {
                backoff = Duration::from_secs_f64(self.config.backoff_initial_sec);
                failures.reset();
            }
            if !failures.record(Instant::now()) {
                let _ = self.status_tx.send(RelayState::Failed);
                return Err(LiveError::Relay(format!(
                    "{} reconnects within {:.0}s, giving up",
                    self.config.max_reconnects, self.config.failure_window_sec
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = self.status_tx.send(RelayState::Stopped);
                    return Ok(());
                }
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(backoff_cap);
        }
    }

    async fn connect_once(
        &self,
        deduper: &mut EventDeduper,
        cancel: &CancellationToken,
    ) -> Result<ConnectionEnd> {
        let creds = self
            .provider
            .acquire_room_credentials(&self.room_id)
            .await?;
        let request = build_request(&creds, &self.room_id)?;
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| LiveError::Relay(format!("connect failed: {e}")))?;
        info!(room_id = %self.room_id, "relay connected");
        let _ = self.status_tx.send(RelayState::Running);

        let (mut sink, mut stream) = ws.split();
        let mut ping = tokio::time::interval(Duration::from_secs_f64(
            self.config.ping_interval_sec,
        ));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut seq_id: u64 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(ConnectionEnd::Cancelled);
                }
                _ = ping.tick() => {
                    seq_id += 1;
                    if let Err(e) = sink.send(WsMessage::Binary(wire::encode_heartbeat(seq_id).into())).await {
                        return Ok(ConnectionEnd::Disconnected(format!("ping failed: {e}")));
                    }
                }
                incoming = stream.next() => match incoming {
                    None => return Ok(ConnectionEnd::Disconnected("stream closed".to_owned())),
                    Some(Err(e)) => return Ok(ConnectionEnd::Disconnected(e.to_string())),
                    Some(Ok(WsMessage::Binary(buf))) => {
                        // A decode failure tears the connection down; the
                        // reconnect path rebuilds parser state from scratch.
                        self.handle_frame(&buf, &mut sink, deduper).await?;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sink.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        return Ok(ConnectionEnd::Disconnected("server closed".to_owned()));
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    async fn handle_frame<S>(
        &self,
        buf: &[u8],
        sink: &mut S,
        deduper: &mut EventDeduper,
    ) -> Result<()>
    where
        S: SinkExt<WsMessage> + Unpin,
        S::Error: std::fmt::Display,
    {
        let frame = wire::decode_push_frame(buf)?;
        if frame.payload_type != "msg" {
            return Ok(());
        }
        let response = wire::decode_response(&frame)?;
        if response.need_ack {
            let ack = wire::encode_ack(frame.log_id, &response.internal_ext);
            sink.send(WsMessage::Binary(ack.into()))
                .await
                .map_err(|e| LiveError::Relay(format!("ack send failed: {e}")))?;
        }
        let now = now_ts();
        for message in &response.messages {
            let Some(event) = wire::normalize_message(message, &self.room_id, now)? else {
                continue;
            };
            if !deduper.insert(&event.event_id, now) {
                continue;
            }
            self.queue.push(event, &self.metrics).await;
        }
        Ok(())
    }
}

/// Compose the signed websocket request: query parameters plus cookies.
fn build_request(
    creds: &RoomCredentials,
    room_id: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut url = url::Url::parse(&creds.endpoint)
        .map_err(|e| LiveError::Relay(format!("bad relay endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("room_id", room_id)
        .append_pair("signature", &creds.signature)
        .append_pair("a_bogus", &creds.a_bogus)
        .finish();

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| LiveError::Relay(format!("bad relay request: {e}")))?;
    let mut cookie = format!("ttwid={}", creds.ttwid);
    if !creds.cookies.is_empty() {
        cookie.push_str("; ");
        cookie.push_str(&creds.cookies);
    }
    let _ = request.headers_mut().insert(
        "Cookie",
        cookie
            .parse()
            .map_err(|_| LiveError::Relay("cookie contains invalid bytes".to_owned()))?,
    );
    Ok(request)
}
