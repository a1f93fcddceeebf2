//! Wire codec for the live-room push protocol.
//!
//! Frames are protobuf-encoded; this module walks the wire format directly
//! (varints and length-delimited fields) instead of generating types, since
//! only a dozen field numbers matter and the upstream schema shifts often.
//! The same helpers encode outgoing heartbeat and ack frames.
//!
//! Field numbers in one place:
//!
//! ```text
//! PushFrame      1 seq_id    2 log_id   6 payload_encoding  7 payload_type  8 payload
//! Response       1 messages  2 cursor   5 internal_ext      9 need_ack
//! Message        1 method    2 payload  3 msg_id
//! Common         1 method    2 msg_id   3 room_id           4 create_time(ms)
//! User           1 id        3 nickname
//! ChatMessage    1 common    2 user     3 content
//! GiftMessage    1 common    2 user     3 gift               4 count  5 total_price
//! Gift           1 id        2 name     3 diamond_count
//! LikeMessage    1 common    2 user     3 count
//! MemberMessage  1 common    2 user     3 member_count
//! SocialMessage  1 common    2 user
//! RoomUserSeq    1 common    2 total    3 total_user
//! ControlMessage 1 common    2 status
//! ```

use crate::error::{LiveError, Result};
use crate::pipeline::messages::{ChatEvent, EventKind};
use flate2::read::GzDecoder;
use std::io::Read;

// ---------------------------------------------------------------------------
// Wire-format primitives
// ---------------------------------------------------------------------------

/// A decoded field value.
pub enum WireValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
    Fixed64(u64),
}

/// Zero-copy reader over one protobuf message.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| LiveError::Relay("truncated varint".to_owned()))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(LiveError::Relay("varint overflow".to_owned()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Next (field_number, value) pair, or `None` at end of buffer.
    pub fn field(&mut self) -> Option<Result<(u32, WireValue<'a>)>> {
        if self.pos >= self.buf.len() {
            return None;
        }
        Some(self.read_field())
    }

    fn read_field(&mut self) -> Result<(u32, WireValue<'a>)> {
        let key = self.varint()?;
        let field = (key >> 3) as u32;
        let value = match key & 0x7 {
            0 => WireValue::Varint(self.varint()?),
            1 => {
                let bytes = self.take(8)?;
                WireValue::Fixed64(u64::from_le_bytes(
                    bytes.try_into().expect("8-byte slice"),
                ))
            }
            2 => {
                let len = self.varint()? as usize;
                WireValue::Bytes(self.take(len)?)
            }
            5 => {
                let bytes = self.take(4)?;
                WireValue::Fixed32(u32::from_le_bytes(
                    bytes.try_into().expect("4-byte slice"),
                ))
            }
            wt => return Err(LiveError::Relay(format!("unsupported wire type {wt}"))),
        };
        Ok((field, value))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| LiveError::Relay("truncated field".to_owned()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Minimal writer for outgoing frames and test fixtures.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn varint_field(&mut self, field: u32, value: u64) -> &mut Self {
        self.key(field, 0);
        self.raw_varint(value);
        self
    }

    pub fn bytes_field(&mut self, field: u32, value: &[u8]) -> &mut Self {
        self.key(field, 2);
        self.raw_varint(value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn str_field(&mut self, field: u32, value: &str) -> &mut Self {
        self.bytes_field(field, value.as_bytes())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        self.raw_varint((u64::from(field) << 3) | u64::from(wire_type));
    }

    fn raw_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }
}

// ---------------------------------------------------------------------------
// Frame shapes
// ---------------------------------------------------------------------------

/// Outer frame on the socket, both directions.
#[derive(Debug, Default, Clone)]
pub struct PushFrame {
    pub seq_id: u64,
    pub log_id: u64,
    pub payload_encoding: String,
    pub payload_type: String,
    pub payload: Vec<u8>,
}

/// Inner response carried by `payload_type == "msg"` frames.
#[derive(Debug, Default)]
pub struct Response {
    pub messages: Vec<Message>,
    pub cursor: String,
    pub internal_ext: String,
    pub need_ack: bool,
}

/// One push message inside a response.
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub method: String,
    pub payload: Vec<u8>,
    pub msg_id: u64,
}

pub fn decode_push_frame(buf: &[u8]) -> Result<PushFrame> {
    let mut frame = PushFrame::default();
    let mut reader = WireReader::new(buf);
    while let Some(field) = reader.field() {
        match field? {
            (1, WireValue::Varint(v)) => frame.seq_id = v,
            (2, WireValue::Varint(v)) => frame.log_id = v,
            (6, WireValue::Bytes(b)) => frame.payload_encoding = utf8(b)?,
            (7, WireValue::Bytes(b)) => frame.payload_type = utf8(b)?,
            (8, WireValue::Bytes(b)) => frame.payload = b.to_vec(),
            _ => {}
        }
    }
    Ok(frame)
}

/// Decode the response payload, inflating gzip when the frame says so.
pub fn decode_response(frame: &PushFrame) -> Result<Response> {
    let inflated;
    let payload: &[u8] = if frame.payload_encoding == "gzip" {
        let mut decoder = GzDecoder::new(frame.payload.as_slice());
        let mut out = Vec::new();
        let _ = decoder
            .read_to_end(&mut out)
            .map_err(|e| LiveError::Relay(format!("gzip inflate failed: {e}")))?;
        inflated = out;
        &inflated
    } else {
        &frame.payload
    };

    let mut response = Response::default();
    let mut reader = WireReader::new(payload);
    while let Some(field) = reader.field() {
        match field? {
            (1, WireValue::Bytes(b)) => response.messages.push(decode_message(b)?),
            (2, WireValue::Bytes(b)) => response.cursor = utf8(b)?,
            (5, WireValue::Bytes(b)) => response.internal_ext = utf8(b)?,
            (9, WireValue::Varint(v)) => response.need_ack = v != 0,
            _ => {}
        }
    }
    Ok(response)
}

fn decode_message(buf: &[u8]) -> Result<Message> {
    let mut message = Message::default();
    let mut reader = WireReader::new(buf);
    while let Some(field) = reader.field() {
        match field? {
            (1, WireValue::Bytes(b)) => message.method = utf8(b)?,
            (2, WireValue::Bytes(b)) => message.payload = b.to_vec(),
            (3, WireValue::Varint(v)) => message.msg_id = v,
            _ => {}
        }
    }
    Ok(message)
}

/// Heartbeat frame sent every ping interval.
pub fn encode_heartbeat(seq_id: u64) -> Vec<u8> {
    WireWriter::new()
        .varint_field(1, seq_id)
        .str_field(7, "hb")
        .finish()
}

/// Ack frame echoing the server's internal extension.
pub fn encode_ack(log_id: u64, internal_ext: &str) -> Vec<u8> {
    WireWriter::new()
        .varint_field(2, log_id)
        .str_field(7, "ack")
        .bytes_field(8, internal_ext.as_bytes())
        .finish()
}

// ---------------------------------------------------------------------------
// Message normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Common {
    msg_id: u64,
    room_id: u64,
    /// Milliseconds.
    create_time: u64,
}

#[derive(Debug, Default)]
struct User {
    id: u64,
    nickname: String,
}

fn decode_common(buf: &[u8]) -> Result<Common> {
    let mut common = Common::default();
    let mut reader = WireReader::new(buf);
    while let Some(field) = reader.field() {
        match field? {
            (2, WireValue::Varint(v)) => common.msg_id = v,
            (3, WireValue::Varint(v)) => common.room_id = v,
            (4, WireValue::Varint(v)) => common.create_time = v,
            _ => {}
        }
    }
    Ok(common)
}

fn decode_user(buf: &[u8]) -> Result<User> {
    let mut user = User::default();
    let mut reader = WireReader::new(buf);
    while let Some(field) = reader.field() {
        match field? {
            (1, WireValue::Varint(v)) => user.id = v,
            (3, WireValue::Bytes(b)) => user.nickname = utf8(b)?,
            _ => {}
        }
    }
    Ok(user)
}

/// Turn one push message into a [`ChatEvent`].
///
/// Unknown methods and chat messages with blank content return `None`.
pub fn normalize_message(
    message: &Message,
    fallback_room_id: &str,
    ingest_ts: f64,
) -> Result<Option<ChatEvent>> {
    let kind = match message.method.as_str() {
        "WebcastChatMessage" => EventKind::Chat,
        "WebcastGiftMessage" => EventKind::Gift,
        "WebcastLikeMessage" => EventKind::Like,
        "WebcastMemberMessage" => EventKind::MemberEnter,
        "WebcastSocialMessage" => EventKind::Follow,
        "WebcastRoomUserSeqMessage" => EventKind::RoomStats,
        "WebcastControlMessage" => EventKind::HostLiveStatus,
        _ => return Ok(None),
    };

    let mut common = Common::default();
    let mut user = User::default();
    let mut content = String::new();
    let mut payload = serde_json::Map::new();

    let mut reader = WireReader::new(&message.payload);
    while let Some(field) = reader.field() {
        let (number, value) = field?;
        match (kind, number, value) {
            (_, 1, WireValue::Bytes(b)) => common = decode_common(b)?,
            (_, 2, WireValue::Bytes(b))
                if matches!(
                    kind,
                    EventKind::Chat
                        | EventKind::Gift
                        | EventKind::Like
                        | EventKind::MemberEnter
                        | EventKind::Follow
                ) =>
            {
                user = decode_user(b)?;
            }
            (EventKind::Chat, 3, WireValue::Bytes(b)) => content = utf8(b)?,
            (EventKind::Gift, 3, WireValue::Bytes(b)) => {
                let mut gift_reader = WireReader::new(b);
                while let Some(gift_field) = gift_reader.field() {
                    match gift_field? {
                        (1, WireValue::Varint(v)) => {
                            let _ = payload.insert("gift_id".to_owned(), v.into());
                        }
                        (2, WireValue::Bytes(name)) => {
                            let _ = payload.insert("gift_name".to_owned(), utf8(name)?.into());
                        }
                        (3, WireValue::Varint(v)) => {
                            let _ = payload.insert("diamond_count".to_owned(), v.into());
                        }
                        _ => {}
                    }
                }
            }
            (EventKind::Gift, 4, WireValue::Varint(v)) => {
                let _ = payload.insert("count".to_owned(), v.into());
            }
            (EventKind::Gift, 5, WireValue::Varint(v)) => {
                // Price arrives in hundredths of the platform currency.
                let _ = payload.insert("total_price".to_owned(), (v as f64 / 100.0).into());
            }
            (EventKind::Like, 3, WireValue::Varint(v)) => {
                let _ = payload.insert("count".to_owned(), v.into());
            }
            (EventKind::MemberEnter, 3, WireValue::Varint(v)) => {
                let _ = payload.insert("member_count".to_owned(), v.into());
            }
            (EventKind::RoomStats, 2, WireValue::Varint(v)) => {
                let _ = payload.insert("online_total".to_owned(), v.into());
            }
            (EventKind::RoomStats, 3, WireValue::Varint(v)) => {
                let _ = payload.insert("total_user".to_owned(), v.into());
            }
            (EventKind::HostLiveStatus, 2, WireValue::Varint(v)) => {
                let _ = payload.insert("status".to_owned(), v.into());
            }
            _ => {}
        }
    }

    if kind == EventKind::Chat && content.trim().is_empty() {
        return Ok(None);
    }

    let event_id = if common.msg_id != 0 {
        common.msg_id.to_string()
    } else {
        message.msg_id.to_string()
    };
    let room_id = if common.room_id != 0 {
        common.room_id.to_string()
    } else {
        fallback_room_id.to_owned()
    };
    let server_ts = if common.create_time != 0 {
        common.create_time as f64 / 1000.0
    } else {
        ingest_ts
    };

    Ok(Some(ChatEvent {
        event_id,
        kind,
        user_id: if user.id == 0 { String::new() } else { user.id.to_string() },
        user_name: user.nickname,
        content: content.trim().to_owned(),
        payload,
        server_ts,
        ingest_ts,
        room_id,
    }))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| LiveError::Relay(format!("invalid UTF-8 in frame: {e}")))
}

// ---------------------------------------------------------------------------
// Test fixtures: encoders mirroring the decoders above
// ---------------------------------------------------------------------------

/// Encode a complete `msg` push frame for tests and local tooling.
pub fn encode_response_frame(
    log_id: u64,
    messages: &[(String, Vec<u8>)],
    need_ack: bool,
    internal_ext: &str,
    gzip: bool,
) -> Vec<u8> {
    let mut response = WireWriter::new();
    for (method, payload) in messages {
        let body = WireWriter::new()
            .str_field(1, method)
            .bytes_field(2, payload)
            .finish();
        let _ = response.bytes_field(1, &body);
    }
    if need_ack {
        let _ = response.varint_field(9, 1);
    }
    if !internal_ext.is_empty() {
        let _ = response.str_field(5, internal_ext);
    }
    let response = response.finish();

    let (payload, encoding) = if gzip {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&response).expect("gzip write");
        (encoder.finish().expect("gzip finish"), "gzip")
    } else {
        (response, "none")
    };

    let mut frame = WireWriter::new();
    let _ = frame
        .varint_field(2, log_id)
        .str_field(6, encoding)
        .str_field(7, "msg")
        .bytes_field(8, &payload);
    frame.finish()
}

/// Encode a chat message payload for tests.
pub fn encode_chat_payload(
    msg_id: u64,
    room_id: u64,
    create_time_ms: u64,
    user_id: u64,
    nickname: &str,
    content: &str,
) -> Vec<u8> {
    let common = WireWriter::new()
        .varint_field(2, msg_id)
        .varint_field(3, room_id)
        .varint_field(4, create_time_ms)
        .finish();
    let user = WireWriter::new()
        .varint_field(1, user_id)
        .str_field(3, nickname)
        .finish();
    WireWriter::new()
        .bytes_field(1, &common)
        .bytes_field(2, &user)
        .str_field(3, content)
        .finish()
}

/// Encode a gift message payload for tests.
pub fn encode_gift_payload(
    msg_id: u64,
    user_id: u64,
    nickname: &str,
    gift_name: &str,
    count: u64,
    total_price_cents: u64,
) -> Vec<u8> {
    let common = WireWriter::new().varint_field(2, msg_id).finish();
    let user = WireWriter::new()
        .varint_field(1, user_id)
        .str_field(3, nickname)
        .finish();
    let gift = WireWriter::new()
        .varint_field(1, 1001)
        .str_field(2, gift_name)
        .finish();
    WireWriter::new()
        .bytes_field(1, &common)
        .bytes_field(2, &user)
        .bytes_field(3, &gift)
        .varint_field(4, count)
        .varint_field(5, total_price_cents)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let buf = WireWriter::new().varint_field(1, value).finish();
            let mut reader = WireReader::new(&buf);
            match reader.field().unwrap().unwrap() {
                (1, WireValue::Varint(v)) => assert_eq!(v, value),
                _ => panic!("wrong field shape"),
            }
        }
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut buf = WireWriter::new().str_field(7, "msg").finish();
        let _ = buf.pop();
        let mut reader = WireReader::new(&buf);
        assert!(reader.field().unwrap().is_err());
    }

    #[test]
    fn chat_frame_round_trips_through_gzip() {
        let payload = encode_chat_payload(42, 777, 1_700_000_123_456, 9, "小蓝", "有蓝色吗？");
        let frame_bytes = encode_response_frame(
            7,
            &[("WebcastChatMessage".to_owned(), payload)],
            true,
            "ext-1",
            true,
        );

        let frame = decode_push_frame(&frame_bytes).unwrap();
        assert_eq!(frame.payload_type, "msg");
        assert_eq!(frame.payload_encoding, "gzip");
        assert_eq!(frame.log_id, 7);

        let response = decode_response(&frame).unwrap();
        assert!(response.need_ack);
        assert_eq!(response.internal_ext, "ext-1");
        assert_eq!(response.messages.len(), 1);

        let event = normalize_message(&response.messages[0], "fallback", 100.0)
            .unwrap()
            .expect("chat event");
        assert_eq!(event.kind, EventKind::Chat);
        assert_eq!(event.event_id, "42");
        assert_eq!(event.room_id, "777");
        assert_eq!(event.user_name, "小蓝");
        assert_eq!(event.content, "有蓝色吗？");
        assert!((event.server_ts - 1_700_000_123.456).abs() < 1e-3);
    }

    #[test]
    fn gift_payload_lands_in_event_payload() {
        let payload = encode_gift_payload(50, 3, "老粉", "小心心", 3, 880);
        let message = Message {
            method: "WebcastGiftMessage".to_owned(),
            payload,
            msg_id: 50,
        };
        let event = normalize_message(&message, "1", 10.0).unwrap().expect("gift");
        assert_eq!(event.kind, EventKind::Gift);
        assert_eq!(event.payload["gift_name"], "小心心");
        assert_eq!(event.payload["count"], 3);
        assert!((event.payload["total_price"].as_f64().unwrap() - 8.8).abs() < 1e-9);
    }

    #[test]
    fn blank_chat_content_is_dropped() {
        let payload = encode_chat_payload(1, 1, 0, 1, "u", "   ");
        let message = Message {
            method: "WebcastChatMessage".to_owned(),
            payload,
            msg_id: 1,
        };
        assert!(normalize_message(&message, "1", 0.0).unwrap().is_none());
    }

    #[test]
    fn unknown_method_is_ignored() {
        let message = Message {
            method: "WebcastFancyNewMessage".to_owned(),
            payload: vec![],
            msg_id: 1,
        };
        assert!(normalize_message(&message, "1", 0.0).unwrap().is_none());
    }

    #[test]
    fn heartbeat_and_ack_decode_as_frames() {
        let hb = decode_push_frame(&encode_heartbeat(3)).unwrap();
        assert_eq!(hb.payload_type, "hb");
        assert_eq!(hb.seq_id, 3);

        let ack = decode_push_frame(&encode_ack(99, "ext")).unwrap();
        assert_eq!(ack.payload_type, "ack");
        assert_eq!(ack.log_id, 99);
        assert_eq!(ack.payload, b"ext");
    }
}
