//! Protocol state of one shard, independent of any socket or timer.
//!
//! The runner feeds frames in and acts on the returned [`Directive`]s; every
//! decision about sequence, session and ack bookkeeping lives here so it can
//! be exercised without a transport.

use crate::codec::{self, Compression, Encoding, Inflater};
use crate::error::Error;
use crate::heartbeat::{Beat, HeartbeatMonitor};
use crate::protocol::{GatewayEvent, OpCode, Payload, ResumeBody, READY_EVENT};
use rand::Rng;
use serde_json::Value;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

/// Bounds of the randomized wait before re-identifying after INVALID_SESSION
pub const INVALID_SESSION_DELAY_MS: (u64, u64) = (1_000, 5_000);

/// Action the runner must take after a payload was handled
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Nothing,
    /// Named dispatch to publish
    Dispatch { event: String, data: Value },
    /// Send a heartbeat immediately
    Heartbeat,
    /// Server asked for a reconnect; the session stays resumable
    Reconnect,
    /// Identify (or resume) again after the delay
    RetryIdentify(Duration),
    /// Start heartbeating at this interval, then identify or resume
    Hello(Duration),
    /// Heartbeat acknowledged, with latency if one was in flight
    Ack(Option<Duration>),
}

#[derive(Debug)]
pub struct ShardState {
    id: u32,
    encoding: Encoding,
    compression: Compression,
    sequence: u64,
    session_id: Option<String>,
    inflater: Inflater,
    heartbeat: HeartbeatMonitor,
}

impl ShardState {
    pub fn new(id: u32, encoding: Encoding, compression: Compression) -> Self {
        Self {
            id,
            encoding: encoding.resolve(),
            compression,
            sequence: 0,
            session_id: None,
            inflater: Inflater::new(),
            heartbeat: HeartbeatMonitor::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// New socket: fresh inflate context and heartbeat state.
    /// Sequence and session survive so the connection can resume.
    pub fn begin_connection(&mut self) {
        self.inflater = Inflater::new();
        self.heartbeat.reset();
    }

    /// Forget the session; the next handshake is a full identify.
    pub fn discard_session(&mut self) {
        if self.session_id.take().is_some() {
            debug!("[SHARD-{}] Session discarded", self.id);
        }
        self.sequence = 0;
    }

    /// Turn a socket message into a payload.
    ///
    /// Returns `None` for control frames and for partial compressed chunks.
    pub fn receive(&mut self, message: &Message) -> Result<Option<Payload>, Error> {
        match message {
            Message::Text(text) => codec::decode(text.as_bytes(), Encoding::Json).map(Some),
            Message::Binary(bytes) => match self.compression {
                Compression::None => codec::decode(bytes, self.encoding).map(Some),
                Compression::ZlibStream => match self.inflater.push(bytes)? {
                    Some(body) => codec::decode(&body, self.encoding).map(Some),
                    None => {
                        trace!(
                            "[SHARD-{}] Partial frame ({} bytes buffered)",
                            self.id,
                            self.inflater.pending()
                        );
                        Ok(None)
                    }
                },
            },
            _ => Ok(None),
        }
    }

    /// Apply a decoded payload to the state.
    pub fn handle(&mut self, payload: Payload) -> Result<Directive, Error> {
        let directive = match GatewayEvent::from_payload(payload)? {
            GatewayEvent::Dispatch {
                sequence,
                event,
                data,
            } => {
                if let Some(s) = sequence {
                    if s > self.sequence {
                        self.sequence = s;
                    }
                }

                if event.as_deref() == Some(READY_EVENT) {
                    match data.get("session_id").and_then(Value::as_str) {
                        Some(id) => {
                            debug!("[SHARD-{}] Session {} established", self.id, id);
                            self.session_id = Some(id.to_string());
                        }
                        None => warn!("[SHARD-{}] READY without session_id", self.id),
                    }
                }

                match event {
                    Some(event) => Directive::Dispatch { event, data },
                    None => Directive::Nothing,
                }
            }
            GatewayEvent::HeartbeatRequest => Directive::Heartbeat,
            GatewayEvent::Reconnect => Directive::Reconnect,
            GatewayEvent::InvalidSession { resumable } => {
                if !resumable {
                    self.discard_session();
                }
                let (lo, hi) = INVALID_SESSION_DELAY_MS;
                let delay = Duration::from_millis(rand::thread_rng().gen_range(lo..=hi));
                debug!(
                    "[SHARD-{}] Invalid session (resumable={}), retrying in {:?}",
                    self.id, resumable, delay
                );
                Directive::RetryIdentify(delay)
            }
            GatewayEvent::Hello { heartbeat_interval } => {
                self.heartbeat.set_interval(heartbeat_interval);
                Directive::Hello(heartbeat_interval)
            }
            GatewayEvent::HeartbeatAck => Directive::Ack(self.heartbeat.record_ack()),
            GatewayEvent::Unrecognized { op, .. } => {
                warn!("[SHARD-{}] Ignoring payload with unrecognized op {}", self.id, op);
                Directive::Nothing
            }
        };
        Ok(directive)
    }

    /// Decide what an interval tick does.
    pub fn tick(&self) -> Beat {
        self.heartbeat.tick()
    }

    pub fn record_heartbeat_sent(&mut self) {
        self.heartbeat.record_sent();
    }

    /// Heartbeat carrying the last seen sequence, `null` before any dispatch.
    pub fn heartbeat_payload(&self) -> Payload {
        let d = if self.sequence == 0 {
            Value::Null
        } else {
            Value::from(self.sequence)
        };
        Payload::new(OpCode::Heartbeat, d)
    }

    /// Resume payload for the held session.
    pub fn resume_payload(&self, token: &str) -> Result<Payload, Error> {
        let session_id = self.session_id.as_deref().ok_or(Error::NoSession)?;
        let body = ResumeBody {
            token,
            session_id,
            seq: self.sequence,
        };
        Ok(Payload::new(OpCode::Resume, serde_json::to_value(body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RESUMED_EVENT;
    use serde_json::json;

    fn state() -> ShardState {
        ShardState::new(0, Encoding::Json, Compression::None)
    }

    fn dispatch(s: u64, t: &str, d: Value) -> Payload {
        Payload {
            op: OpCode::Dispatch.as_u64(),
            d,
            s: Some(s),
            t: Some(t.to_string()),
        }
    }

    #[test]
    fn test_sequence_only_increases() {
        let mut state = state();
        for s in [5, 3, 9, 7] {
            state.handle(dispatch(s, "MESSAGE_CREATE", json!({}))).unwrap();
        }
        assert_eq!(state.sequence(), 9);
    }

    #[test]
    fn test_ready_captures_session() {
        let mut state = state();
        let directive = state
            .handle(dispatch(1, READY_EVENT, json!({"session_id": "abc"})))
            .unwrap();

        assert_eq!(state.session_id(), Some("abc"));
        assert!(matches!(directive, Directive::Dispatch { ref event, .. } if event == READY_EVENT));

        let resumed = state.handle(dispatch(2, RESUMED_EVENT, json!(null))).unwrap();
        assert!(matches!(resumed, Directive::Dispatch { .. }));
        assert_eq!(state.session_id(), Some("abc"));
    }

    #[test]
    fn test_resume_without_session_fails() {
        let state = state();
        assert!(matches!(state.resume_payload("t"), Err(Error::NoSession)));
    }

    #[test]
    fn test_resume_carries_sequence() {
        let mut state = state();
        state
            .handle(dispatch(12, READY_EVENT, json!({"session_id": "xyz"})))
            .unwrap();

        let payload = state.resume_payload("tok").unwrap();
        assert_eq!(payload.op, OpCode::Resume.as_u64());
        assert_eq!(payload.d, json!({"token": "tok", "session_id": "xyz", "seq": 12}));
    }

    #[test]
    fn test_invalid_session_not_resumable_discards() {
        let mut state = state();
        state
            .handle(dispatch(4, READY_EVENT, json!({"session_id": "abc"})))
            .unwrap();

        let directive = state
            .handle(Payload::new(OpCode::InvalidSession, json!(false)))
            .unwrap();

        assert_eq!(state.session_id(), None);
        assert_eq!(state.sequence(), 0);
        let Directive::RetryIdentify(delay) = directive else {
            panic!("expected retry, got {:?}", directive);
        };
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_session_resumable_keeps_session() {
        let mut state = state();
        state
            .handle(dispatch(4, READY_EVENT, json!({"session_id": "abc"})))
            .unwrap();
        state
            .handle(Payload::new(OpCode::InvalidSession, json!(true)))
            .unwrap();
        assert_eq!(state.session_id(), Some("abc"));
    }

    #[test]
    fn test_begin_connection_keeps_session() {
        let mut state = state();
        state
            .handle(dispatch(8, READY_EVENT, json!({"session_id": "abc"})))
            .unwrap();
        state.record_heartbeat_sent();

        state.begin_connection();

        assert_eq!(state.session_id(), Some("abc"));
        assert_eq!(state.sequence(), 8);
        assert_eq!(state.tick(), Beat::Send);
    }

    #[test]
    fn test_hello_and_ack() {
        let mut state = state();
        let directive = state
            .handle(Payload::new(OpCode::Hello, json!({"heartbeat_interval": 1000})))
            .unwrap();
        assert_eq!(directive, Directive::Hello(Duration::from_secs(1)));

        state.record_heartbeat_sent();
        assert_eq!(state.tick(), Beat::Zombie);
        let ack = state
            .handle(Payload::new(OpCode::HeartbeatAck, Value::Null))
            .unwrap();
        assert!(matches!(ack, Directive::Ack(Some(_))));
        assert_eq!(state.tick(), Beat::Send);
    }

    #[test]
    fn test_heartbeat_payload_sequence() {
        let mut state = state();
        assert_eq!(state.heartbeat_payload().d, Value::Null);
        state.handle(dispatch(3, "X", json!({}))).unwrap();
        assert_eq!(state.heartbeat_payload().d, json!(3));
    }

    #[test]
    fn test_receive_text_and_control_frames() {
        let mut state = state();
        let payload = state
            .receive(&Message::Text(r#"{"op":11,"d":null}"#.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(payload.opcode(), Some(OpCode::HeartbeatAck));
        assert!(state.receive(&Message::Ping(vec![1])).unwrap().is_none());
    }

    #[test]
    fn test_receive_compressed_stream() {
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let mut state = ShardState::new(0, Encoding::Json, Compression::ZlibStream);
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(br#"{"op":10,"d":{"heartbeat_interval":45000}}"#).unwrap();
        encoder.flush().unwrap();
        let frame = std::mem::take(encoder.get_mut());

        let (head, tail) = frame.split_at(frame.len() / 2);
        assert!(state.receive(&Message::Binary(head.to_vec())).unwrap().is_none());
        let payload = state.receive(&Message::Binary(tail.to_vec())).unwrap().unwrap();
        assert_eq!(payload.opcode(), Some(OpCode::Hello));
    }
}
