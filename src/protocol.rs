//! Gateway protocol vocabulary: op codes, close codes, payload frames.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Dispatch event that carries the new session id
pub const READY_EVENT: &str = "READY";
/// Dispatch event confirming a successful resume
pub const RESUMED_EVENT: &str = "RESUMED";

/// Close code sent by the client when a heartbeat went unacknowledged
pub const ZOMBIE_CLOSE_CODE: u16 = 4009;

/// Longest heartbeat interval honored from HELLO; larger values are capped.
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event
    Dispatch = 0,
    /// Heartbeat, sent by either side
    Heartbeat = 1,
    /// Start a new session
    Identify = 2,
    /// Update the client's presence
    PresenceUpdate = 3,
    /// Re-attach to an existing session
    Resume = 4,
    /// Server asks the client to reconnect
    Reconnect = 5,
    /// Session could not be started or resumed
    InvalidSession = 7,
    /// First payload after connecting, carries the heartbeat interval
    Hello = 10,
    /// Heartbeat acknowledged
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::Resume),
            5 => Some(Self::Reconnect),
            7 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Any wire value; values past `u8` are never known ops.
    pub fn from_u64(value: u64) -> Option<Self> {
        u8::try_from(value).ok().and_then(Self::from_u8)
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_u64(self) -> u64 {
        self as u64
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "DISPATCH",
            Self::Heartbeat => "HEARTBEAT",
            Self::Identify => "IDENTIFY",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::Resume => "RESUME",
            Self::Reconnect => "RECONNECT",
            Self::InvalidSession => "INVALID_SESSION",
            Self::Hello => "HELLO",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// Close codes the gateway may send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimeout = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl CloseCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimeout),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// No amount of reconnecting fixes these.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown error occurred",
            Self::UnknownOpcode => "Invalid opcode sent",
            Self::DecodeError => "Invalid payload encoding",
            Self::NotAuthenticated => "Payload sent before identifying",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::InvalidSequence => "Invalid sequence number for resume",
            Self::RateLimited => "Rate limited",
            Self::SessionTimeout => "Session timed out",
            Self::InvalidShard => "Invalid shard",
            Self::ShardingRequired => "Sharding required",
            Self::InvalidApiVersion => "Invalid API version",
            Self::InvalidIntents => "Invalid intents",
            Self::DisallowedIntents => "Disallowed intents",
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

/// What a shard does after the server closed its socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePolicy {
    pub reconnect: bool,
    pub keep_session: bool,
}

/// Map a server close code to the shard's reaction.
///
/// Fatal codes stop the shard. `4000` reconnects and resumes. Every other
/// code, including codes outside the gateway range, reconnects with a fresh
/// identify.
pub fn close_policy(code: u16) -> ClosePolicy {
    match CloseCode::from_u16(code) {
        Some(c) if c.is_fatal() => ClosePolicy {
            reconnect: false,
            keep_session: false,
        },
        Some(CloseCode::UnknownError) => ClosePolicy {
            reconnect: true,
            keep_session: true,
        },
        _ => ClosePolicy {
            reconnect: true,
            keep_session: false,
        },
    }
}

/// One wire frame: `{op, d, s?, t?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub op: u64,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Payload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.as_u64(),
            d,
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u64(self.op)
    }
}

impl From<(OpCode, Value)> for Payload {
    fn from((op, d): (OpCode, Value)) -> Self {
        Payload::new(op, d)
    }
}

/// Inbound payload classified by op code.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Dispatch {
        sequence: Option<u64>,
        event: Option<String>,
        data: Value,
    },
    /// Server wants a heartbeat right now
    HeartbeatRequest,
    Reconnect,
    InvalidSession {
        resumable: bool,
    },
    Hello {
        heartbeat_interval: Duration,
    },
    HeartbeatAck,
    /// Op code this client does not know, or a client-only op echoed back
    Unrecognized {
        op: u64,
        data: Value,
    },
}

impl GatewayEvent {
    pub fn from_payload(payload: Payload) -> Result<Self, Error> {
        let Some(op) = payload.opcode() else {
            return Ok(GatewayEvent::Unrecognized {
                op: payload.op,
                data: payload.d,
            });
        };

        Ok(match op {
            OpCode::Dispatch => GatewayEvent::Dispatch {
                sequence: payload.s,
                event: payload.t,
                data: payload.d,
            },
            OpCode::Heartbeat => GatewayEvent::HeartbeatRequest,
            OpCode::Reconnect => GatewayEvent::Reconnect,
            OpCode::InvalidSession => GatewayEvent::InvalidSession {
                resumable: is_truthy(&payload.d),
            },
            OpCode::Hello => {
                let hello: HelloBody = serde_json::from_value(payload.d)?;
                if hello.heartbeat_interval == 0 {
                    return Err(Error::Encoding("hello: heartbeat_interval must be positive".into()));
                }
                GatewayEvent::Hello {
                    heartbeat_interval: Duration::from_millis(
                        hello.heartbeat_interval.min(MAX_HEARTBEAT_INTERVAL_MS),
                    ),
                }
            }
            OpCode::HeartbeatAck => GatewayEvent::HeartbeatAck,
            OpCode::Identify | OpCode::PresenceUpdate | OpCode::Resume => {
                GatewayEvent::Unrecognized {
                    op: payload.op,
                    data: payload.d,
                }
            }
        })
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HelloBody {
    heartbeat_interval: u64,
}

/// Body of an op 4 resume
#[derive(Debug, Clone, Serialize)]
pub struct ResumeBody<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

/// Inputs for an op 2 identify body
#[derive(Debug, Clone)]
pub struct IdentifyParams<'a> {
    pub token: &'a str,
    pub shard_id: u32,
    pub shard_count: u32,
    pub client_name: &'a str,
    pub large_threshold: u32,
}

/// Build an identify body. Top-level keys of `extra` replace the defaults.
pub fn identify_body(params: &IdentifyParams<'_>, extra: Option<Value>) -> Value {
    let mut body = json!({
        "token": params.token,
        "properties": {
            "os": std::env::consts::OS,
            "browser": params.client_name,
            "device": params.client_name,
        },
        "compress": false,
        "large_threshold": params.large_threshold,
        "shard": [params.shard_id, params.shard_count],
        "presence": {},
    });

    if let (Value::Object(base), Some(Value::Object(overrides))) = (&mut body, extra) {
        merge(base, overrides);
    }
    body
}

fn merge(base: &mut Map<String, Value>, overrides: Map<String, Value>) {
    for (key, value) in overrides {
        base.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for raw in 0..=12u8 {
            if let Some(op) = OpCode::from_u8(raw) {
                assert_eq!(op.as_u8(), raw);
            }
        }
        assert_eq!(OpCode::from_u8(6), None);
        assert_eq!(OpCode::from_u8(10), Some(OpCode::Hello));
    }

    #[test]
    fn test_fatal_codes_never_reconnect() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            let policy = close_policy(code);
            assert!(!policy.reconnect, "code {}", code);
            assert!(!policy.keep_session, "code {}", code);
        }
    }

    #[test]
    fn test_unknown_error_keeps_session() {
        assert_eq!(
            close_policy(4000),
            ClosePolicy {
                reconnect: true,
                keep_session: true
            }
        );
    }

    #[test]
    fn test_other_codes_reconnect_fresh() {
        for code in [1000, 1001, 1006, 4001, 4007, 4009, 4999, 0] {
            let policy = close_policy(code);
            assert!(policy.reconnect, "code {}", code);
            assert!(!policy.keep_session, "code {}", code);
        }
    }

    #[test]
    fn test_payload_json_shape() {
        let hb = Payload::new(OpCode::Heartbeat, json!(3));
        assert_eq!(serde_json::to_string(&hb).unwrap(), r#"{"op":1,"d":3}"#);

        let parsed: Payload = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(parsed.d, Value::Null);
        assert_eq!(parsed.opcode(), Some(OpCode::HeartbeatAck));
    }

    #[test]
    fn test_event_classification() {
        let hello = Payload::new(OpCode::Hello, json!({"heartbeat_interval": 1000}));
        assert_eq!(
            GatewayEvent::from_payload(hello).unwrap(),
            GatewayEvent::Hello {
                heartbeat_interval: Duration::from_secs(1)
            }
        );

        let invalid = Payload::new(OpCode::InvalidSession, json!(false));
        assert_eq!(
            GatewayEvent::from_payload(invalid).unwrap(),
            GatewayEvent::InvalidSession { resumable: false }
        );

        let unknown = Payload {
            op: 42,
            d: json!("?"),
            s: None,
            t: None,
        };
        assert!(matches!(
            GatewayEvent::from_payload(unknown).unwrap(),
            GatewayEvent::Unrecognized { op: 42, .. }
        ));
    }

    #[test]
    fn test_hello_interval_bounds() {
        let zero = Payload::new(OpCode::Hello, json!({"heartbeat_interval": 0}));
        assert!(matches!(
            GatewayEvent::from_payload(zero),
            Err(Error::Encoding(_))
        ));

        let huge = Payload::new(OpCode::Hello, json!({"heartbeat_interval": u64::MAX}));
        assert_eq!(
            GatewayEvent::from_payload(huge).unwrap(),
            GatewayEvent::Hello {
                heartbeat_interval: Duration::from_millis(MAX_HEARTBEAT_INTERVAL_MS)
            }
        );
    }

    #[test]
    fn test_wide_op_is_unrecognized() {
        let parsed: Payload = serde_json::from_str(r#"{"op":300,"d":null}"#).unwrap();
        assert_eq!(parsed.opcode(), None);
        assert!(matches!(
            GatewayEvent::from_payload(parsed).unwrap(),
            GatewayEvent::Unrecognized { op: 300, .. }
        ));
    }

    #[test]
    fn test_hello_without_interval_is_encoding_error() {
        let hello = Payload::new(OpCode::Hello, json!({}));
        assert!(matches!(
            GatewayEvent::from_payload(hello),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn test_identify_body_overrides() {
        let params = IdentifyParams {
            token: "secret",
            shard_id: 2,
            shard_count: 8,
            client_name: "ws-gateway-cluster",
            large_threshold: 250,
        };
        let body = identify_body(
            &params,
            Some(json!({"large_threshold": 50, "intents": 513})),
        );

        assert_eq!(body["shard"], json!([2, 8]));
        assert_eq!(body["large_threshold"], json!(50));
        assert_eq!(body["intents"], json!(513));
        assert_eq!(body["token"], json!("secret"));
    }
}
