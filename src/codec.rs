//! Wire encoding and transport decompression.
//!
//! Inbound binary frames on a `zlib-stream` connection are fragments of one
//! long deflate stream. A logical message is complete only when the buffered
//! input ends with [`ZLIB_SUFFIX`], the marker the server's compressor emits
//! on every sync flush.

use crate::error::Error;
use crate::protocol::Payload;
use flate2::{Decompress, FlushDecompress, Status};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Trailing bytes of a zlib sync flush.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Payload serialization used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON text frames
    #[default]
    Json,
    /// CBOR binary frames (requires the `cbor` feature)
    Cbor,
}

impl Encoding {
    /// Value of the `encoding` query parameter
    pub fn query_value(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Cbor => "cbor",
        }
    }

    /// Downgrade to JSON when the binary codec is not compiled in.
    pub fn resolve(self) -> Encoding {
        match self {
            Encoding::Json => Encoding::Json,
            Encoding::Cbor if cfg!(feature = "cbor") => Encoding::Cbor,
            Encoding::Cbor => {
                warn!("CBOR support not compiled in, falling back to JSON encoding");
                Encoding::Json
            }
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "cbor" | "binary" => Ok(Encoding::Cbor),
            other => Err(format!("unknown encoding '{}'", other)),
        }
    }
}

/// Transport-level compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Frames carry plain payloads
    None,
    /// One zlib stream per connection, flushed per message
    #[default]
    ZlibStream,
}

impl Compression {
    /// Value of the `compress` query parameter, if one is sent
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::ZlibStream => Some("zlib-stream"),
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "zlib-stream" | "stream" => Ok(Compression::ZlibStream),
            other => Err(format!("unknown compression '{}'", other)),
        }
    }
}

/// Streaming inflate context for one connection.
///
/// Must be replaced on every new connection: the server starts a fresh
/// compressor each time.
pub struct Inflater {
    decompress: Decompress,
    pending: Vec<u8>,
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("pending", &self.pending.len())
            .field("total_in", &self.decompress.total_in())
            .field("total_out", &self.decompress.total_out())
            .finish()
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    /// Bytes buffered while waiting for the flush marker
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one frame. Returns the decompressed message once the cumulative
    /// input ends with the flush marker, `None` for a partial chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.pending.extend_from_slice(chunk);
        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let input = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(input.len() * 4 + 64);
        let mut offset = 0usize;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(256));
            }

            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(&input[offset..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::Encoding(format!("zlib: {}", e)))?;

            let consumed = (self.decompress.total_in() - in_before) as usize;
            let produced = self.decompress.total_out() - out_before;
            offset += consumed;

            if matches!(status, Status::StreamEnd) {
                break;
            }
            // Done once input is drained and nothing is left buffered.
            if offset >= input.len() && (out.len() < out.capacity() || produced == 0) {
                break;
            }
            if consumed == 0 && produced == 0 {
                return Err(Error::Encoding("zlib: stream stalled".into()));
            }
        }

        Ok(Some(out))
    }
}

/// Encode a payload into a WebSocket frame.
pub fn encode(payload: &Payload, encoding: Encoding) -> Result<Message, Error> {
    match encoding {
        Encoding::Json => Ok(Message::Text(serde_json::to_string(payload)?)),
        Encoding::Cbor => encode_binary(payload).map(Message::Binary),
    }
}

/// Decode a complete, already decompressed message body.
pub fn decode(bytes: &[u8], encoding: Encoding) -> Result<Payload, Error> {
    match encoding {
        Encoding::Json => Ok(serde_json::from_slice(bytes)?),
        Encoding::Cbor => decode_binary(bytes),
    }
}

#[cfg(feature = "cbor")]
fn encode_binary(payload: &Payload) -> Result<Vec<u8>, Error> {
    cbor::encode_payload(payload).map_err(|e| Error::Encoding(format!("cbor: {}", e)))
}

#[cfg(feature = "cbor")]
fn decode_binary(bytes: &[u8]) -> Result<Payload, Error> {
    cbor::decode_payload(bytes)
}

#[cfg(not(feature = "cbor"))]
fn encode_binary(_payload: &Payload) -> Result<Vec<u8>, Error> {
    Err(Error::Encoding("binary encoding not compiled in".into()))
}

#[cfg(not(feature = "cbor"))]
fn decode_binary(_bytes: &[u8]) -> Result<Payload, Error> {
    Err(Error::Encoding("binary encoding not compiled in".into()))
}

#[cfg(feature = "cbor")]
mod cbor {
    use super::Payload;
    use crate::error::Error;
    use minicbor::data::Type;
    use minicbor::{Decoder, Encoder};
    use serde_json::Value;
    use std::convert::Infallible;

    type EncodeError = minicbor::encode::Error<Infallible>;

    const MAX_DEPTH: usize = 64;

    pub(super) fn encode_payload(payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        let len = 2 + payload.s.is_some() as u64 + payload.t.is_some() as u64;
        enc.map(len)?;
        enc.str("op")?.u64(payload.op)?;
        enc.str("d")?;
        encode_value(&mut enc, &payload.d)?;
        if let Some(s) = payload.s {
            enc.str("s")?.u64(s)?;
        }
        if let Some(t) = &payload.t {
            enc.str("t")?.str(t)?;
        }
        Ok(buf)
    }

    pub(super) fn decode_payload(bytes: &[u8]) -> Result<Payload, Error> {
        let mut dec = Decoder::new(bytes);
        let len = dec
            .map()
            .map_err(invalid)?
            .ok_or_else(|| Error::Encoding("cbor: indefinite payload map".into()))?;

        let mut op = None;
        let mut d = Value::Null;
        let mut s = None;
        let mut t = None;

        for _ in 0..len {
            let key = dec.str().map_err(invalid)?;
            match key {
                "op" => op = Some(dec.u64().map_err(invalid)?),
                "d" => d = decode_value(&mut dec, 0)?,
                "s" => {
                    if dec.datatype().map_err(invalid)? == Type::Null {
                        dec.null().map_err(invalid)?;
                    } else {
                        s = Some(dec.u64().map_err(invalid)?);
                    }
                }
                "t" => {
                    if dec.datatype().map_err(invalid)? == Type::Null {
                        dec.null().map_err(invalid)?;
                    } else {
                        t = Some(dec.str().map_err(invalid)?.to_string());
                    }
                }
                _ => dec.skip().map_err(invalid)?,
            }
        }

        let op = op.ok_or_else(|| Error::Encoding("cbor: payload missing op".into()))?;
        Ok(Payload { op, d, s, t })
    }

    fn invalid(e: minicbor::decode::Error) -> Error {
        Error::Encoding(format!("cbor: {}", e))
    }

    fn encode_value(enc: &mut Encoder<&mut Vec<u8>>, value: &Value) -> Result<(), EncodeError> {
        match value {
            Value::Null => {
                enc.null()?;
            }
            Value::Bool(b) => {
                enc.bool(*b)?;
            }
            Value::Number(num) => {
                if let Some(n) = num.as_u64() {
                    enc.u64(n)?;
                } else if let Some(n) = num.as_i64() {
                    enc.i64(n)?;
                } else if let Some(n) = num.as_f64() {
                    enc.f64(n)?;
                }
            }
            Value::String(s) => {
                enc.str(s)?;
            }
            Value::Array(items) => {
                enc.array(items.len() as u64)?;
                for item in items {
                    encode_value(enc, item)?;
                }
            }
            Value::Object(map) => {
                enc.map(map.len() as u64)?;
                for (key, item) in map {
                    enc.str(key)?;
                    encode_value(enc, item)?;
                }
            }
        }
        Ok(())
    }

    fn decode_value(dec: &mut Decoder, depth: usize) -> Result<Value, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::Encoding("cbor: nesting too deep".into()));
        }
        match dec.datatype().map_err(invalid)? {
            Type::Null | Type::Undefined => {
                dec.skip().map_err(invalid)?;
                Ok(Value::Null)
            }
            Type::Bool => Ok(Value::Bool(dec.bool().map_err(invalid)?)),
            Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
                Ok(Value::Number(dec.u64().map_err(invalid)?.into()))
            }
            Type::I8 | Type::I16 | Type::I32 | Type::I64 => {
                Ok(Value::Number(dec.i64().map_err(invalid)?.into()))
            }
            Type::F16 | Type::F32 | Type::F64 => {
                let f = dec.f64().map_err(invalid)?;
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| Error::Encoding("cbor: non-finite float".into()))
            }
            Type::String => Ok(Value::String(dec.str().map_err(invalid)?.to_string())),
            Type::Array => {
                let len = dec
                    .array()
                    .map_err(invalid)?
                    .ok_or_else(|| Error::Encoding("cbor: indefinite array".into()))?;
                let mut items = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    items.push(decode_value(dec, depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            Type::Map => {
                let len = dec
                    .map()
                    .map_err(invalid)?
                    .ok_or_else(|| Error::Encoding("cbor: indefinite map".into()))?;
                let mut map = serde_json::Map::new();
                for _ in 0..len {
                    let key = dec.str().map_err(invalid)?.to_string();
                    map.insert(key, decode_value(dec, depth + 1)?);
                }
                Ok(Value::Object(map))
            }
            other => Err(Error::Encoding(format!("cbor: unsupported type {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;
    use flate2::write::ZlibEncoder;
    use serde_json::json;
    use std::io::Write;

    /// Compress each message and sync-flush, the way the server does.
    fn zlib_stream(messages: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        let mut frames = Vec::new();
        for msg in messages {
            encoder.write_all(msg).unwrap();
            encoder.flush().unwrap();
            frames.push(std::mem::take(encoder.get_mut()));
        }
        frames
    }

    fn sample_payloads() -> Vec<Payload> {
        vec![
            Payload::new(OpCode::Heartbeat, json!(42)),
            Payload::new(OpCode::Hello, json!({"heartbeat_interval": 41250})),
            Payload {
                op: OpCode::Dispatch.as_u64(),
                d: json!({"session_id": "abc", "guilds": [1, -2, 3.5, null, true]}),
                s: Some(7),
                t: Some("READY".into()),
            },
            Payload::new(OpCode::HeartbeatAck, serde_json::Value::Null),
        ]
    }

    #[test]
    fn test_flush_marker_ends_each_frame() {
        let frames = zlib_stream(&[b"{\"op\":11,\"d\":null}"]);
        assert!(frames[0].ends_with(&ZLIB_SUFFIX));
    }

    #[test]
    fn test_inflate_whole_frames() {
        let first = br#"{"op":10,"d":{"heartbeat_interval":1000}}"#;
        let second = br#"{"op":11,"d":null}"#;
        let frames = zlib_stream(&[first, second]);

        let mut inflater = Inflater::new();
        assert_eq!(inflater.push(&frames[0]).unwrap().as_deref(), Some(&first[..]));
        assert_eq!(inflater.push(&frames[1]).unwrap().as_deref(), Some(&second[..]));
    }

    #[test]
    fn test_inflate_split_frames_emit_once() {
        let body = br#"{"op":0,"s":1,"t":"MESSAGE_CREATE","d":{"content":"hello hello hello"}}"#;
        let frame = zlib_stream(&[body]).remove(0);

        for split in 1..frame.len() {
            let mut inflater = Inflater::new();
            let (head, tail) = frame.split_at(split);
            assert!(inflater.push(head).unwrap().is_none(), "split at {}", split);
            assert_eq!(inflater.push(tail).unwrap().as_deref(), Some(&body[..]));
            assert_eq!(inflater.pending(), 0);
        }
    }

    #[test]
    fn test_inflate_byte_at_a_time() {
        let body = br#"{"op":1,"d":null}"#;
        let frame = zlib_stream(&[body]).remove(0);

        let mut inflater = Inflater::new();
        let mut emitted = Vec::new();
        for byte in &frame {
            if let Some(out) = inflater.push(std::slice::from_ref(byte)).unwrap() {
                emitted.push(out);
            }
        }
        assert_eq!(emitted, vec![body.to_vec()]);
    }

    #[test]
    fn test_inflate_large_message_grows_buffer() {
        let body = serde_json::to_vec(&json!({"op": 0, "d": "x".repeat(64 * 1024)})).unwrap();
        let frame = zlib_stream(&[&body]).remove(0);

        let mut inflater = Inflater::new();
        assert_eq!(inflater.push(&frame).unwrap(), Some(body));
    }

    #[test]
    fn test_inflate_garbage_is_encoding_error() {
        let mut inflater = Inflater::new();
        let mut junk = vec![0x13, 0x37, 0x42, 0x42];
        junk.extend_from_slice(&ZLIB_SUFFIX);
        assert!(matches!(inflater.push(&junk), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_json_round_trip() {
        for payload in sample_payloads() {
            let msg = encode(&payload, Encoding::Json).unwrap();
            let Message::Text(text) = msg else {
                panic!("json encodes to text frames");
            };
            assert_eq!(decode(text.as_bytes(), Encoding::Json).unwrap(), payload);
        }
    }

    #[cfg(feature = "cbor")]
    #[test]
    fn test_cbor_round_trip() {
        for payload in sample_payloads() {
            let msg = encode(&payload, Encoding::Cbor).unwrap();
            let Message::Binary(bytes) = msg else {
                panic!("cbor encodes to binary frames");
            };
            assert_eq!(decode(&bytes, Encoding::Cbor).unwrap(), payload);
        }
    }

    #[cfg(not(feature = "cbor"))]
    #[test]
    fn test_cbor_falls_back_without_feature() {
        assert_eq!(Encoding::Cbor.resolve(), Encoding::Json);
        assert!(matches!(decode(&[0xa0], Encoding::Cbor), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_decode_garbage_json() {
        assert!(matches!(
            decode(b"{not json", Encoding::Json),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn test_query_values() {
        assert_eq!(Encoding::Json.query_value(), "json");
        assert_eq!(Compression::ZlibStream.query_value(), Some("zlib-stream"));
        assert_eq!(Compression::None.query_value(), None);
        assert_eq!("binary".parse::<Encoding>(), Ok(Encoding::Cbor));
        assert_eq!("stream".parse::<Compression>(), Ok(Compression::ZlibStream));
    }
}
