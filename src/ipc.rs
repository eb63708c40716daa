//! Messages between a process-sharded parent and its child clusters.
//!
//! One JSON object per line over the child's stdin/stdout. The first line a
//! forked child reads is always [`ParentMessage::Credential`], so the token
//! never shows up in argv.

use crate::cluster::{Cluster, ClusterEvent};
use crate::error::Error;
use crate::protocol::Payload;
use crate::transport::Connector;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

/// Longest accepted line; large dispatches (guild payloads) can be big
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Child to parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// A shard event relayed upward
    Event { shard: u32, event: String, data: Value },
}

impl From<&ClusterEvent> for ChildMessage {
    fn from(e: &ClusterEvent) -> Self {
        ChildMessage::Event {
            shard: e.shard_id,
            event: e.event.name().to_string(),
            data: e.event.data(),
        }
    }
}

/// Parent to child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Always first; carries what the child must not receive via argv
    Credential {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shard_count: Option<u32>,
    },
    /// Send `data` (a `{op, d}` payload) on the child's shard `shard`
    Send { shard: u32, data: Value },
}

pub type LineReader<R> = FramedRead<R, LinesCodec>;
pub type LineWriter<W> = FramedWrite<W, LinesCodec>;

pub fn reader<R: AsyncRead>(input: R) -> LineReader<R> {
    FramedRead::new(input, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

pub fn writer<W: AsyncWrite>(output: W) -> LineWriter<W> {
    FramedWrite::new(output, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

/// Next message, `None` at end of input. Blank lines are skipped.
pub async fn read_message<T, R>(reader: &mut LineReader<R>) -> Result<Option<T>, Error>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    while let Some(line) = reader.next().await {
        let line = line.map_err(|e| Error::Ipc(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| Error::Ipc(format!("malformed message: {}", e)));
    }
    Ok(None)
}

pub async fn write_message<T, W>(writer: &mut LineWriter<W>, message: &T) -> Result<(), Error>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(message)?;
    writer
        .send(line)
        .await
        .map_err(|e| Error::Ipc(e.to_string()))
}

/// How [`run_child`] relays
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Event names to relay; `None` relays everything
    pub events: Option<HashSet<String>>,
    /// Return when the input ends (the parent went away)
    pub stop_on_eof: bool,
}

/// Relay cluster events to `output` and apply send instructions from `input`.
///
/// Returns when every owned shard has exited fatally, or at end of input when
/// `stop_on_eof` is set.
pub async fn run_child<C, R, W>(
    cluster: Arc<Cluster<C>>,
    input: LineReader<R>,
    output: W,
    options: RelayOptions,
) -> Result<(), Error>
where
    C: Connector,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = Some(input);
    let mut output = writer(output);
    let mut events = cluster.subscribe();
    let mut exited = BTreeSet::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if event.event.is_terminal() {
                        exited.insert(event.shard_id);
                    }
                    let wanted = options
                        .events
                        .as_ref()
                        .map_or(true, |names| names.contains(event.event.name()));
                    if wanted {
                        write_message(&mut output, &ChildMessage::from(&event)).await?;
                    }
                    if !cluster.is_empty() && exited.len() >= cluster.len() {
                        info!("All {} shard(s) exited", exited.len());
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Relay lagged, {} event(s) dropped", skipped);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            message = next_input(&mut input) => match message {
                Ok(Some(ParentMessage::Send { shard, data })) => {
                    apply_send(&cluster, shard, data).await;
                }
                Ok(Some(ParentMessage::Credential { .. })) => {
                    debug!("Ignoring repeated credential");
                }
                Ok(None) => {
                    debug!("Input closed");
                    if options.stop_on_eof {
                        return Ok(());
                    }
                    input = None;
                }
                Err(e) => warn!("Dropping input line: {}", e),
            },
        }
    }
}

async fn next_input<R: AsyncRead + Unpin>(
    input: &mut Option<LineReader<R>>,
) -> Result<Option<ParentMessage>, Error> {
    match input {
        Some(reader) => read_message(reader).await,
        None => std::future::pending().await,
    }
}

async fn apply_send<C: Connector>(cluster: &Cluster<C>, shard: u32, data: Value) {
    let payload: Payload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("[SHARD-{}] Send instruction is not a payload: {}", shard, e);
            return;
        }
    };
    if let Err(e) = cluster.send(shard, payload).await {
        warn!("[SHARD-{}] Relayed send failed: {}", shard, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_shapes() {
        let event = ChildMessage::Event {
            shard: 3,
            event: "open".to_string(),
            data: Value::Null,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "event", "shard": 3, "event": "open", "data": null})
        );

        let send: ParentMessage =
            serde_json::from_str(r#"{"type":"send","shard":1,"data":{"op":1,"d":null}}"#).unwrap();
        assert_eq!(
            send,
            ParentMessage::Send {
                shard: 1,
                data: json!({"op": 1, "d": null})
            }
        );

        let credential = ParentMessage::Credential {
            token: "t".to_string(),
            shard_count: None,
        };
        assert_eq!(
            serde_json::to_string(&credential).unwrap(),
            r#"{"type":"credential","token":"t"}"#
        );
    }

    #[tokio::test]
    async fn test_read_write_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut out = writer(client_write);
        write_message(
            &mut out,
            &ParentMessage::Send {
                shard: 2,
                data: json!({"op": 1}),
            },
        )
        .await
        .unwrap();
        drop(out);

        let mut input = reader(server_read);
        let message: Option<ParentMessage> = read_message(&mut input).await.unwrap();
        assert!(matches!(message, Some(ParentMessage::Send { shard: 2, .. })));
    }

    #[tokio::test]
    async fn test_malformed_line_is_ipc_error() {
        let mut input = reader(&b"not json\n"[..]);
        let result: Result<Option<ParentMessage>, Error> = read_message(&mut input).await;
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[tokio::test]
    async fn test_end_of_input() {
        let mut input = reader(&b"\n\n"[..]);
        let result: Option<ParentMessage> = read_message(&mut input).await.unwrap();
        assert!(result.is_none());
    }
}
