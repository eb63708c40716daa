//! Public handle to one shard and the events it publishes.
//!
//! A [`Shard`] is a cheap, cloneable front for the task that owns the
//! socket (see `connection.rs`). Every operation is a command sent to that
//! task, so all state of one shard is mutated from exactly one place.

use crate::codec::{self, Encoding};
use crate::config::ClusterConfig;
use crate::connection::ShardRunner;
use crate::error::{Error, ErrorKind};
use crate::gateway::{Gateway, ShardLink};
use crate::metrics::Metrics;
use crate::protocol::{OpCode, Payload};
use crate::transport::Connector;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

const COMMAND_BUFFER: usize = 64;

pub(crate) type Reply = oneshot::Sender<Result<(), Error>>;

/// Requests handled by the shard's runner.
///
/// `generation` pins a request to one connection: a request issued for an
/// earlier socket is rejected instead of leaking onto its replacement.
#[derive(Debug)]
pub(crate) enum ShardCommand {
    Connect,
    Disconnect {
        code: Option<u16>,
        reply: Reply,
    },
    Reconnect {
        code: Option<u16>,
    },
    Send {
        message: Outbound,
        generation: Option<u64>,
        reply: Reply,
    },
    Resume {
        generation: Option<u64>,
        reply: Reply,
    },
    Heartbeat {
        reply: Reply,
    },
}

/// Anything a caller can send on a shard.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-encoded frame; skips encoding but not the send budget
    Raw(Message),
    Payload(Payload),
}

impl Outbound {
    pub(crate) fn into_message(self, encoding: Encoding) -> Result<(Message, Option<Payload>), Error> {
        match self {
            Outbound::Raw(message) => Ok((message, None)),
            Outbound::Payload(payload) => {
                let message = codec::encode(&payload, encoding)?;
                Ok((message, Some(payload)))
            }
        }
    }
}

impl From<Payload> for Outbound {
    fn from(payload: Payload) -> Self {
        Outbound::Payload(payload)
    }
}

impl From<(OpCode, Value)> for Outbound {
    fn from(pair: (OpCode, Value)) -> Self {
        Outbound::Payload(pair.into())
    }
}

impl From<Message> for Outbound {
    fn from(message: Message) -> Self {
        Outbound::Raw(message)
    }
}

/// Lifecycle and traffic events of one shard
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// A connection attempt started
    Connect,
    /// The socket is open
    Open,
    /// A complete payload arrived
    Receive(Payload),
    /// A frame was written; `None` for raw frames
    Send(Option<Payload>),
    /// A named dispatch
    Dispatch { event: String, data: Value },
    /// The server closed the socket
    Close { code: Option<u16>, reason: String },
    /// The socket was torn down locally
    Disconnect { code: Option<u16> },
    /// A reconnect is scheduled after `delay`
    Reconnect { delay: Duration },
    Error { kind: ErrorKind, message: String },
    /// Terminal: closed with a fatal code, no further reconnects
    Exit { code: u16, reason: String },
}

impl ShardEvent {
    /// Event name; dispatches use their protocol event name.
    pub fn name(&self) -> &str {
        match self {
            ShardEvent::Connect => "connect",
            ShardEvent::Open => "open",
            ShardEvent::Receive(_) => "receive",
            ShardEvent::Send(_) => "send",
            ShardEvent::Dispatch { event, .. } => event,
            ShardEvent::Close { .. } => "close",
            ShardEvent::Disconnect { .. } => "disconnect",
            ShardEvent::Reconnect { .. } => "reconnect",
            ShardEvent::Error { .. } => "error",
            ShardEvent::Exit { .. } => "exit",
        }
    }

    /// Event body as JSON, for relaying.
    pub fn data(&self) -> Value {
        match self {
            ShardEvent::Connect | ShardEvent::Open => Value::Null,
            ShardEvent::Receive(payload) | ShardEvent::Send(Some(payload)) => {
                serde_json::to_value(payload).unwrap_or(Value::Null)
            }
            ShardEvent::Send(None) => Value::Null,
            ShardEvent::Dispatch { data, .. } => data.clone(),
            ShardEvent::Close { code, reason } => json!({ "code": code, "reason": reason }),
            ShardEvent::Disconnect { code } => json!({ "code": code }),
            ShardEvent::Reconnect { delay } => json!({ "delay_ms": delay.as_millis() as u64 }),
            ShardEvent::Error { kind, message } => {
                json!({ "kind": kind.as_str(), "message": message })
            }
            ShardEvent::Exit { code, reason } => json!({ "code": code, "reason": reason }),
        }
    }

    /// True for the event after which the shard never reconnects on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShardEvent::Exit { .. })
    }
}

/// Connection state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStatus {
    #[default]
    Idle,
    Connecting,
    Open,
    Identifying,
    Resuming,
    Steady,
    Closing,
    /// Closed with a fatal code; stays here until an explicit connect
    DisconnectedFatal,
}

impl ShardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ShardStatus::Idle => "idle",
            ShardStatus::Connecting => "connecting",
            ShardStatus::Open => "open",
            ShardStatus::Identifying => "identifying",
            ShardStatus::Resuming => "resuming",
            ShardStatus::Steady => "steady",
            ShardStatus::Closing => "closing",
            ShardStatus::DisconnectedFatal => "disconnected-fatal",
        }
    }

    /// A socket is up (or being handshaken on).
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ShardStatus::Open | ShardStatus::Identifying | ShardStatus::Resuming | ShardStatus::Steady
        )
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of a shard, updated by its runner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardSnapshot {
    pub status: ShardStatus,
    pub sequence: u64,
    pub session_id: Option<String>,
    /// Last heartbeat round-trip
    pub latency: Option<Duration>,
    /// Number of sockets opened so far; identifies the current one
    pub connection: u64,
}

/// Handle to a running shard.
#[derive(Debug, Clone)]
pub struct Shard {
    id: u32,
    gateway: Arc<Gateway>,
    commands: mpsc::Sender<ShardCommand>,
    events: broadcast::Sender<ShardEvent>,
    snapshot: watch::Receiver<ShardSnapshot>,
}

impl Shard {
    /// Start the runner task for shard `id`. The shard stays idle until
    /// [`connect`](Self::connect); the task ends once every handle is dropped.
    pub fn spawn<C: Connector>(
        id: u32,
        gateway: Arc<Gateway>,
        connector: Arc<C>,
        config: ClusterConfig,
        metrics: Arc<Metrics>,
    ) -> Shard {
        let (shard, runner) = Self::build(id, gateway, connector, config, metrics);
        tokio::spawn(runner.supervised());
        shard
    }

    /// Handle and runner, unstarted, so callers can subscribe first.
    pub(crate) fn build<C: Connector>(
        id: u32,
        gateway: Arc<Gateway>,
        connector: Arc<C>,
        config: ClusterConfig,
        metrics: Arc<Metrics>,
    ) -> (Shard, ShardRunner<C>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(config.connection.event_buffer);
        let (snapshot_tx, snapshot_rx) = watch::channel(ShardSnapshot::default());

        let runner = ShardRunner::new(
            id,
            gateway.clone(),
            connector,
            config,
            metrics,
            command_rx,
            command_tx.downgrade(),
            events.clone(),
            snapshot_tx,
        );

        let shard = Shard {
            id,
            gateway,
            commands: command_tx,
            events,
            snapshot: snapshot_rx,
        };
        (shard, runner)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch the snapshot for changes
    pub fn watch(&self) -> watch::Receiver<ShardSnapshot> {
        self.snapshot.clone()
    }

    /// Open a connection. No-op while connecting or connected.
    pub async fn connect(&self) -> Result<(), Error> {
        self.command(ShardCommand::Connect).await
    }

    /// Close the socket with `code` (1000 when absent) and forget the
    /// session. Returns once the socket is gone.
    pub async fn disconnect(&self, code: Option<u16>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.command(ShardCommand::Disconnect { code, reply }).await?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Drop the socket, wait out the backoff, connect again. The session is
    /// kept so the new connection resumes.
    pub async fn reconnect(&self, code: Option<u16>) -> Result<(), Error> {
        self.command(ShardCommand::Reconnect { code }).await
    }

    /// Send a resume for the held session.
    ///
    /// Fails with [`Error::NoSession`] without sending anything when there is
    /// no session.
    pub async fn resume(&self) -> Result<(), Error> {
        self.link(None).resume().await
    }

    /// Send a heartbeat now, outside the interval.
    pub async fn heartbeat(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.command(ShardCommand::Heartbeat { reply }).await?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Identify through the gateway (resumes instead if a session is held).
    pub async fn identify(&self, extra: Option<Value>) -> Result<(), Error> {
        self.gateway.identify(&self.link(None), extra).await
    }

    /// Send a payload, `(op, data)` pair, or raw frame through the send budget.
    /// Returns once the frame is written.
    pub async fn send(&self, outbound: impl Into<Outbound>) -> Result<(), Error> {
        self.link(None).send_outbound(outbound.into()).await
    }

    fn link(&self, generation: Option<u64>) -> Link {
        Link {
            id: self.id,
            commands: self.commands.clone(),
            snapshot: self.snapshot.clone(),
            generation,
        }
    }

    async fn command(&self, command: ShardCommand) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ShuttingDown)
    }
}

/// Command-channel view of a shard used by identify.
pub(crate) struct Link {
    id: u32,
    commands: mpsc::Sender<ShardCommand>,
    snapshot: watch::Receiver<ShardSnapshot>,
    generation: Option<u64>,
}

impl Link {
    pub(crate) fn new(
        id: u32,
        commands: mpsc::Sender<ShardCommand>,
        snapshot: watch::Receiver<ShardSnapshot>,
        generation: Option<u64>,
    ) -> Self {
        Self {
            id,
            commands,
            snapshot,
            generation,
        }
    }

    async fn send_outbound(&self, message: Outbound) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        let command = ShardCommand::Send {
            message,
            generation: self.generation,
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }
}

impl ShardLink for Link {
    fn shard_id(&self) -> u32 {
        self.id
    }

    fn has_session(&self) -> bool {
        self.snapshot.borrow().session_id.is_some()
    }

    async fn resume(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        let command = ShardCommand::Resume {
            generation: self.generation,
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    async fn send_payload(&self, payload: Payload) -> Result<(), Error> {
        self.send_outbound(Outbound::Payload(payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_normalization() {
        let pair: Outbound = (OpCode::Heartbeat, json!(7)).into();
        let (message, payload) = pair.into_message(Encoding::Json).unwrap();
        assert_eq!(payload, Some(Payload::new(OpCode::Heartbeat, json!(7))));
        assert!(matches!(message, Message::Text(ref t) if t.contains("\"op\":1")));

        let raw: Outbound = Message::Text("{}".to_string()).into();
        let (message, payload) = raw.into_message(Encoding::Json).unwrap();
        assert_eq!(payload, None);
        assert_eq!(message, Message::Text("{}".to_string()));
    }

    #[test]
    fn test_event_names_and_data() {
        let dispatch = ShardEvent::Dispatch {
            event: "GUILD_CREATE".to_string(),
            data: json!({"id": "1"}),
        };
        assert_eq!(dispatch.name(), "GUILD_CREATE");
        assert_eq!(dispatch.data(), json!({"id": "1"}));

        let close = ShardEvent::Close {
            code: Some(4000),
            reason: "bye".to_string(),
        };
        assert_eq!(close.name(), "close");
        assert_eq!(close.data(), json!({"code": 4000, "reason": "bye"}));

        let error = ShardEvent::Error {
            kind: ErrorKind::Transport,
            message: "reset".to_string(),
        };
        assert_eq!(error.data()["kind"], "transport");
        assert!(ShardEvent::Exit { code: 4004, reason: String::new() }.is_terminal());
        assert!(!error.is_terminal());
    }

    #[test]
    fn test_status_connected() {
        assert!(ShardStatus::Steady.is_connected());
        assert!(ShardStatus::Identifying.is_connected());
        assert!(!ShardStatus::Connecting.is_connected());
        assert!(!ShardStatus::DisconnectedFatal.is_connected());
        assert_eq!(ShardStatus::DisconnectedFatal.to_string(), "disconnected-fatal");
    }

    #[tokio::test]
    async fn test_link_resume_round_trip() {
        let (commands, mut rx) = mpsc::channel(4);
        let (_snapshot_tx, snapshot) = watch::channel(ShardSnapshot::default());
        let link = Link::new(0, commands, snapshot, None);

        assert!(!link.has_session());

        let resume = tokio::spawn(async move { link.resume().await });
        let Some(ShardCommand::Resume { generation, reply }) = rx.recv().await else {
            panic!("expected resume command");
        };
        assert_eq!(generation, None);
        reply.send(Err(Error::NoSession)).unwrap();
        assert!(matches!(resume.await.unwrap(), Err(Error::NoSession)));
    }
}
