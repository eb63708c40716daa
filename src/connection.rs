use crate::config::{Backoff, ClusterConfig};
use crate::error::Error;
use crate::gateway::Gateway;
use crate::heartbeat::Beat;
use crate::metrics::Metrics;
use crate::protocol::{close_policy, OpCode, Payload, READY_EVENT, RESUMED_EVENT, ZOMBIE_CLOSE_CODE};
use crate::ratelimit::RateLimiter;
use crate::session::{Directive, ShardState};
use crate::shard::{Link, Outbound, Reply, ShardCommand, ShardEvent, ShardSnapshot, ShardStatus};
use crate::transport::{gateway_url, Connector};
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Close code for a normal local disconnect
const NORMAL_CLOSE_CODE: u16 = 1000;

/// Close code for a local reconnect; anything but 1000/1001 keeps the session resumable
const RECONNECT_CLOSE_CODE: u16 = 4000;

/// Stand-in when the server closed without a status code
const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// How long to wait for our close frame to be written
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the runner does next
enum Step {
    Connect,
    Wait(Duration),
    Idle,
    Shutdown,
}

/// Why a connection ended
enum Exit {
    ServerClosed { code: Option<u16>, reason: String },
    Failed(Error),
    /// Heartbeat went unacknowledged for a full interval
    Zombie,
    /// Server RECONNECT op or a caller's `reconnect`
    Reconnect { code: u16 },
    Disconnect { code: u16, reply: Reply },
    /// Every handle is gone
    Shutdown,
}

/// A frame waiting for send budget
struct Queued {
    message: Message,
    payload: Option<Payload>,
    heartbeat: bool,
    reply: Option<Reply>,
}

enum Input {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(Option<ShardCommand>),
    Tick,
    Retry,
    Flush,
}

/// The task that owns one shard's socket and protocol state.
pub(crate) struct ShardRunner<C: Connector> {
    id: u32,
    gateway: Arc<Gateway>,
    connector: Arc<C>,
    config: ClusterConfig,
    metrics: Arc<Metrics>,
    commands: mpsc::Receiver<ShardCommand>,
    /// Lets the identify task talk back without keeping the shard alive
    link: mpsc::WeakSender<ShardCommand>,
    events: broadcast::Sender<ShardEvent>,
    snapshot: watch::Sender<ShardSnapshot>,
    state: ShardState,
    backoff: Backoff,
    /// Outbound send budget
    limiter: RateLimiter,
    /// Incremented on every open socket
    generation: u64,
}

impl<C: Connector> ShardRunner<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        gateway: Arc<Gateway>,
        connector: Arc<C>,
        config: ClusterConfig,
        metrics: Arc<Metrics>,
        commands: mpsc::Receiver<ShardCommand>,
        link: mpsc::WeakSender<ShardCommand>,
        events: broadcast::Sender<ShardEvent>,
        snapshot: watch::Sender<ShardSnapshot>,
    ) -> Self {
        let state = ShardState::new(id, config.connection.encoding, config.connection.compression);
        let backoff = Backoff::new(config.backoff.clone());
        let limiter = RateLimiter::new(config.rate_limit.send_limit, config.rate_limit.send_window);

        Self {
            id,
            gateway,
            connector,
            config,
            metrics,
            commands,
            link,
            events,
            snapshot,
            state,
            backoff,
            limiter,
            generation: 0,
        }
    }

    /// Run until every handle to the shard is dropped.
    pub(crate) async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Wait(delay) => self.wait(delay).await,
                Step::Connect => self.connect_and_run().await,
                Step::Shutdown => break,
            };
        }
        debug!("[SHARD-{}] Runner stopped", self.id);
    }

    /// [`run`](Self::run) with panic recovery: a panicking runner is logged
    /// and counted instead of vanishing silently.
    pub(crate) async fn supervised(self) {
        let id = self.id;
        let metrics = self.metrics.clone();

        if let Err(panic_err) = AssertUnwindSafe(self.run()).catch_unwind().await {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!("[SHARD-{}] Runner PANICKED: {}. Shard is now dead.", id, panic_msg);
            metrics.record_error();
        }
    }

    async fn idle(&mut self) -> Step {
        loop {
            let Some(command) = self.commands.recv().await else {
                return Step::Shutdown;
            };
            if let Some(step) = self.offline_command(command, false) {
                return step;
            }
        }
    }

    /// Backoff before the next connect; commands are still served.
    async fn wait(&mut self, delay: Duration) -> Step {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let command = tokio::select! {
                _ = &mut sleep => return Step::Connect,
                command = self.commands.recv() => command,
            };
            let Some(command) = command else {
                return Step::Shutdown;
            };
            if let Some(step) = self.offline_command(command, true) {
                return step;
            }
        }
    }

    /// Handle a command while no socket exists. `Some` changes the step.
    fn offline_command(&mut self, command: ShardCommand, waiting: bool) -> Option<Step> {
        match command {
            ShardCommand::Connect if waiting => {
                debug!("[SHARD-{}] Connect requested during backoff, ignoring", self.id);
                None
            }
            ShardCommand::Connect => Some(Step::Connect),
            ShardCommand::Disconnect { code, reply } => {
                self.state.discard_session();
                self.publish();
                let _ = reply.send(Ok(()));
                if waiting {
                    info!("[SHARD-{}] Reconnect cancelled by disconnect", self.id);
                    self.set_status(ShardStatus::Idle);
                    self.emit(ShardEvent::Disconnect { code });
                    Some(Step::Idle)
                } else {
                    None
                }
            }
            ShardCommand::Reconnect { .. } if waiting => None,
            ShardCommand::Reconnect { .. } => Some(self.schedule_reconnect()),
            ShardCommand::Send { reply, .. } | ShardCommand::Heartbeat { reply } => {
                let _ = reply.send(Err(Error::NoConnection(self.id)));
                None
            }
            ShardCommand::Resume { reply, .. } => {
                let result = match self.state.session_id() {
                    None => Err(Error::NoSession),
                    Some(_) => Err(Error::NoConnection(self.id)),
                };
                let _ = reply.send(result);
                None
            }
        }
    }

    async fn connect_and_run(&mut self) -> Step {
        self.set_status(ShardStatus::Connecting);
        self.emit(ShardEvent::Connect);

        let timeout = self.config.connection.connect_timeout;
        let socket = match tokio::time::timeout(timeout, self.open_socket()).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return self.fail(e),
            Err(_) => {
                return self.fail(Error::ConnectionFailed(format!(
                    "connect timed out after {:?}",
                    timeout
                )))
            }
        };

        self.generation += 1;
        self.state.begin_connection();
        self.backoff.reset();
        self.metrics.record_connection();
        self.metrics.shard_connected(self.id);
        self.set_status(ShardStatus::Open);
        self.publish();
        self.emit(ShardEvent::Open);

        let exit = self.drive(socket).await;

        self.metrics.shard_disconnected(self.id);
        self.finish(exit)
    }

    async fn open_socket(&self) -> Result<C::Socket, Error> {
        let info = self.gateway.discover(false).await?;
        let url = gateway_url(&info.url, &self.config.connection)?;
        debug!("[SHARD-{}] Connecting to {}", self.id, url);
        let socket = self.connector.connect(&url).await?;
        info!("[SHARD-{}] Connected to {}", self.id, info.url);
        Ok(socket)
    }

    /// The per-connection loop: socket reads, commands, heartbeat ticks, the
    /// identify retry timer, and the rate-limited outbox.
    async fn drive(&mut self, socket: C::Socket) -> Exit {
        let (mut sink, mut stream) = socket.split();
        let mut outbox: VecDeque<Queued> = VecDeque::new();
        let mut heartbeat: Option<Interval> = None;
        let mut retry: Option<Pin<Box<Sleep>>> = None;
        let mut identify: Option<JoinHandle<()>> = None;

        let exit = loop {
            let flush_at = self.limiter.next_allowed(Instant::now());

            let input = tokio::select! {
                frame = stream.next() => Input::Frame(frame),
                command = self.commands.recv() => Input::Command(command),
                _ = next_tick(&mut heartbeat) => Input::Tick,
                _ = next_retry(&mut retry) => Input::Retry,
                _ = tokio::time::sleep_until(flush_at), if !outbox.is_empty() => Input::Flush,
            };

            match input {
                Input::Frame(Some(Ok(Message::Close(frame)))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    info!("[SHARD-{}] Server closed connection ({:?}) {}", self.id, code, reason);
                    break Exit::ServerClosed { code, reason };
                }
                Input::Frame(Some(Ok(Message::Ping(data)))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        break Exit::Failed(Error::WebSocket(e));
                    }
                }
                Input::Frame(Some(Ok(message))) => {
                    let directive = match self.on_message(message) {
                        Ok(Some(directive)) => directive,
                        Ok(None) => continue,
                        Err(e) => break Exit::Failed(e),
                    };
                    match directive {
                        Directive::Nothing => {}
                        Directive::Dispatch { event, data } => {
                            if event == READY_EVENT || event == RESUMED_EVENT {
                                info!("[SHARD-{}] {} (sequence {})", self.id, event, self.state.sequence());
                                self.set_status(ShardStatus::Steady);
                            }
                            self.emit(ShardEvent::Dispatch { event, data });
                        }
                        Directive::Heartbeat => {
                            debug!("[SHARD-{}] Server requested a heartbeat", self.id);
                            self.queue_heartbeat(&mut outbox, None);
                        }
                        Directive::Reconnect => {
                            info!("[SHARD-{}] Server requested reconnect", self.id);
                            break Exit::Reconnect {
                                code: RECONNECT_CLOSE_CODE,
                            };
                        }
                        Directive::RetryIdentify(delay) => {
                            if let Some(task) = identify.take() {
                                task.abort();
                            }
                            retry = Some(Box::pin(tokio::time::sleep(delay)));
                        }
                        Directive::Hello(interval) => {
                            debug!("[SHARD-{}] Hello, heartbeating every {:?}", self.id, interval);
                            let start = Instant::now().checked_add(interval).unwrap_or_else(Instant::now);
                            let mut ticker = interval_at(start, interval);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            heartbeat = Some(ticker);
                            retry = None;
                            if let Some(task) = identify.take() {
                                task.abort();
                            }
                            identify = self.spawn_identify();
                        }
                        Directive::Ack(latency) => {
                            self.metrics.record_heartbeat_ack();
                            if let Some(latency) = latency {
                                debug!("[SHARD-{}] Heartbeat acked in {:?}", self.id, latency);
                                self.metrics.update_shard(self.id, |s| s.latency = Some(latency));
                            }
                        }
                    }
                    self.publish();
                }
                Input::Frame(Some(Err(e))) => {
                    warn!("[SHARD-{}] WebSocket error: {}", self.id, e);
                    break Exit::Failed(Error::WebSocket(e));
                }
                Input::Frame(None) => {
                    info!("[SHARD-{}] WebSocket stream ended", self.id);
                    break Exit::ServerClosed {
                        code: None,
                        reason: "stream ended".to_string(),
                    };
                }
                Input::Command(None) => {
                    debug!("[SHARD-{}] Command channel closed", self.id);
                    break Exit::Shutdown;
                }
                Input::Command(Some(command)) => {
                    if let Some(exit) = self.online_command(command, &mut outbox) {
                        break exit;
                    }
                }
                Input::Tick => match self.state.tick() {
                    Beat::Send => self.queue_heartbeat(&mut outbox, None),
                    Beat::Zombie => {
                        warn!("[SHARD-{}] Heartbeat not acknowledged, connection is a zombie", self.id);
                        break Exit::Zombie;
                    }
                },
                Input::Retry => {
                    retry = None;
                    identify = self.spawn_identify();
                }
                Input::Flush => {
                    if let Err(e) = self.flush(&mut sink, &mut outbox).await {
                        warn!("[SHARD-{}] Failed to send: {}", self.id, e);
                        break Exit::Failed(e);
                    }
                }
            }
        };

        if let Some(task) = identify.take() {
            task.abort();
        }
        for queued in outbox.drain(..) {
            if let Some(reply) = queued.reply {
                let _ = reply.send(Err(Error::NoConnection(self.id)));
            }
        }

        let close_code = match &exit {
            Exit::Zombie => Some(ZOMBIE_CLOSE_CODE),
            Exit::Reconnect { code } | Exit::Disconnect { code, .. } => Some(*code),
            Exit::Shutdown => Some(NORMAL_CLOSE_CODE),
            Exit::ServerClosed { .. } | Exit::Failed(_) => None,
        };
        if let Some(code) = close_code {
            self.set_status(ShardStatus::Closing);
            let frame = CloseFrame {
                code: WsCloseCode::from(code),
                reason: "".into(),
            };
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
                Ok(Ok(())) => debug!("[SHARD-{}] Sent close {}", self.id, code),
                Ok(Err(e)) => debug!("[SHARD-{}] Close frame not sent: {}", self.id, e),
                Err(_) => debug!("[SHARD-{}] Close frame timed out", self.id),
            }
        }

        exit
    }

    /// Decode one frame and apply it to the state.
    fn on_message(&mut self, message: Message) -> Result<Option<Directive>, Error> {
        let Some(payload) = self.state.receive(&message)? else {
            return Ok(None);
        };
        self.metrics.record_payload_received();
        self.emit(ShardEvent::Receive(payload.clone()));

        let directive = self.state.handle(payload)?;
        let sequence = self.state.sequence();
        self.metrics.update_shard(self.id, |s| s.sequence = sequence);
        Ok(Some(directive))
    }

    /// Handle a command while a socket is open. `Some` ends the connection.
    fn online_command(&mut self, command: ShardCommand, outbox: &mut VecDeque<Queued>) -> Option<Exit> {
        match command {
            ShardCommand::Connect => {
                debug!("[SHARD-{}] Already connected", self.id);
                None
            }
            ShardCommand::Disconnect { code, reply } => {
                info!("[SHARD-{}] Disconnect requested", self.id);
                Some(Exit::Disconnect {
                    code: code.unwrap_or(NORMAL_CLOSE_CODE),
                    reply,
                })
            }
            ShardCommand::Reconnect { code } => {
                info!("[SHARD-{}] Reconnect requested", self.id);
                Some(Exit::Reconnect {
                    code: code.unwrap_or(RECONNECT_CLOSE_CODE),
                })
            }
            ShardCommand::Send {
                message,
                generation,
                reply,
            } => {
                if self.is_stale(generation) {
                    let _ = reply.send(Err(Error::NoConnection(self.id)));
                    return None;
                }
                match message.into_message(self.state.encoding()) {
                    Ok((message, payload)) => outbox.push_back(Queued {
                        message,
                        payload,
                        heartbeat: false,
                        reply: Some(reply),
                    }),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                None
            }
            ShardCommand::Resume { generation, reply } => {
                if self.is_stale(generation) {
                    let _ = reply.send(Err(Error::NoConnection(self.id)));
                    return None;
                }
                let queued = self
                    .state
                    .resume_payload(self.gateway.token())
                    .and_then(|payload| Outbound::Payload(payload).into_message(self.state.encoding()));
                match queued {
                    Ok((message, payload)) => {
                        info!("[SHARD-{}] Resuming at sequence {}", self.id, self.state.sequence());
                        outbox.push_back(Queued {
                            message,
                            payload,
                            heartbeat: false,
                            reply: Some(reply),
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                None
            }
            ShardCommand::Heartbeat { reply } => {
                self.queue_heartbeat(outbox, Some(reply));
                None
            }
        }
    }

    fn is_stale(&self, generation: Option<u64>) -> bool {
        matches!(generation, Some(g) if g != self.generation)
    }

    /// Put a heartbeat at the front of the outbox; at most one unrequested
    /// heartbeat waits at a time.
    fn queue_heartbeat(&mut self, outbox: &mut VecDeque<Queued>, reply: Option<Reply>) {
        if reply.is_none() && outbox.iter().any(|q| q.heartbeat) {
            return;
        }
        let payload = self.state.heartbeat_payload();
        match Outbound::Payload(payload).into_message(self.state.encoding()) {
            Ok((message, payload)) => outbox.push_front(Queued {
                message,
                payload,
                heartbeat: true,
                reply,
            }),
            Err(e) => {
                warn!("[SHARD-{}] Failed to encode heartbeat: {}", self.id, e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    /// Write the head of the outbox. Only called once the send budget allows it.
    async fn flush(
        &mut self,
        sink: &mut SplitSink<C::Socket, Message>,
        outbox: &mut VecDeque<Queued>,
    ) -> Result<(), Error> {
        let Some(queued) = outbox.pop_front() else {
            return Ok(());
        };
        self.limiter.reserve_at(Instant::now());

        if let Err(e) = sink.send(queued.message).await {
            if let Some(reply) = queued.reply {
                let _ = reply.send(Err(Error::NoConnection(self.id)));
            }
            return Err(Error::WebSocket(e));
        }

        if queued.heartbeat {
            self.state.record_heartbeat_sent();
            self.metrics.record_heartbeat();
        }
        match queued.payload.as_ref().and_then(Payload::opcode) {
            Some(OpCode::Identify) => self.metrics.record_identify(),
            Some(OpCode::Resume) => self.metrics.record_resume(),
            _ => {}
        }
        self.metrics.record_payload_sent();
        self.emit(ShardEvent::Send(queued.payload));
        if let Some(reply) = queued.reply {
            let _ = reply.send(Ok(()));
        }
        Ok(())
    }

    /// Identify (or resume) through the gateway from a separate task, so the
    /// session-start wait and identify throttle never block this loop.
    fn spawn_identify(&mut self) -> Option<JoinHandle<()>> {
        let commands = self.link.upgrade()?;
        let status = if self.state.session_id().is_some() {
            ShardStatus::Resuming
        } else {
            ShardStatus::Identifying
        };
        self.set_status(status);
        self.publish();

        let link = Link::new(self.id, commands, self.snapshot.subscribe(), Some(self.generation));
        let gateway = self.gateway.clone();
        let extra = self.config.connection.identify.clone();
        let events = self.events.clone();
        let id = self.id;

        Some(tokio::spawn(async move {
            if let Err(e) = gateway.identify(&link, extra).await {
                warn!("[SHARD-{}] Identify failed: {}", id, e);
                let _ = events.send(ShardEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }))
    }

    /// Decide what follows a finished connection.
    fn finish(&mut self, exit: Exit) -> Step {
        let step = match exit {
            Exit::ServerClosed { code, reason } => {
                self.emit(ShardEvent::Close {
                    code,
                    reason: reason.clone(),
                });
                let code = code.unwrap_or(NO_STATUS_CLOSE_CODE);
                let policy = close_policy(code);

                if !policy.reconnect {
                    error!("[SHARD-{}] Closed with fatal code {}: {}", self.id, code, reason);
                    self.state.discard_session();
                    self.metrics.record_fatal_close();
                    self.set_status(ShardStatus::DisconnectedFatal);
                    let fatal = Error::FatalClose {
                        code,
                        reason: reason.clone(),
                    };
                    self.emit(ShardEvent::Error {
                        kind: fatal.kind(),
                        message: fatal.to_string(),
                    });
                    self.emit(ShardEvent::Exit { code, reason });
                    Step::Idle
                } else {
                    if !policy.keep_session {
                        self.state.discard_session();
                    }
                    self.schedule_reconnect()
                }
            }
            Exit::Failed(e) => self.fail(e),
            Exit::Zombie => {
                self.metrics.record_zombie();
                self.emit(ShardEvent::Disconnect {
                    code: Some(ZOMBIE_CLOSE_CODE),
                });
                self.schedule_reconnect()
            }
            Exit::Reconnect { code } => {
                self.emit(ShardEvent::Disconnect { code: Some(code) });
                self.schedule_reconnect()
            }
            Exit::Disconnect { code, reply } => {
                self.state.discard_session();
                self.set_status(ShardStatus::Idle);
                self.emit(ShardEvent::Disconnect { code: Some(code) });
                let _ = reply.send(Ok(()));
                Step::Idle
            }
            Exit::Shutdown => Step::Shutdown,
        };
        self.publish();
        step
    }

    /// Surface an error and reconnect with a grown backoff.
    fn fail(&mut self, error: Error) -> Step {
        warn!("[SHARD-{}] Connection error: {}", self.id, error);
        self.metrics.record_error();
        self.emit(ShardEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
        let step = self.schedule_reconnect();
        self.backoff.grow();
        step
    }

    fn schedule_reconnect(&mut self) -> Step {
        let delay = self.backoff.delay();
        debug!("[SHARD-{}] Reconnecting in {:?}", self.id, delay);
        self.metrics.record_reconnection();
        self.set_status(ShardStatus::Idle);
        self.emit(ShardEvent::Reconnect { delay });
        Step::Wait(delay)
    }

    fn emit(&self, event: ShardEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ShardStatus) {
        self.snapshot.send_modify(|s| s.status = status);
    }

    /// Copy protocol state into the snapshot.
    fn publish(&self) {
        let sequence = self.state.sequence();
        let session_id = self.state.session_id().map(str::to_string);
        let latency = self.state.heartbeat().latency();
        let connection = self.generation;
        self.snapshot.send_if_modified(|s| {
            let next = ShardSnapshot {
                status: s.status,
                sequence,
                session_id: session_id.clone(),
                latency,
                connection,
            };
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::shard::Shard;
    use crate::transport::TungsteniteConnector;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn runner() -> ShardRunner<TungsteniteConnector> {
        let config = ClusterConfig::builder()
            .compression(Compression::None)
            .build()
            .unwrap();
        let gateway = Arc::new(Gateway::new("token", Default::default()));
        let (_shard, mut runner) = Shard::build(
            0,
            gateway,
            Arc::new(TungsteniteConnector::default()),
            config,
            Arc::new(Metrics::new()),
        );
        runner.generation = 2;
        runner
    }

    fn presence() -> Outbound {
        Outbound::Payload(Payload::new(OpCode::PresenceUpdate, json!({"status": "idle"})))
    }

    #[tokio::test]
    async fn test_superseded_send_is_dropped() {
        let mut runner = runner();
        let mut outbox = VecDeque::new();

        let (reply, rx) = oneshot::channel();
        let command = ShardCommand::Send {
            message: presence(),
            generation: Some(1),
            reply,
        };
        assert!(runner.online_command(command, &mut outbox).is_none());
        assert!(outbox.is_empty());
        assert!(matches!(rx.await.unwrap(), Err(Error::NoConnection(0))));

        let (reply, _rx) = oneshot::channel();
        let command = ShardCommand::Send {
            message: presence(),
            generation: Some(2),
            reply,
        };
        runner.online_command(command, &mut outbox);
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn test_superseded_resume_is_dropped() {
        let mut runner = runner();
        let mut outbox = VecDeque::new();

        let (reply, rx) = oneshot::channel();
        let command = ShardCommand::Resume {
            generation: Some(1),
            reply,
        };
        runner.online_command(command, &mut outbox);
        assert!(outbox.is_empty());
        assert!(matches!(rx.await.unwrap(), Err(Error::NoConnection(0))));
    }

    #[tokio::test]
    async fn test_untagged_send_is_queued() {
        let mut runner = runner();
        let mut outbox = VecDeque::new();

        let (reply, _rx) = oneshot::channel();
        let command = ShardCommand::Send {
            message: presence(),
            generation: None,
            reply,
        };
        runner.online_command(command, &mut outbox);
        assert_eq!(outbox.len(), 1);
        assert!(!outbox[0].heartbeat);
    }
}
