//! In-memory gateway for driving shards without a network.

#![allow(dead_code)]

use futures_util::{Sink, Stream};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use ws_gateway_cluster::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use ws_gateway_cluster::tungstenite::protocol::CloseFrame;
use ws_gateway_cluster::tungstenite::{self, Message};
use ws_gateway_cluster::{
    BackoffConfig, ClusterConfig, Compression, Connector, Error, Gateway, GatewayConfig,
    GatewayInfo, OpCode, Payload,
};

pub const TOKEN: &str = "test-token";

/// Client end of an in-memory socket
pub struct MockSocket {
    inbound: mpsc::UnboundedReceiver<Result<Message, tungstenite::Error>>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Stream for MockSocket {
    type Item = Result<Message, tungstenite::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<Message> for MockSocket {
    type Error = tungstenite::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.outbound
            .send(item)
            .map_err(|_| tungstenite::Error::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Server end of one accepted connection
pub struct MockServer {
    to_client: mpsc::UnboundedSender<Result<Message, tungstenite::Error>>,
    from_client: mpsc::UnboundedReceiver<Message>,
}

impl MockServer {
    pub fn send_message(&self, message: Message) {
        let _ = self.to_client.send(Ok(message));
    }

    pub fn send(&self, payload: Value) {
        self.send_message(Message::Text(payload.to_string()));
    }

    pub fn hello(&self, interval_ms: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}));
    }

    pub fn ready(&self, seq: u64, session_id: &str) {
        self.send(json!({"op": 0, "s": seq, "t": "READY", "d": {"session_id": session_id}}));
    }

    pub fn dispatch(&self, seq: u64, event: &str, data: Value) {
        self.send(json!({"op": 0, "s": seq, "t": event, "d": data}));
    }

    pub fn ack(&self) {
        self.send(json!({"op": 11, "d": null}));
    }

    pub fn close(&self, code: u16) {
        self.send_message(Message::Close(Some(CloseFrame {
            code: WsCloseCode::from(code),
            reason: "".into(),
        })));
    }

    pub fn fail(&self) {
        let _ = self.to_client.send(Err(tungstenite::Error::ConnectionClosed));
    }

    /// Next frame from the client, `None` once it dropped the socket
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_client.recv().await
    }

    /// Next text payload, skipping control frames
    pub async fn recv_payload(&mut self) -> Payload {
        loop {
            match self.recv().await {
                Some(Message::Text(text)) => {
                    return serde_json::from_str(&text).expect("client sent invalid JSON")
                }
                Some(Message::Close(frame)) => panic!("client closed: {:?}", frame),
                Some(_) => continue,
                None => panic!("client dropped the socket"),
            }
        }
    }

    /// Next payload with `op`, skipping others (heartbeats, mostly)
    pub async fn recv_op(&mut self, op: OpCode) -> Payload {
        loop {
            let payload = self.recv_payload().await;
            if payload.op == op.as_u64() {
                return payload;
            }
        }
    }

    /// Wait for the client's close frame and return its code
    pub async fn recv_close(&mut self) -> Option<u16> {
        loop {
            match self.recv().await {
                Some(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

/// Hands each new connection's server end to the test
pub struct MockConnector {
    connects: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Self, Handle) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        let refuse = Arc::new(AtomicBool::new(false));
        let connector = Self {
            connects: connects.clone(),
            refuse: refuse.clone(),
            servers,
        };
        (
            connector,
            Handle {
                connects,
                refuse,
                accepted,
            },
        )
    }
}

impl Connector for MockConnector {
    type Socket = MockSocket;

    async fn connect(&self, _url: &url::Url) -> Result<MockSocket, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("refused".to_string()));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.servers.send(MockServer {
            to_client,
            from_client,
        });
        Ok(MockSocket { inbound, outbound })
    }
}

/// Test-side view of a [`MockConnector`]
pub struct Handle {
    connects: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    accepted: mpsc::UnboundedReceiver<MockServer>,
}

impl Handle {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub async fn accept(&mut self) -> MockServer {
        self.accepted.recv().await.expect("connector dropped")
    }

    pub fn try_accept(&mut self) -> Option<MockServer> {
        self.accepted.try_recv().ok()
    }
}

/// Gateway with discovery already done and a generous budget
pub fn gateway(shards: u32) -> Arc<Gateway> {
    let gateway = Gateway::new(
        TOKEN,
        GatewayConfig {
            identify_window: Duration::from_millis(10),
            ..Default::default()
        },
    );
    gateway.set_info(GatewayInfo::new(
        "ws://gateway.test",
        shards,
        1000,
        1000,
        Duration::from_secs(3600),
    ));
    Arc::new(gateway)
}

/// Plain JSON frames, fixed 100 ms backoff
pub fn config() -> ClusterConfig {
    ClusterConfig::builder()
        .compression(Compression::None)
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: Duration::ZERO,
        })
        .build()
        .expect("valid config")
}
