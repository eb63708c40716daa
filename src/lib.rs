//! # ws-gateway-cluster
//!
//! A sharded client for sequenced, resumable WebSocket gateway protocols.
//!
//! ## Features
//!
//! - **Resume-aware reconnects** with exponential backoff and jitter
//! - **Streaming zlib** decompression with flush-suffix framing
//! - **Heartbeat/ack liveness** with zombie detection
//! - **Identify throttling** and session-start budgeting shared by every shard of a credential
//! - **Clusters** of shards in one process, or spread over child processes
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use ws_gateway_cluster::{Cluster, ClusterConfig, ShardSelector};
//!
//! let config = ClusterConfig::builder().shard_count(4).build()?;
//! let cluster = Cluster::new(&token, config)?;
//! let mut events = cluster.subscribe();
//!
//! cluster.spawn(ShardSelector::All).await?;
//! while let Ok(e) = events.recv().await {
//!     println!("[{}] {}", e.shard_id, e.event.name());
//! }
//! ```

mod cluster;
mod codec;
mod config;
mod connection;
mod error;
mod gateway;
mod heartbeat;
pub mod ipc;
mod metrics;
pub mod process;
mod protocol;
mod ratelimit;
mod session;
mod shard;
mod transport;

pub use cluster::{Cluster, ClusterEvent, ShardSelector};
pub use codec::{decode, encode, Compression, Encoding, Inflater, ZLIB_SUFFIX};
pub use config::{
    Backoff, BackoffConfig, ClusterConfig, ClusterConfigBuilder, ConfigError, ConnectionConfig,
    GatewayConfig, RateLimitConfig, DEFAULT_DISCOVERY_URL,
};
pub use error::{Error, ErrorKind};
pub use gateway::{Gateway, GatewayInfo, SessionStartLimit, ShardLink};
pub use heartbeat::{Beat, HeartbeatMonitor};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use process::{ProcessCluster, ProcessConfig, ProcessEvent, RangeTable};
pub use protocol::{
    close_policy, identify_body, CloseCode, ClosePolicy, GatewayEvent, IdentifyParams, OpCode,
    Payload, ResumeBody, READY_EVENT, RESUMED_EVENT, ZOMBIE_CLOSE_CODE,
};
pub use ratelimit::RateLimiter;
pub use session::{Directive, ShardState, INVALID_SESSION_DELAY_MS};
pub use shard::{Outbound, Shard, ShardEvent, ShardSnapshot, ShardStatus};
pub use transport::{gateway_url, Connector, TungsteniteConnector, WsStream};

// Re-exported so custom connectors can name the socket item types
pub use tokio_tungstenite::tungstenite;

/// Result type for ws-gateway-cluster operations
pub type Result<T> = std::result::Result<T, Error>;
