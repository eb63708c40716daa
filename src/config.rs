use crate::codec::{Compression, Encoding};
use rand::Rng;
use std::time::Duration;

/// Default REST endpoint for gateway discovery
pub const DEFAULT_DISCOVERY_URL: &str = "https://discord.com/api/v10/gateway/bot";

/// Configuration for a cluster of shards
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Gateway discovery and identify settings
    pub gateway: GatewayConfig,
    /// Per-connection settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Outbound send budget per connection
    pub rate_limit: RateLimitConfig,
}

impl ClusterConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }
}

/// Builder for ClusterConfig
#[derive(Debug, Clone, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set gateway configuration
    pub fn gateway(mut self, config: GatewayConfig) -> Self {
        self.config.gateway = config;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set the outbound rate limit
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Override the total shard count instead of using the discovered one
    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.gateway.shard_count = Some(count);
        self
    }

    /// Set the payload encoding
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.config.connection.encoding = encoding;
        self
    }

    /// Set the transport compression mode
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.connection.compression = compression;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ClusterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl ClusterConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be >= 1".to_string(),
            ));
        }

        if self.backoff.jitter >= self.backoff.initial_delay && !self.backoff.jitter.is_zero() {
            return Err(ConfigError::InvalidBackoff(
                "jitter must be smaller than initial_delay".to_string(),
            ));
        }

        if self.rate_limit.send_limit == 0 || self.rate_limit.send_window.is_zero() {
            return Err(ConfigError::InvalidRateLimit(
                "send budget must be a positive count over a non-zero window".to_string(),
            ));
        }

        if self.gateway.identify_limit == 0 || self.gateway.identify_window.is_zero() {
            return Err(ConfigError::InvalidRateLimit(
                "identify budget must be a positive count over a non-zero window".to_string(),
            ));
        }

        if let Some(0) = self.gateway.shard_count {
            return Err(ConfigError::InvalidShardCount(
                "shard_count cannot be 0".to_string(),
            ));
        }

        if self.connection.event_buffer == 0 {
            return Err(ConfigError::InvalidConnection(
                "event_buffer cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid rate limit configuration
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),
    /// Invalid shard count
    #[error("Invalid shard count: {0}")]
    InvalidShardCount(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
}

/// Discovery and identify settings shared by every shard of one credential
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// REST endpoint returning `{url, shards, session_start_limit}`
    pub discovery_url: String,
    /// User-Agent sent with the discovery request
    pub user_agent: String,
    /// Explicit total shard count; wins over discovery when set
    pub shard_count: Option<u32>,
    /// Identify calls allowed per window, across all shards
    pub identify_limit: u32,
    /// Window for the identify budget
    pub identify_window: Duration,
    /// Member count above which the server omits offline members
    pub large_threshold: u32,
    /// Sent as the client/browser/device name in identify
    pub client_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            user_agent: format!(
                "ws-gateway-cluster ({}, {})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            shard_count: None,
            identify_limit: 1,
            identify_window: Duration::from_secs(5),
            large_threshold: 250,
            client_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Gateway protocol version (`v` query parameter)
    pub api_version: u8,
    /// Payload encoding (`encoding` query parameter)
    pub encoding: Encoding,
    /// Transport compression (`compress` query parameter)
    pub compression: Compression,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Capacity of each shard's event broadcast channel
    pub event_buffer: usize,
    /// Extra identify fields (presence, intents, ...); top-level keys override the defaults
    pub identify: Option<serde_json::Value>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            api_version: 10,
            encoding: Encoding::Json,
            compression: Compression::ZlibStream,
            connect_timeout: Duration::from_secs(10),
            event_buffer: 256,
            identify: None,
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay used after a clean open and before the first error
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Growth factor applied on every error-triggered reconnect
    pub multiplier: f64,
    /// Maximum random offset added to or subtracted from each delay
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffConfig {
    /// Apply jitter to a delay: `delay ± rand(0..=jitter)`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let spread = self.jitter.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let millis = (delay.as_millis() as i64 + offset).max(0);
        Duration::from_millis(millis as u64)
    }
}

/// Current reconnect delay for one shard.
///
/// Grows on error-triggered reconnects and resets to the base on a clean open.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Start at the configured initial delay
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// The un-jittered current delay
    pub fn current(&self) -> Duration {
        self.current
    }

    /// The delay to sleep before the next connect
    pub fn delay(&self) -> Duration {
        self.config.jittered(self.current)
    }

    /// Multiply the delay, capped at `max_delay`
    pub fn grow(&mut self) {
        let next = self.current.as_millis() as f64 * self.config.multiplier;
        let capped = next.min(self.config.max_delay.as_millis() as f64);
        self.current = Duration::from_millis(capped as u64);
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

/// Outbound send budget per connection
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sends allowed per window
    pub send_limit: u32,
    /// Rolling window for the send budget
    pub send_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            send_limit: 120,
            send_window: Duration::from_secs(60),
        }
    }
}
