//! Shared per-credential state: discovery cache, session-start budget, and
//! the globally throttled identify.

use crate::config::GatewayConfig;
use crate::error::Error;
use crate::protocol::{identify_body, IdentifyParams, OpCode, Payload};
use crate::ratelimit::RateLimiter;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How many new sessions may still be started, and when that resets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: Duration,
    /// `fetched_at + reset_after`
    pub reset_at: Instant,
}

/// Result of REST discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

impl GatewayInfo {
    /// Build from discovered values, anchoring `reset_after` at `now`.
    pub fn new(url: impl Into<String>, shards: u32, total: u32, remaining: u32, reset_after: Duration) -> Self {
        Self {
            url: url.into(),
            shards,
            session_start_limit: SessionStartLimit {
                total,
                remaining,
                reset_after,
                reset_at: Instant::now() + reset_after,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    url: String,
    shards: u32,
    session_start_limit: RawSessionStartLimit,
}

#[derive(Debug, Deserialize)]
struct RawSessionStartLimit {
    total: u32,
    remaining: u32,
    /// Milliseconds
    reset_after: u64,
}

/// The shard-side half of an identify.
///
/// The gateway decides between identify and resume and paces identifies; the
/// shard owns the socket the payload goes out on.
pub trait ShardLink: Send + Sync {
    fn shard_id(&self) -> u32;

    /// Whether the shard currently holds a resumable session
    fn has_session(&self) -> bool;

    fn resume(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Queue a payload on the shard's rate-limited send path
    fn send_payload(&self, payload: Payload) -> impl Future<Output = Result<(), Error>> + Send;
}

static REGISTRY: OnceLock<SyncMutex<HashMap<String, Arc<Gateway>>>> = OnceLock::new();

pub struct Gateway {
    token: String,
    config: GatewayConfig,
    http: reqwest::Client,
    /// 0 means unset
    shard_count: AtomicU32,
    info: RwLock<Option<GatewayInfo>>,
    discover_lock: Mutex<()>,
    identify_gate: Mutex<RateLimiter>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("token", &"<redacted>")
            .field("shard_count", &self.shard_count.load(Ordering::Relaxed))
            .field("info", &*self.info.read())
            .finish()
    }
}

impl Gateway {
    pub fn new(token: impl Into<String>, config: GatewayConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            token: token.into(),
            shard_count: AtomicU32::new(config.shard_count.unwrap_or(0)),
            identify_gate: Mutex::new(RateLimiter::new(
                config.identify_limit,
                config.identify_window,
            )),
            config,
            http,
            info: RwLock::new(None),
            discover_lock: Mutex::new(()),
        }
    }

    /// The one gateway for `token` in this process.
    ///
    /// Shards created separately for the same credential must share one
    /// identify budget; the first caller's config wins. A later explicit
    /// shard count still overrides.
    pub fn shared(token: &str, config: GatewayConfig) -> Arc<Gateway> {
        let registry = REGISTRY.get_or_init(|| SyncMutex::new(HashMap::new()));
        let mut registry = registry.lock();
        let gateway = registry
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Gateway::new(token, config.clone())))
            .clone();
        if let Some(count) = config.shard_count {
            gateway.set_shard_count(count);
        }
        gateway
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Total shard count, explicit or discovered.
    pub fn shard_count(&self) -> Result<u32, Error> {
        match self.shard_count.load(Ordering::Acquire) {
            0 => Err(Error::NoGateway),
            n => Ok(n),
        }
    }

    /// Explicit override; always wins over discovery.
    pub fn set_shard_count(&self, count: u32) {
        self.shard_count.store(count, Ordering::Release);
    }

    pub fn url(&self) -> Result<String, Error> {
        self.info
            .read()
            .as_ref()
            .map(|i| i.url.clone())
            .ok_or(Error::NoGateway)
    }

    pub fn info(&self) -> Option<GatewayInfo> {
        self.info.read().clone()
    }

    pub fn session_start_limit(&self) -> Option<SessionStartLimit> {
        self.info.read().as_ref().map(|i| i.session_start_limit.clone())
    }

    /// Install discovery results obtained elsewhere.
    pub fn set_info(&self, info: GatewayInfo) {
        if self.shard_count.load(Ordering::Acquire) == 0 {
            self.shard_count.store(info.shards, Ordering::Release);
        }
        *self.info.write() = Some(info);
    }

    /// Cached discovery, or one REST call when forced or nothing is cached.
    pub async fn discover(&self, force: bool) -> Result<GatewayInfo, Error> {
        if !force {
            if let Some(info) = self.info() {
                return Ok(info);
            }
        }

        let _guard = self.discover_lock.lock().await;
        // Another shard may have finished discovery while we waited.
        if !force {
            if let Some(info) = self.info() {
                return Ok(info);
            }
        }

        debug!("Fetching gateway info from {}", self.config.discovery_url);
        let response = self
            .http
            .get(&self.config.discovery_url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::Discovery(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Discovery(format!("HTTP {}", status)));
        }

        let body: DiscoveryResponse = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("malformed body: {}", e)))?;

        let limit = body.session_start_limit;
        let info = GatewayInfo::new(
            body.url,
            body.shards,
            limit.total,
            limit.remaining,
            Duration::from_millis(limit.reset_after),
        );
        info!(
            "Discovered gateway {} ({} shards, {}/{} session starts left)",
            info.url, info.shards, limit.remaining, limit.total
        );

        self.set_info(info.clone());
        Ok(info)
    }

    /// Identify `shard`, or resume it when it still holds a session.
    ///
    /// Waits for the session-start budget to reset when it is exhausted and
    /// admits at most `identify_limit` identifies per `identify_window`
    /// across every shard of this gateway.
    pub async fn identify<L: ShardLink>(&self, shard: &L, extra: Option<Value>) -> Result<(), Error> {
        if shard.has_session() {
            debug!("[SHARD-{}] Session present, resuming instead of identifying", shard.shard_id());
            return shard.resume().await;
        }

        let body = {
            let mut limiter = self.identify_gate.lock().await;
            self.wait_for_session_budget(shard.shard_id()).await?;

            let waited = limiter.acquire().await;
            if !waited.is_zero() {
                debug!("[SHARD-{}] Identify throttled for {:?}", shard.shard_id(), waited);
            }

            let shard_count = self.shard_count()?;
            let body = identify_body(
                &IdentifyParams {
                    token: &self.token,
                    shard_id: shard.shard_id(),
                    shard_count,
                    client_name: &self.config.client_name,
                    large_threshold: self.config.large_threshold,
                },
                extra,
            );

            if let Some(info) = self.info.write().as_mut() {
                let limit = &mut info.session_start_limit;
                limit.remaining = limit.remaining.saturating_sub(1);
            }
            body
        };

        info!("[SHARD-{}] Identifying", shard.shard_id());
        shard.send_payload(Payload::new(OpCode::Identify, body)).await
    }

    /// Block until a session start is available. Caller holds the identify gate.
    async fn wait_for_session_budget(&self, shard_id: u32) -> Result<(), Error> {
        let limit = self.session_start_limit().ok_or(Error::NoGateway)?;
        if limit.remaining > 0 {
            return Ok(());
        }

        let wait = limit.reset_at.saturating_duration_since(Instant::now());
        warn!(
            "[SHARD-{}] Session start budget exhausted, waiting {:?} for reset",
            shard_id, wait
        );
        tokio::time::sleep_until(limit.reset_at).await;

        if let Some(info) = self.info.write().as_mut() {
            let limit = &mut info.session_start_limit;
            limit.remaining = limit.total;
            limit.reset_at = Instant::now() + limit.reset_after;
        }
        Ok(())
    }
}
