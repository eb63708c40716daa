use crate::config::ClusterConfig;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::metrics::Metrics;
use crate::shard::{Outbound, Shard, ShardEvent};
use crate::transport::{Connector, TungsteniteConnector};
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which shard ids a [`Cluster::spawn`] call covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardSelector {
    /// `0..shard_count`
    All,
    One(u32),
    Ids(Vec<u32>),
    /// `[min, max)`, clamped to the shard count
    Range(Range<u32>),
}

impl From<u32> for ShardSelector {
    fn from(id: u32) -> Self {
        ShardSelector::One(id)
    }
}

impl From<Vec<u32>> for ShardSelector {
    fn from(ids: Vec<u32>) -> Self {
        if ids.is_empty() {
            ShardSelector::All
        } else {
            ShardSelector::Ids(ids)
        }
    }
}

impl<const N: usize> From<[u32; N]> for ShardSelector {
    fn from(ids: [u32; N]) -> Self {
        ids.to_vec().into()
    }
}

impl From<Range<u32>> for ShardSelector {
    fn from(range: Range<u32>) -> Self {
        ShardSelector::Range(range)
    }
}

/// An event of one owned shard, tagged with its id
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub shard_id: u32,
    pub event: ShardEvent,
}

/// A set of shards sharing one gateway.
///
/// Shards are created on first spawn and reconnected, never recreated, on
/// later spawns. Every shard event is re-published on the cluster's own
/// stream tagged with its shard id.
pub struct Cluster<C: Connector = TungsteniteConnector> {
    gateway: Arc<Gateway>,
    connector: Arc<C>,
    config: ClusterConfig,
    metrics: Arc<Metrics>,
    shards: RwLock<BTreeMap<u32, Shard>>,
    /// Runner and relay tasks, aborted on drop
    tasks: RwLock<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Cluster<TungsteniteConnector> {
    /// Cluster on the process-wide gateway for `token`.
    pub fn new(token: &str, config: ClusterConfig) -> Result<Self, Error> {
        config.validate()?;
        let gateway = Gateway::shared(token, config.gateway.clone());
        Ok(Self::with_connector(gateway, TungsteniteConnector::default(), config))
    }
}

impl<C: Connector> Cluster<C> {
    pub fn with_connector(gateway: Arc<Gateway>, connector: C, config: ClusterConfig) -> Self {
        let (events, _) = broadcast::channel(config.connection.event_buffer);
        Self {
            gateway,
            connector: Arc::new(connector),
            config,
            metrics: Arc::new(Metrics::new()),
            shards: RwLock::new(BTreeMap::new()),
            tasks: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Every event of every owned shard, from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn shard(&self, id: u32) -> Option<Shard> {
        self.shards.read().get(&id).cloned()
    }

    /// Owned shard ids, ascending
    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Turn a selector into concrete ids, discovering the shard count when
    /// the selector depends on it.
    pub async fn resolve(&self, selector: ShardSelector) -> Result<Vec<u32>, Error> {
        let ids = match selector {
            ShardSelector::One(id) => vec![id],
            ShardSelector::Ids(mut ids) => {
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            ShardSelector::All => (0..self.shard_count().await?).collect(),
            ShardSelector::Range(range) => {
                let count = self.shard_count().await?;
                (range.start..range.end.min(count)).collect()
            }
        };
        Ok(ids)
    }

    async fn shard_count(&self) -> Result<u32, Error> {
        match self.gateway.shard_count() {
            Ok(count) => Ok(count),
            Err(_) => {
                self.gateway.discover(false).await?;
                self.gateway.shard_count()
            }
        }
    }

    /// Connect the selected shards: existing ones reconnect, missing ones are
    /// created and connected. Returns the resolved ids.
    pub async fn spawn(&self, selector: impl Into<ShardSelector>) -> Result<Vec<u32>, Error> {
        let ids = self.resolve(selector.into()).await?;

        for &id in &ids {
            let (shard, created) = {
                let mut shards = self.shards.write();
                match shards.entry(id) {
                    Entry::Occupied(entry) => (entry.get().clone(), false),
                    Entry::Vacant(entry) => {
                        let shard = self.create_shard(id);
                        entry.insert(shard.clone());
                        (shard, true)
                    }
                }
            };

            let result = if created {
                debug!("[SHARD-{}] Created, connecting", id);
                shard.connect().await
            } else {
                debug!("[SHARD-{}] Already owned, reconnecting", id);
                shard.reconnect(None).await
            };
            if let Err(e) = result {
                warn!("[SHARD-{}] Spawn failed: {}", id, e);
            }
        }

        info!("Spawned {} shard(s), {} owned", ids.len(), self.len());
        Ok(ids)
    }

    /// Build a shard, hook its events into the cluster stream, start its runner.
    fn create_shard(&self, id: u32) -> Shard {
        let (shard, runner) = Shard::build(
            id,
            self.gateway.clone(),
            self.connector.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );

        let relay = tokio::spawn(relay_events(id, shard.subscribe(), self.events.clone()));
        let runner = tokio::spawn(runner.supervised());

        let mut tasks = self.tasks.write();
        tasks.push(relay);
        tasks.push(runner);

        self.metrics.update_shard(id, |s| s.is_connected = false);
        shard
    }

    /// Disconnect every owned shard with `code`. Shards stay owned and can be
    /// spawned again.
    pub async fn kill(&self, code: Option<u16>) {
        let shards: Vec<Shard> = self.shards.read().values().cloned().collect();
        info!("Disconnecting {} shard(s)", shards.len());

        let results = join_all(shards.iter().map(|shard| shard.disconnect(code))).await;
        for (shard, result) in shards.iter().zip(results) {
            if let Err(e) = result {
                warn!("[SHARD-{}] Disconnect failed: {}", shard.id(), e);
            }
        }
    }

    /// Send through one owned shard.
    pub async fn send(&self, id: u32, outbound: impl Into<Outbound>) -> Result<(), Error> {
        let shard = self.shard(id).ok_or(Error::UnknownShard(id))?;
        shard.send(outbound).await
    }
}

impl<C: Connector> Drop for Cluster<C> {
    fn drop(&mut self) {
        // Abort all tasks to prevent orphaned shards
        for handle in std::mem::take(&mut *self.tasks.write()) {
            handle.abort();
        }
    }
}

/// Forward one shard's events onto the cluster stream.
async fn relay_events(
    shard_id: u32,
    mut rx: broadcast::Receiver<ShardEvent>,
    tx: broadcast::Sender<ClusterEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = tx.send(ClusterEvent { shard_id, event });
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("[SHARD-{}] Event relay lagged, {} event(s) dropped", shard_id, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::GatewayInfo;
    use std::time::Duration;

    fn cluster(shard_count: Option<u32>) -> Cluster {
        let gateway = Arc::new(Gateway::new(
            "token",
            GatewayConfig {
                shard_count,
                ..Default::default()
            },
        ));
        Cluster::with_connector(gateway, TungsteniteConnector::default(), ClusterConfig::default())
    }

    #[test]
    fn test_selector_conversions() {
        assert_eq!(ShardSelector::from(3u32), ShardSelector::One(3));
        assert_eq!(ShardSelector::from(vec![]), ShardSelector::All);
        assert_eq!(ShardSelector::from([1u32, 2]), ShardSelector::Ids(vec![1, 2]));
        assert_eq!(ShardSelector::from(2u32..5), ShardSelector::Range(2..5));
    }

    #[tokio::test]
    async fn test_resolve_clamps_range() {
        let cluster = cluster(Some(4));
        assert_eq!(cluster.resolve((2u32..10).into()).await.unwrap(), vec![2, 3]);
        assert_eq!(cluster.resolve(ShardSelector::All).await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            cluster.resolve([5u32, 1, 5].into()).await.unwrap(),
            vec![1, 5]
        );
    }

    #[tokio::test]
    async fn test_resolve_uses_discovered_count() {
        let cluster = cluster(None);
        cluster
            .gateway()
            .set_info(GatewayInfo::new("ws://127.0.0.1:1", 2, 1, 1, Duration::from_secs(1)));
        assert_eq!(cluster.resolve(ShardSelector::All).await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_send_to_unknown_shard() {
        let cluster = cluster(Some(1));
        let result = cluster.send(7, (crate::OpCode::Heartbeat, serde_json::Value::Null)).await;
        assert!(matches!(result, Err(Error::UnknownShard(7))));
    }
}
