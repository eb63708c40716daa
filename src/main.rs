//! ws-gateway - run gateway shards from the command line
//!
//! Events are written to stdout as one JSON object per line; send
//! instructions are read from stdin the same way. Logs go to stderr.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ws_gateway_cluster::ipc::{self, ChildMessage, ParentMessage, RelayOptions};
use ws_gateway_cluster::{
    Cluster, ClusterConfig, Compression, Encoding, GatewayConfig, ProcessCluster, ProcessConfig,
    ProcessEvent, ShardSelector, DEFAULT_DISCOVERY_URL,
};

#[derive(Parser)]
#[command(name = "ws-gateway")]
#[command(about = "Sharded gateway client")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Options {
    /// Gateway credential
    #[arg(long, env = "GATEWAY_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Total shard count; overrides discovery
    #[arg(long, global = true)]
    total: Option<u32>,

    /// REST endpoint for gateway discovery
    #[arg(long, env = "GATEWAY_DISCOVERY_URL", default_value = DEFAULT_DISCOVERY_URL, global = true)]
    discovery_url: String,

    /// Payload encoding (json or cbor)
    #[arg(long, default_value = "json", global = true)]
    encoding: Encoding,

    /// Transport compression (zlib-stream or none)
    #[arg(long, default_value = "zlib-stream", global = true)]
    compression: Compression,

    /// Event names to relay
    #[arg(long, value_delimiter = ',', default_value = "close,error,open,receive", global = true)]
    events: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single shard
    Shard {
        #[arg(long)]
        id: u32,

        /// Run as a child of `processes`: credential from stdin
        #[arg(long)]
        fork: bool,
    },

    /// Run a cluster of shards in this process
    Cluster {
        /// First shard id (inclusive)
        #[arg(long, conflicts_with = "ids")]
        min: Option<u32>,

        /// Last shard id (exclusive)
        #[arg(long, conflicts_with = "ids")]
        max: Option<u32>,

        /// Explicit shard ids
        #[arg(long, value_delimiter = ',')]
        ids: Vec<u32>,

        /// Run as a child of `processes`: credential from stdin
        #[arg(long)]
        fork: bool,
    },

    /// Spread shard ranges over child processes
    Processes {
        /// Ranges as `min..max`, one child each
        #[arg(long, num_args = 1.., value_parser = parse_range, required = true)]
        ranges: Vec<Range<u32>>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries events, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("ws_gateway_cluster=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Shard { id, fork } => {
            run_cluster(cli.options, ShardSelector::One(id), fork).await?;
        }

        Commands::Cluster {
            min,
            max,
            ids,
            fork,
        } => {
            let selector = match (min, max) {
                _ if !ids.is_empty() => ShardSelector::Ids(ids),
                (None, None) => ShardSelector::All,
                (min, Some(max)) => ShardSelector::Range(min.unwrap_or(0)..max),
                (Some(min), None) => ShardSelector::Range(min..u32::MAX),
            };
            run_cluster(cli.options, selector, fork).await?;
        }

        Commands::Processes { ranges } => {
            run_processes(cli.options, ranges).await?;
        }
    }

    Ok(())
}

fn parse_range(s: &str) -> Result<Range<u32>, String> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| format!("expected min..max, got '{}'", s))?;
    let start = start.trim().parse().map_err(|e| format!("bad range start: {}", e))?;
    let end = end.trim().parse().map_err(|e| format!("bad range end: {}", e))?;
    Ok(start..end)
}

fn cluster_config(options: &Options, total: Option<u32>) -> anyhow::Result<ClusterConfig> {
    let mut builder = ClusterConfig::builder()
        .gateway(GatewayConfig {
            discovery_url: options.discovery_url.clone(),
            ..Default::default()
        })
        .encoding(options.encoding)
        .compression(options.compression);
    if let Some(total) = total {
        builder = builder.shard_count(total);
    }
    Ok(builder.build()?)
}

async fn run_cluster(options: Options, selector: ShardSelector, fork: bool) -> anyhow::Result<()> {
    let mut input = ipc::reader(tokio::io::stdin());

    let (token, total) = if fork {
        match ipc::read_message::<ParentMessage, _>(&mut input).await? {
            Some(ParentMessage::Credential { token, shard_count }) => {
                (token, shard_count.or(options.total))
            }
            Some(_) => bail!("first message from parent must be the credential"),
            None => bail!("parent closed the channel before sending the credential"),
        }
    } else {
        let token = options
            .token
            .clone()
            .context("no credential: set GATEWAY_TOKEN or pass --token")?;
        (token, options.total)
    };

    let config = cluster_config(&options, total)?;
    let cluster = Arc::new(Cluster::new(&token, config)?);
    let ids = cluster.spawn(selector).await?;
    info!("Spawned shards {:?}", ids);

    let relay = RelayOptions {
        events: Some(options.events.iter().cloned().collect::<HashSet<_>>()),
        stop_on_eof: fork,
    };
    ipc::run_child(cluster.clone(), input, tokio::io::stdout(), relay).await?;

    cluster.kill(None).await;
    Ok(())
}

async fn run_processes(options: Options, ranges: Vec<Range<u32>>) -> anyhow::Result<()> {
    let token = options
        .token
        .clone()
        .context("no credential: set GATEWAY_TOKEN or pass --token")?;

    let mut config = ProcessConfig::current_exe(token)?;
    config.shard_count = options.total;
    config.args.extend([
        "--discovery-url".into(),
        options.discovery_url.clone().into(),
        "--encoding".into(),
        options.encoding.query_value().into(),
        "--compression".into(),
        options.compression.query_value().unwrap_or("none").into(),
        "--events".into(),
        options.events.join(",").into(),
    ]);

    let mut processes = ProcessCluster::new(config, ranges)?;
    let mut events = processes.subscribe();
    processes.start().await?;
    let mut input = Some(ipc::reader(tokio::io::stdin()));
    let mut output = ipc::writer(tokio::io::stdout());
    let mut alive = processes.table().len();

    while alive > 0 {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ProcessEvent::Shard { shard_id, event, data }) => {
                    let message = ChildMessage::Event { shard: shard_id, event, data };
                    ipc::write_message(&mut output, &message).await?;
                }
                Ok(ProcessEvent::ChildExited { range, status }) => {
                    warn!("Shards {}..{} are down (exit {:?})", range.start, range.end, status);
                    alive -= 1;
                }
                Err(e) => warn!("Event relay: {}", e),
            },
            message = next_line(&mut input) => match message {
                Ok(Some(ParentMessage::Send { shard, data })) => {
                    if let Err(e) = processes.send(shard, data).await {
                        warn!("[SHARD-{}] {}", shard, e);
                    }
                }
                Ok(Some(ParentMessage::Credential { .. })) => {}
                Ok(None) => input = None,
                Err(e) => warn!("Dropping input line: {}", e),
            },
        }
    }

    info!("All children exited");
    Ok(())
}

async fn next_line(
    input: &mut Option<ipc::LineReader<tokio::io::Stdin>>,
) -> ws_gateway_cluster::Result<Option<ParentMessage>> {
    match input {
        Some(reader) => ipc::read_message(reader).await,
        None => std::future::pending().await,
    }
}
