//! Shards spread over child processes, one child cluster per id range.

use crate::error::Error;
use crate::ipc::{self, ChildMessage, ParentMessage};
use serde_json::Value;
use std::ffi::OsString;
use std::ops::Range;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

const CHILD_QUEUE: usize = 256;

/// Sorted, disjoint shard id ranges, each owned by one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTable {
    ranges: Vec<Range<u32>>,
}

impl RangeTable {
    /// Rejects empty ranges and overlaps.
    pub fn new(ranges: impl IntoIterator<Item = Range<u32>>) -> Result<Self, Error> {
        let mut ranges: Vec<Range<u32>> = ranges.into_iter().collect();
        if ranges.is_empty() {
            return Err(Error::OverlappingRanges("no ranges given".to_string()));
        }
        if let Some(empty) = ranges.iter().find(|r| r.is_empty()) {
            return Err(Error::OverlappingRanges(format!(
                "range {}..{} is empty",
                empty.start, empty.end
            )));
        }

        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(Error::OverlappingRanges(format!(
                    "{}..{} overlaps {}..{}",
                    pair[0].start, pair[0].end, pair[1].start, pair[1].end
                )));
            }
        }
        Ok(Self { ranges })
    }

    /// Index of the range containing `shard`.
    pub fn lookup(&self, shard: u32) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.end <= shard);
        self.ranges
            .get(idx)
            .filter(|r| r.contains(&shard))
            .map(|_| idx)
    }

    pub fn ranges(&self) -> &[Range<u32>] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// What the parent observes
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A shard event relayed by a child
    Shard {
        shard_id: u32,
        event: String,
        data: Value,
    },
    /// A child's channel closed; it is not restarted
    ChildExited {
        range: Range<u32>,
        status: Option<i32>,
    },
}

/// How children are started
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable; the current one by default
    pub program: PathBuf,
    /// Leading arguments; `--min A --max B --fork` is appended per child
    pub args: Vec<OsString>,
    pub token: String,
    pub shard_count: Option<u32>,
    pub event_buffer: usize,
}

impl ProcessConfig {
    /// Re-run this executable's `cluster` subcommand.
    pub fn current_exe(token: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["cluster".into()],
            token: token.into(),
            shard_count: None,
            event_buffer: 1024,
        })
    }
}

struct ChildHandle {
    range: Range<u32>,
    sender: mpsc::Sender<ParentMessage>,
    /// Set by the reader once the child's stdout closes
    exited: Arc<AtomicBool>,
}

impl ChildHandle {
    fn gone(&self) -> Error {
        Error::Ipc(format!(
            "child for shards {}..{} is gone",
            self.range.start, self.range.end
        ))
    }
}

/// Parent side: routes sends by id, relays child events, watches exits.
pub struct ProcessCluster {
    config: ProcessConfig,
    table: RangeTable,
    /// Same order as `table`
    children: Vec<ChildHandle>,
    events: broadcast::Sender<ProcessEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessCluster {
    /// Validate the ranges. No child runs until [`start`](Self::start), so
    /// subscribers attached in between see every event.
    pub fn new(config: ProcessConfig, ranges: impl IntoIterator<Item = Range<u32>>) -> Result<Self, Error> {
        let table = RangeTable::new(ranges)?;
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Ok(Self {
            config,
            table,
            children: Vec::new(),
            events,
            tasks: Vec::new(),
        })
    }

    /// Start one child per range.
    pub async fn start(&mut self) -> Result<(), Error> {
        if !self.children.is_empty() {
            return Ok(());
        }
        for range in self.table.ranges().to_vec() {
            let handle = self.start_child(range).await?;
            self.children.push(handle);
        }
        Ok(())
    }

    async fn start_child(&mut self, range: Range<u32>) -> Result<ChildHandle, Error> {
        let config = &self.config;
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .arg("--min")
            .arg(range.start.to_string())
            .arg("--max")
            .arg(range.end.to_string())
            .arg("--fork")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(Error::Ipc("child pipes unavailable".to_string())),
        };
        info!(
            "Started child {:?} for shards {}..{}",
            child.id(),
            range.start,
            range.end
        );

        let (sender, receiver) = mpsc::channel(CHILD_QUEUE);
        sender
            .send(ParentMessage::Credential {
                token: config.token.clone(),
                shard_count: config.shard_count,
            })
            .await
            .map_err(|_| Error::Ipc("child queue closed".to_string()))?;

        let exited = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(write_child(range.clone(), stdin, receiver));
        let reader = tokio::spawn(read_child(
            range.clone(),
            child,
            stdout,
            ChildExit {
                exited: exited.clone(),
                writer: writer.abort_handle(),
            },
            self.events.clone(),
        ));
        self.tasks.push(writer);
        self.tasks.push(reader);

        Ok(ChildHandle {
            range,
            sender,
            exited,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    pub fn table(&self) -> &RangeTable {
        &self.table
    }

    /// Forward `data` to the child that owns `shard`.
    pub async fn send(&self, shard: u32, data: Value) -> Result<(), Error> {
        let idx = self.table.lookup(shard).ok_or(Error::NoRoute(shard))?;
        let child = self
            .children
            .get(idx)
            .ok_or_else(|| Error::Ipc("children not started".to_string()))?;
        if child.exited.load(Ordering::Acquire) {
            return Err(child.gone());
        }
        child
            .sender
            .send(ParentMessage::Send { shard, data })
            .await
            .map_err(|_| child.gone())
    }
}

impl Drop for ProcessCluster {
    fn drop(&mut self) {
        // Aborting the reader drops the Child, which kills it
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

async fn write_child(range: Range<u32>, stdin: ChildStdin, mut receiver: mpsc::Receiver<ParentMessage>) {
    let mut output = ipc::writer(stdin);
    while let Some(message) = receiver.recv().await {
        if let Err(e) = ipc::write_message(&mut output, &message).await {
            warn!("Child {}..{} stopped accepting input: {}", range.start, range.end, e);
            break;
        }
    }
}

/// Reader-side hooks that retire a child's send path.
struct ChildExit {
    exited: Arc<AtomicBool>,
    writer: AbortHandle,
}

async fn read_child(
    range: Range<u32>,
    mut child: Child,
    stdout: ChildStdout,
    exit: ChildExit,
    events: broadcast::Sender<ProcessEvent>,
) {
    let mut input = ipc::reader(stdout);
    loop {
        match ipc::read_message::<ChildMessage, _>(&mut input).await {
            Ok(Some(ChildMessage::Event { shard, event, data })) => {
                let _ = events.send(ProcessEvent::Shard {
                    shard_id: shard,
                    event,
                    data,
                });
            }
            Ok(None) => break,
            Err(e) => debug!("Child {}..{}: {}", range.start, range.end, e),
        }
    }
    exit.exited.store(true, Ordering::Release);
    exit.writer.abort();

    let status = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to reap child {}..{}: {}", range.start, range.end, e);
            None
        }
    };
    error!(
        "Child for shards {}..{} exited ({:?}); not restarting",
        range.start, range.end, status
    );
    let _ = events.send(ProcessEvent::ChildExited { range, status });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_table_lookup() {
        let table = RangeTable::new([4..8, 0..4, 10..12]).unwrap();
        assert_eq!(table.ranges(), &[0..4, 4..8, 10..12]);
        assert_eq!(table.lookup(0), Some(0));
        assert_eq!(table.lookup(3), Some(0));
        assert_eq!(table.lookup(4), Some(1));
        assert_eq!(table.lookup(7), Some(1));
        assert_eq!(table.lookup(8), None);
        assert_eq!(table.lookup(9), None);
        assert_eq!(table.lookup(11), Some(2));
        assert_eq!(table.lookup(12), None);
    }

    #[test]
    fn test_range_table_rejects_overlap() {
        assert!(matches!(
            RangeTable::new([0..5, 4..8]),
            Err(Error::OverlappingRanges(_))
        ));
        assert!(matches!(
            RangeTable::new([3..3]),
            Err(Error::OverlappingRanges(_))
        ));
        assert!(matches!(
            RangeTable::new(Vec::new()),
            Err(Error::OverlappingRanges(_))
        ));
    }
}
