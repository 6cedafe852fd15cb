//! # Key-Partitioned Parallel Engine
//!
//! Runs one [`Materializer`] per shard on its own tokio task. Each shard
//! exclusively owns the keys the [`KeyRouter`] sends it and drains its
//! channel in order, so merges for a key never overlap while different keys
//! proceed in parallel. There is no global lock.
//!
//! ```text
//!              ┌─▶ shard 0 ─▶ Materializer (keys h%4 == 0)
//! submit ─▶ router ─▶ shard 1 ─▶ Materializer (keys h%4 == 1)
//!              ├─▶ shard 2 ─▶ ...
//!              └─▶ shard 3 ─▶ ...
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use chronicle::{ParallelConfig, ShardedMaterializer};
//!
//! let engine = ShardedMaterializer::spawn(description, ParallelConfig::default())?;
//! let report = engine.submit(event).await?;
//! let snapshot = engine.snapshot().await?;
//! engine.shutdown().await?;
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::{MaterializationPolicy, PipelineDescription};
use crate::dispatcher::{EventReport, Materializer, TargetSnapshot};
use crate::error::{MaterializeError, Result};
use crate::event::RawEvent;
use crate::partitioner::KeyRouter;
use crate::stats::{MaterializeStats, MaterializeStatsSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Configuration for the parallel engine.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Number of shards (worker tasks)
    pub shards: usize,
    /// Pending commands buffered per shard
    pub channel_capacity: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            channel_capacity: 1024,
        }
    }
}

impl ParallelConfig {
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(MaterializeError::config("shards must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(MaterializeError::config("channel_capacity must be at least 1"));
        }
        Ok(())
    }
}

enum ShardCommand {
    Apply {
        raw: RawEvent,
        arrival: u64,
        reply: oneshot::Sender<EventReport>,
    },
    Snapshot {
        reply: oneshot::Sender<TargetSnapshot>,
    },
}

struct Shard {
    tx: mpsc::Sender<ShardCommand>,
    handle: JoinHandle<()>,
}

/// Pending outcome of a dispatched event.
#[derive(Debug)]
pub struct ReportHandle {
    shard: usize,
    rx: oneshot::Receiver<EventReport>,
}

impl ReportHandle {
    /// Wait until the owning shard has fully applied or rejected the event.
    pub async fn wait(self) -> Result<EventReport> {
        self.rx.await.map_err(|_| {
            MaterializeError::runtime(format!("shard {} dropped the event", self.shard))
        })
    }
}

/// Sharded materializer for one pipeline.
pub struct ShardedMaterializer {
    description: PipelineDescription,
    router: KeyRouter,
    shards: Vec<Shard>,
    stats: Arc<MaterializeStats>,
    next_arrival: AtomicU64,
}

impl std::fmt::Debug for ShardedMaterializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMaterializer")
            .field("pipeline", &self.description.name)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl ShardedMaterializer {
    /// Spawn shard workers on the current tokio runtime.
    pub fn spawn(description: PipelineDescription, config: ParallelConfig) -> Result<Self> {
        Self::spawn_with_clock(description, config, Arc::new(SystemClock))
    }

    /// Spawn with an explicit processing-time source.
    pub fn spawn_with_clock(
        description: PipelineDescription,
        config: ParallelConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        description.validate()?;

        // Append logs keep one total order, so a single shard does all the work
        let shard_count = match description.policy {
            MaterializationPolicy::Append => 1,
            _ => config.shards,
        };

        let stats = Arc::new(MaterializeStats::new());
        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let materializer = Materializer::with_clock(description.clone(), clock.clone())?
                .with_stats(stats.clone());
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            let handle = tokio::spawn(run_shard(index, materializer, rx));
            shards.push(Shard { tx, handle });
        }

        info!(
            "Started {} shard(s) for pipeline '{}'",
            shard_count, description.name
        );

        Ok(Self {
            router: KeyRouter::new(&description, shard_count as u32),
            description,
            shards,
            stats,
            next_arrival: AtomicU64::new(0),
        })
    }

    pub fn description(&self) -> &PipelineDescription {
        &self.description
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number and route an event without waiting for it to be applied.
    ///
    /// Events dispatched from one task reach their shard in dispatch order.
    pub async fn dispatch(&self, raw: RawEvent) -> Result<ReportHandle> {
        let arrival = self.next_arrival.fetch_add(1, Ordering::SeqCst);
        let shard = self.router.route(&raw) as usize;
        let (reply, rx) = oneshot::channel();

        self.shards[shard]
            .tx
            .send(ShardCommand::Apply {
                raw,
                arrival,
                reply,
            })
            .await
            .map_err(|_| MaterializeError::runtime(format!("shard {} is closed", shard)))?;

        Ok(ReportHandle { shard, rx })
    }

    /// Apply one event and wait for its outcome.
    pub async fn submit(&self, raw: RawEvent) -> Result<EventReport> {
        self.dispatch(raw).await?.wait().await
    }

    /// Merge the targets of all shards.
    ///
    /// Reflects every event whose dispatch completed before this call.
    pub async fn snapshot(&self) -> Result<TargetSnapshot> {
        let mut pending = Vec::with_capacity(self.shards.len());
        for (index, shard) in self.shards.iter().enumerate() {
            let (reply, rx) = oneshot::channel();
            shard
                .tx
                .send(ShardCommand::Snapshot { reply })
                .await
                .map_err(|_| MaterializeError::runtime(format!("shard {} is closed", index)))?;
            pending.push((index, rx));
        }

        let mut parts = Vec::with_capacity(pending.len());
        for (index, rx) in pending {
            parts.push(rx.await.map_err(|_| {
                MaterializeError::runtime(format!("shard {} dropped the snapshot request", index))
            })?);
        }
        Ok(TargetSnapshot::merge(self.description.policy, parts))
    }

    pub fn stats(&self) -> MaterializeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close all shard channels and wait for the workers to drain.
    pub async fn shutdown(self) -> Result<()> {
        info!("Stopping pipeline '{}'", self.description.name);
        for (index, shard) in self.shards.into_iter().enumerate() {
            drop(shard.tx);
            shard.handle.await.map_err(|e| {
                MaterializeError::runtime(format!("shard {} worker failed: {}", index, e))
            })?;
        }
        Ok(())
    }
}

async fn run_shard(index: usize, mut materializer: Materializer, mut rx: mpsc::Receiver<ShardCommand>) {
    debug!("Shard {} started", index);
    while let Some(command) = rx.recv().await {
        match command {
            ShardCommand::Apply {
                raw,
                arrival,
                reply,
            } => {
                let report = materializer.apply_with_arrival(raw, arrival);
                // Caller may have stopped waiting; the event is applied regardless
                let _ = reply.send(report);
            }
            ShardCommand::Snapshot { reply } => {
                let _ = reply.send(materializer.snapshot());
            }
        }
    }
    debug!("Shard {} stopped", index);
}
