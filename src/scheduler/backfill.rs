use crate::bus::{listener, EventBus, NewBlock, ReloadReason};
use crate::error::IndexerResult;
use crate::indexer::{BlockIndexer, IndexStatsCache};
use crate::model::{AppliedBlock, BlockWrite, IndexStats};
use crate::queue::{IndexJob, JobQueue};
use crate::runtime::config::IndexerConfig;
use crate::runtime::telemetry::Telemetry;
use crate::store::IndexStore;
use crate::validators::ValidatorCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const NEW_BLOCK_BUFFER: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSettings {
    pub interval: Duration,
    /// Missing-height count above which a pass is reported as a backlog.
    pub skip_threshold: usize,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            skip_threshold: 1_000,
        }
    }
}

impl BackfillSettings {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            interval: config.backfill_interval(),
            skip_threshold: config.backfill_skip_threshold(),
        }
    }
}

/// Result of one full backfill pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub genesis_height: u64,
    pub chain_height: u64,
    /// Heights enqueued by this pass, ascending.
    pub missing: Vec<u64>,
    pub backlog: bool,
}

pub struct BackfillScheduler {
    store: Arc<dyn IndexStore>,
    indexer: Arc<BlockIndexer>,
    stats: Arc<IndexStatsCache>,
    queue: Arc<dyn JobQueue>,
    telemetry: Arc<Telemetry>,
    validators: Option<Arc<ValidatorCache>>,
    settings: BackfillSettings,
    /// Heights already queued by a pass and not yet seen as applied.
    outstanding: Mutex<HashSet<u64>>,
}

impl BackfillScheduler {
    pub fn new(
        store: Arc<dyn IndexStore>,
        indexer: Arc<BlockIndexer>,
        stats: Arc<IndexStatsCache>,
        queue: Arc<dyn JobQueue>,
        telemetry: Arc<Telemetry>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            store,
            indexer,
            stats,
            queue,
            telemetry,
            validators: None,
            settings,
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    /// Validator cache to repopulate on [`BackfillScheduler::rebuild`].
    pub fn with_validators(mut self, validators: Arc<ValidatorCache>) -> Self {
        self.validators = Some(validators);
        self
    }

    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    /// Enqueues the genesis height if the store lacks it. Returns whether a job was added.
    pub async fn schedule_genesis(&self) -> IndexerResult<bool> {
        let genesis = self.stats.get().await?.genesis_height;
        if self.store.block_by_height(genesis).await?.is_some() {
            return Ok(false);
        }
        tracing::info!(height = genesis, "genesis block not indexed yet");
        self.queue.add(IndexJob::at(genesis)).await?;
        Ok(true)
    }

    /// Enqueues one job per height missing from `[genesis, chain tip]`.
    pub async fn schedule_missing(&self) -> IndexerResult<BackfillReport> {
        let (stats, missing) = self.gaps().await?;
        let backlog = missing.len() > self.settings.skip_threshold;
        if backlog {
            self.telemetry.record_backlog(missing.len() as u64);
            tracing::warn!(
                missing = missing.len(),
                threshold = self.settings.skip_threshold,
                "backfill backlog above threshold"
            );
        }

        for height in &missing {
            self.queue.add(IndexJob::at(*height)).await?;
        }
        *self.outstanding.lock() = missing.iter().copied().collect();

        tracing::info!(
            genesis = stats.genesis_height,
            chain_height = stats.current_chain_height,
            missing = missing.len(),
            "backfill pass scheduled"
        );
        Ok(BackfillReport {
            genesis_height: stats.genesis_height,
            chain_height: stats.current_chain_height,
            missing,
            backlog,
        })
    }

    /// Low-latency path: queues the block's own height, then any hole not
    /// already queued. Returns how many jobs were added.
    pub async fn on_new_block(&self, applied: &AppliedBlock) -> IndexerResult<usize> {
        if applied.write == BlockWrite::Unchanged {
            return Ok(0);
        }
        let height = applied.indexed.block.height;
        self.outstanding.lock().remove(&height);
        self.queue.add(IndexJob::at(height)).await?;

        let (_, missing) = self.gaps().await?;
        let fresh: Vec<u64> = {
            let mut outstanding = self.outstanding.lock();
            missing
                .into_iter()
                .filter(|gap| outstanding.insert(*gap))
                .collect()
        };
        for gap in &fresh {
            self.queue.add(IndexJob::at(*gap)).await?;
        }
        if !fresh.is_empty() {
            tracing::debug!(height, gaps = fresh.len(), "queued gaps behind new block");
        }
        Ok(1 + fresh.len())
    }

    /// Queues an explicit fork reconciliation at `height`.
    pub async fn schedule_fork(&self, height: u64) -> IndexerResult<()> {
        tracing::info!(height, "scheduling fork reconciliation");
        self.queue.add(IndexJob::fork_at(height)).await
    }

    /// Startup sequence: genesis check followed by a full pass.
    pub async fn start(&self) -> IndexerResult<BackfillReport> {
        self.schedule_genesis().await?;
        self.schedule_missing().await
    }

    /// Drops everything indexed so far and schedules the whole chain again.
    pub async fn rebuild(&self) -> IndexerResult<BackfillReport> {
        tracing::warn!("rebuilding index from scratch");
        self.store.truncate_all().await?;
        self.indexer.reset();
        self.stats.invalidate();
        self.outstanding.lock().clear();

        if let Some(validators) = &self.validators {
            validators.bootstrap_from_node().await?;
            validators.reload(ReloadReason::Rebuild).await?;
        }
        self.start().await
    }

    async fn gaps(&self) -> IndexerResult<(IndexStats, Vec<u64>)> {
        let (stats, status) = self.stats.refresh_with_status().await?;
        self.indexer.observe_network_status(&status);
        if stats.current_chain_height < stats.genesis_height {
            return Ok((stats, Vec::new()));
        }
        let missing = self
            .indexer
            .missing_heights(stats.genesis_height, stats.current_chain_height)
            .await?;
        Ok((stats, missing))
    }

    /// Reacts to `NewBlock` on a dedicated task.
    pub fn attach(self: &Arc<Self>, bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let (sender, mut receiver) = mpsc::channel::<AppliedBlock>(NEW_BLOCK_BUFFER);
        bus.get::<NewBlock>()
            .add(listener(move |applied: &AppliedBlock| {
                if applied.write == BlockWrite::Unchanged {
                    return Ok(());
                }
                sender
                    .try_send(applied.clone())
                    .map_err(|err| anyhow::anyhow!("new block not queued for scheduling: {err}"))
            }));

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let applied = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    applied = receiver.recv() => match applied {
                        Some(applied) => applied,
                        None => break,
                    },
                };
                if let Err(err) = scheduler.on_new_block(&applied).await {
                    tracing::warn!(
                        height = applied.indexed.block.height,
                        error = %err,
                        "continuation scheduling failed"
                    );
                }
            }
            tracing::debug!("scheduler block task stopped");
        })
    }

    /// Runs a full pass every configured interval until `shutdown` fires.
    pub fn spawn_periodic(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let interval = self.settings.interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("periodic backfill shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.schedule_missing().await {
                            tracing::warn!(error = %err, "periodic backfill failed");
                        }
                    }
                }
            }
        })
    }
}
