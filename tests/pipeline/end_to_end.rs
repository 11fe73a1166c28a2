use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chainview::queue::RetryPolicy;
use chainview::store::BlockQuery;
use chainview::{
    listener, AppliedBlock, BackfillScheduler, BackfillSettings, BlockIndexer, EventBus,
    IndexStatsCache, IndexStore, JobHandler, JobQueue, MemoryJobQueue, MemoryStore,
    NodeClient, NodeDeleteBlock, NodeNewBlock, ReloadReason, Telemetry, ValidatorCache,
    ValidatorCacheSettings,
};
use futures::future::BoxFuture;
use num_bigint::BigUint;
use tokio_util::sync::CancellationToken;

use crate::support::helpers::{
    block_on_branch, canonical_chain, init_tracing, wait_for, RecordingQueue, BLOCK_REWARD,
    GENERATORS,
};
use crate::support::mock_node::MockChain;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    chain: MockChain,
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    indexer: Arc<BlockIndexer>,
    stats: Arc<IndexStatsCache>,
    validators: Arc<ValidatorCache>,
    shutdown: CancellationToken,
}

impl Harness {
    async fn new(chain: MockChain) -> Result<Self> {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let node: Arc<dyn NodeClient> = Arc::new(chain.clone());
        let bus = Arc::new(EventBus::new());
        let telemetry = Arc::new(Telemetry::default());
        let shutdown = CancellationToken::new();

        let indexer = Arc::new(BlockIndexer::new(
            store.clone(),
            Arc::clone(&node),
            Arc::clone(&bus),
            Arc::clone(&telemetry),
            16,
        ));
        let stats = Arc::new(IndexStatsCache::new(store.clone(), Arc::clone(&node)));
        stats.attach(&bus);

        let validators = Arc::new(ValidatorCache::new(
            store.clone(),
            node,
            Arc::clone(&telemetry),
            ValidatorCacheSettings {
                active_validators: 2,
                min_eligible_weight: BigUint::from(1_000_000_000u64),
                patch_concurrency: 4,
            },
        ));
        validators.bootstrap_from_node().await?;
        validators.reload(ReloadReason::Startup).await?;
        validators.attach(&bus, shutdown.child_token());

        Ok(Self {
            chain,
            store,
            bus,
            telemetry,
            indexer,
            stats,
            validators,
            shutdown,
        })
    }

    fn scheduler(&self, queue: Arc<dyn JobQueue>) -> BackfillScheduler {
        BackfillScheduler::new(
            self.store.clone(),
            Arc::clone(&self.indexer),
            Arc::clone(&self.stats),
            queue,
            Arc::clone(&self.telemetry),
            BackfillSettings::default(),
        )
    }

    async fn apply(&self, height: u64) -> Result<AppliedBlock> {
        let raw = self
            .chain
            .block(height)
            .with_context(|| format!("mock chain has no block {height}"))?;
        Ok(self.indexer.apply_block(&raw).await?)
    }

    fn produced(&self, address: &str) -> u64 {
        self.validators
            .get(address)
            .map(|validator| validator.produced_blocks)
            .unwrap_or_default()
    }

    fn produced_total(&self) -> u64 {
        self.validators
            .snapshot()
            .iter()
            .map(|validator| validator.produced_blocks)
            .sum()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn apply_delete_and_backfill_keep_the_view_consistent() -> Result<()> {
    let harness = Harness::new(MockChain::new(canonical_chain(6))).await?;
    let announcements = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&announcements);
    harness
        .bus
        .get::<chainview::NewBlock>()
        .add(listener(move |_: &AppliedBlock| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    harness.apply(0).await?;
    assert_eq!(announcements.load(Ordering::SeqCst), 1);
    assert_eq!(harness.stats.get().await?.genesis_height, 0);

    for height in 1..=5 {
        harness.apply(height).await?;
    }
    wait_for(WAIT, || async { harness.validators.patch_count() == 6 }).await?;
    for generator in GENERATORS {
        assert_eq!(harness.produced(generator), 2, "{generator}");
        assert_eq!(
            harness.validators.get(generator).map(|v| v.rewards),
            Some(BigUint::from(2 * BLOCK_REWARD))
        );
    }

    let tip = harness
        .store
        .block_by_height(5)
        .await?
        .context("height 5 should be indexed")?;
    let removed = harness.indexer.delete_block(&tip).await?;
    assert!(removed.is_some());
    assert!(harness.store.block_by_height(5).await?.is_none());
    wait_for(WAIT, || async { harness.validators.patch_count() == 7 }).await?;
    assert_eq!(harness.produced(&tip.generator_address), 1);

    let queue = Arc::new(RecordingQueue::default());
    harness.chain.set_finalized(2);
    let report = harness.scheduler(queue.clone()).schedule_missing().await?;
    assert_eq!(report.chain_height, 5);
    assert_eq!(report.genesis_height, 0);
    assert_eq!(report.missing, vec![5]);
    assert_eq!(queue.heights(), vec![5]);

    let page = harness.indexer.list_blocks(&BlockQuery::default()).await?;
    let finality: Vec<(u64, bool)> = page
        .data
        .iter()
        .map(|block| (block.height, block.is_final))
        .collect();
    assert_eq!(
        finality,
        vec![(4, false), (3, false), (2, true), (1, true), (0, true)]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fork_job_swaps_the_divergent_branch() -> Result<()> {
    let harness = Harness::new(MockChain::new(canonical_chain(8))).await?;
    for height in 0..8 {
        harness.apply(height).await?;
    }

    let fork: Vec<_> = (0..10).map(|height| block_on_branch(height, 1, 4)).collect();
    harness.chain.replace_blocks(fork.clone());

    let queue = Arc::new(MemoryJobQueue::new(
        1,
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 3),
        harness.shutdown.child_token(),
    ));
    let indexer = Arc::clone(&harness.indexer);
    let handler: JobHandler = Arc::new(move |job| {
        let indexer = Arc::clone(&indexer);
        Box::pin(async move { indexer.index_job(job).await.map_err(anyhow::Error::from) })
            as BoxFuture<'static, Result<()>>
    });
    queue.process(handler)?;

    let scheduler = harness.scheduler(queue.clone());
    scheduler.schedule_fork(7).await?;
    scheduler.schedule_missing().await?;
    queue.wait_idle().await;

    for raw in &fork {
        let stored = harness
            .store
            .block_by_height(raw.header.height)
            .await?
            .with_context(|| format!("height {} missing", raw.header.height))?;
        assert_eq!(stored.id, raw.header.id, "height {}", raw.header.height);
    }
    assert!(queue.failed_jobs().is_empty());
    assert_eq!(harness.telemetry.snapshot().blocks_reverted, 3);

    wait_for(WAIT, || async { harness.produced_total() == 10 }).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_announcements_drive_the_pipeline() -> Result<()> {
    let harness = Harness::new(MockChain::new(canonical_chain(3))).await?;
    let _task = harness.indexer.attach(harness.shutdown.child_token());

    for height in 0..3 {
        let raw = harness.chain.block(height).context("block exists")?;
        harness.bus.dispatch::<NodeNewBlock>(&raw);
    }
    wait_for(WAIT, || async {
        harness.store.count_blocks().await.ok() == Some(3)
    })
    .await?;
    assert_eq!(harness.indexer.last_seen_height(), Some(2));

    let rolled_back = harness.chain.block(2).context("block exists")?;
    harness.bus.dispatch::<NodeDeleteBlock>(&rolled_back);
    wait_for(WAIT, || async {
        harness.store.count_blocks().await.ok() == Some(2)
    })
    .await?;
    assert!(harness.store.block_by_height(2).await?.is_none());

    wait_for(WAIT, || async { harness.produced_total() == 2 }).await?;
    Ok(())
}
