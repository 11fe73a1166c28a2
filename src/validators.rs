//! In-memory projection of the validator set.
//!
//! The cache holds an immutable, rank-ordered snapshot that readers clone
//! cheaply. Writers (block patches, reloads) are serialized, build a new
//! snapshot off to the side, persist it, and then swap it in, so a reader
//! never observes a half-applied patch.

pub mod audit;
mod patch;
pub mod query;
pub mod rank;
pub mod status;

pub use audit::AuditOutcome;
pub use query::{ValidatorQuery, ValidatorSort, ValidatorSortField};
pub use rank::compute_rank;
pub use status::{apply_statuses, compute_status, StatusContext};

use crate::bus::{listener, DeleteBlock, EventBus, NewBlock, ReloadReason, ReloadValidators};
use crate::error::{find_indexer_error, IndexerError, IndexerResult};
use crate::indexer::HeightPointer;
use crate::model::{AppliedBlock, BlockWrite, IndexedBlock, NodeValidator, Validator};
use crate::node::NodeClient;
use crate::queue::{retry_with_backoff, RetryDisposition, RetryPolicy};
use crate::runtime::config::IndexerConfig;
use crate::runtime::telemetry::Telemetry;
use crate::store::{IndexStore, Page};
use futures::stream::{self, StreamExt, TryStreamExt};
use num_bigint::BigUint;
use parking_lot::RwLock;
use patch::{BlockPatch, Direction};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CACHE_EVENT_BUFFER: usize = 1_024;
const EVENT_RETRY_INITIAL: Duration = Duration::from_millis(50);
const EVENT_RETRY_MAX: Duration = Duration::from_secs(2);
const EVENT_RETRY_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorCacheSettings {
    /// Size of the active generator set.
    pub active_validators: usize,
    pub min_eligible_weight: BigUint,
    /// Upper bound on concurrent node lookups while patching.
    pub patch_concurrency: usize,
}

impl Default for ValidatorCacheSettings {
    fn default() -> Self {
        Self {
            active_validators: 101,
            min_eligible_weight: BigUint::from(100_000_000_000u64),
            patch_concurrency: 8,
        }
    }
}

impl ValidatorCacheSettings {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            active_validators: config.active_validators(),
            min_eligible_weight: config.min_eligible_weight().clone(),
            patch_concurrency: config.patch_concurrency(),
        }
    }

    pub fn is_eligible(&self, validator: &Validator) -> bool {
        !validator.is_banned && validator.weight >= self.min_eligible_weight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Nothing differed from the current snapshot; no write happened.
    Skipped,
    Patched { reranked: bool },
}

enum CacheEvent {
    Applied(AppliedBlock),
    Reverted(IndexedBlock),
    Reload(ReloadReason),
}

impl CacheEvent {
    fn describe(&self) -> String {
        match self {
            CacheEvent::Applied(applied) => format!("apply {}", applied.indexed.block.height),
            CacheEvent::Reverted(removed) => format!("revert {}", removed.block.height),
            CacheEvent::Reload(reason) => format!("reload {reason:?}"),
        }
    }
}

pub struct ValidatorCache {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    telemetry: Arc<Telemetry>,
    settings: ValidatorCacheSettings,
    snapshot: RwLock<Arc<Vec<Validator>>>,
    generators: RwLock<Arc<Vec<String>>>,
    height: HeightPointer,
    write_lock: AsyncMutex<()>,
    event_retry: RetryPolicy,
    resync: AtomicBool,
    reloads: AtomicU64,
    patches: AtomicU64,
}

impl ValidatorCache {
    pub fn new(
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
        telemetry: Arc<Telemetry>,
        settings: ValidatorCacheSettings,
    ) -> Self {
        Self {
            store,
            node,
            telemetry,
            settings,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            generators: RwLock::new(Arc::new(Vec::new())),
            height: HeightPointer::new(),
            write_lock: AsyncMutex::new(()),
            event_retry: RetryPolicy::new(EVENT_RETRY_INITIAL, EVENT_RETRY_MAX, EVENT_RETRY_ATTEMPTS),
            resync: AtomicBool::new(false),
            reloads: AtomicU64::new(0),
            patches: AtomicU64::new(0),
        }
    }

    /// Backoff applied to bus events whose patch fails.
    pub fn with_event_retry(mut self, policy: RetryPolicy) -> Self {
        self.event_retry = policy;
        self
    }

    pub fn settings(&self) -> &ValidatorCacheSettings {
        &self.settings
    }

    /// Current rank-ordered snapshot.
    pub fn snapshot(&self) -> Arc<Vec<Validator>> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn get(&self, address: &str) -> Option<Validator> {
        self.snapshot()
            .iter()
            .find(|validator| validator.address == address)
            .cloned()
    }

    pub fn list(&self, query: &ValidatorQuery) -> IndexerResult<Page<Validator>> {
        query.apply(&self.snapshot())
    }

    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn patch_count(&self) -> u64 {
        self.patches.load(Ordering::Relaxed)
    }

    /// Seeds an empty store with the node's full validator list. Returns how many were written.
    pub async fn bootstrap_from_node(&self) -> IndexerResult<usize> {
        if !self.store.validators().await?.is_empty() {
            return Ok(0);
        }

        let validators = self
            .node
            .get_all_validators()
            .await?
            .into_iter()
            .map(NodeValidator::into_validator)
            .collect::<IndexerResult<Vec<_>>>()?;
        let count = validators.len();
        if count > 0 {
            self.store.upsert_validators(validators).await?;
        }
        tracing::info!(count, "seeded validators from node");
        Ok(count)
    }

    /// Replaces the snapshot with a full recomputation from the store. Block
    /// counters are taken from the store's generator tallies.
    pub async fn reload(&self, reason: ReloadReason) -> IndexerResult<usize> {
        let _guard = self.write_lock.lock().await;

        let mut validators = self.store.validators().await?;
        let tallies = self.store.generator_tallies().await?;
        match self.node.get_network_status().await {
            Ok(status) => {
                self.height.advance(status.height);
            }
            Err(err) => {
                tracing::warn!(error = %err, "network status unavailable; statuses use last known height")
            }
        }
        self.refresh_generators().await;

        let mut drifted = BTreeSet::new();
        for validator in validators.iter_mut() {
            let tally = tallies.get(&validator.address).cloned().unwrap_or_default();
            if validator.sync_counters(&tally) {
                drifted.insert(validator.address.clone());
            }
        }
        self.derive(&mut validators, true);

        if !drifted.is_empty() {
            let rows: Vec<Validator> = validators
                .iter()
                .filter(|validator| drifted.contains(&validator.address))
                .cloned()
                .collect();
            // Counters are re-derived on every reload, so a failed repair only delays the store.
            if let Err(err) = self.store.apply_validator_patch(Vec::new(), rows).await {
                tracing::warn!(error = %err, drifted = drifted.len(), "stored validator counters not repaired");
            }
        }

        let count = validators.len();
        *self.snapshot.write() = Arc::new(validators);
        self.reloads.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_validator_reload();
        tracing::info!(reason = ?reason, count, drifted = drifted.len(), "validator cache reloaded");
        Ok(count)
    }

    /// Patches node-owned fields and block counters for a newly persisted block.
    /// An `Unchanged` write only re-reads its generator's counters.
    pub async fn on_block_applied(&self, applied: &AppliedBlock) -> IndexerResult<PatchOutcome> {
        let patches = match &applied.write {
            BlockWrite::Unchanged => {
                vec![BlockPatch::new(&applied.indexed, Direction::Apply).counters_only()]
            }
            BlockWrite::Inserted => vec![BlockPatch::new(&applied.indexed, Direction::Apply)],
            BlockWrite::Replaced(previous) => vec![
                BlockPatch::new(previous, Direction::Revert),
                BlockPatch::new(&applied.indexed, Direction::Apply),
            ],
        };
        self.height.advance(applied.indexed.block.height);
        self.patch(patches).await
    }

    /// Undoes the effect of a block that was removed from the store.
    pub async fn on_block_reverted(&self, removed: &IndexedBlock) -> IndexerResult<PatchOutcome> {
        self.patch(vec![BlockPatch::new(removed, Direction::Revert)])
            .await
    }

    async fn patch(&self, patches: Vec<BlockPatch>) -> IndexerResult<PatchOutcome> {
        let _guard = self.write_lock.lock().await;
        self.refresh_generators().await;

        let before = self.snapshot();
        let mut validators = before.as_ref().clone();

        let reregistered: BTreeSet<&String> = patches
            .iter()
            .filter(|patch| patch.direction == Direction::Apply)
            .flat_map(|patch| patch.registrations.iter())
            .collect();
        let removed: BTreeSet<String> = patches
            .iter()
            .flat_map(BlockPatch::unregistered)
            .filter(|address| !reregistered.contains(address))
            .filter(|address| position(&validators, address.as_str()).is_some())
            .cloned()
            .collect();
        validators.retain(|validator| !removed.contains(&validator.address));

        let generators: BTreeSet<&String> = patches.iter().map(|patch| &patch.generator).collect();
        let mut lookups: BTreeSet<String> = patches
            .iter()
            .flat_map(|patch| patch.touched.iter().cloned())
            .collect();
        for generator in &generators {
            if position(&validators, generator.as_str()).is_none() {
                lookups.insert((*generator).clone());
            }
        }
        lookups.retain(|address| !removed.contains(address));

        let mut reranked = !removed.is_empty();
        for (address, remote) in self.fetch_validators(lookups).await? {
            match (remote, position(&validators, &address)) {
                (Some(remote), Some(index)) => {
                    reranked |= remote.merge_into(&mut validators[index])?;
                }
                (Some(remote), None) => {
                    validators.push(remote.into_validator()?);
                    reranked = true;
                }
                (None, Some(_)) => {
                    tracing::warn!(address = %address, "node no longer reports cached validator; keeping it")
                }
                (None, None) => tracing::debug!(address = %address, "validator unknown to node"),
            }
        }

        for generator in generators {
            let tally = self.store.generator_tally(generator).await?;
            match position(&validators, generator) {
                Some(index) => {
                    validators[index].sync_counters(&tally);
                }
                None => tracing::warn!(
                    generator = %generator,
                    "block generator is not a known validator"
                ),
            }
        }

        self.derive(&mut validators, reranked);

        let batch: Vec<Validator> = validators
            .iter()
            .filter(|validator| {
                position(&before, &validator.address)
                    .map_or(true, |index| before[index] != **validator)
            })
            .cloned()
            .collect();
        if removed.is_empty() && batch.is_empty() {
            return Ok(PatchOutcome::Skipped);
        }

        self.store
            .apply_validator_patch(removed.into_iter().collect(), batch)
            .await?;

        *self.snapshot.write() = Arc::new(validators);
        self.patches.fetch_add(1, Ordering::Relaxed);
        Ok(PatchOutcome::Patched { reranked })
    }

    async fn fetch_validators(
        &self,
        addresses: BTreeSet<String>,
    ) -> IndexerResult<Vec<(String, Option<NodeValidator>)>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let limit = addresses.len().min(self.settings.patch_concurrency).max(1);
        let node = &self.node;
        let mut fetched: Vec<_> = stream::iter(addresses)
            .map(|address| async move {
                let remote = node.get_validator(&address).await?;
                Ok::<_, IndexerError>((address, remote))
            })
            .buffer_unordered(limit)
            .try_collect()
            .await?;
        fetched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(fetched)
    }

    async fn refresh_generators(&self) {
        match self.node.get_generator_list().await {
            Ok(generators) => *self.generators.write() = Arc::new(generators),
            Err(err) => {
                tracing::warn!(error = %err, "generator list unavailable; keeping previous one")
            }
        }
    }

    fn derive(&self, validators: &mut [Validator], rerank: bool) {
        if rerank {
            compute_rank(validators);
        }
        let generators = Arc::clone(&self.generators.read());
        let context = StatusContext::new(
            self.height.get().unwrap_or(0),
            &generators,
            self.settings.active_validators,
            &self.settings.min_eligible_weight,
        );
        apply_statuses(validators, &context);
    }

    /// Subscribes to block and reload signals. Events are handled one at a time, in order.
    /// An event that cannot be queued or keeps failing leads to a resync reload.
    pub fn attach(self: &Arc<Self>, bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let (sender, mut receiver) = mpsc::channel::<CacheEvent>(CACHE_EVENT_BUFFER);

        let enqueue = {
            let cache = Arc::clone(self);
            move |event: CacheEvent| {
                sender.try_send(event).map_err(|err| {
                    cache.resync.store(true, Ordering::SeqCst);
                    anyhow::anyhow!("validator cache event not queued: {err}")
                })
            }
        };
        let enqueue = Arc::new(enqueue);

        let applied = Arc::clone(&enqueue);
        bus.get::<NewBlock>()
            .add(listener(move |block: &AppliedBlock| {
                applied(CacheEvent::Applied(block.clone()))
            }));
        let reverted = Arc::clone(&enqueue);
        bus.get::<DeleteBlock>()
            .add(listener(move |block: &IndexedBlock| {
                reverted(CacheEvent::Reverted(block.clone()))
            }));
        bus.get::<ReloadValidators>()
            .add(listener(move |reason: &ReloadReason| {
                enqueue(CacheEvent::Reload(reason.clone()))
            }));

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                cache.handle_event(event, &shutdown).await;
            }
            tracing::debug!("validator cache task stopped");
        })
    }

    async fn handle_event(&self, event: CacheEvent, shutdown: &CancellationToken) {
        let description = event.describe();
        let event = &event;
        let outcome = retry_with_backoff(
            self.event_retry,
            shutdown,
            |_| async move { self.process(event).await.map_err(anyhow::Error::from) },
            |err| match find_indexer_error(err) {
                Some(err) if !err.is_transient() => RetryDisposition::Abort,
                _ => RetryDisposition::Retry,
            },
            |attempt, delay, err, will_retry| {
                if will_retry {
                    tracing::warn!(
                        event = %description,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "validator cache event failed; retrying"
                    );
                }
            },
        )
        .await;

        if let Err(err) = outcome {
            if shutdown.is_cancelled() {
                return;
            }
            tracing::error!(event = %description, error = %err, "validator cache event dropped; resyncing");
            self.resync.store(true, Ordering::SeqCst);
        }

        if self.resync.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.reload(ReloadReason::Resync).await {
                tracing::warn!(error = %err, "validator resync failed; the audit will retry it");
                self.resync.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn process(&self, event: &CacheEvent) -> IndexerResult<()> {
        match event {
            CacheEvent::Applied(applied) => self.on_block_applied(applied).await.map(|_| ()),
            CacheEvent::Reverted(removed) => self.on_block_reverted(removed).await.map(|_| ()),
            CacheEvent::Reload(reason) => self.reload(reason.clone()).await.map(|_| ()),
        }
    }
}

fn position(validators: &[Validator], address: &str) -> Option<usize> {
    validators
        .iter()
        .position(|validator| validator.address == address)
}
