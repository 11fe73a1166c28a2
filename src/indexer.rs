//! Block application pipeline.
//!
//! Normalizes node blocks, persists them atomically, tracks the highest seen
//! height, notices parent mismatches, and republishes the canonical stored
//! shape on the bus. Reconciling a fork is a separate, explicit operation.

pub mod fork;
pub mod progress;
pub mod stats;

pub use fork::ForkWindow;
pub use progress::HeightPointer;
pub use stats::IndexStatsCache;

use crate::bus::{listener, DeleteBlock, EventBus, NewBlock, NodeDeleteBlock, NodeNewBlock};
use crate::error::{IndexerError, IndexerResult};
use crate::model::block::normalize_id;
use crate::model::{AppliedBlock, Block, BlockWrite, IndexedBlock, RawBlock, Transaction};
use crate::node::{NetworkStatus, NodeClient};
use crate::queue::IndexJob;
use crate::runtime::telemetry::Telemetry;
use crate::store::{BlockQuery, IndexStore, Page};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NODE_EVENT_BUFFER: usize = 1_024;

/// What a fork reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkReconciliation {
    /// Highest height where the store agrees with the node, if any was found.
    pub ancestor_height: Option<u64>,
    /// Heights removed, highest first.
    pub reverted: Vec<u64>,
    /// Heights re-indexed from the node, ascending.
    pub reapplied: Vec<u64>,
}

enum NodeEvent {
    Apply(RawBlock),
    Delete(RawBlock),
}

pub struct BlockIndexer {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    bus: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    window: Mutex<ForkWindow>,
    last_seen: HeightPointer,
    finalized: HeightPointer,
    reconcile: AsyncMutex<()>,
    unannounced: Mutex<HashMap<String, BlockWrite>>,
}

impl BlockIndexer {
    pub fn new(
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
        bus: Arc<EventBus>,
        telemetry: Arc<Telemetry>,
        fork_window_size: usize,
    ) -> Self {
        Self {
            store,
            node,
            bus,
            telemetry,
            window: Mutex::new(ForkWindow::new(fork_window_size)),
            last_seen: HeightPointer::new(),
            finalized: HeightPointer::new(),
            reconcile: AsyncMutex::new(()),
            unannounced: Mutex::new(HashMap::new()),
        }
    }

    /// Highest height applied by this process so far.
    pub fn last_seen_height(&self) -> Option<u64> {
        self.last_seen.get()
    }

    pub fn finalized_height(&self) -> Option<u64> {
        self.finalized.get()
    }

    pub fn observe_network_status(&self, status: &NetworkStatus) {
        self.finalized.advance(status.finalized_height);
    }

    pub async fn apply_block(&self, raw: &RawBlock) -> IndexerResult<AppliedBlock> {
        let (block, transactions) = raw.normalize()?;
        let mismatch = self.detect_parent_mismatch(&block);

        let write = self.store.apply_block(block.clone(), transactions).await?;
        if mismatch || matches!(write, BlockWrite::Replaced(_)) {
            self.telemetry.record_fork_detected();
        }
        if let BlockWrite::Replaced(displaced) = &write {
            tracing::warn!(
                height = block.height,
                displaced = %displaced.block.id,
                block_id = %block.id,
                "competing block replaced at height"
            );
        }

        self.last_seen.advance(block.height);
        self.window.lock().record(block.height, &block.id);

        let (stored, transactions) = match self.read_back(&block).await {
            Ok(read) => read,
            Err(err) => {
                self.hold_unannounced(&block.id, write);
                return Err(err);
            }
        };
        let write = self.take_unannounced(&block.id, write);

        if write != BlockWrite::Unchanged {
            self.telemetry.record_block_applied();
        }
        tracing::debug!(height = stored.height, block_id = %stored.id, ?write, "block applied");

        let applied = AppliedBlock {
            indexed: IndexedBlock {
                block: self.annotate(stored),
                transactions,
            },
            write,
        };
        self.bus.dispatch::<NewBlock>(&applied);
        Ok(applied)
    }

    /// Listeners get the stored row, never the raw input.
    async fn read_back(&self, block: &Block) -> IndexerResult<(Block, Vec<Transaction>)> {
        let stored = self.store.block_by_id(&block.id).await?.ok_or_else(|| {
            IndexerError::Consistency(format!(
                "block {} at height {} vanished right after being written",
                block.id, block.height
            ))
        })?;
        let transactions = self.store.block_transactions(&stored.id).await?;
        Ok((stored, transactions))
    }

    /// Keeps a committed write whose `newBlock` was never dispatched, so the
    /// retry announces it with its original outcome instead of `Unchanged`.
    fn hold_unannounced(&self, id: &str, write: BlockWrite) {
        if write == BlockWrite::Unchanged {
            return;
        }
        tracing::warn!(block_id = id, "block committed but not announced; holding for retry");
        self.unannounced.lock().insert(id.to_owned(), write);
    }

    fn take_unannounced(&self, id: &str, write: BlockWrite) -> BlockWrite {
        let held = self.unannounced.lock().remove(id);
        match (write, held) {
            (BlockWrite::Unchanged, Some(held)) => held,
            (write, _) => write,
        }
    }

    /// Removes `block` and its transactions. Signals `deleteBlock` only when a row was removed.
    pub async fn delete_block(&self, block: &Block) -> IndexerResult<Option<IndexedBlock>> {
        self.delete_block_by_id(&block.id).await
    }

    pub async fn delete_block_by_id(&self, id: &str) -> IndexerResult<Option<IndexedBlock>> {
        let Some(removed) = self.store.delete_block(id).await? else {
            tracing::debug!(block_id = id, "delete requested for a block that is not stored");
            return Ok(None);
        };

        self.window.lock().forget(removed.block.height);
        self.unannounced.lock().remove(&removed.block.id);
        self.telemetry.record_block_reverted();
        tracing::info!(
            height = removed.block.height,
            block_id = %removed.block.id,
            "block reverted"
        );

        let removed = IndexedBlock {
            block: self.annotate(removed.block),
            transactions: removed.transactions,
        };
        self.bus.dispatch::<DeleteBlock>(&removed);
        Ok(Some(removed))
    }

    /// Queue entry point: fetch and apply one height, or reconcile a fork there.
    pub async fn index_job(&self, job: IndexJob) -> IndexerResult<()> {
        if job.fork {
            let outcome = self.reconcile_fork(job.height).await?;
            tracing::info!(
                height = job.height,
                ancestor = ?outcome.ancestor_height,
                reverted = outcome.reverted.len(),
                reapplied = outcome.reapplied.len(),
                "fork reconciled"
            );
            return Ok(());
        }

        match self.node.get_block_by_height(job.height).await? {
            Some(raw) => {
                self.apply_block(&raw).await?;
            }
            None => {
                tracing::warn!(height = job.height, "node has no block at height; dropping job");
            }
        }
        Ok(())
    }

    /// Walks down from the highest stored block until the store and the node
    /// agree, then reverts every divergent block above that point and re-indexes
    /// the node's blocks for those heights. Nothing is touched when no common
    /// ancestor shows up within the fork window.
    pub async fn reconcile_fork(&self, height: u64) -> IndexerResult<ForkReconciliation> {
        let _guard = self.reconcile.lock().await;
        let mut outcome = ForkReconciliation::default();

        let Some(tip) = self.store.last_indexed_block().await? else {
            return Ok(outcome);
        };
        let max_depth = self.window.lock().limit();
        let top = tip.height.max(height);
        let mut cursor = top;
        let mut divergent = Vec::new();
        let mut reached_genesis = false;

        for _ in 0..max_depth {
            let stored = self.store.block_by_height(cursor).await?;
            if let Some(stored) = stored {
                let canonical_id = self
                    .node
                    .get_block_by_height(cursor)
                    .await?
                    .map(|raw| normalize_id("id", &raw.header.id))
                    .transpose()?;
                if canonical_id.as_deref() == Some(stored.id.as_str()) {
                    outcome.ancestor_height = Some(cursor);
                    break;
                }
                divergent.push(stored);
            }

            match cursor.checked_sub(1) {
                Some(next) => cursor = next,
                None => {
                    reached_genesis = true;
                    break;
                }
            }
        }

        if outcome.ancestor_height.is_none() && !reached_genesis {
            return Err(IndexerError::Consistency(format!(
                "no common ancestor within {max_depth} blocks below height {top}"
            )));
        }

        for block in &divergent {
            self.delete_block(block).await?;
            outcome.reverted.push(block.height);
        }

        for height in outcome.reverted.iter().rev().copied() {
            if let Some(raw) = self.node.get_block_by_height(height).await? {
                self.apply_block(&raw).await?;
                outcome.reapplied.push(height);
            }
        }
        Ok(outcome)
    }

    pub async fn list_blocks(&self, query: &BlockQuery) -> IndexerResult<Page<Block>> {
        let page = self.store.list_blocks(query).await?;
        Ok(Page {
            data: page
                .data
                .into_iter()
                .map(|block| self.annotate(block))
                .collect(),
            total: page.total,
        })
    }

    pub async fn block_by_id(&self, id: &str) -> IndexerResult<Block> {
        let id = normalize_id("id", id)?;
        self.store
            .block_by_id(&id)
            .await?
            .map(|block| self.annotate(block))
            .ok_or_else(|| IndexerError::not_found("block", id))
    }

    /// Heights in `[from, to]` that have no stored block.
    pub async fn missing_heights(&self, from: u64, to: u64) -> IndexerResult<Vec<u64>> {
        if from > to {
            return Err(IndexerError::validation(
                "range",
                format!("start {from} is above end {to}"),
            ));
        }
        self.store.missing_heights(from, to).await
    }

    /// Forgets in-memory pointers; used by a full rebuild.
    pub fn reset(&self) {
        self.window.lock().clear();
        self.unannounced.lock().clear();
        self.last_seen.reset();
    }

    /// Applies node block announcements and rollbacks on a dedicated task, in arrival order.
    pub fn attach(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let (sender, mut receiver) = mpsc::channel::<NodeEvent>(NODE_EVENT_BUFFER);

        let apply_sender = sender.clone();
        self.bus
            .get::<NodeNewBlock>()
            .add(listener(move |raw: &RawBlock| {
                apply_sender
                    .try_send(NodeEvent::Apply(raw.clone()))
                    .map_err(|err| anyhow::anyhow!("node block {} not queued: {err}", raw.height()))
            }));
        self.bus
            .get::<NodeDeleteBlock>()
            .add(listener(move |raw: &RawBlock| {
                sender
                    .try_send(NodeEvent::Delete(raw.clone()))
                    .map_err(|err| anyhow::anyhow!("node rollback {} not queued: {err}", raw.height()))
            }));

        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                indexer.handle_node_event(event).await;
            }
            tracing::debug!("node event task stopped");
        })
    }

    async fn handle_node_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::Apply(raw) => {
                if let Err(err) = self.apply_block(&raw).await {
                    // The backfill pass will pick the height up again.
                    tracing::warn!(height = raw.height(), error = %err, "live block apply failed");
                }
            }
            NodeEvent::Delete(raw) => {
                let result = match normalize_id("id", &raw.header.id) {
                    Ok(id) => self.delete_block_by_id(&id).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    tracing::warn!(height = raw.height(), error = %err, "live block rollback failed");
                }
            }
        }
    }

    fn detect_parent_mismatch(&self, block: &Block) -> bool {
        let window = self.window.lock();
        match window.parent_mismatch(block.height, &block.previous_block_id) {
            Some(known_parent) => {
                tracing::warn!(
                    height = block.height,
                    block_id = %block.id,
                    expected_parent = known_parent,
                    received_parent = %block.previous_block_id,
                    "fork detected: parent does not match last applied block"
                );
                true
            }
            None => false,
        }
    }

    fn annotate(&self, mut block: Block) -> Block {
        block.is_final = self
            .finalized
            .get()
            .map_or(false, |finalized| block.height <= finalized);
        block
    }
}
