use crate::bus::{listener, DeleteBlock, EventBus, NewBlock};
use crate::error::IndexerResult;
use crate::model::{AppliedBlock, BlockSummary, IndexStats, IndexedBlock};
use crate::node::{NetworkStatus, NodeClient};
use crate::store::IndexStore;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Default)]
struct Slot {
    /// Bumped by every invalidation.
    generation: u64,
    stats: Option<IndexStats>,
}

/// Cached [`IndexStats`], dropped whenever a block is applied or removed and
/// recomputed on the next read. A refresh that overlaps an invalidation
/// returns its result without caching it.
pub struct IndexStatsCache {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    cached: RwLock<Slot>,
}

impl IndexStatsCache {
    pub fn new(store: Arc<dyn IndexStore>, node: Arc<dyn NodeClient>) -> Self {
        Self {
            store,
            node,
            cached: RwLock::new(Slot::default()),
        }
    }

    pub async fn get(&self) -> IndexerResult<IndexStats> {
        if let Some(stats) = self.cached() {
            return Ok(stats);
        }
        self.refresh().await
    }

    pub fn cached(&self) -> Option<IndexStats> {
        self.cached.read().stats.clone()
    }

    pub async fn refresh(&self) -> IndexerResult<IndexStats> {
        self.refresh_with_status().await.map(|(stats, _)| stats)
    }

    /// Recomputes the stats and also hands back the node status they were derived from.
    pub async fn refresh_with_status(&self) -> IndexerResult<(IndexStats, NetworkStatus)> {
        let generation = self.cached.read().generation;
        let status = self.node.get_network_status().await?;
        let num_blocks_indexed = self.store.count_blocks().await?;
        let last_indexed_block = self
            .store
            .last_indexed_block()
            .await?
            .map(|block| BlockSummary {
                height: block.height,
                id: block.id,
            });

        let stats = IndexStats::compute(
            status.genesis_height,
            status.height,
            num_blocks_indexed,
            last_indexed_block,
        );
        let mut slot = self.cached.write();
        if slot.generation == generation {
            slot.stats = Some(stats.clone());
        }
        Ok((stats, status))
    }

    pub fn invalidate(&self) {
        let mut slot = self.cached.write();
        slot.generation += 1;
        slot.stats = None;
    }

    /// Invalidates the cache on every block signal.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let cache = Arc::clone(self);
        bus.get::<NewBlock>().add(listener(move |_: &AppliedBlock| {
            cache.invalidate();
            Ok(())
        }));
        let cache = Arc::clone(self);
        bus.get::<DeleteBlock>().add(listener(move |_: &IndexedBlock| {
            cache.invalidate();
            Ok(())
        }));
    }
}
