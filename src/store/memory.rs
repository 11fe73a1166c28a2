use super::query::{BlockSortField, Page, SortDirection};
use super::{BlockQuery, IndexStore, StoreFuture};
use crate::error::{IndexerError, IndexerResult};
use crate::model::{
    ranking_order, Block, BlockWrite, GeneratorTally, IndexedBlock, Transaction, Validator,
};
use num_bigint::BigUint;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Tables {
    blocks: BTreeMap<u64, Block>,
    heights_by_id: HashMap<String, u64>,
    transactions: HashMap<String, Vec<Transaction>>,
    validators: BTreeMap<String, Validator>,
    tallies: HashMap<String, GeneratorTally>,
}

impl Tables {
    fn remove_at(&mut self, height: u64) -> Option<IndexedBlock> {
        let block = self.blocks.remove(&height)?;
        self.heights_by_id.remove(&block.id);
        if let Some(tally) = self.tallies.get_mut(&block.generator_address) {
            tally.debit(&block.reward);
            if tally.is_empty() {
                self.tallies.remove(&block.generator_address);
            }
        }
        let transactions = self.transactions.remove(&block.id).unwrap_or_default();
        Some(IndexedBlock {
            block,
            transactions,
        })
    }
}

/// Store engine keeping every table behind one lock; each mutation holds the
/// write guard for its whole duration.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    injected_failures: Arc<AtomicUsize>,
    injected_read_failures: Arc<AtomicUsize>,
}

fn consume(failures: &AtomicUsize, message: &str) -> IndexerResult<()> {
    match failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)) {
        Ok(_) => Err(IndexerError::store(message)),
        Err(_) => Ok(()),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` mutations fail with a transient store error.
    pub fn fail_next_writes(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` block lookups by id fail with a transient store error.
    pub fn fail_next_block_reads(&self, count: usize) {
        self.injected_read_failures.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> IndexerResult<()> {
        consume(&self.injected_failures, "injected write failure")
    }

    fn apply_block_sync(
        &self,
        block: Block,
        transactions: Vec<Transaction>,
    ) -> IndexerResult<BlockWrite> {
        self.check_write()?;
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let existing_id = tables
            .blocks
            .get(&block.height)
            .map(|existing| existing.id.clone());
        let write = match existing_id {
            Some(id) if id == block.id => BlockWrite::Unchanged,
            Some(_) => match tables.remove_at(block.height) {
                Some(displaced) => BlockWrite::Replaced(displaced),
                None => BlockWrite::Inserted,
            },
            None => BlockWrite::Inserted,
        };

        // An id may only live at one height.
        if let Some(stale_height) = tables.heights_by_id.get(&block.id).copied() {
            if stale_height != block.height {
                tables.remove_at(stale_height);
            }
        }

        if write != BlockWrite::Unchanged {
            tables
                .tallies
                .entry(block.generator_address.clone())
                .or_default()
                .credit(&block.reward);
        }
        tables.heights_by_id.insert(block.id.clone(), block.height);
        tables.transactions.insert(block.id.clone(), transactions);
        tables.blocks.insert(block.height, block);
        Ok(write)
    }

    fn list_blocks_sync(&self, query: &BlockQuery) -> IndexerResult<Page<Block>> {
        query.validate()?;
        let tables = self.tables.read();
        let mut matching: Vec<Block> = match query.height {
            Some(height) => tables.blocks.get(&height).into_iter().cloned().collect(),
            None => tables.blocks.values().cloned().collect(),
        };
        matching.retain(|block| query.matches(block));

        match query.sort.field {
            BlockSortField::Height => matching.sort_by_key(|block| block.height),
            BlockSortField::Timestamp => {
                matching.sort_by_key(|block| (block.timestamp, block.height))
            }
        }
        if query.sort.direction == SortDirection::Desc {
            matching.reverse();
        }

        Ok(Page::paginate(matching, query.offset, query.limit))
    }
}

impl IndexStore for MemoryStore {
    fn apply_block(
        &self,
        block: Block,
        transactions: Vec<Transaction>,
    ) -> StoreFuture<'_, BlockWrite> {
        Box::pin(async move { self.apply_block_sync(block, transactions) })
    }

    fn delete_block<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<IndexedBlock>> {
        Box::pin(async move {
            self.check_write()?;
            let mut tables = self.tables.write();
            let removed = match tables.heights_by_id.get(id).copied() {
                Some(height) => tables.remove_at(height),
                None => None,
            };
            Ok(removed)
        })
    }

    fn block_by_height(&self, height: u64) -> StoreFuture<'_, Option<Block>> {
        Box::pin(async move { Ok(self.tables.read().blocks.get(&height).cloned()) })
    }

    fn block_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Block>> {
        Box::pin(async move {
            consume(&self.injected_read_failures, "injected read failure")?;
            let tables = self.tables.read();
            Ok(tables
                .heights_by_id
                .get(id)
                .and_then(|height| tables.blocks.get(height))
                .cloned())
        })
    }

    fn block_transactions<'a>(&'a self, block_id: &'a str) -> StoreFuture<'a, Vec<Transaction>> {
        Box::pin(async move {
            Ok(self
                .tables
                .read()
                .transactions
                .get(block_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn list_blocks<'a>(&'a self, query: &'a BlockQuery) -> StoreFuture<'a, Page<Block>> {
        Box::pin(async move { self.list_blocks_sync(query) })
    }

    fn count_blocks(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move { Ok(self.tables.read().blocks.len() as u64) })
    }

    fn last_indexed_block(&self) -> StoreFuture<'_, Option<Block>> {
        Box::pin(async move {
            Ok(self
                .tables
                .read()
                .blocks
                .last_key_value()
                .map(|(_, block)| block.clone()))
        })
    }

    fn missing_heights(&self, from: u64, to: u64) -> StoreFuture<'_, Vec<u64>> {
        Box::pin(async move {
            if from > to {
                return Ok(Vec::new());
            }
            let tables = self.tables.read();
            Ok((from..=to)
                .filter(|height| !tables.blocks.contains_key(height))
                .collect())
        })
    }

    fn upsert_validators(&self, batch: Vec<Validator>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_write()?;
            let mut tables = self.tables.write();
            for validator in batch {
                tables
                    .validators
                    .insert(validator.address.clone(), validator);
            }
            Ok(())
        })
    }

    fn apply_validator_patch(
        &self,
        remove: Vec<String>,
        upsert: Vec<Validator>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_write()?;
            let mut tables = self.tables.write();
            for address in &remove {
                tables.validators.remove(address);
            }
            for validator in upsert {
                tables
                    .validators
                    .insert(validator.address.clone(), validator);
            }
            Ok(())
        })
    }

    fn validator<'a>(&'a self, address: &'a str) -> StoreFuture<'a, Option<Validator>> {
        Box::pin(async move { Ok(self.tables.read().validators.get(address).cloned()) })
    }

    fn validators(&self) -> StoreFuture<'_, Vec<Validator>> {
        Box::pin(async move { Ok(self.tables.read().validators.values().cloned().collect()) })
    }

    fn generator_tally<'a>(&'a self, address: &'a str) -> StoreFuture<'a, GeneratorTally> {
        Box::pin(async move {
            Ok(self
                .tables
                .read()
                .tallies
                .get(address)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn generator_tallies(&self) -> StoreFuture<'_, HashMap<String, GeneratorTally>> {
        Box::pin(async move { Ok(self.tables.read().tallies.clone()) })
    }

    fn eligible_validators(&self, min_weight: BigUint) -> StoreFuture<'_, Vec<Validator>> {
        Box::pin(async move {
            let mut eligible: Vec<Validator> = self
                .tables
                .read()
                .validators
                .values()
                .filter(|validator| !validator.is_banned && validator.weight >= min_weight)
                .cloned()
                .collect();
            eligible.sort_by(ranking_order);
            Ok(eligible)
        })
    }

    fn truncate_all(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_write()?;
            *self.tables.write() = Tables::default();
            Ok(())
        })
    }
}
