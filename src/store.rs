//! Contract for the persistent system of record plus an in-process engine.
//!
//! Every multi-row mutation (a block with its transactions, a validator batch)
//! is one atomic transaction: readers observe either all of it or none of it.

pub mod memory;
pub mod query;

pub use memory::MemoryStore;
pub use query::{BlockQuery, BlockSort, BlockSortField, Page, SortDirection};

use crate::error::IndexerResult;
use crate::model::{Block, BlockWrite, GeneratorTally, IndexedBlock, Transaction, Validator};
use futures::future::BoxFuture;
use num_bigint::BigUint;
use std::collections::HashMap;

pub type StoreFuture<'a, T> = BoxFuture<'a, IndexerResult<T>>;

pub trait IndexStore: Send + Sync {
    /// Persists a block and its transactions in one transaction. A different block
    /// already stored at the same height is cascaded out and returned. The
    /// generator tallies are adjusted in that same transaction.
    fn apply_block(&self, block: Block, transactions: Vec<Transaction>)
        -> StoreFuture<'_, BlockWrite>;

    /// Removes a block and its transactions atomically. `None` if nothing was stored.
    fn delete_block<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<IndexedBlock>>;

    fn block_by_height(&self, height: u64) -> StoreFuture<'_, Option<Block>>;

    fn block_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Block>>;

    fn block_transactions<'a>(&'a self, block_id: &'a str) -> StoreFuture<'a, Vec<Transaction>>;

    fn list_blocks<'a>(&'a self, query: &'a BlockQuery) -> StoreFuture<'a, Page<Block>>;

    fn count_blocks(&self) -> StoreFuture<'_, u64>;

    /// Highest indexed block.
    fn last_indexed_block(&self) -> StoreFuture<'_, Option<Block>>;

    /// Heights in `[from, to]` with no stored block, ascending.
    fn missing_heights(&self, from: u64, to: u64) -> StoreFuture<'_, Vec<u64>>;

    /// Inserts or replaces validators by address in one transaction.
    fn upsert_validators(&self, batch: Vec<Validator>) -> StoreFuture<'_, ()>;

    /// Removes `remove` and upserts `upsert` in one transaction.
    fn apply_validator_patch(
        &self,
        remove: Vec<String>,
        upsert: Vec<Validator>,
    ) -> StoreFuture<'_, ()>;

    fn validator<'a>(&'a self, address: &'a str) -> StoreFuture<'a, Option<Validator>>;

    fn validators(&self) -> StoreFuture<'_, Vec<Validator>>;

    /// Produced blocks and rewards of one generator over the stored blocks.
    fn generator_tally<'a>(&'a self, address: &'a str) -> StoreFuture<'a, GeneratorTally>;

    /// Every non-empty generator tally, keyed by address.
    fn generator_tallies(&self) -> StoreFuture<'_, HashMap<String, GeneratorTally>>;

    /// Non-banned validators with weight at least `min_weight`, ordered by weight
    /// descending then address ascending.
    fn eligible_validators(&self, min_weight: BigUint) -> StoreFuture<'_, Vec<Validator>>;

    /// Drops every block, transaction, and validator. Only used by a full rebuild.
    fn truncate_all(&self) -> StoreFuture<'_, ()>;
}
