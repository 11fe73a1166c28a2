//! Canonical data model shared by the pipeline, the store, and the caches.
//!
//! Raw node payloads live next to their normalized counterparts; amounts are
//! carried as [`num_bigint::BigUint`] internally and only rendered as decimal
//! strings at serde boundaries.

pub mod amount;
pub mod block;
pub mod stats;
pub mod validator;

pub use amount::RawAmount;
pub use block::{
    AppliedBlock, Block, BlockWrite, IndexedBlock, RawBlock, RawBlockHeader, RawTransaction,
    Transaction,
};
pub use stats::{BlockSummary, IndexStats};
pub use validator::{
    ranking_order, GeneratorTally, NodeValidator, PunishmentWindow, Validator, ValidatorStatus,
};
