pub mod bus;
pub mod error;
pub mod indexer;
pub mod model;
pub mod node;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod validators;

#[cfg(test)]
mod testing;

pub use bus::{
    listener, DeleteBlock, DispatchReport, EventBus, Listener, NewBlock, NodeDeleteBlock,
    NodeNewBlock, ReloadReason, ReloadValidators, Signal,
};
pub use error::{IndexerError, IndexerResult, Resource};
pub use indexer::{BlockIndexer, ForkReconciliation, IndexStatsCache};
pub use model::{
    AppliedBlock, Block, BlockWrite, IndexStats, IndexedBlock, NodeValidator, RawBlock,
    Transaction, Validator, ValidatorStatus,
};
pub use node::{JsonRpcNodeClient, NetworkStatus, NodeClient, NodeClientOptions};
pub use queue::{IndexJob, JobHandler, JobQueue, MemoryJobQueue, RetryPolicy};
pub use runtime::config::{IndexerConfig, IndexerConfigBuilder, IndexerConfigParams};
pub use runtime::runner::{Components, Runner};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scheduler::{BackfillReport, BackfillScheduler, BackfillSettings, ModuleRegistry};
pub use store::{BlockQuery, IndexStore, MemoryStore, Page};
pub use validators::{AuditOutcome, ValidatorCache, ValidatorCacheSettings, ValidatorQuery};
