//! Job queue contract for per-height indexing work, plus an in-process engine.

pub mod backoff;
pub mod memory;

pub use backoff::{retry_with_backoff, RetryDisposition, RetryPolicy};
pub use memory::{FailedJob, MemoryJobQueue, QueueStats};

use crate::error::IndexerResult;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Minimal identifying data for one unit of indexing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexJob {
    pub height: u64,
    /// Reconcile a suspected fork at this height instead of a plain fetch.
    #[serde(default)]
    pub fork: bool,
}

impl IndexJob {
    pub fn at(height: u64) -> Self {
        Self { height, fork: false }
    }

    pub fn fork_at(height: u64) -> Self {
        Self { height, fork: true }
    }
}

pub type JobHandler = Arc<dyn Fn(IndexJob) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// At-least-once queue: each job is delivered to one worker at a time, failed
/// attempts are retried with backoff up to a bound, and a job leaves the queue
/// only on success or permanent failure.
pub trait JobQueue: Send + Sync {
    fn add(&self, job: IndexJob) -> BoxFuture<'_, IndexerResult<()>>;

    /// Starts delivering jobs to `handler`. May only be called once.
    fn process(&self, handler: JobHandler) -> anyhow::Result<()>;
}
