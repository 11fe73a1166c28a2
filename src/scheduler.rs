//! Keeps `[genesis, chain tip]` eventually gap-free by feeding the job queue.
//!
//! Two paths overlap on purpose: every new block enqueues its own height right
//! away, while full passes (startup, a fixed interval, rebuilds) diff the store
//! against the chain and enqueue every hole. Jobs are idempotent, so the same
//! height may be queued more than once.

pub mod backfill;
pub mod modules;

pub use backfill::{BackfillReport, BackfillScheduler, BackfillSettings};
pub use modules::ModuleRegistry;
