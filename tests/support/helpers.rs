use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use chainview::model::{RawAmount, RawBlock, RawBlockHeader, RawTransaction};
use chainview::{IndexJob, IndexerResult, JobHandler, JobQueue};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

pub const BLOCK_REWARD: u64 = 500_000_000;
pub const GENERATORS: [&str; 3] = ["lskalpha", "lskbravo", "lskcharlie"];

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn block_id(height: u64, branch: u8) -> String {
    format!("{branch:02x}{height:062x}")
}

pub fn generator_at(height: u64) -> &'static str {
    GENERATORS[(height % GENERATORS.len() as u64) as usize]
}

/// Block on `branch` whose parent is the same branch's previous height, except
/// that heights at or below `fork_base` sit on branch 0.
pub fn block_on_branch(height: u64, branch: u8, fork_base: u64) -> RawBlock {
    let branch_at = |h: u64| if h <= fork_base { 0 } else { branch };
    RawBlock {
        header: RawBlockHeader {
            height,
            id: block_id(height, branch_at(height)),
            previous_block_id: height
                .checked_sub(1)
                .map(|parent| block_id(parent, branch_at(parent)))
                .unwrap_or_default(),
            generator_address: generator_at(height).to_string(),
            timestamp: 1_700_000_000 + height * 10,
            reward: RawAmount::Text(BLOCK_REWARD.to_string()),
        },
        transactions: vec![RawTransaction {
            id: format!("{:064x}", height + 1),
            module: "token".into(),
            command: "transfer".into(),
            sender_address: "lsksender".into(),
            fee: RawAmount::Text("150000".into()),
            params: json!({ "amount": "100", "recipientAddress": "lskrecipient" }),
        }],
    }
}

pub fn canonical_chain(length: u64) -> Vec<RawBlock> {
    (0..length).map(|height| block_on_branch(height, 0, u64::MAX)).collect()
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_for<F, Fut>(limit: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("condition not met within {limit:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Queue that records jobs instead of running them.
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<IndexJob>>,
}

impl RecordingQueue {
    pub fn heights(&self) -> Vec<u64> {
        self.jobs.lock().iter().map(|job| job.height).collect()
    }
}

impl JobQueue for RecordingQueue {
    fn add(&self, job: IndexJob) -> BoxFuture<'_, IndexerResult<()>> {
        Box::pin(async move {
            self.jobs.lock().push(job);
            Ok(())
        })
    }

    fn process(&self, _handler: JobHandler) -> Result<()> {
        Ok(())
    }
}
