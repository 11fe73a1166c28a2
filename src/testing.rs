//! Scripted node and fixtures for unit tests.

use crate::error::{IndexerError, IndexerResult};
use crate::model::{Block, NodeValidator, RawAmount, RawBlock, RawBlockHeader, RawTransaction};
use crate::node::{NetworkStatus, NodeClient, NodeFuture};
use crate::queue::{IndexJob, JobHandler, JobQueue};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

pub const BLOCK_REWARD: u64 = 100_000_000;

pub fn block_id(height: u64, seed: u8) -> String {
    format!("{seed:02x}{height:016x}")
}

pub fn generator_for(height: u64) -> String {
    format!("lskgen{}", height % 3)
}

pub fn raw_block(height: u64, seed: u8) -> RawBlock {
    RawBlock {
        header: RawBlockHeader {
            height,
            id: block_id(height, seed),
            previous_block_id: height
                .checked_sub(1)
                .map(|parent| block_id(parent, seed))
                .unwrap_or_default(),
            generator_address: generator_for(height),
            timestamp: 1_700_000_000 + height * 10,
            reward: RawAmount::Text(BLOCK_REWARD.to_string()),
        },
        transactions: vec![RawTransaction {
            id: format!("{seed:02x}{height:016x}aa"),
            module: "token".into(),
            command: "transfer".into(),
            sender_address: "lsksender".into(),
            fee: RawAmount::Number(1_000),
            params: json!({ "amount": "1", "recipientAddress": "lskrecipient" }),
        }],
    }
}

pub fn raw_chain(heights: Range<u64>, seed: u8) -> Vec<RawBlock> {
    heights.map(|height| raw_block(height, seed)).collect()
}

pub fn block_at(height: u64) -> Block {
    let (block, _) = raw_block(height, 1).normalize().expect("fixture block normalizes");
    block
}

pub fn node_validator(address: &str, weight: u64) -> NodeValidator {
    NodeValidator {
        address: address.into(),
        name: format!("name-{address}"),
        weight: RawAmount::Text(weight.to_string()),
        is_banned: false,
        punishment_periods: Vec::new(),
    }
}

/// Polls `check` until it returns true, panicking after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within two seconds");
}

#[derive(Default)]
struct StubState {
    blocks: BTreeMap<u64, RawBlock>,
    status: Option<NetworkStatus>,
    generators: Vec<String>,
    modules: Vec<String>,
    validators: BTreeMap<String, NodeValidator>,
    validator_calls: usize,
    status_failures: usize,
    status_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// In-process node whose answers are set by the test.
#[derive(Default)]
pub struct StubNode {
    state: Mutex<StubState>,
}

impl StubNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, genesis_height: u64, height: u64, finalized_height: u64) {
        self.state.lock().status = Some(NetworkStatus {
            height,
            finalized_height,
            genesis_height,
            last_block_id: block_id(height, 1),
        });
    }

    pub fn fail_status_calls(&self, count: usize) {
        self.state.lock().status_failures = count;
    }

    /// Runs `hook` on every status call, before the answer is returned.
    pub fn on_status_call(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().status_hook = Some(Arc::new(hook));
    }

    pub fn push_blocks(&self, blocks: Vec<RawBlock>) {
        let mut state = self.state.lock();
        for block in blocks {
            state.blocks.insert(block.height(), block);
        }
    }

    pub fn replace_blocks(&self, blocks: Vec<RawBlock>) {
        self.state.lock().blocks.clear();
        self.push_blocks(blocks);
    }

    pub fn set_generators(&self, generators: &[&str]) {
        self.state.lock().generators = generators.iter().map(|g| g.to_string()).collect();
    }

    pub fn set_modules(&self, modules: &[&str]) {
        self.state.lock().modules = modules.iter().map(|m| m.to_string()).collect();
    }

    pub fn put_validator(&self, validator: NodeValidator) {
        self.state
            .lock()
            .validators
            .insert(validator.address.clone(), validator);
    }

    pub fn remove_validator(&self, address: &str) {
        self.state.lock().validators.remove(address);
    }

    pub fn validator_calls(&self) -> usize {
        self.state.lock().validator_calls
    }
}

impl NodeClient for StubNode {
    fn get_network_status(&self) -> NodeFuture<'_, NetworkStatus> {
        Box::pin(async move {
            let hook = self.state.lock().status_hook.clone();
            if let Some(hook) = hook {
                hook();
            }
            let mut state = self.state.lock();
            if state.status_failures > 0 {
                state.status_failures -= 1;
                return Err(IndexerError::node("stub node unreachable"));
            }
            state
                .status
                .clone()
                .ok_or_else(|| IndexerError::node("stub node has no status"))
        })
    }

    fn get_generator_list(&self) -> NodeFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.state.lock().generators.clone()) })
    }

    fn get_registered_modules(&self) -> NodeFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.state.lock().modules.clone()) })
    }

    fn get_block_by_height(&self, height: u64) -> NodeFuture<'_, Option<RawBlock>> {
        Box::pin(async move { Ok(self.state.lock().blocks.get(&height).cloned()) })
    }

    fn get_block_by_id<'a>(&'a self, id: &'a str) -> NodeFuture<'a, Option<RawBlock>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .blocks
                .values()
                .find(|block| block.header.id == id)
                .cloned())
        })
    }

    fn get_validator<'a>(&'a self, address: &'a str) -> NodeFuture<'a, Option<NodeValidator>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.validator_calls += 1;
            Ok(state.validators.get(address).cloned())
        })
    }

    fn get_all_validators(&self) -> NodeFuture<'_, Vec<NodeValidator>> {
        Box::pin(async move { Ok(self.state.lock().validators.values().cloned().collect()) })
    }
}

/// Queue that only records what was enqueued.
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<IndexJob>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<IndexJob> {
        self.jobs.lock().clone()
    }

    pub fn heights(&self) -> Vec<u64> {
        self.jobs.lock().iter().map(|job| job.height).collect()
    }

    pub fn clear(&self) {
        self.jobs.lock().clear();
    }
}

impl JobQueue for RecordingQueue {
    fn add(&self, job: IndexJob) -> BoxFuture<'_, IndexerResult<()>> {
        Box::pin(async move {
            self.jobs.lock().push(job);
            Ok(())
        })
    }

    fn process(&self, _handler: JobHandler) -> anyhow::Result<()> {
        Ok(())
    }
}
