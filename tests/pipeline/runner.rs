use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chainview::{IndexerConfig, MemoryStore, NodeNewBlock, Runner};

use crate::support::helpers::{canonical_chain, init_tracing, wait_for, GENERATORS};
use crate::support::mock_node::{MockChain, MockNodeServer};

const WAIT: Duration = Duration::from_secs(10);

fn config(node_url: &str) -> Result<IndexerConfig> {
    IndexerConfig::builder()
        .node_url(node_url)
        .job_workers(2)
        .job_initial_backoff(Duration::from_millis(5))
        .job_max_backoff(Duration::from_millis(20))
        .genesis_max_attempts(2)
        .build()
}

async fn indexed(runner: &Runner) -> u64 {
    runner
        .components()
        .store
        .count_blocks()
        .await
        .unwrap_or_default()
}

fn produced_total(runner: &Runner) -> u64 {
    runner
        .components()
        .validators
        .snapshot()
        .iter()
        .map(|validator| validator.produced_blocks)
        .sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_backfills_from_a_json_rpc_node() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(canonical_chain(6));
    let server = MockNodeServer::start(chain).await?;
    let mut runner = Runner::from_config(config(&server.url())?)?;

    runner.start().await?;
    wait_for(WAIT, || async { indexed(&runner).await == 6 }).await?;
    wait_for(WAIT, || async { produced_total(&runner) == 6 }).await?;

    let validators = runner.components().validators.snapshot();
    assert_eq!(validators.len(), GENERATORS.len());
    let ranks: Vec<u32> = validators.iter().map(|validator| validator.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);

    runner.stop().await?;
    runner.stop().await?;
    assert!(runner.fatal_error().is_none());
    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_follows_blocks_announced_on_the_bus() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(canonical_chain(4));
    let mut runner = Runner::new(
        config("http://127.0.0.1:9")?,
        Arc::new(MemoryStore::new()),
        Arc::new(chain.clone()),
    );

    runner.start().await?;
    wait_for(WAIT, || async { indexed(&runner).await == 4 }).await?;

    chain.replace_blocks(canonical_chain(5));
    if let Some(block) = chain.block(4) {
        runner.components().bus.dispatch::<NodeNewBlock>(&block);
    }
    wait_for(WAIT, || async { indexed(&runner).await == 5 }).await?;
    assert_eq!(runner.components().indexer.last_seen_height(), Some(4));
    wait_for(WAIT, || async { produced_total(&runner) == 5 }).await?;

    runner.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unreachable_node_stops_the_runner_fatally() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(canonical_chain(2));
    chain.set_reachable(false);
    let mut runner = Runner::new(
        config("http://127.0.0.1:9")?,
        Arc::new(MemoryStore::new()),
        Arc::new(chain),
    );

    let err = runner.start().await.unwrap_err();
    assert!(err
        .to_string()
        .contains("genesis height unavailable after 2 attempts"));
    assert!(runner.cancellation_token().is_cancelled());
    assert!(runner.fatal_error().is_some());
    assert_eq!(indexed(&runner).await, 0);
    Ok(())
}
