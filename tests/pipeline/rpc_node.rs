use anyhow::{Context, Result};
use chainview::model::RawAmount;
use chainview::{IndexerError, JsonRpcNodeClient, NodeClient, Resource};

use crate::support::helpers::{block_id, canonical_chain, init_tracing, GENERATORS};
use crate::support::mock_node::{MockChain, MockNodeServer};

#[tokio::test]
async fn json_rpc_client_reads_the_node_surface() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(canonical_chain(4));
    chain.set_finalized(1);
    let server = MockNodeServer::start(chain.clone()).await?;
    let client = JsonRpcNodeClient::new(server.url())?;

    let status = client.get_network_status().await?;
    assert_eq!(status.height, 3);
    assert_eq!(status.genesis_height, 0);
    assert_eq!(status.finalized_height, 1);
    assert_eq!(status.last_block_id, block_id(3, 0));

    assert_eq!(client.get_generator_list().await?, GENERATORS);
    assert!(client
        .get_registered_modules()
        .await?
        .iter()
        .any(|module| module == "pos"));

    let block = client
        .get_block_by_height(2)
        .await?
        .context("height 2 exists")?;
    assert_eq!(block.header.id, block_id(2, 0));
    assert_eq!(block.header.previous_block_id, block_id(1, 0));
    let by_id = client
        .get_block_by_id(&block.header.id)
        .await?
        .context("block found by id")?;
    assert_eq!(by_id, block);

    assert!(client.get_block_by_height(99).await?.is_none());
    assert!(client.get_block_by_id(&block_id(99, 7)).await?.is_none());

    let validator = client
        .get_validator("lskalpha")
        .await?
        .context("lskalpha is registered")?;
    assert_eq!(validator.weight, RawAmount::Text("3000000000000".into()));
    assert!(client.get_validator("lsknobody").await?.is_none());
    assert_eq!(client.get_all_validators().await?.len(), GENERATORS.len());

    let metrics = client.metrics();
    assert_eq!(metrics.requests, 10);
    assert_eq!(metrics.errors, 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn node_side_errors_surface_as_node_errors() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(canonical_chain(2));
    chain.set_reachable(false);
    let server = MockNodeServer::start(chain.clone()).await?;
    let client = JsonRpcNodeClient::new(server.url())?;

    let err = client.get_network_status().await.unwrap_err();
    assert!(
        matches!(
            err,
            IndexerError::Transient {
                resource: Resource::Node,
                ..
            }
        ),
        "{err:?}"
    );
    assert!(err.to_string().contains("node syncing"));

    chain.set_reachable(true);
    assert_eq!(client.get_network_status().await?.height, 1);

    server.stop().await;
    Ok(())
}
