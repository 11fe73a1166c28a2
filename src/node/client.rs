use super::circuit_breaker::NodeCircuitBreaker;
use super::metrics::{NodeMetrics, NodeMetricsSnapshot};
use super::options::NodeClientOptions;
use super::{NetworkStatus, NodeClient, NodeFuture};
use crate::error::{IndexerError, IndexerResult};
use crate::model::{NodeValidator, RawBlock};
use anyhow::{anyhow, bail, Context, Result};
use jsonrpsee::core::client::{ClientT, Error as JsonRpcError};
use jsonrpsee::core::params::ObjectParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{timeout, Instant};

const GET_NODE_INFO: &str = "system_getNodeInfo";
const GET_METADATA: &str = "system_getMetadata";
const GET_GENERATOR_LIST: &str = "chain_getGeneratorList";
const GET_BLOCK_BY_HEIGHT: &str = "chain_getBlockByHeight";
const GET_BLOCK_BY_ID: &str = "chain_getBlockByID";
const GET_VALIDATOR: &str = "pos_getValidator";
const GET_ALL_VALIDATORS: &str = "pos_getAllValidators";

#[derive(Deserialize)]
struct GeneratorList {
    list: Vec<GeneratorSlot>,
}

#[derive(Deserialize)]
struct GeneratorSlot {
    address: String,
}

#[derive(Deserialize)]
struct Metadata {
    modules: Vec<ModuleMetadata>,
}

#[derive(Deserialize)]
struct ModuleMetadata {
    name: String,
}

#[derive(Deserialize)]
struct ValidatorList {
    validators: Vec<NodeValidator>,
}

/// JSON-RPC client for the remote node.
#[derive(Debug, Clone)]
pub struct JsonRpcNodeClient {
    endpoint: Arc<String>,
    client: HttpClient,
    options: NodeClientOptions,
    metrics: Arc<NodeMetrics>,
    breaker: Arc<NodeCircuitBreaker>,
}

impl JsonRpcNodeClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, NodeClientOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: NodeClientOptions) -> Result<Self> {
        Self::with_options_and_breaker(url, options, Arc::new(NodeCircuitBreaker::default()))
    }

    pub fn with_options_and_breaker(
        url: impl Into<String>,
        options: NodeClientOptions,
        breaker: Arc<NodeCircuitBreaker>,
    ) -> Result<Self> {
        options.validate()?;
        let endpoint = url.into().trim().to_owned();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!("node_url must start with http:// or https://");
        }

        let max_response_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;
        let client = HttpClientBuilder::default()
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_response_size(max_response_size)
            .build(&endpoint)
            .map_err(|err| anyhow!("failed to build node client: {err}"))?;

        Ok(Self {
            endpoint: Arc::new(endpoint),
            client,
            options,
            metrics: Arc::new(NodeMetrics::default()),
            breaker,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn metrics(&self) -> NodeMetricsSnapshot {
        self.metrics.snapshot(self.breaker.snapshot().state)
    }

    /// Issues one request. `Ok(None)` means the node answered that the entity does not exist.
    async fn call<R>(&self, method: &'static str, params: ObjectParams) -> IndexerResult<Option<R>>
    where
        R: DeserializeOwned + Send,
    {
        let Some(state) = self.breaker.acquire() else {
            self.metrics.record_refused();
            tracing::debug!(method, "node circuit breaker open; refusing call");
            return Err(IndexerError::node(format!(
                "{method} refused: circuit breaker is open"
            )));
        };
        tracing::trace!(method, breaker = ?state, "calling node");

        let start = Instant::now();
        let outcome = timeout(
            self.options.request_timeout,
            self.client.request::<R, _>(method, params),
        )
        .await;
        let elapsed = start.elapsed();

        match outcome {
            Err(_) => {
                self.metrics.record_timeout(elapsed);
                self.breaker.record_failure();
                tracing::warn!(method, timeout = ?self.options.request_timeout, "node call timed out");
                Err(IndexerError::node(format!(
                    "{method} timed out after {:?}",
                    self.options.request_timeout
                )))
            }
            Ok(Ok(value)) => {
                self.metrics.record_success(elapsed);
                self.breaker.record_success();
                Ok(Some(value))
            }
            Ok(Err(JsonRpcError::Call(error))) => {
                // The node is reachable; it rejected this particular request.
                self.metrics.record_success(elapsed);
                self.breaker.record_success();
                if is_not_found(error.message()) {
                    return Ok(None);
                }
                Err(IndexerError::node(format!(
                    "{method} failed (code={}, message={})",
                    error.code(),
                    error.message()
                )))
            }
            Ok(Err(JsonRpcError::ParseError(err))) => {
                self.metrics.record_failure(elapsed);
                self.breaker.record_success();
                Err(IndexerError::validation(
                    "node response",
                    format!("{method} returned an unexpected shape: {err}"),
                ))
            }
            Ok(Err(err)) => {
                self.metrics.record_failure(elapsed);
                self.breaker.record_failure();
                Err(IndexerError::node(format!("{method} call failed: {err}")))
            }
        }
    }

    async fn call_required<R>(&self, method: &'static str, params: ObjectParams) -> IndexerResult<R>
    where
        R: DeserializeOwned + Send,
    {
        self.call(method, params)
            .await?
            .ok_or_else(|| IndexerError::not_found("node result", method))
    }
}

fn params_with<T: Serialize>(name: &str, value: T) -> IndexerResult<ObjectParams> {
    let mut params = ObjectParams::new();
    params
        .insert(name, value)
        .context("failed to serialize node request params")
        .map_err(|err| IndexerError::validation("params", format!("{err:#}")))?;
    Ok(params)
}

fn is_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not found") || message.contains("does not exist")
}

impl NodeClient for JsonRpcNodeClient {
    fn get_network_status(&self) -> NodeFuture<'_, NetworkStatus> {
        Box::pin(self.call_required(GET_NODE_INFO, ObjectParams::new()))
    }

    fn get_generator_list(&self) -> NodeFuture<'_, Vec<String>> {
        Box::pin(async move {
            let list: GeneratorList = self
                .call_required(GET_GENERATOR_LIST, ObjectParams::new())
                .await?;
            Ok(list.list.into_iter().map(|slot| slot.address).collect())
        })
    }

    fn get_registered_modules(&self) -> NodeFuture<'_, Vec<String>> {
        Box::pin(async move {
            let metadata: Metadata = self.call_required(GET_METADATA, ObjectParams::new()).await?;
            Ok(metadata.modules.into_iter().map(|module| module.name).collect())
        })
    }

    fn get_block_by_height(&self, height: u64) -> NodeFuture<'_, Option<RawBlock>> {
        Box::pin(async move {
            self.call(GET_BLOCK_BY_HEIGHT, params_with("height", height)?)
                .await
        })
    }

    fn get_block_by_id<'a>(&'a self, id: &'a str) -> NodeFuture<'a, Option<RawBlock>> {
        Box::pin(async move { self.call(GET_BLOCK_BY_ID, params_with("id", id)?).await })
    }

    fn get_validator<'a>(&'a self, address: &'a str) -> NodeFuture<'a, Option<NodeValidator>> {
        Box::pin(async move {
            self.call(GET_VALIDATOR, params_with("address", address)?)
                .await
        })
    }

    fn get_all_validators(&self) -> NodeFuture<'_, Vec<NodeValidator>> {
        Box::pin(async move {
            let list: ValidatorList = self
                .call_required(GET_ALL_VALIDATORS, ObjectParams::new())
                .await?;
            Ok(list.validators)
        })
    }
}
