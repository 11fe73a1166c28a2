use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chainview::model::{NodeValidator, RawAmount, RawBlock};
use chainview::node::NodeFuture;
use chainview::{IndexerError, NetworkStatus, NodeClient};
use jsonrpsee::server::{RpcModule, Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};

use super::helpers::GENERATORS;

#[derive(Default)]
struct ChainState {
    blocks: BTreeMap<u64, RawBlock>,
    genesis_height: u64,
    finalized_height: u64,
    modules: Vec<String>,
    generators: Vec<String>,
    validators: BTreeMap<String, NodeValidator>,
    reachable: bool,
}

/// Scripted chain shared by the in-process node and the JSON-RPC mock server.
#[derive(Clone)]
pub struct MockChain {
    inner: Arc<RwLock<ChainState>>,
}

impl MockChain {
    pub fn new(blocks: Vec<RawBlock>) -> Self {
        let chain = Self {
            inner: Arc::new(RwLock::new(ChainState {
                modules: vec!["token".into(), "pos".into()],
                generators: GENERATORS.iter().map(|g| g.to_string()).collect(),
                reachable: true,
                ..ChainState::default()
            })),
        };
        chain.replace_blocks(blocks);
        for (index, address) in GENERATORS.iter().enumerate() {
            chain.put_validator(address, 3_000_000_000_000 - index as u64 * 100_000_000_000);
        }
        chain
    }

    pub fn replace_blocks(&self, blocks: Vec<RawBlock>) {
        let mut state = self.inner.write();
        state.blocks = blocks
            .into_iter()
            .map(|block| (block.header.height, block))
            .collect();
        state.genesis_height = state.blocks.keys().next().copied().unwrap_or_default();
    }

    pub fn set_finalized(&self, height: u64) {
        self.inner.write().finalized_height = height;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.write().reachable = reachable;
    }

    pub fn put_validator(&self, address: &str, weight: u64) {
        self.inner.write().validators.insert(
            address.to_string(),
            NodeValidator {
                address: address.to_string(),
                name: format!("{address}-name"),
                weight: RawAmount::Text(weight.to_string()),
                is_banned: false,
                punishment_periods: Vec::new(),
            },
        );
    }

    pub fn block(&self, height: u64) -> Option<RawBlock> {
        self.inner.read().blocks.get(&height).cloned()
    }

    fn status(&self) -> Option<NetworkStatus> {
        let state = self.inner.read();
        if !state.reachable {
            return None;
        }
        let (height, last) = state
            .blocks
            .iter()
            .next_back()
            .map(|(height, block)| (*height, block.header.id.clone()))
            .unwrap_or_default();
        Some(NetworkStatus {
            height,
            finalized_height: state.finalized_height,
            genesis_height: state.genesis_height,
            last_block_id: last,
        })
    }
}

fn unreachable() -> IndexerError {
    IndexerError::node("mock node unreachable")
}

impl NodeClient for MockChain {
    fn get_network_status(&self) -> NodeFuture<'_, NetworkStatus> {
        Box::pin(async move { self.status().ok_or_else(unreachable) })
    }

    fn get_generator_list(&self) -> NodeFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.inner.read().generators.clone()) })
    }

    fn get_registered_modules(&self) -> NodeFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.inner.read().modules.clone()) })
    }

    fn get_block_by_height(&self, height: u64) -> NodeFuture<'_, Option<RawBlock>> {
        Box::pin(async move { Ok(self.block(height)) })
    }

    fn get_block_by_id<'a>(&'a self, id: &'a str) -> NodeFuture<'a, Option<RawBlock>> {
        Box::pin(async move {
            Ok(self
                .inner
                .read()
                .blocks
                .values()
                .find(|block| block.header.id == id)
                .cloned())
        })
    }

    fn get_validator<'a>(&'a self, address: &'a str) -> NodeFuture<'a, Option<NodeValidator>> {
        Box::pin(async move { Ok(self.inner.read().validators.get(address).cloned()) })
    }

    fn get_all_validators(&self) -> NodeFuture<'_, Vec<NodeValidator>> {
        Box::pin(async move { Ok(self.inner.read().validators.values().cloned().collect()) })
    }
}

#[derive(Deserialize)]
struct HeightParams {
    height: u64,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct AddressParams {
    address: String,
}

fn not_found(message: String) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(-32000, message, None::<()>)
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, ErrorObjectOwned> {
    serde_json::to_value(value)
        .map_err(|err| ErrorObjectOwned::owned(-32603, err.to_string(), None::<()>))
}

/// JSON-RPC front for a [`MockChain`], speaking the node's method names.
pub struct MockNodeServer {
    addr: SocketAddr,
    handle: ServerHandle,
}

impl MockNodeServer {
    pub async fn start(chain: MockChain) -> Result<Self> {
        let server = Server::builder()
            .build("127.0.0.1:0")
            .await
            .context("failed to bind mock node server")?;
        let addr = server.local_addr().context("mock node server has no address")?;

        let mut module = RpcModule::new(chain);
        module.register_method("system_getNodeInfo", |_, chain, _| match chain.status() {
            Some(status) => to_value(status),
            None => Err(ErrorObjectOwned::owned(-32603, "node syncing", None::<()>)),
        })?;
        module.register_method("system_getMetadata", |_, chain, _| {
            let modules: Vec<Value> = chain
                .inner
                .read()
                .modules
                .iter()
                .map(|name| json!({ "name": name }))
                .collect();
            Ok::<_, ErrorObjectOwned>(json!({ "modules": modules }))
        })?;
        module.register_method("chain_getGeneratorList", |_, chain, _| {
            let list: Vec<Value> = chain
                .inner
                .read()
                .generators
                .iter()
                .map(|address| json!({ "address": address, "nextAllocatedTime": 0 }))
                .collect();
            Ok::<_, ErrorObjectOwned>(json!({ "list": list }))
        })?;
        module.register_method("chain_getBlockByHeight", |params, chain, _| {
            let HeightParams { height } = params.parse()?;
            match chain.block(height) {
                Some(block) => to_value(block),
                None => Err(not_found(format!(
                    "Block with height {height} does not exist"
                ))),
            }
        })?;
        module.register_method("chain_getBlockByID", |params, chain, _| {
            let IdParams { id } = params.parse()?;
            let block = chain
                .inner
                .read()
                .blocks
                .values()
                .find(|block| block.header.id == id)
                .cloned();
            match block {
                Some(block) => to_value(block),
                None => Err(not_found(format!("Block with id {id} does not exist"))),
            }
        })?;
        module.register_method("pos_getValidator", |params, chain, _| {
            let AddressParams { address } = params.parse()?;
            let validator = chain.inner.read().validators.get(&address).cloned();
            match validator {
                Some(validator) => to_value(validator),
                None => Err(not_found(format!("Validator {address} not found"))),
            }
        })?;
        module.register_method("pos_getAllValidators", |_, chain, _| {
            let validators: Vec<NodeValidator> =
                chain.inner.read().validators.values().cloned().collect();
            to_value(json!({ "validators": validators }))
        })?;

        let handle = server.start(module);
        Ok(Self { addr, handle })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(self) {
        if self.handle.stop().is_ok() {
            self.handle.stopped().await;
        }
    }
}
