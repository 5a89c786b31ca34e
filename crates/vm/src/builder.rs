//! Builds a [`Vm`] from a [`ForkConfig`].

use crate::{BlockContext, Executor, Vm, VmError};
use alloy_primitives::{Address, B256, U64};
use alloy_rpc_client::RpcClient;
use forksim_config::ForkConfig;
use forksim_fork::{
    BatchTransport, CancellationToken, FetchError, MemorySource, RpcCall, RpcSource,
    SnapshotCache, SnapshotStore, StateDb, StateSnapshot, StateSource,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Builder of a [`Vm`].
///
/// With an endpoint, state is forked from it: at `fork_block_number - 1`, executing in block
/// `fork_block_number`, or at the latest block, executing in the block after it. If a snapshot
/// of the forked state was persisted before, it is read first and the endpoint only serves what
/// the snapshot is missing.
#[derive(Default)]
#[must_use = "builders do nothing unless built"]
pub struct VmBuilder {
    config: ForkConfig,
    transport: Option<Arc<dyn BatchTransport>>,
    source: Option<Arc<dyn StateSource>>,
    state: StateSnapshot,
    block: Option<BlockContext>,
    cancel: Option<CancellationToken>,
    snapshot_cache: Option<SnapshotCache>,
}

impl VmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: ForkConfig) -> Self {
        Self { config, ..Default::default() }
    }

    /// Forks through `transport` instead of connecting to the configured endpoint.
    pub fn with_transport(mut self, transport: impl BatchTransport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Reads state from `source` instead of forking.
    pub fn with_source(mut self, source: Arc<dyn StateSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Seeds the state before the first message.
    pub fn with_state(mut self, state: StateSnapshot) -> Self {
        self.state = state;
        self
    }

    /// Executes in `block` instead of the block derived from the fork.
    pub fn with_block(mut self, block: BlockContext) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Shares `cache` with the snapshot stores of other sessions in this process.
    pub fn with_snapshot_cache(mut self, cache: SnapshotCache) -> Self {
        self.snapshot_cache = Some(cache);
        self
    }

    pub async fn build<E: Executor>(self, executor: E) -> Result<Vm<E>, VmError> {
        let Self { config, transport, source, state, block, cancel, snapshot_cache } = self;

        let transport = match (transport, &config.eth_rpc_url) {
            (Some(transport), _) => Some(transport),
            (None, Some(url)) => {
                Some(Arc::new(RpcClient::new_http(url.parse()?)) as Arc<dyn BatchTransport>)
            }
            (None, None) => None,
        };

        let (source, header, store) = match (source, transport) {
            (Some(source), _) => (Some(source), None, None),
            (None, Some(transport)) => {
                let (state_block, header) = fetch_fork_header(&*transport, config.fork_block_number).await?;
                let mut rpc = RpcSource::from_arc(transport, state_block);
                if let Some(token) = cancel {
                    rpc = rpc.with_cancellation(token);
                }
                let id = rpc.identity().await?;
                let chain_id = id.map(|id| id.chain_id).unwrap_or(1);

                let endpoint = config.eth_rpc_url.as_deref().unwrap_or_default();
                let store = SnapshotStore::from_config(&config)
                    .filter(|_| config.enable_caching(endpoint, chain_id))
                    .map(|store| match snapshot_cache {
                        Some(cache) => store.with_cache(cache),
                        None => store,
                    });

                let rpc: Arc<dyn StateSource> = Arc::new(rpc);
                let loaded = match (&store, id) {
                    (Some(store), Some(id)) => store.load(id)?.map(|snapshot| (id, snapshot)),
                    _ => None,
                };
                let source = match loaded {
                    Some((id, snapshot)) => {
                        debug!(target: "vm", %id, accounts = snapshot.accounts.len(), "loaded snapshot");
                        Arc::new(MemorySource::new(snapshot).with_identity(id).with_fallback(rpc))
                            as Arc<dyn StateSource>
                    }
                    None => rpc,
                };
                (Some(source), Some((header, chain_id)), store)
            }
            (None, None) => (None, None, None),
        };

        let block = match (block, header) {
            (Some(block), _) => block,
            (None, Some((header, chain_id))) => header.into_context(chain_id),
            (None, None) => BlockContext::default(),
        };

        let db = match source {
            Some(source) => StateDb::with_source(source),
            None => StateDb::new(),
        }
        .with_state(state);

        let vm = Vm::new(db, executor, block);
        Ok(match store {
            Some(store) => vm.with_store(store),
            None => vm,
        })
    }
}

/// The fields of a block header the execution context is derived from.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    number: U64,
    timestamp: U64,
    miner: Address,
    gas_limit: U64,
    base_fee_per_gas: Option<U64>,
    mix_hash: Option<B256>,
}

impl Header {
    fn into_context(self, chain_id: u64) -> BlockContext {
        BlockContext {
            number: self.number.to::<u64>(),
            timestamp: self.timestamp.to::<u64>(),
            coinbase: self.miner,
            gas_limit: self.gas_limit.to::<u64>(),
            base_fee: self.base_fee_per_gas.map(|fee| fee.to::<u64>()).unwrap_or_default(),
            prevrandao: self.mix_hash.unwrap_or_default(),
            chain_id,
        }
    }
}

/// Resolves the block state is read at and the header of the block messages execute in.
async fn fetch_fork_header(
    transport: &dyn BatchTransport,
    fork_block: Option<u64>,
) -> Result<(u64, Header), VmError> {
    match fork_block {
        Some(number) => Ok((number.saturating_sub(1), fetch_header(transport, number).await?)),
        None => {
            let latest = RpcSource::latest_block_number(transport).await?;
            let mut header = fetch_header(transport, latest).await?;
            // The pending block is approximated by the latest header.
            header.number = U64::from(latest + 1);
            Ok((latest, header))
        }
    }
}

async fn fetch_header(transport: &dyn BatchTransport, number: u64) -> Result<Header, VmError> {
    const METHOD: &str = "eth_getBlockByNumber";
    let call = RpcCall::new(METHOD, json!([U64::from(number), false]));
    let value = transport.batch(vec![call]).await?.pop().unwrap_or(Err(FetchError::Rpc {
        method: METHOD,
        message: "empty batch response".into(),
    }))?;
    let header: Option<Header> = serde_json::from_value(value).map_err(|err| FetchError::Decode {
        method: METHOD,
        message: err.to_string().into(),
    })?;
    header.ok_or(VmError::MissingBlock(number))
}
