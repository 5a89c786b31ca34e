//! State fetched from a JSON-RPC endpoint.

use super::StateSource;
use crate::{
    error::{FetchError, FetchResult},
    memo::Memo,
    snapshot::{AccountRecord, SourceId, StateSnapshot},
    transport::{BatchTransport, RpcCall},
};
use alloy_primitives::{Address, B256, Bytes, U64, U256, keccak256};
use alloy_rpc_client::RpcClient;
use revm::primitives::KECCAK_EMPTY;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{fmt, sync::Arc};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// A [`StateSource`] reading from a remote endpoint at a fixed block.
///
/// Every key space (accounts, code, storage slots, block hashes) is memoized separately: the
/// first request for a key issues one batched call, concurrent and later requests share its
/// result. Failed fetches are memoized as well, a key that failed once keeps failing for the
/// lifetime of the source.
///
/// Clones share the memo tables.
#[derive(Clone)]
pub struct RpcSource {
    transport: Arc<dyn BatchTransport>,
    block_number: u64,
    cancel: CancellationToken,
    chain_id: Arc<OnceCell<u64>>,
    accounts: Memo<Address, AccountRecord>,
    contracts: Memo<B256, Bytes>,
    storage: Memo<(Address, B256), B256>,
    header_hashes: Memo<u64, B256>,
}

impl RpcSource {
    /// Creates a source reading state at `block_number` through `transport`.
    pub fn new(transport: impl BatchTransport, block_number: u64) -> Self {
        Self::from_arc(Arc::new(transport), block_number)
    }

    /// Like [`RpcSource::new`] for a shared transport.
    pub fn from_arc(transport: Arc<dyn BatchTransport>, block_number: u64) -> Self {
        Self {
            transport,
            block_number,
            cancel: CancellationToken::new(),
            chain_id: Default::default(),
            accounts: Memo::new("accounts"),
            contracts: Memo::new("contracts"),
            storage: Memo::new("storage"),
            header_hashes: Memo::new("header_hashes"),
        }
    }

    /// Creates a source over HTTP.
    pub fn connect(url: &str, block_number: u64) -> Result<Self, url::ParseError> {
        Ok(Self::new(RpcClient::new_http(url.parse()?), block_number))
    }

    /// Fails every fetch that is still running, or started afterwards, once `token` is
    /// cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The block all state is read at.
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Returns the number of the latest block known to `transport`.
    pub async fn latest_block_number(transport: &dyn BatchTransport) -> FetchResult<u64> {
        let mut results = transport.batch(vec![RpcCall::new("eth_blockNumber", json!([]))]).await?;
        let number: U64 = decode("eth_blockNumber", results.pop())?;
        Ok(number.to())
    }

    /// Collects everything fetched successfully so far.
    ///
    /// Storage of accounts that were not fetched themselves is left out.
    pub fn fetched(&self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        snapshot.accounts.extend(self.accounts.resolved());
        snapshot
            .contracts
            .extend(self.contracts.resolved().into_iter().filter(|(hash, _)| *hash != KECCAK_EMPTY));
        for ((address, slot), value) in self.storage.resolved() {
            if let Some(account) = snapshot.accounts.get_mut(&address) {
                account.insert_slot(slot, value);
            }
        }
        snapshot.header_hashes.extend(self.header_hashes.resolved());
        snapshot
    }

    fn block_param(&self) -> U64 {
        U64::from(self.block_number)
    }

    /// Sends `calls` as one batch, unless cancelled first.
    async fn batch(
        transport: Arc<dyn BatchTransport>,
        cancel: CancellationToken,
        calls: Vec<RpcCall>,
    ) -> FetchResult<std::vec::IntoIter<FetchResult<Value>>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            res = transport.batch(calls) => res.map(Vec::into_iter),
        }
    }
}

impl fmt::Debug for RpcSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSource")
            .field("block_number", &self.block_number)
            .field("chain_id", &self.chain_id.get())
            .field("accounts", &self.accounts.len())
            .field("storage", &self.storage.len())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl StateSource for RpcSource {
    async fn account(&self, address: Address) -> FetchResult<AccountRecord> {
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        let contracts = self.contracts.clone();
        let block = self.block_param();
        self.accounts
            .get_or_fetch(address, move || async move {
                debug!(target: "fork::rpc", %address, %block, "fetching account");
                let calls = vec![
                    RpcCall::new("eth_getTransactionCount", json!([address, block])),
                    RpcCall::new("eth_getBalance", json!([address, block])),
                    RpcCall::new("eth_getCode", json!([address, block])),
                ];
                let mut results = Self::batch(transport, cancel, calls).await?;
                let nonce: U64 = decode("eth_getTransactionCount", results.next())?;
                let balance: U256 = decode("eth_getBalance", results.next())?;
                let code: Bytes = decode("eth_getCode", results.next())?;

                let code_hash = if code.is_empty() { KECCAK_EMPTY } else { keccak256(&code) };
                contracts.seed(code_hash, code);
                Ok(AccountRecord::new(nonce.to(), balance, code_hash))
            })
            .await
    }

    /// # Panics
    ///
    /// If no fetched account referenced `hash`.
    async fn code(&self, hash: B256) -> FetchResult<Bytes> {
        match self.contracts.get(&hash) {
            Some(code) => code.await,
            None => panic!("code for hash {hash} requested before any account referencing it"),
        }
    }

    async fn storage(&self, address: Address, slot: B256) -> FetchResult<B256> {
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        let block = self.block_param();
        self.storage
            .get_or_fetch((address, slot), move || async move {
                trace!(target: "fork::rpc", %address, %slot, %block, "fetching storage");
                let calls =
                    vec![RpcCall::new("eth_getStorageAt", json!([address, U256::from_be_bytes(slot.0), block]))];
                let mut results = Self::batch(transport, cancel, calls).await?;
                decode("eth_getStorageAt", results.next())
            })
            .await
    }

    async fn header_hash(&self, number: u64) -> FetchResult<B256> {
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        self.header_hashes
            .get_or_fetch(number, move || async move {
                trace!(target: "fork::rpc", number, "fetching block hash");
                let calls =
                    vec![RpcCall::new("eth_getBlockByNumber", json!([U64::from(number), false]))];
                let mut results = Self::batch(transport, cancel, calls).await?;
                let block: Option<BlockHash> = decode("eth_getBlockByNumber", results.next())?;
                Ok(block.map(|block| block.hash).unwrap_or_default())
            })
            .await
    }

    /// The chain id is requested once; unlike the memoized reads a failed request is retried
    /// by the next caller.
    async fn identity(&self) -> FetchResult<Option<SourceId>> {
        let chain_id = self
            .chain_id
            .get_or_try_init(|| async {
                let calls = vec![RpcCall::new("eth_chainId", json!([]))];
                let mut results =
                    Self::batch(Arc::clone(&self.transport), self.cancel.clone(), calls).await?;
                let chain_id: U64 = decode("eth_chainId", results.next())?;
                debug!(target: "fork::rpc", %chain_id, "resolved chain id");
                Ok::<_, FetchError>(chain_id.to::<u64>())
            })
            .await?;
        Ok(Some(SourceId::new(*chain_id, self.block_number)))
    }
}

/// The only field of a block we care about.
#[derive(Deserialize)]
struct BlockHash {
    hash: B256,
}

/// Decodes the positional result answering `method`.
fn decode<T: DeserializeOwned>(
    method: &'static str,
    result: Option<FetchResult<Value>>,
) -> FetchResult<T> {
    let value = result.ok_or_else(|| FetchError::rpc(method, "missing response in batch"))??;
    serde_json::from_value(value).map_err(|err| FetchError::decode(method, err))
}
