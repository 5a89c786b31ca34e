//! Where origin state comes from.

use crate::{
    error::FetchResult,
    snapshot::{AccountRecord, SourceId},
};
use alloy_primitives::{Address, B256, Bytes};
use std::sync::Arc;

mod memory;
pub use memory::MemorySource;

mod rpc;
pub use rpc::RpcSource;

/// Read access to chain state at one fixed block.
///
/// Keys that do not exist on the source resolve to empty values: an empty account, a zero
/// slot, a zero block hash. Only transport level problems are errors.
#[async_trait::async_trait]
pub trait StateSource: Send + Sync + 'static {
    /// Returns nonce, balance and code hash of `address`. The returned record carries no
    /// storage.
    async fn account(&self, address: Address) -> FetchResult<AccountRecord>;

    /// Returns the code stored under `hash`.
    async fn code(&self, hash: B256) -> FetchResult<Bytes>;

    /// Returns the value of `slot` in the storage of `address`.
    async fn storage(&self, address: Address, slot: B256) -> FetchResult<B256>;

    /// Returns the canonical hash of block `number`.
    async fn header_hash(&self, number: u64) -> FetchResult<B256>;

    /// Returns the key snapshots of this source are stored under, if it has one.
    async fn identity(&self) -> FetchResult<Option<SourceId>>;
}

#[async_trait::async_trait]
impl<S: StateSource + ?Sized> StateSource for Arc<S> {
    async fn account(&self, address: Address) -> FetchResult<AccountRecord> {
        (**self).account(address).await
    }

    async fn code(&self, hash: B256) -> FetchResult<Bytes> {
        (**self).code(hash).await
    }

    async fn storage(&self, address: Address, slot: B256) -> FetchResult<B256> {
        (**self).storage(address, slot).await
    }

    async fn header_hash(&self, number: u64) -> FetchResult<B256> {
        (**self).header_hash(number).await
    }

    async fn identity(&self) -> FetchResult<Option<SourceId>> {
        (**self).identity().await
    }
}
