use super::StateSource;
use crate::{
    error::{FetchError, FetchResult},
    snapshot::{AccountRecord, SourceId, StateSnapshot},
};
use alloy_primitives::{Address, B256, Bytes};
use revm::primitives::KECCAK_EMPTY;
use std::{fmt, sync::Arc};

/// A source serving a fixed [`StateSnapshot`].
///
/// Keys missing from the snapshot go to the fallback source if there is one, and resolve to
/// empty values otherwise. Typically wraps a snapshot loaded from disk in front of an
/// [`RpcSource`](super::RpcSource).
#[derive(Clone, Default)]
pub struct MemorySource {
    snapshot: Arc<StateSnapshot>,
    identity: Option<SourceId>,
    fallback: Option<Arc<dyn StateSource>>,
}

impl MemorySource {
    pub fn new(snapshot: StateSnapshot) -> Self {
        Self { snapshot: Arc::new(snapshot), identity: None, fallback: None }
    }

    /// Forwards misses to `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn StateSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Sets the identity reported by [`StateSource::identity`], which otherwise is the
    /// fallback's.
    pub fn with_identity(mut self, identity: SourceId) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("accounts", &self.snapshot.accounts.len())
            .field("contracts", &self.snapshot.contracts.len())
            .field("identity", &self.identity)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl StateSource for MemorySource {
    async fn account(&self, address: Address) -> FetchResult<AccountRecord> {
        if let Some(record) = self.snapshot.accounts.get(&address) {
            return Ok(AccountRecord::new(record.nonce, record.balance, record.code_hash));
        }
        match &self.fallback {
            Some(fallback) => fallback.account(address).await,
            None => Ok(AccountRecord::default()),
        }
    }

    async fn code(&self, hash: B256) -> FetchResult<Bytes> {
        if hash == KECCAK_EMPTY {
            return Ok(Bytes::new());
        }
        if let Some(code) = self.snapshot.contracts.get(&hash) {
            return Ok(code.clone());
        }
        match &self.fallback {
            Some(fallback) => fallback.code(hash).await,
            None => Err(FetchError::MissingCode(hash)),
        }
    }

    async fn storage(&self, address: Address, slot: B256) -> FetchResult<B256> {
        if let Some(value) = self.snapshot.accounts.get(&address).and_then(|acc| acc.slot(&slot)) {
            return Ok(value);
        }
        match &self.fallback {
            Some(fallback) => fallback.storage(address, slot).await,
            None => Ok(B256::ZERO),
        }
    }

    async fn header_hash(&self, number: u64) -> FetchResult<B256> {
        if let Some(hash) = self.snapshot.header_hashes.get(&number) {
            return Ok(*hash);
        }
        match &self.fallback {
            Some(fallback) => fallback.header_hash(number).await,
            None => Ok(B256::ZERO),
        }
    }

    async fn identity(&self) -> FetchResult<Option<SourceId>> {
        if self.identity.is_some() {
            return Ok(self.identity);
        }
        match &self.fallback {
            Some(fallback) => fallback.identity().await,
            None => Ok(None),
        }
    }
}
