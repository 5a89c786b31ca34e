//! The state adapter execution engines read from and write to.

use crate::{
    error::{DatabaseError, DatabaseResult, FetchResult},
    snapshot::{AccountRecord, SourceId, StateSnapshot},
    source::StateSource,
    utils::RuntimeOrHandle,
};
use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use parking_lot::RwLock;
use revm::{
    database_interface::{Database, DatabaseCommit, DatabaseRef},
    primitives::KECCAK_EMPTY,
    state::{AccountInfo, Bytecode, EvmState},
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

/// Whether the storage of an overlay account still has to be completed from the source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccountState {
    /// Storage misses are read from the source.
    #[default]
    None,
    /// Modified by a commit, storage misses are still read from the source.
    Touched,
    /// Created during execution, storage misses are zero.
    StorageCleared,
    /// Destroyed during execution, reads return nothing.
    NotExisting,
}

impl AccountState {
    /// Returns `true` if slots missing from the overlay are known to be zero.
    pub fn is_storage_cleared(&self) -> bool {
        matches!(self, Self::StorageCleared | Self::NotExisting)
    }
}

/// An account in the overlay.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DbAccount {
    pub info: AccountInfo,
    pub storage: HashMap<U256, U256>,
    pub state: AccountState,
}

impl DbAccount {
    pub fn new(info: AccountInfo) -> Self {
        Self { info, ..Default::default() }
    }
}

/// The mutable state an execution works on.
///
/// Cloning it is how a point in time is captured, see [`StateDb::overlay`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overlay {
    pub accounts: HashMap<Address, DbAccount>,
    pub contracts: HashMap<B256, Bytecode>,
    pub block_hashes: HashMap<u64, B256>,
}

/// Trie operations an engine may expect from its state.
///
/// [`StateDb`] is a flat cache and has no trie: every method panics.
pub trait StateTrie {
    /// Commits all changes and returns the new state root.
    fn commit_root(&mut self) -> B256;

    /// Returns the merkle proof of `address`.
    fn account_proof(&self, address: Address) -> Vec<Bytes>;

    /// Returns all trie nodes, keyed by their hash.
    fn nodes(&self) -> Vec<(B256, Bytes)>;
}

/// State presented to an execution engine through the revm database traits.
///
/// Reads are served from the overlay first. Misses are read from the [`StateSource`], written
/// into the overlay and recorded as origin reads; without a source a miss is an empty value.
/// Origin reads are kept apart from the overlay, so restoring an older overlay never causes a
/// key to be fetched twice.
///
/// Writes go to the overlay and require the account to be materialized first, by a read or
/// by seeding it with [`StateDb::insert_account`]. Writing to an account that was never
/// materialized panics.
pub struct StateDb {
    overlay: RwLock<Overlay>,
    origin: RwLock<StateSnapshot>,
    source: Option<Arc<dyn StateSource>>,
    runtime: OnceLock<RuntimeOrHandle>,
}

impl Default for StateDb {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDb")
            .field("accounts", &self.overlay.read().accounts.len())
            .field("origin_accounts", &self.origin.read().accounts.len())
            .field("source", &self.source.is_some())
            .finish_non_exhaustive()
    }
}

impl StateDb {
    /// Creates a database without a source: every miss is an empty value.
    pub fn new() -> Self {
        Self {
            overlay: Default::default(),
            origin: Default::default(),
            source: None,
            runtime: OnceLock::new(),
        }
    }

    /// Creates a database reading misses from `source`.
    pub fn with_source(source: Arc<dyn StateSource>) -> Self {
        Self { source: Some(source), ..Self::new() }
    }

    /// Seeds the overlay with `state`.
    ///
    /// Seeded values are not origin reads and are never persisted.
    pub fn with_state(self, state: StateSnapshot) -> Self {
        {
            let mut overlay = self.overlay.write();
            for (address, record) in state.accounts {
                let code = state.contracts.get(&record.code_hash).cloned();
                let storage = record
                    .storage
                    .iter()
                    .flatten()
                    .map(|(slot, value)| (U256::from_be_bytes(slot.0), U256::from_be_bytes(value.0)))
                    .collect();
                let info = account_info(&record, code);
                overlay.accounts.insert(address, DbAccount { info, storage, ..Default::default() });
            }
            overlay.contracts.extend(state.contracts.into_iter().map(|(hash, code)| (hash, bytecode(code))));
            overlay.block_hashes.extend(state.header_hashes);
        }
        self
    }

    pub fn source(&self) -> Option<&Arc<dyn StateSource>> {
        self.source.as_ref()
    }

    /// Returns the identity of the source, if there is a source and it has one.
    pub async fn identity(&self) -> FetchResult<Option<SourceId>> {
        match &self.source {
            Some(source) => source.identity().await,
            None => Ok(None),
        }
    }

    /// Like [`StateDb::identity`], blocking the current thread.
    pub fn identity_blocking(&self) -> FetchResult<Option<SourceId>> {
        match &self.source {
            Some(source) => self.block_on(source.identity()),
            None => Ok(None),
        }
    }

    /// Returns a copy of the overlay.
    pub fn overlay(&self) -> Overlay {
        self.overlay.read().clone()
    }

    /// Replaces the overlay, origin reads are kept.
    pub fn restore(&self, overlay: Overlay) {
        *self.overlay.write() = overlay;
    }

    /// Returns a copy of everything read from the source so far.
    pub fn origin(&self) -> StateSnapshot {
        self.origin.read().clone()
    }

    /// Fetches the given accounts concurrently and materializes them.
    pub async fn prefetch(&self, addresses: impl IntoIterator<Item = Address>) -> FetchResult<()> {
        let Some(source) = &self.source else { return Ok(()) };
        let pending = addresses.into_iter().filter(|address| {
            !self.overlay.read().accounts.contains_key(address) &&
                !self.origin.read().accounts.contains_key(address)
        });
        let fetched = futures::future::try_join_all(pending.map(|address| async move {
            fetch_account(&**source, address).await.map(|account| (address, account))
        }))
        .await?;

        debug!(target: "fork::db", count = fetched.len(), "prefetched accounts");
        for (address, (record, code)) in fetched {
            let info = self.record_account(address, record, code);
            self.materialize(address, info);
        }
        Ok(())
    }

    /// Returns the code of `address`.
    pub fn code(&self, address: Address) -> DatabaseResult<Bytes> {
        let Some(info) = self.basic_ref(address)? else { return Ok(Bytes::new()) };
        let code = match info.code {
            Some(code) => code,
            None => self.code_by_hash_ref(info.code_hash)?,
        };
        Ok(code.original_bytes())
    }

    /// Returns the size of the code of `address`.
    pub fn code_size(&self, address: Address) -> DatabaseResult<usize> {
        Ok(self.code(address)?.len())
    }

    /// Seeds the overlay with `info` for `address`, keeping storage already known.
    pub fn insert_account(&self, address: Address, mut info: AccountInfo) {
        let mut overlay = self.overlay.write();
        Self::insert_contract(&mut overlay, &mut info);
        let account = overlay.accounts.entry(address).or_default();
        account.info = info;
        if account.state == AccountState::NotExisting {
            account.state = AccountState::None;
        }
    }

    /// Seeds a storage slot, materializing an empty account if needed.
    pub fn insert_storage(&self, address: Address, slot: U256, value: U256) {
        self.overlay.write().accounts.entry(address).or_default().storage.insert(slot, value);
    }

    /// Seeds the hash of block `number`.
    pub fn insert_block_hash(&self, number: u64, hash: B256) {
        self.overlay.write().block_hashes.insert(number, hash);
    }

    /// Sets a storage slot of a materialized account.
    ///
    /// # Panics
    ///
    /// If `address` was never read or seeded.
    pub fn set_storage(&self, address: Address, slot: U256, value: U256) {
        self.with_account_mut("set_storage", address, |account| {
            account.storage.insert(slot, value);
        })
    }

    /// Replaces the info of a materialized account.
    ///
    /// # Panics
    ///
    /// If `address` was never read or seeded.
    pub fn set_account_info(&self, address: Address, mut info: AccountInfo) {
        let mut overlay = self.overlay.write();
        Self::insert_contract(&mut overlay, &mut info);
        let account = Self::account_mut(&mut overlay, "set_account_info", address);
        account.info = info;
        account.state = AccountState::Touched;
    }

    /// Deletes a materialized account and its storage.
    ///
    /// # Panics
    ///
    /// If `address` was never read or seeded.
    pub fn delete_account(&self, address: Address) {
        self.with_account_mut("delete_account", address, |account| {
            account.info = AccountInfo::default();
            account.storage.clear();
            account.state = AccountState::NotExisting;
        })
    }

    /// Replaces the code of a materialized account.
    ///
    /// # Panics
    ///
    /// If `address` was never read or seeded.
    pub fn set_code(&self, address: Address, code: Bytes) {
        let mut overlay = self.overlay.write();
        let mut info = Self::account_mut(&mut overlay, "set_code", address).info.clone();
        info.code_hash = if code.is_empty() { KECCAK_EMPTY } else { keccak256(&code) };
        info.code = Some(bytecode(code));
        Self::insert_contract(&mut overlay, &mut info);
        Self::account_mut(&mut overlay, "set_code", address).info = info;
    }

    fn with_account_mut(&self, op: &str, address: Address, f: impl FnOnce(&mut DbAccount)) {
        let mut overlay = self.overlay.write();
        f(Self::account_mut(&mut overlay, op, address))
    }

    fn account_mut<'a>(overlay: &'a mut Overlay, op: &str, address: Address) -> &'a mut DbAccount {
        match overlay.accounts.get_mut(&address) {
            Some(account) => account,
            None => panic!("{op}: account {address} must be read or seeded before it is written"),
        }
    }

    /// Registers the code of `info` in the overlay's code map.
    fn insert_contract(overlay: &mut Overlay, info: &mut AccountInfo) {
        if let Some(code) = &info.code &&
            !code.is_empty()
        {
            if info.code_hash == KECCAK_EMPTY {
                info.code_hash = code.hash_slow();
            }
            overlay.contracts.entry(info.code_hash).or_insert_with(|| code.clone());
        }
    }

    /// Loads `address` into the overlay unless it is there already.
    fn load_account(&self, address: Address) -> DatabaseResult<Option<AccountInfo>> {
        if let Some(account) = self.overlay.read().accounts.get(&address) {
            return Ok((account.state != AccountState::NotExisting).then(|| account.info.clone()));
        }

        let info = match self.origin_account(address) {
            Some(info) => info,
            None => match &self.source {
                Some(source) => {
                    let (record, code) = self.block_on(fetch_account(&**source, address))?;
                    self.record_account(address, record, code)
                }
                None => AccountInfo::default(),
            },
        };
        Ok(Some(self.materialize(address, info)))
    }

    /// Inserts `info` into the overlay unless a concurrent read won, returns the stored info.
    fn materialize(&self, address: Address, info: AccountInfo) -> AccountInfo {
        let mut overlay = self.overlay.write();
        if let Some(code) = &info.code &&
            !code.is_empty()
        {
            overlay.contracts.entry(info.code_hash).or_insert_with(|| code.clone());
        }
        trace!(target: "fork::db", %address, "materialized account");
        overlay.accounts.entry(address).or_insert_with(|| DbAccount::new(info)).info.clone()
    }

    /// Returns the recorded origin read of `address`.
    fn origin_account(&self, address: Address) -> Option<AccountInfo> {
        let origin = self.origin.read();
        let record = origin.accounts.get(&address)?;
        Some(account_info(record, origin.contracts.get(&record.code_hash).cloned()))
    }

    /// Records an account read from the source, returns the recorded info.
    fn record_account(&self, address: Address, record: AccountRecord, code: Bytes) -> AccountInfo {
        let mut guard = self.origin.write();
        let origin = &mut *guard;
        if !code.is_empty() {
            origin.contracts.entry(record.code_hash).or_insert(code);
        }
        let record = origin.accounts.entry(address).or_insert(record);
        account_info(record, origin.contracts.get(&record.code_hash).cloned())
    }

    /// Makes sure the origin record of `address` exists, so that slots can be recorded.
    fn ensure_origin_account(&self, source: &dyn StateSource, address: Address) -> FetchResult<()> {
        if self.origin.read().accounts.contains_key(&address) {
            return Ok(());
        }
        let (record, code) = self.block_on(fetch_account(source, address))?;
        self.record_account(address, record, code);
        Ok(())
    }

    fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.runtime.get_or_init(RuntimeOrHandle::new).block_on(f)
    }
}

impl DatabaseRef for StateDb {
    type Error = DatabaseError;

    fn basic_ref(&self, address: Address) -> DatabaseResult<Option<AccountInfo>> {
        self.load_account(address)
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> DatabaseResult<Bytecode> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        if let Some(code) = self.overlay.read().contracts.get(&code_hash) {
            return Ok(code.clone());
        }

        let recorded = self.origin.read().contracts.get(&code_hash).cloned();
        let code = match (recorded, &self.source) {
            (Some(code), _) => code,
            (None, Some(source)) => {
                let code = self.block_on(source.code(code_hash))?;
                self.origin.write().contracts.entry(code_hash).or_insert(code).clone()
            }
            (None, None) => return Ok(Bytecode::default()),
        };
        let code = bytecode(code);
        Ok(self.overlay.write().contracts.entry(code_hash).or_insert(code).clone())
    }

    fn storage_ref(&self, address: Address, index: U256) -> DatabaseResult<U256> {
        if let Some(account) = self.overlay.read().accounts.get(&address) {
            if let Some(value) = account.storage.get(&index) {
                return Ok(*value);
            }
            if account.state.is_storage_cleared() {
                return Ok(U256::ZERO);
            }
        }
        self.load_account(address)?;

        let slot = B256::from(index);
        let recorded = self.origin.read().accounts.get(&address).and_then(|account| account.slot(&slot));
        let value = match (recorded, &self.source) {
            (Some(value), _) => value,
            (None, Some(source)) => {
                self.ensure_origin_account(&**source, address)?;
                let value = self.block_on(source.storage(address, slot))?;
                if let Some(account) = self.origin.write().accounts.get_mut(&address) {
                    account.insert_slot(slot, value);
                }
                value
            }
            (None, None) => B256::ZERO,
        };

        let value = U256::from_be_bytes(value.0);
        let mut overlay = self.overlay.write();
        Ok(match overlay.accounts.get_mut(&address) {
            Some(account) => *account.storage.entry(index).or_insert(value),
            None => value,
        })
    }

    fn block_hash_ref(&self, number: u64) -> DatabaseResult<B256> {
        if let Some(hash) = self.overlay.read().block_hashes.get(&number) {
            return Ok(*hash);
        }

        let recorded = self.origin.read().header_hashes.get(&number).copied();
        let hash = match (recorded, &self.source) {
            (Some(hash), _) => hash,
            (None, Some(source)) => {
                let hash = self.block_on(source.header_hash(number))?;
                *self.origin.write().header_hashes.entry(number).or_insert(hash)
            }
            (None, None) => B256::ZERO,
        };
        Ok(*self.overlay.write().block_hashes.entry(number).or_insert(hash))
    }
}

impl Database for StateDb {
    type Error = DatabaseError;

    fn basic(&mut self, address: Address) -> DatabaseResult<Option<AccountInfo>> {
        self.basic_ref(address)
    }

    fn code_by_hash(&mut self, code_hash: B256) -> DatabaseResult<Bytecode> {
        self.code_by_hash_ref(code_hash)
    }

    fn storage(&mut self, address: Address, index: U256) -> DatabaseResult<U256> {
        self.storage_ref(address, index)
    }

    fn block_hash(&mut self, number: u64) -> DatabaseResult<B256> {
        self.block_hash_ref(number)
    }
}

impl DatabaseCommit for StateDb {
    /// # Panics
    ///
    /// If a touched account was never read or seeded.
    fn commit(&mut self, changes: EvmState) {
        let overlay = self.overlay.get_mut();
        for (address, mut account) in changes {
            if !account.is_touched() {
                continue;
            }
            if account.is_selfdestructed() {
                let db_account = Self::account_mut(overlay, "commit", address);
                db_account.info = AccountInfo::default();
                db_account.storage.clear();
                db_account.state = AccountState::NotExisting;
                continue;
            }

            let is_created = account.is_created();
            Self::insert_contract(overlay, &mut account.info);
            let db_account = Self::account_mut(overlay, "commit", address);
            db_account.info = account.info;
            db_account.state = if is_created {
                db_account.storage.clear();
                AccountState::StorageCleared
            } else if db_account.state.is_storage_cleared() {
                AccountState::StorageCleared
            } else {
                AccountState::Touched
            };
            db_account
                .storage
                .extend(account.storage.into_iter().map(|(slot, value)| (slot, value.present_value())));
        }
    }
}

impl StateTrie for StateDb {
    fn commit_root(&mut self) -> B256 {
        panic!("commit_root: StateDb is a flat cache without a trie")
    }

    fn account_proof(&self, address: Address) -> Vec<Bytes> {
        panic!("account_proof({address}): StateDb is a flat cache without a trie")
    }

    fn nodes(&self) -> Vec<(B256, Bytes)> {
        panic!("nodes: StateDb is a flat cache without a trie")
    }
}

/// Reads an account and, if it has any, its code.
async fn fetch_account(
    source: &dyn StateSource,
    address: Address,
) -> FetchResult<(AccountRecord, Bytes)> {
    let record = source.account(address).await?;
    let code = if record.code_hash == KECCAK_EMPTY {
        Bytes::new()
    } else {
        source.code(record.code_hash).await?
    };
    Ok((AccountRecord::new(record.nonce, record.balance, record.code_hash), code))
}

fn account_info(record: &AccountRecord, code: Option<Bytes>) -> AccountInfo {
    let mut info = AccountInfo::default();
    info.nonce = record.nonce;
    info.balance = record.balance;
    info.code_hash = record.code_hash;
    if record.code_hash != KECCAK_EMPTY {
        info.code = code.map(bytecode);
    }
    info
}

fn bytecode(code: Bytes) -> Bytecode {
    Bytecode::new_raw_checked(code.clone()).unwrap_or_else(|_| Bytecode::new_legacy(code))
}
