//! Mergeable snapshots of state read from a source.

use alloy_primitives::{Address, B256, Bytes, U256};
use revm::primitives::KECCAK_EMPTY;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The key a snapshot is stored under: the chain and the block its state was read at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceId {
    pub chain_id: u64,
    pub block_number: u64,
}

impl SourceId {
    pub fn new(chain_id: u64, block_number: u64) -> Self {
        Self { chain_id, block_number }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {} at block {}", self.chain_id, self.block_number)
    }
}

/// State of a single account as read from a source.
///
/// `storage` is `None` until the first slot of the account was read, which keeps "no slot
/// fetched yet" apart from "known to be empty".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<BTreeMap<B256, B256>>,
}

impl Default for AccountRecord {
    fn default() -> Self {
        Self { nonce: 0, balance: U256::ZERO, code_hash: KECCAK_EMPTY, storage: None }
    }
}

impl AccountRecord {
    /// Creates a record without any fetched storage.
    pub fn new(nonce: u64, balance: U256, code_hash: B256) -> Self {
        Self { nonce, balance, code_hash, storage: None }
    }

    /// Returns the value of `slot` if it was recorded.
    pub fn slot(&self, slot: &B256) -> Option<B256> {
        self.storage.as_ref().and_then(|storage| storage.get(slot).copied())
    }

    /// Records the value of `slot`.
    pub fn insert_slot(&mut self, slot: B256, value: B256) {
        self.storage.get_or_insert_with(Default::default).insert(slot, value);
    }

    /// Merges `other` into `self`.
    ///
    /// Returns whether `self` changed. On conflict `self` is left untouched.
    pub fn merge(&mut self, other: &Self) -> Result<bool, MergeConflict> {
        if self.nonce != other.nonce {
            return Err(MergeConflict::field("nonce", self.nonce, other.nonce));
        }
        if self.balance != other.balance {
            return Err(MergeConflict::field("balance", self.balance, other.balance));
        }
        if self.code_hash != other.code_hash {
            return Err(MergeConflict::field("codeHash", self.code_hash, other.code_hash));
        }

        let Some(theirs) = &other.storage else { return Ok(false) };
        if self.storage.is_none() {
            self.storage = Some(theirs.clone());
            return Ok(true);
        }
        let ours = self.storage.get_or_insert_with(Default::default);

        let mut missing = Vec::new();
        for (slot, value) in theirs {
            match ours.get(slot) {
                Some(existing) if existing != value => {
                    return Err(MergeConflict::Storage { slot: *slot, left: *existing, right: *value });
                }
                Some(_) => {}
                None => missing.push((*slot, *value)),
            }
        }
        let changed = !missing.is_empty();
        ours.extend(missing);
        Ok(changed)
    }
}

/// A point-in-time collection of accounts, code and header hashes read from a source.
///
/// All maps are ordered so that serializing unchanged data always yields the same bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(default)]
    pub accounts: BTreeMap<Address, AccountRecord>,
    #[serde(default)]
    pub contracts: BTreeMap<B256, Bytes>,
    #[serde(default)]
    pub header_hashes: BTreeMap<u64, B256>,
}

impl StateSnapshot {
    /// Returns `true` if the snapshot holds no data at all.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.contracts.is_empty() && self.header_hashes.is_empty()
    }

    /// Merges `other` into `self`, rejecting any disagreement between the two.
    ///
    /// Returns whether `self` changed. The merge is atomic: on conflict `self` is untouched.
    pub fn merge(&mut self, other: &Self) -> Result<bool, MergeConflict> {
        if other.is_empty() {
            return Ok(false);
        }
        let mut merged = self.clone();
        let changed = merged.merge_in_place(other)?;
        if changed {
            *self = merged;
        }
        Ok(changed)
    }

    fn merge_in_place(&mut self, other: &Self) -> Result<bool, MergeConflict> {
        let mut changed = false;

        for (hash, code) in &other.contracts {
            match self.contracts.get(hash) {
                Some(existing) if existing != code => {
                    return Err(MergeConflict::Code {
                        hash: *hash,
                        left: existing.clone(),
                        right: code.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    self.contracts.insert(*hash, code.clone());
                    changed = true;
                }
            }
        }

        for (number, hash) in &other.header_hashes {
            match self.header_hashes.get(number) {
                Some(existing) if existing != hash => {
                    return Err(MergeConflict::HeaderHash {
                        number: *number,
                        left: *existing,
                        right: *hash,
                    });
                }
                Some(_) => {}
                None => {
                    self.header_hashes.insert(*number, *hash);
                    changed = true;
                }
            }
        }

        for (address, account) in &other.accounts {
            match self.accounts.get_mut(address) {
                Some(existing) => {
                    changed |= existing.merge(account).map_err(|err| MergeConflict::Account {
                        address: *address,
                        source: Box::new(err),
                    })?;
                }
                None => {
                    self.accounts.insert(*address, account.clone());
                    changed = true;
                }
            }
        }

        Ok(changed)
    }
}

/// A disagreement between two snapshots about the value of the same key.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MergeConflict {
    #[error("conflicting {field}: {left} != {right}")]
    Field { field: &'static str, left: String, right: String },
    #[error("conflicting storage slot {slot}: {left} != {right}")]
    Storage { slot: B256, left: B256, right: B256 },
    #[error("conflicting code for hash {hash}: {left} != {right}")]
    Code { hash: B256, left: Bytes, right: Bytes },
    #[error("conflicting header hash for block {number}: {left} != {right}")]
    HeaderHash { number: u64, left: B256, right: B256 },
    #[error("account {address}: {source}")]
    Account {
        address: Address,
        #[source]
        source: Box<MergeConflict>,
    },
}

impl MergeConflict {
    fn field(field: &'static str, left: impl fmt::Display, right: impl fmt::Display) -> Self {
        Self::Field { field, left: left.to_string(), right: right.to_string() }
    }
}
