//! # forksim-fork
//!
//! Lazily fetched chain state for forked simulation.
//!
//! A [`StateSource`] reads accounts, code, storage slots and block hashes at a fixed block,
//! either from a remote endpoint ([`RpcSource`]) or from memory ([`MemorySource`]). The
//! [`StateDb`] puts an overlay on top of a source and implements the revm database traits.
//! Everything read from the source can be merged into a [`SnapshotStore`] so later runs do not
//! fetch it again.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

pub mod db;
pub use db::{AccountState, DbAccount, Overlay, StateDb, StateTrie};

mod error;
pub use error::{DatabaseError, DatabaseResult, FetchError, FetchResult, StoreError};

pub mod memo;
pub use memo::Memo;

pub mod snapshot;
pub use snapshot::{AccountRecord, MergeConflict, SourceId, StateSnapshot};

pub mod source;
pub use source::{MemorySource, RpcSource, StateSource};

pub mod store;
pub use store::{SnapshotCache, SnapshotStore, Versioned};

pub mod transport;
pub use transport::{BatchTransport, RpcCall};

mod utils;
pub use utils::RuntimeOrHandle;

pub use tokio_util::sync::CancellationToken;
