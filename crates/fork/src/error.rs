//! Errors of the fork crate.

use crate::snapshot::MergeConflict;
use alloy_primitives::B256;
use revm::database_interface::DBErrorMarker;
use std::{path::PathBuf, sync::Arc};

/// Result alias for reads against a [`StateSource`](crate::StateSource).
pub type FetchResult<T> = Result<T, FetchError>;

/// A failed read against a state source.
///
/// Cheap to clone: the same error is handed to every caller waiting on a memoized key.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The batched call, or the element of it answering `method`, failed.
    #[error("{method} failed: {message}")]
    Rpc { method: &'static str, message: Arc<str> },
    /// The response to `method` did not decode into the expected type.
    #[error("failed to decode {method} response: {message}")]
    Decode { method: &'static str, message: Arc<str> },
    /// The caller cancelled the request before it completed.
    #[error("request cancelled")]
    Cancelled,
    /// The task performing the request died before producing a result.
    #[error("fetch task aborted: {0}")]
    Aborted(Arc<str>),
    /// An in-memory source has no code for the hash.
    #[error("no code known for hash {0}")]
    MissingCode(B256),
}

impl FetchError {
    pub(crate) fn rpc(method: &'static str, message: impl ToString) -> Self {
        Self::Rpc { method, message: message.to_string().into() }
    }

    pub(crate) fn decode(method: &'static str, message: impl ToString) -> Self {
        Self::Decode { method, message: message.to_string().into() }
    }
}

/// Errors surfaced to an execution engine through the revm database traits.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to fetch state: {0}")]
    Fetch(#[from] FetchError),
}

impl DBErrorMarker for DatabaseError {}

/// Result alias for [`DatabaseError`].
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors of the [`SnapshotStore`](crate::SnapshotStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access snapshot {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot {path:?} disagrees with the new state: {source}")]
    Conflict {
        path: PathBuf,
        #[source]
        source: MergeConflict,
    },
    #[error("gave up writing snapshot {path:?} after {attempts} attempts raced with other writers")]
    Contended { path: PathBuf, attempts: u32 },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
