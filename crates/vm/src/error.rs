use forksim_fork::{DatabaseError, FetchError, StoreError};

/// Errors of a [`Vm`](crate::Vm) session.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The executor failed, the message left no trace in the state.
    #[error("execution failed: {0}")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid RPC url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("block {0} not found")]
    MissingBlock(u64),
}

impl VmError {
    pub(crate) fn execution(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Execution(Box::new(err))
    }
}
