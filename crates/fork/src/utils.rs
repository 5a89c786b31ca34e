use tokio::runtime::{Handle, Runtime};

/// Drives async fetches from the synchronous revm database traits.
///
/// Reuses the ambient tokio runtime if there is one, otherwise owns a dedicated runtime.
#[derive(Debug)]
pub enum RuntimeOrHandle {
    Runtime(Runtime),
    Handle(Handle),
}

impl Default for RuntimeOrHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeOrHandle {
    /// Captures the current runtime handle, or starts a new multi-threaded runtime.
    ///
    /// # Panics
    ///
    /// If there is no current runtime and a new one cannot be started.
    pub fn new() -> Self {
        match Handle::try_current() {
            Ok(handle) => Self::Handle(handle),
            Err(_) => Self::Runtime(
                tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .unwrap_or_else(|err| panic!("failed to start tokio runtime: {err}")),
            ),
        }
    }

    /// Blocks the current thread on `f`.
    ///
    /// Inside a runtime this uses [`tokio::task::block_in_place`], which requires the
    /// multi-threaded scheduler.
    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        match self {
            Self::Runtime(runtime) => runtime.block_on(f),
            Self::Handle(handle) => tokio::task::block_in_place(|| handle.block_on(f)),
        }
    }

    /// Returns a handle to spawn tasks on.
    pub fn handle(&self) -> &Handle {
        match self {
            Self::Runtime(runtime) => runtime.handle(),
            Self::Handle(handle) => handle,
        }
    }
}
