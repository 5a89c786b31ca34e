//! Durable snapshot files shared by independent runs.
//!
//! Files are only ever replaced through a read, merge, write cycle: the latest file is read
//! and fingerprinted, the new state is merged into it, and the result is written to a
//! temporary file that replaces the original only if the fingerprint did not change in the
//! meantime. A writer that lost the race starts over against the new file.
//!
//! Writers of different processes are serialized by an exclusive lock on a sibling
//! `<file>.lock`, readers take the same lock shared.

use crate::{
    error::StoreError,
    snapshot::{SourceId, StateSnapshot},
};
use alloy_primitives::{B256, keccak256};
use forksim_config::ForkConfig;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A snapshot as it was read from disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    /// Hash of the file contents.
    pub version: B256,
    pub snapshot: StateSnapshot,
}

/// Per-path state shared by all stores of a process that were handed the same cache.
///
/// Holds the last version seen of every file and serializes writers of the same path.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCache {
    files: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Option<Versioned>>>>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets all cached files.
    pub fn clear(&self) {
        self.files.lock().clear();
    }

    /// Number of files cached.
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, path: &Path) -> Arc<Mutex<Option<Versioned>>> {
        Arc::clone(self.files.lock().entry(path.to_path_buf()).or_default())
    }
}

/// Snapshot files below a root directory, one per [`SourceId`].
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    cache: SnapshotCache,
    max_retries: u32,
}

impl SnapshotStore {
    /// Creates a store below `root` with its own [`SnapshotCache`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: SnapshotCache::default(),
            max_retries: ForkConfig::DEFAULT_CACHE_WRITE_RETRIES,
        }
    }

    /// Creates a store from the cache settings of `config`, `None` if caching is disabled or
    /// there is no cache directory.
    pub fn from_config(config: &ForkConfig) -> Option<Self> {
        if config.no_storage_caching {
            return None;
        }
        Some(Self::new(config.cache_dir()?).with_max_retries(config.cache_write_retries))
    }

    /// Shares `cache` with other stores.
    pub fn with_cache(mut self, cache: SnapshotCache) -> Self {
        self.cache = cache;
        self
    }

    /// Sets how many times a write restarts after losing a race.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file the snapshot of `id` is stored in.
    pub fn path(&self, id: SourceId) -> PathBuf {
        forksim_config::block_cache_file(&self.root, id.chain_id, id.block_number)
    }

    /// Returns the snapshot of `id`, if there is one.
    ///
    /// Files already seen by this process are served from the cache.
    pub fn load(&self, id: SourceId) -> Result<Option<StateSnapshot>, StoreError> {
        let path = self.path(id);
        let entry = self.cache.entry(&path);
        let mut cached = entry.lock();
        if let Some(versioned) = &*cached {
            trace!(target: "fork::cache", ?path, "serving cached snapshot");
            return Ok(Some(versioned.snapshot.clone()));
        }

        if !path.exists() {
            return Ok(None);
        }
        let lock = open_lock(&path)?;
        let _guard = lock.read().map_err(|err| StoreError::io(lock_path(&path), err))?;
        let current = read_versioned(&path)?;
        let snapshot = current.as_ref().map(|versioned| versioned.snapshot.clone());
        *cached = current;
        Ok(snapshot)
    }

    /// Merges `snapshot` into the stored snapshot of `id`.
    ///
    /// Returns `true` if the file was written, `false` if it already contained everything.
    pub fn persist(&self, id: SourceId, snapshot: &StateSnapshot) -> Result<bool, StoreError> {
        let path = self.path(id);
        let entry = self.cache.entry(&path);
        let mut cached = entry.lock();

        let mut lock = open_lock(&path)?;
        let _guard = lock.write().map_err(|err| StoreError::io(lock_path(&path), err))?;
        trace!(target: "fork::cache", ?path, "acquired snapshot lock");

        let attempts = self.max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let current = read_versioned(&path)?;
            let expected = current.as_ref().map(|versioned| versioned.version);
            let mut merged = current.map(|versioned| versioned.snapshot).unwrap_or_default();
            let changed = merged
                .merge(snapshot)
                .map_err(|source| StoreError::Conflict { path: path.clone(), source })?;

            if !changed {
                trace!(target: "fork::cache", ?path, "snapshot already up to date");
                *cached = expected.map(|version| Versioned { version, snapshot: merged });
                return Ok(false);
            }

            match write_if_unchanged(&path, expected, &merged)? {
                Some(version) => {
                    debug!(target: "fork::cache", ?path, attempt, "wrote snapshot");
                    *cached = Some(Versioned { version, snapshot: merged });
                    return Ok(true);
                }
                None => {
                    debug!(target: "fork::cache", ?path, attempt, "snapshot changed while writing, retrying");
                }
            }
        }

        warn!(target: "fork::cache", ?path, attempts, "giving up on contended snapshot");
        Err(StoreError::Contended { path, attempts })
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Opens the lock guarding the snapshot at `path`, creating its directory if needed.
fn open_lock(path: &Path) -> Result<fd_lock::RwLock<File>, StoreError> {
    let lock_path = lock_path(path);
    if let Some(dir) = lock_path.parent() {
        fs::create_dir_all(dir).map_err(|err| StoreError::io(dir, err))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| StoreError::io(&lock_path, err))?;
    Ok(fd_lock::RwLock::new(file))
}

/// Reads the snapshot at `path`, `None` if there is no file.
pub(crate) fn read_versioned(path: &Path) -> Result<Option<Versioned>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let snapshot = serde_json::from_slice(&bytes)
        .map_err(|source| StoreError::Json { path: path.to_path_buf(), source })?;
    Ok(Some(Versioned { version: keccak256(&bytes), snapshot }))
}

/// Returns the version of the file at `path` without parsing it.
fn read_version(path: &Path) -> Result<Option<B256>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(keccak256(bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Replaces the file at `path` with `snapshot` if its version still is `expected`.
///
/// Returns the new version, or `None` if another writer got there first.
pub(crate) fn write_if_unchanged(
    path: &Path,
    expected: Option<B256>,
    snapshot: &StateSnapshot,
) -> Result<Option<B256>, StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| StoreError::io(dir, err))?;

    let mut bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|source| StoreError::Json { path: path.to_path_buf(), source })?;
    bytes.push(b'\n');

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| StoreError::io(dir, err))?;
    tmp.write_all(&bytes).map_err(|err| StoreError::io(tmp.path(), err))?;
    tmp.as_file().sync_all().map_err(|err| StoreError::io(tmp.path(), err))?;

    if read_version(path)? != expected {
        return Ok(None);
    }
    tmp.persist(path).map_err(|err| StoreError::io(path, err.error))?;
    Ok(Some(keccak256(&bytes)))
}
