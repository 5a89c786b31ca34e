//! # forksim-config
//!
//! Settings for forked state simulation: which endpoint and block to fork, and where (and
//! whether) fetched state is cached on disk.
//!
//! Values are merged from, in increasing precedence:
//! - [`ForkConfig::default`]
//! - `forksim.toml` in the current working directory
//! - `FORKSIM_` prefixed environment variables, e.g. `FORKSIM_ETH_RPC_URL`

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod cache;
pub use cache::{CachedChains, CachedEndpoints, StorageCachingConfig};

mod error;
pub use error::ExtractConfigError;

/// Fork configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// The RPC endpoint state is fetched from.
    pub eth_rpc_url: Option<String>,
    /// The block state is fetched at. Resolved to the latest block if unset.
    pub fork_block_number: Option<u64>,
    /// Root directory of the snapshot cache, see [`ForkConfig::cache_dir`].
    pub cache_path: Option<PathBuf>,
    /// Disables the snapshot cache entirely.
    pub no_storage_caching: bool,
    /// Which chains and endpoints are cached.
    pub rpc_storage_caching: StorageCachingConfig,
    /// How many times a snapshot write restarts after losing a race with another writer.
    pub cache_write_retries: u32,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            eth_rpc_url: None,
            fork_block_number: None,
            cache_path: None,
            no_storage_caching: false,
            rpc_storage_caching: StorageCachingConfig::default(),
            cache_write_retries: Self::DEFAULT_CACHE_WRITE_RETRIES,
        }
    }
}

impl ForkConfig {
    /// The name of the config file.
    pub const FILE_NAME: &'static str = "forksim.toml";

    /// The prefix of environment variables that override config values.
    pub const ENV_PREFIX: &'static str = "FORKSIM_";

    /// The name of the directory the default cache lives in, relative to the home dir.
    pub const DIR_NAME: &'static str = ".forksim";

    /// Default bound of the snapshot write retry loop.
    pub const DEFAULT_CACHE_WRITE_RETRIES: u32 = 5;

    /// Returns the default figment: defaults, `forksim.toml` and `FORKSIM_` env vars.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(Self::FILE_NAME))
            .merge(Env::prefixed(Self::ENV_PREFIX))
    }

    /// Loads the config from the default figment.
    pub fn load() -> Result<Self, ExtractConfigError> {
        Self::from_provider(Self::figment())
    }

    /// Extracts a config from the given provider, on top of the defaults.
    pub fn from_provider(provider: impl Provider) -> Result<Self, ExtractConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(provider)
            .extract()
            .map_err(ExtractConfigError::new)?;
        trace!(target: "config", ?config, "extracted config");
        Ok(config)
    }

    /// Whether fetched state of `chain_id` from `endpoint` should be cached.
    pub fn enable_caching(&self, endpoint: &str, chain_id: impl Into<u64>) -> bool {
        !self.no_storage_caching && self.rpc_storage_caching.should_cache(chain_id.into(), endpoint)
    }

    /// Returns the root of the snapshot cache: the configured `cache_path`, or
    /// `~/.forksim/cache/rpc`.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.cache_path.clone().or_else(Self::default_cache_dir)
    }

    /// Returns `~/.forksim/cache/rpc`.
    pub fn default_cache_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(Self::DIR_NAME).join("cache").join("rpc"))
    }

    /// Returns the path to the snapshot file of `block` on `chain_id`:
    /// `<cache_dir>/<chain>/<block>/storage.json`
    pub fn block_cache_file(&self, chain_id: u64, block: u64) -> Option<PathBuf> {
        Some(block_cache_file(&self.cache_dir()?, chain_id, block))
    }
}

/// Returns the snapshot file of `block` on `chain_id` below `root`:
/// `<root>/<chain>/<block>/storage.json`
pub fn block_cache_file(root: &Path, chain_id: u64, block: u64) -> PathBuf {
    root.join(chain_id.to_string()).join(block.to_string()).join("storage.json")
}
