//! Rules deciding which fetched state is cached on disk.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Chain ids that are never cached because their state is local and ephemeral.
pub const DEV_CHAIN_IDS: [u64; 3] = [99, 1337, 31337];

/// Which chains and endpoints get their fetched state cached.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCachingConfig {
    pub chains: CachedChains,
    pub endpoints: CachedEndpoints,
}

impl StorageCachingConfig {
    /// Whether state of `chain_id` fetched from `endpoint` is cached.
    ///
    /// Dev chains are never cached, whatever the rules say.
    pub fn should_cache(&self, chain_id: u64, endpoint: &str) -> bool {
        !DEV_CHAIN_IDS.contains(&chain_id) &&
            self.chains.contains(chain_id) &&
            self.endpoints.is_match(endpoint)
    }
}

/// Chains to cache, `"all"`, `"none"` or a list of chain ids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ChainsRepr", into = "ChainsRepr")]
pub enum CachedChains {
    #[default]
    All,
    None,
    Only(Vec<u64>),
}

impl CachedChains {
    pub fn contains(&self, chain_id: u64) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Only(ids) => ids.contains(&chain_id),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ChainsRepr {
    Keyword(String),
    Ids(Vec<u64>),
}

impl TryFrom<ChainsRepr> for CachedChains {
    type Error = String;

    fn try_from(repr: ChainsRepr) -> Result<Self, Self::Error> {
        match repr {
            ChainsRepr::Ids(ids) => Ok(Self::Only(ids)),
            ChainsRepr::Keyword(keyword) => match keyword.as_str() {
                "all" => Ok(Self::All),
                "none" => Ok(Self::None),
                other => Err(format!(
                    "unknown chain selection `{other}`, expected \"all\", \"none\" or chain ids"
                )),
            },
        }
    }
}

impl From<CachedChains> for ChainsRepr {
    fn from(chains: CachedChains) -> Self {
        match chains {
            CachedChains::All => Self::Keyword("all".into()),
            CachedChains::None => Self::Keyword("none".into()),
            CachedChains::Only(ids) => Self::Ids(ids),
        }
    }
}

/// Endpoints to cache: `"all"`, `"remote"` (anything not on the loopback interface) or a regex.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CachedEndpoints {
    #[default]
    All,
    Remote,
    Matching(regex::Regex),
}

impl CachedEndpoints {
    pub fn is_match(&self, endpoint: &str) -> bool {
        match self {
            Self::All => true,
            Self::Remote => !is_loopback(endpoint),
            Self::Matching(re) => re.is_match(endpoint),
        }
    }
}

fn is_loopback(endpoint: &str) -> bool {
    ["localhost:", "127.0.0.1:", "[::1]:"].iter().any(|host| endpoint.contains(host))
}

impl PartialEq for CachedEndpoints {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for CachedEndpoints {}

impl fmt::Display for CachedEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Remote => f.write_str("remote"),
            Self::Matching(re) => f.write_str(re.as_str()),
        }
    }
}

impl FromStr for CachedEndpoints {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => Self::All,
            "remote" => Self::Remote,
            pattern => Self::Matching(pattern.parse()?),
        })
    }
}

impl TryFrom<String> for CachedEndpoints {
    type Error = regex::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CachedEndpoints> for String {
    fn from(endpoints: CachedEndpoints) -> Self {
        endpoints.to_string()
    }
}
