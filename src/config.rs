use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Bcoin,
    Blockchair,
    Blockcypher,
    Fixture,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Mainnet,
    Testnet,
}

impl Chain {
    pub fn bcoin_default_port(self) -> u16 {
        match self {
            Chain::Mainnet => 8332,
            Chain::Testnet => 18332,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub chain: Chain,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub min_request_interval_ms: u64,
    /// Treat fetch failures as empty histories instead of failing the job.
    pub degrade_on_error: bool,
    pub fixture_path: Option<String>,
    pub bcoin: BcoinConfig,
    pub blockchair: BlockchairConfig,
    pub blockcypher: BlockcypherConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BcoinConfig {
    pub host: String,
    /// Defaults to the chain's node port.
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub ssl: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlockchairConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlockcypherConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub path: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub retention_secs: u64,
    pub max_jobs: usize,
    pub sweep_interval_secs: u64,
    /// Unset means paths of any length are searched.
    pub distance_max_depth: Option<usize>,
    pub clusterize_parallelism: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Bcoin,
            chain: Chain::Mainnet,
            request_timeout_secs: 30,
            max_concurrent_requests: 8,
            min_request_interval_ms: 0,
            degrade_on_error: true,
            fixture_path: None,
            bcoin: BcoinConfig::default(),
            blockchair: BlockchairConfig::default(),
            blockcypher: BlockcypherConfig::default(),
        }
    }
}

impl Default for BcoinConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: None,
            api_key: None,
            ssl: false,
        }
    }
}

impl Default for BlockchairConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.blockchair.com".into(),
            api_key: None,
        }
    }
}

impl Default for BlockcypherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.blockcypher.com".into(),
            token: None,
            limit: 50,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "data/provider_cache.db".into(),
            ttl_secs: 3600,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            max_jobs: 10_000,
            sweep_interval_secs: 60,
            distance_max_depth: None,
            clusterize_parallelism: 5,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}
