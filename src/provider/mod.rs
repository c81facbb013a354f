pub mod bcoin;
pub mod blockchair;
pub mod blockcypher;
pub mod cache;
pub mod fixture;
pub mod throttle;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{Config, ProviderKind};
use crate::core::{Address, Transaction};
use crate::db::SharedCache;

pub use bcoin::BcoinProvider;
pub use blockchair::BlockchairProvider;
pub use blockcypher::BlockcypherProvider;
pub use cache::CachedProvider;
pub use fixture::FixtureProvider;
pub use throttle::{LenientProvider, ThrottledProvider};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider} API error: {message}")]
    Api {
        provider: &'static str,
        message: String,
    },
    #[error("failed to decode {provider} response: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fixture error: {0}")]
    Fixture(String),
}

/// Source of per-address transaction history.
///
/// Implementations drop coinbase inputs and unresolved (`time == 0`)
/// transactions, and must be safe to call repeatedly for the same address.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError>;
}

pub type SharedProvider = Arc<dyn TransactionProvider>;

/// Drop transactions whose timestamp could not be resolved.
pub(crate) fn resolved_only(txs: Vec<Transaction>) -> Vec<Transaction> {
    txs.into_iter().filter(|tx| tx.time != 0).collect()
}

/// Build the configured backend and wrap it in throttle, cache and lenient layers.
pub fn build_provider(config: &Config) -> Result<SharedProvider, ProviderError> {
    let pc = &config.provider;
    let timeout = Duration::from_secs(pc.request_timeout_secs);

    let backend: SharedProvider = match pc.kind {
        ProviderKind::Bcoin => Arc::new(BcoinProvider::new(&pc.bcoin, pc.chain, timeout)?),
        ProviderKind::Blockchair => {
            Arc::new(BlockchairProvider::new(&pc.blockchair, pc.chain, timeout)?)
        }
        ProviderKind::Blockcypher => {
            Arc::new(BlockcypherProvider::new(&pc.blockcypher, pc.chain, timeout)?)
        }
        ProviderKind::Fixture => {
            let path = pc.fixture_path.as_deref().ok_or_else(|| {
                ProviderError::Fixture("provider.fixture_path is not set".to_string())
            })?;
            let fixture: SharedProvider = Arc::new(FixtureProvider::load(Path::new(path))?);
            info!("Using fixture provider from {path}");
            return Ok(fixture);
        }
    };
    info!(provider = backend.name(), chain = ?pc.chain, "Transaction provider configured");

    let mut provider: SharedProvider = Arc::new(ThrottledProvider::new(
        backend,
        pc.max_concurrent_requests,
        Duration::from_millis(pc.min_request_interval_ms),
    ));

    if config.cache.enabled {
        let path = Path::new(&config.cache.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let cache = SharedCache::open(path)?;
        let purged = cache.purge_expired(chrono::Utc::now().timestamp())?;
        info!("Provider cache opened at {} ({purged} expired entries purged)", config.cache.path);
        provider = Arc::new(CachedProvider::new(
            provider,
            cache,
            chrono::Duration::seconds(config.cache.ttl_secs as i64),
        ));
    }

    if pc.degrade_on_error {
        provider = Arc::new(LenientProvider::new(provider));
    }

    Ok(provider)
}
