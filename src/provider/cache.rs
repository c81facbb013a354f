use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, warn};

use super::{ProviderError, SharedProvider, TransactionProvider};
use crate::core::{Address, Transaction};
use crate::db::SharedCache;

/// Serves repeated address lookups from the SQLite cache.
pub struct CachedProvider {
    inner: SharedProvider,
    cache: SharedCache,
    ttl: Duration,
}

impl CachedProvider {
    pub fn new(inner: SharedProvider, cache: SharedCache, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    fn key(&self, address: &Address) -> String {
        format!("{}_{}", self.inner.name(), address.address)
    }

    fn lookup(&self, key: &str) -> Option<Vec<Transaction>> {
        let body = match self.cache.get(key, Utc::now().timestamp()) {
            Ok(body) => body?,
            Err(e) => {
                warn!("Cache read failed for {key}: {e}");
                return None;
            }
        };
        match serde_json::from_str(&body) {
            Ok(txs) => Some(txs),
            Err(e) => {
                warn!("Discarding undecodable cache entry {key}: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl TransactionProvider for CachedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        let key = self.key(address);
        if let Some(txs) = self.lookup(&key) {
            debug!(address = %address, "Cache hit");
            return Ok(txs);
        }

        let txs = self.inner.fetch_transactions(address).await?;

        match serde_json::to_string(&txs) {
            Ok(body) => {
                let expires_at = (Utc::now() + self.ttl).timestamp();
                if let Err(e) = self.cache.put(&key, &body, expires_at) {
                    warn!("Cache write failed for {key}: {e}");
                }
            }
            Err(e) => warn!("Failed to encode {key} for cache: {e}"),
        }

        Ok(txs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::db::tests::open_temp_cache;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TransactionProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Api {
                    provider: "counting",
                    message: "down".into(),
                });
            }
            Ok(vec![Transaction {
                hash: format!("tx_{}", address.address),
                time: 100,
                inputs: vec![Address::with_value(address.address.clone(), 500)],
                outputs: vec![Address::with_value("out", 400)],
            }])
        }
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = open_temp_cache();
        let provider = CachedProvider::new(inner.clone(), cache.clone(), Duration::seconds(3600));

        let first = provider.fetch_transactions(&Address::new("a")).await.unwrap();
        let second = provider.fetch_transactions(&Address::new("a")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second[0].inputs[0].value, Some(500));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert!(cache.get("counting_a", Utc::now().timestamp()).unwrap().is_some());
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let cache = open_temp_cache();
        let provider = CachedProvider::new(inner.clone(), cache.clone(), Duration::seconds(3600));

        assert!(provider.fetch_transactions(&Address::new("a")).await.is_err());
        assert!(provider.fetch_transactions(&Address::new("a")).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().unwrap(), 0);
    }
}
