use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep_until};
use tracing::warn;

use super::{ProviderError, SharedProvider, TransactionProvider};
use crate::core::{Address, Transaction};

/// Caps concurrent requests to the wrapped provider and spaces them out.
pub struct ThrottledProvider {
    inner: SharedProvider,
    permits: Semaphore,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl ThrottledProvider {
    pub fn new(inner: SharedProvider, max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrent.max(1)),
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    async fn wait_for_slot(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let start = {
            let mut next = self.next_slot.lock().await;
            let start = (*next).max(Instant::now());
            *next = start + self.min_interval;
            start
        };
        sleep_until(start).await;
    }
}

#[async_trait]
impl TransactionProvider for ThrottledProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ProviderError::Api {
                provider: "throttle",
                message: e.to_string(),
            })?;
        self.wait_for_slot().await;
        self.inner.fetch_transactions(address).await
    }
}

/// Degrades provider failures to an empty history so traversal continues past
/// unreachable addresses.
pub struct LenientProvider {
    inner: SharedProvider,
}

impl LenientProvider {
    pub fn new(inner: SharedProvider) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TransactionProvider for LenientProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        match self.inner.fetch_transactions(address).await {
            Ok(txs) => Ok(txs),
            Err(e) => {
                warn!(address = %address, provider = self.inner.name(), "Fetch failed, treating as empty: {e}");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Counts peak concurrency and optionally fails.
    struct CountingProvider {
        active: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl TransactionProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn fetch_transactions(&self, _address: &Address) -> Result<Vec<Transaction>, ProviderError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Api {
                    provider: "counting",
                    message: "unreachable".into(),
                });
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let counting = Arc::new(CountingProvider::new(false));
        let throttled = Arc::new(ThrottledProvider::new(counting.clone(), 2, Duration::ZERO));

        let calls = (0..8).map(|i| {
            let throttled = throttled.clone();
            tokio::spawn(async move {
                throttled
                    .fetch_transactions(&Address::new(format!("a{i}")))
                    .await
            })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn min_interval_spaces_requests() {
        let counting = Arc::new(CountingProvider::new(false));
        let throttled = ThrottledProvider::new(counting, 4, Duration::from_millis(20));
        let started = std::time::Instant::now();
        for i in 0..3 {
            throttled
                .fetch_transactions(&Address::new(format!("a{i}")))
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn lenient_degrades_to_empty() {
        let lenient = LenientProvider::new(Arc::new(CountingProvider::new(true)));
        let txs = lenient.fetch_transactions(&Address::new("a")).await.unwrap();
        assert!(txs.is_empty());
    }
}
