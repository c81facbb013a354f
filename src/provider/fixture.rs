use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use super::{ProviderError, TransactionProvider, resolved_only};
use crate::core::{Address, Transaction};

/// In-memory provider over a fixed set of transactions.
///
/// Every transaction is indexed under each distinct address it mentions.
#[derive(Debug, Default)]
pub struct FixtureProvider {
    by_address: HashMap<String, Vec<Transaction>>,
}

impl FixtureProvider {
    pub fn from_transactions(transactions: Vec<Transaction>) -> Self {
        let mut by_address: HashMap<String, Vec<Transaction>> = HashMap::new();
        for tx in resolved_only(transactions) {
            let mut seen: Vec<&str> = Vec::new();
            for addr in tx.inputs.iter().chain(tx.outputs.iter()) {
                if seen.contains(&addr.address.as_str()) {
                    continue;
                }
                seen.push(&addr.address);
                by_address
                    .entry(addr.address.clone())
                    .or_default()
                    .push(tx.clone());
            }
        }
        Self { by_address }
    }

    /// Load a JSON array of transactions.
    pub fn load(path: &Path) -> Result<Self, ProviderError> {
        let content = std::fs::read_to_string(path)?;
        let transactions: Vec<Transaction> = serde_json::from_str(&content)
            .map_err(|e| ProviderError::Fixture(format!("{}: {e}", path.display())))?;
        let count = transactions.len();
        let provider = Self::from_transactions(transactions);
        info!("Loaded {count} fixture transactions over {} addresses", provider.address_count());
        Ok(provider)
    }

    /// Number of indexed addresses.
    pub fn address_count(&self) -> usize {
        self.by_address.len()
    }
}

#[async_trait]
impl TransactionProvider for FixtureProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        Ok(self
            .by_address
            .get(&address.address)
            .cloned()
            .unwrap_or_default())
    }
}
