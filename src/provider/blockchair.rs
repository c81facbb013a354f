use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::future::try_join_all;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ProviderError, TransactionProvider, resolved_only};
use crate::config::{BlockchairConfig, Chain};
use crate::core::{Address, Transaction};

const NAME: &str = "blockchair";

/// Blockchair accepts at most this many hashes per transactions dashboard call.
const TX_BATCH: usize = 10;

/// Blockchair REST dashboards client.
pub struct BlockchairProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct AddressDashboard {
    #[serde(default)]
    transactions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TxHeader {
    hash: String,
    time: String,
}

#[derive(Debug, Deserialize)]
struct InputResponse {
    recipient: Option<String>,
    value: u64,
    #[serde(default)]
    is_from_coinbase: bool,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    recipient: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct TxDashboard {
    transaction: TxHeader,
    #[serde(default)]
    inputs: Vec<InputResponse>,
    #[serde(default)]
    outputs: Vec<OutputResponse>,
}

impl BlockchairProvider {
    pub fn new(config: &BlockchairConfig, chain: Chain, timeout: Duration) -> Result<Self, ProviderError> {
        let chain_path = match chain {
            Chain::Mainnet => "bitcoin",
            Chain::Testnet => "bitcoin/testnet",
        };
        Ok(Self {
            base_url: format!("{}/{chain_path}", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    fn url(&self, suffix: &str) -> String {
        let url = format!("{}/{suffix}", self.base_url);
        match &self.api_key {
            Some(key) if url.contains('?') => format!("{url}&key={key}"),
            Some(key) => format!("{url}?key={key}"),
            None => url,
        }
    }

    async fn get(&self, suffix: &str) -> Result<Value, ProviderError> {
        let resp = self.client.get(self.url(suffix)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: NAME,
                message: format!("{status}: {body}"),
            });
        }
        resp.json().await.map_err(|e| decode_error(e.to_string()))
    }

    async fn transaction_hashes(&self, address: &str) -> Result<Vec<String>, ProviderError> {
        let body = self
            .get(&format!("dashboards/address/{address}?limit=10000,0"))
            .await?;
        match body.get("data").and_then(|d| d.get(address)) {
            Some(entry) => {
                let dashboard: AddressDashboard = serde_json::from_value(entry.clone())
                    .map_err(|e| decode_error(e.to_string()))?;
                Ok(dashboard.transactions)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn transactions_batch(&self, hashes: &[String]) -> Result<Vec<Transaction>, ProviderError> {
        let body = self
            .get(&format!("dashboards/transactions/{}", hashes.join(",")))
            .await?;
        let Some(data) = body.get("data") else {
            return Ok(Vec::new());
        };

        let mut txs = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let Some(entry) = data.get(hash) else {
                debug!("Blockchair returned no data for tx {hash}");
                continue;
            };
            let dashboard: TxDashboard = serde_json::from_value(entry.clone())
                .map_err(|e| decode_error(e.to_string()))?;
            txs.push(into_transaction(dashboard)?);
        }
        Ok(txs)
    }
}

fn decode_error(message: String) -> ProviderError {
    ProviderError::Decode {
        provider: NAME,
        message,
    }
}

/// Blockchair times are `YYYY-MM-DD HH:MM:SS` in UTC.
fn parse_time(raw: &str) -> Result<i64, ProviderError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc().timestamp())
        .map_err(|e| decode_error(format!("bad time {raw:?}: {e}")))
}

fn into_transaction(tx: TxDashboard) -> Result<Transaction, ProviderError> {
    let inputs = tx
        .inputs
        .into_iter()
        .filter(|input| !input.is_from_coinbase)
        .filter_map(|input| input.recipient.map(|r| Address::with_value(r, input.value)))
        .collect();
    let outputs = tx
        .outputs
        .into_iter()
        .filter_map(|output| output.recipient.map(|r| Address::with_value(r, output.value)))
        .collect();

    Ok(Transaction {
        time: parse_time(&tx.transaction.time)?,
        hash: tx.transaction.hash,
        inputs,
        outputs,
    })
}

#[async_trait]
impl TransactionProvider for BlockchairProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        debug!(address = %address, "Querying blockchair");

        let mut hashes = self.transaction_hashes(&address.address).await?;
        hashes.sort();

        let batches = try_join_all(
            hashes
                .chunks(TX_BATCH)
                .map(|chunk| self.transactions_batch(chunk)),
        )
        .await?;

        Ok(resolved_only(batches.into_iter().flatten().collect()))
    }
}
