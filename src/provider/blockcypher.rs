use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{ProviderError, TransactionProvider, resolved_only};
use crate::config::{BlockcypherConfig, Chain};
use crate::core::{Address, Transaction};

const NAME: &str = "blockcypher";

/// BlockCypher full address endpoint client.
pub struct BlockcypherProvider {
    base_url: String,
    token: Option<String>,
    limit: u32,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct InputResponse {
    // Null for coinbase inputs.
    #[serde(default)]
    addresses: Option<Vec<String>>,
    #[serde(default)]
    output_value: u64,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    #[serde(default)]
    addresses: Option<Vec<String>>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    hash: String,
    received: Option<DateTime<Utc>>,
    #[serde(default)]
    inputs: Vec<InputResponse>,
    #[serde(default)]
    outputs: Vec<OutputResponse>,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    #[serde(default)]
    txs: Vec<TxResponse>,
}

impl BlockcypherProvider {
    pub fn new(config: &BlockcypherConfig, chain: Chain, timeout: Duration) -> Result<Self, ProviderError> {
        let network = match chain {
            Chain::Mainnet => "main",
            Chain::Testnet => "test3",
        };
        Ok(Self {
            base_url: format!("{}/v1/btc/{network}", config.base_url.trim_end_matches('/')),
            token: config.token.clone(),
            limit: config.limit,
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    fn address_url(&self, address: &str) -> String {
        let mut url = format!("{}/addrs/{address}/full?limit={}", self.base_url, self.limit);
        if let Some(token) = &self.token {
            url.push_str(&format!("&token={token}"));
        }
        url
    }
}

fn first_address(addresses: Option<Vec<String>>) -> Option<String> {
    addresses.and_then(|a| a.into_iter().next())
}

fn into_transaction(tx: TxResponse) -> Transaction {
    let inputs = tx
        .inputs
        .into_iter()
        .filter_map(|i| first_address(i.addresses).map(|a| Address::with_value(a, i.output_value)))
        .collect();
    let outputs = tx
        .outputs
        .into_iter()
        .filter_map(|o| first_address(o.addresses).map(|a| Address::with_value(a, o.value)))
        .collect();

    Transaction {
        hash: tx.hash,
        time: tx.received.map(|t| t.timestamp()).unwrap_or(0),
        inputs,
        outputs,
    }
}

#[async_trait]
impl TransactionProvider for BlockcypherProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        debug!(address = %address, "Querying blockcypher");

        let resp = self.client.get(self.address_url(&address.address)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: NAME,
                message: format!("{status}: {body}"),
            });
        }

        let body: AddressResponse = resp.json().await.map_err(|e| ProviderError::Decode {
            provider: NAME,
            message: e.to_string(),
        })?;

        Ok(resolved_only(body.txs.into_iter().map(into_transaction).collect()))
    }
}
