use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{ProviderError, TransactionProvider, resolved_only};
use crate::config::{BcoinConfig, Chain};
use crate::core::{Address, Transaction};

const NAME: &str = "bcoin";

/// bcoin full-node HTTP client (address-indexed node).
pub struct BcoinProvider {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded x:api_key
}

#[derive(Debug, Deserialize)]
struct CoinResponse {
    address: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct InputResponse {
    // Absent for coinbase inputs.
    coin: Option<CoinResponse>,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    address: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    hash: String,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    inputs: Vec<InputResponse>,
    #[serde(default)]
    outputs: Vec<OutputResponse>,
}

impl BcoinProvider {
    pub fn new(config: &BcoinConfig, chain: Chain, timeout: Duration) -> Result<Self, ProviderError> {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let scheme = if config.ssl { "https" } else { "http" };
        let port = config.port.unwrap_or_else(|| chain.bcoin_default_port());
        let auth = config
            .api_key
            .as_deref()
            .map(|key| STANDARD.encode(format!("x:{key}")));

        Ok(Self {
            url: format!("{scheme}://{}:{port}", config.host),
            client: Client::builder().timeout(timeout).build()?,
            auth,
        })
    }

    /// `GET /tx/address/:address`: every transaction touching the address.
    async fn get_tx_by_address(&self, address: &str) -> Result<Vec<TxResponse>, ProviderError> {
        let mut req = self.client.get(format!("{}/tx/address/{address}", self.url));
        if let Some(auth) = &self.auth {
            req = req.header("Authorization", format!("Basic {auth}"));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: NAME,
                message: format!("{status}: {body}"),
            });
        }

        resp.json().await.map_err(|e| ProviderError::Decode {
            provider: NAME,
            message: e.to_string(),
        })
    }
}

fn into_transaction(tx: TxResponse) -> Transaction {
    let inputs = tx
        .inputs
        .into_iter()
        .filter_map(|input| input.coin)
        .filter_map(|coin| coin.address.map(|a| Address::with_value(a, coin.value)))
        .collect();
    let outputs = tx
        .outputs
        .into_iter()
        .filter_map(|output| output.address.map(|a| Address::with_value(a, output.value)))
        .collect();

    Transaction {
        hash: tx.hash,
        time: tx.time,
        inputs,
        outputs,
    }
}

#[async_trait]
impl TransactionProvider for BcoinProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        debug!(address = %address, "Querying bcoin node");
        let txs = self.get_tx_by_address(&address.address).await?;
        Ok(resolved_only(txs.into_iter().map(into_transaction).collect()))
    }
}
