use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Engine, EngineError, EngineKind, Executor, JobResult, ValidationError, cluster_transactions, require_str};
use crate::core::Transaction;
use crate::core::tx::has_change_shape;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletResult {
    pub probability: f64,
    pub conclusion: String,
}

/// Guesses whether a cluster is a personal wallet from how often it makes
/// plain payment-plus-change transactions.
pub struct WalletEngine;

#[async_trait]
impl Engine for WalletEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Wallet
    }

    fn validate_args(&self, args: &Value) -> Option<ValidationError> {
        require_str(args, "needle_address").err()
    }

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError> {
        let needle = require_str(&args, "needle_address").map_err(EngineError::InvalidArgs)?;
        let cluster = executor.cluster(&needle).await?;
        let txs = cluster_transactions(executor, &cluster).await?;
        Ok(JobResult::Wallet(assess(&txs)))
    }
}

pub(crate) fn assess(txs: &[Transaction]) -> WalletResult {
    if txs.is_empty() {
        return WalletResult {
            probability: 0.0,
            conclusion: "Not enough data".to_string(),
        };
    }
    let payments = txs.iter().filter(|tx| has_change_shape(tx)).count();
    let probability = payments as f64 / txs.len() as f64;
    let conclusion = if probability > 0.75 {
        "Surely a wallet"
    } else if probability > 0.25 {
        "Probably a wallet"
    } else {
        "Probably an exchange"
    };
    WalletResult {
        probability,
        conclusion: conclusion.to_string(),
    }
}
