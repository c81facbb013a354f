use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{
    Engine, EngineError, EngineKind, Executor, JobResult, ValidationError, cluster_transactions, owned_value,
    require_str,
};
use crate::core::Transaction;

/// Net satoshis held by a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceResult {
    pub balance: i64,
}

pub struct BalanceEngine;

#[async_trait]
impl Engine for BalanceEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Balance
    }

    fn validate_args(&self, args: &Value) -> Option<ValidationError> {
        require_str(args, "needle_address").err()
    }

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError> {
        let needle = require_str(&args, "needle_address").map_err(EngineError::InvalidArgs)?;
        let cluster = executor.cluster(&needle).await?;
        let txs = cluster_transactions(executor, &cluster).await?;
        let balance = net_flow(&txs, &cluster.address_set());
        info!("Balance of cluster around {needle}: {balance} sat");
        Ok(JobResult::Balance(BalanceResult { balance }))
    }
}

/// Received minus spent by cluster members across `txs`.
pub(crate) fn net_flow(txs: &[Transaction], members: &std::collections::HashSet<&str>) -> i64 {
    txs.iter()
        .map(|tx| owned_value(&tx.outputs, members) as i64 - owned_value(&tx.inputs, members) as i64)
        .sum()
}
