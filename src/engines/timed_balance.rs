use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Engine, EngineError, EngineKind, Executor, JobResult, ValidationError, cluster_transactions, owned_value,
    require_str,
};

/// Running balance after the transaction at unix time `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePoint {
    pub t: i64,
    pub y: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedBalanceResult {
    pub dataset: Vec<BalancePoint>,
}

/// Cluster balance as a time series, one point per transaction.
pub struct TimedBalanceEngine;

#[async_trait]
impl Engine for TimedBalanceEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::TimedBalance
    }

    fn validate_args(&self, args: &Value) -> Option<ValidationError> {
        require_str(args, "needle_address").err()
    }

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError> {
        let needle = require_str(&args, "needle_address").map_err(EngineError::InvalidArgs)?;
        let cluster = executor.cluster(&needle).await?;
        let members = cluster.address_set();
        let txs = cluster_transactions(executor, &cluster).await?;

        let mut running = 0i64;
        let dataset = txs
            .iter()
            .map(|tx| {
                running += owned_value(&tx.outputs, &members) as i64 - owned_value(&tx.inputs, &members) as i64;
                BalancePoint { t: tx.time, y: running }
            })
            .collect();

        Ok(JobResult::TimedBalance(TimedBalanceResult { dataset }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::testing::{fixture_executor, valued_tx};
    use super::*;

    #[tokio::test]
    async fn running_balance_in_time_order() {
        let executor = fixture_executor(vec![
            valued_tx("spend", 300, &[("a", 700)], &[("shop", 650)]),
            valued_tx("fund1", 100, &[("w", 1_000)], &[("a", 700)]),
            valued_tx("fund2", 200, &[("v", 600)], &[("a", 500)]),
        ]);
        let result = executor
            .execute_for_results(EngineKind::TimedBalance, json!({ "needle_address": "a" }))
            .await
            .unwrap();

        let expected = vec![
            BalancePoint { t: 100, y: 700 },
            BalancePoint { t: 200, y: 1_200 },
            BalancePoint { t: 300, y: 500 },
        ];
        assert_eq!(result, JobResult::TimedBalance(TimedBalanceResult { dataset: expected }));
        assert_eq!(
            serde_json::to_value(result).unwrap()["dataset"][0],
            json!({ "t": 100, "y": 700 })
        );
    }
}
