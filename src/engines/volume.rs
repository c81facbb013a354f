use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{
    Engine, EngineError, EngineKind, Executor, JobResult, ValidationError, cluster_transactions, owned_value,
    require_str,
};

/// Total satoshis received by and sent from a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeResult {
    pub inbound: i64,
    pub outbound: i64,
}

pub struct VolumeEngine;

#[async_trait]
impl Engine for VolumeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Volume
    }

    fn validate_args(&self, args: &Value) -> Option<ValidationError> {
        require_str(args, "needle_address").err()
    }

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError> {
        let needle = require_str(&args, "needle_address").map_err(EngineError::InvalidArgs)?;
        let cluster = executor.cluster(&needle).await?;
        let members = cluster.address_set();
        let txs = cluster_transactions(executor, &cluster).await?;

        let (inbound, outbound) = txs.iter().fold((0i64, 0i64), |(inbound, outbound), tx| {
            (
                inbound + owned_value(&tx.outputs, &members) as i64,
                outbound + owned_value(&tx.inputs, &members) as i64,
            )
        });
        info!("Volume of cluster around {needle}: in {inbound} sat, out {outbound} sat");

        Ok(JobResult::Volume(VolumeResult { inbound, outbound }))
    }
}
