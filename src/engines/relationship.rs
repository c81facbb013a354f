use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{Engine, EngineError, EngineKind, Executor, JobResult, ValidationError, require_str};
use crate::core::{Cluster, Edge};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipResult {
    pub left_cluster: Cluster,
    pub right_cluster: Cluster,
    pub cross_edges: Vec<Edge>,
}

/// Payments between the clusters of two addresses, in both directions.
pub struct RelationshipEngine;

#[async_trait]
impl Engine for RelationshipEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Relationship
    }

    fn validate_args(&self, args: &Value) -> Option<ValidationError> {
        require_str(args, "left").err().or_else(|| require_str(args, "right").err())
    }

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError> {
        let left = require_str(&args, "left").map_err(EngineError::InvalidArgs)?;
        let right = require_str(&args, "right").map_err(EngineError::InvalidArgs)?;

        let (left_cluster, right_cluster) = tokio::try_join!(executor.cluster(&left), executor.cluster(&right))?;

        let (outbound, inbound) = tokio::try_join!(
            cross_edges(executor, &left_cluster, &right_cluster),
            cross_edges(executor, &right_cluster, &left_cluster),
        )?;

        let mut cross_edges = outbound;
        cross_edges.extend(inbound);
        info!("Relationship {left} <-> {right}: {} cross edges", cross_edges.len());

        Ok(JobResult::Relationship(RelationshipResult {
            left_cluster,
            right_cluster,
            cross_edges,
        }))
    }
}

/// Edges from members of `from` to outputs owned by `to`, taken from every
/// transaction in each member's history. When the clusters overlap, a
/// member paying itself is reported too.
async fn cross_edges(executor: &Executor, from: &Cluster, to: &Cluster) -> Result<Vec<Edge>, EngineError> {
    let targets = to.address_set();
    let histories = try_join_all(from.addresses.iter().map(|a| executor.fetch(a))).await?;

    let mut seen: HashSet<(&str, &str, &str)> = HashSet::new();
    let mut edges = Vec::new();
    for (member, history) in from.addresses.iter().zip(&histories) {
        for tx in history {
            for output in &tx.outputs {
                if !targets.contains(output.address.as_str()) {
                    continue;
                }
                if seen.insert((member.address.as_str(), output.address.as_str(), tx.hash.as_str())) {
                    edges.push(Edge::new(member.bare(), output.clone(), tx.clone()));
                }
            }
        }
    }
    Ok(edges)
}
