use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{Engine, EngineError, EngineKind, Executor, JobResult, ValidationError, require_str};
use crate::core::{Address, Edge};
use crate::provider::{ProviderError, TransactionProvider};

/// A chain of spends from source to sink. `addresses` starts at the source
/// and follows each edge's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathResult {
    pub addresses: Vec<Address>,
    pub edges: Vec<Edge>,
}

impl PathResult {
    fn from_edges(source: &str, edges: Vec<Edge>) -> Self {
        let mut addresses = vec![Address::new(source)];
        addresses.extend(edges.iter().map(|e| e.target.bare()));
        Self { addresses, edges }
    }
}

/// Breadth-first search over spends, source to sink. Unbounded unless a
/// depth limit is configured or passed as `max_depth`.
pub struct DistanceEngine {
    default_max_depth: Option<usize>,
}

impl DistanceEngine {
    pub fn new(default_max_depth: Option<usize>) -> Self {
        Self { default_max_depth }
    }
}

#[async_trait]
impl Engine for DistanceEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Distance
    }

    fn validate_args(&self, args: &Value) -> Option<ValidationError> {
        require_str(args, "source").err().or_else(|| require_str(args, "sink").err())
    }

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError> {
        let source = require_str(&args, "source").map_err(EngineError::InvalidArgs)?;
        let sink = require_str(&args, "sink").map_err(EngineError::InvalidArgs)?;
        let max_depth = args
            .get("max_depth")
            .and_then(Value::as_u64)
            .map(|d| d as usize)
            .or(self.default_max_depth);

        match max_depth {
            Some(depth) => info!("Searching path {source} -> {sink} (max depth {depth})"),
            None => info!("Searching path {source} -> {sink}"),
        }
        let path = find_path(executor.provider().as_ref(), &source, &sink, max_depth).await?;
        match &path {
            Some(p) => info!("Path {source} -> {sink}: {} hops", p.edges.len()),
            None => info!("No path {source} -> {sink}"),
        }
        Ok(JobResult::Distance(path))
    }
}

/// Find a path of spends from `source` to `sink`, at most `max_depth` edges
/// long when a limit is given.
///
/// Paths never revisit an address. Whenever an edge reaching the sink is
/// generated, every pending path is discarded and only the new one queued.
pub async fn find_path(
    provider: &dyn TransactionProvider,
    source: &str,
    sink: &str,
    max_depth: Option<usize>,
) -> Result<Option<PathResult>, ProviderError> {
    if source == sink {
        return Ok(Some(PathResult::from_edges(source, Vec::new())));
    }
    if max_depth == Some(0) {
        return Ok(None);
    }

    let mut queue: VecDeque<Vec<Edge>> = VecDeque::new();
    let origin = Address::new(source);
    extend_queue(provider, &mut queue, &[], &origin, None, source, sink).await?;

    while let Some(path) = queue.pop_front() {
        let Some(last) = path.last() else {
            continue;
        };
        if last.target.address == sink {
            return Ok(Some(PathResult::from_edges(source, path)));
        }
        if max_depth.is_some_and(|depth| path.len() >= depth) {
            continue;
        }
        let frontier = last.target.bare();
        let via = last.transaction.hash.clone();
        extend_queue(provider, &mut queue, &path, &frontier, Some(&via), source, sink).await?;
    }

    Ok(None)
}

async fn extend_queue(
    provider: &dyn TransactionProvider,
    queue: &mut VecDeque<Vec<Edge>>,
    path: &[Edge],
    from: &Address,
    via: Option<&str>,
    source: &str,
    sink: &str,
) -> Result<(), ProviderError> {
    debug!(address = %from, depth = path.len(), "Expanding");
    let history = provider.fetch_transactions(from).await?;

    let spends = history
        .iter()
        .filter(|tx| via.is_none_or(|h| h != tx.hash))
        .filter(|tx| tx.contains_input(&from.address));

    for tx in spends {
        for output in &tx.outputs {
            if visited(path, source, &output.address) {
                continue;
            }
            let mut next = path.to_vec();
            next.push(Edge::new(from.bare(), output.clone(), tx.clone()));
            if output.address == sink {
                queue.clear();
            }
            queue.push_back(next);
        }
    }
    Ok(())
}

fn visited(path: &[Edge], source: &str, address: &str) -> bool {
    address == source || path.iter().any(|e| e.target.address == address)
}
