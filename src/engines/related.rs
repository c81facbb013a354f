use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use serde_json::Value;
use tracing::{debug, info};

use super::{Engine, EngineError, EngineKind, Executor, JobResult, ValidationError, require_str};
use crate::core::tx::{has_change_shape, is_first_seen, select_change_output};
use crate::core::{Address, Cluster, Edge, Transaction};
use crate::provider::{ProviderError, TransactionProvider};

/// Common-input-ownership plus first-seen change detection, expanded
/// transitively from a needle address.
pub struct RelatedAddressEngine;

#[async_trait]
impl Engine for RelatedAddressEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Related
    }

    fn validate_args(&self, args: &Value) -> Option<ValidationError> {
        require_str(args, "needle_address").err()
    }

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError> {
        let needle = require_str(&args, "needle_address").map_err(EngineError::InvalidArgs)?;
        info!("Building cluster around {needle}");
        let cluster = find_cluster(executor.provider().as_ref(), &needle).await?;
        info!(
            "Cluster around {needle}: {} addresses, {} edges",
            cluster.addresses.len(),
            cluster.edges.len()
        );
        Ok(JobResult::Related(cluster))
    }
}

/// Expand the cluster containing `needle`.
///
/// Every address is claimed exactly once, so the result carries each address
/// once and each edge has a distinct target.
pub async fn find_cluster(provider: &dyn TransactionProvider, needle: &str) -> Result<Cluster, ProviderError> {
    let root = Address::new(needle);
    let traversal = Traversal::new(provider, root.clone());
    traversal.expand(root, None).await?;
    Ok(traversal.into_cluster())
}

struct Corpus {
    claimed: HashSet<String>,
    addresses: Vec<Address>,
    edges: Vec<Edge>,
}

struct Traversal<'a> {
    provider: &'a dyn TransactionProvider,
    corpus: Mutex<Corpus>,
}

impl<'a> Traversal<'a> {
    fn new(provider: &'a dyn TransactionProvider, root: Address) -> Self {
        let mut claimed = HashSet::new();
        claimed.insert(root.address.clone());
        Self {
            provider,
            corpus: Mutex::new(Corpus {
                claimed,
                addresses: vec![root],
                edges: Vec::new(),
            }),
        }
    }

    fn into_cluster(self) -> Cluster {
        let corpus = self.corpus.into_inner().unwrap_or_else(|e| e.into_inner());
        Cluster {
            addresses: corpus.addresses,
            edges: corpus.edges,
        }
    }

    fn is_claimed(&self, address: &str) -> bool {
        self.corpus
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .claimed
            .contains(address)
    }

    /// Record `edge` if its target is new. The check and the insert happen
    /// under one lock, so concurrent branches never add an address twice.
    fn claim(&self, edge: Edge) -> bool {
        let mut corpus = self.corpus.lock().unwrap_or_else(|e| e.into_inner());
        if !corpus.claimed.insert(edge.target.address.clone()) {
            return false;
        }
        corpus.addresses.push(edge.target.bare());
        corpus.edges.push(edge);
        true
    }

    /// Follow both heuristics out of `address`. `via` is the transaction the
    /// address was discovered through.
    fn expand<'s>(&'s self, address: Address, via: Option<Transaction>) -> BoxFuture<'s, Result<(), ProviderError>> {
        async move {
            debug!(address = %address, "Finding new edges");
            let history = self.provider.fetch_transactions(&address).await?;

            let spent: Vec<&Transaction> = history
                .iter()
                .filter(|tx| tx.contains_input(&address.address))
                .filter(|tx| via.as_ref().is_none_or(|v| v.hash != tx.hash))
                .collect();

            let mut branches: Vec<BoxFuture<'s, Result<(), ProviderError>>> = Vec::new();

            // Co-spent inputs share an owner.
            for tx in &spent {
                for input in tx.inputs.iter().filter(|i| i.address != address.address) {
                    if self.claim(Edge::new(address.bare(), input.clone(), (*tx).clone())) {
                        branches.push(self.expand(input.bare(), Some((*tx).clone())));
                    }
                }
            }

            match &via {
                // Change of the transaction that led here.
                Some(tx) => {
                    if has_change_shape(tx) {
                        branches.push(self.follow_change(address.bare(), tx.clone()));
                    }
                }
                // The needle: change of its own payments, and the senders of
                // payments where the needle itself was the change.
                None => {
                    for tx in spent.iter().filter(|tx| has_change_shape(tx)) {
                        branches.push(self.follow_change(address.bare(), (*tx).clone()));
                    }
                    let received = history
                        .iter()
                        .filter(|tx| has_change_shape(tx) && tx.contains_output(&address.address));
                    for tx in received {
                        branches.push(self.follow_change_senders(address.bare(), tx.clone()));
                    }
                }
            }

            try_join_all(branches).await?;
            Ok(())
        }
        .boxed()
    }

    fn follow_change<'s>(&'s self, sender: Address, tx: Transaction) -> BoxFuture<'s, Result<(), ProviderError>> {
        async move {
            if tx.outputs.iter().all(|o| self.is_claimed(&o.address)) {
                return Ok(());
            }
            let Some(change) = self.detect_change(&tx).await? else {
                return Ok(());
            };
            if change == sender {
                return Ok(());
            }
            if !self.claim(Edge::change(sender, change.clone(), tx.clone())) {
                return Ok(());
            }
            debug!("Change address {change} found in {}", tx.hash);
            self.expand(change.bare(), Some(tx)).await
        }
        .boxed()
    }

    /// When `change` is the change output of `tx`, every input of `tx` joins
    /// the cluster through a change edge.
    fn follow_change_senders<'s>(&'s self, change: Address, tx: Transaction) -> BoxFuture<'s, Result<(), ProviderError>> {
        async move {
            if tx.inputs.iter().all(|i| self.is_claimed(&i.address)) {
                return Ok(());
            }
            if self.detect_change(&tx).await?.as_ref() != Some(&change) {
                return Ok(());
            }
            let mut branches = Vec::new();
            for input in tx.inputs.iter().filter(|i| i.address != change.address) {
                if self.claim(Edge::change(change.bare(), input.clone(), tx.clone())) {
                    debug!("Sender {input} of {} found through change {change}", tx.hash);
                    branches.push(self.expand(input.bare(), Some(tx.clone())));
                }
            }
            try_join_all(branches).await?;
            Ok(())
        }
        .boxed()
    }

    async fn detect_change(&self, tx: &Transaction) -> Result<Option<Address>, ProviderError> {
        if !has_change_shape(tx) {
            return Ok(None);
        }
        let [first, second] = [&tx.outputs[0], &tx.outputs[1]];
        let (first_history, second_history) = tokio::try_join!(
            self.provider.fetch_transactions(first),
            self.provider.fetch_transactions(second),
        )?;
        let flags = [
            is_first_seen(&first_history, tx.time),
            is_first_seen(&second_history, tx.time),
        ];
        Ok(select_change_output(tx, flags).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::super::testing::tx;
    use super::*;
    use crate::provider::FixtureProvider;

    fn members(cluster: &Cluster) -> HashSet<&str> {
        cluster.address_set()
    }

    fn assert_well_formed(cluster: &Cluster) {
        let set = members(cluster);
        assert_eq!(set.len(), cluster.addresses.len(), "duplicate address");
        assert_eq!(cluster.edges.len(), cluster.addresses.len() - 1);
        let targets: HashSet<&str> = cluster.edges.iter().map(|e| e.target.address.as_str()).collect();
        assert_eq!(targets.len(), cluster.edges.len(), "duplicate edge target");
        for edge in &cluster.edges {
            assert!(set.contains(edge.source.address.as_str()));
            assert!(set.contains(edge.target.address.as_str()));
        }
    }

    #[tokio::test]
    async fn unknown_address_is_a_singleton() {
        let provider = FixtureProvider::default();
        let cluster = find_cluster(&provider, "lonely").await.unwrap();
        assert_eq!(cluster.addresses, vec![Address::new("lonely")]);
        assert!(cluster.edges.is_empty());
    }

    #[tokio::test]
    async fn co_spent_inputs_join_from_either_side() {
        let provider = FixtureProvider::from_transactions(vec![tx("t1", 100, &["a", "b"], &["c"])]);

        let from_a = find_cluster(&provider, "a").await.unwrap();
        assert_eq!(from_a.addresses.len(), 2);
        assert!(from_a.contains("b"));
        assert!(!from_a.contains("c"));
        let edge = &from_a.edges[0];
        assert_eq!((edge.source.address.as_str(), edge.target.address.as_str()), ("a", "b"));
        assert!(!edge.is_change);
        assert_eq!(edge.transaction.hash, "t1");

        let from_b = find_cluster(&provider, "b").await.unwrap();
        assert!(from_b.contains("a"));
    }

    #[tokio::test]
    async fn first_seen_output_is_change() {
        let provider = FixtureProvider::from_transactions(vec![
            tx("fund", 50, &["w"], &["s"]),
            tx("old", 100, &["z"], &["y"]),
            tx("pay", 200, &["s"], &["x", "y"]),
        ]);

        let cluster = find_cluster(&provider, "s").await.unwrap();
        assert_well_formed(&cluster);
        assert_eq!(members(&cluster), HashSet::from(["s", "x"]));
        let edge = &cluster.edges[0];
        assert!(edge.is_change);
        assert_eq!(edge.source.address, "s");
        assert_eq!(edge.target.address, "x");
        assert_eq!(edge.transaction.hash, "pay");
    }

    #[tokio::test]
    async fn co_spent_address_keeps_its_own_change_out() {
        // b joins through t1, which has one output; t2 is b's own payment
        // and is not a change candidate.
        let provider = FixtureProvider::from_transactions(vec![
            tx("old", 10, &["z"], &["y"]),
            tx("t1", 100, &["a", "b"], &["out"]),
            tx("t2", 200, &["b"], &["x", "y"]),
        ]);
        let cluster = find_cluster(&provider, "a").await.unwrap();
        assert_well_formed(&cluster);
        assert_eq!(members(&cluster), HashSet::from(["a", "b"]));
        assert!(cluster.edges.iter().all(|e| !e.is_change));
    }

    #[tokio::test]
    async fn needle_as_change_pulls_in_sender() {
        let provider = FixtureProvider::from_transactions(vec![
            tx("old", 10, &["z"], &["y"]),
            tx("pay", 100, &["p"], &["n", "y"]),
        ]);
        let cluster = find_cluster(&provider, "n").await.unwrap();
        assert_well_formed(&cluster);
        assert_eq!(members(&cluster), HashSet::from(["n", "p"]));
        let edge = &cluster.edges[0];
        assert!(edge.is_change);
        assert_eq!((edge.source.address.as_str(), edge.target.address.as_str()), ("n", "p"));
        assert_eq!(edge.transaction.hash, "pay");
    }

    #[tokio::test]
    async fn needle_not_change_keeps_sender_out() {
        // Both outputs first seen: ambiguous, so the sender is not linked.
        let provider = FixtureProvider::from_transactions(vec![tx("pay", 100, &["p"], &["n", "y"])]);
        let cluster = find_cluster(&provider, "n").await.unwrap();
        assert_eq!(cluster.addresses.len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_outputs_abstain() {
        // Both outputs first seen.
        let fresh = FixtureProvider::from_transactions(vec![tx("pay", 200, &["s"], &["x", "y"])]);
        let cluster = find_cluster(&fresh, "s").await.unwrap();
        assert_eq!(cluster.addresses.len(), 1);

        // Neither output first seen.
        let stale = FixtureProvider::from_transactions(vec![
            tx("ox", 10, &["p"], &["x"]),
            tx("oy", 20, &["q"], &["y"]),
            tx("pay", 200, &["s"], &["x", "y"]),
        ]);
        let cluster = find_cluster(&stale, "s").await.unwrap();
        assert_eq!(cluster.addresses.len(), 1);
    }

    #[tokio::test]
    async fn change_through_co_spent_input() {
        // `b` joins via t1; the change of t1 joins through the discovering transaction.
        let provider = FixtureProvider::from_transactions(vec![
            tx("prior", 10, &["m"], &["paid"]),
            tx("t1", 100, &["a", "b"], &["paid", "chg"]),
        ]);
        let cluster = find_cluster(&provider, "a").await.unwrap();
        assert_well_formed(&cluster);
        assert_eq!(members(&cluster), HashSet::from(["a", "b", "chg"]));
        assert_eq!(cluster.edges.iter().filter(|e| e.is_change).count(), 1);
    }

    #[tokio::test]
    async fn cycles_claim_each_address_once() {
        let provider = FixtureProvider::from_transactions(vec![
            tx("t1", 10, &["a", "b"], &["out1"]),
            tx("t2", 20, &["b", "c"], &["out2"]),
            tx("t3", 30, &["c", "a"], &["out3"]),
            tx("t4", 40, &["a", "b", "c", "d"], &["out4"]),
        ]);
        for needle in ["a", "b", "c", "d"] {
            let cluster = find_cluster(&provider, needle).await.unwrap();
            assert_well_formed(&cluster);
            assert_eq!(members(&cluster), HashSet::from(["a", "b", "c", "d"]));
            assert_eq!(cluster.addresses[0].address, needle);
        }
    }

    #[test]
    fn engine_rejects_missing_needle() {
        let err = RelatedAddressEngine.validate_args(&serde_json::json!({})).unwrap();
        assert_eq!(err.field, "needle_address");
    }
}
