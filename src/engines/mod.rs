pub mod balance;
pub mod distance;
pub mod related;
pub mod relationship;
pub mod timed_balance;
pub mod volume;
pub mod wallet;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::{Address, Cluster, Transaction};
use crate::jobs::{Job, JobError, JobStore};
use crate::provider::{ProviderError, SharedProvider};

pub use balance::{BalanceEngine, BalanceResult};
pub use distance::{DistanceEngine, PathResult};
pub use related::RelatedAddressEngine;
pub use relationship::{RelationshipEngine, RelationshipResult};
pub use timed_balance::{BalancePoint, TimedBalanceEngine, TimedBalanceResult};
pub use volume::{VolumeEngine, VolumeResult};
pub use wallet::{WalletEngine, WalletResult};

/// Analysis kinds a job can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineKind {
    Related,
    Distance,
    Relationship,
    Balance,
    TimedBalance,
    Volume,
    Wallet,
}

impl EngineKind {
    pub const ALL: [EngineKind; 7] = [
        EngineKind::Related,
        EngineKind::Distance,
        EngineKind::Relationship,
        EngineKind::Balance,
        EngineKind::TimedBalance,
        EngineKind::Volume,
        EngineKind::Wallet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Related => "RELATED",
            EngineKind::Distance => "DISTANCE",
            EngineKind::Relationship => "RELATIONSHIP",
            EngineKind::Balance => "BALANCE",
            EngineKind::TimedBalance => "TIMED_BALANCE",
            EngineKind::Volume => "VOLUME",
            EngineKind::Wallet => "WALLET",
        }
    }

    /// Case-insensitive lookup by job type name.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|kind| kind.name() == upper)
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A required argument is missing or has the wrong type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Read a required string argument.
pub fn require_str(args: &Value, field: &str) -> Result<String, ValidationError> {
    match args.get(field) {
        None | Some(Value::Null) => Err(ValidationError {
            field: field.to_string(),
            message: "missing field".to_string(),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError {
            field: field.to_string(),
            message: "must be a string".to_string(),
        }),
    }
}

/// Result payload of a finished job; serialises to the per-kind shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobResult {
    Related(Cluster),
    Distance(Option<PathResult>),
    Relationship(RelationshipResult),
    Balance(BalanceResult),
    TimedBalance(TimedBalanceResult),
    Volume(VolumeResult),
    Wallet(WalletResult),
}

impl JobResult {
    pub fn kind(&self) -> EngineKind {
        match self {
            JobResult::Related(_) => EngineKind::Related,
            JobResult::Distance(_) => EngineKind::Distance,
            JobResult::Relationship(_) => EngineKind::Relationship,
            JobResult::Balance(_) => EngineKind::Balance,
            JobResult::TimedBalance(_) => EngineKind::TimedBalance,
            JobResult::Volume(_) => EngineKind::Volume,
            JobResult::Wallet(_) => EngineKind::Wallet,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("dependent {kind} job {uuid} failed")]
    DependentJobFailed { kind: EngineKind, uuid: Uuid },
    #[error("dependent job returned {found} result, expected {expected}")]
    UnexpectedResult {
        expected: EngineKind,
        found: EngineKind,
    },
    #[error("invalid arguments: {0}")]
    InvalidArgs(ValidationError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("engine not found: {0}")]
    UnknownEngine(String),
    #[error("engine {0} is already registered")]
    AlreadyRegistered(EngineKind),
    #[error("invalid arguments: {0}")]
    Invalid(ValidationError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// One analysis kind: argument validation plus the algorithm itself.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Check required arguments are present. Pure and synchronous.
    fn validate_args(&self, args: &Value) -> Option<ValidationError>;

    async fn run(&self, executor: &Executor, args: Value) -> Result<JobResult, EngineError>;
}

/// Every engine with its default settings.
pub fn default_engines(distance_max_depth: Option<usize>) -> Vec<Arc<dyn Engine>> {
    vec![
        Arc::new(RelatedAddressEngine),
        Arc::new(DistanceEngine::new(distance_max_depth)),
        Arc::new(RelationshipEngine),
        Arc::new(BalanceEngine),
        Arc::new(TimedBalanceEngine),
        Arc::new(VolumeEngine),
        Arc::new(WalletEngine),
    ]
}

/// Engine table keyed by kind.
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<EngineKind, Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn with_engines(engines: Vec<Arc<dyn Engine>>) -> Result<Self, ExecuteError> {
        let mut registry = Self::default();
        for engine in engines {
            registry.register(engine)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, engine: Arc<dyn Engine>) -> Result<(), ExecuteError> {
        let kind = engine.kind();
        if self.engines.contains_key(&kind) {
            return Err(ExecuteError::AlreadyRegistered(kind));
        }
        self.engines.insert(kind, engine);
        Ok(())
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn Engine>> {
        self.engines.get(&kind).cloned()
    }

    /// Registered kind names in a stable order.
    pub fn names(&self) -> Vec<&'static str> {
        EngineKind::ALL
            .into_iter()
            .filter(|kind| self.engines.contains_key(kind))
            .map(EngineKind::name)
            .collect()
    }
}

/// Completion callback invoked with the result of a successful job.
pub type OnComplete = Box<dyn FnOnce(JobResult) + Send + 'static>;

struct ExecutorInner {
    engines: EngineRegistry,
    jobs: Arc<JobStore>,
    provider: SharedProvider,
}

/// Starts jobs on the tokio runtime and tracks them in the job store.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(engines: EngineRegistry, jobs: Arc<JobStore>, provider: SharedProvider) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                engines,
                jobs,
                provider,
            }),
        }
    }

    pub fn provider(&self) -> &SharedProvider {
        &self.inner.provider
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.inner.jobs
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.inner.engines
    }

    /// Fetch one address's history through the configured provider.
    pub async fn fetch(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
        self.inner.provider.fetch_transactions(address).await
    }

    /// `execute` by job type name.
    pub fn execute_named(
        &self,
        name: &str,
        args: Value,
        on_complete: Option<OnComplete>,
    ) -> Result<Uuid, ExecuteError> {
        let kind = EngineKind::from_name(name)
            .ok_or_else(|| ExecuteError::UnknownEngine(name.to_string()))?;
        self.execute(kind, args, on_complete)
    }

    /// Validate, register a running job and start it in the background.
    ///
    /// Returns as soon as the job is registered. On success the result is
    /// stored, the job marked finished, then `on_complete` runs; on failure
    /// the job is marked failed and `on_complete` is dropped uncalled.
    pub fn execute(
        &self,
        kind: EngineKind,
        args: Value,
        on_complete: Option<OnComplete>,
    ) -> Result<Uuid, ExecuteError> {
        let engine = self
            .inner
            .engines
            .get(kind)
            .ok_or_else(|| ExecuteError::UnknownEngine(kind.name().to_string()))?;

        if let Some(err) = engine.validate_args(&args) {
            return Err(ExecuteError::Invalid(err));
        }

        let job = Arc::new(Job::new(kind));
        self.inner.jobs.register(job.clone())?;
        let uuid = job.uuid();
        info!(job = %uuid, kind = %kind, "Job started");

        let executor = self.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(engine.run(&executor, args)).catch_unwind().await {
                Ok(Ok(result)) => {
                    job.finish(result.clone());
                    let elapsed = Utc::now() - job.created_at();
                    info!(job = %uuid, kind = %kind, elapsed_ms = elapsed.num_milliseconds(), "Job finished");
                    if let Some(callback) = on_complete {
                        callback(result);
                    }
                }
                Ok(Err(e)) => {
                    job.fail(e.to_string());
                    warn!(job = %uuid, kind = %kind, "Job failed: {e}");
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown cause".to_string());
                    job.fail(format!("engine panicked: {reason}"));
                    error!(job = %uuid, kind = %kind, "Job panicked: {reason}");
                }
            }
        });

        Ok(uuid)
    }

    /// Run another engine as a tracked sub-job and wait for its result.
    pub async fn execute_for_results(
        &self,
        kind: EngineKind,
        args: Value,
    ) -> Result<JobResult, EngineError> {
        let (tx, rx) = oneshot::channel();
        let uuid = self.execute(
            kind,
            args,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        rx.await
            .map_err(|_| EngineError::DependentJobFailed { kind, uuid })
    }

    /// Cluster around `needle` via a RELATED sub-job.
    pub async fn cluster(&self, needle: &str) -> Result<Cluster, EngineError> {
        let args = serde_json::json!({ "needle_address": needle });
        match self.execute_for_results(EngineKind::Related, args).await? {
            JobResult::Related(cluster) => Ok(cluster),
            other => Err(EngineError::UnexpectedResult {
                expected: EngineKind::Related,
                found: other.kind(),
            }),
        }
    }
}

/// Every transaction touching the cluster, de-duplicated by hash and ordered
/// by time (hash breaks ties).
pub(crate) async fn cluster_transactions(
    executor: &Executor,
    cluster: &Cluster,
) -> Result<Vec<Transaction>, EngineError> {
    let histories = try_join_all(cluster.addresses.iter().map(|a| executor.fetch(a))).await?;

    let mut unique: HashMap<String, Transaction> = HashMap::new();
    for tx in histories.into_iter().flatten() {
        unique.entry(tx.hash.clone()).or_insert(tx);
    }

    let mut txs: Vec<Transaction> = unique.into_values().collect();
    txs.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.hash.cmp(&b.hash)));
    Ok(txs)
}

/// Total value of `addresses` whose address is a cluster member.
pub(crate) fn owned_value(addresses: &[Address], members: &std::collections::HashSet<&str>) -> u64 {
    addresses
        .iter()
        .filter(|a| members.contains(a.address.as_str()))
        .filter_map(|a| a.value)
        .sum()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::Retention;
    use crate::provider::{FixtureProvider, TransactionProvider};

    pub fn tx(hash: &str, time: i64, inputs: &[&str], outputs: &[&str]) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            time,
            inputs: inputs.iter().map(|a| Address::new(*a)).collect(),
            outputs: outputs.iter().map(|a| Address::new(*a)).collect(),
        }
    }

    /// Transaction with explicit values: `(address, sats)`.
    pub fn valued_tx(hash: &str, time: i64, inputs: &[(&str, u64)], outputs: &[(&str, u64)]) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            time,
            inputs: inputs.iter().map(|(a, v)| Address::with_value(*a, *v)).collect(),
            outputs: outputs.iter().map(|(a, v)| Address::with_value(*a, *v)).collect(),
        }
    }

    pub fn executor_with(provider: SharedProvider) -> Executor {
        let engines = EngineRegistry::with_engines(default_engines(None)).unwrap();
        Executor::new(engines, Arc::new(JobStore::new(Retention::default())), provider)
    }

    pub fn fixture_executor(transactions: Vec<Transaction>) -> Executor {
        executor_with(Arc::new(FixtureProvider::from_transactions(transactions)))
    }

    /// Serves fixture data but fails for one address.
    pub struct FailingProvider {
        pub inner: FixtureProvider,
        pub broken: String,
    }

    #[async_trait]
    impl TransactionProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn fetch_transactions(&self, address: &Address) -> Result<Vec<Transaction>, ProviderError> {
            if address.address == self.broken {
                return Err(ProviderError::Api {
                    provider: "failing",
                    message: format!("{} unreachable", address.address),
                });
            }
            self.inner.fetch_transactions(address).await
        }
    }
}
