mod api;
mod clusterize;
mod config;
mod core;
mod db;
mod engines;
mod graph;
mod jobs;
mod provider;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Amount, SignedAmount};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::engines::{EngineKind, EngineRegistry, Executor, JobResult, default_engines};
use crate::jobs::{JobStore, Retention};

#[derive(Parser)]
#[command(name = "chainsleuth", version, about = "Bitcoin address clustering forensics")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the job API over HTTP
    Serve,
    /// Cluster the addresses related to SOURCE and write the graph
    Related {
        source: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Find a spend path from SOURCE to SINK and write the graph
    Distance {
        source: String,
        sink: String,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        max_depth: Option<usize>,
    },
    /// Cluster LEFT and RIGHT and write the payments between them
    Relationship {
        left: String,
        right: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Net balance of the cluster around SOURCE
    Balance { source: String },
    /// Balance of the cluster around SOURCE over time
    TimedBalance { source: String },
    /// Inbound and outbound volume of the cluster around SOURCE
    Volume { source: String },
    /// Wallet-vs-exchange estimate for the cluster around SOURCE
    Wallet { source: String },
    /// Group many addresses into clusters
    Clusterize {
        #[arg(required = true)]
        addresses: Vec<String>,
        #[arg(long)]
        parallelism: Option<usize>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Provider(#[from] provider::ProviderError),
    #[error(transparent)]
    Engine(#[from] engines::EngineError),
    #[error(transparent)]
    Execute(#[from] engines::ExecuteError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("chainsleuth=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config);
    tracing::debug!("Config: {:?}", config);

    if let Err(e) = run(cli.command, config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(command: Command, config: Config) -> Result<(), CliError> {
    let executor = build_executor(&config)?;

    match command {
        Command::Serve => serve(executor, &config).await?,
        Command::Related { source, output } => {
            let result = executor
                .execute_for_results(EngineKind::Related, json!({ "needle_address": source }))
                .await?;
            let path = output.unwrap_or_else(|| PathBuf::from(format!("related_{source}.dot")));
            write_graph(&result, path)?;
        }
        Command::Distance {
            source,
            sink,
            output,
            max_depth,
        } => {
            let mut args = json!({ "source": source, "sink": sink });
            if let Some(depth) = max_depth {
                args["max_depth"] = Value::from(depth);
            }
            let result = executor.execute_for_results(EngineKind::Distance, args).await?;
            if matches!(result, JobResult::Distance(None)) {
                tracing::info!("No path from {source} to {sink}");
            }
            let path = output.unwrap_or_else(|| PathBuf::from(format!("distance_{source}_to_{sink}.dot")));
            write_graph(&result, path)?;
        }
        Command::Relationship { left, right, output } => {
            let result = executor
                .execute_for_results(EngineKind::Relationship, json!({ "left": left, "right": right }))
                .await?;
            let path = output.unwrap_or_else(|| PathBuf::from(format!("relationship_{left}_{right}.dot")));
            write_graph(&result, path)?;
        }
        Command::Balance { source } => {
            if let JobResult::Balance(b) = metric(&executor, EngineKind::Balance, &source).await? {
                tracing::info!("Balance of {source}: {}", SignedAmount::from_sat(b.balance));
            }
        }
        Command::TimedBalance { source } => {
            if let JobResult::TimedBalance(series) = metric(&executor, EngineKind::TimedBalance, &source).await? {
                for point in &series.dataset {
                    let at = chrono::DateTime::from_timestamp(point.t, 0).unwrap_or_default();
                    tracing::info!("{at}: {}", SignedAmount::from_sat(point.y));
                }
            }
        }
        Command::Volume { source } => {
            if let JobResult::Volume(v) = metric(&executor, EngineKind::Volume, &source).await? {
                tracing::info!(
                    "Volume of {source}: in {}, out {}",
                    Amount::from_sat(v.inbound.max(0) as u64),
                    Amount::from_sat(v.outbound.max(0) as u64)
                );
            }
        }
        Command::Wallet { source } => {
            if let JobResult::Wallet(w) = metric(&executor, EngineKind::Wallet, &source).await? {
                tracing::info!("{source}: {} ({:.2})", w.conclusion, w.probability);
            }
        }
        Command::Clusterize { addresses, parallelism } => {
            let parallelism = parallelism.unwrap_or(config.jobs.clusterize_parallelism);
            let grouped = clusterize::clusterize(&executor, &addresses, parallelism).await;
            println!("{}", serde_json::to_string_pretty(&grouped)?);
        }
    }
    Ok(())
}

fn build_executor(config: &Config) -> Result<Executor, CliError> {
    let provider = provider::build_provider(config)?;
    let engines = EngineRegistry::with_engines(default_engines(config.jobs.distance_max_depth))?;
    let retention = Retention {
        ttl: Some(chrono::Duration::seconds(config.jobs.retention_secs as i64)),
        max_jobs: Some(config.jobs.max_jobs),
    };
    Ok(Executor::new(engines, Arc::new(JobStore::new(retention)), provider))
}

async fn metric(executor: &Executor, kind: EngineKind, source: &str) -> Result<JobResult, CliError> {
    Ok(executor
        .execute_for_results(kind, json!({ "needle_address": source }))
        .await?)
}

fn write_graph(result: &JobResult, path: PathBuf) -> Result<(), CliError> {
    if let Some(dot) = graph::render_result(result) {
        std::fs::write(&path, dot)?;
        tracing::info!("Graph written to {}", path.display());
    }
    Ok(())
}

async fn serve(executor: Executor, config: &Config) -> Result<(), CliError> {
    let jobs = executor.jobs().clone();
    let sweep_every = Duration::from_secs(config.jobs.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let evicted = jobs.prune(chrono::Utc::now());
            if evicted > 0 {
                tracing::info!("Evicted {evicted} expired jobs, {} running", jobs.running_count());
            }
        }
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{addr}");
    axum::serve(listener, api::router(executor)).await?;
    Ok(())
}
