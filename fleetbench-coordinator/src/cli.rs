//! Command line interface of the `fleetbench` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use fleetbench_types::StageDefinition;
use fleetbench_worker::{DEFAULT_CONTAINER, InMemoryStore, StageExecutor};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::worker::{LocalWorker, RemoteWorker, SharedWorker};
use crate::{healthcheck, observability, summary, web};

/// Distributed benchmark harness.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Worker(WorkerCommand),
    Healthcheck(HealthcheckCommand),
    Version(VersionCommand),
}

/// run the benchmark plan against the configured workers
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// path to a YAML file with the list of stages, replacing the stages of the configuration
    #[argh(option, short = 'p')]
    plan: Option<PathBuf>,
}

/// serve a worker with an in-memory store over HTTP
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "worker")]
struct WorkerCommand {}

/// check that a worker is up
///
/// Probes the worker at the configured address unless an endpoint is given.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "healthcheck")]
struct HealthcheckCommand {
    /// base URL of the worker to probe
    #[argh(option)]
    endpoint: Option<String>,
}

/// print the fleetbench version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads)
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand { plan }) => run(config, plan.as_deref()).await,
            Command::Worker(WorkerCommand {}) => web::server(config).await,
            Command::Healthcheck(HealthcheckCommand { endpoint }) => {
                healthcheck::healthcheck(&config, endpoint.as_deref()).await
            }
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

async fn run(config: Config, plan: Option<&Path>) -> Result<()> {
    let stages = match plan {
        Some(path) => load_plan(path).await?,
        None => config.stages.clone(),
    };
    if stages.is_empty() {
        anyhow::bail!("the plan has no stages");
    }

    let coordinator = Coordinator::new(fleet(&config))
        .with_ack_timeout(config.ack_timeout)
        .with_slack(config.ack_slack);
    tracing::info!(
        workers = coordinator.workers().len(),
        stages = stages.len(),
        "starting run"
    );

    let summary = coordinator.run_plan(&stages).await?;

    if let Some(path) = &config.report {
        let json = serde_json::to_vec_pretty(&summary)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "report written");
    }

    summary::print_summary(&summary);
    if !summary.passed() {
        anyhow::bail!("benchmark run failed");
    }
    Ok(())
}

async fn load_plan(path: &Path) -> Result<Vec<StageDefinition>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("invalid plan {}", path.display()))
}

/// Creates clients for the configured remote workers, or in-process workers sharing one store.
fn fleet(config: &Config) -> Vec<SharedWorker> {
    if !config.workers.is_empty() {
        let http = reqwest::Client::new();
        return config
            .workers
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                Arc::new(RemoteWorker::with_client(index, endpoint, http.clone())) as SharedWorker
            })
            .collect();
    }

    let store = Arc::new(InMemoryStore::new());
    let settings = &config.worker;
    if settings.entries > 0 {
        store.populate(DEFAULT_CONTAINER, settings.entries, settings.entry_size);
    }
    (0..config.local_workers)
        .map(|index| {
            let executor =
                StageExecutor::with_grace_period(index, store.clone(), settings.grace_period);
            Arc::new(LocalWorker::new(executor)) as SharedWorker
        })
        .collect()
}
