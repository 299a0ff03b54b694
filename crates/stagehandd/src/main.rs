//! stagehandd — operator binary for a Stagehand service.
//!
//! Works directly on the service's state database:
//! - validate a candidate spec against the stored target
//! - publish a spec and print the resulting plans
//! - list stored tasks and their last status
//! - replay a file of scheduler events through the event loop
//!
//! # Usage
//!
//! ```text
//! stagehandd --data-dir /var/lib/stagehand check --spec service.toml
//! stagehandd --data-dir /var/lib/stagehand plan --spec service.toml
//! stagehandd --data-dir /var/lib/stagehand tasks
//! stagehandd --data-dir /var/lib/stagehand replay --spec service.toml --events events.jsonl
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use stagehand_core::{Filters, Operation, ServiceSpec, TaskStatus};
use stagehand_plan::PlanKind;
use stagehand_scheduler::{
    Capabilities, ConfigManager, DriverError, EventLoop, SchedulerBuilder, SchedulerConfig,
    SchedulerDriver, SchedulerEvent, ServiceScheduler,
};
use stagehand_state::{ConfigStore, Persister, RedbPersister, StateStore};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stagehandd", about = "Stagehand service scheduler")]
struct Cli {
    /// Data directory holding the service's state database.
    #[arg(long, global = true, default_value = "/var/lib/stagehand")]
    data_dir: PathBuf,

    /// Scheduler config file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a spec against the stored target without publishing it.
    Check {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Publish a spec and print the deploy, recovery, and decommission plans.
    Plan {
        #[arg(long)]
        spec: PathBuf,
    },
    /// List stored tasks with their last known state.
    Tasks,
    /// Feed JSON-lines scheduler events through the event loop.
    Replay {
        #[arg(long)]
        spec: PathBuf,
        #[arg(long)]
        events: PathBuf,
    },
}

/// Driver used when no resource manager is attached: every call is logged.
struct LoggingDriver;

impl SchedulerDriver for LoggingDriver {
    fn accept_offers(
        &self,
        offer_ids: &[String],
        operations: &[Operation],
        filters: &Filters,
    ) -> Result<(), DriverError> {
        info!(
            offers = ?offer_ids,
            operations = operations.len(),
            refuse_seconds = filters.refuse_seconds,
            "accept"
        );
        Ok(())
    }

    fn decline_offer(&self, offer_id: &str, filters: &Filters) -> Result<(), DriverError> {
        info!(%offer_id, refuse_seconds = filters.refuse_seconds, "decline");
        Ok(())
    }

    fn kill_task(&self, task_id: &str) -> Result<(), DriverError> {
        info!(%task_id, "kill");
        Ok(())
    }

    fn reconcile_tasks(&self, statuses: &[TaskStatus]) -> Result<(), DriverError> {
        info!(tasks = statuses.len(), "reconcile");
        Ok(())
    }

    fn acknowledge(&self, status: &TaskStatus) -> Result<(), DriverError> {
        info!(task_id = %status.task_id, "acknowledge");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };

    match cli.command {
        Command::Check { spec } => check(&cli.data_dir, &spec),
        Command::Plan { spec } => plan(&cli.data_dir, &spec, config),
        Command::Tasks => tasks(&cli.data_dir),
        Command::Replay { spec, events } => replay(&cli.data_dir, &spec, &events, config).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stagehand=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_persister(data_dir: &Path) -> anyhow::Result<Arc<dyn Persister>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let path = data_dir.join("stagehand.redb");
    let persister = RedbPersister::open(&path)?;
    info!(path = ?path, "state database opened");
    Ok(Arc::new(persister))
}

fn load_spec(path: &Path) -> anyhow::Result<ServiceSpec> {
    ServiceSpec::from_file(path).with_context(|| format!("loading spec {}", path.display()))
}

// ── Commands ───────────────────────────────────────────────────────

fn check(data_dir: &Path, spec_path: &Path) -> anyhow::Result<()> {
    let spec = load_spec(spec_path)?;
    let persister = open_persister(data_dir)?;
    let configs = ConfigManager::new(
        ConfigStore::json(persister.clone()),
        StateStore::new(persister),
        Capabilities::default(),
    );

    let errors = configs.validate(&spec)?;
    if errors.is_empty() {
        println!("{}: ok", spec.name);
        return Ok(());
    }
    for error in &errors {
        println!("{error}");
    }
    bail!("{} validation error(s) in {}", errors.len(), spec_path.display())
}

fn plan(data_dir: &Path, spec_path: &Path, config: SchedulerConfig) -> anyhow::Result<()> {
    let spec = load_spec(spec_path)?;
    let persister = open_persister(data_dir)?;
    let scheduler = SchedulerBuilder::new(spec, persister)
        .with_config(config)
        .build(Arc::new(LoggingDriver))?;
    print_plans(&scheduler)
}

fn tasks(data_dir: &Path) -> anyhow::Result<()> {
    let state = StateStore::new(open_persister(data_dir)?);
    for info in state.fetch_tasks()? {
        let last = state
            .fetch_status(&info.name)?
            .map(|s| s.state.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<16} {:<38} {}",
            info.name, last, info.target_config, info.task_id
        );
    }
    Ok(())
}

async fn replay(
    data_dir: &Path,
    spec_path: &Path,
    events_path: &Path,
    config: SchedulerConfig,
) -> anyhow::Result<()> {
    let spec = load_spec(spec_path)?;
    let capacity = config.event_queue_capacity;
    let scheduler = SchedulerBuilder::new(spec, open_persister(data_dir)?)
        .with_config(config)
        .build(Arc::new(LoggingDriver))?;

    let (event_loop, tx) = EventLoop::new(scheduler, capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(event_loop.run(shutdown_rx));

    let content = tokio::fs::read_to_string(events_path)
        .await
        .with_context(|| format!("reading {}", events_path.display()))?;
    let feed = async {
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: SchedulerEvent = serde_json::from_str(line)
                .with_context(|| format!("{}:{}", events_path.display(), n + 1))?;
            tx.send(event).await.context("event loop stopped early")?;
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = feed => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping event loop");
            let _ = shutdown_tx.send(true);
        }
    }
    drop(tx);

    let scheduler = handle.await??;
    print_plans(&scheduler)
}

fn print_plans(scheduler: &ServiceScheduler) -> anyhow::Result<()> {
    let mut plans = serde_json::Map::new();
    for (name, kind) in [
        ("deploy", PlanKind::Deploy),
        ("recovery", PlanKind::Recovery),
        ("decommission", PlanKind::Decommission),
    ] {
        if let Some(plan) = scheduler.plan(kind) {
            plans.insert(name.to_string(), serde_json::to_value(plan)?);
        }
    }

    let report = serde_json::json!({
        "service": scheduler.target().name,
        "target_config": scheduler.target_id().to_string(),
        "plans": plans,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
