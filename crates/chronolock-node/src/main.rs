use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use chronolock_core::config::ChronolockConfig;
use chronolock_store::JobStore;

mod host;

#[derive(Debug, Parser)]
#[command(
    name = "chronolock-node",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CHRONOLOCK_GIT_SHA"), ")"),
    about = "Clustered job store host"
)]
struct Cli {
    /// Config file. Defaults to ~/.chronolock/chronolock.toml.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler loop until Ctrl-C.
    Run,
    /// Print counts, groups and cluster checkins.
    Status,
    /// Recover locks left behind by dead instances.
    Recover,
    /// Delete every job, trigger, calendar, lock and checkin.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chronolock_node=info,chronolock_store=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ChronolockConfig::load(cli.config.as_deref()).context("loading config")?;
    let store = Arc::new(JobStore::open(&config).context("opening job store")?);
    info!(
        path = %config.store.path,
        instance_id = %store.instance_id(),
        clustered = config.cluster.enabled,
        "job store opened"
    );

    match cli.command {
        Command::Run => run(store).await,
        Command::Status => status(&store),
        Command::Recover => recover(&store),
        Command::Clear => {
            store.clear_all_scheduling_data()?;
            println!("cleared");
            Ok(())
        }
    }
}

async fn run(store: Arc<JobStore>) -> anyhow::Result<()> {
    let reports = store.startup().context("startup recovery")?;
    for report in reports.iter().filter(|r| !r.is_empty()) {
        info!(
            instance_id = %report.instance_id,
            triggers_reset = report.triggers_reset,
            recovery_triggers = report.recovery_triggers,
            "recovered at startup"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    if store.config().cluster.enabled {
        let checkin = Arc::new(store.checkin_executor()?);
        tasks.push(checkin.start(shutdown_rx.clone()));
    }
    tasks.push(tokio::spawn(host::run_misfire_scan(
        store.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(host::run_scheduler(store.clone(), shutdown_rx)));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "task ended abnormally");
        }
    }
    Ok(())
}

fn status(store: &JobStore) -> anyhow::Result<()> {
    println!("instance:  {}", store.instance_id());
    println!("jobs:      {}", store.number_of_jobs()?);
    println!("triggers:  {}", store.number_of_triggers()?);
    println!("calendars: {}", store.number_of_calendars()?);
    println!("job groups:     {}", store.job_group_names()?.join(", "));
    println!("trigger groups: {}", store.trigger_group_names()?.join(", "));
    println!("paused:         {}", store.paused_trigger_groups()?.join(", "));

    let checkins = store.checkins()?;
    if !checkins.is_empty() {
        println!("checkins:");
        for c in checkins {
            println!(
                "  {:<40} {}  every {}ms",
                c.instance_id, c.last_checkin, c.checkin_interval_ms
            );
        }
    }
    let locks = store.locks()?;
    if !locks.is_empty() {
        println!("locks:");
        for l in locks {
            println!("  {:<40} {}  {}", l.key, l.instance_id, l.acquired_at);
        }
    }
    Ok(())
}

fn recover(store: &JobStore) -> anyhow::Result<()> {
    let reports = if store.config().cluster.enabled {
        store.recover_unreachable()?
    } else {
        store.recover_all()?
    };
    if reports.iter().all(|r| r.is_empty()) {
        println!("nothing to recover");
    }
    for r in reports.iter().filter(|r| !r.is_empty()) {
        println!(
            "{}: {} triggers reset, {} recovery triggers, {} jobs unblocked, {} locks released",
            r.instance_id, r.triggers_reset, r.recovery_triggers, r.jobs_unblocked, r.locks_released
        );
    }
    Ok(())
}
