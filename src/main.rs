mod api;
mod catalog;
mod cli;
mod config;
mod coordinator;
mod deriver;
mod store;
mod trends;

use crate::catalog::Catalog;
use crate::cli::{Cli, Commands, ConfigCommands};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::deriver::Status;
use crate::store::{SubmissionFeed, SubmissionHub, SubmissionInput, SubmissionStore};
use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => handle_config_command(command),
        Commands::Status => handle_status(),
        Commands::Doctor => handle_doctor(),
        Commands::Trends { weeks } => handle_trends(weeks).await,
        Commands::Submit {
            location,
            checklist_type,
            completed,
            total,
            by,
        } => handle_submit(location, checklist_type, completed, total, by),
        Commands::Service => {
            let config = load_or_default_config()?;
            run_service(config).await
        }
    }
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Set { key, value } => {
            let mut config = load_or_default_config()?;
            config.set_value(&key, &value)?;
            config.ensure_bootstrap_files()?;
            config.save()?;

            println!("Config saved: {key} = {value}");
            Ok(())
        }
        ConfigCommands::Get { key } => {
            let config = load_or_default_config()?;
            let value = config
                .get_value(&key)
                .with_context(|| format!("Unsupported config key: {key}"))?;

            println!("{value}");
            Ok(())
        }
    }
}

fn handle_status() -> Result<()> {
    let config = load_config()?;
    let catalog = load_catalog(&config)?;
    let store = SubmissionStore::open(&config.db_path)?;

    let now = Local::now().naive_local();
    let submissions = store.submissions_for_date(now.date())?;
    let statuses = deriver::derive(&catalog, &submissions, now);

    println!("checkboard status");
    println!("- submissions_recorded: {}", store.submission_count()?);
    println!(
        "- last_submitted_at: {}",
        store
            .latest_submission_at()?
            .map(|timestamp| timestamp.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("- checklists ({}):", statuses.len());

    for status in statuses {
        let marker = match status.status {
            Status::Completed => "completed",
            Status::InProgress => "in_progress",
            Status::Pending => "pending",
            Status::Overdue => "overdue",
        };
        println!(
            "  {} {} [{}] {}/{} due {}",
            status.location.slug(),
            status.checklist_type.as_str(),
            marker,
            status.completed_tasks,
            status.total_tasks,
            status.deadline
        );
    }

    Ok(())
}

fn handle_doctor() -> Result<()> {
    let config_path = Config::config_path();
    let mut issues = Vec::new();

    if config_path.exists() {
        println!("[OK] config.json found: {}", config_path.display());
    } else {
        println!("[WARN] config.json not found: {}", config_path.display());
        issues.push("config missing".to_string());
    }

    let config = load_or_default_config()?;

    match SubmissionStore::open(&config.db_path) {
        Ok(_) => println!("[OK] SQLite reachable: {}", config.db_path.display()),
        Err(error) => {
            println!("[WARN] SQLite check failed: {error}");
            issues.push("db unreachable".to_string());
        }
    }

    match Catalog::load(&config.catalog_path) {
        Ok(catalog) => println!(
            "[OK] catalog valid: {} entries ({})",
            catalog.len(),
            config.catalog_path.display()
        ),
        Err(error) => {
            println!("[WARN] catalog check failed: {error}");
            issues.push("catalog invalid".to_string());
        }
    }

    if issues.is_empty() {
        println!("doctor result: no issues");
    } else {
        println!("doctor result: {} warning(s)", issues.len());
    }

    Ok(())
}

async fn handle_trends(weeks: Option<u32>) -> Result<()> {
    let config = load_config()?;
    let catalog = load_catalog(&config)?;
    let weeks = weeks.unwrap_or(config.trend_weeks).clamp(1, 52);

    let report = trends::fetch_trends(
        &config.db_path,
        &catalog,
        weeks,
        config.trend_timeout(),
        config.missed_task_limit,
    )
    .await
    .with_context(|| format!("Failed to compute {weeks}-week trends"))?;

    println!("Completion by week ({weeks} weeks):");
    for bucket in &report.trends {
        println!(
            "  {}: {:.0}%",
            bucket.week_start,
            bucket.completion_rate * 100.0
        );
    }

    if report.missed_tasks.is_empty() {
        println!("No commonly missed tasks in window");
    } else {
        println!("Commonly missed tasks:");
        for task in &report.missed_tasks {
            println!("  {} ({}x)", task.task_name, task.missed_count);
        }
    }

    Ok(())
}

fn handle_submit(
    location: String,
    checklist_type: String,
    completed: u32,
    total: u32,
    by: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    let hub = SubmissionHub::new(config.db_path.clone());

    let input = SubmissionInput {
        location: location.parse()?,
        checklist_type: checklist_type.parse()?,
        submitted_by: by,
        completed_tasks: completed,
        total_tasks: total,
        task_details: None,
    };

    let submission = hub.record(&input, Local::now().naive_local())?;
    println!(
        "Submission recorded: {} {} {}/{} at {}",
        submission.location.slug(),
        submission.checklist_type.as_str(),
        submission.completed_tasks,
        submission.total_tasks,
        submission.submitted_at
    );

    Ok(())
}

async fn run_service(config: Config) -> Result<()> {
    config.ensure_bootstrap_files()?;
    let catalog = Arc::new(load_catalog(&config)?);
    let _ = SubmissionStore::open(&config.db_path)?;

    let shared_config = Arc::new(config);
    let hub = Arc::new(SubmissionHub::new(shared_config.db_path.clone()));

    let coordinator = Coordinator::spawn(
        Arc::clone(&catalog),
        Arc::clone(&hub) as Arc<dyn SubmissionFeed>,
        shared_config.refresh_interval(),
    );
    let snapshot_log = tokio::spawn(log_snapshots(coordinator.subscribe()));

    info!("checkboard service started");

    tokio::select! {
        api_result = api::run_server(
            Arc::clone(&shared_config),
            Arc::clone(&catalog),
            Arc::clone(&hub),
        ) => {
            api_result?;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    coordinator.shutdown().await;
    let _ = snapshot_log.await;

    Ok(())
}

async fn log_snapshots(mut snapshots: broadcast::Receiver<coordinator::StatusSnapshot>) {
    loop {
        match snapshots.recv().await {
            Ok(snapshot) => {
                let completed = count_status(&snapshot, Status::Completed);
                let overdue = count_status(&snapshot, Status::Overdue);
                info!(
                    computed_at = %snapshot.computed_at,
                    stale = snapshot.stale,
                    completed,
                    overdue,
                    total = snapshot.statuses.len(),
                    "status snapshot published"
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "snapshot log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn count_status(snapshot: &coordinator::StatusSnapshot, status: Status) -> usize {
    snapshot
        .statuses
        .iter()
        .filter(|entry| entry.status == status)
        .count()
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    if config.catalog_path.exists() {
        Catalog::load(&config.catalog_path)
    } else {
        Catalog::embedded_default()
    }
}

/// Bootstrap variant: a missing config file is created with defaults, but a
/// present file that fails to parse is still an error so user edits are never
/// clobbered.
fn load_or_default_config() -> Result<Config> {
    if Config::config_path().exists() {
        Config::load()
    } else {
        let config = Config::default();
        config.ensure_bootstrap_files()?;
        config.save()?;
        Ok(config)
    }
}

fn load_config() -> Result<Config> {
    Config::load().context("Failed to load config. Run `checkboard service` once to create it")
}
