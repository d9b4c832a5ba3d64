use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use etlsync_jobs::job_by_name;
use etlsync_storage::sql::{create_table_sql, delete_absent_sql, upsert_sql};
use etlsync_storage::{connect_pool, Destination, PgDestination};
use etlsync_sync::{
    configure_jobs, maybe_build_scheduler, run_jobs, select_jobs, ConfiguredJob, Connections, JobsFile,
    SyncConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "etlsync")]
#[command(about = "Scheduled upsert-and-reconcile sync jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List every job with its schedule
    List,
    /// Print a job's table definition and generated statements
    Show { job: String },
    /// Create missing destination tables for every enabled job
    EnsureTables,
    /// Run jobs once
    Run {
        /// Job names
        jobs: Vec<String>,
        /// Run every enabled job
        #[arg(long)]
        all: bool,
        /// Write to an in-memory destination instead of the result database
        #[arg(long)]
        dry_run: bool,
        /// Print run summaries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run enabled jobs on their cron schedules until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("etlsync=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::List => list().await,
        Commands::Show { job } => show(&job),
        Commands::EnsureTables => ensure_tables().await,
        Commands::Run {
            jobs,
            all,
            dry_run,
            json,
        } => run(&jobs, all, dry_run, json).await,
        Commands::Schedule => schedule().await,
    }
}

async fn load_jobs() -> Result<(SyncConfig, Vec<ConfiguredJob>)> {
    let config = SyncConfig::from_env()?;
    let file = JobsFile::load(&config.jobs_file_path()).await?;
    let jobs = configure_jobs(&config, &file);
    Ok((config, jobs))
}

async fn list() -> Result<ExitCode> {
    let (_, jobs) = load_jobs().await?;
    for job in &jobs {
        println!(
            "{:<36} {:<14} {:<8} {:<8} {}",
            job.name(),
            job.cron,
            if job.enabled { "enabled" } else { "disabled" },
            job.commit_mode,
            job.definition.description
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn show(name: &str) -> Result<ExitCode> {
    let job = job_by_name(name).with_context(|| format!("unknown job {name:?}"))?;
    let schema = &job.schema;
    println!("-- {}: {}", job.name, job.description);
    println!("-- source: {:?}, cron: {}", job.source, job.cron);
    println!("-- refreshable: {}", schema.refreshable.join(", "));
    let immutable = schema
        .immutable_columns()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>();
    println!("-- immutable: {}", immutable.join(", "));
    println!();
    println!("{};", create_table_sql(schema));
    println!();
    println!("{};", upsert_sql(schema));
    if job.reconcile.is_some() {
        println!();
        println!("{};", delete_absent_sql(schema));
    }
    Ok(ExitCode::SUCCESS)
}

async fn ensure_tables() -> Result<ExitCode> {
    let (config, jobs) = load_jobs().await?;
    let pool = connect_pool("result_db", &config.result_database_url, config.pool_settings(false)).await?;
    let destination = PgDestination::new("result_db", pool);
    for job in jobs.iter().filter(|job| job.enabled) {
        destination.ensure_table(&job.definition.schema).await?;
        println!("ensured {}", job.definition.schema.table);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(names: &[String], all: bool, dry_run: bool, json: bool) -> Result<ExitCode> {
    let (config, jobs) = load_jobs().await?;
    let selected = select_jobs(&jobs, names, all)?;
    let connections = Connections::connect(&config, &selected, dry_run).await?;
    let reports_dir = if dry_run { None } else { config.reports_dir.clone() };
    let pipelines = selected
        .iter()
        .map(|job| connections.pipeline(job, reports_dir.clone()))
        .collect::<Result<Vec<_>>>()?;

    let results = run_jobs(&pipelines).await;
    let mut failed = 0usize;
    let mut summaries = Vec::new();
    for (name, result) in results {
        match result {
            Ok(summary) => {
                if !json {
                    println!(
                        "{name}: run_id={} fetched={} upserted={} deleted={} mode={} destination={}",
                        summary.run_id,
                        summary.rows_fetched,
                        summary.rows_upserted,
                        summary.rows_deleted(),
                        summary.commit_mode,
                        summary.destination
                    );
                }
                summaries.push(summary);
            }
            Err(err) => {
                failed += 1;
                eprintln!("{name}: failed: {err:#}");
            }
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }

    if failed > 0 {
        eprintln!("{failed} of {} job(s) failed", pipelines.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn schedule() -> Result<ExitCode> {
    let (config, jobs) = load_jobs().await?;
    let enabled = jobs.into_iter().filter(|job| job.enabled).collect::<Vec<_>>();
    let connections = Connections::connect(&config, &enabled, false).await?;
    let Some(mut sched) = maybe_build_scheduler(&config, &enabled, &connections).await? else {
        bail!("scheduler is disabled; set ETLSYNC_SCHEDULER_ENABLED=true");
    };

    sched.start().await.context("starting scheduler")?;
    info!(jobs = enabled.len(), "scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}
