//! CLI entry point and collector orchestration (component L).
//!
//! A single invocation: parse flags, load config, reconcile the schema,
//! run the selected collectors in declared order, flush the write buffer,
//! log out. Collectors never run concurrently with each other; the only
//! concurrency in the process is `tokio`'s own I/O driver.

use crate::buffer::WriteBuffer;
use crate::config::Config;
use crate::harvest::{self, JobHarvester};
use crate::rest::{PaginatorProfile, RestClient};
use crate::schema::{definitions, Catalog};
use crate::storage::StorageClient;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Flat flag surface mirroring the operator-facing CLI: a required config
/// path, nested level flags that each imply the ones below them, explicit
/// per-collector toggles, and a handful of operational switches.
#[derive(Debug, Parser)]
#[command(author, version, about = "Ingests job and job-log telemetry into a schema-governed time-series database")]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long = "cfg")]
    pub cfg: std::path::PathBuf,

    #[arg(long)]
    pub verbose: bool,
    #[arg(long)]
    pub debug: bool,
    #[arg(long)]
    pub test: bool,

    /// Nested level flags: each implies every flag to its left.
    #[arg(long)]
    pub constant: bool,
    #[arg(long)]
    pub hourly: bool,
    #[arg(long)]
    pub daily: bool,
    #[arg(long)]
    pub all: bool,

    #[arg(long)]
    pub jobs: bool,
    #[arg(long = "jobLogs")]
    pub job_logs: bool,

    #[arg(long = "copy_database")]
    pub copy_database: Option<String>,
    #[arg(long = "loadedSystem")]
    pub loaded_system: bool,
    #[arg(long = "fullLogs")]
    pub full_logs: bool,
}

impl Cli {
    /// Expands the nested level flags into the concrete set of collectors
    /// to run this invocation. `--all` implies `--daily`, which implies
    /// `--hourly`, which implies `--constant`; explicit `--jobs`/`--jobLogs`
    /// always run regardless of level.
    fn runs_jobs(&self) -> bool {
        self.jobs || self.constant || self.hourly || self.daily || self.all
    }

    fn runs_job_logs(&self) -> bool {
        self.job_logs || self.constant || self.hourly || self.daily || self.all
    }
}

/// Parses arguments, runs the selected collectors, and returns a process
/// exit code: `0` success, `1` runtime error, `3` startup error. Bad CLI
/// arguments (`2`) are handled by `clap` itself before this runs.
pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    if cli.debug || cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sppmon=debug".into()))
            .init();
    }

    match run_with(cli).await {
        Ok(()) => ExitCode::from(0),
        Err(RunError::Startup(err)) => {
            error!(error = %err, "startup error");
            ExitCode::from(3)
        }
        Err(RunError::Runtime(err)) => {
            error!(error = %err, "runtime error");
            ExitCode::from(1)
        }
    }
}

enum RunError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

async fn run_with(cli: Cli) -> Result<(), RunError> {
    let config = Config::load(&cli.cfg).map_err(|e| RunError::Startup(e.into()))?;

    let mut catalog = Catalog::new(config.influx_db.db_name.clone());
    definitions::declare_all(&mut catalog).map_err(|e| RunError::Startup(e.into()))?;
    let catalog = Arc::new(catalog);

    let metrics_table = catalog.database.table("influx_metrics").map_err(|e| RunError::Startup(e.into()))?.clone();

    let http = reqwest::Client::builder().danger_accept_invalid_certs(!config.influx_db.verify_ssl).build().map_err(|e| RunError::Startup(e.into()))?;
    let storage = Arc::new(StorageClient::new(http.clone(), config.influx_db.base_url(), config.influx_db.db_name.clone()));
    storage.setup_database("grafana_reader").await.map_err(|e| RunError::Startup(e.into()))?;
    storage.reconcile(&catalog).await.map_err(|e| RunError::Startup(e.into()))?;

    let buffer = Arc::new(WriteBuffer::new(storage.clone()).with_metrics_table(metrics_table.clone()));

    let profile = if cli.loaded_system { PaginatorProfile::loaded() } else { PaginatorProfile::normal() };
    let rest_http = reqwest::Client::builder().cookie_store(true).build().map_err(|e| RunError::Startup(e.into()))?;
    let rest = Arc::new(RestClient::new(rest_http, config.spp_server.base_url(), config.spp_server.username.clone(), config.spp_server.password.clone(), profile).with_metrics_sink(buffer.clone(), metrics_table));

    rest.login().await.map_err(|e| RunError::Startup(e.into()))?;

    let mut errors = Vec::new();
    if cli.runs_jobs() || cli.runs_job_logs() {
        let harvester = JobHarvester::new(storage.clone(), rest.clone(), buffer.clone(), catalog.clone(), config.spp_server.job_log_retention, harvest::log_types(cli.full_logs));

        if cli.runs_jobs() {
            info!("running job collector");
            if let Err(err) = harvester.enumerate_sessions().await {
                warn!(error = %err, "job collector failed, continuing");
                errors.push(err.to_string());
            }
        }
        if cli.runs_job_logs() {
            info!("running job-log collector");
            if let Err(err) = harvester.harvest_job_logs().await {
                warn!(error = %err, "job-log collector failed, continuing");
                errors.push(err.to_string());
            }
        }
    }

    if let Some(new_db) = &cli.copy_database {
        info!(new_db, "copying database");
        if let Err(err) = storage.copy_database(&catalog, new_db).await {
            errors.push(err.to_string());
        }
    }

    // First flush drains the collectors' buffered inserts and buffers the
    // resulting self-metrics row; the second flush drains that row.
    for flush_metrics in [buffer.flush(false).await, buffer.flush(false).await] {
        for metric in &flush_metrics {
            info!(table = %metric.table_name, duration_ms = metric.duration_ms, item_count = metric.item_count, "flushed insert buffer");
            if let Some(err) = &metric.error {
                errors.push(err.clone());
            }
        }
    }

    if let Err(err) = rest.logout().await {
        warn!(error = %err, "logout failed");
    }

    if !errors.is_empty() {
        return Err(RunError::Runtime(anyhow::anyhow!("{} collector error(s): {}", errors.len(), errors.join("; "))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_implies_jobs_and_job_logs() {
        let cli = Cli::parse_from(["sppmon", "--cfg", "c.json", "--all"]);
        assert!(cli.runs_jobs());
        assert!(cli.runs_job_logs());
    }

    #[test]
    fn bare_flags_select_only_named_collectors() {
        let cli = Cli::parse_from(["sppmon", "--cfg", "c.json", "--jobs"]);
        assert!(cli.runs_jobs());
        assert!(!cli.runs_job_logs());
    }

    #[test]
    fn no_level_or_toggle_runs_nothing() {
        let cli = Cli::parse_from(["sppmon", "--cfg", "c.json"]);
        assert!(!cli.runs_jobs());
        assert!(!cli.runs_job_logs());
    }
}
