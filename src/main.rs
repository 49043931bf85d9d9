use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SubsecRound, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use asnstats::config::Config;
use asnstats::export::PipelineMetrics;
use asnstats::migrate::{self, ClickHouseMigrator, MigrationStatus, Migrator};
use asnstats::pipeline::{seed_active_asns, Pipeline, PipelineSettings, RunContext};
use asnstats::store::clickhouse::{render_seed_statements, ClickHouseConnector};

/// Per-ASN origin/transit prefix statistics generator.
#[derive(Parser)]
#[command(name = "asnstats", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level; overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Defaults to `run`.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply migrations and reseed the active ASN table.
    Init,
    /// Run one aggregation and write snapshots.
    Run,
    /// Schema migration control.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Show the applied schema version.
    Status,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("asnstats {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting asnstats",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let command = cli.command.unwrap_or(Command::Run);
    let result = rt.block_on(async {
        match command {
            Command::Init => init(&cfg).await,
            Command::Run => run(&cfg).await,
            Command::Migrate { action } => migrate_schema(&cfg, action).await,
            Command::Version => Ok(()),
        }
    });

    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "asnstats failed");
    }

    result
}

/// Cancels the returned token on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("received SIGINT, cancelling run");
                        token.cancel();
                    }
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, cancelling run");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, cancelling run");
            }
        }

        token.cancel();
    });

    cancel
}

async fn run(cfg: &Config) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new(&cfg.metrics.addr)?);
    if !cfg.metrics.addr.is_empty() {
        metrics.start().await.context("starting metrics server")?;
    }

    // One control session on top of the worker pool.
    let connector =
        ClickHouseConnector::new(&cfg.clickhouse, &cfg.queries, cfg.pipeline.workers + 1);
    let pipeline = Pipeline::new(connector, PipelineSettings::from_config(cfg));

    let ctx = RunContext::new(Arc::clone(&metrics), shutdown_token());
    let result = pipeline.run(&ctx).await;

    metrics.stop();
    if !cfg.metrics.textfile.is_empty() {
        let path = Path::new(&cfg.metrics.textfile);
        if let Err(e) = metrics.write_textfile(path) {
            tracing::warn!(error = %format!("{e:#}"), "writing metrics textfile");
        }
    }

    result.map(|_| ())
}

async fn init(cfg: &Config) -> Result<()> {
    let connector = ClickHouseConnector::new(&cfg.clickhouse, &cfg.queries, 1);

    let status = ClickHouseMigrator::new(connector.pool().clone())
        .up()
        .await
        .context("applying migrations")?;
    tracing::info!(version = status.version, "schema ready");

    let statements = render_seed_statements(
        connector.database(),
        &cfg.queries.seed_active_asns,
        Utc::now().trunc_subsecs(0),
    );
    seed_active_asns(&connector, &statements).await
}

async fn migrate_schema(cfg: &Config, action: MigrateAction) -> Result<()> {
    let connector = ClickHouseConnector::new(&cfg.clickhouse, &cfg.queries, 1);
    let migrator = ClickHouseMigrator::new(connector.pool().clone());

    let status = match action {
        MigrateAction::Up => migrator.up().await?,
        MigrateAction::Down => migrator.down().await?,
        MigrateAction::Status => migrator.status().await?,
    };

    print_status(&status);

    Ok(())
}

fn print_status(status: &MigrationStatus) {
    println!(
        "version: {}/{}, dirty: {}, pending: {}",
        status.version,
        migrate::latest_version(),
        status.dirty,
        status.pending(),
    );
}
