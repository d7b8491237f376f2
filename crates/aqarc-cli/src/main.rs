use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use aqarc_catalog::CatalogClient;
use aqarc_sync::{sync_catalog, transport_from_config, IngestConfig, IngestPipeline, PgStore};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aqarc-cli")]
#[command(about = "Air-quality archive ingestion")]
struct Cli {
    /// YAML config file; environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Locations processed in parallel.
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, reconcile and store archive measurements for every pending location.
    Ingest,
    /// Copy parameters, countries, locations and sensors from the catalog API.
    SyncCatalog,
    /// Apply database migrations.
    Migrate,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> Result<IngestConfig> {
    let mut config = match &cli.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env()?,
    };
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency.max(1);
    }
    Ok(config)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work and stopping");
            token.cancel();
        }
    });
    cancel
}

async fn connect(config: &IngestConfig) -> Result<PgStore> {
    let url = config.database_url()?;
    let max_connections = config.db_max_connections.max(config.concurrency as u32 + 1);
    PgStore::connect(url, max_connections)
        .await
        .context("connecting to database")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let store = connect(&config).await?;
            let cancel = cancel_on_ctrl_c();
            let transport = transport_from_config(&config);
            let pipeline =
                IngestPipeline::new(&config, Arc::new(store), transport).with_cancellation(cancel);
            let summary = pipeline.run().await?;

            println!(
                "ingest complete: run_id={} ingested={} skipped={} failed={} cancelled={} \
                 rows={} reports={}",
                summary.run_id,
                summary.ingested,
                summary.skipped,
                summary.failed,
                summary.cancelled,
                summary.rows_written,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            for (report, path) in summary.retained_paths() {
                eprintln!(
                    "location {} ({}) not purged; staging kept at {}",
                    report.location_id,
                    report.name,
                    path.display()
                );
            }
            if summary.failed > 0 || summary.cancelled > 0 {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::SyncCatalog => {
            let store = connect(&config).await?;
            let client = CatalogClient::new(
                config.api_base.clone(),
                config.api_key()?,
                config.http_client_config(),
            )?
            .with_cancellation(cancel_on_ctrl_c());
            let summary =
                sync_catalog(&client, &store, &config.countries, config.page_size).await?;
            println!(
                "catalog sync complete: parameters={} countries={} locations={} sensors={} \
                 dropped_sensors={}",
                summary.parameters,
                summary.countries,
                summary.locations,
                summary.sensors,
                summary.dropped_sensors
            );
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}
