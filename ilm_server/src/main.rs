//! `ilm` — administrative entry point for the image lifecycle manager.
//!
//! Opens the configured record store, wires the managers to it and to the
//! audit emitter, runs one command, and flushes pending audit events.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ilm_server::audit::{AuditEmitter, AuditSink, FanoutAuditSink, StoreAuditSink, TracingAuditSink};
use ilm_server::config::IlmConfig;
use ilm_server::services::build_service::BuildService;
use ilm_server::services::image_service::ImageService;
use ilm_server::services::integrity::IntegrityService;
use ilm_server::services::project_service::ProjectService;
use ilm_server::services::test_service::TestService;
use ilm_server::store::{MemoryStore, PgDocumentStore, RecordStore};
use ilm_server::{metrics, migration};

#[derive(Parser)]
#[command(name = "ilm", about = "Image Lifecycle Manager administration")]
struct Cli {
    /// PostgreSQL connection URL (in-memory store when unset)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the document table and indexes
    Migrate,
    /// Print every project as one JSON line, oldest first
    Projects,
    /// Report dangling child ids and orphaned children; exits 1 if any
    Orphans,
    /// Delete all projects, images, tests and builds
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let config = IlmConfig::from_env().with_database_url(cli.database_url);
    metrics::init_metrics();

    // Record store
    let pg = match &config.database_url {
        Some(url) => Some(PgDocumentStore::connect(url, config.db_pool_size)?),
        None => None,
    };
    let store: Arc<dyn RecordStore> = match &pg {
        Some(pg) => Arc::new(pg.clone()),
        None => Arc::new(MemoryStore::new()),
    };

    // Audit emitter
    let sinks: Vec<Arc<dyn AuditSink>> = vec![
        Arc::new(TracingAuditSink),
        Arc::new(StoreAuditSink::new(store.clone())),
    ];
    let (audit, drain) = AuditEmitter::spawn(
        Arc::new(FanoutAuditSink::new(sinks)),
        config.audit_queue_capacity,
    );

    let outcome = run(cli.command, &config, pg.as_ref(), store, audit).await;

    tracing::info!("Flushing audit events...");
    drain.shutdown().await;
    if let Some(pg) = &pg {
        pg.close();
    }
    outcome
}

async fn run(
    command: Command,
    config: &IlmConfig,
    pg: Option<&PgDocumentStore>,
    store: Arc<dyn RecordStore>,
    audit: AuditEmitter,
) -> anyhow::Result<ExitCode> {
    let projects = ProjectService::new(store.clone(), audit.clone())
        .with_identities(&config.author, &config.updater);

    match command {
        Command::Migrate => {
            let Some(pg) = pg else {
                anyhow::bail!("migrate requires DATABASE_URL");
            };
            tracing::info!("Running ILM document store migration...");
            migration::run_migration(pg).await?;
            tracing::info!("ILM document store migration completed.");
        }
        Command::Projects => {
            for project in projects.list().await? {
                println!("{}", serde_json::to_string(&project)?);
            }
        }
        Command::Orphans => {
            let report = IntegrityService::new(store).scan().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Reset => {
            projects.delete_all().await?;
            ImageService::new(store.clone(), audit.clone()).delete_all().await?;
            TestService::new(store.clone(), audit.clone()).delete_all().await?;
            BuildService::new(store, audit).delete_all_builds().await?;
            tracing::info!("Environment reset complete");
        }
    }
    Ok(ExitCode::SUCCESS)
}
