//! Sorta Mail sync daemon

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sorta_core::config::FolderConfig;
use sorta_core::gateway::RemoteMessage;
use sorta_core::{
    init, markers, Bucket, BucketCatalog, Config, Database, ImapGateway, InMemoryGateway,
    MailboxGateway, SyncWorker, ThreadEngine,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Sync a seeded in-memory mailbox instead of the IMAP server
    #[arg(long)]
    demo: bool,

    /// Run a single sync and exit
    #[arg(long)]
    once: bool,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
            .apply_env(),
        None => Config::load_from_env().context("Failed to load configuration")?,
    };

    let log_level = if args.debug {
        "debug".to_string()
    } else {
        config.app.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting {} sync v{}", sorta_core::APP_NAME, sorta_core::VERSION);
    init()?;
    config.validate()?;

    let gateway: Arc<dyn MailboxGateway> = if args.demo {
        info!("Running against the demo mailbox");
        Arc::new(demo_gateway(config.folders.clone()))
    } else {
        Arc::new(ImapGateway::new(&config)?)
    };
    let db_path = if args.demo {
        config.app.data_dir.join("sorta-mail-demo.db")
    } else {
        config.database_file_path()
    };

    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open cache at {}", db_path.display()))?;

    let catalog = BucketCatalog::new(db.clone(), gateway.clone());
    match catalog.discover().await {
        Ok(found) if !found.is_empty() => info!("Found {} new buckets", found.len()),
        Ok(_) => {}
        Err(e) => warn!("Bucket discovery failed: {}", e),
    }

    let engine = Arc::new(ThreadEngine::new(db, gateway.clone()));
    let worker = SyncWorker::new(engine, config.sync.clone());

    if args.once {
        let report = worker.run_once().await;
        for failure in &report.errors {
            error!("{}", failure);
        }
        gateway.close().await;
        if !report.is_clean() {
            anyhow::bail!("Sync finished with {} failed phases", report.errors.len());
        }
        return Ok(());
    }

    worker.start()?;
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    worker.stop();
    let stats = worker.stats().await;
    info!(
        "{} runs ({} clean, {} failed, {} skipped), {} messages pulled",
        stats.total_runs, stats.clean_runs, stats.failed_runs, stats.skipped_runs, stats.total_messages_pulled
    );
    gateway.close().await;
    Ok(())
}

/// A small mailbox with a bucketed message and a two-message thread
fn demo_gateway(folders: FolderConfig) -> InMemoryGateway {
    let inbox = folders.inbox.clone();
    let gateway = InMemoryGateway::new(folders);
    let now = Utc::now();

    gateway.add_message(
        &inbox,
        RemoteMessage::new("<budget-1@demo.sorta>", "Budget Review")
            .from_sender("Dana <dana@example.com>")
            .dated(now - Duration::days(2))
            .with_text("Numbers for Q3 attached.")
            .with_attachment("q3.xlsx", "application/vnd.ms-excel"),
    );
    gateway.add_message(
        &inbox,
        RemoteMessage::new("<budget-2@demo.sorta>", "Re: Budget Review")
            .from_sender("Sam <sam@example.com>")
            .dated(now - Duration::days(1))
            .replying_to("<budget-1@demo.sorta>")
            .with_text("Looks fine to me."),
    );
    gateway.add_message(
        &inbox,
        RemoteMessage::new("<invoice@demo.sorta>", "Invoice #1042")
            .from_sender("billing@example.com")
            .dated(now - Duration::hours(5))
            .with_flag(Bucket::new("Finance").marker())
            .with_flag(markers::CATEGORIZED)
            .with_text("Due in 30 days."),
    );
    gateway
}
