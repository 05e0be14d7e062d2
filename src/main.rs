//! feedmirror: incremental mirroring of remote profiles and their content.
//!
//! Each configured source is paged newest first. New or changed posts,
//! messages and stories are persisted through transaction-guarded entities
//! in SQLite or PostgreSQL, and their media is fetched by a bounded download
//! pool into local or S3 storage, deduplicated by content hash.

#![warn(clippy::all)]

mod cli;
mod config;
mod db;
mod dedup;
mod download;
mod models;
pub mod retry;
mod server;
mod shutdown;
mod storage;
mod store;
mod sync;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Command, ExportArgs, ServeArgs, SyncArgs};
use config::Config;
use db::{query_count, Database, Executor};
use download::{DownloadPool, DownloadQueue};
use storage::Storage;
use sync::{HttpSource, SyncDriver, SyncError, SyncOptions};
use types::Source;

async fn connect(config: &Config) -> anyhow::Result<Database> {
    let db = Database::connect(config.database_url(), config.postgres_pool_size).await?;
    tracing::debug!("Database ready at {}", db.describe());
    Ok(db)
}

/// Run the sync command.
async fn run_sync(config: Config, args: SyncArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    if config.sources.is_empty() {
        anyhow::bail!("No [[sources]] configured");
    }

    let db = connect(&config).await?;
    let storage = storage::open(&config.storage).await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.download.timeout_secs))
        .build()?;
    let pool = Arc::new(DownloadPool::new(
        client,
        Arc::clone(&storage),
        config.download.retry(),
    ));
    pool.start(&cancel, config.download.workers, config.download.queue)
        .await?;

    let mut settings = config.sync.clone();
    settings.skip_posts |= args.skip_posts;
    settings.skip_messages |= args.skip_messages;
    settings.skip_stories |= args.skip_stories;
    let options = SyncOptions {
        page_size: settings.page_size,
        force_rescan: args.force_rescan,
        kinds: settings.kinds(),
    };
    tracing::info!(
        workers = config.download.workers,
        force_rescan = options.force_rescan,
        "Starting feedmirror"
    );
    let queue: Arc<dyn DownloadQueue> = pool.clone();
    let driver = SyncDriver::new(db, storage, queue, options, cancel.clone());

    let mut failures = 0usize;
    let mut synced = 0usize;
    'sources: for source in &config.sources {
        let client = HttpSource::new(
            source.source,
            &source.base_url,
            source.token.clone(),
            source.pagination,
            cancel.clone(),
        )?;
        for profile in &source.profiles {
            if !args.profiles.is_empty() && !args.profiles.contains(profile) {
                continue;
            }
            synced += 1;
            match driver.sync_profile(&client, profile).await {
                Ok(report) if report.failed_kinds.is_empty() => {
                    tracing::info!(
                        source = %source.name,
                        profile = %profile,
                        "{} items, {} changed",
                        report.items,
                        report.changed
                    );
                }
                Ok(report) => {
                    failures += 1;
                    tracing::warn!(
                        source = %source.name,
                        profile = %profile,
                        "Incomplete sync, failed kinds: {:?}",
                        report.failed_kinds
                    );
                }
                Err(SyncError::Cancelled) => {
                    tracing::info!("Shutdown requested, stopping sync");
                    break 'sources;
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(source = %source.name, profile = %profile, "Sync failed: {}", e);
                }
            }
        }
    }

    if synced == 0 && !args.profiles.is_empty() {
        tracing::warn!("None of the requested profiles are configured");
    }

    pool.done().await;
    pool.wait().await;
    pool.stop().await;

    if cancel.is_cancelled() {
        return Ok(());
    }
    if failures > 0 {
        anyhow::bail!("{} of {} profiles failed to sync", failures, synced);
    }
    Ok(())
}

/// Run the status command.
async fn run_status(config: Config) -> anyhow::Result<()> {
    let db = connect(&config).await?;
    let mut conn = db.conn().await?;

    println!("Database: {}", db.describe());
    println!();
    println!("Rows:");
    for table in ["profiles", "posts", "messages", "stories", "media"] {
        let n = query_count(&mut conn, &format!("SELECT COUNT(*) AS n FROM {table}"), &[]).await?;
        println!("  {:<10} {}", format!("{table}:"), n);
    }

    let pending = query_count(
        &mut conn,
        "SELECT COUNT(*) AS n FROM media WHERE visible <> 0 AND location = ''",
        &[],
    )
    .await?;
    println!();
    println!("Media pending download: {}", pending);

    let profiles = conn
        .query(
            "SELECT source, source_id, username, last_scrape FROM profiles \
             ORDER BY source, username",
            &[],
        )
        .await?;
    if !profiles.is_empty() {
        println!();
        println!("Profiles:");
        for row in profiles {
            let last = match row.int("last_scrape")? {
                0 => "never".to_string(),
                ts => chrono::DateTime::from_timestamp(ts, 0)
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| ts.to_string()),
            };
            println!(
                "  {}/{} ({}) last scraped {}",
                Source::from_bits(row.int("source")?),
                row.text("source_id")?,
                row.text("username")?,
                last
            );
        }
    }

    Ok(())
}

/// Run the verify command.
async fn run_verify(config: Config) -> anyhow::Result<()> {
    let db = connect(&config).await?;
    let storage = storage::open(&config.storage).await?;

    let rows = {
        let mut conn = db.conn().await?;
        conn.query(
            "SELECT id, location, preview FROM media WHERE location <> '' OR preview <> ''",
            &[],
        )
        .await?
    };

    println!("Verifying {} stored media...", rows.len());
    println!();

    // Deduplicated media share files; stat each path once.
    let mut seen: HashMap<String, bool> = HashMap::new();
    let mut verified = 0;
    let mut missing = 0;
    for row in &rows {
        let id = row.text("id")?;
        for (slot, path) in [("location", row.text("location")?), ("preview", row.text("preview")?)] {
            if path.is_empty() {
                continue;
            }
            let exists = match seen.get(&path) {
                Some(&exists) => exists,
                None => {
                    let exists = storage.stat(&path).await?.is_some();
                    seen.insert(path.clone(), exists);
                    exists
                }
            };
            if exists {
                verified += 1;
            } else {
                println!("MISSING: {} ({} of {})", path, slot, id);
                missing += 1;
            }
        }
    }

    println!();
    println!("Results:");
    println!("  Verified: {}", verified);
    println!("  Missing:  {}", missing);

    if missing > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Run the export command.
async fn run_export(config: Config, args: ExportArgs) -> anyhow::Result<()> {
    let storage = storage::open(&config.storage).await?;

    let found = match &args.output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            let found = export_to(storage.as_ref(), &args, &mut file).await?;
            file.sync_all().await?;
            found
        }
        None => export_to(storage.as_ref(), &args, &mut tokio::io::stdout()).await?,
    };

    if !found {
        if let Some(path) = &args.output {
            let _ = tokio::fs::remove_file(path).await;
        }
        anyhow::bail!("Nothing stored at {}", args.path);
    }
    Ok(())
}

async fn export_to(
    storage: &dyn Storage,
    args: &ExportArgs,
    sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
) -> anyhow::Result<bool> {
    let found = storage.get(&args.path, args.start, args.len, sink).await?;
    sink.flush().await?;
    Ok(found)
}

/// Run the serve command.
async fn run_serve(config: Config, args: ServeArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let storage = storage::open(&config.storage).await?;
    server::serve(storage, args.listen, cancel).await
}

/// Run the migrate command.
async fn run_migrate(config: Config) -> anyhow::Result<()> {
    let db = connect(&config).await?;
    let version = db::schema::get_schema_version(&db).await?;
    println!(
        "{} is at schema version {} (latest {})",
        db.describe(),
        version,
        db::schema::SCHEMA_VERSION
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let filter = match cli.log_level {
        types::LogLevel::Debug => "debug",
        types::LogLevel::Info => "info",
        types::LogLevel::Warn => "warn",
        types::LogLevel::Error => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "Loaded config");

    match cli.command {
        Command::Sync(args) => {
            let shutdown_token = shutdown::install_signal_handler();
            run_sync(config, args, shutdown_token).await
        }
        Command::Status => run_status(config).await,
        Command::Verify => run_verify(config).await,
        Command::Export(args) => run_export(config, args).await,
        Command::Migrate => run_migrate(config).await,
        Command::Serve(args) => {
            let shutdown_token = shutdown::install_signal_handler();
            run_serve(config, args, shutdown_token).await
        }
    }
}
