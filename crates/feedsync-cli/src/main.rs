use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedsync_adapters::{GitLabTracker, HttpClient, HttpClientConfig, HttpFeedSource};
use feedsync_backup::BackupManager;
use feedsync_storage::{DedupStore, SetClient};
use feedsync_sync::{AppConfig, Poller, Reconciler, SyncMetrics, SyncSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "feedsync")]
#[command(about = "Sync RSS/Atom feed items into tracker issues")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll feeds forever, with backups and the health/metrics server.
    Run,
    /// Run a single poll cycle and exit.
    Check,
    /// Upload one snapshot of the store and exit.
    Backup,
    /// Replace the store with the newest snapshot and exit.
    Restore,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Check => check(config).await,
        Commands::Backup => {
            let store = open_store(&config).await?;
            let manager = BackupManager::from_config(Arc::clone(&store), &config.backup)?;
            let result = manager.backup().await;
            store.close().await;
            let info = result.context("backup failed")?;
            println!(
                "backup complete: key={} bytes={} sha256={}",
                info.key, info.bytes, info.sha256
            );
            Ok(())
        }
        Commands::Restore => {
            let store = open_store(&config).await?;
            let manager = BackupManager::from_config(Arc::clone(&store), &config.backup)?;
            let result = manager.restore().await;
            store.close().await;
            let report = result.context("restore failed")?;
            println!(
                "restore complete: key={} bytes={} rows={}",
                report.key, report.bytes, report.rows
            );
            Ok(())
        }
    }
}

async fn open_store(config: &AppConfig) -> Result<Arc<DedupStore>> {
    let store = DedupStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

async fn load_settings(config: &AppConfig) -> Result<SyncSettings> {
    let path = config.feeds_file();
    let settings = SyncSettings::load(&path).await?;
    info!(
        feeds = settings.feeds.len(),
        interval_secs = settings.poll_interval.as_secs(),
        "loaded feed configuration"
    );
    Ok(settings)
}

fn build_reconciler(
    config: &AppConfig,
    store: &Arc<DedupStore>,
    metrics: Arc<SyncMetrics>,
) -> Result<Reconciler> {
    let http = HttpClient::new(HttpClientConfig {
        timeout: config.http_timeout,
        ..HttpClientConfig::default()
    })
    .context("building http client")?;
    let tracker = GitLabTracker::new(http.clone(), &config.tracker_base_url, &config.tracker_token);
    Ok(Reconciler::new(
        SetClient::new(store.clone()),
        Arc::new(HttpFeedSource::new(http)),
        Arc::new(tracker),
        metrics,
    ))
}

async fn check(config: AppConfig) -> Result<()> {
    let settings = load_settings(&config).await?;
    let store = open_store(&config).await?;
    let reconciler = build_reconciler(&config, &store, Arc::new(SyncMetrics::new()))?;
    let poller = Poller::new(reconciler, settings);

    let summary = poller.run_cycle(&CancellationToken::new()).await;
    store.close().await;

    for report in &summary.reports {
        println!(
            "{}: fetched={} created={} already_seen={} remote_duplicates={} too_old={} \
             unclassifiable={} failed={}",
            report.feed_id,
            report.fetched,
            report.created,
            report.already_seen,
            report.remote_duplicates,
            report.too_old,
            report.unclassifiable,
            report.failed
        );
    }
    for feed in &summary.failed_feeds {
        println!("{feed}: fetch failed");
    }
    println!("check complete: run_id={}", summary.run_id);
    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    let settings = load_settings(&config).await?;
    let store = open_store(&config).await?;
    let backup = Arc::new(BackupManager::from_config(Arc::clone(&store), &config.backup)?);

    if config.restore_on_start {
        let report = backup.restore().await.context("restore on start failed")?;
        info!(key = %report.key, rows = report.rows, "restored store before start");
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let metrics = Arc::new(SyncMetrics::new());
    let poller = Poller::new(build_reconciler(&config, &store, Arc::clone(&metrics))?, settings);

    let backup_task = backup.spawn(cancel.clone());
    let health = SetClient::new(store.clone()).with_cancellation(cancel.clone());
    let server = {
        let address = config.listen_address.clone();
        let state = feedsync_web::AppState::new(health, metrics);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = feedsync_web::serve(&address, state, cancel.clone()).await;
            if let Err(err) = &result {
                error!(error = %err, "http server failed, shutting down");
                cancel.cancel();
            }
            result
        })
    };

    poller.run(cancel.clone()).await;

    if let Err(err) = backup_task.await {
        warn!(error = %err, "backup task ended abnormally");
    }
    let served = server.await.context("http server task panicked")?;
    store.close().await;
    info!("shutdown complete");
    served
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
    cancel.cancel();
}
