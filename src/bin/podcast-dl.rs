//! Command-line front end: run the download queue until interrupted.

use clap::Parser;
use podcast_dl::{Config, QueueController, QueueSnapshot, SnapshotConsumer, shutdown_signal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "podcast-dl", version, about = "Persistent podcast download queue")]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Queue file to load and persist
    #[arg(long)]
    queue_file: Option<PathBuf>,

    /// Directory relative destinations are resolved against
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Maximum number of concurrent downloads
    #[arg(short = 'j', long)]
    max_downloads: Option<usize>,

    /// Do not start queued items automatically
    #[arg(long)]
    no_auto_download: bool,

    /// Import a newsboat-style queue file before starting
    #[arg(long)]
    import: Option<PathBuf>,

    /// Exit once nothing is left to download
    #[arg(long)]
    exit_when_idle: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Enclosure URLs to add to the queue
    urls: Vec<String>,
}

impl Cli {
    fn load_config(&self) -> podcast_dl::Result<Config> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => Config::default(),
        };
        if let Some(queue_file) = &self.queue_file {
            config.queue.queue_file = queue_file.clone();
        }
        if let Some(download_dir) = &self.download_dir {
            config.queue.download_dir = download_dir.clone();
        }
        if let Some(max) = self.max_downloads {
            config.queue.max_concurrent_downloads = max;
        }
        if self.no_auto_download {
            config.queue.auto_download = false;
        }
        Ok(config)
    }
}

/// Logs a line whenever the per-status counts change
#[derive(Default)]
struct LogView {
    last: Mutex<Option<[usize; 5]>>,
}

impl SnapshotConsumer for LogView {
    fn render(&self, snapshot: &QueueSnapshot) {
        let stats = &snapshot.stats;
        let counts = [
            stats.queued,
            stats.downloading,
            stats.paused,
            stats.finished,
            stats.failed,
        ];
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if last.replace(counts) == Some(counts) {
            return;
        }
        tracing::info!(
            queued = stats.queued,
            downloading = stats.downloading,
            paused = stats.paused,
            finished = stats.finished,
            failed = stats.failed,
            speed_bps = stats.speed_bps,
            "Queue"
        );
    }
}

/// Nothing is running, nothing will be started, and no automatic retry is pending
fn is_idle(snapshot: &QueueSnapshot) -> bool {
    let stats = &snapshot.stats;
    stats.active_transfers == 0
        && stats.pending_retries == 0
        && (stats.queued == 0 || !stats.auto_download)
}

async fn wait_until_idle(controller: &QueueController) {
    let mut snapshots = controller.watch_snapshots();
    while !is_idle(&snapshots.borrow_and_update()) {
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

async fn run(cli: Cli) -> podcast_dl::Result<()> {
    let config = cli.load_config()?;
    let controller = QueueController::new(config).await?;
    if let Some(e) = controller.startup_error() {
        tracing::warn!(error = %e, "Started with an empty queue");
    }
    let view = controller.attach_view(Arc::new(LogView::default()));

    if let Some(path) = &cli.import {
        let count = controller.import_legacy(path).await?;
        tracing::info!(count, path = %path.display(), "Imported legacy queue");
    }
    for url in &cli.urls {
        match controller.enqueue_url(url).await {
            Ok(id) => tracing::info!(item_id = id.0, url = %url, "Queued"),
            Err(e) => tracing::error!(url = %url, error = %e, code = e.code(), "Could not queue URL"),
        }
    }

    if cli.exit_when_idle {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = wait_until_idle(&controller) => tracing::info!("Queue idle"),
        }
    } else {
        shutdown_signal().await;
    }

    let result = controller.shutdown().await;
    view.abort();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("podcast_dl={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "podcast-dl failed");
            ExitCode::FAILURE
        }
    }
}
