//! # podcast-dl
//!
//! Persistent download queue for podcast enclosures.
//!
//! Items are added with a source URL and a destination file, survive restarts
//! through an atomically written queue file, and are transferred over HTTP by
//! at most `max_concurrent_downloads` workers at a time. Interrupted transfers
//! resume from their partial file with a `Range` request.
//!
//! All queue state is owned by one control task. [`QueueController`] handles
//! send it requests, and front ends observe the queue through
//! [`QueueSnapshot`]s and [`Event`]s.
//!
//! ## Quick Start
//!
//! ```no_run
//! use podcast_dl::{Command, Config, QueueController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.queue.max_concurrent_downloads = 2;
//!
//!     let controller = QueueController::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = controller.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let id = controller
//!         .enqueue_url("https://cdn.example.com/show/episode-12.mp3")
//!         .await?;
//!     controller.dispatch(Command::Pause(id)).await?;
//!
//!     controller.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Queue controller: scheduler, commands and transfer workers
pub mod downloader;
/// Error types
pub mod error;
/// Enclosure transfers
pub mod fetch;
/// Retry logic with exponential backoff
pub mod retry;
/// Queue table and its on-disk file
pub mod store;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, QueueConfig, RetryConfig, RetryPolicy, TransferConfig};
pub use downloader::QueueController;
pub use downloader::view::SnapshotConsumer;
pub use error::{Error, PersistenceError, Result, TransferError};
pub use fetch::{FetchRequest, Fetcher, HttpFetcher, ProgressEvent, ProgressSink};
pub use types::{
    Command, CommandOutcome, Event, ItemView, QueueItem, QueueItemId, QueueSnapshot, QueueStats,
    Status,
};

/// Run the controller until a termination signal arrives, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use podcast_dl::{Config, QueueController, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let controller = QueueController::new(Config::default()).await?;
///
///     // Transfers run until SIGTERM/SIGINT
///     run_with_shutdown(controller).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(controller: QueueController) -> Result<()> {
    shutdown_signal().await;
    controller.shutdown().await
}

/// Wait for a termination signal
///
/// SIGTERM or SIGINT on Unix, Ctrl+C elsewhere.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

/// Wait for a termination signal
///
/// SIGTERM or SIGINT on Unix, Ctrl+C elsewhere.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
