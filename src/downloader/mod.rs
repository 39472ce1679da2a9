//! Download queue controller split into focused submodules.
//!
//! [`QueueController`] is a cheap, cloneable handle. All queue state lives in
//! a single control task that owns the item store and the running transfers:
//! - `scheduler`: control task, admission ticks, worker event handling
//! - `control`: pause/resume/retry/cancel/delete and bulk commands
//! - `queue`: enqueue and legacy import
//! - `lifecycle`: startup normalisation and graceful shutdown
//! - `worker`: one tokio task per running transfer
//! - [`view`]: snapshot push to a presentation layer

mod control;
mod lifecycle;
mod queue;
mod scheduler;
pub mod view;
pub(crate) mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::{Config, TransferConfig};
use crate::error::{Error, PersistenceError, Result};
use crate::fetch::HttpFetcher;
use crate::store::legacy;
use crate::types::{Command, CommandOutcome, Event, QueueItemId, QueueSnapshot};
use crate::utils;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use view::SnapshotConsumer;

/// Buffer size of the facade request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Request sent from a facade handle to the control task
pub(crate) enum Request {
    Enqueue {
        url: String,
        destination: PathBuf,
        reply: oneshot::Sender<Result<QueueItemId>>,
    },
    Import {
        entries: Vec<legacy::LegacyEntry>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Dispatch {
        command: Command,
        reply: oneshot::Sender<Result<CommandOutcome>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a running download queue (cloneable)
///
/// Every method talks to the control task; none of them touch queue state
/// directly. Once [`shutdown`](Self::shutdown) has completed, requests fail
/// with [`Error::ShuttingDown`].
#[derive(Clone)]
pub struct QueueController {
    request_tx: mpsc::Sender<Request>,
    event_tx: broadcast::Sender<Event>,
    snapshot_rx: watch::Receiver<QueueSnapshot>,
    config: Arc<Config>,
    startup_error: Option<Arc<PersistenceError>>,
}

impl QueueController {
    /// Start the controller with the HTTP fetcher
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use podcast_dl::*;
    /// # async fn example() -> Result<()> {
    /// let controller = QueueController::new(Config::default()).await?;
    /// let id = controller
    ///     .enqueue_url("https://cdn.example.com/show/episode-12.mp3")
    ///     .await?;
    /// controller.dispatch(Command::Pause(id)).await?;
    /// controller.shutdown().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: Config) -> Result<Self> {
        let fetcher = http_fetcher(&config.transfer)?;
        Self::start(config, fetcher).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Add an enclosure to the end of the queue
    ///
    /// Relative destinations are resolved against the download directory
    /// and `.`/`..` components are folded before the duplicate check.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `url` is not an http(s) URL
    /// - [`Error::Duplicate`] if a non-deleted item already targets the
    ///   destination, or a deleted one whose transfer is still stopping
    /// - [`Error::Io`] if the destination cannot be made absolute
    pub async fn enqueue(
        &self,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Result<QueueItemId> {
        let url = url.into();
        let destination = destination.into();
        self.request(|reply| Request::Enqueue {
            url,
            destination,
            reply,
        })
        .await
    }

    /// Add an enclosure, naming the file after the last segment of its URL
    pub async fn enqueue_url(&self, url: impl Into<String>) -> Result<QueueItemId> {
        let url = url.into();
        let name = utils::filename_from_url(&url).ok_or_else(|| Error::InvalidUrl {
            url: url.clone(),
            reason: "no file name in URL path".to_string(),
        })?;
        self.enqueue(url, PathBuf::from(name)).await
    }

    /// Apply a queue command
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the command names an unknown item
    /// - [`Error::InvalidTransition`] if the item's state rejects the command
    /// - [`Error::Config`] for a zero concurrency limit
    pub async fn dispatch(&self, command: Command) -> Result<CommandOutcome> {
        self.request(|reply| Request::Dispatch { command, reply })
            .await
    }

    /// Pause an item, keeping its partial file as the resume point
    pub async fn pause(&self, id: QueueItemId) -> Result<CommandOutcome> {
        self.dispatch(Command::Pause(id)).await
    }

    /// Resume a paused item
    pub async fn resume(&self, id: QueueItemId) -> Result<CommandOutcome> {
        self.dispatch(Command::Resume(id)).await
    }

    /// Re-queue a failed item
    pub async fn retry(&self, id: QueueItemId) -> Result<CommandOutcome> {
        self.dispatch(Command::Retry(id)).await
    }

    /// Discard an item's progress and queue it again
    pub async fn cancel(&self, id: QueueItemId) -> Result<CommandOutcome> {
        self.dispatch(Command::Cancel(id)).await
    }

    /// Delete an item
    pub async fn delete(&self, id: QueueItemId) -> Result<CommandOutcome> {
        self.dispatch(Command::Delete(id)).await
    }

    /// Import a newsboat-style queue file, returning how many items were added
    ///
    /// Malformed lines are logged and skipped.
    pub async fn import_legacy(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        let (entries, errors) = legacy::parse_queue(&contents);
        for error in &errors {
            tracing::warn!(
                path = %path.display(),
                line = error.line,
                reason = %error.reason,
                "Skipping malformed legacy queue line"
            );
        }
        self.request(|reply| Request::Import { entries, reply })
            .await
    }

    /// Latest published queue state
    ///
    /// The copy reflects every request that has already returned.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Receiver that is notified whenever a new snapshot is published
    pub fn watch_snapshots(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Push every new snapshot to `consumer` until the controller stops
    pub fn attach_view(&self, consumer: Arc<dyn SnapshotConsumer>) -> JoinHandle<()> {
        view::attach(consumer, self.watch_snapshots())
    }

    /// Why the persisted queue could not be loaded at startup, if it could not
    pub fn startup_error(&self) -> Option<&PersistenceError> {
        self.startup_error.as_deref()
    }

    /// The configuration the controller was started with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop all transfers and persist the final queue state
    ///
    /// Returns after the queue file has been written, with the write error if
    /// it failed. Only the first call does the work; later ones return
    /// [`Error::ShuttingDown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Request::Shutdown { reply }).await
    }
}

fn http_fetcher(config: &TransferConfig) -> Result<Arc<dyn crate::fetch::Fetcher>> {
    Ok(Arc::new(HttpFetcher::new(config)?))
}
