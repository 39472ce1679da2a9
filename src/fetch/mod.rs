//! Fetch capability used by transfer workers
//!
//! A [`Fetcher`] downloads one enclosure into its destination file, resuming
//! from a byte offset when asked to. It reports progress through a
//! [`ProgressSink`] and stops promptly when its cancellation token fires.
//! [`HttpFetcher`] is the production implementation; tests plug in scripted
//! fetchers through the same trait.

use crate::downloader::worker::{WorkerEvent, WorkerMessage};
use crate::error::TransferError;
use crate::types::QueueItemId;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod http;

pub use http::HttpFetcher;

/// One transfer handed to a [`Fetcher`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Item being downloaded
    pub id: QueueItemId,
    /// Enclosure URL
    pub url: String,
    /// File the body is written to
    pub destination: PathBuf,
    /// Length of the partial file already on disk
    pub resume_offset: u64,
}

/// Progress reported by a running fetch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The fetch is receiving data starting at `resume_offset`
    ///
    /// The offset may be lower than the requested one when the remote did
    /// not honour the range request and the transfer restarted from zero.
    Started {
        /// Offset the body is appended at
        resume_offset: u64,
        /// Full size of the enclosure, if the server reported it
        bytes_total: Option<u64>,
    },
    /// Bytes now present in the destination file
    Progress {
        /// Bytes downloaded so far, resume offset included
        bytes_downloaded: u64,
        /// Full size of the enclosure, if known
        bytes_total: Option<u64>,
    },
}

/// Channel end a fetcher reports progress into
///
/// Reports from one sink arrive at the scheduler in the order they were made.
pub struct ProgressSink {
    id: QueueItemId,
    tx: mpsc::Sender<WorkerMessage>,
}

impl ProgressSink {
    pub(crate) fn new(id: QueueItemId, tx: mpsc::Sender<WorkerMessage>) -> Self {
        Self { id, tx }
    }

    /// Sink paired with a receiver, for driving a fetcher in isolation
    #[cfg(test)]
    pub(crate) fn channel(
        id: QueueItemId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<WorkerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(id, tx), rx)
    }

    /// Item the sink reports for
    pub fn id(&self) -> QueueItemId {
        self.id
    }

    /// Report progress to the scheduler
    ///
    /// Waits while the worker event channel is full. Reports made after the
    /// controller has shut down are dropped.
    pub async fn report(&self, event: ProgressEvent) {
        let message = WorkerMessage {
            id: self.id,
            event: WorkerEvent::Progress(event),
        };
        if self.tx.send(message).await.is_err() {
            tracing::debug!(item_id = self.id.0, "Progress dropped, controller is gone");
        }
    }
}

/// Fetch capability for one enclosure
///
/// Implementations must honour `cancel` by returning
/// [`TransferError::Cancelled`] soon after it fires, leaving every reported
/// byte on disk. They must never retry on their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `request.url` into `request.destination`
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: &ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), TransferError>;
}
