//! Core types for podcast-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a queue item
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(pub u64);

impl QueueItemId {
    /// Create a new QueueItemId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for QueueItemId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<QueueItemId> for u64 {
    fn from(id: QueueItemId) -> Self {
        id.0
    }
}

impl std::fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for QueueItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Queue item status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a free transfer slot
    Queued,
    /// A transfer worker is bound to the item
    Downloading,
    /// Stopped by the user, resumable from the partial file
    Paused,
    /// Transfer completed
    Finished,
    /// Transfer failed, waiting for an explicit retry
    Failed,
    /// Marked for removal, excluded from scheduling and persistence
    Deleted,
    /// Destination already held the file when the item was added
    AlreadyDownloaded,
}

impl Status {
    /// Lowercase name used in logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::Paused => "paused",
            Status::Finished => "finished",
            Status::Failed => "failed",
            Status::Deleted => "deleted",
            Status::AlreadyDownloaded => "already_downloaded",
        }
    }

    /// Whether the item's file is complete on disk
    pub fn is_complete(&self) -> bool {
        matches!(self, Status::Finished | Status::AlreadyDownloaded)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One enclosure tracked by the queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Stable identifier assigned at enqueue time
    pub id: QueueItemId,
    /// Enclosure URL
    pub source_url: String,
    /// Absolute destination file path
    pub destination: PathBuf,
    /// Current status
    pub status: Status,
    /// Bytes present in the destination file (resume point when not downloading)
    pub bytes_downloaded: u64,
    /// Total size, once a transfer has reported it
    pub bytes_total: Option<u64>,
    /// Number of explicit or automatic retries
    pub attempt_count: u32,
    /// Failure reason, only set while the item is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the item was added to the queue
    pub added_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a freshly queued item
    pub fn new(id: QueueItemId, source_url: impl Into<String>, destination: PathBuf) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            destination,
            status: Status::Queued,
            bytes_downloaded: 0,
            bytes_total: None,
            attempt_count: 0,
            last_error: None,
            added_at: Utc::now(),
        }
    }

    /// Progress percentage, if the total size is known
    pub fn percent(&self) -> Option<f32> {
        match self.bytes_total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_downloaded as f64 / total as f64 * 100.0) as f32),
            None => None,
        }
    }
}

/// Read-only view of a queue item handed to the presentation layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemView {
    /// Item identifier
    pub id: QueueItemId,
    /// Enclosure URL
    pub source_url: String,
    /// Destination file path
    pub destination: PathBuf,
    /// Current status
    pub status: Status,
    /// Bytes downloaded so far
    pub bytes_downloaded: u64,
    /// Total size if known
    pub bytes_total: Option<u64>,
    /// Progress percentage if the total is known
    pub percent: Option<f32>,
    /// Current transfer speed (0 when not downloading)
    pub speed_bps: u64,
    /// Number of retries
    pub attempt_count: u32,
    /// Failure reason
    pub last_error: Option<String>,
}

/// Aggregate queue statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items in the queue, excluding deleted ones
    pub total: usize,
    /// Items waiting for a slot
    pub queued: usize,
    /// Items with a bound worker
    pub downloading: usize,
    /// Paused items
    pub paused: usize,
    /// Finished or already-downloaded items
    pub finished: usize,
    /// Failed items
    pub failed: usize,
    /// Live transfer workers, including ones still winding down after a stop
    pub active_transfers: usize,
    /// Current concurrency limit
    pub max_concurrent_downloads: usize,
    /// Whether queued items are started automatically
    pub auto_download: bool,
    /// Sum of bytes downloaded over all listed items
    pub bytes_downloaded: u64,
    /// Combined speed of all running transfers
    pub speed_bps: u64,
    /// Failed items waiting on an automatic retry timer
    #[serde(default)]
    pub pending_retries: usize,
}

/// Consistent point-in-time copy of the whole queue
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Items in queue order (deleted items that are still stored are included)
    pub items: Vec<ItemView>,
    /// Aggregates over `items`
    pub stats: QueueStats,
}

impl QueueSnapshot {
    /// Find the view of one item
    pub fn item(&self, id: QueueItemId) -> Option<&ItemView> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Number of items in the given status
    pub fn count(&self, status: Status) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }
}

/// Commands accepted by [`crate::QueueController::dispatch`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arg", rename_all = "snake_case")]
pub enum Command {
    /// Stop a transfer (or hold a queued item), keeping partial bytes
    Pause(QueueItemId),
    /// Re-queue a paused item
    Resume(QueueItemId),
    /// Re-queue a failed item
    Retry(QueueItemId),
    /// Stop a transfer and discard its partial bytes; the item is re-queued from zero
    Cancel(QueueItemId),
    /// Stop any transfer and mark the item deleted
    Delete(QueueItemId),
    /// Remove all finished and already-downloaded items
    DeleteFinished,
    /// Remove deleted items from the queue table immediately
    Purge,
    /// Pause every queued or downloading item
    PauseAll,
    /// Resume every paused item
    ResumeAll,
    /// Change the concurrency limit (must be at least 1)
    SetMaxConcurrent(usize),
    /// Enable or disable automatic admission of queued items
    SetAutoDownload(bool),
}

impl Command {
    /// Short operation name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::Pause(_) => "pause",
            Command::Resume(_) => "resume",
            Command::Retry(_) => "retry",
            Command::Cancel(_) => "cancel",
            Command::Delete(_) => "delete",
            Command::DeleteFinished => "delete_finished",
            Command::Purge => "purge",
            Command::PauseAll => "pause_all",
            Command::ResumeAll => "resume_all",
            Command::SetMaxConcurrent(_) => "set_max_concurrent",
            Command::SetAutoDownload(_) => "set_auto_download",
        }
    }

    /// The item a single-item command targets
    pub fn target(&self) -> Option<QueueItemId> {
        match self {
            Command::Pause(id)
            | Command::Resume(id)
            | Command::Retry(id)
            | Command::Cancel(id)
            | Command::Delete(id) => Some(*id),
            _ => None,
        }
    }
}

/// Successful result of a dispatched command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The command changed the queue
    Applied,
    /// The item was already in the requested state
    Unchanged,
    /// The item's transfer ended before the command was handled; the
    /// transfer's result stands and the command was not applied
    Superseded {
        /// Status the transfer's terminal event left the item in
        status: Status,
    },
    /// A bulk removal command removed this many items
    Removed {
        /// Number of removed items
        count: usize,
    },
}

/// Event emitted by the queue controller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Item added to the queue
    Queued {
        /// Item ID
        id: QueueItemId,
        /// Enclosure URL
        url: String,
    },

    /// A transfer worker started for the item
    Started {
        /// Item ID
        id: QueueItemId,
        /// Byte offset the transfer resumed from
        resume_offset: u64,
    },

    /// Transfer progress
    Progress {
        /// Item ID
        id: QueueItemId,
        /// Bytes downloaded so far
        bytes_downloaded: u64,
        /// Total size if known
        bytes_total: Option<u64>,
    },

    /// Item status changed
    StatusChanged {
        /// Item ID
        id: QueueItemId,
        /// Previous status
        from: Status,
        /// New status
        to: Status,
    },

    /// Transfer failed
    Failed {
        /// Item ID
        id: QueueItemId,
        /// Failure reason
        error: String,
    },

    /// Item removed from the queue table
    Removed {
        /// Item ID
        id: QueueItemId,
    },

    /// Writing the queue file failed; the in-memory queue is still intact
    PersistenceFailed {
        /// Error message
        error: String,
    },

    /// Controller shut down
    Shutdown,
}
