//! Queue commands: pause, resume, retry, cancel, delete and the bulk operations.

use super::scheduler::{Scheduler, StopReason};
use crate::error::{Error, Result};
use crate::types::{Command, CommandOutcome, QueueItemId, Status};
use std::collections::HashSet;

fn invalid(id: QueueItemId, operation: &'static str, current_state: Status) -> Error {
    Error::InvalidTransition {
        id,
        operation,
        current_state,
    }
}

impl Scheduler {
    /// Apply one command
    ///
    /// `terminated` holds the items whose transfer ended while pending worker
    /// messages were drained for this request. A pause or cancel that the
    /// ended transfer made invalid is answered with
    /// [`CommandOutcome::Superseded`] instead of an error.
    pub(crate) async fn dispatch(
        &mut self,
        command: Command,
        terminated: &HashSet<QueueItemId>,
    ) -> Result<CommandOutcome> {
        let result = match command {
            Command::Pause(id) => self.pause(id),
            Command::Resume(id) => self.resume(id),
            Command::Retry(id) => self.retry(id),
            Command::Cancel(id) => self.cancel(id).await,
            Command::Delete(id) => self.delete(id).await,
            Command::DeleteFinished => Ok(self.delete_finished()),
            Command::Purge => Ok(self.purge()),
            Command::PauseAll => Ok(self.pause_all()),
            Command::ResumeAll => Ok(self.resume_all()),
            Command::SetMaxConcurrent(limit) => self.set_max_concurrent(limit),
            Command::SetAutoDownload(enabled) => Ok(self.set_auto_download(enabled)),
        };

        match result {
            Err(Error::InvalidTransition {
                id, current_state, ..
            }) if matches!(command, Command::Pause(_) | Command::Cancel(_))
                && terminated.contains(&id) =>
            {
                tracing::warn!(
                    item_id = id.0,
                    command = command.name(),
                    status = %current_state,
                    "Transfer ended before the command was handled, its result stands"
                );
                Ok(CommandOutcome::Superseded {
                    status: current_state,
                })
            }
            Ok(outcome) => {
                tracing::debug!(command = command.name(), outcome = ?outcome, "Command handled");
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    fn status_of(&self, id: QueueItemId) -> Result<Status> {
        self.store
            .get(id)
            .map(|item| item.status)
            .ok_or(Error::NotFound(id))
    }

    /// Pause a queued or downloading item
    ///
    /// A running transfer is cancelled; its partial file stays on disk as the
    /// resume point.
    pub(crate) fn pause(&mut self, id: QueueItemId) -> Result<CommandOutcome> {
        match self.status_of(id)? {
            Status::Downloading => {
                self.stop_transfer(id, StopReason::Pause);
                self.set_status(id, Status::Paused);
                Ok(CommandOutcome::Applied)
            }
            Status::Queued => {
                self.set_status(id, Status::Paused);
                Ok(CommandOutcome::Applied)
            }
            Status::Paused => Ok(CommandOutcome::Unchanged),
            status => Err(invalid(id, "pause", status)),
        }
    }

    /// Put a paused item back in the queue
    pub(crate) fn resume(&mut self, id: QueueItemId) -> Result<CommandOutcome> {
        match self.status_of(id)? {
            Status::Paused => {
                self.set_status(id, Status::Queued);
                self.tick();
                Ok(CommandOutcome::Applied)
            }
            Status::Queued | Status::Downloading => Ok(CommandOutcome::Unchanged),
            status => Err(invalid(id, "resume", status)),
        }
    }

    /// Re-queue a failed item
    pub(crate) fn retry(&mut self, id: QueueItemId) -> Result<CommandOutcome> {
        match self.status_of(id)? {
            Status::Failed => {
                self.cancel_retry_timer(id);
                if let Some(item) = self.store.get_mut(id) {
                    item.attempt_count += 1;
                }
                self.set_status(id, Status::Queued);
                self.tick();
                Ok(CommandOutcome::Applied)
            }
            status => Err(invalid(id, "retry", status)),
        }
    }

    /// Throw away an item's progress and queue it again from zero
    pub(crate) async fn cancel(&mut self, id: QueueItemId) -> Result<CommandOutcome> {
        match self.status_of(id)? {
            Status::Downloading => {
                self.stop_transfer(id, StopReason::Cancel);
                self.set_status(id, Status::Queued);
                Ok(CommandOutcome::Applied)
            }
            Status::Queued | Status::Paused => {
                // A worker still winding down removes the file when it stops
                if !self.stop_transfer(id, StopReason::Cancel) {
                    self.discard_partial(id).await;
                }
                self.set_status(id, Status::Queued);
                self.tick();
                Ok(CommandOutcome::Applied)
            }
            status => Err(invalid(id, "cancel", status)),
        }
    }

    /// Mark an item deleted
    ///
    /// Partial files of unfinished items are removed, complete files are kept.
    /// The record leaves the table on the next successful persist.
    pub(crate) async fn delete(&mut self, id: QueueItemId) -> Result<CommandOutcome> {
        let status = self.status_of(id)?;
        if status == Status::Deleted {
            return Err(invalid(id, "delete", status));
        }

        self.cancel_retry_timer(id);
        if !self.stop_transfer(id, StopReason::Delete) && !status.is_complete() {
            self.discard_partial(id).await;
        }
        self.set_status(id, Status::Deleted);
        Ok(CommandOutcome::Applied)
    }

    /// Remove every finished or already-downloaded item
    pub(crate) fn delete_finished(&mut self) -> CommandOutcome {
        let removed = self.store.retain(|item| !item.status.is_complete());
        for item in &removed {
            self.emit(crate::types::Event::Removed { id: item.id });
        }
        if !removed.is_empty() {
            self.mark_dirty();
            tracing::info!(count = removed.len(), "Removed finished items");
        }
        CommandOutcome::Removed {
            count: removed.len(),
        }
    }

    /// Drop deleted items from the table right away
    pub(crate) fn purge(&mut self) -> CommandOutcome {
        let count = self.drop_deleted();
        if count > 0 {
            tracing::info!(count, "Purged deleted items");
        }
        CommandOutcome::Removed { count }
    }

    pub(crate) fn pause_all(&mut self) -> CommandOutcome {
        let ids: Vec<QueueItemId> = self
            .store
            .iter()
            .filter(|item| matches!(item.status, Status::Queued | Status::Downloading))
            .map(|item| item.id)
            .collect();
        for &id in &ids {
            if self.store.get(id).map(|item| item.status) == Some(Status::Downloading) {
                self.stop_transfer(id, StopReason::Pause);
            }
            self.set_status(id, Status::Paused);
        }
        if ids.is_empty() {
            CommandOutcome::Unchanged
        } else {
            tracing::info!(count = ids.len(), "Paused all items");
            CommandOutcome::Applied
        }
    }

    pub(crate) fn resume_all(&mut self) -> CommandOutcome {
        let ids = self.store.ids_with_status(Status::Paused);
        for &id in &ids {
            self.set_status(id, Status::Queued);
        }
        if ids.is_empty() {
            return CommandOutcome::Unchanged;
        }
        tracing::info!(count = ids.len(), "Resumed all items");
        self.tick();
        CommandOutcome::Applied
    }

    /// Change the concurrency limit
    ///
    /// Lowering it below the number of running transfers pushes the most
    /// recently admitted ones back to the queue with their partial bytes.
    pub(crate) fn set_max_concurrent(&mut self, limit: usize) -> Result<CommandOutcome> {
        if limit == 0 {
            return Err(Error::Config {
                message: "max_concurrent_downloads must be at least 1".to_string(),
                key: Some("max_concurrent_downloads".to_string()),
            });
        }
        if limit == self.max_concurrent {
            return Ok(CommandOutcome::Unchanged);
        }

        let previous = std::mem::replace(&mut self.max_concurrent, limit);
        tracing::info!(from = previous, to = limit, "Concurrency limit changed");

        if limit > previous {
            self.tick();
            return Ok(CommandOutcome::Applied);
        }

        let mut running: Vec<(u64, QueueItemId)> = self
            .active
            .iter()
            .filter(|(_, transfer)| transfer.stop.is_none())
            .map(|(id, transfer)| (transfer.admitted_seq, *id))
            .collect();
        running.sort_unstable();

        let excess = running.len().saturating_sub(limit);
        for (_, id) in running.into_iter().rev().take(excess) {
            tracing::debug!(item_id = id.0, "Re-queuing transfer over the new limit");
            self.stop_transfer(id, StopReason::Requeue);
            self.set_status(id, Status::Queued);
        }
        Ok(CommandOutcome::Applied)
    }

    pub(crate) fn set_auto_download(&mut self, enabled: bool) -> CommandOutcome {
        if self.auto_download == enabled {
            return CommandOutcome::Unchanged;
        }
        self.auto_download = enabled;
        tracing::info!(enabled, "Auto-download toggled");
        if enabled {
            self.tick();
        }
        CommandOutcome::Applied
    }
}
