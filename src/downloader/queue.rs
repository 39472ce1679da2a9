//! Adding items: single enqueue and legacy queue import.

use super::scheduler::Scheduler;
use crate::error::{Error, Result};
use crate::store::legacy::LegacyEntry;
use crate::types::{Event, QueueItem, QueueItemId, Status};
use crate::utils;
use std::path::{Path, PathBuf};

impl Scheduler {
    /// Add one enclosure to the end of the queue
    ///
    /// A destination that already holds a file is recorded as
    /// [`Status::AlreadyDownloaded`] and never fetched.
    pub(crate) async fn enqueue(
        &mut self,
        url: String,
        destination: PathBuf,
    ) -> Result<QueueItemId> {
        utils::validate_url(&url)?;
        let destination =
            utils::resolve_destination(&self.config.queue.download_dir, &destination)?;
        if self.destination_taken(&destination) {
            return Err(Error::Duplicate { path: destination });
        }

        let id = self.store.next_id();
        let mut item = QueueItem::new(id, url, destination);
        if let Some(len) = existing_file_len(&item).await {
            item.status = Status::AlreadyDownloaded;
            item.bytes_downloaded = len;
            item.bytes_total = Some(len);
        }

        tracing::info!(
            item_id = id.0,
            url = %item.source_url,
            destination = %item.destination.display(),
            status = %item.status,
            "Item added to queue"
        );
        self.emit(Event::Queued {
            id,
            url: item.source_url.clone(),
        });
        self.store.upsert(item);
        self.mark_dirty();
        self.tick();
        Ok(id)
    }

    /// Add entries read from a legacy queue file, returning how many were added
    ///
    /// Invalid URLs, unresolvable destinations and destinations that are
    /// already queued are skipped.
    pub(crate) async fn import(&mut self, entries: Vec<LegacyEntry>) -> Result<usize> {
        let mut imported = 0;

        for entry in entries {
            if let Err(e) = utils::validate_url(&entry.url) {
                tracing::warn!(line = entry.line, error = %e, "Skipping legacy entry");
                continue;
            }
            let destination = match utils::resolve_destination(
                &self.config.queue.download_dir,
                &entry.destination,
            ) {
                Ok(destination) => destination,
                Err(e) => {
                    tracing::warn!(line = entry.line, error = %e, "Skipping legacy entry");
                    continue;
                }
            };
            if self.destination_taken(&destination) {
                tracing::debug!(
                    line = entry.line,
                    destination = %destination.display(),
                    "Skipping legacy entry, destination already queued"
                );
                continue;
            }

            let id = self.store.next_id();
            let mut item = QueueItem::new(id, entry.url, destination);
            let existing = existing_file_len(&item).await;
            match (entry.status, existing) {
                (Some(status), len) => {
                    item.status = status;
                    item.bytes_downloaded = len.unwrap_or(0);
                    item.bytes_total = len;
                }
                (None, Some(len)) => {
                    item.status = Status::AlreadyDownloaded;
                    item.bytes_downloaded = len;
                    item.bytes_total = Some(len);
                }
                (None, None) => {}
            }

            self.emit(Event::Queued {
                id,
                url: item.source_url.clone(),
            });
            self.store.upsert(item);
            imported += 1;
        }

        if imported > 0 {
            tracing::info!(count = imported, "Imported legacy queue entries");
            self.mark_dirty();
            self.tick();
        }
        Ok(imported)
    }

    /// Whether a new item may not target `destination`
    ///
    /// A deleted item still holds its destination while its worker winds
    /// down, since that worker may write to the file until it stops.
    fn destination_taken(&self, destination: &Path) -> bool {
        self.store.items_at(destination).any(|item| {
            item.status != Status::Deleted || self.active.contains_key(&item.id)
        })
    }
}

async fn existing_file_len(item: &QueueItem) -> Option<u64> {
    match tokio::fs::metadata(&item.destination).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}
