//! Queue storage for podcast-dl
//!
//! Holds the ordered table of queue items in memory and mirrors it to a JSON
//! queue file on disk. The store has no locking of its own: the scheduler's
//! control task is its only user.
//!
//! ## Submodules
//!
//! - `file`: atomic queue file load/save
//! - [`legacy`]: import of newsboat-style plain-text queue files

use crate::error::Result;
use crate::types::{QueueItem, QueueItemId, Status};
use std::path::Path;

mod file;
pub mod legacy;

pub use file::QueueFile;

/// In-memory queue table with a durable on-disk mirror
pub struct ItemStore {
    items: Vec<QueueItem>,
    file: QueueFile,
    next_id: u64,
}

impl ItemStore {
    /// Open the store, loading any persisted items
    ///
    /// A missing queue file yields an empty store; an unreadable or corrupt one
    /// is an error and leaves the file untouched.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = QueueFile::new(path.as_ref());
        let items = file.load().await?;
        Ok(Self::with_items(file, items))
    }

    /// Create an empty store backed by `path` without reading it
    pub fn empty(path: impl AsRef<Path>) -> Self {
        Self::with_items(QueueFile::new(path.as_ref()), Vec::new())
    }

    fn with_items(file: QueueFile, items: Vec<QueueItem>) -> Self {
        let next_id = items.iter().map(|item| item.id.0).max().map_or(1, |max| max + 1);
        Self {
            items,
            file,
            next_id,
        }
    }

    /// Allocate the next unused item id
    pub fn next_id(&mut self) -> QueueItemId {
        let id = QueueItemId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Insert a new item at the end of the queue, or replace the item with the same id in place
    pub fn upsert(&mut self, item: QueueItem) {
        if item.id.0 >= self.next_id {
            self.next_id = item.id.0 + 1;
        }
        match self.items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    /// Remove an item from the table, returning it
    pub fn remove(&mut self, id: QueueItemId) -> Option<QueueItem> {
        let index = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(index))
    }

    /// Look up an item
    pub fn get(&self, id: QueueItemId) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: QueueItemId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// Items targeting `destination`, deleted ones included
    pub fn items_at<'a>(
        &'a self,
        destination: &'a Path,
    ) -> impl Iterator<Item = &'a QueueItem> + 'a {
        self.items
            .iter()
            .filter(move |item| item.destination == destination)
    }

    /// Items in queue order
    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    /// Ids of items in the given status, in queue order
    pub fn ids_with_status(&self, status: Status) -> Vec<QueueItemId> {
        self.items
            .iter()
            .filter(|item| item.status == status)
            .map(|item| item.id)
            .collect()
    }

    /// Keep only the items matching `keep`; returns the removed items in queue order
    pub fn retain(&mut self, mut keep: impl FnMut(&QueueItem) -> bool) -> Vec<QueueItem> {
        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| keep(item));
        self.items = kept;
        removed
    }

    /// Number of items in the table, deleted ones included
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Write the current table to the queue file
    pub async fn persist(&self) -> Result<()> {
        self.file.save(&self.items).await?;
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
