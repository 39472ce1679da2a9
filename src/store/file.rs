//! Atomic queue file persistence.

use crate::error::PersistenceError;
use crate::types::{QueueItem, Status};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Current on-disk format version
const FORMAT_VERSION: u32 = 1;

#[derive(Deserialize)]
struct QueueDocument {
    version: u32,
    items: Vec<QueueItem>,
}

#[derive(Serialize)]
struct QueueDocumentRef<'a> {
    version: u32,
    items: Vec<&'a QueueItem>,
}

/// The persisted queue file
///
/// Records are stored in queue order. Saves go through a sibling temporary
/// file that is fsynced and renamed over the real one, so readers only ever
/// see the previous or the new complete document.
#[derive(Clone, Debug)]
pub struct QueueFile {
    path: PathBuf,
}

impl QueueFile {
    /// Queue file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the queue file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Load all items in queue order
    ///
    /// A missing file is an empty queue. Unreadable files, malformed or truncated
    /// documents, unknown format versions and duplicate ids are reported as errors.
    pub async fn load(&self) -> Result<Vec<QueueItem>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No queue file, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let document: QueueDocument =
            serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if document.version != FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                path: self.path.clone(),
                version: document.version,
            });
        }

        let mut seen = HashSet::with_capacity(document.items.len());
        for item in &document.items {
            if !seen.insert(item.id) {
                return Err(PersistenceError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("duplicate item id {}", item.id),
                });
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            count = document.items.len(),
            "Loaded queue file"
        );

        Ok(document.items)
    }

    /// Atomically replace the queue file with `items`, skipping deleted ones
    pub async fn save(&self, items: &[QueueItem]) -> Result<(), PersistenceError> {
        let document = QueueDocumentRef {
            version: FORMAT_VERSION,
            items: items
                .iter()
                .filter(|item| item.status != Status::Deleted)
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document).map_err(|e| PersistenceError::Write {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;

        let write_error = |source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
        }

        let tmp_path = self.sibling(".tmp");
        let mut tmp = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(write_error)?;
        tmp.write_all(&bytes).await.map_err(write_error)?;
        tmp.sync_all().await.map_err(write_error)?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(write_error)?;

        tracing::debug!(
            path = %self.path.display(),
            count = document.items.len(),
            "Saved queue file"
        );
        Ok(())
    }

    /// Move an unusable queue file aside so the next save does not destroy it
    ///
    /// Returns the new location of the file.
    pub async fn move_aside(&self) -> Result<PathBuf, PersistenceError> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let target = self.sibling(&format!(".corrupt-{stamp}"));
        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(|source| PersistenceError::Write {
                path: self.path.clone(),
                source,
            })?;
        Ok(target)
    }
}
