//! Shared test helpers: a scripted fetcher and controller setup.

use crate::config::Config;
use crate::downloader::QueueController;
use crate::error::TransferError;
use crate::fetch::{FetchRequest, Fetcher, ProgressEvent, ProgressSink};
use crate::types::{Event, QueueSnapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

/// Size of the chunks the scripted fetcher writes and reports
pub(crate) const CHUNK: u64 = 1024;

/// What the scripted fetcher does for one URL
#[derive(Clone)]
pub(crate) enum Script {
    /// Fill the file up to `bytes`, then wait for cancellation
    Hold { bytes: u64 },
    /// Fill the file up to `bytes` and complete
    Complete { bytes: u64 },
    /// Fill the file up to `held`, wait for `gate`, then fill up to `bytes` and complete
    Gate {
        held: u64,
        bytes: u64,
        gate: Arc<Notify>,
    },
    /// Fill the file up to `bytes`, then fail with a connection reset
    Fail { bytes: u64, message: &'static str },
    /// Fill the file up to `bytes`, wait for cancellation, then keep the
    /// destination open for `linger` before stopping
    SlowStop { bytes: u64, linger: Duration },
}

/// Fetcher that follows per-URL scripts and records every request
///
/// URLs without a script hold at zero bytes until cancelled.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<FetchRequest>>,
    writers: Mutex<HashMap<PathBuf, usize>>,
    max_writers: AtomicUsize,
}

/// Counts one fetch as a writer of its destination until dropped
struct WriterGuard<'a> {
    fetcher: &'a ScriptedFetcher,
    destination: PathBuf,
}

impl<'a> WriterGuard<'a> {
    fn enter(fetcher: &'a ScriptedFetcher, destination: &Path) -> Self {
        let mut writers = fetcher.writers.lock().unwrap();
        let count = writers.entry(destination.to_path_buf()).or_default();
        *count += 1;
        fetcher.max_writers.fetch_max(*count, Ordering::SeqCst);
        Self {
            fetcher,
            destination: destination.to_path_buf(),
        }
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        let mut writers = self.fetcher.writers.lock().unwrap();
        if let Some(count) = writers.get_mut(&self.destination) {
            *count -= 1;
            if *count == 0 {
                writers.remove(&self.destination);
            }
        }
    }
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    /// Every request received so far, in order
    pub(crate) fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of fetches that were writing one destination at the same time
    pub(crate) fn max_writers(&self) -> usize {
        self.max_writers.load(Ordering::SeqCst)
    }

    /// Requests received for one URL
    pub(crate) fn calls_for(&self, url: &str) -> Vec<FetchRequest> {
        self.calls()
            .into_iter()
            .filter(|request| request.url == url)
            .collect()
    }
}

async fn fill(
    request: &FetchRequest,
    from: u64,
    to: u64,
    progress: &ProgressSink,
) -> Result<(), TransferError> {
    if let Some(parent) = request.destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&request.destination)
        .await?;
    file.set_len(from).await?;
    file.seek(std::io::SeekFrom::End(0)).await?;

    let mut written = from;
    while written < to {
        let len = CHUNK.min(to - written);
        file.write_all(&vec![0xAB; len as usize]).await?;
        written += len;
        progress
            .report(ProgressEvent::Progress {
                bytes_downloaded: written,
                bytes_total: None,
            })
            .await;
    }
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: &ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        self.calls.lock().unwrap().push(request.clone());
        let _writer = WriterGuard::enter(self, &request.destination);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or(Script::Hold { bytes: 0 });

        let offset = request.resume_offset;
        progress
            .report(ProgressEvent::Started {
                resume_offset: offset,
                bytes_total: None,
            })
            .await;

        match script {
            Script::Hold { bytes } => {
                fill(&request, offset, bytes.max(offset), progress).await?;
                cancel.cancelled().await;
                Err(TransferError::Cancelled)
            }
            Script::Complete { bytes } => fill(&request, offset, bytes.max(offset), progress).await,
            Script::Gate { held, bytes, gate } => {
                fill(&request, offset, held.max(offset), progress).await?;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = gate.notified() => {}
                }
                fill(&request, held.max(offset), bytes.max(offset), progress).await
            }
            Script::Fail { bytes, message } => {
                fill(&request, offset, bytes.max(offset), progress).await?;
                Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    message,
                )))
            }
            Script::SlowStop { bytes, linger } => {
                fill(&request, offset, bytes.max(offset), progress).await?;
                cancel.cancelled().await;
                tokio::time::sleep(linger).await;
                Err(TransferError::Cancelled)
            }
        }
    }
}

/// Config rooted in `dir` with the given concurrency limit
pub(crate) fn test_config(dir: &Path, max_concurrent: usize) -> Config {
    let mut config = Config::default();
    config.queue.queue_file = dir.join("queue.json");
    config.queue.download_dir = dir.join("downloads");
    config.queue.max_concurrent_downloads = max_concurrent;
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Start a controller on a fresh temp dir with a scripted fetcher.
/// Returns the tempdir too, which must be kept alive.
pub(crate) async fn create_test_controller(
    max_concurrent: usize,
) -> (QueueController, Arc<ScriptedFetcher>, TempDir) {
    let temp_dir = tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    let controller =
        QueueController::start(test_config(temp_dir.path(), max_concurrent), fetcher.clone())
            .await
            .unwrap();
    (controller, fetcher, temp_dir)
}

/// Wait until a published snapshot satisfies `predicate`, failing after 5 seconds
pub(crate) async fn wait_for(
    controller: &QueueController,
    predicate: impl Fn(&QueueSnapshot) -> bool,
) -> QueueSnapshot {
    let mut snapshots = controller.watch_snapshots();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                if predicate(&snapshot) {
                    return snapshot.clone();
                }
            }
            snapshots.changed().await.unwrap();
        }
    })
    .await
    .expect("timed out waiting for queue state")
}

/// Wait for the next event matching `predicate`, failing after 5 seconds
pub(crate) async fn wait_for_event(
    events: &mut broadcast::Receiver<Event>,
    predicate: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Enclosure URL for test episode `n`
pub(crate) fn episode_url(n: usize) -> String {
    format!("http://podcasts.example.com/show/episode-{n}.mp3")
}
