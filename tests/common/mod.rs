//! Common helpers for podcast-dl integration tests

#![allow(dead_code)]

use podcast_dl::{Config, QueueController, QueueItemId, QueueSnapshot, Status};
use std::path::Path;
use std::time::Duration;

/// How an item ended up when waiting for it to settle
#[derive(Debug, PartialEq)]
pub enum WaitResult {
    /// Transfer finished
    Finished,
    /// Transfer failed with this error
    Failed(Option<String>),
    /// Timeout waiting for a terminal status
    Timeout,
}

/// Config with the queue file and downloads inside `dir`
pub fn test_config(dir: &Path, max_concurrent: usize) -> Config {
    let mut config = Config::default();
    config.queue.queue_file = dir.join("queue.json");
    config.queue.download_dir = dir.join("downloads");
    config.queue.max_concurrent_downloads = max_concurrent;
    config.transfer.stall_timeout = Duration::from_secs(5);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Wait until the item is `Finished` or `Failed`
pub async fn wait_for_terminal(
    controller: &QueueController,
    id: QueueItemId,
    timeout: Duration,
) -> WaitResult {
    let mut snapshots = controller.watch_snapshots();
    let result = tokio::time::timeout(timeout, async {
        loop {
            if let Some(item) = snapshots.borrow_and_update().item(id) {
                match item.status {
                    Status::Finished => return WaitResult::Finished,
                    Status::Failed => return WaitResult::Failed(item.last_error.clone()),
                    _ => {}
                }
            }
            if snapshots.changed().await.is_err() {
                return WaitResult::Timeout;
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}

/// Wait until a snapshot satisfies `predicate`
pub async fn wait_for_snapshot(
    controller: &QueueController,
    timeout: Duration,
    predicate: impl Fn(&QueueSnapshot) -> bool,
) -> Option<QueueSnapshot> {
    let mut snapshots = controller.watch_snapshots();
    tokio::time::timeout(timeout, async {
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                if predicate(&snapshot) {
                    return Some(snapshot.clone());
                }
            }
            if snapshots.changed().await.is_err() {
                return None;
            }
        }
    })
    .await
    .ok()
    .flatten()
}
