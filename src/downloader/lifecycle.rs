//! Startup and shutdown coordination.

use super::scheduler::{Scheduler, StopReason};
use super::{QueueController, REQUEST_CHANNEL_CAPACITY};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::store::{ItemStore, QueueFile};
use crate::types::{Event, QueueItemId, QueueSnapshot, Status};
use crate::utils;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Buffer size of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

impl QueueController {
    /// Start the controller with a custom fetcher
    ///
    /// Loads the persisted queue, re-queues items that were downloading when
    /// the previous run stopped, spawns the control task and admits the first
    /// items. An unusable queue file is moved aside and the controller starts
    /// empty; the problem is reported by [`QueueController::startup_error`].
    pub async fn start(config: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let queue_file = config.queue.queue_file.clone();

        let (store, startup_error) = match ItemStore::open(&queue_file).await {
            Ok(store) => (store, None),
            Err(Error::Persistence(e)) => {
                tracing::error!(error = %e, "Queue file unusable, starting with an empty queue");
                match QueueFile::new(&queue_file).move_aside().await {
                    Ok(moved_to) => tracing::warn!(
                        moved_to = %moved_to.display(),
                        "Moved unusable queue file aside"
                    ),
                    Err(move_err) => tracing::error!(
                        error = %move_err,
                        "Could not move unusable queue file aside"
                    ),
                }
                (ItemStore::empty(&queue_file), Some(Arc::new(e)))
            }
            Err(e) => return Err(e),
        };

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(QueueSnapshot::default());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let mut scheduler =
            Scheduler::new(store, config.clone(), fetcher, event_tx.clone(), snapshot_tx);
        scheduler.restore().await;
        scheduler.tick();
        scheduler.commit().await;

        tokio::spawn(scheduler.run(request_rx));
        tracing::info!(queue_file = %queue_file.display(), "Queue controller started");

        Ok(Self {
            request_tx,
            event_tx,
            snapshot_rx,
            config,
            startup_error,
        })
    }
}

impl Scheduler {
    /// Normalise items loaded from disk
    ///
    /// No worker survives a restart, so `Downloading` items go back to the
    /// queue. Resumable items get their byte count from the partial file.
    pub(crate) async fn restore(&mut self) {
        let ids: Vec<(QueueItemId, Status)> =
            self.store.iter().map(|item| (item.id, item.status)).collect();

        let mut requeued = 0;
        for (id, status) in ids {
            match status {
                Status::Downloading => {
                    tracing::info!(item_id = id.0, "Re-queuing interrupted transfer");
                    self.set_status(id, Status::Queued);
                    self.reconcile_bytes(id).await;
                    requeued += 1;
                }
                Status::Queued | Status::Paused | Status::Failed => {
                    self.reconcile_bytes(id).await;
                }
                Status::Finished | Status::AlreadyDownloaded | Status::Deleted => {}
            }
        }

        tracing::info!(
            items = self.store.len(),
            requeued,
            "Restored queue from disk"
        );
    }

    /// Stop every transfer and write the final state
    ///
    /// Transfers get `Config.shutdown_timeout` to report their terminal
    /// event; stragglers are aborted. The error of the final write is
    /// returned.
    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        tracing::info!(active = self.active.len(), "Initiating graceful shutdown");
        self.shutting_down = true;
        self.cancel_all_retry_timers();

        let ids: Vec<QueueItemId> = self.active.keys().copied().collect();
        for id in ids {
            let running = self
                .active
                .get(&id)
                .is_some_and(|transfer| transfer.stop.is_none());
            self.stop_transfer(id, StopReason::Shutdown);
            if running {
                self.set_status(id, Status::Queued);
            }
        }

        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.wait_for_transfers())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.active.len(),
                "Timeout waiting for transfers to stop, aborting them"
            );
            let stragglers: Vec<QueueItemId> = self.active.keys().copied().collect();
            for id in stragglers {
                if let Some(transfer) = self.active.remove(&id) {
                    transfer.handle.abort();
                }
                self.reconcile_bytes(id).await;
            }
        } else {
            tracing::info!("All transfers stopped");
        }

        let result = self.store.persist().await;
        match &result {
            Ok(()) => tracing::info!("Final queue state persisted"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist final queue state");
                self.emit(Event::PersistenceFailed {
                    error: e.to_string(),
                });
            }
        }

        self.publish_snapshot();
        self.emit(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        result
    }

    async fn wait_for_transfers(&mut self) {
        while !self.active.is_empty() {
            let Some(message) = self.worker_rx.recv().await else {
                break;
            };
            self.handle_worker_message(message).await;
        }
    }
}
