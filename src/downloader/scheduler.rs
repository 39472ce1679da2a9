//! The control task: single owner of the item store and the running transfers.
//!
//! Every queue mutation happens here, one message at a time. Facade requests
//! arrive over an mpsc channel with a oneshot reply; workers report over a
//! second, bounded mpsc channel. Before a request is handled all pending
//! worker messages are applied, so a transfer that already ended wins over a
//! command that raced with it.

use super::Request;
use super::worker::{TerminalEvent, TransferWorker, WorkerEvent, WorkerMessage};
use crate::config::Config;
use crate::fetch::{Fetcher, ProgressEvent};
use crate::retry::automatic_retry_delay;
use crate::store::ItemStore;
use crate::types::{Event, ItemView, QueueItemId, QueueSnapshot, QueueStats, Status};
use crate::utils;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Capacity of the worker event channel
pub(crate) const WORKER_CHANNEL_CAPACITY: usize = 512;

/// Why a running transfer was told to stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// Paused by the user, partial bytes kept
    Pause,
    /// Pushed back to the queue by a lower concurrency limit, partial bytes kept
    Requeue,
    /// Cancelled by the user, partial bytes discarded
    Cancel,
    /// Deleted by the user, partial bytes discarded
    Delete,
    /// Controller shutting down, partial bytes kept
    Shutdown,
}

impl StopReason {
    fn discards_partial(self) -> bool {
        matches!(self, StopReason::Cancel | StopReason::Delete)
    }

    /// Combine with an already pending stop; discarding stops win
    fn merge(pending: Option<StopReason>, new: StopReason) -> StopReason {
        match (pending, new) {
            (Some(StopReason::Delete), _) => StopReason::Delete,
            (Some(StopReason::Cancel), new) if new != StopReason::Delete => StopReason::Cancel,
            (_, new) => new,
        }
    }
}

/// A worker bound to an item, from admission until its terminal event
pub(crate) struct ActiveTransfer {
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
    pub(crate) started_at: Instant,
    pub(crate) start_offset: u64,
    pub(crate) stop: Option<StopReason>,
    pub(crate) admitted_seq: u64,
}

pub(crate) struct Scheduler {
    pub(crate) store: ItemStore,
    pub(crate) config: Arc<Config>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) active: HashMap<QueueItemId, ActiveTransfer>,
    pub(crate) max_concurrent: usize,
    pub(crate) auto_download: bool,
    pub(crate) shutting_down: bool,
    admitted_seq: u64,
    dirty: bool,
    event_tx: broadcast::Sender<Event>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
    pub(crate) worker_tx: mpsc::Sender<WorkerMessage>,
    pub(crate) worker_rx: mpsc::Receiver<WorkerMessage>,
    retry_tx: mpsc::UnboundedSender<QueueItemId>,
    retry_rx: mpsc::UnboundedReceiver<QueueItemId>,
    retry_timers: HashMap<QueueItemId, AbortHandle>,
}

impl Scheduler {
    pub(crate) fn new(
        store: ItemStore,
        config: Arc<Config>,
        fetcher: Arc<dyn Fetcher>,
        event_tx: broadcast::Sender<Event>,
        snapshot_tx: watch::Sender<QueueSnapshot>,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            store,
            max_concurrent: config.queue.max_concurrent_downloads,
            auto_download: config.queue.auto_download,
            config,
            fetcher,
            active: HashMap::new(),
            shutting_down: false,
            admitted_seq: 0,
            dirty: false,
            event_tx,
            snapshot_tx,
            worker_tx,
            worker_rx,
            retry_tx,
            retry_rx,
            retry_timers: HashMap::new(),
        }
    }

    /// Main loop of the control task
    ///
    /// Ends after a shutdown request, or when every controller handle is gone.
    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        loop {
            tokio::select! {
                Some(message) = self.worker_rx.recv() => {
                    self.handle_worker_message(message).await;
                    self.commit().await;
                }
                Some(id) = self.retry_rx.recv() => {
                    self.handle_automatic_retry(id);
                    self.commit().await;
                }
                request = requests.recv() => match request {
                    Some(request) => {
                        if self.handle_request(request).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        tracing::info!("All controller handles dropped, shutting down");
                        if let Err(e) = self.shutdown().await {
                            tracing::error!(error = %e, "Shutdown after last handle dropped failed");
                        }
                        break;
                    }
                },
            }
        }
        tracing::debug!("Control task stopped");
    }

    async fn handle_request(&mut self, request: Request) -> ControlFlow<()> {
        let terminated = self.drain_worker_messages().await;

        match request {
            Request::Enqueue {
                url,
                destination,
                reply,
            } => {
                let result = self.enqueue(url, destination).await;
                self.commit().await;
                let _ = reply.send(result);
            }
            Request::Import { entries, reply } => {
                let result = self.import(entries).await;
                self.commit().await;
                let _ = reply.send(result);
            }
            Request::Dispatch { command, reply } => {
                let result = self.dispatch(command, &terminated).await;
                self.commit().await;
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                let result = self.shutdown().await;
                let _ = reply.send(result);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Apply every worker message already waiting in the channel
    ///
    /// Returns the items whose transfer ended during the drain.
    pub(crate) async fn drain_worker_messages(&mut self) -> HashSet<QueueItemId> {
        let mut terminated = HashSet::new();
        while let Ok(message) = self.worker_rx.try_recv() {
            if matches!(message.event, WorkerEvent::Terminal(_)) {
                terminated.insert(message.id);
            }
            self.handle_worker_message(message).await;
        }
        terminated
    }

    pub(crate) async fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message.event {
            WorkerEvent::Progress(event) => self.handle_progress(message.id, event),
            WorkerEvent::Terminal(event) => self.handle_terminal(message.id, event).await,
        }
    }

    fn handle_progress(&mut self, id: QueueItemId, event: ProgressEvent) {
        let Some(transfer) = self.active.get_mut(&id) else {
            tracing::debug!(item_id = id.0, "Progress from unknown transfer ignored");
            return;
        };
        let Some(item) = self.store.get_mut(id) else {
            return;
        };

        match event {
            ProgressEvent::Started {
                resume_offset,
                bytes_total,
            } => {
                item.bytes_downloaded = resume_offset;
                if bytes_total.is_some() {
                    item.bytes_total = bytes_total;
                }
                transfer.start_offset = resume_offset;
                transfer.started_at = Instant::now();
                tracing::debug!(item_id = id.0, resume_offset, "Transfer receiving data");
                self.emit(Event::Started { id, resume_offset });
            }
            ProgressEvent::Progress {
                bytes_downloaded,
                bytes_total,
            } => {
                if bytes_downloaded < item.bytes_downloaded {
                    tracing::debug!(
                        item_id = id.0,
                        reported = bytes_downloaded,
                        current = item.bytes_downloaded,
                        "Ignoring stale progress"
                    );
                    return;
                }
                item.bytes_downloaded = bytes_downloaded;
                if bytes_total.is_some() {
                    item.bytes_total = bytes_total;
                }
                let bytes_total = item.bytes_total;
                self.emit(Event::Progress {
                    id,
                    bytes_downloaded,
                    bytes_total,
                });
            }
        }
    }

    async fn handle_terminal(&mut self, id: QueueItemId, event: TerminalEvent) {
        let Some(transfer) = self.active.remove(&id) else {
            tracing::warn!(item_id = id.0, "Terminal event from unknown transfer ignored");
            return;
        };

        match (transfer.stop, event) {
            (None, TerminalEvent::Completed) => self.finish(id),
            (Some(StopReason::Delete), TerminalEvent::Completed) => {
                tracing::warn!(
                    item_id = id.0,
                    "Transfer completed before delete took effect, keeping the file"
                );
            }
            (Some(stop), TerminalEvent::Completed) => {
                tracing::warn!(
                    item_id = id.0,
                    stop = ?stop,
                    "Transfer completed before stop took effect"
                );
                self.finish(id);
            }
            (None, TerminalEvent::Failed { reason, retryable }) => {
                self.fail(id, reason, retryable);
            }
            (None, TerminalEvent::Cancelled) => {
                tracing::warn!(item_id = id.0, "Transfer cancelled without a stop request");
                self.set_status(id, Status::Queued);
                self.reconcile_bytes(id).await;
            }
            (Some(stop), TerminalEvent::Failed { reason, .. }) => {
                tracing::debug!(item_id = id.0, error = %reason, "Stopped transfer reported failure");
                self.apply_stop(id, stop).await;
            }
            (Some(stop), TerminalEvent::Cancelled) => self.apply_stop(id, stop).await,
        }

        self.tick();
    }

    fn finish(&mut self, id: QueueItemId) {
        if let Some(item) = self.store.get_mut(id) {
            if item.bytes_total.is_none() {
                item.bytes_total = Some(item.bytes_downloaded);
            }
            tracing::info!(item_id = id.0, bytes = item.bytes_downloaded, "Download finished");
        }
        self.set_status(id, Status::Finished);
    }

    fn fail(&mut self, id: QueueItemId, reason: String, retryable: bool) {
        self.set_status(id, Status::Failed);
        let Some(item) = self.store.get_mut(id) else {
            return;
        };
        item.last_error = Some(reason.clone());
        let attempt_count = item.attempt_count;
        tracing::warn!(item_id = id.0, error = %reason, retryable, "Download failed");
        self.emit(Event::Failed { id, error: reason });

        if let Some(delay) = automatic_retry_delay(&self.config.retry, retryable, attempt_count) {
            self.schedule_retry(id, delay);
        }
    }

    /// Settle an item whose worker stopped on request
    ///
    /// The status was already set when the stop was requested; what remains
    /// is the partial file.
    async fn apply_stop(&mut self, id: QueueItemId, stop: StopReason) {
        if stop.discards_partial() {
            self.discard_partial(id).await;
        } else {
            self.reconcile_bytes(id).await;
        }
        tracing::debug!(item_id = id.0, stop = ?stop, "Transfer stopped");
    }

    /// Remove an item's partial file and reset its progress
    pub(crate) async fn discard_partial(&mut self, id: QueueItemId) {
        let Some(item) = self.store.get_mut(id) else {
            return;
        };
        if let Err(e) = utils::remove_partial(&item.destination).await {
            tracing::warn!(
                item_id = id.0,
                path = %item.destination.display(),
                error = %e,
                "Failed to remove partial file"
            );
        }
        item.bytes_downloaded = 0;
        item.bytes_total = None;
        self.dirty = true;
    }

    /// Set `bytes_downloaded` to what is actually on disk
    pub(crate) async fn reconcile_bytes(&mut self, id: QueueItemId) {
        let Some(item) = self.store.get_mut(id) else {
            return;
        };
        let on_disk = utils::file_len(&item.destination).await;
        if on_disk != item.bytes_downloaded {
            item.bytes_downloaded = on_disk;
            self.dirty = true;
        }
    }

    /// Change an item's status, returning the previous one
    pub(crate) fn set_status(&mut self, id: QueueItemId, to: Status) -> Option<Status> {
        let item = self.store.get_mut(id)?;
        let from = item.status;
        if from == to {
            return Some(from);
        }
        item.status = to;
        if to != Status::Failed {
            item.last_error = None;
        }
        self.dirty = true;
        tracing::info!(item_id = id.0, from = %from, to = %to, "Status changed");
        self.emit(Event::StatusChanged { id, from, to });
        Some(from)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Admit queued items in queue order while slots are free
    pub(crate) fn tick(&mut self) {
        if !self.auto_download || self.shutting_down {
            return;
        }

        let candidates: Vec<QueueItemId> = self
            .store
            .iter()
            .filter(|item| item.status == Status::Queued && !self.active.contains_key(&item.id))
            .map(|item| item.id)
            .collect();

        for id in candidates {
            if self.active.len() >= self.max_concurrent {
                break;
            }
            self.start_transfer(id);
        }
    }

    fn start_transfer(&mut self, id: QueueItemId) {
        let Some(item) = self.store.get(id) else {
            return;
        };
        let cancel = CancellationToken::new();
        let handle = TransferWorker::spawn(
            self.fetcher.clone(),
            item,
            self.worker_tx.clone(),
            cancel.clone(),
        );
        let start_offset = item.bytes_downloaded;
        tracing::info!(item_id = id.0, url = %item.source_url, "Starting transfer");

        self.admitted_seq += 1;
        self.active.insert(
            id,
            ActiveTransfer {
                cancel,
                handle,
                started_at: Instant::now(),
                start_offset,
                stop: None,
                admitted_seq: self.admitted_seq,
            },
        );
        self.set_status(id, Status::Downloading);
    }

    /// Ask a bound worker to stop; its slot is freed by the terminal event
    pub(crate) fn stop_transfer(&mut self, id: QueueItemId, reason: StopReason) -> bool {
        let Some(transfer) = self.active.get_mut(&id) else {
            return false;
        };
        transfer.stop = Some(StopReason::merge(transfer.stop, reason));
        transfer.cancel.cancel();
        tracing::debug!(item_id = id.0, stop = ?transfer.stop, "Stopping transfer");
        true
    }

    fn schedule_retry(&mut self, id: QueueItemId, delay: Duration) {
        let tx = self.retry_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        });
        tracing::info!(item_id = id.0, delay_secs = delay.as_secs_f64(), "Scheduled automatic retry");
        if let Some(previous) = self.retry_timers.insert(id, timer.abort_handle()) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_retry_timer(&mut self, id: QueueItemId) {
        if let Some(timer) = self.retry_timers.remove(&id) {
            timer.abort();
        }
    }

    pub(crate) fn cancel_all_retry_timers(&mut self) {
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
    }

    fn handle_automatic_retry(&mut self, id: QueueItemId) {
        self.retry_timers.remove(&id);
        let Some(item) = self.store.get_mut(id) else {
            return;
        };
        if item.status != Status::Failed {
            return;
        }
        item.attempt_count += 1;
        tracing::info!(item_id = id.0, attempt = item.attempt_count, "Retrying automatically");
        self.set_status(id, Status::Queued);
        self.tick();
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Persist pending changes, then publish a fresh snapshot
    ///
    /// After a successful write, deleted items without a bound worker leave
    /// the table. A failed write keeps the changes pending for the next pass.
    pub(crate) async fn commit(&mut self) {
        if self.dirty {
            match self.store.persist().await {
                Ok(()) => {
                    self.dirty = false;
                    self.drop_deleted();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to persist queue");
                    self.emit(Event::PersistenceFailed {
                        error: e.to_string(),
                    });
                }
            }
        }
        self.publish_snapshot();
    }

    /// Remove deleted items that no worker is bound to; returns how many
    pub(crate) fn drop_deleted(&mut self) -> usize {
        let removed = self
            .store
            .retain(|item| item.status != Status::Deleted || self.active.contains_key(&item.id));
        for item in &removed {
            tracing::debug!(item_id = item.id.0, "Removed deleted item");
            self.emit(Event::Removed { id: item.id });
        }
        removed.len()
    }

    pub(crate) fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        let now = Instant::now();
        let mut stats = QueueStats {
            active_transfers: self.active.len(),
            max_concurrent_downloads: self.max_concurrent,
            auto_download: self.auto_download,
            pending_retries: self.retry_timers.len(),
            ..QueueStats::default()
        };

        let items: Vec<ItemView> = self
            .store
            .iter()
            .map(|item| {
                let speed_bps = match (item.status, self.active.get(&item.id)) {
                    (Status::Downloading, Some(transfer)) => speed(
                        item.bytes_downloaded.saturating_sub(transfer.start_offset),
                        now.saturating_duration_since(transfer.started_at),
                    ),
                    _ => 0,
                };

                match item.status {
                    Status::Queued => stats.queued += 1,
                    Status::Downloading => stats.downloading += 1,
                    Status::Paused => stats.paused += 1,
                    Status::Finished | Status::AlreadyDownloaded => stats.finished += 1,
                    Status::Failed => stats.failed += 1,
                    Status::Deleted => {}
                }
                if item.status != Status::Deleted {
                    stats.total += 1;
                    stats.bytes_downloaded += item.bytes_downloaded;
                }
                stats.speed_bps += speed_bps;

                ItemView {
                    id: item.id,
                    source_url: item.source_url.clone(),
                    destination: item.destination.clone(),
                    status: item.status,
                    bytes_downloaded: item.bytes_downloaded,
                    bytes_total: item.bytes_total,
                    percent: item.percent(),
                    speed_bps,
                    attempt_count: item.attempt_count,
                    last_error: item.last_error.clone(),
                }
            })
            .collect();

        QueueSnapshot { items, stats }
    }
}

fn speed(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs < 0.001 {
        0
    } else {
        (bytes as f64 / secs) as u64
    }
}
