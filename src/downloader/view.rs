//! Presentation hook: push snapshots to a front end.

use crate::types::QueueSnapshot;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A front end that renders queue snapshots
///
/// `render` is called with the current snapshot when the consumer is attached
/// and again after every change. It runs on a tokio task and must not block.
pub trait SnapshotConsumer: Send + Sync {
    /// Draw the given queue state
    fn render(&self, snapshot: &QueueSnapshot);
}

pub(crate) fn attach(
    consumer: Arc<dyn SnapshotConsumer>,
    mut snapshots: watch::Receiver<QueueSnapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Clone so the watch lock is not held while rendering
            let snapshot = snapshots.borrow_and_update().clone();
            consumer.render(&snapshot);
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    })
}
