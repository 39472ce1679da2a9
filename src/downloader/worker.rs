//! Transfer workers: one tokio task per running enclosure download.

use crate::error::TransferError;
use crate::fetch::{FetchRequest, Fetcher, ProgressEvent, ProgressSink};
use crate::retry::IsRetryable;
use crate::types::{QueueItem, QueueItemId};
use crate::utils;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Message from a worker to the control task
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WorkerMessage {
    pub(crate) id: QueueItemId,
    pub(crate) event: WorkerEvent,
}

/// What a worker reports: any number of progress events, then one terminal event
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum WorkerEvent {
    Progress(ProgressEvent),
    Terminal(TerminalEvent),
}

/// How a transfer ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TerminalEvent {
    Completed,
    Failed { reason: String, retryable: bool },
    Cancelled,
}

impl From<Result<(), TransferError>> for TerminalEvent {
    fn from(result: Result<(), TransferError>) -> Self {
        match result {
            Ok(()) => TerminalEvent::Completed,
            Err(TransferError::Cancelled) => TerminalEvent::Cancelled,
            Err(e) => TerminalEvent::Failed {
                retryable: e.is_retryable(),
                reason: e.to_string(),
            },
        }
    }
}

/// Aborts the fetch task when the worker itself is aborted
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct TransferWorker;

impl TransferWorker {
    /// Run one fetch for `item` on its own task
    ///
    /// The resume offset is the length of the partial file found at the
    /// item's destination. Exactly one [`WorkerEvent::Terminal`] is sent after the fetcher's
    /// progress, on the same channel, so the control task sees them in order.
    /// A panicking fetcher is reported as a failure.
    pub(crate) fn spawn(
        fetcher: Arc<dyn Fetcher>,
        item: &QueueItem,
        tx: mpsc::Sender<WorkerMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let id = item.id;
        let url = item.source_url.clone();
        let destination = item.destination.clone();

        tokio::spawn(async move {
            let resume_offset = utils::file_len(&destination).await;
            let request = FetchRequest {
                id,
                url,
                destination,
                resume_offset,
            };
            let sink = ProgressSink::new(id, tx.clone());

            let fetch = tokio::spawn(async move { fetcher.fetch(request, &sink, cancel).await });
            let _guard = AbortOnDrop(fetch.abort_handle());

            let terminal = match fetch.await {
                Ok(result) => TerminalEvent::from(result),
                Err(e) if e.is_panic() => {
                    tracing::error!(item_id = id.0, "Fetch task panicked");
                    TerminalEvent::Failed {
                        reason: "transfer task panicked".to_string(),
                        retryable: false,
                    }
                }
                Err(_) => TerminalEvent::Cancelled,
            };

            tracing::debug!(item_id = id.0, terminal = ?terminal, "Transfer ended");
            let message = WorkerMessage {
                id,
                event: WorkerEvent::Terminal(terminal),
            };
            if tx.send(message).await.is_err() {
                tracing::debug!(item_id = id.0, "Terminal event dropped, controller is gone");
            }
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct Panicking;

    #[async_trait]
    impl Fetcher for Panicking {
        async fn fetch(
            &self,
            _request: FetchRequest,
            _progress: &ProgressSink,
            _cancel: CancellationToken,
        ) -> Result<(), TransferError> {
            panic!("boom");
        }
    }

    struct ResetAfterStart;

    #[async_trait]
    impl Fetcher for ResetAfterStart {
        async fn fetch(
            &self,
            request: FetchRequest,
            progress: &ProgressSink,
            _cancel: CancellationToken,
        ) -> Result<(), TransferError> {
            progress
                .report(ProgressEvent::Started {
                    resume_offset: request.resume_offset,
                    bytes_total: None,
                })
                .await;
            Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )))
        }
    }

    fn item() -> QueueItem {
        QueueItem::new(
            QueueItemId(9),
            "http://example.com/ep.mp3",
            PathBuf::from("/nonexistent/ep.mp3"),
        )
    }

    #[tokio::test]
    async fn test_events_end_with_single_terminal() {
        let (tx, mut rx) = mpsc::channel(8);
        TransferWorker::spawn(Arc::new(ResetAfterStart), &item(), tx, CancellationToken::new())
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, QueueItemId(9));
        assert!(matches!(first.event, WorkerEvent::Progress(ProgressEvent::Started { .. })));

        let second = rx.recv().await.unwrap();
        match second.event {
            WorkerEvent::Terminal(TerminalEvent::Failed { reason, retryable }) => {
                assert!(reason.contains("connection reset"));
                assert!(retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_fetcher_reports_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        TransferWorker::spawn(Arc::new(Panicking), &item(), tx, CancellationToken::new())
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(
            message.event,
            WorkerEvent::Terminal(TerminalEvent::Failed {
                reason: "transfer task panicked".to_string(),
                retryable: false,
            })
        );
    }

    #[test]
    fn test_cancelled_result_maps_to_cancelled() {
        assert_eq!(
            TerminalEvent::from(Err(TransferError::Cancelled)),
            TerminalEvent::Cancelled
        );
        assert_eq!(TerminalEvent::from(Ok(())), TerminalEvent::Completed);
    }
}
