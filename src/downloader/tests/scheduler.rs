use super::*;
use crate::config::RetryPolicy;
use crate::downloader::scheduler::Scheduler;
use crate::downloader::worker::{WorkerEvent, WorkerMessage};
use crate::fetch::ProgressEvent;
use crate::store::ItemStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Notify, broadcast, watch};

#[tokio::test]
async fn test_admits_up_to_limit_in_queue_order() {
    let (controller, fetcher, _temp_dir) = create_test_controller(2).await;
    let gate = Arc::new(Notify::new());
    fetcher.script(
        &episode_url(1),
        Script::Gate {
            held: 1024,
            bytes: 4096,
            gate: gate.clone(),
        },
    );

    let mut ids = Vec::new();
    for n in 1..=5 {
        ids.push(controller.enqueue_url(episode_url(n)).await.unwrap());
    }

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.item(ids[0]).unwrap().status, Status::Downloading);
    assert_eq!(snapshot.item(ids[1]).unwrap().status, Status::Downloading);
    for id in &ids[2..] {
        assert_eq!(snapshot.item(*id).unwrap().status, Status::Queued);
    }

    gate.notify_one();
    let snapshot = wait_for(&controller, |s| {
        s.item(ids[0]).is_some_and(|item| item.status == Status::Finished)
    })
    .await;

    // The slot went to the earliest queued item
    assert_eq!(snapshot.item(ids[2]).unwrap().status, Status::Downloading);
    assert_eq!(snapshot.item(ids[3]).unwrap().status, Status::Queued);
    assert_eq!(snapshot.item(ids[4]).unwrap().status, Status::Queued);
    assert_eq!(snapshot.item(ids[0]).unwrap().bytes_downloaded, 4096);
    assert_eq!(snapshot.stats.downloading, 2);
}

#[tokio::test]
async fn test_downloading_never_exceeds_limit() {
    let (controller, fetcher, _temp_dir) = create_test_controller(2).await;
    for n in 1..=6 {
        fetcher.script(&episode_url(n), Script::Complete { bytes: 3 * CHUNK });
    }
    let mut events = controller.subscribe();

    for n in 1..=6 {
        controller.enqueue_url(episode_url(n)).await.unwrap();
    }

    let mut downloading = HashSet::new();
    let mut finished = 0;
    while finished < 6 {
        match wait_for_event(&mut events, |e| matches!(e, Event::StatusChanged { .. })).await {
            Event::StatusChanged { id, to, .. } => {
                if to == Status::Downloading {
                    downloading.insert(id);
                } else {
                    downloading.remove(&id);
                }
                if to == Status::Finished {
                    finished += 1;
                }
                assert!(downloading.len() <= 2, "more than 2 transfers running");
            }
            _ => unreachable!(),
        }
    }

    let snapshot = wait_for(&controller, |s| s.stats.active_transfers == 0).await;
    assert_eq!(snapshot.count(Status::Finished), 6);
}

#[tokio::test]
async fn test_failure_frees_slot_for_next_item() {
    let (controller, fetcher, _temp_dir) = create_test_controller(1).await;
    fetcher.script(
        &episode_url(1),
        Script::Fail {
            bytes: 2048,
            message: "connection reset",
        },
    );
    let mut events = controller.subscribe();

    let first = controller.enqueue_url(episode_url(1)).await.unwrap();
    let second = controller.enqueue_url(episode_url(2)).await.unwrap();

    let event = wait_for_event(&mut events, |e| matches!(e, Event::Failed { .. })).await;
    match event {
        Event::Failed { id, error } => {
            assert_eq!(id, first);
            assert!(error.contains("connection reset"));
        }
        _ => unreachable!(),
    }

    let snapshot = wait_for(&controller, |s| {
        s.item(second)
            .is_some_and(|item| item.status == Status::Downloading)
    })
    .await;
    let failed = snapshot.item(first).unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(failed.attempt_count, 0);

    // Manual policy: no retry happens on its own
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetcher.calls_for(&episode_url(1)).len(), 1);
}

#[tokio::test]
async fn test_auto_download_disabled_admits_nothing() {
    let (controller, _fetcher, _temp_dir) = create_test_controller(2).await;
    controller
        .dispatch(Command::SetAutoDownload(false))
        .await
        .unwrap();

    let id = controller.enqueue_url(episode_url(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.snapshot().item(id).unwrap().status, Status::Queued);
    assert!(!controller.snapshot().stats.auto_download);

    let outcome = controller
        .dispatch(Command::SetAutoDownload(true))
        .await
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Applied);
    assert_eq!(
        controller.snapshot().item(id).unwrap().status,
        Status::Downloading
    );

    let outcome = controller
        .dispatch(Command::SetAutoDownload(true))
        .await
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Unchanged);
}

#[tokio::test]
async fn test_lowering_limit_requeues_latest_transfers() {
    let (controller, fetcher, _temp_dir) = create_test_controller(3).await;
    let mut ids = Vec::new();
    for n in 1..=3 {
        fetcher.script(&episode_url(n), Script::Hold { bytes: CHUNK });
        ids.push(controller.enqueue_url(episode_url(n)).await.unwrap());
    }
    wait_for(&controller, |s| {
        s.items.iter().all(|item| item.bytes_downloaded == CHUNK)
    })
    .await;

    let outcome = controller
        .dispatch(Command::SetMaxConcurrent(1))
        .await
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Applied);

    let snapshot = wait_for(&controller, |s| s.stats.active_transfers == 1).await;
    assert_eq!(snapshot.stats.max_concurrent_downloads, 1);
    assert_eq!(snapshot.item(ids[0]).unwrap().status, Status::Downloading);
    for id in &ids[1..] {
        let item = snapshot.item(*id).unwrap();
        assert_eq!(item.status, Status::Queued);
        assert_eq!(item.bytes_downloaded, CHUNK);
    }
}

#[tokio::test]
async fn test_raising_limit_admits_waiting_items() {
    let (controller, _fetcher, _temp_dir) = create_test_controller(1).await;
    let first = controller.enqueue_url(episode_url(1)).await.unwrap();
    let second = controller.enqueue_url(episode_url(2)).await.unwrap();
    assert_eq!(
        controller.snapshot().item(second).unwrap().status,
        Status::Queued
    );

    controller
        .dispatch(Command::SetMaxConcurrent(2))
        .await
        .unwrap();

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.item(first).unwrap().status, Status::Downloading);
    assert_eq!(snapshot.item(second).unwrap().status, Status::Downloading);
}

#[tokio::test]
async fn test_zero_limit_is_rejected() {
    let (controller, _fetcher, _temp_dir) = create_test_controller(1).await;
    let err = controller
        .dispatch(Command::SetMaxConcurrent(0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "config_error");
    assert_eq!(controller.snapshot().stats.max_concurrent_downloads, 1);
}

#[tokio::test]
async fn test_automatic_retry_policy_requeues_failures() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(temp_dir.path(), 1);
    config.retry.policy = RetryPolicy::Automatic;
    config.retry.max_attempts = 1;
    config.retry.initial_delay = Duration::from_millis(20);
    config.retry.jitter = false;

    let fetcher = ScriptedFetcher::new();
    fetcher.script(
        &episode_url(1),
        Script::Fail {
            bytes: 0,
            message: "connection reset",
        },
    );
    let controller = QueueController::start(config, fetcher.clone())
        .await
        .unwrap();

    let id = controller.enqueue_url(episode_url(1)).await.unwrap();
    let snapshot = wait_for(&controller, |s| {
        s.item(id)
            .is_some_and(|item| item.status == Status::Failed && item.attempt_count == 1)
    })
    .await;

    assert!(snapshot.item(id).unwrap().last_error.is_some());
    // One automatic retry, then the attempt budget is spent
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetcher.calls_for(&episode_url(1)).len(), 2);
}

#[tokio::test]
async fn test_pending_automatic_retry_is_counted() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(temp_dir.path(), 1);
    config.retry.policy = RetryPolicy::Automatic;
    config.retry.max_attempts = 3;
    config.retry.initial_delay = Duration::from_secs(3600);
    config.retry.jitter = false;

    let fetcher = ScriptedFetcher::new();
    fetcher.script(
        &episode_url(1),
        Script::Fail {
            bytes: 0,
            message: "connection reset",
        },
    );
    let controller = QueueController::start(config, fetcher.clone())
        .await
        .unwrap();

    let id = controller.enqueue_url(episode_url(1)).await.unwrap();
    let snapshot = wait_for(&controller, |s| {
        s.item(id).is_some_and(|item| item.status == Status::Failed)
    })
    .await;
    assert_eq!(snapshot.stats.active_transfers, 0);
    assert_eq!(snapshot.stats.pending_retries, 1);

    // A manual retry replaces the timer
    fetcher.script(&episode_url(1), Script::Complete { bytes: CHUNK });
    controller.retry(id).await.unwrap();
    let snapshot = wait_for(&controller, |s| {
        s.item(id).is_some_and(|item| item.status == Status::Finished)
    })
    .await;
    assert_eq!(snapshot.stats.pending_retries, 0);
    assert_eq!(fetcher.calls_for(&episode_url(1)).len(), 2);
}

#[tokio::test]
async fn test_stopping_worker_blocks_readmission() {
    let (controller, fetcher, _temp_dir) = create_test_controller(2).await;
    fetcher.script(
        &episode_url(1),
        Script::SlowStop {
            bytes: 2 * CHUNK,
            linger: Duration::from_millis(200),
        },
    );
    let mut events = controller.subscribe();

    let id = controller.enqueue_url(episode_url(1)).await.unwrap();
    let started_for =
        move |e: &Event| matches!(e, Event::Started { id: started, .. } if *started == id);
    wait_for(&controller, |s| {
        s.item(id).is_some_and(|item| item.bytes_downloaded == 2 * CHUNK)
    })
    .await;

    // Cancel, then pause and resume while the worker is still stopping
    controller.cancel(id).await.unwrap();
    controller.pause(id).await.unwrap();
    controller.resume(id).await.unwrap();
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.item(id).unwrap().status, Status::Queued);
    assert_eq!(snapshot.stats.active_transfers, 1);

    // Two Started events: the first admission and the re-admission
    for _ in 0..2 {
        wait_for_event(&mut events, started_for).await;
    }
    wait_for(&controller, |s| {
        s.item(id).is_some_and(|item| item.bytes_downloaded == 2 * CHUNK)
    })
    .await;
    let calls = fetcher.calls_for(&episode_url(1));
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].resume_offset, 0, "cancel removes the partial file first");

    // Pausing keeps the bytes; resuming early still waits for the old worker
    controller.pause(id).await.unwrap();
    controller.resume(id).await.unwrap();
    assert_eq!(controller.snapshot().stats.active_transfers, 1);
    let started = wait_for_event(&mut events, started_for).await;
    assert_eq!(
        started,
        Event::Started {
            id,
            resume_offset: 2 * CHUNK
        }
    );

    assert_eq!(fetcher.calls_for(&episode_url(1)).len(), 3);
    assert_eq!(fetcher.max_writers(), 1);
}

#[tokio::test]
async fn test_speed_is_reported_for_running_transfers() {
    let (controller, fetcher, _temp_dir) = create_test_controller(1).await;
    fetcher.script(&episode_url(1), Script::Hold { bytes: 8 * CHUNK });
    let id = controller.enqueue_url(episode_url(1)).await.unwrap();

    let snapshot = wait_for(&controller, |s| {
        s.item(id).is_some_and(|item| item.bytes_downloaded == 8 * CHUNK)
    })
    .await;
    assert_eq!(snapshot.stats.bytes_downloaded, 8 * CHUNK);
    assert_eq!(snapshot.stats.downloading, 1);
    assert_eq!(snapshot.stats.speed_bps, snapshot.item(id).unwrap().speed_bps);
}

#[tokio::test]
async fn test_cancellation_race_reports_superseded() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(temp_dir.path(), 1));
    let fetcher = ScriptedFetcher::new();
    fetcher.script(&episode_url(1), Script::Complete { bytes: 2048 });

    let (event_tx, _events) = broadcast::channel(64);
    let (snapshot_tx, _snapshots) = watch::channel(QueueSnapshot::default());
    let mut scheduler = Scheduler::new(
        ItemStore::empty(&config.queue.queue_file),
        config.clone(),
        fetcher,
        event_tx,
        snapshot_tx,
    );

    let id = scheduler
        .enqueue(episode_url(1), "episode-1.mp3".into())
        .await
        .unwrap();
    assert_eq!(scheduler.store.get(id).unwrap().status, Status::Downloading);

    // Let the worker finish; its terminal event waits in the channel
    let transfer = scheduler.active.get_mut(&id).unwrap();
    (&mut transfer.handle).await.unwrap();

    let terminated = scheduler.drain_worker_messages().await;
    assert!(terminated.contains(&id));

    let outcome = scheduler
        .dispatch(Command::Pause(id), &terminated)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CommandOutcome::Superseded {
            status: Status::Finished
        }
    );
    assert_eq!(scheduler.store.get(id).unwrap().status, Status::Finished);

    // Without the race the same command is an ordinary error
    let err = scheduler
        .dispatch(Command::Pause(id), &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_stale_progress_is_ignored() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(temp_dir.path(), 1));
    let fetcher = ScriptedFetcher::new();
    fetcher.script(&episode_url(1), Script::Hold { bytes: 4096 });

    let (event_tx, _events) = broadcast::channel(64);
    let (snapshot_tx, _snapshots) = watch::channel(QueueSnapshot::default());
    let mut scheduler = Scheduler::new(
        ItemStore::empty(&config.queue.queue_file),
        config.clone(),
        fetcher,
        event_tx,
        snapshot_tx,
    );
    let id = scheduler
        .enqueue(episode_url(1), "episode-1.mp3".into())
        .await
        .unwrap();

    while scheduler.store.get(id).unwrap().bytes_downloaded < 4096 {
        let message = scheduler.worker_rx.recv().await.unwrap();
        scheduler.handle_worker_message(message).await;
    }

    scheduler
        .handle_worker_message(WorkerMessage {
            id,
            event: WorkerEvent::Progress(ProgressEvent::Progress {
                bytes_downloaded: 1024,
                bytes_total: None,
            }),
        })
        .await;
    assert_eq!(scheduler.store.get(id).unwrap().bytes_downloaded, 4096);
}
