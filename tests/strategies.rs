mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Call, MIB, MockRemote, drain_events, eventually};
use shuttle::core::transfer_engine::{
    ProgressEvent, ProgressReporter, RouterConfig, TransferJob, TransferRouter,
};
use shuttle::core::{
    Category, FileRef, StrategyKind, TaskEvent, TaskId, TaskOutcome, TaskStatus, TransferError,
};
use tokio_util::sync::CancellationToken;

const KIB: usize = 1024;

fn router(remote: &Arc<MockRemote>, config: RouterConfig) -> TransferRouter {
    TransferRouter::new(remote.clone(), config)
}

fn chunked_config() -> RouterConfig {
    RouterConfig {
        chunk_size: 64 * KIB as u64,
        chunk_parallelism: 3,
        ..common::router_config()
    }
}

fn job(router: &TransferRouter, file: FileRef, category: Category) -> TransferJob {
    TransferJob {
        task_id: TaskId::new(),
        strategy: router.strategy_for(&file),
        file,
        category,
    }
}

fn recording_reporter() -> (Arc<ProgressReporter>, Arc<Mutex<Vec<ProgressEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let reporter = ProgressReporter::new(Duration::from_millis(50), move |event| {
        sink.lock().unwrap().push(event)
    });
    (Arc::new(reporter), seen)
}

fn percents(events: &[ProgressEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Bytes { percent, .. } => Some(*percent),
            ProgressEvent::Finalizing => None,
        })
        .collect()
}

#[tokio::test]
async fn strategy_follows_size_and_preference() {
    let remote = MockRemote::new();
    let router = router(&remote, common::router_config());

    let small = common::text_file("a.txt", 10 * MIB - 1);
    let large = common::video_file("b.mp4", 10 * MIB);
    let resumable = common::text_file("c.txt", 10).resumable(true);

    assert_eq!(router.strategy_for(&small), StrategyKind::Inline);
    assert_eq!(router.strategy_for(&large), StrategyKind::OutOfBand);
    assert_eq!(router.strategy_for(&resumable), StrategyKind::Chunked);
}

#[tokio::test]
async fn out_of_band_confirms_after_the_bytes_and_only_then_completes() {
    let remote = MockRemote::new();
    let gate = remote.gate("confirm_upload");
    let orchestrator = common::orchestrator(&remote, 1);
    let mut events = orchestrator.subscribe();

    let report = orchestrator
        .submit(vec![common::video_file("holiday.mp4", 50 * MIB)])
        .await
        .unwrap();
    let id = report.accepted[0];

    eventually("confirmation requested", || {
        remote.calls().iter().any(|c| matches!(c, Call::Confirm(_)))
    })
    .await;

    let view = orchestrator.snapshot().await.unwrap().remove(0);
    assert_eq!(view.status, TaskStatus::FinalizingRemote);
    assert_eq!(view.strategy, Some(StrategyKind::OutOfBand));
    assert!(view.progress_percent <= 90);

    gate.add_permits(1);
    let outcomes = orchestrator.await_all(&[id]).await.unwrap();
    assert_eq!(
        outcomes[0].1,
        TaskOutcome::Completed {
            remote_object_id: "obj-1".into()
        }
    );

    assert_eq!(
        remote.calls(),
        vec![
            Call::RequestTarget("holiday.mp4".into()),
            Call::Put {
                url: "mock://target/1".into(),
                offset: 0,
                len: (50 * MIB) as u64,
            },
            Call::Confirm("obj-1".into()),
        ]
    );

    let seen = drain_events(&mut events);
    let finalizing = seen
        .iter()
        .position(|e| *e == TaskEvent::Finalizing { id })
        .unwrap();
    let completed = seen
        .iter()
        .position(|e| matches!(e, TaskEvent::Completed { .. }))
        .unwrap();
    assert!(finalizing < completed);
    for event in &seen[..completed] {
        if let TaskEvent::Progress { percent, .. } = event {
            assert!(*percent <= 90, "saw {percent}% before confirmation");
        }
    }
    assert_eq!(orchestrator.snapshot().await.unwrap()[0].progress_percent, 100);
}

#[tokio::test]
async fn expired_target_is_replaced_before_a_retried_put() {
    let remote = MockRemote::new();
    remote.target_expiry.store(0, Ordering::SeqCst);
    remote.fail_next(
        "put_to_target",
        TransferError::Remote {
            status: 503,
            message: "slow down".into(),
        },
    );
    let router = router(&remote, common::router_config());
    let job = job(&router, common::video_file("big.mp4", 11 * MIB), Category::Video);

    let object = router
        .execute(&job, &Arc::new(ProgressReporter::noop()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(object.id, "obj-2");

    let calls = remote.calls();
    assert_eq!(calls[0], Call::RequestTarget("big.mp4".into()));
    assert!(matches!(&calls[1], Call::Put { url, .. } if url == "mock://target/1"));
    assert_eq!(calls[2], Call::RequestTarget("big.mp4".into()));
    assert!(matches!(&calls[3], Call::Put { url, .. } if url == "mock://target/2"));
    assert_eq!(calls[4], Call::Confirm("obj-2".into()));
}

#[tokio::test]
async fn chunk_tokens_are_ordered_even_when_chunks_finish_out_of_order() {
    let remote = MockRemote::new();
    remote.delay_part(0, Duration::from_millis(80));
    remote.delay_part(1, Duration::from_millis(40));
    let router = router(&remote, chunked_config());
    let file = common::text_file("journal.txt", 4 * 64 * KIB).resumable(true);
    let job = job(&router, file, Category::Text);
    assert_eq!(job.strategy, StrategyKind::Chunked);

    let (reporter, seen) = recording_reporter();
    let object = router
        .execute(&job, &reporter, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(object.id, "chunked-session-1");

    let calls = remote.calls();
    assert_eq!(
        calls[0],
        Call::Initiate {
            file: "journal.txt".into(),
            chunks: 4
        }
    );
    let completed = calls
        .iter()
        .find_map(|call| match call {
            Call::Complete(parts) => Some(parts.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        completed,
        (0..4).map(|i| (i, format!("etag-{i}"))).collect::<Vec<_>>()
    );

    let mut offsets: Vec<u64> = calls
        .iter()
        .filter_map(|call| match call {
            Call::Put { offset, len, .. } => {
                assert_eq!(*len, (64 * KIB) as u64);
                Some(*offset)
            }
            _ => None,
        })
        .collect();
    offsets.sort();
    assert_eq!(offsets, vec![0, 65536, 131072, 196608]);

    let events = seen.lock().unwrap().clone();
    let percents = percents(&events);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last().copied(), Some(90));
    assert_eq!(events.last(), Some(&ProgressEvent::Finalizing));
}

#[tokio::test]
async fn failed_chunk_aborts_the_session() {
    let remote = MockRemote::new();
    remote.fail_next(
        "put_to_target",
        TransferError::Remote {
            status: 400,
            message: "bad part".into(),
        },
    );
    let router = router(&remote, chunked_config());
    let job = job(
        &router,
        common::text_file("report.txt", 5 * 64 * KIB).resumable(true),
        Category::Text,
    );

    let result = router
        .execute(&job, &Arc::new(ProgressReporter::noop()), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(TransferError::Remote { status: 400, .. })));

    let calls = remote.calls();
    assert!(calls.contains(&Call::Abort("session-1".into())));
    assert!(!calls.iter().any(|c| matches!(c, Call::Complete(_))));
}

#[tokio::test]
async fn session_with_wrong_part_count_is_aborted() {
    let remote = MockRemote::new();
    *remote.part_count_override.lock().unwrap() = Some(2);
    let router = router(&remote, chunked_config());
    let job = job(
        &router,
        common::text_file("short.txt", 3 * 64 * KIB).resumable(true),
        Category::Text,
    );

    let result = router
        .execute(&job, &Arc::new(ProgressReporter::noop()), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(TransferError::Protocol(_))));

    let calls = remote.calls();
    assert!(calls.contains(&Call::Abort("session-1".into())));
    assert!(!calls.iter().any(|c| matches!(c, Call::Put { .. })));
}

#[tokio::test]
async fn cancelled_chunked_transfer_aborts_in_the_background() {
    let remote = MockRemote::new();
    let _gate = remote.gate("put_to_target");
    let router = Arc::new(router(&remote, chunked_config()));
    let job = job(
        &router,
        common::text_file("long.txt", 6 * 64 * KIB).resumable(true),
        Category::Text,
    );
    let cancel = CancellationToken::new();

    let handle = {
        let router = router.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            router
                .execute(&job, &Arc::new(ProgressReporter::noop()), &cancel)
                .await
        })
    };

    eventually("chunks in flight", || remote.in_flight() == 3).await;
    cancel.cancel();

    assert_eq!(handle.await.unwrap(), Err(TransferError::Cancelled));
    assert_eq!(remote.dropped(), 3);
    eventually("session aborted", || {
        remote.calls().contains(&Call::Abort("session-1".into()))
    })
    .await;
}

#[tokio::test]
async fn timeouts_are_retried_then_reported() {
    let remote = MockRemote::new();
    let _gate = remote.gate("upload_inline");
    let router = router(
        &remote,
        RouterConfig {
            request_timeout: Duration::from_millis(20),
            ..common::router_config()
        },
    );
    let job = job(&router, common::text_file("slow.txt", 100), Category::Text);

    let result = router
        .execute(&job, &Arc::new(ProgressReporter::noop()), &CancellationToken::new())
        .await;

    assert_eq!(result, Err(TransferError::Timeout { secs: 0 }));
    assert_eq!(remote.calls().len(), 3);
    assert_eq!(remote.dropped(), 3);
}

#[tokio::test]
async fn body_uploads_get_extra_time_for_their_size() {
    let remote = MockRemote::new();
    *remote.byte_call_delay.lock().unwrap() = Duration::from_millis(60);
    let config = RouterConfig {
        request_timeout: Duration::from_millis(20),
        min_throughput: 50 * MIB as u64,
        ..common::router_config()
    };
    let router = router(&remote, config.clone());
    let job = job(&router, common::video_file("slow.mp4", 11 * MIB), Category::Video);

    let object = router
        .execute(&job, &Arc::new(ProgressReporter::noop()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(object.id, "obj-1");
    let puts = remote
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Put { .. }))
        .count();
    assert_eq!(puts, 1);

    let flat = router_with_flat_timeout(&remote, config);
    let result = flat
        .execute(&job, &Arc::new(ProgressReporter::noop()), &CancellationToken::new())
        .await;
    assert_eq!(result, Err(TransferError::Timeout { secs: 0 }));
}

fn router_with_flat_timeout(remote: &Arc<MockRemote>, config: RouterConfig) -> TransferRouter {
    router(
        remote,
        RouterConfig {
            min_throughput: 0,
            ..config
        },
    )
}
