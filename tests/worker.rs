mod common;

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use common::{Harness, ScriptedRunner};
use video_pipeline::db::VideoStore;
use video_pipeline::queue::{Delivery, JobEnvelope, JobQueue};
use video_pipeline::services::intake::{register_upload, reprocess, ReprocessOutcome, UploadRequest};
use video_pipeline::services::storage::StorageLayout;
use video_pipeline::services::{Disposition, WorkerPool};

#[tokio::test]
async fn upload_registers_pending_video_and_enqueues_job() {
    let h = Harness::new(ScriptedRunner::new(1280, 720, Some(10.0)));
    let id = h.upload("Summer Trip 2024").await;

    let video = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(video.status, "processing");
    assert_eq!(video.processing_status, "pending");
    assert_eq!(video.processing_progress, 0);
    assert!(video.slug.starts_with("summer-trip-2024-"));
    assert_eq!(h.queue.ready_envelopes().await, vec![JobEnvelope::encode(id)]);
}

#[tokio::test]
async fn operator_ingested_file_resolves_from_the_upload_root() {
    let h = Harness::new(ScriptedRunner::new(1280, 720, Some(10.0)));
    let nested = h.config.storage.upload_path.join("batch/clip.mp4");
    std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
    std::fs::write(&nested, b"not really a video").unwrap();
    let layout = StorageLayout::new(&h.config.storage.upload_path, &h.config.storage.media_root);

    let temp_video_file = layout.source_reference(&nested).await.unwrap();
    assert_eq!(temp_video_file, "batch/clip.mp4");
    let video = register_upload(
        h.store.as_ref(),
        h.queue.as_ref(),
        UploadRequest {
            title: "From the shell".into(),
            description: None,
            creator_id: Uuid::new_v4(),
            temp_video_file,
        },
    )
    .await
    .unwrap();

    let outcome = h.orchestrator.process_video(video.id).await.unwrap();
    assert!(
        matches!(outcome, video_pipeline::services::ProcessOutcome::Ready(_)),
        "{outcome:?}"
    );
    assert!(!nested.exists());
}

#[tokio::test]
async fn sweep_resets_only_stale_videos() {
    let h = Harness::new(ScriptedRunner::new(1280, 720, Some(10.0)));
    let stale = h.upload("Stale").await;
    let live = h.upload("Live").await;
    let now = Utc::now().naive_utc();
    for id in [stale, live] {
        h.store
            .claim(id, Uuid::new_v4(), now - chrono::Duration::minutes(30))
            .await
            .unwrap();
    }
    h.store
        .set_updated_at(stale, now - chrono::Duration::hours(1))
        .await
        .unwrap();

    let report = h.orchestrator.sweep(Duration::from_secs(1800)).await.unwrap();
    assert_eq!(report.reset, vec![stale]);

    let reset = h.store.find(stale).await.unwrap().unwrap();
    assert_eq!(reset.processing_status, "pending");
    assert!(reset.claim_token.is_none());
    assert!(reset
        .processing_error
        .unwrap()
        .contains("reset by stuck-video sweep"));
    let untouched = h.store.find(live).await.unwrap().unwrap();
    assert_eq!(untouched.processing_status, "processing");

    let queued = h.queue.ready_envelopes().await;
    assert_eq!(queued.last(), Some(&JobEnvelope::encode(stale)));
}

#[tokio::test]
async fn deliveries_are_acknowledged_after_terminal_outcomes() {
    let h = Harness::new(ScriptedRunner::new(1280, 720, Some(10.0)));
    let id = h.upload("Handled").await;

    let delivery = h.queue.receive(Duration::from_millis(50)).await.unwrap().unwrap();
    assert_eq!(h.orchestrator.handle(&delivery).await, Disposition::Ack);
    let video = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(video.processing_status, "ready");

    let unknown = Delivery {
        receipt: 99,
        deliveries: 1,
        envelope: JobEnvelope::encode(Uuid::new_v4()),
    };
    assert_eq!(h.orchestrator.handle(&unknown).await, Disposition::Ack);

    let sweep = Delivery {
        receipt: 100,
        deliveries: 1,
        envelope: JobEnvelope::check_stuck(Duration::from_secs(1800)),
    };
    assert_eq!(h.orchestrator.handle(&sweep).await, Disposition::Ack);
}

#[tokio::test]
async fn failed_video_can_be_reprocessed() {
    let runner = ScriptedRunner::new(1280, 720, Some(10.0));
    runner.fail_probe(common::Failure::Exit(1));
    let h = Harness::new(runner);
    let id = h.upload("Second chance").await;
    h.orchestrator.process_video(id).await.unwrap();

    let ready = h.upload("Fine").await;
    assert_eq!(
        reprocess(h.store.as_ref(), h.queue.as_ref(), ready).await.unwrap(),
        ReprocessOutcome::NotFailed
    );
    assert_eq!(
        reprocess(h.store.as_ref(), h.queue.as_ref(), Uuid::new_v4())
            .await
            .unwrap(),
        ReprocessOutcome::NotFound
    );

    assert_eq!(
        reprocess(h.store.as_ref(), h.queue.as_ref(), id).await.unwrap(),
        ReprocessOutcome::Requeued
    );
    let video = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(video.processing_status, "pending");
    assert_eq!(video.retry_count, 0);
    assert_eq!(
        h.queue.ready_envelopes().await.last(),
        Some(&JobEnvelope::encode(id))
    );
}

#[tokio::test]
async fn worker_pool_drains_the_queue_and_stops_on_shutdown() {
    let h = Harness::with_config(ScriptedRunner::new(1920, 1080, Some(10.0)), |config| {
        config.worker.concurrency = 2;
    });
    let ids = vec![
        h.upload("One").await,
        h.upload("Two").await,
        h.upload("Three").await,
    ];

    let (tx, rx) = watch::channel(false);
    let pool = WorkerPool::new(h.orchestrator.clone(), h.queue.clone(), h.config.worker.clone());
    let running = tokio::spawn(async move { pool.run(rx).await });

    let started = tokio::time::Instant::now();
    loop {
        let mut ready = 0;
        for id in &ids {
            let video = h.store.find(*id).await.unwrap().unwrap();
            if video.processing_status == "ready" {
                ready += 1;
            }
        }
        if ready == ids.len() {
            break;
        }
        assert!(started.elapsed() < Duration::from_secs(10), "pool did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("pool did not stop")
        .unwrap();
    assert_eq!(h.queue.in_flight_len().await, 0);
    assert_eq!(ScriptedRunner::count(&h.runner.probes), 3);
}
