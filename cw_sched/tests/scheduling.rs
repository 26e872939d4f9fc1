//! ABOUTME: End-to-end scheduling tests on a paused tokio clock
//! ABOUTME: Slot limits, job windows, aborts, capability failures and automatic cycling

use std::sync::Arc;
use std::time::Duration;

use cw_core::{CameraId, Error, PoolKind};
use cw_db::{
    CameraStatus, DetectionFilter, JobMode, JobStatus, JobStore, MemoryCameraStore, MemoryJobStore,
};
use cw_sched::{CapacityPolicy, Engine, EngineCapabilities, EngineConfig, EngineStores};
use cw_storage::ObjectImageStore;
use cw_vision::FaceDetector;
use test_support::{
    sample_cameras, AlwaysFaceDetector, FailingDetector, NeverFaceDetector, RecordingSink,
    ScriptedFrameSource, SlowCameraStore, SlowJobStore,
};

struct Harness {
    engine: Engine,
    source: Arc<ScriptedFrameSource>,
    sink: Arc<RecordingSink>,
    ids: Vec<CameraId>,
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.jobs.poll_interval = Duration::from_secs(2);
    config.jobs.detection_timeout = Duration::from_secs(1);
    config.jobs.cycle_duration = Duration::from_secs(60);
    config.jobs.capacity_retry = Duration::from_secs(5);
    config.jobs.auto_continue = false;
    config
}

async fn harness_with(
    config: EngineConfig,
    cameras: usize,
    detector: Arc<dyn FaceDetector>,
) -> Harness {
    harness_from(config, EngineStores::in_memory(), cameras, detector).await
}

async fn harness_from(
    config: EngineConfig,
    stores: EngineStores,
    cameras: usize,
    detector: Arc<dyn FaceDetector>,
) -> Harness {
    let source = Arc::new(ScriptedFrameSource::new());
    let sink = Arc::new(RecordingSink::new());
    let capabilities = EngineCapabilities {
        frames: source.clone(),
        detector,
        images: Arc::new(ObjectImageStore::in_memory()),
        sink: sink.clone(),
    };
    let engine = Engine::start(config, stores, capabilities)
        .await
        .unwrap();

    let mut ids = Vec::with_capacity(cameras);
    for camera in sample_cameras(cameras) {
        ids.push(engine.add_camera(camera).await.unwrap().id);
    }
    Harness {
        engine,
        source,
        sink,
        ids,
    }
}

async fn harness(cameras: usize) -> Harness {
    harness_with(config(), cameras, Arc::new(AlwaysFaceDetector)).await
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn results_for(engine: &Engine, camera_id: CameraId) -> i64 {
    engine
        .count_results(&DetectionFilter::for_camera(camera_id))
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_manual_job_rejects_bad_requests() {
    let h = harness(5).await;

    for minutes in [0, 121] {
        match h.engine.schedule_manual(&h.ids[..2], minutes).await {
            Err(Error::WindowOutOfRange { minutes: m, min, max }) => {
                assert_eq!((m, min, max), (minutes, 1, 120));
            }
            other => panic!("expected WindowOutOfRange, got {:?}", other),
        }
    }
    assert!(matches!(
        h.engine.schedule_manual(&[], 5).await,
        Err(Error::EmptySet)
    ));
    assert!(matches!(
        h.engine.schedule_manual(&[CameraId::new(999)], 5).await,
        Err(Error::NotFound(_))
    ));

    assert_eq!(h.engine.utilization().detection.in_use, 0);
    assert!(h.engine.list_jobs().is_empty());

    assert!(h.engine.schedule_manual(&h.ids[..1], 1).await.is_ok());
    assert!(h.engine.schedule_manual(&h.ids[1..2], 120).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_manual_job_runs_for_its_window() {
    let h = harness(5).await;
    let targets = &h.ids[..3];

    let job = h.engine.schedule_manual(targets, 1).await.unwrap();
    assert_eq!(job.mode, JobMode::Manual);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.target_camera_ids, targets.to_vec());
    assert_eq!(job.held_slots, 3);
    assert_eq!(job.window_end - job.window_start, chrono::Duration::minutes(1));
    assert_eq!(h.engine.utilization().detection.in_use, 3);
    for id in targets {
        assert_eq!(
            h.engine.get_camera(*id).await.unwrap().status,
            CameraStatus::Detecting
        );
    }

    advance(30).await;
    assert_eq!(
        h.engine.get_job(&job.id).await.unwrap().status,
        JobStatus::Running
    );

    advance(31).await;
    let finished = h.engine.get_job(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.held_slots, 0);
    assert!(finished.finished_at.is_some());
    assert_eq!(h.engine.utilization().detection.in_use, 0);

    for id in targets {
        assert_eq!(h.engine.get_camera(*id).await.unwrap().status, CameraStatus::Idle);
        assert!(results_for(&h.engine, *id).await > 0);
    }
    assert_eq!(results_for(&h.engine, h.ids[4]).await, 0);
    assert_eq!(
        h.sink.job_states(&job.id),
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
    );
    assert_eq!(finished.detections as usize, h.sink.detections().len());
}

#[tokio::test(start_paused = true)]
async fn test_results_are_newest_first_and_strictly_ordered_per_camera() {
    let h = harness(2).await;
    h.engine.schedule_manual(&h.ids, 1).await.unwrap();
    advance(61).await;

    let results = h
        .engine
        .list_results(&DetectionFilter::for_camera(h.ids[0]).page(100, 0))
        .await
        .unwrap();
    assert!(results.len() > 2);
    for pair in results.windows(2) {
        assert!(pair[0].detected_at > pair[1].detected_at);
    }
    assert!(results.iter().all(|r| r.face_count == 1));
    assert!(results.iter().all(|r| r.image_reference.ends_with(".jpg")));
}

#[tokio::test(start_paused = true)]
async fn test_failing_camera_does_not_block_the_rest() {
    let h = harness(20).await;
    h.source.fail_camera(h.ids[0]);

    let job = h.engine.schedule_manual(&h.ids, 1).await.unwrap();
    assert_eq!(job.held_slots, 20);
    advance(61).await;

    assert_eq!(
        h.engine.get_job(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(results_for(&h.engine, h.ids[0]).await, 0);
    for id in &h.ids[1..] {
        assert!(results_for(&h.engine, *id).await > 0, "no results for {}", id);
    }
    assert_eq!(h.engine.utilization().detection.in_use, 0);

    let metrics = h.engine.metrics().encode().unwrap();
    assert!(metrics.contains("camwatch_capability_failures_total"));
}

#[tokio::test(start_paused = true)]
async fn test_detector_failure_is_per_camera() {
    let h = harness_with(
        config(),
        4,
        Arc::new(FailingDetector::for_cameras([CameraId::new(2)])),
    )
    .await;
    h.engine.schedule_manual(&h.ids, 1).await.unwrap();
    advance(61).await;

    assert_eq!(results_for(&h.engine, CameraId::new(2)).await, 0);
    assert!(results_for(&h.engine, CameraId::new(1)).await > 0);
    assert!(results_for(&h.engine, CameraId::new(3)).await > 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_camera_times_out_without_stalling_others() {
    let h = harness(3).await;
    h.source.delay_camera(h.ids[0], Duration::from_secs(30));

    h.engine.schedule_manual(&h.ids, 1).await.unwrap();
    advance(61).await;

    assert_eq!(results_for(&h.engine, h.ids[0]).await, 0);
    let fast = results_for(&h.engine, h.ids[1]).await;
    assert!(fast >= 10, "only {} results for a responsive camera", fast);
}

#[tokio::test(start_paused = true)]
async fn test_no_faces_means_no_results() {
    let h = harness_with(config(), 3, Arc::new(NeverFaceDetector)).await;
    let job = h.engine.schedule_manual(&h.ids, 1).await.unwrap();
    advance(61).await;

    assert_eq!(
        h.engine.get_job(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(
        h.engine
            .count_results(&DetectionFilter::default())
            .await
            .unwrap(),
        0
    );
    assert!(h.sink.detections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partial_capacity_runs_reduced_job() {
    let h = harness(40).await;
    h.engine.schedule_manual(&h.ids[..15], 10).await.unwrap();

    let job = h.engine.schedule_manual(&h.ids[15..25], 10).await.unwrap();
    assert_eq!(job.target_camera_ids, h.ids[15..20].to_vec());
    assert_eq!(job.skipped_camera_ids, h.ids[20..25].to_vec());
    assert_eq!(h.engine.utilization().detection.in_use, 20);
    assert_eq!(h.engine.utilization().detection.available, 0);

    match h.engine.schedule_manual(&h.ids[30..32], 10).await {
        Err(Error::CapacityExceeded {
            pool,
            in_use,
            capacity,
        }) => {
            assert_eq!(pool, PoolKind::Detection);
            assert_eq!((in_use, capacity), (20, 20));
        }
        other => panic!("expected CapacityExceeded, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_or_nothing_rejects_and_rolls_back() {
    let mut config = config();
    config.jobs.capacity_policy = CapacityPolicy::AllOrNothing;
    let h = harness_with(config, 40, Arc::new(AlwaysFaceDetector)).await;

    h.engine.schedule_manual(&h.ids[..15], 10).await.unwrap();
    assert!(matches!(
        h.engine.schedule_manual(&h.ids[15..25], 10).await,
        Err(Error::CapacityExceeded { .. })
    ));
    assert_eq!(h.engine.utilization().detection.in_use, 15);
    for id in &h.ids[15..25] {
        assert_eq!(h.engine.get_camera(*id).await.unwrap().status, CameraStatus::Idle);
    }

    let job = h.engine.schedule_manual(&h.ids[15..20], 10).await.unwrap();
    assert!(job.skipped_camera_ids.is_empty());
    assert_eq!(h.engine.utilization().detection.in_use, 20);
}

#[tokio::test(start_paused = true)]
async fn test_abort_releases_slots_immediately() {
    let h = harness(20).await;
    let job = h.engine.schedule_manual(&h.ids, 60).await.unwrap();
    advance(5).await;
    assert_eq!(h.engine.utilization().detection.available, 0);

    let aborted = h.engine.abort_job(&job.id).await.unwrap();
    assert_eq!(aborted.status, JobStatus::Aborted);
    assert_eq!(aborted.held_slots, 0);
    assert_eq!(h.engine.utilization().detection.available, 20);
    for id in &h.ids {
        assert_eq!(h.engine.get_camera(*id).await.unwrap().status, CameraStatus::Idle);
    }

    let before = h
        .engine
        .count_results(&DetectionFilter::for_job(job.id.clone()))
        .await
        .unwrap();
    advance(30).await;
    let after = h
        .engine
        .count_results(&DetectionFilter::for_job(job.id.clone()))
        .await
        .unwrap();
    assert_eq!(before, after);

    let again = h.engine.abort_job(&job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Aborted);
    assert_eq!(again.finished_at, aborted.finished_at);
    assert_eq!(
        h.sink.job_states(&job.id),
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Aborted]
    );

    assert!(matches!(
        h.engine.abort_job(&cw_core::Id::new()).await,
        Err(Error::NotFound(_))
    ));
}

fn slow_history(status: JobStatus) -> (EngineStores, Arc<MemoryJobStore>) {
    let history = Arc::new(MemoryJobStore::new());
    let mut stores = EngineStores::in_memory();
    stores.jobs = Arc::new(
        SlowJobStore::new(history.clone(), Duration::from_millis(50)).slow(status),
    );
    (stores, history)
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_running_write_stays_aborted() {
    let (stores, history) = slow_history(JobStatus::Running);
    let h = harness_from(config(), stores, 3, Arc::new(AlwaysFaceDetector)).await;

    let job = h.engine.schedule_manual(&h.ids[..2], 1).await.unwrap();
    tokio::task::yield_now().await;
    let aborted = h.engine.abort_job(&job.id).await.unwrap();
    assert_eq!(aborted.status, JobStatus::Aborted);
    advance(1).await;

    let persisted = history.get(&job.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, JobStatus::Aborted);
    assert_eq!(
        h.engine.get_job(&job.id).await.unwrap().status,
        JobStatus::Aborted
    );
    let states = h.sink.job_states(&job.id);
    assert_eq!(states.first(), Some(&JobStatus::Pending));
    assert_eq!(states.last(), Some(&JobStatus::Aborted));
    assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);
    assert_eq!(h.engine.utilization().detection.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_job_launched_during_shutdown_is_aborted() {
    let (stores, history) = slow_history(JobStatus::Pending);
    let h = harness_from(config(), stores, 3, Arc::new(AlwaysFaceDetector)).await;

    let engine = h.engine.clone();
    let targets = h.ids[..2].to_vec();
    let scheduling = tokio::spawn(async move { engine.schedule_manual(&targets, 1).await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    h.engine.shutdown().await;

    let job = scheduling.await.unwrap().unwrap();
    advance(1).await;

    assert_eq!(
        history.get(&job.id).await.unwrap().unwrap().status,
        JobStatus::Aborted
    );
    assert_eq!(
        h.engine.get_job(&job.id).await.unwrap().status,
        JobStatus::Aborted
    );
    assert_eq!(h.engine.utilization().detection.in_use, 0);
    for id in &h.ids[..2] {
        assert_eq!(h.engine.get_camera(*id).await.unwrap().status, CameraStatus::Idle);
    }
    assert_eq!(
        h.sink.job_states(&job.id),
        vec![JobStatus::Pending, JobStatus::Aborted]
    );
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_jobs_share_a_camera() {
    let h = harness(4).await;
    let first = h.engine.schedule_manual(&h.ids[..2], 1).await.unwrap();
    let second = h.engine.schedule_manual(&h.ids[1..3], 2).await.unwrap();
    assert_eq!(h.engine.utilization().detection.in_use, 4);

    h.engine.abort_job(&first.id).await.unwrap();
    assert_eq!(
        h.engine.get_camera(h.ids[1]).await.unwrap().status,
        CameraStatus::Detecting
    );
    assert_eq!(
        h.engine.get_camera(h.ids[0]).await.unwrap().status,
        CameraStatus::Idle
    );

    advance(121).await;
    assert_eq!(
        h.engine.get_job(&second.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(
        h.engine.get_camera(h.ids[1]).await.unwrap().status,
        CameraStatus::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_streaming_and_detection_pools_are_independent() {
    let h = harness(40).await;
    for id in &h.ids[..20] {
        h.engine.start_stream(*id).await.unwrap();
    }
    assert!(matches!(
        h.engine.start_stream(h.ids[20]).await,
        Err(Error::CapacityExceeded {
            pool: PoolKind::Streaming,
            ..
        })
    ));

    let job = h.engine.schedule_manual(&h.ids[..20], 5).await.unwrap();
    assert_eq!(job.held_slots, 20);
    assert_eq!(
        h.engine.get_camera(h.ids[0]).await.unwrap().status,
        CameraStatus::StreamingAndDetecting
    );

    h.engine.stop_stream(h.ids[0]).await.unwrap();
    assert_eq!(
        h.engine.get_camera(h.ids[0]).await.unwrap().status,
        CameraStatus::Detecting
    );
    assert_eq!(h.engine.utilization().streaming.in_use, 19);
    assert_eq!(h.engine.utilization().detection.in_use, 20);
}

#[tokio::test(start_paused = true)]
async fn test_remove_requires_idle_camera() {
    let h = harness(3).await;

    h.engine.start_stream(h.ids[0]).await.unwrap();
    assert!(matches!(
        h.engine.remove_camera(h.ids[0]).await,
        Err(Error::InvalidState(_))
    ));
    h.engine.stop_stream(h.ids[0]).await.unwrap();
    h.engine.remove_camera(h.ids[0]).await.unwrap();
    assert!(matches!(
        h.engine.get_camera(h.ids[0]).await,
        Err(Error::NotFound(_))
    ));

    let job = h.engine.schedule_manual(&h.ids[1..2], 1).await.unwrap();
    assert!(matches!(
        h.engine.remove_camera(h.ids[1]).await,
        Err(Error::InvalidState(_))
    ));
    h.engine.abort_job(&job.id).await.unwrap();
    h.engine.remove_camera(h.ids[1]).await.unwrap();
    assert_eq!(h.engine.list_cameras().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_automatic_is_a_singleton() {
    let h = harness(50).await;

    let first = h.engine.schedule_automatic().await.unwrap();
    assert_eq!(first.mode, JobMode::Automatic);
    assert_eq!(first.target_camera_ids, h.ids[..20].to_vec());
    assert!(matches!(
        h.engine.schedule_automatic().await,
        Err(Error::AlreadyRunning(_))
    ));

    h.engine.abort_job(&first.id).await.unwrap();
    let second = h.engine.schedule_automatic().await.unwrap();
    assert_eq!(second.target_camera_ids, h.ids[20..40].to_vec());

    advance(61).await;
    assert_eq!(
        h.engine.get_job(&second.id).await.unwrap().status,
        JobStatus::Completed
    );
    let third = h.engine.schedule_automatic().await.unwrap();
    assert_eq!(third.target_camera_ids, h.ids[40..50].to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_automatic_batch_skips_cameras_removed_while_claiming() {
    let mut config = config();
    config.jobs.batch_size = 2;
    let mut stores = EngineStores::in_memory();
    stores.cameras = Arc::new(SlowCameraStore::new(
        Arc::new(MemoryCameraStore::new()),
        Duration::from_millis(50),
    ));
    let h = harness_from(config, stores, 4, Arc::new(AlwaysFaceDetector)).await;

    let removals: Vec<_> = h.ids[..2]
        .iter()
        .map(|&id| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.remove_camera(id).await })
        })
        .collect();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let job = h.engine.schedule_automatic().await.unwrap();
    assert_eq!(job.target_camera_ids, h.ids[2..4].to_vec());
    for removal in removals {
        removal.await.unwrap().unwrap();
    }

    let status = h.engine.automatic_status().await;
    assert!(status.enabled);
    assert_eq!(status.current_job, Some(job.id.clone()));
    assert_eq!(h.engine.utilization().detection.in_use, 2);
    assert_eq!(h.engine.list_cameras().await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_automatic_requests_start_one_cycle() {
    let h = harness(50).await;
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.schedule_automatic().await })
        })
        .collect();

    let mut started = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(job) => started.push(job),
            Err(Error::AlreadyRunning(_)) => {}
            Err(e) => panic!("expected AlreadyRunning, got {:?}", e),
        }
    }
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].target_camera_ids, h.ids[..20].to_vec());
    assert_eq!(h.engine.utilization().detection.in_use, 20);
    assert_eq!(
        h.engine.automatic_status().await.current_job,
        Some(started[0].id.clone())
    );
    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_manual_jobs_never_oversubscribe() {
    let h = harness(60).await;
    let handles: Vec<_> = h
        .ids
        .chunks(6)
        .map(|targets| {
            let engine = h.engine.clone();
            let targets = targets.to_vec();
            tokio::spawn(async move { engine.schedule_manual(&targets, 1).await })
        })
        .collect();

    let mut held = 0;
    let mut scheduled = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(job) => {
                assert_eq!(job.held_slots, job.target_camera_ids.len());
                held += job.held_slots;
                scheduled.extend(job.target_camera_ids);
            }
            Err(Error::CapacityExceeded { pool, .. }) => assert_eq!(pool, PoolKind::Detection),
            Err(e) => panic!("expected CapacityExceeded, got {:?}", e),
        }
    }

    assert_eq!(held, 20);
    assert_eq!(h.engine.utilization().detection.in_use, held);
    scheduled.sort();
    scheduled.dedup();
    assert_eq!(scheduled.len(), held);
    for id in &scheduled {
        assert_eq!(
            h.engine.get_camera(*id).await.unwrap().status,
            CameraStatus::Detecting
        );
    }
    h.engine.shutdown().await;
    assert_eq!(h.engine.utilization().detection.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_automatic_cycle_continues_and_wraps() {
    let mut config = config();
    config.jobs.auto_continue = true;
    let h = harness_with(config, 45, Arc::new(AlwaysFaceDetector)).await;

    let first = h.engine.schedule_automatic().await.unwrap();
    assert_eq!(first.target_camera_ids, h.ids[..20].to_vec());

    advance(61).await;
    let status = h.engine.automatic_status().await;
    assert!(status.enabled);
    assert_eq!(status.cursor, 20);
    let second = h
        .engine
        .get_job(&status.current_job.expect("next batch running"))
        .await
        .unwrap();
    assert_eq!(second.target_camera_ids, h.ids[20..40].to_vec());

    advance(60).await;
    let status = h.engine.automatic_status().await;
    assert_eq!(status.cursor, 40);
    let third = h
        .engine
        .get_job(status.current_job.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(third.target_camera_ids, h.ids[40..45].to_vec());

    advance(60).await;
    let status = h.engine.automatic_status().await;
    assert_eq!(status.cursor, 0);
    let fourth = h
        .engine
        .get_job(status.current_job.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(fourth.target_camera_ids, h.ids[..20].to_vec());
    assert!(h
        .engine
        .metrics()
        .encode()
        .unwrap()
        .contains("camwatch_cycles_completed_total 1"));

    let stopped = h.engine.stop_automatic().await.unwrap().unwrap();
    assert_eq!(stopped.id, fourth.id);
    assert_eq!(stopped.status, JobStatus::Aborted);
    let status = h.engine.automatic_status().await;
    assert!(!status.enabled);
    assert!(status.current_job.is_none());
    assert_eq!(status.cursor, 20);
    assert_eq!(h.engine.utilization().detection.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_automatic_batch_shrinks_to_free_slots() {
    let h = harness(40).await;
    h.engine.schedule_manual(&h.ids[20..35], 10).await.unwrap();

    let batch = h.engine.schedule_automatic().await.unwrap();
    assert_eq!(batch.target_camera_ids, h.ids[..5].to_vec());
    assert!(batch.skipped_camera_ids.is_empty());

    h.engine.abort_job(&batch.id).await.unwrap();
    assert_eq!(h.engine.automatic_status().await.cursor, 5);
}

#[tokio::test(start_paused = true)]
async fn test_automatic_without_capacity_or_cameras() {
    let empty = harness(0).await;
    assert!(matches!(
        empty.engine.schedule_automatic().await,
        Err(Error::EmptySet)
    ));

    let h = harness(30).await;
    h.engine.schedule_manual(&h.ids[..20], 10).await.unwrap();
    assert!(matches!(
        h.engine.schedule_automatic().await,
        Err(Error::CapacityExceeded { .. })
    ));
    let status = h.engine.automatic_status().await;
    assert!(!status.enabled);
    assert_eq!(status.cursor, 0);
}

#[tokio::test(start_paused = true)]
async fn test_detect_once_stores_a_test_result() {
    let h = harness(3).await;

    let outcome = h.engine.detect_once(h.ids[0]).await.unwrap();
    assert_eq!(outcome.camera_id, h.ids[0]);
    assert_eq!(outcome.face_count, 1);
    let result = outcome.result.expect("face found");
    assert!(result.test_mode);
    assert_eq!(result.job_id, outcome.id);

    let stored = h
        .engine
        .list_results(&DetectionFilter::for_camera(h.ids[0]))
        .await
        .unwrap();
    assert_eq!(stored, vec![result.clone()]);
    assert_eq!(h.sink.detections(), vec![result]);
    assert!(matches!(
        h.engine.get_job(&outcome.id).await,
        Err(Error::NotFound(_))
    ));

    assert_eq!(h.engine.utilization().detection.in_use, 0);
    assert_eq!(
        h.engine.get_camera(h.ids[0]).await.unwrap().status,
        CameraStatus::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_detect_once_without_faces_stores_nothing() {
    let h = harness_with(config(), 2, Arc::new(NeverFaceDetector)).await;

    let outcome = h.engine.detect_once(h.ids[1]).await.unwrap();
    assert_eq!(outcome.face_count, 0);
    assert!(outcome.result.is_none());
    assert_eq!(results_for(&h.engine, h.ids[1]).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_detect_once_failures_release_the_slot() {
    let h = harness(21).await;

    assert!(matches!(
        h.engine.detect_once(CameraId::new(999)).await,
        Err(Error::NotFound(_))
    ));

    h.source.fail_camera(h.ids[0]);
    assert!(matches!(
        h.engine.detect_once(h.ids[0]).await,
        Err(Error::CapabilityFailure(_))
    ));
    assert_eq!(h.engine.utilization().detection.in_use, 0);
    assert_eq!(
        h.engine.get_camera(h.ids[0]).await.unwrap().status,
        CameraStatus::Idle
    );

    h.source.delay_camera(h.ids[1], Duration::from_secs(5));
    assert!(matches!(
        h.engine.detect_once(h.ids[1]).await,
        Err(Error::CapabilityFailure(_))
    ));
    assert_eq!(h.engine.utilization().detection.in_use, 0);

    h.engine.schedule_manual(&h.ids[1..], 5).await.unwrap();
    assert!(matches!(
        h.engine.detect_once(h.ids[0]).await,
        Err(Error::CapacityExceeded { pool: PoolKind::Detection, .. })
    ));
    assert_eq!(results_for(&h.engine, h.ids[0]).await, 0);
}
