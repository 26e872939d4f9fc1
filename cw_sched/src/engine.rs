//! ABOUTME: Engine facade wiring registry, slot pools, streams and detection jobs
//! ABOUTME: Entry point used by the binary and by end-to-end tests

use std::sync::Arc;

use cw_core::{CameraId, Error, Id, Result};
use cw_db::{
    Camera, CameraStore, Db, DetectionFilter, DetectionResult, DetectionStore, JobStore,
    MemoryCameraStore, MemoryDetectionStore, MemoryJobStore, MemorySessionStore, NewCamera,
    SessionRecord, SessionStore, UpdateCamera,
};
use cw_notify::NotificationSink;
use cw_storage::ImageStore;
use cw_vision::{FaceDetector, Frame, FrameSource};
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::jobs::{
    AutomaticStatus, DetectionJob, DetectionJobManager, JobConfig, JobDependencies,
    OneShotDetection,
};
use crate::metrics::EngineMetrics;
use crate::registry::CameraRegistry;
use crate::slots::{SlotPool, SlotUtilization};
use crate::stream::{StreamConfig, StreamSession, StreamSessionManager};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub streaming_slots: usize,
    pub detection_slots: usize,
    pub stream: StreamConfig,
    pub jobs: JobConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            streaming_slots: 20,
            detection_slots: 20,
            stream: StreamConfig::default(),
            jobs: JobConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.streaming_slots == 0 || self.detection_slots == 0 {
            return Err(Error::Config("Slot pools need at least one slot".into()));
        }
        if self.jobs.batch_size == 0 {
            return Err(Error::Config("Automatic batch size must be positive".into()));
        }
        if self.jobs.poll_interval.is_zero() || self.stream.frame_interval.is_zero() {
            return Err(Error::Config("Polling intervals must be positive".into()));
        }
        Ok(())
    }
}

/// Persistence behind the engine
#[derive(Clone)]
pub struct EngineStores {
    pub cameras: Arc<dyn CameraStore>,
    pub results: Arc<dyn DetectionStore>,
    pub jobs: Arc<dyn JobStore>,
    pub sessions: Arc<dyn SessionStore>,
}

impl EngineStores {
    pub fn from_db(db: &Db) -> Self {
        Self {
            cameras: Arc::new(db.cameras()),
            results: Arc::new(db.detections()),
            jobs: Arc::new(db.jobs()),
            sessions: Arc::new(db.sessions()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            cameras: Arc::new(MemoryCameraStore::new()),
            results: Arc::new(MemoryDetectionStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
        }
    }
}

/// Frame, detection, image and notification capabilities
#[derive(Clone)]
pub struct EngineCapabilities {
    pub frames: Arc<dyn FrameSource>,
    pub detector: Arc<dyn FaceDetector>,
    pub images: Arc<dyn ImageStore>,
    pub sink: Arc<dyn NotificationSink>,
}

/// The scheduling engine. Clones share state.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<CameraRegistry>,
    slots: SlotPool,
    streams: StreamSessionManager,
    jobs: DetectionJobManager,
    results: Arc<dyn DetectionStore>,
    metrics: EngineMetrics,
}

impl Engine {
    /// Load the registry and recover from an unclean stop: persisted camera
    /// statuses reset to idle, unfinished jobs are marked aborted and open
    /// stream sessions are marked stopped.
    #[instrument(skip_all)]
    pub async fn start(
        config: EngineConfig,
        stores: EngineStores,
        capabilities: EngineCapabilities,
    ) -> Result<Self> {
        config.validate()?;

        let aborted = stores.jobs.abort_unfinished().await?;
        if aborted > 0 {
            info!(count = aborted, "Marked jobs from the previous run as aborted");
        }
        let closed = stores.sessions.close_open().await?;
        if closed > 0 {
            info!(count = closed, "Marked stream sessions from the previous run as stopped");
        }
        let registry = Arc::new(CameraRegistry::load(stores.cameras).await?);

        let metrics = EngineMetrics::new();
        let slots = SlotPool::with_metrics(
            config.streaming_slots,
            config.detection_slots,
            metrics.clone(),
        );

        let streams = StreamSessionManager::new(
            registry.clone(),
            slots.clone(),
            capabilities.frames.clone(),
            stores.sessions,
            config.stream.clone(),
            metrics.clone(),
        );
        let jobs = DetectionJobManager::new(
            registry.clone(),
            slots.clone(),
            JobDependencies {
                frames: capabilities.frames,
                detector: capabilities.detector,
                results: stores.results.clone(),
                images: capabilities.images,
                history: stores.jobs,
                sink: capabilities.sink,
            },
            config.jobs.clone(),
            metrics.clone(),
        );

        info!(
            streaming_slots = config.streaming_slots,
            detection_slots = config.detection_slots,
            cameras = registry.len().await,
            "Scheduling engine started"
        );

        Ok(Self {
            registry,
            slots,
            streams,
            jobs,
            results: stores.results,
            metrics,
        })
    }

    pub fn registry(&self) -> &Arc<CameraRegistry> {
        &self.registry
    }

    pub fn streams(&self) -> &StreamSessionManager {
        &self.streams
    }

    pub fn jobs(&self) -> &DetectionJobManager {
        &self.jobs
    }

    pub async fn add_camera(&self, camera: NewCamera) -> Result<Camera> {
        self.registry.add(camera).await
    }

    pub async fn update_camera(&self, id: CameraId, update: UpdateCamera) -> Result<Camera> {
        self.registry.update(id, update).await
    }

    /// Delete an idle camera
    pub async fn remove_camera(&self, id: CameraId) -> Result<()> {
        self.registry.remove(id).await
    }

    pub async fn get_camera(&self, id: CameraId) -> Result<Camera> {
        self.registry.get(id).await
    }

    pub async fn list_cameras(&self) -> Vec<Camera> {
        self.registry.list().await
    }

    pub async fn start_stream(&self, camera_id: CameraId) -> Result<StreamSession> {
        self.streams.start_stream(camera_id).await
    }

    pub async fn stop_stream(&self, camera_id: CameraId) -> Result<()> {
        self.streams.stop_stream(camera_id).await
    }

    pub fn list_active_streams(&self) -> Vec<StreamSession> {
        self.streams.list_active()
    }

    pub fn subscribe_frames(&self, camera_id: CameraId) -> Result<broadcast::Receiver<Frame>> {
        self.streams.subscribe(camera_id)
    }

    /// Recorded stream sessions, newest first
    pub async fn session_history(
        &self,
        camera_id: Option<CameraId>,
        limit: i64,
    ) -> Result<Vec<SessionRecord>> {
        self.streams.history(camera_id, limit).await
    }

    pub async fn schedule_manual(
        &self,
        camera_ids: &[CameraId],
        window_minutes: u32,
    ) -> Result<DetectionJob> {
        self.jobs.schedule_manual(camera_ids, window_minutes).await
    }

    pub async fn schedule_automatic(&self) -> Result<DetectionJob> {
        self.jobs.schedule_automatic().await
    }

    /// Detect once on one camera right away, storing any face as a test result
    pub async fn detect_once(&self, camera_id: CameraId) -> Result<OneShotDetection> {
        self.jobs.detect_once(camera_id).await
    }

    pub async fn stop_automatic(&self) -> Result<Option<DetectionJob>> {
        self.jobs.stop_automatic().await
    }

    pub async fn abort_job(&self, job_id: &Id) -> Result<DetectionJob> {
        self.jobs.abort(job_id).await
    }

    pub async fn get_job(&self, job_id: &Id) -> Result<DetectionJob> {
        self.jobs.get_job(job_id).await
    }

    pub fn list_jobs(&self) -> Vec<DetectionJob> {
        self.jobs.list_jobs()
    }

    pub async fn automatic_status(&self) -> AutomaticStatus {
        self.jobs.automatic_status().await
    }

    pub async fn list_results(&self, filter: &DetectionFilter) -> Result<Vec<DetectionResult>> {
        self.results.list(filter).await
    }

    pub async fn count_results(&self, filter: &DetectionFilter) -> Result<i64> {
        self.results.count(filter).await
    }

    pub fn utilization(&self) -> SlotUtilization {
        self.slots.utilization()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Abort every running job and stop every stream
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let aborted = self.jobs.shutdown().await;
        let stopped = self.streams.stop_all().await;
        info!(aborted, stopped, "Scheduling engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_core::PoolKind;
    use cw_storage::ObjectImageStore;
    use test_support::{sample_cameras, AlwaysFaceDetector, RecordingSink, ScriptedFrameSource};

    async fn engine_with(config: EngineConfig, cameras: usize) -> Engine {
        let capabilities = EngineCapabilities {
            frames: Arc::new(ScriptedFrameSource::new()),
            detector: Arc::new(AlwaysFaceDetector),
            images: Arc::new(ObjectImageStore::in_memory()),
            sink: Arc::new(RecordingSink::new()),
        };
        let engine = Engine::start(config, EngineStores::in_memory(), capabilities)
            .await
            .unwrap();
        for camera in sample_cameras(cameras) {
            engine.add_camera(camera).await.unwrap();
        }
        engine
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let config = EngineConfig {
            detection_slots: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.jobs.batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let engine = engine_with(EngineConfig::default(), 30).await;
        let ids: Vec<CameraId> = engine.list_cameras().await.iter().map(|c| c.id).collect();

        for id in &ids[..5] {
            engine.start_stream(*id).await.unwrap();
        }
        engine.schedule_manual(&ids[5..15], 10).await.unwrap();
        assert_eq!(engine.utilization().streaming.in_use, 5);
        assert_eq!(engine.utilization().detection.in_use, 10);

        engine.shutdown().await;

        assert_eq!(engine.slots.in_use(PoolKind::Streaming), 0);
        assert_eq!(engine.slots.in_use(PoolKind::Detection), 0);
        assert!(engine.list_active_streams().is_empty());
        assert!(matches!(
            engine.schedule_manual(&ids[..1], 1).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_utilization_serializes_for_health_checks() {
        let engine = engine_with(EngineConfig::default(), 3).await;
        let id = engine.list_cameras().await[0].id;
        engine.start_stream(id).await.unwrap();

        let value = serde_json::to_value(engine.utilization()).unwrap();
        assert_eq!(value["streaming"]["in_use"], 1);
        assert_eq!(value["streaming"]["available"], 19);
        assert_eq!(value["detection"]["capacity"], 20);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_aborts_unfinished_jobs() {
        let stores = EngineStores::in_memory();
        let record = cw_db::JobRecord {
            id: Id::new(),
            mode: cw_db::JobMode::Manual,
            target_camera_ids: vec![CameraId::new(1)],
            window_start: cw_core::utc_now(),
            window_end: cw_core::utc_now(),
            status: cw_db::JobStatus::Running,
            created_at: cw_core::utc_now(),
            finished_at: None,
        };
        stores.jobs.record(&record).await.unwrap();

        let capabilities = EngineCapabilities {
            frames: Arc::new(ScriptedFrameSource::new()),
            detector: Arc::new(AlwaysFaceDetector),
            images: Arc::new(ObjectImageStore::in_memory()),
            sink: Arc::new(RecordingSink::new()),
        };
        let engine = Engine::start(EngineConfig::default(), stores, capabilities)
            .await
            .unwrap();

        let job = engine.get_job(&record.id).await.unwrap();
        assert_eq!(job.status, cw_db::JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_startup_stops_open_sessions() {
        let stores = EngineStores::in_memory();
        let record = SessionRecord {
            session_id: uuid::Uuid::new_v4(),
            camera_id: CameraId::new(1),
            started_at: cw_core::utc_now(),
            ended_at: None,
            status: cw_db::SessionStatus::Error,
        };
        stores.sessions.record(&record).await.unwrap();

        let capabilities = EngineCapabilities {
            frames: Arc::new(ScriptedFrameSource::new()),
            detector: Arc::new(AlwaysFaceDetector),
            images: Arc::new(ObjectImageStore::in_memory()),
            sink: Arc::new(RecordingSink::new()),
        };
        let engine = Engine::start(EngineConfig::default(), stores, capabilities)
            .await
            .unwrap();

        let history = engine.session_history(None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, cw_db::SessionStatus::Stopped);
        assert!(history[0].ended_at.is_some());
    }
}
