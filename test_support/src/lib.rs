//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Scripted capabilities, recording sinks and camera fixtures for all crates

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cw_core::{utc_now, CameraId, Error, Id, Result};
use cw_db::{
    Camera, CameraStatus, CameraStore, DetectionResult, JobRecord, JobStatus, JobStore, NewCamera,
    UpdateCamera,
};
use cw_notify::{EngineEvent, NotificationSink};
use cw_vision::image::{Rgb, RgbImage};
use cw_vision::{BoundingBox, FaceDetector, Frame, FrameSource};

/// Camera fixtures numbered from 1, laid out like the seeded fleet
pub fn sample_cameras(count: usize) -> Vec<NewCamera> {
    (1..=count).map(sample_camera).collect()
}

pub fn sample_camera(i: usize) -> NewCamera {
    NewCamera::new(
        format!("Camera {}", i),
        format!("192.168.{}.{}", i / 254, i % 254 + 1),
        format!("Zone {}, Room {}", (i - 1) / 20 + 1, (i - 1) % 20 + 1),
    )
}

/// Frame source whose behaviour per camera is set by the test
#[derive(Debug, Default)]
pub struct ScriptedFrameSource {
    failing: Mutex<HashSet<CameraId>>,
    delays: Mutex<HashMap<CameraId, Duration>>,
    calls: Mutex<HashMap<CameraId, u64>>,
}

impl ScriptedFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following fetch for `camera_id` fail
    pub fn fail_camera(&self, camera_id: CameraId) {
        self.failing.lock().unwrap().insert(camera_id);
    }

    pub fn restore_camera(&self, camera_id: CameraId) {
        self.failing.lock().unwrap().remove(&camera_id);
    }

    /// Delay every fetch for `camera_id` by `delay` of tokio time
    pub fn delay_camera(&self, camera_id: CameraId, delay: Duration) {
        self.delays.lock().unwrap().insert(camera_id, delay);
    }

    pub fn calls(&self, camera_id: CameraId) -> u64 {
        self.calls
            .lock()
            .unwrap()
            .get(&camera_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn get_frame(&self, camera_id: CameraId) -> Result<Frame> {
        *self.calls.lock().unwrap().entry(camera_id).or_insert(0) += 1;

        let delay = self.delays.lock().unwrap().get(&camera_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&camera_id) {
            return Err(Error::CapabilityFailure(format!(
                "Camera {} is unreachable",
                camera_id
            )));
        }

        let shade = (camera_id.get() % 200) as u8 + 20;
        let image = RgbImage::from_pixel(64, 48, Rgb([shade, shade, shade]));
        Ok(Frame::new(camera_id, utc_now(), image))
    }
}

/// Reports one face in the middle of every frame
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFaceDetector;

#[async_trait]
impl FaceDetector for AlwaysFaceDetector {
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>> {
        Ok(vec![BoundingBox {
            x: frame.width() / 4,
            y: frame.height() / 4,
            width: frame.width() / 2,
            height: frame.height() / 2,
        }])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFaceDetector;

#[async_trait]
impl FaceDetector for NeverFaceDetector {
    async fn detect_faces(&self, _frame: &Frame) -> Result<Vec<BoundingBox>> {
        Ok(Vec::new())
    }
}

/// Fails for the listed cameras and finds a face everywhere else
#[derive(Debug, Default)]
pub struct FailingDetector {
    cameras: HashSet<CameraId>,
}

impl FailingDetector {
    pub fn for_cameras(cameras: impl IntoIterator<Item = CameraId>) -> Self {
        Self {
            cameras: cameras.into_iter().collect(),
        }
    }
}

#[async_trait]
impl FaceDetector for FailingDetector {
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>> {
        if self.cameras.contains(&frame.camera_id) {
            return Err(Error::CapabilityFailure(format!(
                "Detector crashed on camera {}",
                frame.camera_id
            )));
        }
        AlwaysFaceDetector.detect_faces(frame).await
    }
}

/// Sink that keeps every published event
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn detections(&self) -> Vec<DetectionResult> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::DetectionFound { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Status transitions published for one job, in order
    pub fn job_states(&self, job_id: &Id) -> Vec<JobStatus> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::JobStateChanged { job_id: id, status } if &id == job_id => {
                    Some(status)
                }
                _ => None,
            })
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Job history whose writes of selected statuses stall for a while
pub struct SlowJobStore {
    inner: Arc<dyn JobStore>,
    delay: Duration,
    slow: HashSet<JobStatus>,
}

impl SlowJobStore {
    pub fn new(inner: Arc<dyn JobStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            slow: HashSet::new(),
        }
    }

    /// Delay inserts and updates that write `status`
    pub fn slow(mut self, status: JobStatus) -> Self {
        self.slow.insert(status);
        self
    }

    async fn stall(&self, status: JobStatus) {
        if self.slow.contains(&status) {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl JobStore for SlowJobStore {
    async fn record(&self, job: &JobRecord) -> Result<()> {
        self.stall(job.status).await;
        self.inner.record(job).await
    }

    async fn update_status(&self, id: &Id, status: JobStatus) -> Result<bool> {
        self.stall(status).await;
        self.inner.update_status(id, status).await
    }

    async fn get(&self, id: &Id) -> Result<Option<JobRecord>> {
        self.inner.get(id).await
    }

    async fn list(&self, limit: i64) -> Result<Vec<JobRecord>> {
        self.inner.list(limit).await
    }

    async fn abort_unfinished(&self) -> Result<u64> {
        self.inner.abort_unfinished().await
    }
}

/// Camera store whose deletes stall for a while
pub struct SlowCameraStore {
    inner: Arc<dyn CameraStore>,
    delay: Duration,
}

impl SlowCameraStore {
    pub fn new(inner: Arc<dyn CameraStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl CameraStore for SlowCameraStore {
    async fn insert(&self, camera: NewCamera) -> Result<Camera> {
        self.inner.insert(camera).await
    }

    async fn update(&self, id: CameraId, update: UpdateCamera) -> Result<Camera> {
        self.inner.update(id, update).await
    }

    async fn set_status(&self, id: CameraId, status: CameraStatus) -> Result<()> {
        self.inner.set_status(id, status).await
    }

    async fn delete(&self, id: CameraId) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(id).await
    }

    async fn get(&self, id: CameraId) -> Result<Option<Camera>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Camera>> {
        self.inner.list().await
    }

    async fn reset_statuses(&self) -> Result<u64> {
        self.inner.reset_statuses().await
    }
}

/// Temporary database file path unique to one test
pub fn temp_db_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("camwatch-test-{}.db", Id::new()))
}
