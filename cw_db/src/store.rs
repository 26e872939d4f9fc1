//! ABOUTME: Storage traits consumed by the scheduling engine
//! ABOUTME: Implemented by the SQLite repositories and the in-memory stores

use async_trait::async_trait;
use cw_core::{CameraId, Error, Id, Result};
use uuid::Uuid;

use crate::models::{
    Camera, CameraStatus, DetectionFilter, DetectionResult, JobRecord, JobStatus, NewCamera,
    NewDetection, SessionRecord, SessionStatus, UpdateCamera,
};

#[async_trait]
pub trait CameraStore: Send + Sync {
    /// Insert a validated camera; duplicate addresses are a `Conflict`
    async fn insert(&self, camera: NewCamera) -> Result<Camera>;

    async fn update(&self, id: CameraId, update: UpdateCamera) -> Result<Camera>;

    async fn set_status(&self, id: CameraId, status: CameraStatus) -> Result<()>;

    async fn delete(&self, id: CameraId) -> Result<()>;

    /// Delete a camera whose stored status is idle
    async fn delete_idle(&self, id: CameraId) -> Result<()> {
        let camera = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Camera {} not found", id)))?;
        camera.status.ensure_removable(id)?;
        self.delete(id).await
    }

    async fn get(&self, id: CameraId) -> Result<Option<Camera>>;

    /// All cameras in ascending id order
    async fn list(&self) -> Result<Vec<Camera>>;

    /// Force every camera back to `Idle`, returning how many rows changed
    async fn reset_statuses(&self) -> Result<u64>;
}

/// Append-only detection result log
#[async_trait]
pub trait DetectionStore: Send + Sync {
    async fn append(&self, detection: NewDetection) -> Result<DetectionResult>;

    async fn list(&self, filter: &DetectionFilter) -> Result<Vec<DetectionResult>>;

    async fn count(&self, filter: &DetectionFilter) -> Result<i64>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job record
    async fn record(&self, job: &JobRecord) -> Result<()>;

    /// Move an unfinished job to `status`. A job that already completed or
    /// aborted keeps its row and the call returns false.
    async fn update_status(&self, id: &Id, status: JobStatus) -> Result<bool>;

    async fn get(&self, id: &Id) -> Result<Option<JobRecord>>;

    /// Most recent jobs first
    async fn list(&self, limit: i64) -> Result<Vec<JobRecord>>;

    /// Mark every pending or running job as aborted
    async fn abort_unfinished(&self) -> Result<u64>;
}

/// Stream session history
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn record(&self, session: &SessionRecord) -> Result<()>;

    /// Change an open session's status; `Stopped` also sets `ended_at`.
    /// Returns false for a session that already stopped.
    async fn update_status(&self, session_id: Uuid, status: SessionStatus) -> Result<bool>;

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRecord>>;

    /// Most recent sessions first, optionally for one camera
    async fn list(&self, camera_id: Option<CameraId>, limit: i64) -> Result<Vec<SessionRecord>>;

    /// Stop every session a previous process left open
    async fn close_open(&self) -> Result<u64>;
}
