//! ABOUTME: In-memory store implementations for tests and ephemeral runs
//! ABOUTME: Mirror the SQLite repositories' ordering, conflict and pagination rules

use async_trait::async_trait;
use cw_core::{utc_now, CameraId, Error, Id, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    Camera, CameraStatus, DetectionFilter, DetectionResult, JobRecord, JobStatus, NewCamera,
    NewDetection, SessionRecord, SessionStatus, UpdateCamera,
};
use crate::store::{CameraStore, DetectionStore, JobStore, SessionStore};

#[derive(Debug, Default)]
struct CameraTable {
    last_id: i64,
    rows: BTreeMap<CameraId, Camera>,
}

impl CameraTable {
    fn address_taken(&self, address: &str, except: Option<CameraId>) -> bool {
        self.rows
            .values()
            .any(|c| c.address == address && Some(c.id) != except)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCameraStore {
    table: RwLock<CameraTable>,
}

impl MemoryCameraStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(address: &str) -> Error {
    Error::Conflict(format!("A camera with address '{}' already exists", address))
}

fn not_found(id: CameraId) -> Error {
    Error::NotFound(format!("Camera {} not found", id))
}

#[async_trait]
impl CameraStore for MemoryCameraStore {
    async fn insert(&self, camera: NewCamera) -> Result<Camera> {
        let camera = camera.validated()?;
        let mut table = self.table.write().await;
        if table.address_taken(&camera.address, None) {
            return Err(conflict(&camera.address));
        }

        table.last_id += 1;
        let now = utc_now();
        let row = Camera {
            id: CameraId::new(table.last_id),
            name: camera.name,
            address: camera.address,
            location: camera.location,
            status: CameraStatus::Idle,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update(&self, id: CameraId, update: UpdateCamera) -> Result<Camera> {
        let update = update.validated()?;
        let mut table = self.table.write().await;
        if let Some(address) = &update.address {
            if table.address_taken(address, Some(id)) {
                return Err(conflict(address));
            }
        }
        let camera = table.rows.get_mut(&id).ok_or_else(|| not_found(id))?;
        if !update.is_empty() {
            update.apply_to(camera);
            camera.updated_at = utc_now();
        }
        Ok(camera.clone())
    }

    async fn set_status(&self, id: CameraId, status: CameraStatus) -> Result<()> {
        let mut table = self.table.write().await;
        let camera = table.rows.get_mut(&id).ok_or_else(|| not_found(id))?;
        camera.status = status;
        camera.updated_at = utc_now();
        Ok(())
    }

    async fn delete(&self, id: CameraId) -> Result<()> {
        self.table
            .write()
            .await
            .rows
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }

    async fn get(&self, id: CameraId) -> Result<Option<Camera>> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Camera>> {
        Ok(self.table.read().await.rows.values().cloned().collect())
    }

    async fn reset_statuses(&self) -> Result<u64> {
        let mut table = self.table.write().await;
        let mut changed = 0;
        for camera in table.rows.values_mut() {
            if camera.status != CameraStatus::Idle {
                camera.status = CameraStatus::Idle;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDetectionStore {
    rows: RwLock<Vec<DetectionResult>>,
}

impl MemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored result in append order
    pub async fn all(&self) -> Vec<DetectionResult> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl DetectionStore for MemoryDetectionStore {
    async fn append(&self, detection: NewDetection) -> Result<DetectionResult> {
        let mut rows = self.rows.write().await;
        let result = detection.into_result(rows.len() as i64 + 1);
        rows.push(result.clone());
        Ok(result)
    }

    async fn list(&self, filter: &DetectionFilter) -> Result<Vec<DetectionResult>> {
        let rows = self.rows.read().await;
        let mut matching: Vec<DetectionResult> =
            rows.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(filter.effective_offset() as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn count(&self, filter: &DetectionFilter) -> Result<i64> {
        let rows = self.rows.read().await;
        Ok(rows.iter().filter(|r| filter.matches(r)).count() as i64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Id, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn record(&self, job: &JobRecord) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_status(&self, id: &Id, status: JobStatus) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Job {} not found", id)))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = status;
        if status.is_terminal() {
            job.finished_at = Some(utc_now());
        }
        Ok(true)
    }

    async fn get(&self, id: &Id) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<JobRecord> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit.max(1) as usize);
        Ok(all)
    }

    async fn abort_unfinished(&self) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let now = utc_now();
        let mut changed = 0;
        for job in jobs.values_mut().filter(|j| !j.status.is_terminal()) {
            job.status = JobStatus::Aborted;
            job.finished_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn record(&self, session: &SessionRecord) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn update_status(&self, session_id: Uuid, status: SessionStatus) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id).ok_or_else(|| {
            Error::NotFound(format!("Stream session {} not found", session_id))
        })?;
        if session.status == SessionStatus::Stopped {
            return Ok(false);
        }
        session.status = status;
        if status == SessionStatus::Stopped {
            session.ended_at = Some(utc_now());
        }
        Ok(true)
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(&session_id).cloned())
    }

    async fn list(&self, camera_id: Option<CameraId>, limit: i64) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| camera_id.map_or(true, |c| c == s.camera_id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then(b.session_id.cmp(&a.session_id))
        });
        matching.truncate(limit.max(1) as usize);
        Ok(matching)
    }

    async fn close_open(&self) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let now = utc_now();
        let mut closed = 0;
        for session in sessions
            .values_mut()
            .filter(|s| s.status != SessionStatus::Stopped)
        {
            session.status = SessionStatus::Stopped;
            session.ended_at = Some(now);
            closed += 1;
        }
        Ok(closed)
    }
}
