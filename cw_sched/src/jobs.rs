//! ABOUTME: Detection job manager for manual and automatic face detection jobs
//! ABOUTME: Jobs hold one detection slot per target camera and poll until their window ends

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cw_core::{time::strictly_after, utc_now, CameraId, Error, Id, PoolKind, Result};
use cw_db::{DetectionResult, DetectionStore, JobMode, JobRecord, JobStatus, JobStore, NewDetection};
use cw_notify::{EngineEvent, NotificationSink};
use cw_storage::{snapshot_key, ImageStore};
use cw_vision::{annotate_and_encode_jpeg, BoundingBox, FaceDetector, Frame, FrameSource};
use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cycle::CycleState;
use crate::lock;
use crate::metrics::EngineMetrics;
use crate::registry::CameraRegistry;
use crate::slots::{SlotHandle, SlotPool};

pub const MIN_WINDOW_MINUTES: u32 = 1;
pub const MAX_WINDOW_MINUTES: u32 = 120;

/// What a manual job does when not every target camera can get a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Run with the cameras that got a slot
    #[default]
    Partial,
    /// Reject the job unless every camera gets a slot
    AllOrNothing,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub poll_interval: Duration,
    /// Ceiling on one frame fetch plus face detection
    pub detection_timeout: Duration,
    /// Window of each automatic batch
    pub cycle_duration: Duration,
    pub batch_size: usize,
    pub capacity_policy: CapacityPolicy,
    /// Seed the next automatic batch when one completes
    pub auto_continue: bool,
    /// Wait between attempts to seed a batch while no detection slot is free
    pub capacity_retry: Duration,
    /// Finished jobs kept in memory for inspection
    pub retained_jobs: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            detection_timeout: Duration::from_secs(30),
            cycle_duration: Duration::from_secs(300),
            batch_size: 20,
            capacity_policy: CapacityPolicy::Partial,
            auto_continue: true,
            capacity_retry: Duration::from_secs(10),
            retained_jobs: 256,
        }
    }
}

/// Point-in-time view of a detection job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionJob {
    pub id: Id,
    pub mode: JobMode,
    /// Cameras the job holds (or held) a detection slot for
    pub target_camera_ids: Vec<CameraId>,
    /// Requested cameras left out for lack of capacity or because they vanished
    pub skipped_camera_ids: Vec<CameraId>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub held_slots: usize,
    pub detections: u64,
}

impl DetectionJob {
    fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            mode: self.mode,
            target_camera_ids: self.target_camera_ids.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
            status: self.status,
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

impl From<JobRecord> for DetectionJob {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            mode: record.mode,
            target_camera_ids: record.target_camera_ids,
            skipped_camera_ids: Vec::new(),
            window_start: record.window_start,
            window_end: record.window_end,
            status: record.status,
            created_at: record.created_at,
            finished_at: record.finished_at,
            held_slots: 0,
            detections: 0,
        }
    }
}

/// Outcome of a one-shot test detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneShotDetection {
    /// Job id the stored result carries; no job history row is written for it
    pub id: Id,
    pub camera_id: CameraId,
    pub face_count: u32,
    /// Stored only when at least one face was found
    pub result: Option<DetectionResult>,
}

/// State of the automatic cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomaticStatus {
    pub enabled: bool,
    pub cursor: usize,
    pub batch_size: usize,
    pub current_job: Option<Id>,
}

/// Collaborators a detection job talks to
#[derive(Clone)]
pub struct JobDependencies {
    pub frames: Arc<dyn FrameSource>,
    pub detector: Arc<dyn FaceDetector>,
    pub results: Arc<dyn DetectionStore>,
    pub images: Arc<dyn ImageStore>,
    pub history: Arc<dyn JobStore>,
    pub sink: Arc<dyn NotificationSink>,
}

struct JobEntry {
    id: Id,
    mode: JobMode,
    info: StdMutex<DetectionJob>,
    slots: StdMutex<BTreeMap<CameraId, SlotHandle>>,
    last_detected: StdMutex<BTreeMap<CameraId, DateTime<Utc>>>,
    cancel: CancellationToken,
    /// Serializes status writes so history and events follow memory order
    transitions: Mutex<()>,
    next_cursor: Option<usize>,
    closes_cycle: bool,
}

impl JobEntry {
    fn snapshot(&self) -> DetectionJob {
        let mut job = lock(&self.info).clone();
        job.held_slots = lock(&self.slots).len();
        job
    }

    fn status(&self) -> JobStatus {
        lock(&self.info).status
    }

    fn begin_running(&self) -> bool {
        let mut info = lock(&self.info);
        if info.status != JobStatus::Pending {
            return false;
        }
        info.status = JobStatus::Running;
        true
    }

    /// Move to a terminal status; false if the job already finished
    fn finish(&self, status: JobStatus) -> bool {
        let mut info = lock(&self.info);
        if info.status.is_terminal() {
            return false;
        }
        info.status = status;
        info.finished_at = Some(utc_now());
        true
    }

    fn take_slots(&self) -> Vec<(CameraId, SlotHandle)> {
        std::mem::take(&mut *lock(&self.slots)).into_iter().collect()
    }

    fn held_cameras(&self) -> Vec<CameraId> {
        lock(&self.slots).keys().copied().collect()
    }

    fn is_holding(&self, camera_id: CameraId) -> bool {
        lock(&self.slots).contains_key(&camera_id)
    }

    /// Timestamp for the next result of this camera, strictly after the last one
    fn next_detected_at(&self, camera_id: CameraId) -> DateTime<Utc> {
        let mut last = lock(&self.last_detected);
        let at = strictly_after(last.get(&camera_id).copied(), utc_now());
        last.insert(camera_id, at);
        at
    }
}

/// Result of claiming detection slots for a camera list
struct Claimed {
    held: Vec<(CameraId, SlotHandle)>,
    /// Cameras after the first capacity denial
    denied: Vec<CameraId>,
    /// Cameras that disappeared from the registry
    missing: Vec<CameraId>,
}

struct AutomaticState {
    cycle: CycleState,
    current: Option<Id>,
    enabled: bool,
}

struct JobInner {
    registry: Arc<CameraRegistry>,
    slots: SlotPool,
    deps: JobDependencies,
    config: JobConfig,
    metrics: EngineMetrics,
    jobs: DashMap<Id, Arc<JobEntry>>,
    automatic: Mutex<AutomaticState>,
    shutdown: CancellationToken,
}

/// Schedules, runs and aborts detection jobs. Clones share state.
#[derive(Clone)]
pub struct DetectionJobManager {
    inner: Arc<JobInner>,
}

impl DetectionJobManager {
    pub fn new(
        registry: Arc<CameraRegistry>,
        slots: SlotPool,
        deps: JobDependencies,
        config: JobConfig,
        metrics: EngineMetrics,
    ) -> Self {
        let cycle = CycleState::new(config.batch_size, config.cycle_duration);
        Self {
            inner: Arc::new(JobInner {
                registry,
                slots,
                deps,
                config,
                metrics,
                jobs: DashMap::new(),
                automatic: Mutex::new(AutomaticState {
                    cycle,
                    current: None,
                    enabled: false,
                }),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Run detection on an explicit camera set for `window_minutes`.
    #[instrument(skip(self, camera_ids), fields(cameras = camera_ids.len()))]
    pub async fn schedule_manual(
        &self,
        camera_ids: &[CameraId],
        window_minutes: u32,
    ) -> Result<DetectionJob> {
        if camera_ids.is_empty() {
            return Err(Error::EmptySet);
        }
        if !(MIN_WINDOW_MINUTES..=MAX_WINDOW_MINUTES).contains(&window_minutes) {
            return Err(Error::WindowOutOfRange {
                minutes: window_minutes,
                min: MIN_WINDOW_MINUTES,
                max: MAX_WINDOW_MINUTES,
            });
        }
        self.inner.ensure_accepting()?;

        let mut targets = Vec::with_capacity(camera_ids.len());
        for id in camera_ids {
            if !targets.contains(id) {
                targets.push(*id);
            }
        }
        for id in &targets {
            if !self.inner.registry.contains(*id).await {
                return Err(Error::NotFound(format!("Camera {} not found", id)));
            }
        }

        let claimed = self
            .inner
            .claim(&targets, self.inner.config.capacity_policy)
            .await?;
        if claimed.held.is_empty() {
            return Err(Error::NotFound(format!(
                "Cameras {:?} are no longer registered",
                claimed.missing
            )));
        }
        let mut skipped = claimed.denied;
        skipped.extend(claimed.missing);
        if !skipped.is_empty() {
            warn!(
                scheduled = claimed.held.len(),
                skipped = skipped.len(),
                "Manual job scheduled with a reduced camera set"
            );
        }

        let window = Duration::from_secs(u64::from(window_minutes) * 60);
        Ok(self
            .inner
            .launch(JobMode::Manual, claimed.held, skipped, window, None, false)
            .await)
    }

    /// Fetch one frame from `camera_id` and run detection on it right away.
    /// Holds one detection slot while it runs; the stored result is flagged
    /// `test_mode`.
    #[instrument(skip(self))]
    pub async fn detect_once(&self, camera_id: CameraId) -> Result<OneShotDetection> {
        self.inner.ensure_accepting()?;
        if !self.inner.registry.contains(camera_id).await {
            return Err(Error::NotFound(format!("Camera {} not found", camera_id)));
        }

        let claimed = self
            .inner
            .claim(&[camera_id], CapacityPolicy::AllOrNothing)
            .await?;
        let outcome = self.inner.detect_once(camera_id).await;
        for (camera_id, slot) in claimed.held {
            self.inner.slots.release(slot);
            self.inner.registry.end_detection(camera_id).await;
        }
        outcome
    }

    /// Start the automatic cycle with the next batch of the registry
    #[instrument(skip(self))]
    pub async fn schedule_automatic(&self) -> Result<DetectionJob> {
        self.inner.ensure_accepting()?;
        let mut auto = self.inner.automatic.lock().await;
        if let Some(current) = &auto.current {
            return Err(Error::AlreadyRunning(format!(
                "Automatic job {} is still running",
                current
            )));
        }

        let job = self.inner.start_batch(&mut auto).await?;
        auto.enabled = true;
        Ok(job)
    }

    /// Abort the running automatic batch, if any, and end the cycle
    pub async fn stop_automatic(&self) -> Result<Option<DetectionJob>> {
        let current = {
            let mut auto = self.inner.automatic.lock().await;
            auto.enabled = false;
            auto.current.clone()
        };
        match current {
            Some(id) => self.inner.abort(&id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Abort a job, releasing its slots before returning. Aborting a finished
    /// job returns it unchanged.
    pub async fn abort(&self, job_id: &Id) -> Result<DetectionJob> {
        self.inner.abort(job_id).await
    }

    pub async fn get_job(&self, job_id: &Id) -> Result<DetectionJob> {
        if let Some(entry) = self.inner.jobs.get(job_id) {
            return Ok(entry.snapshot());
        }
        self.inner
            .deps
            .history
            .get(job_id)
            .await?
            .map(DetectionJob::from)
            .ok_or_else(|| Error::NotFound(format!("Job {} not found", job_id)))
    }

    /// Jobs known to this process, newest first
    pub fn list_jobs(&self) -> Vec<DetectionJob> {
        let mut jobs: Vec<DetectionJob> = self
            .inner
            .jobs
            .iter()
            .map(|e| e.value().snapshot())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs
    }

    pub async fn automatic_status(&self) -> AutomaticStatus {
        let auto = self.inner.automatic.lock().await;
        AutomaticStatus {
            enabled: auto.enabled,
            cursor: auto.cycle.cursor(),
            batch_size: auto.cycle.batch_size(),
            current_job: auto.current.clone(),
        }
    }

    /// Stop accepting jobs and abort every unfinished one
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        self.inner.automatic.lock().await.enabled = false;

        let unfinished: Vec<Id> = self
            .inner
            .jobs
            .iter()
            .filter(|e| !e.value().status().is_terminal())
            .map(|e| e.key().clone())
            .collect();
        let mut aborted = 0;
        for id in unfinished {
            if self.inner.abort(&id).await.is_ok() {
                aborted += 1;
            }
        }
        aborted
    }
}

impl JobInner {
    fn ensure_accepting(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::InvalidState("Detection jobs are shutting down".into()));
        }
        Ok(())
    }

    /// Claim a detection slot and a detection hold for each camera, in order.
    /// Under the partial policy `held` is empty when every camera that got a
    /// slot was removed meanwhile.
    async fn claim(&self, targets: &[CameraId], policy: CapacityPolicy) -> Result<Claimed> {
        let mut held = Vec::with_capacity(targets.len());
        let mut denied = Vec::new();
        let mut denial = None;

        for &camera_id in targets {
            if denial.is_some() {
                denied.push(camera_id);
                continue;
            }
            match self.slots.try_acquire(PoolKind::Detection) {
                Ok(slot) => held.push((camera_id, slot)),
                Err(e @ Error::CapacityExceeded { .. }) => {
                    if policy == CapacityPolicy::AllOrNothing {
                        return Err(e);
                    }
                    denied.push(camera_id);
                    denial = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if held.is_empty() {
            return Err(denial.unwrap_or(Error::EmptySet));
        }

        let mut marked = Vec::with_capacity(held.len());
        let mut missing = Vec::new();
        for (camera_id, slot) in held {
            match self.registry.begin_detection(camera_id).await {
                Ok(()) => marked.push((camera_id, slot)),
                Err(_) => {
                    drop(slot);
                    missing.push(camera_id);
                }
            }
        }

        if policy == CapacityPolicy::AllOrNothing && !missing.is_empty() {
            for (camera_id, slot) in marked {
                drop(slot);
                self.registry.end_detection(camera_id).await;
            }
            return Err(Error::NotFound(format!(
                "Cameras {:?} are no longer registered",
                missing
            )));
        }

        Ok(Claimed {
            held: marked,
            denied,
            missing,
        })
    }

    async fn launch(
        self: &Arc<Self>,
        mode: JobMode,
        held: Vec<(CameraId, SlotHandle)>,
        skipped: Vec<CameraId>,
        window: Duration,
        next_cursor: Option<usize>,
        closes_cycle: bool,
    ) -> DetectionJob {
        let now = utc_now();
        let window_end = now + chrono::Duration::milliseconds(window.as_millis() as i64);
        let id = Id::new();
        let info = DetectionJob {
            id: id.clone(),
            mode,
            target_camera_ids: held.iter().map(|(camera_id, _)| *camera_id).collect(),
            skipped_camera_ids: skipped,
            window_start: now,
            window_end,
            status: JobStatus::Pending,
            created_at: now,
            finished_at: None,
            held_slots: held.len(),
            detections: 0,
        };

        // The row exists before anything can abort the job
        if let Err(e) = self.deps.history.record(&info.record()).await {
            warn!(job_id = %id, error = %e, "Failed to record job");
        }

        let entry = Arc::new(JobEntry {
            id: id.clone(),
            mode,
            info: StdMutex::new(info.clone()),
            slots: StdMutex::new(held.into_iter().collect()),
            last_detected: StdMutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            transitions: Mutex::new(()),
            next_cursor,
            closes_cycle,
        });
        self.jobs.insert(id.clone(), entry.clone());
        self.metrics.jobs_scheduled.inc();
        self.deps.sink.publish(EngineEvent::JobStateChanged {
            job_id: id.clone(),
            status: JobStatus::Pending,
        });
        info!(
            job_id = %id,
            mode = %mode,
            cameras = info.target_camera_ids.len(),
            window_secs = window.as_secs(),
            "Detection job scheduled"
        );

        spawn_job(self.clone(), entry, Instant::now() + window);
        self.prune_finished();
        info
    }

    /// Write and announce a transition unless the job has already moved past it
    async fn persist_status(&self, entry: &JobEntry, status: JobStatus) {
        let job_id = &entry.id;
        let _ordered = entry.transitions.lock().await;
        if entry.status() != status {
            debug!(%job_id, %status, current = %entry.status(), "Stale job transition dropped");
            return;
        }
        match self.deps.history.update_status(job_id, status).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(%job_id, %status, "Job history already finished; transition dropped");
                return;
            }
            Err(e) => warn!(%job_id, %status, error = %e, "Failed to persist job status"),
        }
        self.deps.sink.publish(EngineEvent::JobStateChanged {
            job_id: job_id.clone(),
            status,
        });
    }

    /// One detection pass over every camera the job still holds
    async fn poll_once(&self, entry: &JobEntry) {
        let cameras = entry.held_cameras();
        debug!(job_id = %entry.id, cameras = cameras.len(), "Detection tick");
        join_all(
            cameras
                .into_iter()
                .map(|camera_id| self.detect_camera(entry, camera_id)),
        )
        .await;
    }

    async fn capture_and_detect(&self, camera_id: CameraId) -> Result<(Frame, Vec<BoundingBox>)> {
        let frame = self.deps.frames.get_frame(camera_id).await?;
        let faces = self.deps.detector.detect_faces(&frame).await?;
        Ok((frame, faces))
    }

    /// Frame fetch plus detection bounded by the detection timeout
    async fn timed_detection(&self, camera_id: CameraId) -> Result<(Frame, Vec<BoundingBox>)> {
        self.metrics.detection_invocations.inc();
        match timeout(
            self.config.detection_timeout,
            self.capture_and_detect(camera_id),
        )
        .await
        {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => {
                self.metrics.capability_failures.inc();
                Err(e)
            }
            Err(_) => {
                self.metrics.capability_failures.inc();
                Err(Error::CapabilityFailure(format!(
                    "Detection on camera {} timed out after {}ms",
                    camera_id,
                    self.config.detection_timeout.as_millis()
                )))
            }
        }
    }

    async fn detect_camera(&self, entry: &JobEntry, camera_id: CameraId) {
        let (frame, faces) = match self.timed_detection(camera_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(job_id = %entry.id, %camera_id, error = %e, "Detection failed; skipping camera this tick");
                return;
            }
        };

        if faces.is_empty() || !entry.is_holding(camera_id) {
            return;
        }
        let detected_at = entry.next_detected_at(camera_id);
        match self
            .store_detection(&entry.id, camera_id, detected_at, &frame, &faces, false)
            .await
        {
            Ok(_) => lock(&entry.info).detections += 1,
            Err(e) => warn!(job_id = %entry.id, %camera_id, error = %e, "Failed to record detection"),
        }
    }

    async fn detect_once(&self, camera_id: CameraId) -> Result<OneShotDetection> {
        let id = Id::new();
        let (frame, faces) = self.timed_detection(camera_id).await?;
        let result = if faces.is_empty() {
            None
        } else {
            Some(
                self.store_detection(&id, camera_id, utc_now(), &frame, &faces, true)
                    .await?,
            )
        };
        info!(%camera_id, faces = faces.len(), "One-shot detection finished");
        Ok(OneShotDetection {
            id,
            camera_id,
            face_count: faces.len() as u32,
            result,
        })
    }

    /// Store the annotated snapshot, append the result and announce it
    async fn store_detection(
        &self,
        job_id: &Id,
        camera_id: CameraId,
        detected_at: DateTime<Utc>,
        frame: &Frame,
        faces: &[BoundingBox],
        test_mode: bool,
    ) -> Result<DetectionResult> {
        let snapshot = annotate_and_encode_jpeg(frame, faces)?;
        let key = snapshot_key(camera_id, job_id, detected_at.timestamp_millis());
        let image_reference = self.deps.images.put(&key, snapshot).await?;

        let result = self
            .deps
            .results
            .append(NewDetection {
                camera_id,
                job_id: job_id.clone(),
                detected_at,
                image_reference,
                face_count: faces.len() as u32,
                test_mode,
            })
            .await?;

        self.metrics.detections_found.inc();
        info!(%job_id, %camera_id, faces = faces.len(), test_mode, "Face detected");
        self.deps.sink.publish(EngineEvent::DetectionFound {
            camera_id,
            result: result.clone(),
        });
        Ok(result)
    }

    /// Window elapsed: release camera by camera, then mark completed
    async fn complete(self: &Arc<Self>, entry: &JobEntry) {
        if !entry.finish(JobStatus::Completed) {
            return;
        }
        for (camera_id, slot) in entry.take_slots() {
            self.slots.release(slot);
            self.registry.end_detection(camera_id).await;
        }

        self.metrics.jobs_completed.inc();
        self.persist_status(entry, JobStatus::Completed).await;
        info!(job_id = %entry.id, mode = %entry.mode, "Detection job completed");

        if entry.mode == JobMode::Automatic {
            self.on_automatic_finished(entry, JobStatus::Completed).await;
        }
    }

    async fn abort(self: &Arc<Self>, job_id: &Id) -> Result<DetectionJob> {
        let Some(entry) = self.jobs.get(job_id).map(|e| e.value().clone()) else {
            return self
                .deps
                .history
                .get(job_id)
                .await?
                .map(DetectionJob::from)
                .ok_or_else(|| Error::NotFound(format!("Job {} not found", job_id)));
        };

        if !entry.finish(JobStatus::Aborted) {
            return Ok(entry.snapshot());
        }
        entry.cancel.cancel();

        let released = entry.take_slots();
        let cameras: Vec<CameraId> = released.iter().map(|(camera_id, _)| *camera_id).collect();
        drop(released);
        for camera_id in &cameras {
            self.registry.end_detection(*camera_id).await;
        }

        self.metrics.jobs_aborted.inc();
        self.persist_status(&entry, JobStatus::Aborted).await;
        info!(job_id = %entry.id, released = cameras.len(), "Detection job aborted");

        if entry.mode == JobMode::Automatic {
            self.on_automatic_finished(&entry, JobStatus::Aborted).await;
        }
        Ok(entry.snapshot())
    }

    /// Select, claim and launch the next automatic batch
    async fn start_batch(self: &Arc<Self>, auto: &mut AutomaticState) -> Result<DetectionJob> {
        let mut vanished: Vec<CameraId> = Vec::new();
        let (order, mut batch, claimed) = loop {
            let mut order = self.registry.order().await;
            order.retain(|id| !vanished.contains(id));
            let batch = auto.cycle.peek(&order);
            if batch.cameras.is_empty() {
                return Err(Error::EmptySet);
            }

            let claimed = self.claim(&batch.cameras, CapacityPolicy::Partial).await?;
            if !claimed.held.is_empty() {
                break (order, batch, claimed);
            }
            // Reselect from the cursor over the cameras that remain
            debug!(removed = ?claimed.missing, "Automatic batch cameras were removed; reselecting");
            vanished.extend(claimed.missing);
        };

        let keep = batch.cameras.len() - claimed.denied.len();
        CycleState::truncate(&mut batch, keep, order.len());
        if !claimed.denied.is_empty() {
            debug!(
                deferred = claimed.denied.len(),
                "Automatic batch shortened to the free detection slots"
            );
        }

        let job = self
            .launch(
                JobMode::Automatic,
                claimed.held,
                claimed.missing,
                auto.cycle.cycle_duration(),
                Some(batch.next_cursor),
                batch.closes_cycle(),
            )
            .await;
        auto.current = Some(job.id.clone());
        info!(
            job_id = %job.id,
            start = batch.start,
            next_cursor = batch.next_cursor,
            "Automatic batch started"
        );
        Ok(job)
    }

    async fn on_automatic_finished(self: &Arc<Self>, entry: &JobEntry, status: JobStatus) {
        let mut auto = self.automatic.lock().await;
        if auto.current.as_ref() != Some(&entry.id) {
            return;
        }
        auto.current = None;
        if let Some(next_cursor) = entry.next_cursor {
            auto.cycle.commit(next_cursor);
        }
        if entry.closes_cycle {
            self.metrics.cycles_completed.inc();
            info!("Automatic cycle completed a full sweep");
        }

        let continue_cycle = status == JobStatus::Completed
            && self.config.auto_continue
            && auto.enabled
            && !self.shutdown.is_cancelled();
        if !continue_cycle {
            auto.enabled = false;
            info!(cursor = auto.cycle.cursor(), "Automatic cycle stopped");
            return;
        }
        drop(auto);
        self.continue_cycle().await;
    }

    /// Seed the next automatic batch, waiting for capacity when none is free
    async fn continue_cycle(self: &Arc<Self>) {
        loop {
            {
                let mut auto = self.automatic.lock().await;
                if !auto.enabled || auto.current.is_some() || self.shutdown.is_cancelled() {
                    return;
                }
                match self.start_batch(&mut auto).await {
                    Ok(_) => return,
                    Err(Error::CapacityExceeded { in_use, capacity, .. }) => {
                        debug!(in_use, capacity, "No detection slot for the next batch; retrying");
                    }
                    Err(e) => {
                        auto.enabled = false;
                        warn!(error = %e, "Automatic cycle stopped");
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(self.config.capacity_retry) => {}
            }
        }
    }

    /// Drop the oldest finished jobs beyond the retention limit
    fn prune_finished(&self) {
        let mut finished: Vec<(DateTime<Utc>, Id)> = self
            .jobs
            .iter()
            .filter(|e| e.value().status().is_terminal())
            .map(|e| (lock(&e.value().info).created_at, e.key().clone()))
            .collect();
        if finished.len() <= self.config.retained_jobs {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.config.retained_jobs;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

fn spawn_job(inner: Arc<JobInner>, entry: Arc<JobEntry>, deadline: Instant) {
    tokio::spawn(run_job(inner, entry, deadline));
}

fn run_job(inner: Arc<JobInner>, entry: Arc<JobEntry>, deadline: Instant) -> BoxFuture<'static, ()> {
    async move {
        if inner.shutdown.is_cancelled() {
            // Launched while shutdown was collecting unfinished jobs
            if let Err(e) = inner.abort(&entry.id).await {
                warn!(job_id = %entry.id, error = %e, "Failed to abort job launched during shutdown");
            }
            return;
        }
        if !entry.begin_running() {
            return;
        }
        inner.persist_status(&entry, JobStatus::Running).await;

        loop {
            tokio::select! {
                biased;
                _ = entry.cancel.cancelled() => return,
                _ = sleep_until(deadline) => break,
                _ = inner.poll_once(&entry) => {}
            }
            tokio::select! {
                biased;
                _ = entry.cancel.cancelled() => return,
                _ = sleep_until(deadline) => break,
                _ = sleep(inner.config.poll_interval) => {}
            }
        }

        inner.complete(&entry).await;
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_db::{CameraStore, MemoryCameraStore, MemoryDetectionStore, MemoryJobStore};
    use cw_storage::ObjectImageStore;
    use test_support::{sample_cameras, AlwaysFaceDetector, RecordingSink, ScriptedFrameSource};

    async fn manager(cameras: usize, detection_slots: usize) -> (DetectionJobManager, Arc<MemoryJobStore>) {
        let config = JobConfig {
            auto_continue: false,
            ..Default::default()
        };
        manager_with(cameras, detection_slots, config).await
    }

    async fn manager_with(
        cameras: usize,
        detection_slots: usize,
        config: JobConfig,
    ) -> (DetectionJobManager, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryCameraStore::new());
        for camera in sample_cameras(cameras) {
            store.insert(camera).await.unwrap();
        }
        let registry = Arc::new(CameraRegistry::load(store).await.unwrap());
        let history = Arc::new(MemoryJobStore::new());
        let deps = JobDependencies {
            frames: Arc::new(ScriptedFrameSource::new()),
            detector: Arc::new(AlwaysFaceDetector),
            results: Arc::new(MemoryDetectionStore::new()),
            images: Arc::new(ObjectImageStore::in_memory()),
            history: history.clone(),
            sink: Arc::new(RecordingSink::new()),
        };
        let manager = DetectionJobManager::new(
            registry,
            SlotPool::new(20, detection_slots),
            deps,
            config,
            EngineMetrics::new(),
        );
        (manager, history)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_targets_take_one_slot() {
        let (manager, _) = manager(3, 5).await;
        let id = CameraId::new(1);
        let job = manager.schedule_manual(&[id, id, id], 5).await.unwrap();
        assert_eq!(job.target_camera_ids, vec![id]);
        assert_eq!(job.held_slots, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_history_is_persisted() {
        let (manager, history) = manager(3, 5).await;
        let job = manager
            .schedule_manual(&[CameraId::new(1), CameraId::new(2)], 1)
            .await
            .unwrap();

        let record = history.get(&job.id).await.unwrap().unwrap();
        assert_eq!(record.target_camera_ids, job.target_camera_ids);
        assert!(!record.status.is_terminal());

        manager.abort(&job.id).await.unwrap();
        let record = history.get(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Aborted);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_get_job_falls_back_to_history() {
        let (manager, history) = manager(1, 5).await;
        let now = utc_now();
        let record = JobRecord {
            id: Id::new(),
            mode: JobMode::Automatic,
            target_camera_ids: vec![CameraId::new(1)],
            window_start: now,
            window_end: now,
            status: JobStatus::Completed,
            created_at: now,
            finished_at: Some(now),
        };
        history.record(&record).await.unwrap();

        let job = manager.get_job(&record.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.held_slots, 0);
        assert_eq!(manager.abort(&record.id).await.unwrap().status, JobStatus::Completed);
        assert!(matches!(
            manager.get_job(&Id::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_are_pruned() {
        let config = JobConfig {
            retained_jobs: 2,
            ..Default::default()
        };
        let (manager, _) = manager_with(5, 5, config).await;

        for i in 1..=4 {
            let job = manager.schedule_manual(&[CameraId::new(i)], 1).await.unwrap();
            manager.abort(&job.id).await.unwrap();
        }
        let live = manager.schedule_manual(&[CameraId::new(5)], 1).await.unwrap();

        let jobs = manager.list_jobs();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].id, live.id);
    }
}
