//! ABOUTME: Stream session manager running one frame loop per streaming camera
//! ABOUTME: Each session holds a streaming slot, degrades to placeholder frames on failure and is recorded durably

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cw_core::{utc_now, CameraId, Error, PoolKind, Result};
use cw_db::{SessionRecord, SessionStatus, SessionStore};
use cw_vision::{placeholder_frame, Frame, FrameSource};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::lock;
use crate::metrics::EngineMetrics;
use crate::registry::CameraRegistry;
use crate::slots::{SlotHandle, SlotPool};

/// Configuration for stream sessions
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub frame_interval: Duration,
    pub frame_timeout: Duration,
    /// Consecutive frame failures before the session serves placeholders
    pub degrade_after_failures: u32,
    /// Frames buffered per subscriber
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(100),
            frame_timeout: Duration::from_secs(5),
            degrade_after_failures: 5,
            buffer_size: 8,
        }
    }
}

/// Health of a session's frame source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FrameSourceState {
    Starting,
    Live,
    Degraded { consecutive_failures: u32 },
}

/// Point-in-time view of a stream session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub session_id: Uuid,
    pub camera_id: CameraId,
    pub started_at: DateTime<Utc>,
    pub frame_source_state: FrameSourceState,
    pub frames_served: u64,
}

struct LiveSession {
    info: StdMutex<StreamSession>,
    slot: StdMutex<Option<SlotHandle>>,
    cancel: CancellationToken,
    frames: broadcast::Sender<Frame>,
    latest: StdMutex<Option<Frame>>,
}

impl LiveSession {
    fn snapshot(&self) -> StreamSession {
        lock(&self.info).clone()
    }

    fn state(&self) -> FrameSourceState {
        lock(&self.info).frame_source_state
    }

    fn set_state(&self, state: FrameSourceState) {
        lock(&self.info).frame_source_state = state;
    }

    fn session_id(&self) -> Uuid {
        lock(&self.info).session_id
    }

    fn serve(&self, frame: Frame) {
        lock(&self.info).frames_served += 1;
        *lock(&self.latest) = Some(frame.clone());
        let _ = self.frames.send(frame);
    }

    /// Cancel the loop and hand back the slot
    fn shut_down(&self) -> Option<SlotHandle> {
        self.cancel.cancel();
        lock(&self.slot).take()
    }
}

struct StreamInner {
    registry: Arc<CameraRegistry>,
    slots: SlotPool,
    source: Arc<dyn FrameSource>,
    history: Arc<dyn SessionStore>,
    config: StreamConfig,
    metrics: EngineMetrics,
    sessions: DashMap<CameraId, Arc<LiveSession>>,
}

impl StreamInner {
    async fn persist_status(&self, camera_id: CameraId, session_id: Uuid, status: SessionStatus) {
        match self.history.update_status(session_id, status).await {
            Ok(true) => {}
            Ok(false) => debug!(%camera_id, %session_id, %status, "Session already stopped"),
            Err(e) => {
                warn!(%camera_id, %session_id, %status, error = %e, "Failed to persist session status")
            }
        }
    }
}

/// Starts, stops and tracks stream sessions. Clones share state.
#[derive(Clone)]
pub struct StreamSessionManager {
    inner: Arc<StreamInner>,
}

impl StreamSessionManager {
    pub fn new(
        registry: Arc<CameraRegistry>,
        slots: SlotPool,
        source: Arc<dyn FrameSource>,
        history: Arc<dyn SessionStore>,
        config: StreamConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                registry,
                slots,
                source,
                history,
                config,
                metrics,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Start streaming a camera. Starting an already streaming camera returns
    /// the existing session without taking another slot.
    #[instrument(skip(self))]
    pub async fn start_stream(&self, camera_id: CameraId) -> Result<StreamSession> {
        let mut camera = self.inner.registry.lock(camera_id).await?;

        if let Some(existing) = self.inner.sessions.get(&camera_id) {
            debug!(%camera_id, "Camera already streaming");
            return Ok(existing.snapshot());
        }
        assert!(
            !camera.is_streaming(),
            "camera {} marked streaming without a session",
            camera_id
        );

        let slot = self.inner.slots.try_acquire(PoolKind::Streaming)?;
        let (frames, _) = broadcast::channel(self.inner.config.buffer_size.max(1));
        let session = Arc::new(LiveSession {
            info: StdMutex::new(StreamSession {
                session_id: Uuid::new_v4(),
                camera_id,
                started_at: utc_now(),
                frame_source_state: FrameSourceState::Starting,
                frames_served: 0,
            }),
            slot: StdMutex::new(Some(slot)),
            cancel: CancellationToken::new(),
            frames,
            latest: StdMutex::new(None),
        });

        let snapshot = session.snapshot();
        let record = SessionRecord {
            session_id: snapshot.session_id,
            camera_id,
            started_at: snapshot.started_at,
            ended_at: None,
            status: SessionStatus::Active,
        };
        if let Err(e) = self.inner.history.record(&record).await {
            warn!(%camera_id, session_id = %record.session_id, error = %e, "Failed to record stream session");
        }

        self.inner.sessions.insert(camera_id, session.clone());
        camera.set_streaming(true);
        self.inner.registry.persist_status(&camera).await;
        drop(camera);

        tokio::spawn(run_session(self.inner.clone(), session));
        info!(%camera_id, session_id = %snapshot.session_id, "Stream started");
        Ok(snapshot)
    }

    /// Stop a camera's stream. The slot is free when this returns even if the
    /// frame loop is still winding down.
    #[instrument(skip(self))]
    pub async fn stop_stream(&self, camera_id: CameraId) -> Result<()> {
        let mut camera = self.inner.registry.lock(camera_id).await?;
        let Some((_, session)) = self.inner.sessions.remove(&camera_id) else {
            return Err(Error::InvalidState(format!(
                "Camera {} is not streaming",
                camera_id
            )));
        };

        if let Some(slot) = session.shut_down() {
            self.inner.slots.release(slot);
        }
        camera.set_streaming(false);
        self.inner.registry.persist_status(&camera).await;
        let session_id = session.session_id();
        self.inner
            .persist_status(camera_id, session_id, SessionStatus::Stopped)
            .await;
        info!(%camera_id, %session_id, "Stream stopped");
        Ok(())
    }

    /// Stop every active session, returning how many were stopped
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<CameraId> = self.inner.sessions.iter().map(|s| *s.key()).collect();
        let mut stopped = 0;
        for camera_id in ids {
            match self.stop_stream(camera_id).await {
                Ok(()) => stopped += 1,
                Err(e) => debug!(%camera_id, error = %e, "Session already gone"),
            }
        }
        stopped
    }

    /// Snapshot of every active session, ordered by camera
    pub fn list_active(&self) -> Vec<StreamSession> {
        let mut sessions: Vec<StreamSession> = self
            .inner
            .sessions
            .iter()
            .map(|s| s.value().snapshot())
            .collect();
        sessions.sort_by_key(|s| s.camera_id);
        sessions
    }

    pub fn get(&self, camera_id: CameraId) -> Option<StreamSession> {
        self.inner.sessions.get(&camera_id).map(|s| s.snapshot())
    }

    pub fn is_streaming(&self, camera_id: CameraId) -> bool {
        self.inner.sessions.contains_key(&camera_id)
    }

    /// Receive every frame the session serves from now on
    pub fn subscribe(&self, camera_id: CameraId) -> Result<broadcast::Receiver<Frame>> {
        self.inner
            .sessions
            .get(&camera_id)
            .map(|s| s.frames.subscribe())
            .ok_or_else(|| Error::InvalidState(format!("Camera {} is not streaming", camera_id)))
    }

    /// Recorded sessions, newest first, optionally for one camera
    pub async fn history(&self, camera_id: Option<CameraId>, limit: i64) -> Result<Vec<SessionRecord>> {
        self.inner.history.list(camera_id, limit).await
    }

    /// Last frame served, real or placeholder
    pub fn latest_frame(&self, camera_id: CameraId) -> Option<Frame> {
        self.inner
            .sessions
            .get(&camera_id)
            .and_then(|s| lock(&s.latest).clone())
    }
}

async fn run_session(inner: Arc<StreamInner>, session: Arc<LiveSession>) {
    let camera_id = lock(&session.info).camera_id;
    let session_id = session.session_id();
    let mut ticker = interval(inner.config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => break,
            outcome = timeout(inner.config.frame_timeout, inner.source.get_frame(camera_id)) => outcome,
        };
        if session.cancel.is_cancelled() {
            break;
        }

        match outcome {
            Ok(Ok(frame)) => {
                if let FrameSourceState::Degraded { .. } = session.state() {
                    inner.metrics.degraded_sessions.dec();
                    info!(%camera_id, "Frame source recovered");
                    inner
                        .persist_status(camera_id, session_id, SessionStatus::Active)
                        .await;
                }
                failures = 0;
                session.set_state(FrameSourceState::Live);
                inner.metrics.frames_generated.inc();
                session.serve(frame);
                continue;
            }
            Ok(Err(e)) => {
                inner.metrics.frame_errors.inc();
                debug!(%camera_id, error = %e, "Frame source failed");
            }
            Err(_) => {
                inner.metrics.frame_timeouts.inc();
                debug!(
                    %camera_id,
                    timeout_ms = inner.config.frame_timeout.as_millis() as u64,
                    "Frame source timed out"
                );
            }
        }

        failures = failures.saturating_add(1);
        if failures >= inner.config.degrade_after_failures {
            if !matches!(session.state(), FrameSourceState::Degraded { .. }) {
                inner.metrics.degraded_sessions.inc();
                warn!(%camera_id, failures, "Frame source unavailable; serving placeholder");
                inner
                    .persist_status(camera_id, session_id, SessionStatus::Error)
                    .await;
            }
            session.set_state(FrameSourceState::Degraded {
                consecutive_failures: failures,
            });
            inner.metrics.frames_generated.inc();
            session.serve(placeholder_frame(camera_id));
        }
    }

    if matches!(session.state(), FrameSourceState::Degraded { .. }) {
        inner.metrics.degraded_sessions.dec();
    }
    debug!(%camera_id, "Frame loop exited");
}
