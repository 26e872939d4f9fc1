//! ABOUTME: In-memory camera registry backed by a durable camera store
//! ABOUTME: Serializes lifecycle transitions per camera and writes status changes through

use std::collections::BTreeMap;
use std::sync::Arc;

use cw_core::{CameraId, Error, Result};
use cw_db::{Camera, CameraStatus, CameraStore, NewCamera, UpdateCamera};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, instrument, warn};

/// Live state of one registered camera
#[derive(Debug)]
pub struct CameraEntry {
    camera: Camera,
    streaming: bool,
    detection_holds: u32,
    removed: bool,
}

impl CameraEntry {
    fn new(mut camera: Camera) -> Self {
        camera.status = CameraStatus::Idle;
        Self {
            camera,
            streaming: false,
            detection_holds: 0,
            removed: false,
        }
    }

    pub fn id(&self) -> CameraId {
        self.camera.id
    }

    pub fn status(&self) -> CameraStatus {
        CameraStatus::from_flags(self.streaming, self.detection_holds > 0)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn detection_holds(&self) -> u32 {
        self.detection_holds
    }

    pub fn snapshot(&self) -> Camera {
        let mut camera = self.camera.clone();
        camera.status = self.status();
        camera
    }

    pub(crate) fn set_streaming(&mut self, streaming: bool) {
        assert!(
            self.streaming != streaming,
            "camera {} streaming flag already {}",
            self.camera.id,
            streaming
        );
        self.streaming = streaming;
    }

    pub(crate) fn begin_detection(&mut self) {
        self.detection_holds += 1;
    }

    pub(crate) fn end_detection(&mut self) {
        assert!(
            self.detection_holds > 0,
            "camera {} released a detection hold it did not have",
            self.camera.id
        );
        self.detection_holds -= 1;
    }
}

/// Exclusive access to one camera's lifecycle state
pub type CameraGuard = OwnedMutexGuard<CameraEntry>;

pub struct CameraRegistry {
    store: Arc<dyn CameraStore>,
    cameras: RwLock<BTreeMap<CameraId, Arc<Mutex<CameraEntry>>>>,
}

impl CameraRegistry {
    /// Load every camera from the store, resetting persisted statuses to idle
    #[instrument(skip(store))]
    pub async fn load(store: Arc<dyn CameraStore>) -> Result<Self> {
        let reset = store.reset_statuses().await?;
        if reset > 0 {
            info!(count = reset, "Reset stale camera statuses to idle");
        }

        let cameras = store
            .list()
            .await?
            .into_iter()
            .map(|camera| (camera.id, Arc::new(Mutex::new(CameraEntry::new(camera)))))
            .collect::<BTreeMap<_, _>>();
        info!(count = cameras.len(), "Camera registry loaded");

        Ok(Self {
            store,
            cameras: RwLock::new(cameras),
        })
    }

    fn not_found(id: CameraId) -> Error {
        Error::NotFound(format!("Camera {} not found", id))
    }

    async fn entry(&self, id: CameraId) -> Result<Arc<Mutex<CameraEntry>>> {
        self.cameras
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }

    /// Lock one camera for a lifecycle transition
    pub async fn lock(&self, id: CameraId) -> Result<CameraGuard> {
        let guard = self.entry(id).await?.lock_owned().await;
        if guard.removed {
            return Err(Self::not_found(id));
        }
        Ok(guard)
    }

    /// Write the entry's current status through to the store
    pub async fn persist_status(&self, entry: &CameraEntry) {
        if let Err(e) = self.store.set_status(entry.id(), entry.status()).await {
            warn!(camera_id = %entry.id(), error = %e, "Failed to persist camera status");
        }
    }

    #[instrument(skip(self))]
    pub async fn add(&self, camera: NewCamera) -> Result<Camera> {
        let camera = self.store.insert(camera).await?;
        let snapshot = camera.clone();
        self.cameras
            .write()
            .await
            .insert(camera.id, Arc::new(Mutex::new(CameraEntry::new(camera))));
        info!(camera_id = %snapshot.id, name = %snapshot.name, "Camera added");
        Ok(snapshot)
    }

    /// Change static attributes; allowed in any lifecycle status
    #[instrument(skip(self))]
    pub async fn update(&self, id: CameraId, update: UpdateCamera) -> Result<Camera> {
        let mut entry = self.lock(id).await?;
        let stored = self.store.update(id, update).await?;
        entry.camera.name = stored.name;
        entry.camera.address = stored.address;
        entry.camera.location = stored.location;
        entry.camera.updated_at = stored.updated_at;
        Ok(entry.snapshot())
    }

    /// Delete a camera; rejected unless it is idle
    #[instrument(skip(self))]
    pub async fn remove(&self, id: CameraId) -> Result<()> {
        let mut entry = self.lock(id).await?;
        entry.status().ensure_removable(id)?;

        self.store.delete(id).await?;
        entry.removed = true;
        self.cameras.write().await.remove(&id);
        info!(camera_id = %id, "Camera removed");
        Ok(())
    }

    pub async fn get(&self, id: CameraId) -> Result<Camera> {
        Ok(self.lock(id).await?.snapshot())
    }

    /// Every camera in registry order
    pub async fn list(&self) -> Vec<Camera> {
        let entries: Vec<_> = self.cameras.read().await.values().cloned().collect();
        let mut cameras = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.lock().await;
            if !entry.removed {
                cameras.push(entry.snapshot());
            }
        }
        cameras
    }

    /// Camera ids in stable registry order
    pub async fn order(&self) -> Vec<CameraId> {
        self.cameras.read().await.keys().copied().collect()
    }

    pub async fn contains(&self, id: CameraId) -> bool {
        self.cameras.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.cameras.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cameras.read().await.is_empty()
    }

    /// Take a detection hold on a camera
    pub(crate) async fn begin_detection(&self, id: CameraId) -> Result<()> {
        let mut entry = self.lock(id).await?;
        entry.begin_detection();
        if entry.detection_holds() == 1 {
            self.persist_status(&entry).await;
        }
        Ok(())
    }

    /// Drop a detection hold taken with `begin_detection`
    pub(crate) async fn end_detection(&self, id: CameraId) {
        match self.lock(id).await {
            Ok(mut entry) => {
                entry.end_detection();
                if entry.detection_holds() == 0 {
                    self.persist_status(&entry).await;
                }
            }
            Err(e) => warn!(camera_id = %id, error = %e, "Detection hold released for missing camera"),
        }
    }
}
