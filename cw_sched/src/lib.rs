//! ABOUTME: Stream and detection scheduling engine for a fixed camera fleet
//! ABOUTME: Bounded slot pools shared by live streams and time-windowed detection jobs

use std::sync::{Mutex, MutexGuard};

pub mod cycle;
pub mod engine;
pub mod jobs;
pub mod metrics;
pub mod registry;
pub mod slots;
pub mod stream;

pub use cycle::{next_batch, Batch, CycleState};
pub use engine::{Engine, EngineCapabilities, EngineConfig, EngineStores};
pub use jobs::{
    AutomaticStatus, CapacityPolicy, DetectionJob, DetectionJobManager, JobConfig,
    JobDependencies, OneShotDetection, MAX_WINDOW_MINUTES, MIN_WINDOW_MINUTES,
};
pub use metrics::EngineMetrics;
pub use registry::CameraRegistry;
pub use slots::{PoolUtilization, SlotHandle, SlotPool, SlotUtilization};
pub use stream::{FrameSourceState, StreamConfig, StreamSession, StreamSessionManager};

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
