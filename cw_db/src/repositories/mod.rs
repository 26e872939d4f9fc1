//! ABOUTME: SQLite-backed implementations of the store traits
//! ABOUTME: One repository per table, each holding a cloned connection pool

pub mod cameras;
pub mod detections;
pub mod jobs;
pub mod sessions;

pub use cameras::CameraRepository;
pub use detections::DetectionRepository;
pub use jobs::JobRepository;
pub use sessions::SessionRepository;
