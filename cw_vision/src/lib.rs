//! ABOUTME: Frame and face detection capabilities used by streams and detection jobs
//! ABOUTME: Defines the capability traits plus a synthetic source and a pure-Rust detector

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cw_core::{CameraId, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub mod bright_region;
pub mod render;
pub mod synthetic;

pub use bright_region::{BrightRegionConfig, BrightRegionDetector};
pub use render::{annotate_and_encode_jpeg, placeholder_frame};
pub use synthetic::SyntheticFrameSource;

// Re-export image types for capability implementors
pub use image;

pub const DEFAULT_FRAME_WIDTH: u32 = 320;
pub const DEFAULT_FRAME_HEIGHT: u32 = 240;

/// A single decoded RGB frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: CameraId,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<RgbImage>,
    /// Set when the frame stands in for an unavailable camera
    pub placeholder: bool,
}

impl Frame {
    pub fn new(camera_id: CameraId, captured_at: DateTime<Utc>, image: RgbImage) -> Self {
        Self {
            camera_id,
            captured_at,
            image: Arc::new(image),
            placeholder: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Axis-aligned face region in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Source of the current frame for a camera.
///
/// An unreachable camera is reported as `Error::CapabilityFailure`.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn get_frame(&self, camera_id: CameraId) -> Result<Frame>;
}

/// Face detection over a single frame
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>>;
}
