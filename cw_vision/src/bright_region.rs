//! ABOUTME: Pure-Rust face detector that reports bright connected regions
//! ABOUTME: Thresholds luminance, labels 4-connected blobs and keeps those above a minimum area

use async_trait::async_trait;
use cw_core::{Error, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BoundingBox, FaceDetector, Frame};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrightRegionConfig {
    /// Minimum luma (0-255) for a pixel to count as part of a face
    pub luminance_threshold: u8,
    /// Minimum pixel count of a region
    pub min_area: u32,
}

impl Default for BrightRegionConfig {
    fn default() -> Self {
        Self {
            luminance_threshold: 200,
            min_area: 64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrightRegionDetector {
    config: BrightRegionConfig,
}

impl BrightRegionDetector {
    pub fn new(config: BrightRegionConfig) -> Self {
        Self { config }
    }

    /// Synchronous detection over a raw image
    pub fn detect(&self, image: &RgbImage) -> Vec<BoundingBox> {
        let (width, height) = image.dimensions();
        let mask: Vec<bool> = image
            .pixels()
            .map(|p| luma(p.0) >= self.config.luminance_threshold)
            .collect();
        let mut visited = vec![false; mask.len()];
        let mut regions = Vec::new();
        let mut stack = Vec::new();

        for start in 0..mask.len() {
            if !mask[start] || visited[start] {
                continue;
            }

            visited[start] = true;
            stack.push(start);
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
            let mut area = 0u32;

            while let Some(index) = stack.pop() {
                let x = (index as u32) % width;
                let y = (index as u32) / width;
                area += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);

                let mut visit = |nx: u32, ny: u32| {
                    let n = (ny * width + nx) as usize;
                    if mask[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(x - 1, y);
                }
                if x + 1 < width {
                    visit(x + 1, y);
                }
                if y > 0 {
                    visit(x, y - 1);
                }
                if y + 1 < height {
                    visit(x, y + 1);
                }
            }

            if area >= self.config.min_area {
                regions.push(BoundingBox {
                    x: min_x,
                    y: min_y,
                    width: max_x - min_x + 1,
                    height: max_y - min_y + 1,
                });
            }
        }

        regions
    }
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u8
}

#[async_trait]
impl FaceDetector for BrightRegionDetector {
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>> {
        let detector = self.clone();
        let image = frame.image.clone();
        let camera_id = frame.camera_id;

        let faces = tokio::task::spawn_blocking(move || detector.detect(&image))
            .await
            .map_err(|e| Error::CapabilityFailure(format!("Face detection task failed: {}", e)))?;

        debug!(%camera_id, faces = faces.len(), "Face detection finished");
        Ok(faces)
    }
}
