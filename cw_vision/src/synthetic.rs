//! ABOUTME: Synthetic frame source that renders test scenes for each camera
//! ABOUTME: Randomly places a bright face-like disk and can simulate offline cameras

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use cw_core::{utc_now, CameraId, Error, Result};
use image::{Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

use crate::{Frame, FrameSource, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH};

const BACKGROUND: Rgb<u8> = Rgb([48, 52, 60]);
const FACE: Rgb<u8> = Rgb([236, 220, 205]);

/// Renders a dim scene per camera, with a bright disk standing in for a face
/// on a configurable share of frames.
pub struct SyntheticFrameSource {
    width: u32,
    height: u32,
    face_probability: f64,
    rng: Mutex<StdRng>,
    offline: Mutex<HashSet<CameraId>>,
}

impl SyntheticFrameSource {
    pub fn new(face_probability: f64) -> Self {
        Self::with_rng(face_probability, StdRng::from_entropy())
    }

    /// Deterministic variant for reproducible runs
    pub fn seeded(face_probability: f64, seed: u64) -> Self {
        Self::with_rng(face_probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(face_probability: f64, rng: StdRng) -> Self {
        Self {
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
            face_probability: face_probability.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
            offline: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(48);
        self.height = height.max(48);
        self
    }

    /// Mark a camera unreachable (or reachable again)
    pub fn set_offline(&self, camera_id: CameraId, offline: bool) {
        let mut set = self
            .offline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if offline {
            set.insert(camera_id);
        } else {
            set.remove(&camera_id);
        }
    }

    fn is_offline(&self, camera_id: CameraId) -> bool {
        self.offline
            .lock()
            .map(|set| set.contains(&camera_id))
            .unwrap_or(false)
    }

    fn render(&self) -> RgbImage {
        let mut image = RgbImage::from_pixel(self.width, self.height, BACKGROUND);
        let disk = {
            let mut rng = self
                .rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if rng.gen_bool(self.face_probability) {
                let radius = rng.gen_range(8..=(self.height / 6).max(9));
                let cx = rng.gen_range(radius..self.width - radius);
                let cy = rng.gen_range(radius..self.height - radius);
                Some((cx, cy, radius))
            } else {
                None
            }
        };

        if let Some((cx, cy, radius)) = disk {
            draw_disk(&mut image, cx, cy, radius, FACE);
        }
        image
    }
}

pub(crate) fn draw_disk(image: &mut RgbImage, cx: u32, cy: u32, radius: u32, color: Rgb<u8>) {
    let r2 = i64::from(radius) * i64::from(radius);
    let x0 = cx.saturating_sub(radius);
    let y0 = cy.saturating_sub(radius);
    let x1 = (cx + radius).min(image.width() - 1);
    let y1 = (cy + radius).min(image.height() - 1);
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = i64::from(x) - i64::from(cx);
            let dy = i64::from(y) - i64::from(cy);
            if dx * dx + dy * dy <= r2 {
                image.put_pixel(x, y, color);
            }
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    async fn get_frame(&self, camera_id: CameraId) -> Result<Frame> {
        if self.is_offline(camera_id) {
            return Err(Error::CapabilityFailure(format!(
                "Camera {} is not responding",
                camera_id
            )));
        }
        trace!(%camera_id, "Rendering synthetic frame");
        Ok(Frame::new(camera_id, utc_now(), self.render()))
    }
}
