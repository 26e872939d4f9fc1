//! ABOUTME: Placeholder frames for degraded streams and annotated JPEG snapshots
//! ABOUTME: Draws face boxes onto a copy of the frame before encoding

use std::io::Cursor;

use bytes::Bytes;
use cw_core::{utc_now, CameraId, Error, Result};
use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};

use crate::{BoundingBox, Frame, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH};

const JPEG_QUALITY: u8 = 85;
const BOX_COLOR: Rgb<u8> = Rgb([255, 32, 32]);
const BOX_THICKNESS: u32 = 2;

/// Gray test-card frame served while a camera is unreachable
pub fn placeholder_frame(camera_id: CameraId) -> Frame {
    let image = RgbImage::from_fn(DEFAULT_FRAME_WIDTH, DEFAULT_FRAME_HEIGHT, |x, y| {
        if (x + y) % 32 < 16 {
            Rgb([96, 96, 96])
        } else {
            Rgb([72, 72, 72])
        }
    });
    let mut frame = Frame::new(camera_id, utc_now(), image);
    frame.placeholder = true;
    frame
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) {
    let (width, height) = image.dimensions();
    if bbox.x >= width || bbox.y >= height || bbox.width == 0 || bbox.height == 0 {
        return;
    }
    let x1 = (bbox.x + bbox.width - 1).min(width - 1);
    let y1 = (bbox.y + bbox.height - 1).min(height - 1);

    for t in 0..BOX_THICKNESS {
        for x in bbox.x..=x1 {
            image.put_pixel(x, (bbox.y + t).min(y1), BOX_COLOR);
            image.put_pixel(x, y1.saturating_sub(t).max(bbox.y), BOX_COLOR);
        }
        for y in bbox.y..=y1 {
            image.put_pixel((bbox.x + t).min(x1), y, BOX_COLOR);
            image.put_pixel(x1.saturating_sub(t).max(bbox.x), y, BOX_COLOR);
        }
    }
}

/// Draw every face box onto a copy of the frame and encode it as JPEG
pub fn annotate_and_encode_jpeg(frame: &Frame, faces: &[BoundingBox]) -> Result<Bytes> {
    let mut image = frame.image.as_ref().clone();
    for bbox in faces {
        draw_box(&mut image, bbox);
    }

    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(&image)
        .map_err(|e| Error::Storage(format!("Failed to encode snapshot: {}", e)))?;

    Ok(Bytes::from(buffer.into_inner()))
}
