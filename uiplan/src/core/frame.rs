//! Captured screen frames.

use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Row order of a frame's pixel storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelOrigin {
    /// Row 0 is the top of the screen.
    #[default]
    TopLeft,
    /// Row 0 is the bottom of the screen.
    BottomLeft,
}

/// One captured frame. Cheap to clone; pixels are shared.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbaImage>,
    pub origin: PixelOrigin,
    /// Pixels per screen point (2.0 on HiDPI displays).
    pub scale: f64,
    pub captured_at: Instant,
    /// Producer-assigned sequence, strictly increasing per capture session.
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbaImage, origin: PixelOrigin, scale: f64, seq: u64) -> Self {
        Self {
            image: Arc::new(image),
            origin,
            scale,
            captured_at: Instant::now(),
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Frame pixels with rows in top-left order.
    pub fn upright(&self) -> RgbaImage {
        match self.origin {
            PixelOrigin::TopLeft => (*self.image).clone(),
            PixelOrigin::BottomLeft => image::imageops::flip_vertical(&*self.image),
        }
    }
}
