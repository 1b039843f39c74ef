//! Mapping between screen regions and frame pixels.
//!
//! Regions are screen points with a top-left origin. Frames may store rows
//! bottom-up and may be captured at a pixel density above one pixel per
//! point; both conversions live here and nowhere else.

use image::RgbaImage;
use image::imageops;
use thiserror::Error;

use crate::core::frame::{Frame, PixelOrigin};
use crate::core::types::{Point, Rect};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("region {rect:?} lies outside the {width}x{height} frame")]
    OutsideFrame { rect: Rect, width: u32, height: u32 },
}

/// An upright crop of a frame plus what is needed to map its pixels back to
/// screen points.
#[derive(Debug, Clone)]
pub struct RegionCrop {
    pub image: RgbaImage,
    /// Top-left of the crop in upright frame pixels.
    pub origin_px: Point,
    pub scale: f64,
}

impl RegionCrop {
    /// Map a crop-local pixel to a screen point.
    pub fn to_screen(&self, point: Point) -> Point {
        Point::new(
            px_to_pt(self.origin_px.x + point.x, self.scale),
            px_to_pt(self.origin_px.y + point.y, self.scale),
        )
    }

    /// Map a crop-local bounding box to screen points.
    pub fn rect_to_screen(&self, rect: Rect) -> Rect {
        let top_left = self.to_screen(Point::new(rect.x, rect.y));
        let bottom_right = self.to_screen(Point::new(rect.x + rect.w, rect.y + rect.h));
        Rect::new(
            top_left.x,
            top_left.y,
            (bottom_right.x - top_left.x).max(1),
            (bottom_right.y - top_left.y).max(1),
        )
    }
}

fn pt_to_px(value: i32, scale: f64) -> i32 {
    (f64::from(value) * scale).round() as i32
}

fn px_to_pt(value: i32, scale: f64) -> i32 {
    if scale <= 0.0 {
        return value;
    }
    (f64::from(value) / scale).floor() as i32
}

/// Crop `rect` (screen points, top-left origin) out of `frame`, clamped to
/// the frame bounds. The result is always upright.
pub fn crop(frame: &Frame, rect: Rect) -> Result<RegionCrop, MapError> {
    let (width, height) = (frame.width(), frame.height());
    let outside = || MapError::OutsideFrame {
        rect,
        width,
        height,
    };
    let scaled = Rect::new(
        pt_to_px(rect.x, frame.scale),
        pt_to_px(rect.y, frame.scale),
        pt_to_px(rect.w, frame.scale),
        pt_to_px(rect.h, frame.scale),
    );
    let bounds = Rect::new(0, 0, width as i32, height as i32);
    let clip = scaled.intersect(&bounds).ok_or_else(outside)?;

    let image = match frame.origin {
        PixelOrigin::TopLeft => imageops::crop_imm(
            &*frame.image,
            clip.x as u32,
            clip.y as u32,
            clip.w as u32,
            clip.h as u32,
        )
        .to_image(),
        PixelOrigin::BottomLeft => {
            let storage_y = height as i32 - clip.y - clip.h;
            let rows = imageops::crop_imm(
                &*frame.image,
                clip.x as u32,
                storage_y as u32,
                clip.w as u32,
                clip.h as u32,
            )
            .to_image();
            imageops::flip_vertical(&rows)
        }
    };

    Ok(RegionCrop {
        image,
        origin_px: Point::new(clip.x, clip.y),
        scale: frame.scale,
    })
}

/// Map a point inside a crop back to screen space.
pub fn region_point_to_screen(crop: &RegionCrop, point: Point) -> Point {
    crop.to_screen(point)
}
