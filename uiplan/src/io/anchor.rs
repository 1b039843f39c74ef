//! Anchor matching: locate a saved reference crop inside a live region.
//!
//! The engine treats the matcher as optional. When none is configured, anchor
//! clicks fall back to region centers and anchor assertions report
//! unsupported instead of passing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use image::{GrayImage, imageops};
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::core::frame::Frame;
use crate::core::mapper;
use crate::core::types::Rect;

/// Best location of an anchor, in screen points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorHit {
    pub score: f64,
    pub bbox: Rect,
}

pub trait AnchorMatcher: Send + Sync {
    /// Search `search` (screen points) of `frame` for `anchor_id`.
    /// `Ok(None)` means the anchor is unknown or nothing was found.
    fn locate(&self, anchor_id: &str, frame: &Frame, search: Rect) -> Result<Option<AnchorHit>>;
}

/// Matches `<pack>/<anchor_id>.png` templates by normalized cross-correlation
/// on grayscale pixels.
pub struct TemplateAnchorMatcher {
    pack_root: PathBuf,
    templates: Mutex<HashMap<String, Option<Arc<GrayImage>>>>,
}

impl TemplateAnchorMatcher {
    pub fn new(pack_root: &Path) -> Result<Self> {
        if !pack_root.is_dir() {
            anyhow::bail!("anchor pack {} is not a directory", pack_root.display());
        }
        Ok(Self {
            pack_root: pack_root.to_path_buf(),
            templates: Mutex::new(HashMap::new()),
        })
    }

    fn template(&self, anchor_id: &str) -> Result<Option<Arc<GrayImage>>> {
        if let Some(cached) = self.templates.lock().get(anchor_id) {
            return Ok(cached.clone());
        }
        let path = self.pack_root.join(format!("{anchor_id}.png"));
        let loaded = if path.exists() {
            let img = image::open(&path)
                .with_context(|| format!("load anchor template {}", path.display()))?;
            Some(Arc::new(img.to_luma8()))
        } else {
            debug!(anchor_id, path = %path.display(), "anchor template missing");
            None
        };
        self.templates
            .lock()
            .insert(anchor_id.to_string(), loaded.clone());
        Ok(loaded)
    }
}

impl AnchorMatcher for TemplateAnchorMatcher {
    #[instrument(skip(self, frame))]
    fn locate(&self, anchor_id: &str, frame: &Frame, search: Rect) -> Result<Option<AnchorHit>> {
        let Some(template) = self.template(anchor_id)? else {
            return Ok(None);
        };
        let crop = mapper::crop(frame, search).context("crop anchor search region")?;
        let haystack = imageops::grayscale(&crop.image);
        let Some((x, y, score)) = best_ncc(&haystack, &template) else {
            return Ok(None);
        };
        let local = Rect::new(
            x as i32,
            y as i32,
            template.width() as i32,
            template.height() as i32,
        );
        debug!(score, x, y, "anchor candidate");
        Ok(Some(AnchorHit {
            score,
            bbox: crop.rect_to_screen(local),
        }))
    }
}

/// Summed-area table of values and squared values.
struct Integral {
    width: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let width = w + 1;
        let mut sum = vec![0.0; width * (h + 1)];
        let mut sq = vec![0.0; width * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = f64::from(img.get_pixel(x as u32, y as u32).0[0]);
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * width + x + 1] = sum[y * width + x + 1] + row_sum;
                sq[(y + 1) * width + x + 1] = sq[y * width + x + 1] + row_sq;
            }
        }
        Self { width, sum, sq }
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let at = |xx: usize, yy: usize| table[yy * self.width + xx];
        at(x + w, y + h) - at(x, y + h) - at(x + w, y) + at(x, y)
    }
}

/// Best normalized cross-correlation of `needle` within `haystack`:
/// `(x, y, score)` with score in `[-1, 1]`. `None` when the needle does not
/// fit or is flat.
pub fn best_ncc(haystack: &GrayImage, needle: &GrayImage) -> Option<(u32, u32, f64)> {
    let (hw, hh) = (haystack.width() as usize, haystack.height() as usize);
    let (nw, nh) = (needle.width() as usize, needle.height() as usize);
    if nw == 0 || nh == 0 || nw > hw || nh > hh {
        return None;
    }
    let n = (nw * nh) as f64;
    let needle_px: Vec<f64> = needle.pixels().map(|p| f64::from(p.0[0])).collect();
    let needle_mean = needle_px.iter().sum::<f64>() / n;
    let needle_var = needle_px.iter().map(|v| (v - needle_mean).powi(2)).sum::<f64>();
    if needle_var <= f64::EPSILON {
        return None;
    }
    let centered: Vec<f64> = needle_px.iter().map(|v| v - needle_mean).collect();
    let integral = Integral::new(haystack);

    let mut best: Option<(u32, u32, f64)> = None;
    for y in 0..=(hh - nh) {
        for x in 0..=(hw - nw) {
            let sum = integral.window(&integral.sum, x, y, nw, nh);
            let sq = integral.window(&integral.sq, x, y, nw, nh);
            let window_var = sq - sum * sum / n;
            if window_var <= f64::EPSILON {
                continue;
            }
            let mut cross = 0.0;
            for ty in 0..nh {
                for tx in 0..nw {
                    let v = f64::from(haystack.get_pixel((x + tx) as u32, (y + ty) as u32).0[0]);
                    cross += v * centered[ty * nw + tx];
                }
            }
            let score = cross / (window_var * needle_var).sqrt();
            if best.is_none_or(|(_, _, s)| score > s) {
                best = Some((x as u32, y as u32, score));
            }
        }
    }
    best
}
