//! Text recognition over cropped regions.
//!
//! [`TextRecognizer`] is the seam between the engine and the OCR backend.
//! [`TesseractRecognizer`] pipes a PNG into the `tesseract` CLI, reads TSV
//! word boxes back, and groups them into lines.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{OcrLine, Rect};
use crate::io::process::run_piped;

/// Recognizes text lines in an upright image. Line boxes are image-local,
/// top-left origin, sorted top-to-bottom then left-to-right.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &RgbaImage) -> Result<Vec<OcrLine>>;
}

/// `tesseract` invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TesseractOptions {
    /// Program and leading arguments (e.g. `["tesseract"]`).
    pub command: Vec<String>,
    pub language: String,
    /// Page segmentation mode; 11 finds sparse text anywhere in the crop.
    pub psm: u32,
    pub timeout_ms: u64,
    /// Lines shorter than this fraction of the image height are dropped.
    pub min_text_height: f64,
    pub output_limit_bytes: usize,
}

impl Default for TesseractOptions {
    fn default() -> Self {
        Self {
            command: vec!["tesseract".to_string()],
            language: "eng".to_string(),
            psm: 11,
            timeout_ms: 10_000,
            min_text_height: 0.02,
            output_limit_bytes: 1_000_000,
        }
    }
}

pub struct TesseractRecognizer {
    options: TesseractOptions,
}

impl TesseractRecognizer {
    pub fn new(options: TesseractOptions) -> Self {
        Self { options }
    }

    fn command(&self) -> Result<Command> {
        let (program, args) = self
            .options
            .command
            .split_first()
            .context("ocr.command must be non-empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(&self.options.language)
            .arg("--psm")
            .arg(self.options.psm.to_string())
            // Raw recognition: no dictionary-driven correction.
            .arg("-c")
            .arg("load_system_dawg=0")
            .arg("-c")
            .arg("load_freq_dawg=0")
            .arg("tsv");
        Ok(cmd)
    }
}

impl TextRecognizer for TesseractRecognizer {
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    fn recognize(&self, image: &RgbaImage) -> Result<Vec<OcrLine>> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("encode crop as png")?;

        let output = run_piped(
            self.command()?,
            &png,
            Duration::from_millis(self.options.timeout_ms),
            self.options.output_limit_bytes,
        )
        .context("run tesseract")?;
        if output.timed_out {
            bail!("tesseract timed out after {} ms", self.options.timeout_ms);
        }
        if !output.status.success() {
            bail!(
                "tesseract exited with {:?}: {}",
                output.status.code(),
                output.stderr_text()
            );
        }
        let tsv = String::from_utf8_lossy(&output.stdout);
        let lines = parse_tsv(&tsv, image.height(), self.options.min_text_height);
        debug!(lines = lines.len(), "recognized text");
        Ok(lines)
    }
}

#[derive(Default)]
struct LineAccumulator {
    words: Vec<String>,
    confidence_sum: f64,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

impl LineAccumulator {
    fn add(&mut self, text: &str, conf: f64, bbox: Rect) {
        if self.words.is_empty() {
            self.left = bbox.x;
            self.top = bbox.y;
            self.right = bbox.x + bbox.w;
            self.bottom = bbox.y + bbox.h;
        } else {
            self.left = self.left.min(bbox.x);
            self.top = self.top.min(bbox.y);
            self.right = self.right.max(bbox.x + bbox.w);
            self.bottom = self.bottom.max(bbox.y + bbox.h);
        }
        self.words.push(text.to_string());
        self.confidence_sum += conf;
    }

    fn finish(self) -> OcrLine {
        let confidence = self.confidence_sum / self.words.len() as f64 / 100.0;
        OcrLine {
            text: self.words.join(" "),
            confidence: confidence.clamp(0.0, 1.0),
            bbox: Rect::new(
                self.left,
                self.top,
                self.right - self.left,
                self.bottom - self.top,
            ),
        }
    }
}

/// Group tesseract TSV word rows into lines.
///
/// Rows that are not words (level != 5), carry no text, or have a negative
/// confidence are skipped. Lines shorter than `min_text_height` times
/// `image_height` are dropped.
pub fn parse_tsv(tsv: &str, image_height: u32, min_text_height: f64) -> Vec<OcrLine> {
    let mut grouped: BTreeMap<(u32, u32, u32, u32), LineAccumulator> = BTreeMap::new();
    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        let Ok(conf) = cols[10].trim().parse::<f64>() else {
            continue;
        };
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        let nums: Option<Vec<i32>> = cols[1..10].iter().map(|c| c.trim().parse().ok()).collect();
        let Some(nums) = nums else {
            continue;
        };
        let key = (nums[0] as u32, nums[1] as u32, nums[2] as u32, nums[3] as u32);
        let bbox = Rect::new(nums[5], nums[6], nums[7], nums[8]);
        grouped.entry(key).or_default().add(text, conf, bbox);
    }

    let min_height = f64::from(image_height) * min_text_height;
    let mut lines: Vec<OcrLine> = grouped
        .into_values()
        .map(LineAccumulator::finish)
        .filter(|line| f64::from(line.bbox.h) >= min_height)
        .collect();
    lines.sort_by_key(|line| (line.bbox.y, line.bbox.x));
    lines
}
