//! Per-attempt evidence: what the engine saw when it decided.
//!
//! Layout under the run directory:
//!
//! - `failures/<op_id>/attempt-<n>.json|.frame.png|.region.png` for failed attempts
//! - `evidence/<op_id>/attempt-<n>.*` for successful attempts (mode `all`)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::frame::Frame;
use crate::core::types::{FailureKind, MatchMode, OcrLine, Point, Rect};

pub const DEFAULT_MAX_OCR_LINES: usize = 250;

/// Which attempts leave evidence behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceMode {
    None,
    #[default]
    Failures,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvidencePolicy {
    pub write_on_success: bool,
    pub write_on_failure: bool,
    pub max_ocr_lines: usize,
}

impl EvidencePolicy {
    pub fn from_mode(mode: EvidenceMode, max_ocr_lines: usize) -> Self {
        Self {
            write_on_success: mode == EvidenceMode::All,
            write_on_failure: mode != EvidenceMode::None,
            max_ocr_lines,
        }
    }
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self::from_mode(EvidenceMode::default(), DEFAULT_MAX_OCR_LINES)
    }
}

/// The line a text lookup settled on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChosenMatch {
    pub text: String,
    pub confidence: f64,
    pub score: f64,
    pub bbox: Rect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_point: Option<Point>,
}

/// Last region the attempt looked at, kept for the evidence dump.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub region: Option<String>,
    pub rect: Option<Rect>,
    pub target: Option<String>,
    pub mode: Option<MatchMode>,
    pub min_conf: Option<f64>,
    pub lines: Vec<OcrLine>,
    pub chosen: Option<ChosenMatch>,
    pub crop: Option<Arc<RgbaImage>>,
    pub frame: Option<Frame>,
}

/// How an attempt ended, as far as evidence is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Passed,
    Failed { kind: FailureKind, reason: String },
}

#[derive(Serialize)]
struct EvidenceRecord<'a> {
    op_id: &'a str,
    attempt: u32,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region_rect: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<MatchMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_conf: Option<f64>,
    lines: &'a [OcrLine],
    lines_truncated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    chosen: Option<&'a ChosenMatch>,
}

pub struct EvidenceWriter {
    run_dir: PathBuf,
    policy: EvidencePolicy,
}

impl EvidenceWriter {
    pub fn new(run_dir: &Path, policy: EvidencePolicy) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            policy,
        }
    }

    pub fn policy(&self) -> EvidencePolicy {
        self.policy
    }

    /// Write the artifacts for one attempt if the policy asks for them.
    /// Returns the run-relative directory that received them.
    #[instrument(skip_all, fields(op_id, attempt))]
    pub fn write(
        &self,
        op_id: &str,
        attempt: u32,
        verdict: &Verdict,
        observation: &Observation,
    ) -> Result<Option<String>> {
        let (wanted, bucket) = match verdict {
            Verdict::Passed => (self.policy.write_on_success, "evidence"),
            Verdict::Failed { .. } => (self.policy.write_on_failure, "failures"),
        };
        if !wanted {
            return Ok(None);
        }
        let relative = format!("{bucket}/{}", dir_name(op_id));
        let dir = self.run_dir.join(&relative);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

        let keep = observation.lines.len().min(self.policy.max_ocr_lines);
        let (kind, reason) = match verdict {
            Verdict::Passed => (None, None),
            Verdict::Failed { kind, reason } => (Some(*kind), Some(reason.as_str())),
        };
        let record = EvidenceRecord {
            op_id,
            attempt,
            ok: kind.is_none(),
            kind,
            reason,
            region: observation.region.as_deref(),
            region_rect: observation.rect,
            target: observation.target.as_deref(),
            mode: observation.mode,
            min_conf: observation.min_conf,
            lines: &observation.lines[..keep],
            lines_truncated: observation.lines.len() - keep,
            chosen: observation.chosen.as_ref(),
        };
        let stem = format!("attempt-{attempt}");
        let json_path = dir.join(format!("{stem}.json"));
        let mut buf = serde_json::to_string_pretty(&record).context("serialize evidence")?;
        buf.push('\n');
        fs::write(&json_path, buf).with_context(|| format!("write {}", json_path.display()))?;

        if let Some(frame) = &observation.frame {
            let path = dir.join(format!("{stem}.frame.png"));
            frame
                .upright()
                .save(&path)
                .with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(crop) = &observation.crop {
            let path = dir.join(format!("{stem}.region.png"));
            crop.save(&path)
                .with_context(|| format!("write {}", path.display()))?;
        }
        debug!(dir = %dir.display(), "evidence written");
        Ok(Some(relative))
    }
}

/// Op ids become directory names; anything outside `[A-Za-z0-9._-]` is replaced.
fn dir_name(op_id: &str) -> String {
    let cleaned: String = op_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
