//! Run receipt (`receipt.json`).
//!
//! The receipt is written as soon as a run starts, with status `aborted`, and
//! rewritten atomically as operations finish. Only [`ReceiptWriter::finalize`]
//! moves it out of `aborted`; a process that dies mid-run therefore leaves an
//! honest record behind.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{ActuatorInfo, FailureKind, OpResult, RunStatus};

pub const RECEIPT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub schema_version: u32,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<String>,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub actuator: ActuatorInfo,
    pub ops: Vec<OpOutcome>,
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpOutcome {
    pub op_id: String,
    pub attempts: u32,
    pub result: OpResult,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub op_id: String,
    pub attempts: u32,
    pub kind: FailureKind,
    pub reason: String,
    /// Run-relative evidence directory, when evidence was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_dir: Option<String>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct ReceiptWriter {
    path: PathBuf,
    receipt: Receipt,
    finalized: bool,
}

impl ReceiptWriter {
    /// Create the receipt with status `aborted` and persist it immediately.
    pub fn begin(
        path: &Path,
        run_id: &str,
        plan_path: Option<&Path>,
        actuator: ActuatorInfo,
    ) -> Result<Self> {
        let receipt = Receipt {
            schema_version: RECEIPT_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            plan_path: plan_path.map(|p| p.display().to_string()),
            status: RunStatus::Aborted,
            started_at: now_rfc3339(),
            finished_at: None,
            actuator,
            ops: Vec::new(),
            failures: Vec::new(),
        };
        let writer = Self {
            path: path.to_path_buf(),
            receipt,
            finalized: false,
        };
        writer.persist()?;
        Ok(writer)
    }

    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn record_op(&mut self, outcome: OpOutcome) -> Result<()> {
        if self.finalized {
            bail!("receipt {} already finalized", self.path.display());
        }
        self.receipt.ops.push(outcome);
        self.persist()
    }

    pub fn record_failure(&mut self, failure: FailureRecord) -> Result<()> {
        if self.finalized {
            bail!("receipt {} already finalized", self.path.display());
        }
        self.receipt.failures.push(failure);
        self.persist()
    }

    /// Set the terminal status and persist. Later calls return the already
    /// finalized receipt and leave the file untouched.
    pub fn finalize(&mut self, status: RunStatus) -> Result<Receipt> {
        if self.finalized {
            if status != self.receipt.status {
                warn!(
                    requested = ?status,
                    kept = ?self.receipt.status,
                    "receipt already finalized, ignoring"
                );
            }
            return Ok(self.receipt.clone());
        }
        self.receipt.status = status;
        self.receipt.finished_at = Some(now_rfc3339());
        self.persist()?;
        self.finalized = true;
        debug!(status = ?status, path = %self.path.display(), "receipt finalized");
        Ok(self.receipt.clone())
    }

    fn persist(&self) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.receipt).context("serialize receipt")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

pub fn load_receipt(path: &Path) -> Result<Receipt> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read receipt {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse receipt {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("receipt path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp receipt {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace receipt {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actuator() -> ActuatorInfo {
        ActuatorInfo {
            kind: "hardware".to_string(),
            device: Some("/dev/cu.usbmodem1".to_string()),
        }
    }

    #[test]
    fn begins_as_aborted_on_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("receipt.json");
        let writer = ReceiptWriter::begin(&path, "run-1", None, actuator()).expect("begin");
        let on_disk = load_receipt(&path).expect("load");
        assert_eq!(on_disk.status, RunStatus::Aborted);
        assert_eq!(on_disk.finished_at, None);
        assert_eq!(&on_disk, writer.receipt());
    }

    /// A second finalize neither changes status nor rewrites the file.
    #[test]
    fn finalize_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("receipt.json");
        let mut writer = ReceiptWriter::begin(&path, "run-1", Some(Path::new("plan.json")), actuator())
            .expect("begin");
        writer
            .record_op(OpOutcome {
                op_id: "open".to_string(),
                attempts: 1,
                result: OpResult::Ok,
                duration_ms: 12,
                notes: None,
            })
            .expect("record");
        let first = writer.finalize(RunStatus::Success).expect("finalize");
        let bytes = fs::read(&path).expect("read");

        let second = writer.finalize(RunStatus::Failed).expect("finalize again");
        assert_eq!(second, first);
        assert_eq!(fs::read(&path).expect("read"), bytes);
        assert_eq!(load_receipt(&path).expect("load").status, RunStatus::Success);
        assert!(writer.record_op(first.ops[0].clone()).is_err());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
