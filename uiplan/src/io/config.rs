//! Engine configuration stored in `uiplan.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::anchor_defaults::builtin_defaults;
use crate::core::frame::PixelOrigin;
use crate::core::modal::DEFAULT_MODAL_KEYWORDS;
use crate::core::types::Point;
use crate::io::actuator::SerialSettings;
use crate::io::evidence::{DEFAULT_MAX_OCR_LINES, EvidenceMode, EvidencePolicy};
use crate::io::frames::DEFAULT_CAPACITY;
use crate::io::ocr::TesseractOptions;
use crate::io::synthetic::SyntheticSettings;

/// Engine configuration (TOML).
///
/// Every field has a default, so an empty or missing file is valid. CLI flags
/// override individual values after loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Per-attempt budget for ops without their own `timeout_ms`.
    pub watchdog_ms: u64,

    /// Keep running later ops after one fails.
    pub continue_on_failure: bool,

    /// Press ESC twice before each retry.
    pub recovery_escape: bool,

    /// Parent directory for run outputs.
    pub runs_dir: PathBuf,

    pub evidence: EvidenceConfig,
    pub capture: CaptureConfig,
    pub ocr: TesseractOptions,
    pub serial: SerialConfig,
    pub synthetic: SyntheticConfig,
    pub modal: ModalConfig,
    pub anchors: AnchorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvidenceConfig {
    pub mode: EvidenceMode,
    /// Recognized lines kept per evidence file.
    pub max_ocr_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub interval_ms: u64,
    pub capacity: usize,
    /// How long an assertion waits for a frame newer than the action.
    pub frame_timeout_ms: u64,
    pub origin: PixelOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    pub baud: u32,
    pub read_timeout_ms: u64,
    /// Ping the device before a command when it has been idle this long.
    pub health_ping_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyntheticConfig {
    pub move_settle_ms: u64,
    pub click_settle_ms: u64,
    pub double_click_gap_ms: u64,
    pub home_x: i32,
    pub home_y: i32,
}

/// When the modal guard runs within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModalMode {
    Off,
    Before,
    #[default]
    Around,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModalConfig {
    pub mode: ModalMode,
    /// Region scanned for dialog text.
    pub region: String,
    pub keywords: Vec<String>,
    /// Region holding the dialog's cancel button, used with the anchor below.
    pub cancel_region: String,
    pub cancel_anchor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnchorsConfig {
    /// Directory of `<anchor_id>.png` templates. No pack means no matcher.
    pub pack: Option<PathBuf>,
    pub min_score: f64,
    /// Anchor id prefix to region id.
    pub defaults: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: 30_000,
            continue_on_failure: false,
            recovery_escape: true,
            runs_dir: PathBuf::from("runs"),
            evidence: EvidenceConfig::default(),
            capture: CaptureConfig::default(),
            ocr: TesseractOptions::default(),
            serial: SerialConfig::default(),
            synthetic: SyntheticConfig::default(),
            modal: ModalConfig::default(),
            anchors: AnchorsConfig::default(),
        }
    }
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            mode: EvidenceMode::Failures,
            max_ocr_lines: DEFAULT_MAX_OCR_LINES,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            capacity: DEFAULT_CAPACITY,
            frame_timeout_ms: 1_500,
            origin: PixelOrigin::TopLeft,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            read_timeout_ms: 2_000,
            health_ping_ms: 2_000,
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        let settings = SyntheticSettings::default();
        Self {
            move_settle_ms: settings.move_settle_ms,
            click_settle_ms: settings.click_settle_ms,
            double_click_gap_ms: settings.double_click_gap_ms,
            home_x: settings.home.x,
            home_y: settings.home.y,
        }
    }
}

impl Default for ModalConfig {
    fn default() -> Self {
        Self {
            mode: ModalMode::Around,
            region: "os.file_dialog".to_string(),
            keywords: DEFAULT_MODAL_KEYWORDS.iter().map(ToString::to_string).collect(),
            cancel_region: "os.file_dialog.cancel_button".to_string(),
            cancel_anchor: "macos.dialog.cancel_button".to_string(),
        }
    }
}

impl Default for AnchorsConfig {
    fn default() -> Self {
        Self {
            pack: None,
            min_score: 0.88,
            defaults: builtin_defaults(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watchdog_ms == 0 {
            return Err(anyhow!("watchdog_ms must be > 0"));
        }
        if self.evidence.max_ocr_lines == 0 {
            return Err(anyhow!("evidence.max_ocr_lines must be > 0"));
        }
        if self.capture.interval_ms == 0 {
            return Err(anyhow!("capture.interval_ms must be > 0"));
        }
        if self.capture.capacity == 0 {
            return Err(anyhow!("capture.capacity must be > 0"));
        }
        if self.serial.baud == 0 || self.serial.read_timeout_ms == 0 {
            return Err(anyhow!("serial.baud and serial.read_timeout_ms must be > 0"));
        }
        if self.ocr.command.is_empty() || self.ocr.command[0].trim().is_empty() {
            return Err(anyhow!("ocr.command must be a non-empty array"));
        }
        if self.ocr.timeout_ms == 0 {
            return Err(anyhow!("ocr.timeout_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.anchors.min_score) {
            return Err(anyhow!("anchors.min_score must be within [0, 1]"));
        }
        if self.modal.mode != ModalMode::Off && self.modal.region.trim().is_empty() {
            return Err(anyhow!("modal.region must be set unless modal.mode is off"));
        }
        if let Some((prefix, _)) = self
            .anchors
            .defaults
            .iter()
            .find(|(prefix, region)| prefix.is_empty() || region.is_empty())
        {
            return Err(anyhow!(
                "anchors.defaults entry '{prefix}' must map a non-empty prefix to a region"
            ));
        }
        Ok(())
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn evidence_policy(&self) -> EvidencePolicy {
        EvidencePolicy::from_mode(self.evidence.mode, self.evidence.max_ocr_lines)
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            baud: self.serial.baud,
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
        }
    }

    pub fn synthetic_settings(&self) -> SyntheticSettings {
        SyntheticSettings {
            move_settle_ms: self.synthetic.move_settle_ms,
            click_settle_ms: self.synthetic.click_settle_ms,
            double_click_gap_ms: self.synthetic.double_click_gap_ms,
            home: Point::new(self.synthetic.home_x, self.synthetic.home_y),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AppConfig::default()`.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let cfg = AppConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AppConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AppConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
