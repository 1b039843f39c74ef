//! Orchestration for `uiplan apply`.
//!
//! Connects the actuator, starts screen capture, runs the engine against a
//! fresh run directory and hands back the receipt. Capture and the SIGINT
//! hook are released on every return path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use signal_hook::consts::SIGINT;
use tracing::{debug, info, instrument, warn};

use crate::core::anchor_defaults::AnchorDefaults;
use crate::core::invariants::PlanContext;
use crate::core::plan::Plan;
use crate::core::regions::Regions;
use crate::engine::{Collaborators, Engine, EngineSettings, RunOutputs};
use crate::io::actuator::{Actuator, HardwareActuator};
use crate::io::anchor::{AnchorMatcher, TemplateAnchorMatcher};
use crate::io::config::AppConfig;
use crate::io::documents::{load_plan, load_regions};
use crate::io::frames::{FrameGrabber, FrameSource, XcapGrabber};
use crate::io::ocr::{TesseractRecognizer, TextRecognizer};
use crate::io::receipt::Receipt;
use crate::io::reliable::{Connector, ReliableActuator};
use crate::io::serial::resolve_device;
use crate::io::synthetic::SyntheticActuator;

/// Which input backend drives the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorChoice {
    /// Serial device path, or `auto` to pick the first one found.
    Device(String),
    Synthetic,
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub plan_path: PathBuf,
    pub actuator: ActuatorChoice,
    /// Defaults to a UTC timestamp.
    pub run_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub run_dir: PathBuf,
    pub receipt: Receipt,
}

#[derive(Debug, Clone)]
pub struct Documents {
    pub plan: Plan,
    pub regions: Regions,
}

/// Load the regions, then the plan checked against them and `cfg`.
pub fn load_documents(plan_path: &Path, regions_path: &Path, cfg: &AppConfig) -> Result<Documents> {
    let regions = load_regions(regions_path)?;
    let anchor_defaults = AnchorDefaults::new(&cfg.anchors.defaults);
    let ctx = PlanContext {
        regions: &regions,
        anchor_defaults: &anchor_defaults,
        modal_region: &cfg.modal.region,
    };
    let plan = load_plan(plan_path, &ctx)?;
    Ok(Documents { plan, regions })
}

/// `YYYYmmdd_HHMMSS` in UTC.
pub fn default_run_id() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Create `<runs_dir>/<run_id>`, refusing to reuse an existing run.
pub fn create_run_dir(runs_dir: &Path, run_id: &str) -> Result<PathBuf> {
    if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id == "." || run_id == ".." {
        bail!("invalid run id '{run_id}'");
    }
    let run_dir = runs_dir.join(run_id);
    if run_dir.exists() {
        bail!("run directory {} already exists", run_dir.display());
    }
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("create run directory {}", run_dir.display()))?;
    Ok(run_dir)
}

/// Connect the configured actuator. Hardware links are wrapped so a dropped
/// device is reconnected once before the run gives up on it.
pub fn connect_actuator(choice: &ActuatorChoice, cfg: &AppConfig) -> Result<Arc<dyn Actuator>> {
    match choice {
        ActuatorChoice::Synthetic => {
            let actuator = SyntheticActuator::new(cfg.synthetic_settings())
                .context("start synthetic input")?;
            Ok(Arc::new(actuator))
        }
        ActuatorChoice::Device(spec) => {
            let path = resolve_device(spec).context("resolve serial device")?;
            info!(device = %path.display(), "using serial device");
            let settings = cfg.serial_settings();
            let connector: Connector = Box::new(move || {
                let actuator = HardwareActuator::open(&path, &settings)?;
                Ok(Arc::new(actuator) as Arc<dyn Actuator>)
            });
            let reliable =
                ReliableActuator::new(connector, Duration::from_millis(cfg.serial.health_ping_ms))
                    .context("connect serial device")?;
            Ok(Arc::new(reliable))
        }
    }
}

pub fn start_capture(cfg: &AppConfig) -> Result<FrameSource> {
    let origin = cfg.capture.origin;
    FrameSource::start(
        move || Ok(Box::new(XcapGrabber::primary(origin)?) as Box<dyn FrameGrabber>),
        Duration::from_millis(cfg.capture.interval_ms),
        cfg.capture.capacity,
    )
    .context("start screen capture")
}

pub fn anchor_matcher(cfg: &AppConfig) -> Result<Option<Arc<dyn AnchorMatcher>>> {
    let Some(pack) = &cfg.anchors.pack else {
        return Ok(None);
    };
    let matcher = TemplateAnchorMatcher::new(pack)
        .with_context(|| format!("load anchor pack {}", pack.display()))?;
    Ok(Some(Arc::new(matcher) as Arc<dyn AnchorMatcher>))
}

/// Execute an already-loaded plan end to end.
#[instrument(skip_all, fields(plan = %opts.plan_path.display()))]
pub fn apply(opts: &ApplyOptions, docs: Documents, cfg: &AppConfig) -> Result<ApplyOutcome> {
    let run_id = opts.run_id.clone().unwrap_or_else(default_run_id);
    let actuator = connect_actuator(&opts.actuator, cfg)?;
    let anchors = anchor_matcher(cfg)?;
    let mut capture = start_capture(cfg)?;
    let run_dir = create_run_dir(&cfg.runs_dir, &run_id)?;
    info!(run_id = %run_id, run_dir = %run_dir.display(), "run started");

    let collaborators = Collaborators {
        actuator,
        frames: capture.buffer(),
        recognizer: Arc::new(TesseractRecognizer::new(cfg.ocr.clone())) as Arc<dyn TextRecognizer>,
        anchors,
    };
    let engine = Engine::new(collaborators, docs.regions, EngineSettings::from_config(cfg));
    let outputs = RunOutputs {
        run_id,
        run_dir: run_dir.clone(),
        plan_path: Some(opts.plan_path.clone()),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let sigint = signal_hook::flag::register(SIGINT, Arc::clone(&cancel))
        .context("install SIGINT handler")?;
    let result = engine.execute(&docs.plan, &outputs, &cancel);
    if !signal_hook::low_level::unregister(sigint) {
        warn!("SIGINT handler was already removed");
    }
    capture.stop();
    debug!("capture stopped");

    let receipt = result?;
    Ok(ApplyOutcome { run_dir, receipt })
}
