//! Verified UI plan execution.
//!
//! Drives a desktop app through a serial input device or synthetic input,
//! checks every step against what is on screen, and leaves a trace, a
//! receipt and failure evidence under `<runs_dir>/<run_id>/`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde_json::json;

use uiplan::apply::{self, ActuatorChoice, ApplyOptions, load_documents};
use uiplan::core::mapper;
use uiplan::core::types::RunStatus;
use uiplan::exit_codes;
use uiplan::io::actuator::{Actuator, HardwareActuator};
use uiplan::io::config::{AppConfig, load_config};
use uiplan::io::documents::load_regions;
use uiplan::io::evidence::EvidenceMode;
use uiplan::io::frames::XcapGrabber;
use uiplan::io::ocr::{TesseractRecognizer, TextRecognizer};
use uiplan::io::serial::resolve_device;
use uiplan::logging;

const DEFAULT_CONFIG: &str = "uiplan.toml";

#[derive(Debug, Parser)]
#[command(
    name = "uiplan",
    version,
    about = "Execute verified UI automation plans"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a plan against the live app.
    Apply(ApplyArgs),
    /// Check a plan and its regions without touching the app.
    Validate(DocumentArgs),
    /// Capture the screen once and print the text recognized in a region.
    OcrDump(OcrDumpArgs),
    /// Check that the serial device answers.
    Ping(PingArgs),
}

#[derive(Debug, Args)]
struct DocumentArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    regions: PathBuf,
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("actuator").required(true).args(["device", "synthetic"])))]
struct ApplyArgs {
    #[command(flatten)]
    documents: DocumentArgs,
    /// Serial device path, or `auto`.
    #[arg(long, value_name = "PATH|auto")]
    device: Option<String>,
    /// Use OS synthetic input instead of the device.
    #[arg(long)]
    synthetic: bool,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    runs_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    evidence: Option<EvidenceMode>,
    /// Per-attempt budget for ops without `timeout_ms`.
    #[arg(long)]
    watchdog_ms: Option<u64>,
    /// Directory of anchor templates.
    #[arg(long)]
    anchors_pack: Option<PathBuf>,
    #[arg(long)]
    continue_on_failure: bool,
}

#[derive(Debug, Args)]
struct OcrDumpArgs {
    #[arg(long)]
    regions: PathBuf,
    #[arg(long)]
    region: String,
    /// Also save the region crop as PNG.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct PingArgs {
    #[arg(long, default_value = "auto", value_name = "PATH|auto")]
    device: String,
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            std::process::exit(code);
        }
    };
    logging::init();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Apply(args) => cmd_apply(args),
        Command::Validate(args) => cmd_validate(&args),
        Command::OcrDump(args) => cmd_ocr_dump(&args),
        Command::Ping(args) => cmd_ping(&args),
    }
}

/// Print `err` and return the invalid-invocation code.
fn invalid(err: anyhow::Error) -> i32 {
    eprintln!("{:#}", err);
    exit_codes::INVALID
}

fn status_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => exit_codes::OK,
        RunStatus::Failed => exit_codes::FAILED,
        RunStatus::Aborted => exit_codes::ABORTED,
    }
}

/// Config file plus the flags that override it.
fn apply_config(args: &ApplyArgs) -> Result<AppConfig> {
    let mut cfg = load_config(&args.documents.config)?;
    if let Some(runs_dir) = &args.runs_dir {
        cfg.runs_dir = runs_dir.clone();
    }
    if let Some(mode) = args.evidence {
        cfg.evidence.mode = mode;
    }
    if let Some(watchdog_ms) = args.watchdog_ms {
        cfg.watchdog_ms = watchdog_ms;
    }
    if let Some(pack) = &args.anchors_pack {
        cfg.anchors.pack = Some(pack.clone());
    }
    if args.continue_on_failure {
        cfg.continue_on_failure = true;
    }
    cfg.validate().context("validate command line overrides")?;
    Ok(cfg)
}

fn cmd_apply(args: ApplyArgs) -> Result<i32> {
    let cfg = match apply_config(&args) {
        Ok(cfg) => cfg,
        Err(err) => return Ok(invalid(err)),
    };
    let docs = match load_documents(&args.documents.plan, &args.documents.regions, &cfg) {
        Ok(docs) => docs,
        Err(err) => return Ok(invalid(err)),
    };
    let actuator = match args.device {
        Some(device) => ActuatorChoice::Device(device),
        None => ActuatorChoice::Synthetic,
    };
    let opts = ApplyOptions {
        plan_path: args.documents.plan.clone(),
        actuator,
        run_id: args.run_id.clone(),
    };
    match apply::apply(&opts, docs, &cfg) {
        Ok(outcome) => {
            println!(
                "{} {}",
                outcome.receipt.status.as_str(),
                outcome.run_dir.display()
            );
            Ok(status_code(outcome.receipt.status))
        }
        Err(err) => {
            eprintln!("{:#}", err);
            Ok(exit_codes::ABORTED)
        }
    }
}

fn cmd_validate(args: &DocumentArgs) -> Result<i32> {
    let checked = load_config(&args.config)
        .and_then(|cfg| load_documents(&args.plan, &args.regions, &cfg));
    match checked {
        Ok(docs) => {
            println!(
                "ok: {} ops, {} regions",
                docs.plan.ops.len(),
                docs.regions.regions.len()
            );
            Ok(exit_codes::OK)
        }
        Err(err) => Ok(invalid(err)),
    }
}

fn cmd_ocr_dump(args: &OcrDumpArgs) -> Result<i32> {
    let loaded = load_config(&args.config)
        .and_then(|cfg| load_regions(&args.regions).map(|regions| (cfg, regions)));
    let (cfg, regions) = match loaded {
        Ok(loaded) => loaded,
        Err(err) => return Ok(invalid(err)),
    };
    let Some(rect) = regions.get(&args.region) else {
        return Ok(invalid(anyhow::anyhow!(
            "unknown region '{}' in {}",
            args.region,
            args.regions.display()
        )));
    };
    let frame = XcapGrabber::capture_once(cfg.capture.origin).context("capture screen")?;
    let crop = mapper::crop(&frame, rect).with_context(|| format!("crop region '{}'", args.region))?;
    let lines = TesseractRecognizer::new(cfg.ocr.clone()).recognize(&crop.image)?;
    if let Some(out) = &args.out {
        save_png(out, &crop.image)?;
    }
    let dump = json!({
        "region": args.region,
        "rect": rect,
        "scale": frame.scale,
        "lines": lines
            .iter()
            .map(|line| json!({
                "text": line.text,
                "confidence": line.confidence,
                "bbox": line.bbox,
                "screen_bbox": crop.rect_to_screen(line.bbox),
            }))
            .collect::<Vec<_>>(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&dump).context("serialize ocr dump")?
    );
    Ok(exit_codes::OK)
}

fn save_png(path: &Path, image: &image::RgbaImage) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("write {}", path.display()))
}

fn cmd_ping(args: &PingArgs) -> Result<i32> {
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => return Ok(invalid(err)),
    };
    let path = resolve_device(&args.device)?;
    let actuator = HardwareActuator::open(&path, &cfg.serial_settings())
        .with_context(|| format!("open {}", path.display()))?;
    let started = Instant::now();
    actuator.ping().context("ping device")?;
    println!(
        "ok {} {} ms",
        path.display(),
        started.elapsed().as_millis()
    );
    Ok(exit_codes::OK)
}
