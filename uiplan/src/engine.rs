//! Plan execution engine.
//!
//! Ops run in plan order on the calling thread. Every attempt runs on its own
//! worker thread and streams trace events back over a channel; the control
//! thread appends them in order and enforces the attempt budget. When the
//! budget runs out the actuator is aborted at once and anything the worker
//! produces afterwards is dropped.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::anchor_defaults::AnchorDefaults;
use crate::core::frame::Frame;
use crate::core::mapper::{self, RegionCrop};
use crate::core::matcher::{TextMatch, best_match, first_token_match};
use crate::core::modal::{MODAL_MIN_CONF, ModalDetector};
use crate::core::op_state::OpState;
use crate::core::plan::{
    Action, Assertion, BROWSER_SEARCH_REGION, DEFAULT_TEXT_MIN_CONF, DEFAULT_TOKENS_MIN_CONF,
    DEVICE_CHAIN_CONTROLS_REGION, DEVICE_CHAIN_REGION, Operation, PLUGIN_WINDOW_BUTTON_ANCHOR,
    PLUGIN_WINDOW_REGION, Plan, TextTarget,
};
use crate::core::regions::Regions;
use crate::core::types::{FailureKind, MatchMode, OcrLine, OpResult, Point, Rect, RunStatus};
use crate::io::actuator::{Actuator, ActuatorError};
use crate::io::anchor::AnchorMatcher;
use crate::io::config::{AppConfig, ModalMode};
use crate::io::evidence::{ChosenMatch, EvidencePolicy, EvidenceWriter, Observation, Verdict};
use crate::io::frames::FrameProvider;
use crate::io::ocr::TextRecognizer;
use crate::io::receipt::{FailureRecord, OpOutcome, Receipt, ReceiptWriter};
use crate::io::trace::{Event, TraceWriter};

pub const RECEIPT_FILE: &str = "receipt.json";
pub const TRACE_FILE: &str = "trace.jsonl";

/// Longest the control thread blocks before re-checking cancel and budget.
const POLL_SLICE: Duration = Duration::from_millis(100);

const CLICK_SETTLE_MS: u64 = 120;
const PLUGIN_WINDOW_SETTLE_MS: u64 = 200;
const SEARCH_SETTLE_MS: u64 = 180;
const MODAL_ESCAPE_SETTLE_MS: u64 = 150;
const MODAL_CANCEL_SETTLE_MS: u64 = 200;
const MODAL_CANCEL_TEXT: &str = "Cancel";
const DEVICE_CHAIN_MIN_CONF: f64 = 0.70;
const PLUGIN_TITLE_MIN_CONF: f64 = 0.65;
const ESCAPE: &str = "ESC";
const SELECT_ALL: &str = "CMD+A";

/// Everything the engine drives or reads from.
#[derive(Clone)]
pub struct Collaborators {
    pub actuator: Arc<dyn Actuator>,
    pub frames: Arc<dyn FrameProvider>,
    pub recognizer: Arc<dyn TextRecognizer>,
    /// Optional; without it anchor clicks use region centers and anchor
    /// assertions report unsupported.
    pub anchors: Option<Arc<dyn AnchorMatcher>>,
}

#[derive(Debug, Clone)]
pub struct ModalGuard {
    pub mode: ModalMode,
    pub region: String,
    pub detector: ModalDetector,
    pub cancel_region: String,
    pub cancel_anchor: String,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Attempt budget for ops without `timeout_ms`.
    pub watchdog: Duration,
    pub continue_on_failure: bool,
    pub recovery_escape: bool,
    /// How long to wait for a frame newer than the last input.
    pub frame_timeout: Duration,
    pub evidence: EvidencePolicy,
    pub anchor_min_score: f64,
    pub anchor_defaults: AnchorDefaults,
    pub modal: ModalGuard,
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            watchdog: cfg.watchdog(),
            continue_on_failure: cfg.continue_on_failure,
            recovery_escape: cfg.recovery_escape,
            frame_timeout: Duration::from_millis(cfg.capture.frame_timeout_ms),
            evidence: cfg.evidence_policy(),
            anchor_min_score: cfg.anchors.min_score,
            anchor_defaults: AnchorDefaults::new(&cfg.anchors.defaults),
            modal: ModalGuard {
                mode: cfg.modal.mode,
                region: cfg.modal.region.clone(),
                detector: ModalDetector::new(&cfg.modal.keywords),
                cancel_region: cfg.modal.cancel_region.clone(),
                cancel_anchor: cfg.modal.cancel_anchor.clone(),
            },
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Where a run writes its trace, receipt and evidence.
#[derive(Debug, Clone)]
pub struct RunOutputs {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub plan_path: Option<PathBuf>,
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    fn action(err: anyhow::Error) -> Self {
        Self::new(FailureKind::ActionFailed, format!("{err:#}"))
    }

    fn assertion(err: anyhow::Error) -> Self {
        Self::new(FailureKind::AssertionFailed, format!("{err:#}"))
    }
}

impl From<ActuatorError> for AttemptFailure {
    fn from(err: ActuatorError) -> Self {
        let kind = if err.is_fatal() {
            FailureKind::ActuatorLost
        } else {
            FailureKind::ActionFailed
        };
        Self::new(kind, err.to_string())
    }
}

struct Shared {
    collaborators: Collaborators,
    regions: Regions,
    settings: EngineSettings,
    /// Last command sent to the actuator, by any attempt or recovery. Screen
    /// reads wait for a frame captured after it.
    last_input: Mutex<Option<Instant>>,
}

impl Shared {
    fn mark_input(&self) {
        *self.last_input.lock() = Some(Instant::now());
    }
}

pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(collaborators: Collaborators, regions: Regions, settings: EngineSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                collaborators,
                regions,
                settings,
                last_input: Mutex::new(None),
            }),
        }
    }

    /// Run every op of `plan`, writing outputs under `outputs.run_dir`.
    ///
    /// The receipt exists on disk (status `aborted`) before the first op runs
    /// and is finalized on every return path.
    #[instrument(skip_all, fields(run_id = %outputs.run_id, ops = plan.ops.len()))]
    pub fn execute(
        &self,
        plan: &Plan,
        outputs: &RunOutputs,
        cancel: &AtomicBool,
    ) -> Result<Receipt> {
        let started = Instant::now();
        fs::create_dir_all(&outputs.run_dir)
            .with_context(|| format!("create run directory {}", outputs.run_dir.display()))?;
        let mut receipt = ReceiptWriter::begin(
            &outputs.run_dir.join(RECEIPT_FILE),
            &outputs.run_id,
            outputs.plan_path.as_deref(),
            self.shared.collaborators.actuator.info(),
        )?;

        let attempt = (|| -> Result<RunStatus> {
            let trace = TraceWriter::create(&outputs.run_dir.join(TRACE_FILE), started)?;
            let evidence = EvidenceWriter::new(&outputs.run_dir, self.shared.settings.evidence);
            let mut run = PlanRun {
                shared: &self.shared,
                trace,
                evidence,
                receipt: &mut receipt,
                cancel,
            };
            run.run_ops(plan)
        })();

        match attempt {
            Ok(status) => {
                info!(status = ?status, elapsed_ms = started.elapsed().as_millis() as u64, "plan finished");
                receipt.finalize(status)
            }
            Err(err) => {
                if let Err(finalize_err) = receipt.finalize(RunStatus::Aborted) {
                    warn!(err = %finalize_err, "finalize receipt after error");
                }
                Err(err)
            }
        }
    }
}

/// Control-thread state for one plan run.
struct PlanRun<'a> {
    shared: &'a Arc<Shared>,
    trace: TraceWriter,
    evidence: EvidenceWriter,
    receipt: &'a mut ReceiptWriter,
    cancel: &'a AtomicBool,
}

struct OpReport {
    succeeded: bool,
    abort_run: bool,
}

enum Raced {
    Done(AttemptOutcome),
    TimedOut,
    Cancelled,
    /// The worker went away without reporting (it panicked).
    Lost,
}

impl PlanRun<'_> {
    fn run_ops(&mut self, plan: &Plan) -> Result<RunStatus> {
        let mut any_failed = false;
        for op in &plan.ops {
            if self.cancelled() {
                self.trace.append(&op.id, 0, Event::note("run_interrupted"))?;
                return Ok(RunStatus::Aborted);
            }
            let report = self.run_op(op)?;
            if report.abort_run {
                return Ok(RunStatus::Aborted);
            }
            if !report.succeeded {
                any_failed = true;
                if !self.shared.settings.continue_on_failure {
                    debug!(op_id = %op.id, "stopping after failed op");
                    break;
                }
            }
        }
        Ok(if any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        })
    }

    #[instrument(skip_all, fields(op_id = %op.id))]
    fn run_op(&mut self, op: &Operation) -> Result<OpReport> {
        let op_started = Instant::now();
        let budget = op.attempt_budget(self.shared.settings.watchdog);
        let mut state = OpState::start();
        let mut last_failure: Option<(AttemptFailure, Option<String>)> = None;
        let mut abort_run = false;

        while let Some(attempt) = state.attempt() {
            if self.cancelled() {
                abort_run = true;
                break;
            }
            if attempt > 1 {
                self.recover(op, attempt - 1, budget)?;
            }
            self.trace.append(
                &op.id,
                attempt,
                Event::note("attempt_started").with("budget_ms", budget.as_millis()),
            )?;

            let job = {
                let shared = Arc::clone(self.shared);
                let op = op.clone();
                move |ctl: &AttemptCtl| run_attempt(&shared, &op, ctl)
            };
            let (result, observation) = match self.race(&op.id, attempt, budget, job)? {
                Raced::Done(outcome) => (outcome.result, outcome.observation),
                Raced::TimedOut => {
                    self.abort_actuator(&op.id, attempt, "watchdog_abort")?;
                    let reason = format!("attempt exceeded {} ms budget", budget.as_millis());
                    (
                        Err(AttemptFailure::new(FailureKind::WatchdogTimeout, reason)),
                        self.snapshot(),
                    )
                }
                Raced::Cancelled => {
                    self.abort_actuator(&op.id, attempt, "interrupt_abort")?;
                    abort_run = true;
                    (
                        Err(AttemptFailure::new(FailureKind::ActionFailed, "run interrupted")),
                        self.snapshot(),
                    )
                }
                Raced::Lost => (
                    Err(AttemptFailure::new(
                        FailureKind::ActionFailed,
                        "attempt worker stopped without a result",
                    )),
                    self.snapshot(),
                ),
            };

            match result {
                Ok(()) => {
                    info!(attempt, "attempt succeeded");
                    self.trace
                        .append(&op.id, attempt, Event::note("attempt_succeeded"))?;
                    self.write_evidence(&op.id, attempt, &Verdict::Passed, &observation)?;
                    state = state.after_attempt(true, op.retries);
                }
                Err(failure) => {
                    warn!(attempt, kind = %failure.kind, reason = %failure.reason, "attempt failed");
                    self.trace.append(
                        &op.id,
                        attempt,
                        Event::note("attempt_failed")
                            .with("kind", failure.kind)
                            .with("reason", &failure.reason),
                    )?;
                    let verdict = Verdict::Failed {
                        kind: failure.kind,
                        reason: failure.reason.clone(),
                    };
                    let dir = self.write_evidence(&op.id, attempt, &verdict, &observation)?;
                    if failure.kind == FailureKind::ActuatorLost {
                        abort_run = true;
                    }
                    state = if abort_run {
                        OpState::Failed { attempts: attempt }
                    } else {
                        state.after_attempt(false, op.retries)
                    };
                    last_failure = Some((failure, dir));
                }
            }
        }

        let (attempts, succeeded) = match state {
            OpState::Succeeded { attempts } => (attempts, true),
            OpState::Failed { attempts } => (attempts, false),
            OpState::Attempting(n) => (n.saturating_sub(1), false),
            OpState::Pending => (0, false),
        };
        self.receipt.record_op(OpOutcome {
            op_id: op.id.clone(),
            attempts,
            result: if succeeded { OpResult::Ok } else { OpResult::Failed },
            duration_ms: op_started.elapsed().as_millis() as u64,
            notes: op.notes.clone(),
        })?;
        if !succeeded && let Some((failure, evidence_dir)) = last_failure {
            self.receipt.record_failure(FailureRecord {
                op_id: op.id.clone(),
                attempts,
                kind: failure.kind,
                reason: failure.reason,
                evidence_dir,
            })?;
        }
        Ok(OpReport {
            succeeded,
            abort_run,
        })
    }

    /// Double ESC (when enabled) plus the op's own recover actions, within
    /// the same per-attempt budget. Recovery problems are recorded, never fatal.
    fn recover(&mut self, op: &Operation, failed_attempt: u32, budget: Duration) -> Result<()> {
        let mut actions = Vec::new();
        if self.shared.settings.recovery_escape {
            for _ in 0..2 {
                actions.push(Action::KeyChord {
                    chord: ESCAPE.to_string(),
                });
            }
        }
        actions.extend(op.recover.iter().cloned());
        if actions.is_empty() {
            return Ok(());
        }
        self.trace
            .append(&op.id, failed_attempt, Event::note("recovery_started"))?;
        let job = {
            let shared = Arc::clone(self.shared);
            move |ctl: &AttemptCtl| {
                let mut attempt = Attempt::new(&shared, ctl);
                let result = actions.iter().try_for_each(|action| attempt.act(action));
                AttemptOutcome {
                    result,
                    observation: Observation::default(),
                }
            }
        };
        let event = match self.race(&op.id, failed_attempt, budget, job)? {
            Raced::Done(AttemptOutcome { result: Ok(()), .. }) => Event::note("recovery_done"),
            Raced::Done(AttemptOutcome {
                result: Err(failure),
                ..
            }) => Event::note("recovery_failed").with("reason", failure.reason),
            Raced::TimedOut => {
                self.abort_actuator(&op.id, failed_attempt, "watchdog_abort")?;
                Event::note("recovery_failed").with("reason", "recovery exceeded budget")
            }
            Raced::Cancelled => {
                self.abort_actuator(&op.id, failed_attempt, "interrupt_abort")?;
                Event::note("recovery_failed").with("reason", "run interrupted")
            }
            Raced::Lost => Event::note("recovery_failed").with("reason", "recovery worker stopped"),
        };
        self.trace.append(&op.id, failed_attempt, event)
    }

    /// Run `job` on a worker thread and wait for it, appending its events as
    /// they arrive, until it finishes, the budget runs out, or the run is
    /// cancelled.
    fn race<F>(&mut self, op_id: &str, attempt: u32, budget: Duration, job: F) -> Result<Raced>
    where
        F: FnOnce(&AttemptCtl) -> AttemptOutcome + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let ctl = AttemptCtl {
            tx,
            stop: Arc::clone(&stop),
        };
        thread::Builder::new()
            .name(format!("uiplan-attempt-{attempt}"))
            .spawn(move || {
                let outcome = job(&ctl);
                // The receiver is gone once the control thread gave up on us.
                let _ = ctl.tx.send(WorkerMsg::Done(outcome));
            })
            .context("spawn attempt worker")?;

        let deadline = Instant::now() + budget;
        loop {
            if self.cancelled() {
                stop.store(true, Ordering::SeqCst);
                return Ok(Raced::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                stop.store(true, Ordering::SeqCst);
                return Ok(Raced::TimedOut);
            }
            match rx.recv_timeout((deadline - now).min(POLL_SLICE)) {
                Ok(WorkerMsg::Event(event)) => self.trace.append(op_id, attempt, event)?,
                Ok(WorkerMsg::Done(outcome)) => return Ok(Raced::Done(outcome)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(Raced::Lost),
            }
        }
    }

    fn abort_actuator(&mut self, op_id: &str, attempt: u32, name: &str) -> Result<()> {
        let mut event = Event::note(name);
        let result = self.shared.collaborators.actuator.abort();
        self.shared.mark_input();
        if let Err(err) = result {
            warn!(err = %err, "actuator abort failed");
            event = event.with("error", err);
        }
        self.trace.append(op_id, attempt, event)
    }

    /// Observation for attempts that never reported one.
    fn snapshot(&self) -> Observation {
        Observation {
            frame: self
                .shared
                .collaborators
                .frames
                .latest_frame(Duration::ZERO)
                .ok(),
            ..Observation::default()
        }
    }

    fn write_evidence(
        &mut self,
        op_id: &str,
        attempt: u32,
        verdict: &Verdict,
        observation: &Observation,
    ) -> Result<Option<String>> {
        match self.evidence.write(op_id, attempt, verdict, observation) {
            Ok(Some(dir)) => {
                self.trace
                    .append(op_id, attempt, Event::note("evidence_written").with("dir", &dir))?;
                Ok(Some(dir))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(err = %format!("{err:#}"), op_id, attempt, "evidence write failed");
                Ok(None)
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

enum WorkerMsg {
    Event(Event),
    Done(AttemptOutcome),
}

/// Worker-side handle: event channel plus the abandon flag.
struct AttemptCtl {
    tx: Sender<WorkerMsg>,
    stop: Arc<AtomicBool>,
}

impl AttemptCtl {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(WorkerMsg::Event(event));
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

struct AttemptOutcome {
    result: Result<(), AttemptFailure>,
    observation: Observation,
}

fn run_attempt(shared: &Shared, op: &Operation, ctl: &AttemptCtl) -> AttemptOutcome {
    let mut attempt = Attempt::new(shared, ctl);
    let result = attempt.run(op);
    AttemptOutcome {
        result,
        observation: attempt.observation,
    }
}

struct RegionView {
    crop: RegionCrop,
    lines: Vec<OcrLine>,
}

/// Outcome of evaluating one assertion.
struct Check {
    passed: bool,
    event: Event,
    reason: String,
}

/// Worker-side state of one attempt.
struct Attempt<'a> {
    shared: &'a Shared,
    ctl: &'a AttemptCtl,
    observation: Observation,
}

impl<'a> Attempt<'a> {
    fn new(shared: &'a Shared, ctl: &'a AttemptCtl) -> Self {
        Self {
            shared,
            ctl,
            observation: Observation::default(),
        }
    }

    fn run(&mut self, op: &Operation) -> Result<(), AttemptFailure> {
        self.modal_guard("before")?;
        for assertion in &op.pre {
            self.check(assertion)?;
        }
        self.act(&op.action)?;
        if self.shared.settings.modal.mode == ModalMode::Around {
            self.modal_guard("after")?;
        }
        for assertion in &op.post {
            self.check(assertion)?;
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), AttemptFailure> {
        if self.ctl.stopped() {
            return Err(AttemptFailure::new(
                FailureKind::WatchdogTimeout,
                "attempt abandoned",
            ));
        }
        Ok(())
    }

    fn input<F>(&mut self, command: F) -> Result<(), AttemptFailure>
    where
        F: FnOnce(&dyn Actuator) -> Result<(), ActuatorError>,
    {
        self.checkpoint()?;
        let result = command(self.shared.collaborators.actuator.as_ref());
        self.shared.mark_input();
        result.map_err(AttemptFailure::from)
    }

    fn frame(&self) -> Result<Frame> {
        let frames = &self.shared.collaborators.frames;
        let timeout = self.shared.settings.frame_timeout;
        let last_input = *self.shared.last_input.lock();
        let frame = match last_input {
            Some(since) => frames.frame_after(since, timeout),
            None => frames.latest_frame(timeout),
        };
        frame.context("capture frame")
    }

    /// Capture, crop and recognize `region`, remembering it for evidence.
    fn observe(&mut self, region: &str) -> Result<RegionView> {
        let rect = self
            .shared
            .regions
            .get(region)
            .with_context(|| format!("unknown region '{region}'"))?;
        let frame = self.frame()?;
        let crop = mapper::crop(&frame, rect).with_context(|| format!("crop region '{region}'"))?;
        let lines = self
            .shared
            .collaborators
            .recognizer
            .recognize(&crop.image)
            .with_context(|| format!("recognize region '{region}'"))?;
        self.observation = Observation {
            region: Some(region.to_string()),
            rect: Some(rect),
            lines: lines.clone(),
            crop: Some(Arc::new(crop.image.clone())),
            frame: Some(frame),
            ..Observation::default()
        };
        Ok(RegionView { crop, lines })
    }

    fn note_target(&mut self, text: &str, mode: MatchMode, min_conf: f64) {
        self.observation.target = Some(text.to_string());
        self.observation.mode = Some(mode);
        self.observation.min_conf = Some(min_conf);
    }

    fn choose(&mut self, found: &TextMatch, screen_point: Option<Point>) {
        self.observation.chosen = Some(ChosenMatch {
            text: found.line.text.clone(),
            confidence: found.line.confidence,
            score: found.score,
            bbox: found.line.bbox,
            screen_point,
        });
    }

    fn act(&mut self, action: &Action) -> Result<(), AttemptFailure> {
        self.checkpoint()?;
        self.ctl.emit(describe_action(action));
        match action {
            Action::Home => self.input(|a| a.home()),
            Action::MoveTo { x, y } => {
                let point = Point::new(*x, *y);
                self.input(|a| a.move_to(point))
            }
            Action::Click { x, y } => {
                self.move_if_given(*x, *y)?;
                self.input(|a| a.click())
            }
            Action::DoubleClick { x, y } => {
                self.move_if_given(*x, *y)?;
                self.input(|a| a.double_click())
            }
            Action::KeyChord { chord } => self.input(|a| a.key_chord(chord)),
            Action::PressKeys { keys } => keys
                .iter()
                .try_for_each(|key| self.input(|a| a.key_chord(key))),
            Action::TypeText { text } => self.input(|a| a.type_text(text)),
            Action::Sleep { ms } => self.input(|a| a.sleep_ms(*ms)),
            Action::ClickOcrMatch { region, target } => self.click_text(region, target, false),
            Action::DblclickOcrMatch { region, target } => self.click_text(region, target, true),
            Action::ClickAnchor {
                anchor_id,
                fallback_region,
            } => self.click_anchor(anchor_id, fallback_region.as_deref()),
            Action::OpenPluginWindow {
                plugin_name,
                device_chain_text,
            } => self.open_plugin_window(plugin_name, device_chain_text.as_deref()),
            Action::SearchBrowser {
                query,
                fallback_region,
            } => self.search_browser(query, fallback_region.as_deref()),
            Action::AssertOnly => Ok(()),
        }
    }

    fn move_if_given(&mut self, x: Option<i32>, y: Option<i32>) -> Result<(), AttemptFailure> {
        match (x, y) {
            (Some(x), Some(y)) => self.input(|a| a.move_to(Point::new(x, y))),
            (None, None) => Ok(()),
            _ => Err(AttemptFailure::new(
                FailureKind::ActionFailed,
                "click coordinates need both x and y",
            )),
        }
    }

    fn click_at(&mut self, point: Point, double: bool) -> Result<(), AttemptFailure> {
        self.input(|a| a.move_to(point))?;
        if double {
            self.input(|a| a.double_click())?;
        } else {
            self.input(|a| a.click())?;
        }
        self.input(|a| a.sleep_ms(CLICK_SETTLE_MS))
    }

    fn click_text(
        &mut self,
        region: &str,
        target: &TextTarget,
        double: bool,
    ) -> Result<(), AttemptFailure> {
        let min_conf = target.min_conf.unwrap_or(DEFAULT_TEXT_MIN_CONF);
        let view = self.observe(region).map_err(AttemptFailure::action)?;
        self.note_target(&target.text, target.mode, min_conf);
        let Some(found) = best_match(&view.lines, &target.text, target.mode, min_conf) else {
            return Err(AttemptFailure::new(
                FailureKind::ActionFailed,
                format!(
                    "no {} match for '{}' in region '{region}'",
                    target.mode.as_str(),
                    target.text
                ),
            ));
        };
        let point = view.crop.to_screen(found.line.bbox.center());
        self.choose(&found, Some(point));
        self.ctl.emit(
            Event::note("text_located")
                .with("region", region)
                .with("text", &found.line.text)
                .with("score", format!("{:.2}", found.score))
                .with("x", point.x)
                .with("y", point.y),
        );
        self.click_at(point, double)
    }

    /// Search area for an anchor: the explicit region, else the default
    /// region for its prefix, else the whole frame.
    fn anchor_search(&self, explicit: Option<&str>, anchor_id: &str, frame: &Frame) -> Rect {
        let settings = &self.shared.settings;
        explicit
            .or_else(|| settings.anchor_defaults.resolve(anchor_id))
            .and_then(|region| self.shared.regions.get(region))
            .unwrap_or_else(|| full_frame(frame))
    }

    fn click_anchor(
        &mut self,
        anchor_id: &str,
        fallback: Option<&str>,
    ) -> Result<(), AttemptFailure> {
        let shared = self.shared;
        if let Some(matcher) = &shared.collaborators.anchors {
            let frame = self.frame().map_err(AttemptFailure::action)?;
            let search = self.anchor_search(fallback, anchor_id, &frame);
            match matcher.locate(anchor_id, &frame, search) {
                Ok(Some(hit)) if hit.score >= shared.settings.anchor_min_score => {
                    self.ctl.emit(
                        Event::note("anchor_located")
                            .with("anchor_id", anchor_id)
                            .with("score", format!("{:.3}", hit.score)),
                    );
                    return self.click_at(hit.bbox.center(), false);
                }
                Ok(Some(hit)) => self.ctl.emit(
                    Event::note("anchor_below_threshold")
                        .with("anchor_id", anchor_id)
                        .with("score", format!("{:.3}", hit.score)),
                ),
                Ok(None) => self
                    .ctl
                    .emit(Event::note("anchor_not_found").with("anchor_id", anchor_id)),
                Err(err) => {
                    warn!(anchor_id, err = %format!("{err:#}"), "anchor matcher failed");
                    self.ctl.emit(
                        Event::note("anchor_error")
                            .with("anchor_id", anchor_id)
                            .with("error", format!("{err:#}")),
                    );
                }
            }
        }

        let (source, region) = match fallback {
            Some(region) => ("fallback_region", region),
            None => match shared.settings.anchor_defaults.resolve(anchor_id) {
                Some(region) => ("default_region", region),
                None => {
                    return Err(AttemptFailure::new(
                        FailureKind::ActionFailed,
                        format!("anchor '{anchor_id}' not located and has no fallback region"),
                    ));
                }
            },
        };
        let rect = shared.regions.get(region).ok_or_else(|| {
            AttemptFailure::new(
                FailureKind::ActionFailed,
                format!("unknown region '{region}'"),
            )
        })?;
        self.ctl.emit(
            Event::note("anchor_fallback")
                .with("anchor_id", anchor_id)
                .with("source", source)
                .with("region", region),
        );
        self.click_at(rect.center(), false)
    }

    fn open_plugin_window(
        &mut self,
        plugin_name: &str,
        device_chain_text: Option<&str>,
    ) -> Result<(), AttemptFailure> {
        let target = TextTarget {
            text: device_chain_text.unwrap_or(plugin_name).to_string(),
            mode: MatchMode::Contains,
            min_conf: Some(DEVICE_CHAIN_MIN_CONF),
        };
        self.click_text(DEVICE_CHAIN_REGION, &target, false)?;
        self.click_anchor(PLUGIN_WINDOW_BUTTON_ANCHOR, Some(DEVICE_CHAIN_CONTROLS_REGION))?;
        self.input(|a| a.sleep_ms(PLUGIN_WINDOW_SETTLE_MS))?;
        self.ctl
            .emit(Event::note("open_plugin_window_done").with("plugin_name", plugin_name));
        Ok(())
    }

    fn search_browser(&mut self, query: &str, fallback: Option<&str>) -> Result<(), AttemptFailure> {
        let region = fallback.unwrap_or(BROWSER_SEARCH_REGION);
        let rect = self.shared.regions.get(region).ok_or_else(|| {
            AttemptFailure::new(
                FailureKind::ActionFailed,
                format!("unknown region '{region}'"),
            )
        })?;
        self.click_at(rect.center(), false)?;
        self.input(|a| a.key_chord(SELECT_ALL))?;
        self.input(|a| a.type_text(query))?;
        self.input(|a| a.sleep_ms(SEARCH_SETTLE_MS))
    }

    fn check(&mut self, assertion: &Assertion) -> Result<(), AttemptFailure> {
        self.checkpoint()?;
        let check = self.evaluate(assertion)?;
        self.ctl.emit(check.event.with("passed", check.passed));
        if check.passed {
            Ok(())
        } else {
            Err(AttemptFailure::new(FailureKind::AssertionFailed, check.reason))
        }
    }

    fn evaluate(&mut self, assertion: &Assertion) -> Result<Check, AttemptFailure> {
        let shared = self.shared;
        let event = Event::assert(assertion.name());
        match assertion {
            Assertion::UiTextContains {
                region,
                text,
                min_conf,
            } => {
                let min_conf = min_conf.unwrap_or(DEFAULT_TEXT_MIN_CONF);
                self.text_present(event, region, text, min_conf)
            }
            Assertion::UiTextContainsAny {
                region,
                tokens,
                min_conf,
            } => {
                let min_conf = min_conf.unwrap_or(DEFAULT_TOKENS_MIN_CONF);
                let view = self.observe(region).map_err(AttemptFailure::assertion)?;
                self.note_target(&tokens.join(" | "), MatchMode::Contains, min_conf);
                let found = first_token_match(&view.lines, tokens, min_conf);
                let mut event = event
                    .with("region", region)
                    .with("tokens", tokens.join("|"))
                    .with("min_conf", min_conf);
                if let Some((token, found)) = &found {
                    event = event.with("matched", token);
                    self.choose(found, None);
                }
                Ok(Check {
                    passed: found.is_some(),
                    event,
                    reason: format!(
                        "none of [{}] found in region '{region}'",
                        tokens.join(", ")
                    ),
                })
            }
            Assertion::UiAnchorPresent {
                anchor_id,
                region,
                min_score,
            } => {
                let Some(matcher) = &shared.collaborators.anchors else {
                    return Err(AttemptFailure::new(
                        FailureKind::Unsupported,
                        format!("ui_anchor_present '{anchor_id}' needs an anchor matcher"),
                    ));
                };
                let min_score = min_score.unwrap_or(shared.settings.anchor_min_score);
                let frame = self.frame().map_err(AttemptFailure::assertion)?;
                let search = self.anchor_search(region.as_deref(), anchor_id, &frame);
                let hit = matcher
                    .locate(anchor_id, &frame, search)
                    .with_context(|| format!("locate anchor '{anchor_id}'"))
                    .map_err(AttemptFailure::assertion)?;
                self.observation = Observation {
                    region: region.clone(),
                    rect: Some(search),
                    crop: mapper::crop(&frame, search)
                        .ok()
                        .map(|crop| Arc::new(crop.image)),
                    frame: Some(frame),
                    ..Observation::default()
                };
                let score = hit.map_or(0.0, |hit| hit.score);
                Ok(Check {
                    passed: hit.is_some_and(|hit| hit.score >= min_score),
                    event: event
                        .with("anchor_id", anchor_id)
                        .with("score", format!("{score:.3}"))
                        .with("min_score", min_score),
                    reason: format!(
                        "anchor '{anchor_id}' score {score:.3} below {min_score}"
                    ),
                })
            }
            Assertion::PluginWindowOpen { plugin_name } => self.text_present(
                event.with("plugin_name", plugin_name),
                PLUGIN_WINDOW_REGION,
                plugin_name,
                PLUGIN_TITLE_MIN_CONF,
            ),
            Assertion::NoModalDialog { region } => {
                let region = region.as_deref().unwrap_or(&shared.settings.modal.region);
                let view = self.observe(region).map_err(AttemptFailure::assertion)?;
                let keyword = shared.settings.modal.detector.detect(&view.lines);
                let mut event = event.with("region", region);
                if let Some(keyword) = keyword {
                    event = event.with("keyword", keyword);
                }
                Ok(Check {
                    passed: keyword.is_none(),
                    event,
                    reason: format!(
                        "modal dialog in region '{region}' ({})",
                        keyword.unwrap_or_default()
                    ),
                })
            }
        }
    }

    fn text_present(
        &mut self,
        event: Event,
        region: &str,
        text: &str,
        min_conf: f64,
    ) -> Result<Check, AttemptFailure> {
        let view = self.observe(region).map_err(AttemptFailure::assertion)?;
        self.note_target(text, MatchMode::Contains, min_conf);
        let found = best_match(&view.lines, text, MatchMode::Contains, min_conf);
        let mut event = event
            .with("region", region)
            .with("text", text)
            .with("min_conf", min_conf);
        if let Some(found) = &found {
            event = event.with("score", format!("{:.2}", found.score));
            self.choose(found, None);
        }
        Ok(Check {
            passed: found.is_some(),
            event,
            reason: format!("text '{text}' not found in region '{region}'"),
        })
    }

    /// Detect an OS dialog over the app and try to dismiss it: ESC twice,
    /// then the dialog's cancel button. Fails with `ModalBlocked` when the
    /// dialog survives both.
    fn modal_guard(&mut self, phase: &str) -> Result<(), AttemptFailure> {
        let shared = self.shared;
        let guard = &shared.settings.modal;
        if guard.mode == ModalMode::Off || !shared.regions.contains(&guard.region) {
            return Ok(());
        }
        let Some(keyword) = self.detect_modal(&guard.region) else {
            return Ok(());
        };
        self.ctl.emit(
            Event::note("modal_detected")
                .with("phase", phase)
                .with("keyword", &keyword),
        );

        self.input(|a| a.key_chord(ESCAPE))?;
        self.input(|a| a.key_chord(ESCAPE))?;
        self.input(|a| a.sleep_ms(MODAL_ESCAPE_SETTLE_MS))?;
        if self.detect_modal(&guard.region).is_none() {
            self.ctl
                .emit(Event::note("modal_dismissed").with("via", "escape"));
            return Ok(());
        }

        self.click_modal_cancel()?;
        match self.detect_modal(&guard.region) {
            None => {
                self.ctl
                    .emit(Event::note("modal_dismissed").with("via", "cancel"));
                Ok(())
            }
            Some(keyword) => Err(AttemptFailure::new(
                FailureKind::ModalBlocked,
                format!("modal dialog still open {phase} action (matched '{keyword}')"),
            )),
        }
    }

    /// Keyword seen in the modal region. Unreadable regions count as clear;
    /// the op's own assertions still judge the screen.
    fn detect_modal(&mut self, region: &str) -> Option<String> {
        match self.observe(region) {
            Ok(view) => self
                .shared
                .settings
                .modal
                .detector
                .detect(&view.lines)
                .map(str::to_string),
            Err(err) => {
                debug!(err = %format!("{err:#}"), "modal check skipped");
                self.ctl
                    .emit(Event::note("modal_check_skipped").with("error", format!("{err:#}")));
                None
            }
        }
    }

    fn click_modal_cancel(&mut self) -> Result<(), AttemptFailure> {
        let shared = self.shared;
        let guard = &shared.settings.modal;
        if let (Some(matcher), Some(rect)) = (
            &shared.collaborators.anchors,
            shared.regions.get(&guard.cancel_region),
        ) {
            let frame = self.frame().map_err(AttemptFailure::action)?;
            match matcher.locate(&guard.cancel_anchor, &frame, rect) {
                Ok(Some(hit)) if hit.score >= shared.settings.anchor_min_score => {
                    self.ctl.emit(
                        Event::action("modal_cancel")
                            .with("via", "anchor")
                            .with("score", format!("{:.3}", hit.score)),
                    );
                    let point = hit.bbox.center();
                    self.input(|a| a.home())?;
                    self.input(|a| a.move_to(point))?;
                    self.input(|a| a.click())?;
                    return self.input(|a| a.sleep_ms(MODAL_CANCEL_SETTLE_MS));
                }
                Ok(_) => {}
                Err(err) => warn!(err = %format!("{err:#}"), "cancel anchor lookup failed"),
            }
        }

        let Ok(view) = self.observe(&guard.region) else {
            return Ok(());
        };
        let Some(found) =
            best_match(&view.lines, MODAL_CANCEL_TEXT, MatchMode::Contains, MODAL_MIN_CONF)
        else {
            return Ok(());
        };
        let point = view.crop.to_screen(found.line.bbox.center());
        self.ctl.emit(
            Event::action("modal_cancel")
                .with("via", "text")
                .with("x", point.x)
                .with("y", point.y),
        );
        self.input(|a| a.move_to(point))?;
        self.input(|a| a.click())?;
        self.input(|a| a.sleep_ms(MODAL_CANCEL_SETTLE_MS))
    }
}

fn full_frame(frame: &Frame) -> Rect {
    let scale = if frame.scale > 0.0 { frame.scale } else { 1.0 };
    Rect::new(
        0,
        0,
        (f64::from(frame.width()) / scale) as i32,
        (f64::from(frame.height()) / scale) as i32,
    )
}

fn describe_action(action: &Action) -> Event {
    let event = Event::action(action.name());
    match action {
        Action::MoveTo { x, y } => event.with("x", x).with("y", y),
        Action::Click { x: Some(x), y: Some(y) } | Action::DoubleClick { x: Some(x), y: Some(y) } => {
            event.with("x", x).with("y", y)
        }
        Action::KeyChord { chord } => event.with("chord", chord),
        Action::PressKeys { keys } => event.with("keys", keys.join(" ")),
        Action::TypeText { text } => event.with("chars", text.chars().count()),
        Action::Sleep { ms } => event.with("ms", ms),
        Action::ClickOcrMatch { region, target } | Action::DblclickOcrMatch { region, target } => {
            event
                .with("region", region)
                .with("text", &target.text)
                .with("mode", target.mode.as_str())
        }
        Action::ClickAnchor {
            anchor_id,
            fallback_region,
        } => {
            let event = event.with("anchor_id", anchor_id);
            match fallback_region {
                Some(region) => event.with("fallback_region", region),
                None => event,
            }
        }
        Action::OpenPluginWindow { plugin_name, .. } => event.with("plugin_name", plugin_name),
        Action::SearchBrowser { query, .. } => event.with("query", query),
        _ => event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use parking_lot::Mutex;

    use crate::core::plan::{DEFAULT_RETRIES, Targets};
    use crate::core::types::EventKind;
    use crate::io::evidence::EvidenceMode;
    use crate::io::receipt::load_receipt;
    use crate::io::reliable::{Connector, ReliableActuator};
    use crate::io::trace::{ExecutionEvent, read_trace};
    use crate::test_support::{
        Call, FrameRead, RecordingActuator, ScriptedRecognizer, SolidFrames, line, regions,
    };

    const RESULTS: (u32, u32) = (200, 100);
    const DIALOG: (u32, u32) = (150, 80);

    fn screen_regions() -> Regions {
        regions(&[
            ("browser.search", Rect::new(10, 10, 100, 20)),
            ("browser.results", Rect::new(10, 40, 200, 100)),
            ("os.file_dialog", Rect::new(100, 100, 150, 80)),
            ("plugin.window", Rect::new(50, 150, 300, 120)),
            ("device.chain", Rect::new(0, 270, 300, 30)),
            ("device.chain.controls", Rect::new(300, 270, 60, 30)),
        ])
    }

    struct Harness {
        actuator: Arc<RecordingActuator>,
        recognizer: Arc<ScriptedRecognizer>,
        frames: Arc<SolidFrames>,
        settings: EngineSettings,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                actuator: RecordingActuator::new(),
                recognizer: ScriptedRecognizer::new(),
                frames: SolidFrames::new(400, 300),
                settings: EngineSettings::default(),
                dir: tempfile::tempdir().expect("tempdir"),
            }
        }

        fn run(&self, ops: Vec<Operation>) -> (Receipt, Vec<ExecutionEvent>) {
            let actuator: Arc<dyn Actuator> = Arc::clone(&self.actuator) as Arc<dyn Actuator>;
            self.run_with(actuator, ops, &AtomicBool::new(false))
        }

        fn run_with(
            &self,
            actuator: Arc<dyn Actuator>,
            ops: Vec<Operation>,
            cancel: &AtomicBool,
        ) -> (Receipt, Vec<ExecutionEvent>) {
            let collaborators = Collaborators {
                actuator,
                frames: Arc::clone(&self.frames) as Arc<dyn FrameProvider>,
                recognizer: Arc::clone(&self.recognizer) as Arc<dyn TextRecognizer>,
                anchors: None,
            };
            let engine = Engine::new(collaborators, screen_regions(), self.settings.clone());
            let plan = Plan {
                schema_version: 1,
                targets: Targets::default(),
                ops,
            };
            let outputs = RunOutputs {
                run_id: "test-run".to_string(),
                run_dir: self.run_dir(),
                plan_path: None,
            };
            let receipt = engine.execute(&plan, &outputs, cancel).expect("execute");
            let trace = read_trace(&outputs.run_dir.join(TRACE_FILE)).expect("trace");
            (receipt, trace)
        }

        fn run_dir(&self) -> PathBuf {
            self.dir.path().join("run")
        }
    }

    fn op(id: &str, action: Action) -> Operation {
        Operation {
            id: id.to_string(),
            pre: Vec::new(),
            action,
            post: Vec::new(),
            recover: Vec::new(),
            retries: DEFAULT_RETRIES,
            timeout_ms: None,
            notes: None,
        }
    }

    fn results_contain(text: &str) -> Assertion {
        Assertion::UiTextContains {
            region: "browser.results".to_string(),
            text: text.to_string(),
            min_conf: None,
        }
    }

    fn notes<'a>(trace: &'a [ExecutionEvent], name: &str) -> Vec<&'a ExecutionEvent> {
        trace
            .iter()
            .filter(|e| e.kind == EventKind::Note && e.name == name)
            .collect()
    }

    #[test]
    fn click_by_text_clicks_mapped_bbox_center() {
        let mut h = Harness::new();
        h.settings.evidence = EvidencePolicy::from_mode(EvidenceMode::All, 50);
        h.recognizer
            .always(RESULTS, vec![line("Serum", Rect::new(20, 30, 40, 10))]);
        let (receipt, trace) = h.run(vec![op(
            "pick",
            Action::ClickOcrMatch {
                region: "browser.results".to_string(),
                target: TextTarget {
                    text: "serum".to_string(),
                    mode: MatchMode::Contains,
                    min_conf: None,
                },
            },
        )]);

        assert_eq!(receipt.status, RunStatus::Success);
        assert_eq!(receipt.ops[0].attempts, 1);
        assert_eq!(h.actuator.clicked_points(), vec![Point::new(50, 75)]);
        assert!(h.actuator.calls().contains(&Call::SleepMs(CLICK_SETTLE_MS)));
        assert_eq!(notes(&trace, "text_located").len(), 1);
        assert!(h.run_dir().join("evidence/pick/attempt-1.json").exists());
        assert!(h.run_dir().join("evidence/pick/attempt-1.region.png").exists());
        assert_eq!(
            load_receipt(&h.run_dir().join(RECEIPT_FILE)).expect("receipt"),
            receipt
        );
    }

    /// Every failed attempt leaves one `attempt_failed` note and one evidence
    /// file; retries are preceded by the double-ESC recovery.
    #[test]
    fn failing_assertion_exhausts_retries_with_evidence() {
        let h = Harness::new();
        let mut check = op("check", Action::AssertOnly);
        check.post = vec![results_contain("Serum")];
        let (receipt, trace) = h.run(vec![check, op("never", Action::Home)]);

        assert_eq!(receipt.status, RunStatus::Failed);
        assert_eq!(receipt.ops.len(), 1);
        assert_eq!(receipt.ops[0].attempts, 3);
        assert_eq!(receipt.ops[0].result, OpResult::Failed);
        let failure = &receipt.failures[0];
        assert_eq!(failure.kind, FailureKind::AssertionFailed);
        assert_eq!(failure.evidence_dir.as_deref(), Some("failures/check"));
        assert_eq!(notes(&trace, "attempt_failed").len(), 3);
        for n in 1..=3 {
            let base = h.run_dir().join(format!("failures/check/attempt-{n}"));
            assert!(base.with_extension("json").exists());
            assert!(base.with_extension("frame.png").exists());
        }
        let escapes = h
            .actuator
            .calls()
            .iter()
            .filter(|c| **c == Call::KeyChord("ESC".to_string()))
            .count();
        assert_eq!(escapes, 4);
    }

    #[test]
    fn success_on_retry_records_attempt_count() {
        let h = Harness::new();
        h.recognizer.script(
            RESULTS,
            vec![Vec::new(), vec![line("Serum 1.3", Rect::new(0, 0, 50, 10))]],
        );
        let mut check = op("check", Action::AssertOnly);
        check.post = vec![results_contain("Serum")];
        let (receipt, trace) = h.run(vec![check]);

        assert_eq!(receipt.status, RunStatus::Success);
        assert_eq!(receipt.ops[0].attempts, 2);
        assert!(receipt.failures.is_empty());
        assert_eq!(notes(&trace, "attempt_failed").len(), 1);
        assert!(!h.run_dir().join("evidence").exists());
    }

    #[test]
    fn watchdog_aborts_hung_command() {
        let h = Harness::new();
        h.actuator.hang_on("sleep_ms");
        let mut slow = op("slow", Action::Sleep { ms: 10_000 });
        slow.timeout_ms = Some(100);
        slow.retries = 0;
        let started = Instant::now();
        let (receipt, trace) = h.run(vec![slow]);

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(receipt.status, RunStatus::Failed);
        assert_eq!(receipt.failures[0].kind, FailureKind::WatchdogTimeout);
        assert!(h.actuator.calls().contains(&Call::Abort));
        assert_eq!(notes(&trace, "watchdog_abort").len(), 1);
        assert_eq!(notes(&trace, "attempt_failed").len(), 1);
    }

    #[test]
    fn watchdog_abort_reaches_actuator_before_the_retry() {
        let h = Harness::new();
        h.actuator.hang_on("sleep_ms");
        let mut slow = op("slow", Action::Sleep { ms: 10_000 });
        slow.timeout_ms = Some(100);
        slow.retries = 1;
        let (receipt, trace) = h.run(vec![slow]);

        assert_eq!(receipt.ops[0].attempts, 2);
        assert_eq!(receipt.failures[0].kind, FailureKind::WatchdogTimeout);
        let calls = h.actuator.calls();
        let sleeps: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, call)| **call == Call::SleepMs(10_000))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(sleeps.len(), 2, "{calls:?}");
        let first_abort = calls
            .iter()
            .position(|call| *call == Call::Abort)
            .expect("abort");
        assert!(sleeps[0] < first_abort && first_abort < sleeps[1], "{calls:?}");

        let second_attempt_started = trace
            .iter()
            .position(|e| e.name == "attempt_started" && e.attempt_index == 2)
            .expect("second attempt");
        let first_watchdog = trace
            .iter()
            .position(|e| e.name == "watchdog_abort")
            .expect("watchdog note");
        assert!(first_watchdog < second_attempt_started);
    }

    #[test]
    fn passing_plan_with_failure_only_evidence_leaves_only_trace_and_receipt() {
        let h = Harness::new();
        h.recognizer
            .always(RESULTS, vec![line("Serum", Rect::new(20, 30, 40, 10))]);
        let mut check = op("check", Action::AssertOnly);
        check.post = vec![results_contain("Serum")];
        let (receipt, _) = h.run(vec![op("home", Action::Home), check]);

        assert_eq!(receipt.status, RunStatus::Success);
        let mut entries: Vec<String> = fs::read_dir(h.run_dir())
            .expect("read run dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(entries, vec![RECEIPT_FILE.to_string(), TRACE_FILE.to_string()]);
    }

    #[test]
    fn one_failing_op_leaves_one_evidence_directory() {
        let mut h = Harness::new();
        h.settings.continue_on_failure = true;
        h.recognizer
            .always(RESULTS, vec![line("Serum", Rect::new(20, 30, 40, 10))]);
        let mut passes = op("passes", Action::AssertOnly);
        passes.post = vec![results_contain("Serum")];
        let mut fails = op("fails", Action::AssertOnly);
        fails.post = vec![results_contain("Diva")];
        fails.retries = 0;
        let (receipt, _) = h.run(vec![passes, fails, op("home", Action::Home)]);

        assert_eq!(receipt.status, RunStatus::Failed);
        assert_eq!(receipt.ops.len(), 3);
        assert!(!h.run_dir().join("evidence").exists());
        let dirs: Vec<String> = fs::read_dir(h.run_dir().join("failures"))
            .expect("failures dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(dirs, vec!["fails".to_string()]);
        assert_eq!(receipt.failures[0].evidence_dir.as_deref(), Some("failures/fails"));
    }

    #[test]
    fn reads_after_an_earlier_op_wait_for_a_newer_frame() {
        let h = Harness::new();
        h.recognizer
            .always(RESULTS, vec![line("Serum", Rect::new(20, 30, 40, 10))]);
        let click = op(
            "click",
            Action::Click {
                x: Some(5),
                y: Some(5),
            },
        );
        let mut check = op("check", Action::AssertOnly);
        check.post = vec![results_contain("Serum")];
        let (receipt, _) = h.run(vec![click, check]);

        assert_eq!(receipt.status, RunStatus::Success);
        let reads = h.frames.reads();
        assert_eq!(reads.first(), Some(&FrameRead::Latest));
        assert!(reads.len() >= 3, "{reads:?}");
        assert!(reads[1..].iter().all(|read| *read == FrameRead::After), "{reads:?}");
    }

    #[test]
    fn recovery_input_counts_for_the_retry_reads() {
        let mut h = Harness::new();
        h.settings.modal.mode = ModalMode::Off;
        h.recognizer.script(
            RESULTS,
            vec![Vec::new(), vec![line("Serum", Rect::new(20, 30, 40, 10))]],
        );
        let mut check = op("check", Action::AssertOnly);
        check.post = vec![results_contain("Serum")];
        check.retries = 1;
        let (receipt, _) = h.run(vec![check]);

        assert_eq!(receipt.ops[0].attempts, 2);
        assert_eq!(h.frames.reads(), vec![FrameRead::Latest, FrameRead::After]);
    }

    #[test]
    fn lost_actuator_aborts_the_plan() {
        let h = Harness::new();
        let link = RecordingActuator::new();
        let links = Mutex::new(vec![Arc::clone(&link)].into_iter());
        let connector: Connector = Box::new(move || match links.lock().next() {
            Some(link) => Ok(link as Arc<dyn Actuator>),
            None => Err(ActuatorError::DeviceUnavailable("unplugged".to_string())),
        });
        let reliable = ReliableActuator::new(connector, Duration::from_secs(60)).expect("connect");
        link.fail_link(true);

        let (receipt, _) = h.run_with(
            Arc::new(reliable),
            vec![op("first", Action::Home), op("second", Action::Home)],
            &AtomicBool::new(false),
        );
        assert_eq!(receipt.status, RunStatus::Aborted);
        assert_eq!(receipt.ops.len(), 1);
        assert_eq!(receipt.ops[0].attempts, 1);
        assert_eq!(receipt.failures[0].kind, FailureKind::ActuatorLost);
    }

    #[test]
    fn anchor_assertion_without_matcher_is_unsupported() {
        let h = Harness::new();
        let mut check = op("anchor", Action::AssertOnly);
        check.retries = 0;
        check.post = vec![Assertion::UiAnchorPresent {
            anchor_id: "serum.preset_menu".to_string(),
            region: None,
            min_score: None,
        }];
        let (receipt, _) = h.run(vec![check]);
        assert_eq!(receipt.status, RunStatus::Failed);
        assert_eq!(receipt.failures[0].kind, FailureKind::Unsupported);
    }

    #[test]
    fn click_anchor_falls_back_to_default_region_center() {
        let h = Harness::new();
        let (receipt, trace) = h.run(vec![op(
            "menu",
            Action::ClickAnchor {
                anchor_id: "serum.preset_menu".to_string(),
                fallback_region: None,
            },
        )]);
        assert_eq!(receipt.status, RunStatus::Success);
        assert_eq!(h.actuator.clicked_points(), vec![Point::new(200, 210)]);
        let fallback = notes(&trace, "anchor_fallback");
        assert_eq!(fallback[0].details["source"], "default_region");
    }

    #[test]
    fn continue_on_failure_runs_remaining_ops() {
        let mut h = Harness::new();
        h.settings.continue_on_failure = true;
        let mut broken = op(
            "broken",
            Action::ClickAnchor {
                anchor_id: "custom.knob".to_string(),
                fallback_region: None,
            },
        );
        broken.retries = 0;
        let (receipt, _) = h.run(vec![broken, op("home", Action::Home)]);

        assert_eq!(receipt.status, RunStatus::Failed);
        assert_eq!(receipt.ops.len(), 2);
        assert_eq!(receipt.ops[1].result, OpResult::Ok);
        assert_eq!(receipt.failures[0].kind, FailureKind::ActionFailed);
        assert!(receipt.failures[0].reason.contains("custom.knob"));
    }

    #[test]
    fn modal_guard_dismisses_dialog_with_escape() {
        let h = Harness::new();
        h.recognizer.script(
            DIALOG,
            vec![vec![line("Save changes?", Rect::new(5, 5, 80, 12))], Vec::new()],
        );
        let (receipt, trace) = h.run(vec![op("home", Action::Home)]);

        assert_eq!(receipt.status, RunStatus::Success);
        assert_eq!(
            h.actuator.calls(),
            vec![
                Call::KeyChord("ESC".to_string()),
                Call::KeyChord("ESC".to_string()),
                Call::SleepMs(MODAL_ESCAPE_SETTLE_MS),
                Call::Home,
            ]
        );
        assert_eq!(notes(&trace, "modal_detected").len(), 1);
        assert_eq!(notes(&trace, "modal_dismissed")[0].details["via"], "escape");
    }

    #[test]
    fn persistent_modal_blocks_the_op() {
        let h = Harness::new();
        h.recognizer.always(
            DIALOG,
            vec![line("Replace existing file?", Rect::new(5, 5, 120, 12))],
        );
        let mut home = op("home", Action::Home);
        home.retries = 0;
        let (receipt, _) = h.run(vec![home]);

        assert_eq!(receipt.failures[0].kind, FailureKind::ModalBlocked);
        assert!(!h.actuator.calls().contains(&Call::Home));
    }

    #[test]
    fn cancelled_run_is_aborted_before_any_op() {
        let h = Harness::new();
        let actuator: Arc<dyn Actuator> = Arc::clone(&h.actuator) as Arc<dyn Actuator>;
        let (receipt, trace) = h.run_with(
            actuator,
            vec![op("home", Action::Home)],
            &AtomicBool::new(true),
        );
        assert_eq!(receipt.status, RunStatus::Aborted);
        assert!(receipt.finished_at.is_some());
        assert!(receipt.ops.is_empty());
        assert_eq!(notes(&trace, "run_interrupted").len(), 1);
        assert!(h.actuator.calls().is_empty());
    }

    #[test]
    fn search_browser_selects_and_types_query() {
        let h = Harness::new();
        let (receipt, _) = h.run(vec![op(
            "search",
            Action::SearchBrowser {
                query: "Serum".to_string(),
                fallback_region: None,
            },
        )]);
        assert_eq!(receipt.status, RunStatus::Success);
        let calls = h.actuator.calls();
        assert_eq!(calls[0], Call::MoveTo(Point::new(60, 20)));
        assert!(calls.contains(&Call::KeyChord("CMD+A".to_string())));
        assert!(calls.contains(&Call::TypeText("Serum".to_string())));
        assert_eq!(calls.last(), Some(&Call::SleepMs(SEARCH_SETTLE_MS)));
    }

    #[test]
    fn settings_follow_config() {
        let mut cfg = AppConfig::default();
        cfg.anchors.defaults = BTreeMap::from([("x.".to_string(), "r".to_string())]);
        cfg.modal.mode = ModalMode::Off;
        let settings = EngineSettings::from_config(&cfg);
        assert_eq!(settings.anchor_defaults.resolve("x.y"), Some("r"));
        assert_eq!(settings.anchor_defaults.resolve("serum.a"), None);
        assert_eq!(settings.modal.mode, ModalMode::Off);
        assert_eq!(settings.watchdog, Duration::from_secs(30));
    }
}
