//! Plan-level tests: documents loaded from disk, executed by the engine over
//! scripted collaborators, outputs read back from the run directory.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use uiplan::apply::load_documents;
use uiplan::core::types::{EventKind, FailureKind, OpResult, Point, Rect, RunStatus};
use uiplan::engine::{Collaborators, Engine, EngineSettings, RECEIPT_FILE, RunOutputs, TRACE_FILE};
use uiplan::io::actuator::Actuator;
use uiplan::io::config::AppConfig;
use uiplan::io::ocr::TextRecognizer;
use uiplan::io::receipt::load_receipt;
use uiplan::io::trace::read_trace;
use uiplan::test_support::{
    Call, RecordingActuator, ScriptedRecognizer, SolidFrames, line, run_dir, write_fixture,
};

const REGIONS: &str = r#"{
    "schema_version": 1,
    "regions": {
        "browser.search": {"x": 10, "y": 10, "w": 100, "h": 20},
        "browser.results": {"x": 10, "y": 40, "w": 200, "h": 100},
        "os.file_dialog": {"x": 100, "y": 100, "w": 150, "h": 80},
        "plugin.window": {"x": 50, "y": 150, "w": 300, "h": 120}
    }
}"#;

/// Search the browser, open the plugin (its window shows up one attempt
/// late), then check no dialog is left over.
const PLAN: &str = r#"{
    "schema_version": 1,
    "targets": {"os": "macos", "app_version": "12.1"},
    "ops": [
        {
            "id": "search",
            "do": {"type": "search_browser", "query": "Serum"},
            "post": [{"type": "ui_text_contains_any", "region": "browser.results",
                      "tokens": ["xfer", "serum"]}]
        },
        {
            "id": "open",
            "action": {"type": "dblclick_ocr_match", "region": "browser.results",
                       "match": {"text": "Serum", "mode": "contains"}},
            "postconditions": [{"type": "plugin_window_open", "plugin_name": "Serum"}],
            "retries": 1,
            "timeout_ms": 5000,
            "notes": "plugin window can take a while"
        },
        {
            "id": "clear",
            "do": {"type": "assert_only"},
            "post": [{"type": "no_modal_dialog"}]
        }
    ]
}"#;

struct Scripted {
    actuator: Arc<RecordingActuator>,
    recognizer: Arc<ScriptedRecognizer>,
}

fn scripted() -> Scripted {
    let recognizer = ScriptedRecognizer::new();
    recognizer.always((200, 100), vec![line("Serum", Rect::new(20, 30, 40, 10))]);
    recognizer.script(
        (300, 120),
        vec![Vec::new(), vec![line("Serum - Xfer Records", Rect::new(0, 0, 200, 14))]],
    );
    Scripted {
        actuator: RecordingActuator::new(),
        recognizer,
    }
}

fn engine(scripted: &Scripted, regions: uiplan::core::regions::Regions, cfg: &AppConfig) -> Engine {
    Engine::new(
        Collaborators {
            actuator: Arc::clone(&scripted.actuator) as Arc<dyn Actuator>,
            frames: SolidFrames::new(400, 300),
            recognizer: Arc::clone(&scripted.recognizer) as Arc<dyn TextRecognizer>,
            anchors: None,
        },
        regions,
        EngineSettings::from_config(cfg),
    )
}

#[test]
fn plan_runs_to_success_with_one_retry() {
    let temp = run_dir();
    let plan_path = write_fixture(temp.path(), "plan.json", PLAN);
    let regions_path = write_fixture(temp.path(), "regions.json", REGIONS);
    let cfg = AppConfig::default();
    let docs = load_documents(&plan_path, &regions_path, &cfg).expect("documents");

    let scripted = scripted();
    let outputs = RunOutputs {
        run_id: "20260101_120000".to_string(),
        run_dir: temp.path().join("runs").join("20260101_120000"),
        plan_path: Some(plan_path.clone()),
    };
    let receipt = engine(&scripted, docs.regions, &cfg)
        .execute(&docs.plan, &outputs, &AtomicBool::new(false))
        .expect("execute");

    assert_eq!(receipt.status, RunStatus::Success);
    assert!(receipt.failures.is_empty());
    let attempts: Vec<(&str, u32, OpResult)> = receipt
        .ops
        .iter()
        .map(|op| (op.op_id.as_str(), op.attempts, op.result))
        .collect();
    assert_eq!(
        attempts,
        vec![
            ("search", 1, OpResult::Ok),
            ("open", 2, OpResult::Ok),
            ("clear", 1, OpResult::Ok),
        ]
    );
    assert_eq!(
        receipt.ops[1].notes.as_deref(),
        Some("plugin window can take a while")
    );
    assert_eq!(receipt.actuator.kind, "recording");
    assert_eq!(
        receipt.plan_path.as_deref(),
        Some(plan_path.display().to_string().as_str())
    );

    // The receipt on disk is the finalized one.
    let on_disk = load_receipt(&outputs.run_dir.join(RECEIPT_FILE)).expect("receipt");
    assert_eq!(on_disk, receipt);
    assert!(on_disk.finished_at.is_some());

    assert_eq!(
        scripted.actuator.clicked_points(),
        vec![Point::new(60, 20), Point::new(50, 75), Point::new(50, 75)]
    );
    assert!(
        scripted
            .actuator
            .calls()
            .contains(&Call::TypeText("Serum".to_string()))
    );

    // The failed first attempt left evidence even though the op recovered.
    let failed_attempt = outputs.run_dir.join("failures/open/attempt-1.json");
    let evidence: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&failed_attempt).expect("evidence"))
            .expect("evidence json");
    assert_eq!(evidence["ok"], false);
    assert_eq!(evidence["kind"], "assertion_failed");
    assert_eq!(evidence["region"], "plugin.window");
    assert!(!outputs.run_dir.join("failures/open/attempt-2.json").exists());
}

#[test]
fn trace_is_ordered_and_tagged_by_attempt() {
    let temp = run_dir();
    let plan_path = write_fixture(temp.path(), "plan.json", PLAN);
    let regions_path = write_fixture(temp.path(), "regions.json", REGIONS);
    let cfg = AppConfig::default();
    let docs = load_documents(&plan_path, &regions_path, &cfg).expect("documents");
    let scripted = scripted();
    let outputs = RunOutputs {
        run_id: "trace".to_string(),
        run_dir: temp.path().join("trace"),
        plan_path: None,
    };
    engine(&scripted, docs.regions, &cfg)
        .execute(&docs.plan, &outputs, &AtomicBool::new(false))
        .expect("execute");

    let trace = read_trace(&outputs.run_dir.join(TRACE_FILE)).expect("trace");
    assert!(trace.windows(2).all(|w| w[0].t_ms <= w[1].t_ms));

    let open: Vec<_> = trace.iter().filter(|e| e.op_id == "open").collect();
    let failed: Vec<_> = open
        .iter()
        .filter(|e| e.kind == EventKind::Note && e.name == "attempt_failed")
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt_index, 1);
    assert_eq!(failed[0].details["kind"], FailureKind::AssertionFailed.as_str());

    // Recovery belongs to the attempt that failed; the retry's action to attempt 2.
    let recovery = open
        .iter()
        .find(|e| e.name == "recovery_started")
        .expect("recovery");
    assert_eq!(recovery.attempt_index, 1);
    let actions: Vec<u32> = open
        .iter()
        .filter(|e| e.kind == EventKind::Action && e.name == "dblclick_ocr_match")
        .map(|e| e.attempt_index)
        .collect();
    assert_eq!(actions, vec![1, 2]);

    let asserts: Vec<_> = trace
        .iter()
        .filter(|e| e.kind == EventKind::Assert)
        .map(|e| (e.op_id.as_str(), e.name.as_str(), e.details["passed"].as_str()))
        .collect();
    assert_eq!(
        asserts,
        vec![
            ("search", "ui_text_contains_any", "true"),
            ("open", "plugin_window_open", "false"),
            ("open", "plugin_window_open", "true"),
            ("clear", "no_modal_dialog", "true"),
        ]
    );
}

#[test]
fn failed_op_stops_the_plan() {
    let temp = run_dir();
    let regions_path = write_fixture(temp.path(), "regions.json", REGIONS);
    let plan_path = write_fixture(
        temp.path(),
        "plan.json",
        r#"{"schema_version": 1, "ops": [
            {"id": "find", "do": {"type": "click_ocr_match", "region": "browser.results",
                                  "match": {"text": "Diva", "mode": "exact"}},
             "retries": 0},
            {"id": "after", "do": {"type": "home"}}
        ]}"#,
    );
    let cfg = AppConfig::default();
    let docs = load_documents(&plan_path, &regions_path, &cfg).expect("documents");
    let scripted = scripted();
    let outputs = RunOutputs {
        run_id: "fail".to_string(),
        run_dir: temp.path().join("fail"),
        plan_path: None,
    };
    let receipt = engine(&scripted, docs.regions, &cfg)
        .execute(&docs.plan, &outputs, &AtomicBool::new(false))
        .expect("execute");

    assert_eq!(receipt.status, RunStatus::Failed);
    assert_eq!(receipt.ops.len(), 1);
    let failure = &receipt.failures[0];
    assert_eq!(failure.op_id, "find");
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.kind, FailureKind::ActionFailed);
    assert!(failure.reason.contains("'Diva'"), "{}", failure.reason);
    assert_eq!(failure.evidence_dir.as_deref(), Some("failures/find"));
    assert!(outputs.run_dir.join("failures/find/attempt-1.region.png").exists());
    assert!(!scripted.actuator.calls().contains(&Call::Home));
}
