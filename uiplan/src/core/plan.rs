//! Plan document model (`plan.v1`).
//!
//! A plan is an ordered list of operations. Each operation performs one
//! action and is verified by assertions; the engine owns retries, timeouts,
//! and recovery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::MatchMode;

pub const DEFAULT_RETRIES: u32 = 2;

/// Region searched for the device title when opening a plugin window.
pub const DEVICE_CHAIN_REGION: &str = "device.chain";
/// Region clicked when the plugin-window button anchor cannot be matched.
pub const DEVICE_CHAIN_CONTROLS_REGION: &str = "device.chain.controls";
/// Region where an open plugin window shows its title.
pub const PLUGIN_WINDOW_REGION: &str = "plugin.window";
/// Default region of the browser search field.
pub const BROWSER_SEARCH_REGION: &str = "browser.search";
/// Anchor for the button that opens a device's plugin window.
pub const PLUGIN_WINDOW_BUTTON_ANCHOR: &str = "ableton.device_header.plugin_window_button";

pub const DEFAULT_TEXT_MIN_CONF: f64 = 0.7;
pub const DEFAULT_TOKENS_MIN_CONF: f64 = 0.65;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub schema_version: u32,
    #[serde(default)]
    pub targets: Targets,
    pub ops: Vec<Operation>,
}

/// Informational target environment; recorded, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    /// Checked before the action runs.
    #[serde(default)]
    pub pre: Vec<Assertion>,
    #[serde(rename = "do", alias = "action")]
    pub action: Action,
    /// Checked after the action; the first failure fails the attempt.
    #[serde(default, alias = "postconditions")]
    pub post: Vec<Assertion>,
    /// Extra actions run between a failed attempt and the next one.
    #[serde(default)]
    pub recover: Vec<Action>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

impl Operation {
    /// Per-attempt budget: the op's own timeout, else the run-wide watchdog.
    pub fn attempt_budget(&self, watchdog: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(watchdog)
    }

    /// Maximum number of attempts (`retries + 1`).
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Text target for click-by-text actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextTarget {
    pub text: String,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_conf: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Home,
    MoveTo {
        x: i32,
        y: i32,
    },
    Click {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
    },
    DoubleClick {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
    },
    KeyChord {
        chord: String,
    },
    PressKeys {
        keys: Vec<String>,
    },
    TypeText {
        text: String,
    },
    Sleep {
        ms: u64,
    },
    ClickOcrMatch {
        region: String,
        #[serde(rename = "match")]
        target: TextTarget,
    },
    DblclickOcrMatch {
        region: String,
        #[serde(rename = "match")]
        target: TextTarget,
    },
    ClickAnchor {
        anchor_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_region: Option<String>,
    },
    OpenPluginWindow {
        plugin_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_chain_text: Option<String>,
    },
    SearchBrowser {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_region: Option<String>,
    },
    AssertOnly,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Home => "home",
            Action::MoveTo { .. } => "move_to",
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::KeyChord { .. } => "key_chord",
            Action::PressKeys { .. } => "press_keys",
            Action::TypeText { .. } => "type_text",
            Action::Sleep { .. } => "sleep",
            Action::ClickOcrMatch { .. } => "click_ocr_match",
            Action::DblclickOcrMatch { .. } => "dblclick_ocr_match",
            Action::ClickAnchor { .. } => "click_anchor",
            Action::OpenPluginWindow { .. } => "open_plugin_window",
            Action::SearchBrowser { .. } => "search_browser",
            Action::AssertOnly => "assert_only",
        }
    }

    /// Region ids this action reads, including implicit ones.
    pub fn region_refs(&self) -> Vec<&str> {
        match self {
            Action::ClickOcrMatch { region, .. } | Action::DblclickOcrMatch { region, .. } => {
                vec![region.as_str()]
            }
            Action::ClickAnchor {
                fallback_region, ..
            } => fallback_region.iter().map(String::as_str).collect(),
            Action::OpenPluginWindow { .. } => {
                vec![DEVICE_CHAIN_REGION, DEVICE_CHAIN_CONTROLS_REGION]
            }
            Action::SearchBrowser {
                fallback_region, ..
            } => vec![fallback_region.as_deref().unwrap_or(BROWSER_SEARCH_REGION)],
            _ => Vec::new(),
        }
    }

    /// Anchor ids this action may resolve through the default-region table.
    pub fn anchor_refs(&self) -> Vec<&str> {
        match self {
            Action::ClickAnchor {
                anchor_id,
                fallback_region: None,
            } => vec![anchor_id.as_str()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assertion {
    UiTextContains {
        region: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_conf: Option<f64>,
    },
    UiTextContainsAny {
        region: String,
        tokens: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_conf: Option<f64>,
    },
    UiAnchorPresent {
        anchor_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_score: Option<f64>,
    },
    PluginWindowOpen {
        plugin_name: String,
    },
    NoModalDialog {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
}

impl Assertion {
    pub fn name(&self) -> &'static str {
        match self {
            Assertion::UiTextContains { .. } => "ui_text_contains",
            Assertion::UiTextContainsAny { .. } => "ui_text_contains_any",
            Assertion::UiAnchorPresent { .. } => "ui_anchor_present",
            Assertion::PluginWindowOpen { .. } => "plugin_window_open",
            Assertion::NoModalDialog { .. } => "no_modal_dialog",
        }
    }

    /// Region ids this assertion reads. `no_modal_dialog` without a region
    /// uses the configured modal region and is checked separately.
    pub fn region_refs(&self) -> Vec<&str> {
        match self {
            Assertion::UiTextContains { region, .. }
            | Assertion::UiTextContainsAny { region, .. } => vec![region.as_str()],
            Assertion::UiAnchorPresent { region, .. } | Assertion::NoModalDialog { region } => {
                region.iter().map(String::as_str).collect()
            }
            Assertion::PluginWindowOpen { .. } => vec![PLUGIN_WINDOW_REGION],
        }
    }

    pub fn anchor_refs(&self) -> Vec<&str> {
        match self {
            Assertion::UiAnchorPresent {
                anchor_id,
                region: None,
                ..
            } => vec![anchor_id.as_str()],
            _ => Vec::new(),
        }
    }

    /// Confidence or score thresholds carried by this assertion.
    pub fn thresholds(&self) -> Vec<f64> {
        match self {
            Assertion::UiTextContains { min_conf, .. }
            | Assertion::UiTextContainsAny { min_conf, .. } => min_conf.iter().copied().collect(),
            Assertion::UiAnchorPresent { min_score, .. } => min_score.iter().copied().collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operation_with_defaults_and_aliases() {
        let raw = r#"{
            "schema_version": 1,
            "ops": [
                {"id": "open", "do": {"type": "key_chord", "chord": "CMD+O"}},
                {
                    "id": "pick",
                    "action": {
                        "type": "click_ocr_match",
                        "region": "os.file_dialog",
                        "match": {"text": "Cancel", "mode": "exact", "min_conf": 0.5}
                    },
                    "postconditions": [{"type": "no_modal_dialog"}],
                    "retries": 0,
                    "timeout_ms": 5000
                }
            ]
        }"#;
        let plan: Plan = serde_json::from_str(raw).expect("parse");
        assert_eq!(plan.ops[0].retries, DEFAULT_RETRIES);
        assert_eq!(plan.ops[0].timeout_ms, None);
        assert_eq!(plan.ops[1].post.len(), 1);
        assert_eq!(plan.ops[1].max_attempts(), 1);
        match &plan.ops[1].action {
            Action::ClickOcrMatch { region, target } => {
                assert_eq!(region, "os.file_dialog");
                assert_eq!(target.mode, MatchMode::Exact);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn absent_match_mode_is_fuzzy() {
        let raw = r#"{"type": "dblclick_ocr_match", "region": "r", "match": {"text": "Kick"}}"#;
        let action: Action = serde_json::from_str(raw).expect("parse");
        let Action::DblclickOcrMatch { target, .. } = action else {
            panic!("wrong variant");
        };
        assert_eq!(target.mode, MatchMode::Fuzzy);
        assert_eq!(target.min_conf, None);
    }

    #[test]
    fn unknown_match_mode_is_rejected() {
        let raw = r#"{"type": "click_ocr_match", "region": "r", "match": {"text": "x", "mode": "regex"}}"#;
        assert!(serde_json::from_str::<Action>(raw).is_err());
    }

    #[test]
    fn attempt_budget_prefers_op_timeout() {
        let op = Operation {
            id: "a".to_string(),
            pre: Vec::new(),
            action: Action::AssertOnly,
            post: Vec::new(),
            recover: Vec::new(),
            retries: 1,
            timeout_ms: Some(250),
            notes: None,
        };
        assert_eq!(
            op.attempt_budget(Duration::from_secs(30)),
            Duration::from_millis(250)
        );
        let op = Operation {
            timeout_ms: None,
            ..op
        };
        assert_eq!(
            op.attempt_budget(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn implicit_region_refs() {
        let open = Action::OpenPluginWindow {
            plugin_name: "Serum".to_string(),
            device_chain_text: None,
        };
        assert_eq!(
            open.region_refs(),
            vec![DEVICE_CHAIN_REGION, DEVICE_CHAIN_CONTROLS_REGION]
        );
        let search = Action::SearchBrowser {
            query: "kick".to_string(),
            fallback_region: None,
        };
        assert_eq!(search.region_refs(), vec![BROWSER_SEARCH_REGION]);
    }
}
