//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::anchor_defaults::AnchorDefaults;
use crate::core::matcher::normalize;
use crate::core::plan::{Action, Assertion, Operation, Plan};
use crate::core::regions::Regions;

/// Run-wide settings the plan is checked against.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub regions: &'a Regions,
    pub anchor_defaults: &'a AnchorDefaults,
    /// Region used by `no_modal_dialog` when it names none.
    pub modal_region: &'a str,
}

/// Check semantic invariants not expressible in JSON Schema:
/// - Non-empty, unique op ids usable as directory names
/// - `timeout_ms > 0` when present
/// - Every referenced region exists, including implicit and default regions
/// - Thresholds in `[0, 1]`, match targets non-empty after normalization
pub fn validate_plan(plan: &Plan, ctx: &PlanContext<'_>) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.schema_version != 1 {
        errors.push(format!(
            "unsupported plan schema_version {}",
            plan.schema_version
        ));
    }
    let mut seen = HashSet::new();
    for (index, op) in plan.ops.iter().enumerate() {
        let path = format!("ops[{index}]");
        if op.id.trim().is_empty() {
            errors.push(format!("{path}: id must be non-empty"));
        } else if !is_file_name_safe(&op.id) {
            errors.push(format!(
                "{path}: id '{}' may only use letters, digits, '.', '_' and '-'",
                op.id
            ));
        } else if !seen.insert(op.id.as_str()) {
            errors.push(format!("duplicate op id '{}' at {path}", op.id));
        }
        validate_op(op, &path, ctx, &mut errors);
    }
    errors
}

/// Check the regions document on its own.
pub fn validate_regions(regions: &Regions) -> Vec<String> {
    let mut errors = Vec::new();
    if regions.schema_version != 1 {
        errors.push(format!(
            "unsupported regions schema_version {}",
            regions.schema_version
        ));
    }
    for (id, rect) in &regions.regions {
        if rect.is_empty() {
            errors.push(format!("region '{id}': w and h must be > 0"));
        }
    }
    errors
}

fn validate_op(op: &Operation, path: &str, ctx: &PlanContext<'_>, errors: &mut Vec<String>) {
    if op.timeout_ms == Some(0) {
        errors.push(format!("{path}: timeout_ms must be > 0"));
    }
    validate_action(&op.action, &format!("{path}.do"), ctx, errors);
    for (i, action) in op.recover.iter().enumerate() {
        validate_action(action, &format!("{path}.recover[{i}]"), ctx, errors);
    }
    for (i, assertion) in op.pre.iter().enumerate() {
        validate_assertion(assertion, &format!("{path}.pre[{i}]"), ctx, errors);
    }
    for (i, assertion) in op.post.iter().enumerate() {
        validate_assertion(assertion, &format!("{path}.post[{i}]"), ctx, errors);
    }
}

fn validate_action(action: &Action, path: &str, ctx: &PlanContext<'_>, errors: &mut Vec<String>) {
    for region in action.region_refs() {
        require_region(region, path, ctx, errors);
    }
    for anchor in action.anchor_refs() {
        require_default_region(anchor, path, ctx, errors);
    }
    match action {
        Action::Click { x, y } | Action::DoubleClick { x, y } if x.is_some() != y.is_some() => {
            errors.push(format!("{path}: x and y must be given together"));
        }
        Action::KeyChord { chord } => {
            if chord.trim().is_empty() {
                errors.push(format!("{path}: chord must be non-empty"));
            }
        }
        Action::PressKeys { keys } => {
            if keys.is_empty() || keys.iter().any(|k| k.trim().is_empty()) {
                errors.push(format!("{path}: keys must be a non-empty list of chords"));
            }
        }
        Action::ClickOcrMatch { target, .. } | Action::DblclickOcrMatch { target, .. } => {
            if normalize(&target.text).is_none() {
                errors.push(format!("{path}: match.text is empty after normalization"));
            }
            if let Some(conf) = target.min_conf {
                check_unit(conf, "match.min_conf", path, errors);
            }
        }
        Action::OpenPluginWindow {
            plugin_name,
            device_chain_text,
        } => {
            let text = device_chain_text.as_deref().unwrap_or(plugin_name);
            if normalize(text).is_none() {
                errors.push(format!("{path}: device chain text is empty"));
            }
        }
        Action::SearchBrowser { query, .. } => {
            if query.is_empty() {
                errors.push(format!("{path}: query must be non-empty"));
            }
        }
        _ => {}
    }
}

fn validate_assertion(
    assertion: &Assertion,
    path: &str,
    ctx: &PlanContext<'_>,
    errors: &mut Vec<String>,
) {
    for region in assertion.region_refs() {
        require_region(region, path, ctx, errors);
    }
    for anchor in assertion.anchor_refs() {
        require_default_region(anchor, path, ctx, errors);
    }
    for threshold in assertion.thresholds() {
        check_unit(threshold, "threshold", path, errors);
    }
    match assertion {
        Assertion::UiTextContains { text, .. } => {
            if normalize(text).is_none() {
                errors.push(format!("{path}: text is empty after normalization"));
            }
        }
        Assertion::UiTextContainsAny { tokens, .. } => {
            if tokens.is_empty() || tokens.iter().any(|t| normalize(t).is_none()) {
                errors.push(format!("{path}: tokens must be a non-empty list of words"));
            }
        }
        Assertion::PluginWindowOpen { plugin_name } => {
            if normalize(plugin_name).is_none() {
                errors.push(format!("{path}: plugin_name is empty"));
            }
        }
        Assertion::NoModalDialog { region: None } => {
            require_region(ctx.modal_region, path, ctx, errors);
        }
        _ => {}
    }
}

fn require_region(region: &str, path: &str, ctx: &PlanContext<'_>, errors: &mut Vec<String>) {
    if !ctx.regions.contains(region) {
        errors.push(format!("{path}: unknown region '{region}'"));
    }
}

fn require_default_region(
    anchor_id: &str,
    path: &str,
    ctx: &PlanContext<'_>,
    errors: &mut Vec<String>,
) {
    if let Some(region) = ctx.anchor_defaults.resolve(anchor_id)
        && !ctx.regions.contains(region)
    {
        errors.push(format!(
            "{path}: anchor '{anchor_id}' defaults to unknown region '{region}'"
        ));
    }
}

/// Op ids name evidence directories, so they must be usable as-is.
fn is_file_name_safe(id: &str) -> bool {
    id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn check_unit(value: f64, name: &str, path: &str, errors: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(format!("{path}: {name} {value} must be within [0, 1]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::TextTarget;
    use crate::core::types::{MatchMode, Rect};

    fn op(id: &str, action: Action) -> Operation {
        Operation {
            id: id.to_string(),
            pre: Vec::new(),
            action,
            post: Vec::new(),
            recover: Vec::new(),
            retries: 2,
            timeout_ms: None,
            notes: None,
        }
    }

    fn regions(ids: &[&str]) -> Regions {
        ids.iter()
            .map(|id| (id.to_string(), Rect::new(0, 0, 100, 40)))
            .collect()
    }

    fn check(plan: &Plan, regions: &Regions) -> Vec<String> {
        let defaults = AnchorDefaults::default();
        validate_plan(
            plan,
            &PlanContext {
                regions,
                anchor_defaults: &defaults,
                modal_region: "os.file_dialog",
            },
        )
    }

    #[test]
    fn valid_plan_has_no_errors() {
        let plan = Plan {
            schema_version: 1,
            targets: Default::default(),
            ops: vec![
                op(
                    "open",
                    Action::KeyChord {
                        chord: "CMD+O".to_string(),
                    },
                ),
                op(
                    "cancel",
                    Action::ClickOcrMatch {
                        region: "os.file_dialog".to_string(),
                        target: TextTarget {
                            text: "Cancel".to_string(),
                            mode: MatchMode::Exact,
                            min_conf: Some(0.5),
                        },
                    },
                ),
            ],
        };
        assert!(check(&plan, &regions(&["os.file_dialog"])).is_empty());
    }

    #[test]
    fn duplicate_ids_and_zero_timeout_are_reported() {
        let mut second = op("same", Action::AssertOnly);
        second.timeout_ms = Some(0);
        let plan = Plan {
            schema_version: 1,
            targets: Default::default(),
            ops: vec![op("same", Action::AssertOnly), second],
        };
        let errors = check(&plan, &regions(&[]));
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].contains("duplicate op id 'same'"));
        assert!(errors[1].contains("timeout_ms must be > 0"));
    }

    #[test]
    fn unknown_regions_fail_including_implicit_ones() {
        let mut open = op(
            "plugin",
            Action::OpenPluginWindow {
                plugin_name: "Serum".to_string(),
                device_chain_text: None,
            },
        );
        open.post.push(Assertion::PluginWindowOpen {
            plugin_name: "Serum".to_string(),
        });
        open.post.push(Assertion::NoModalDialog { region: None });
        let plan = Plan {
            schema_version: 1,
            targets: Default::default(),
            ops: vec![open],
        };
        let errors = check(&plan, &regions(&["device.chain"]));
        let joined = errors.join("\n");
        assert!(joined.contains("unknown region 'device.chain.controls'"), "{joined}");
        assert!(joined.contains("unknown region 'plugin.window'"), "{joined}");
        assert!(joined.contains("unknown region 'os.file_dialog'"), "{joined}");
        assert!(!joined.contains("'device.chain'"), "{joined}");
    }

    #[test]
    fn anchor_default_region_must_exist_when_used() {
        let plan = Plan {
            schema_version: 1,
            targets: Default::default(),
            ops: vec![op(
                "anchor",
                Action::ClickAnchor {
                    anchor_id: "serum.preset_menu".to_string(),
                    fallback_region: None,
                },
            )],
        };
        let errors = check(&plan, &regions(&[]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("defaults to unknown region 'plugin.window'"));
        assert!(check(&plan, &regions(&["plugin.window"])).is_empty());
    }

    #[test]
    fn thresholds_must_be_unit_interval() {
        let mut assert_op = op("check", Action::AssertOnly);
        assert_op.post.push(Assertion::UiTextContains {
            region: "browser.search".to_string(),
            text: "Kick".to_string(),
            min_conf: Some(1.5),
        });
        let plan = Plan {
            schema_version: 1,
            targets: Default::default(),
            ops: vec![assert_op],
        };
        let errors = check(&plan, &regions(&["browser.search"]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("must be within [0, 1]"));
    }

    #[test]
    fn click_needs_both_coordinates() {
        let plan = Plan {
            schema_version: 1,
            targets: Default::default(),
            ops: vec![
                op("half", Action::Click { x: Some(10), y: None }),
                op("here", Action::DoubleClick { x: None, y: None }),
            ],
        };
        let errors = check(&plan, &regions(&[]));
        assert_eq!(errors, vec!["ops[0].do: x and y must be given together"]);
    }

    #[test]
    fn ids_must_be_usable_as_directory_names() {
        let plan = Plan {
            schema_version: 1,
            targets: Default::default(),
            ops: vec![
                op("open/preset", Action::AssertOnly),
                op("open_preset", Action::AssertOnly),
                op("..", Action::AssertOnly),
                op("load-1.2", Action::AssertOnly),
            ],
        };
        let errors = check(&plan, &regions(&[]));
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].starts_with("ops[0]: id 'open/preset' may only use"));
        assert!(errors[1].starts_with("ops[2]: id '..' may only use"));
    }

    #[test]
    fn empty_regions_are_rejected() {
        let mut table = regions(&["a"]);
        table
            .regions
            .insert("b".to_string(), Rect::new(0, 0, 0, 10));
        assert_eq!(validate_regions(&table), vec!["region 'b': w and h must be > 0"]);
    }
}
