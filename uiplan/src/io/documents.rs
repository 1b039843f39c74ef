//! Plan and regions loading with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::invariants::{PlanContext, validate_plan, validate_regions};
use crate::core::plan::Plan;
use crate::core::regions::Regions;

pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.v1.schema.json");
pub const REGIONS_SCHEMA: &str = include_str!("../../schemas/regions.v1.schema.json");

/// Load and validate the regions document (schema + invariants).
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_regions(path: &Path) -> Result<Regions> {
    let regions: Regions = load_document(path, REGIONS_SCHEMA, "regions")?;
    let errors = validate_regions(&regions);
    if !errors.is_empty() {
        bail!(
            "regions {} invariant violations:\n- {}",
            path.display(),
            errors.join("\n- ")
        );
    }
    debug!(regions = regions.regions.len(), "regions loaded");
    Ok(regions)
}

/// Load and validate a plan against already-loaded regions and run settings.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_plan(path: &Path, ctx: &PlanContext<'_>) -> Result<Plan> {
    let plan: Plan = load_document(path, PLAN_SCHEMA, "plan")?;
    let errors = validate_plan(&plan, ctx);
    if !errors.is_empty() {
        bail!(
            "plan {} invariant violations:\n- {}",
            path.display(),
            errors.join("\n- ")
        );
    }
    debug!(ops = plan.ops.len(), "plan loaded");
    Ok(plan)
}

fn load_document<T: DeserializeOwned>(path: &Path, schema: &str, what: &str) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {what} {}", path.display()))?;
    let instance: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {what} {}", path.display()))?;
    validate_schema(&instance, schema)
        .with_context(|| format!("validate {what} {}", path.display()))?;
    serde_json::from_value(instance)
        .with_context(|| format!("deserialize {what} {}", path.display()))
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &str) -> Result<()> {
    let schema_json: Value = serde_json::from_str(schema).context("parse schema json")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema_json)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
