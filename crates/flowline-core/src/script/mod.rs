//! Embedded script runtime for script-definition steps.
//!
//! Each instance owns a fresh [`ScriptRuntime`] created at construction
//! and dropped with the instance, so script globals never leak across
//! instances. Before a script step runs, the driver injects `instance`,
//! `ctx`, `ctxs` and `pinnedData` into the scope; after the body runs,
//! the `result` scope binding is read back as the step's output. The
//! body's own evaluated value is ignored.
//!
//! The engine is capped with operation, call-depth and collection-size
//! limits so a runaway script fails its step instead of wedging the
//! driver.

mod host;

use flowline_types::ContextMap;
use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use std::sync::Arc;

use crate::control::Controls;
use crate::error::EngineError;
use crate::services::Services;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Safety limits applied to every script engine.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 500_000,
            max_call_levels: 32,
            max_string_size: 1_048_576,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptRuntime
// ---------------------------------------------------------------------------

/// Values injected into the scope before a script step executes.
pub(crate) struct ScriptInputs {
    /// Serialized view of the owning instance.
    pub instance: Value,
    /// The cumulative merged context.
    pub ctx: Value,
    /// Per-step context snapshots.
    pub ctxs: Value,
    /// Auxiliary data carried across steps.
    pub pinned: Value,
}

/// Per-instance script engine with the host API registered.
pub(crate) struct ScriptRuntime {
    engine: Engine,
}

impl ScriptRuntime {
    pub fn new(services: Arc<Services>, controls: Arc<Controls>) -> Self {
        Self::with_limits(services, controls, ScriptLimits::default())
    }

    pub fn with_limits(
        services: Arc<Services>,
        controls: Arc<Controls>,
        limits: ScriptLimits,
    ) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);

        host::register(&mut engine, services, controls);

        Self { engine }
    }

    /// Evaluate a script step body and extract its `result` binding.
    pub fn eval(
        &self,
        step: usize,
        definition: &str,
        inputs: ScriptInputs,
    ) -> Result<ContextMap, EngineError> {
        if definition.trim().is_empty() {
            return Err(EngineError::EmptyDefinition { step });
        }

        let mut scope = Scope::new();
        scope.push("instance", dynamic(step, &inputs.instance)?);
        scope.push("ctx", dynamic(step, &inputs.ctx)?);
        scope.push("ctxs", dynamic(step, &inputs.ctxs)?);
        scope.push("pinnedData", dynamic(step, &inputs.pinned)?);

        self.engine
            .run_with_scope(&mut scope, definition)
            .map_err(|e| EngineError::Script {
                step,
                message: e.to_string(),
            })?;

        coerce_result(step, scope.get_value::<Dynamic>("result"))
    }
}

fn dynamic(step: usize, value: &Value) -> Result<Dynamic, EngineError> {
    rhai::serde::to_dynamic(value).map_err(|e| EngineError::Script {
        step,
        message: e.to_string(),
    })
}

/// Map the `result` binding to the step output.
///
/// Absent, unit and null all mean "no output"; a mapping is taken as-is;
/// any other value is wrapped under a `result` key.
fn coerce_result(step: usize, value: Option<Dynamic>) -> Result<ContextMap, EngineError> {
    let Some(value) = value else {
        return Ok(ContextMap::new());
    };
    if value.is_unit() {
        return Ok(ContextMap::new());
    }

    let json: Value = rhai::serde::from_dynamic(&value).map_err(|e| EngineError::Script {
        step,
        message: e.to_string(),
    })?;

    match json {
        Value::Null => Ok(ContextMap::new()),
        Value::Object(map) => Ok(map),
        other => {
            let mut wrapped = ContextMap::new();
            wrapped.insert("result".to_string(), other);
            Ok(wrapped)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
