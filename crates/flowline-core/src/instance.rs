//! Workflow instances: the mutable execution of a flow template.
//!
//! An instance owns its position, the cumulative merged context, per-step
//! entry snapshots (for compensation replay), the result and rollback
//! ledgers, and a fresh script runtime. The driver loop advances one step
//! at a time, applying signal precedence (error > done > stop > goto >
//! branch) after every step body, and hands failures to the rollback
//! sweep. Every transition is persisted through the instance store hook
//! and emitted on `workflow-set`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use flowline_types::{
    event, Consistency, ContextMap, InstanceRecord, InstanceStatus, StepRecord,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::control::{Controls, Signal};
use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::flow::Flow;
use crate::script::{ScriptInputs, ScriptRuntime};
use crate::services::{DriverFn, ResilienceHandle, RetrySpec, Services};

/// A single execution of a [`Flow`], keyed by id.
pub struct Instance {
    flow: Arc<Flow>,
    services: Arc<Services>,
    controls: Arc<Controls>,
    script: ScriptRuntime,
    /// Back-reference set by the registry; lets the resilience driver
    /// re-enter this instance.
    pub(crate) self_cell: Weak<Mutex<Instance>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub done_at: Option<DateTime<Utc>>,
    pub tag: String,
    pub id: String,
    pub created_by: String,
    pub updated_by: String,
    pub status: InstanceStatus,
    /// Current step index.
    pub current: usize,
    /// Cumulative merged context.
    pub ctx: ContextMap,
    /// Context snapshots as seen at entry to each step.
    pub ctxs: BTreeMap<usize, ContextMap>,
    /// Auxiliary data carried across steps for scripts.
    pub pinned_data: ContextMap,
    pub results: BTreeMap<usize, StepRecord>,
    pub tags: ContextMap,
    pub rollbacks: BTreeMap<usize, StepRecord>,
    pub worker_host: String,
    /// Set once the instance can never advance again: done, or failed
    /// with attempts exhausted.
    terminal: bool,
    last_error: Option<String>,
    resilience: Option<Arc<dyn ResilienceHandle>>,
}

impl Instance {
    pub(crate) fn new(
        flow: Arc<Flow>,
        services: Arc<Services>,
        id: String,
        tags: ContextMap,
        start: usize,
        created_by: &str,
    ) -> Self {
        let controls = Arc::new(Controls::new());
        let script = ScriptRuntime::new(Arc::clone(&services), Arc::clone(&controls));
        let now = Utc::now();
        let tag = flow.tag.clone();
        let mut instance = Self {
            flow,
            services,
            controls,
            script,
            self_cell: Weak::new(),
            created_at: now,
            updated_at: now,
            done_at: None,
            tag,
            id,
            created_by: created_by.to_string(),
            updated_by: created_by.to_string(),
            status: InstanceStatus::Pending,
            current: start,
            ctx: ContextMap::new(),
            ctxs: BTreeMap::new(),
            pinned_data: ContextMap::new(),
            results: BTreeMap::new(),
            tags,
            rollbacks: BTreeMap::new(),
            worker_host: worker_host(),
            terminal: false,
            last_error: None,
            resilience: None,
        };
        instance.set_status(InstanceStatus::Pending);
        instance
    }

    /// Rebind a persisted record to its flow template. Control state and
    /// the script runtime are rebuilt fresh.
    pub(crate) fn from_record(
        flow: Arc<Flow>,
        services: Arc<Services>,
        record: InstanceRecord,
    ) -> Self {
        let controls = Arc::new(Controls::new());
        let script = ScriptRuntime::new(Arc::clone(&services), Arc::clone(&controls));
        Self {
            flow,
            services,
            controls,
            script,
            self_cell: Weak::new(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            done_at: record.done_at,
            tag: record.tag,
            id: record.id,
            created_by: record.created_by,
            updated_by: record.updated_by,
            status: record.status,
            current: record.current,
            ctx: record.ctx,
            ctxs: record.ctxs,
            pinned_data: record.pinned_data,
            results: record.results,
            tags: record.tags,
            rollbacks: record.rollbacks,
            worker_host: worker_host(),
            terminal: record.status == InstanceStatus::Done,
            last_error: None,
            resilience: None,
        }
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    // -----------------------------------------------------------------------
    // Signals (for native step callables)
    // -----------------------------------------------------------------------

    /// Finish the instance after the current step.
    pub fn done(&self) {
        self.controls.signal_done();
    }

    /// Pause the instance after the current step.
    pub fn stop(&self) {
        self.controls.signal_stop();
    }

    /// Jump to `step` after the current step.
    pub fn go_to(&self, step: usize) {
        self.controls.signal_goto(step);
    }

    /// Record auxiliary data carried across steps.
    pub fn pin(&mut self, key: &str, value: Value) {
        self.pinned_data.insert(key.to_string(), value);
    }

    pub(crate) fn controls(&self) -> &Arc<Controls> {
        &self.controls
    }

    pub(crate) fn set_tags(&mut self, tags: ContextMap) {
        for (key, value) in tags {
            self.tags.insert(key, value);
        }
    }

    // -----------------------------------------------------------------------
    // Serialized views
    // -----------------------------------------------------------------------

    /// The persistable record of this instance.
    pub fn record(&self) -> InstanceRecord {
        InstanceRecord {
            created_at: self.created_at,
            updated_at: self.updated_at,
            tag: self.tag.clone(),
            id: self.id.clone(),
            created_by: self.created_by.clone(),
            updated_by: self.updated_by.clone(),
            status: self.status,
            done_at: self.done_at,
            current: self.current,
            ctx: self.ctx.clone(),
            ctxs: self.ctxs.clone(),
            pinned_data: self.pinned_data.clone(),
            results: self.results.clone(),
            tags: self.tags.clone(),
            rollbacks: self.rollbacks.clone(),
            worker_host: self.worker_host.clone(),
        }
    }

    /// The user-facing serialized view: the record with all tags merged
    /// at the top level.
    pub fn view(&self) -> Value {
        let mut value = serde_json::to_value(self.record()).unwrap_or_else(|_| Value::Null);
        if let Value::Object(map) = &mut value {
            for (key, tag) in &self.tags {
                map.insert(key.clone(), tag.clone());
            }
        }
        value
    }

    /// Persist through the store hook and emit `workflow-set`. Hook
    /// failures are logged and emitted on `workflow-error`; they do not
    /// abort the instance.
    fn persist(&self) {
        if let Some(store) = &self.services.instance_store {
            if let Err(e) = store.save(&self.record()) {
                tracing::error!(
                    instance_id = %self.id,
                    error = %e,
                    "failed to persist instance"
                );
                self.services.bus.publish(
                    event::WORKFLOW_ERROR,
                    event::error_payload(format!("save instance {}: {e}", self.id)),
                );
            }
        }
        self.services.bus.publish(event::WORKFLOW_SET, self.view());
    }

    pub(crate) fn set_status(&mut self, status: InstanceStatus) {
        if self.status != status {
            self.status = status;
            self.updated_at = Utc::now();

            if status == InstanceStatus::Done {
                self.done_at = Some(self.updated_at);
                self.terminal = true;
            }

            if status == InstanceStatus::Failed {
                if let Some(handle) = &self.resilience {
                    if handle.is_end() {
                        self.terminal = true;
                    }
                }
                tracing::error!(
                    instance_id = %self.id,
                    tag = self.tag.as_str(),
                    step = self.current,
                    error = self.last_error.as_deref().unwrap_or(""),
                    "instance failed"
                );
            } else {
                tracing::info!(
                    instance_id = %self.id,
                    tag = self.tag.as_str(),
                    status = %status,
                    step = self.current,
                    "instance status"
                );
            }
        }
        self.persist();
    }

    /// Re-emit the current status (used by `stop`).
    pub(crate) fn touch(&mut self) {
        self.set_status(self.status);
    }

    // -----------------------------------------------------------------------
    // Context bookkeeping
    // -----------------------------------------------------------------------

    /// Merge the incoming per-step context into the cumulative context and
    /// snapshot it at the current step. Returns the merged context handed
    /// to the step body.
    pub(crate) fn enter_step(&mut self, incoming: ContextMap) -> ContextMap {
        for (key, value) in &incoming {
            self.ctx.insert(key.clone(), value.clone());
        }
        self.ctxs.insert(self.current, incoming);
        self.ctx.clone()
    }

    fn merge_ctx(&mut self, result: &ContextMap) {
        for (key, value) in result {
            self.ctx.insert(key.clone(), value.clone());
        }
    }

    fn record_result(&mut self, result: &ContextMap, error: Option<&str>) {
        self.last_error = error.map(String::from);
        let attempt = self.attempt();
        self.results.insert(
            self.current,
            StepRecord {
                step: self.current,
                ctx: self.ctx.clone(),
                attempt,
                result: result.clone(),
                error: error.map(String::from),
            },
        );
    }

    fn attempt(&self) -> u32 {
        self.resilience.as_ref().map(|h| h.attempt()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Script execution
    // -----------------------------------------------------------------------

    pub(crate) fn eval_script(&mut self, definition: &str) -> Result<ContextMap, EngineError> {
        let inputs = ScriptInputs {
            instance: self.view(),
            ctx: Value::Object(self.ctx.clone()),
            ctxs: serde_json::to_value(&self.ctxs).unwrap_or_else(|_| Value::Null),
            pinned: Value::Object(self.pinned_data.clone()),
        };
        let result = self.script.eval(self.current, definition, inputs);
        self.controls.drain_pins(&mut self.pinned_data);
        if self.flow.debug {
            if let Ok(output) = &result {
                let output_value = Value::Object(output.clone());
                tracing::debug!(
                    instance_id = %self.id,
                    step = self.current,
                    output = %output_value,
                    "script step output"
                );
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Driver loop
    // -----------------------------------------------------------------------

    /// Advance the instance until it finishes, pauses or fails.
    ///
    /// Returns the final per-step result context. Preconditions reject
    /// with distinct errors and leave state untouched.
    pub(crate) fn drive(
        &mut self,
        mut ctx: ContextMap,
        run_by: &str,
    ) -> Result<ContextMap, EngineError> {
        match self.status {
            InstanceStatus::Done => return Err(EngineError::AlreadyDone(self.id.clone())),
            InstanceStatus::Running => return Err(EngineError::AlreadyRunning(self.id.clone())),
            _ => {}
        }
        if self.terminal {
            return Err(EngineError::Exhausted(self.id.clone()));
        }
        let len = self.flow.steps().len();
        if self.current >= len {
            return Err(EngineError::StepOutOfRange {
                id: self.id.clone(),
                current: self.current,
                len,
            });
        }

        self.updated_by = run_by.to_string();
        let flow = Arc::clone(&self.flow);

        loop {
            let idx = self.current;
            let merged = self.enter_step(ctx);
            let step = &flow.steps()[idx];
            tracing::debug!(
                instance_id = %self.id,
                step = idx,
                name = step.name.as_str(),
                "executing step"
            );

            let result = match step.execute(self, merged) {
                Ok(result) => result,
                Err(err) => return self.run_rollback(ContextMap::new(), Some(err)),
            };
            self.merge_ctx(&result);

            let signal = self.controls.take();

            if signal == Signal::Done {
                return Ok(self.finish_done(result));
            }

            if step.stop || signal == Signal::Stop {
                return Ok(self.finish_stop(result));
            }

            if let Signal::Goto(target) = signal {
                if target >= len {
                    let err = EngineError::StepOutOfRange {
                        id: self.id.clone(),
                        current: target,
                        len,
                    };
                    return self.run_rollback(result, Some(err));
                }
                self.apply_goto(target, "step requested jump", &result);
                ctx = result;
                continue;
            }

            if let Some(branch) = &step.branch {
                let evaluator = ExpressionEvaluator::new();
                match evaluator.evaluate_bool(&branch.expression, &self.ctx) {
                    Ok(true) => {
                        self.apply_goto(branch.yes_go_to, "expression is true", &result);
                        ctx = result;
                        continue;
                    }
                    Ok(false) => {
                        self.apply_goto(branch.no_go_to, "expression is false", &result);
                        ctx = result;
                        continue;
                    }
                    Err(err) => return self.run_rollback(result, Some(err)),
                }
            }

            if idx == len - 1 {
                return Ok(self.finish_done(result));
            }

            self.advance(&result);
            ctx = result;
        }
    }

    fn finish_done(&mut self, result: ContextMap) -> ContextMap {
        self.record_result(&result, None);
        self.set_status(InstanceStatus::Done);
        result
    }

    fn finish_stop(&mut self, result: ContextMap) -> ContextMap {
        self.record_result(&result, None);
        self.current += 1;
        self.set_status(InstanceStatus::Pending);
        result
    }

    fn advance(&mut self, result: &ContextMap) {
        self.record_result(result, None);
        self.current += 1;
        self.touch();
    }

    fn apply_goto(&mut self, target: usize, reason: &str, result: &ContextMap) {
        self.record_result(result, None);
        self.current = target;
        self.touch();
        tracing::info!(
            instance_id = %self.id,
            tag = self.tag.as_str(),
            step = target,
            reason,
            "instance jump"
        );
    }

    // -----------------------------------------------------------------------
    // Rollback / compensation sweep
    // -----------------------------------------------------------------------

    /// Record the failure, register with the resilience scheduler when
    /// retries are configured, then walk compensations from
    /// `current - 1` down to 0.
    ///
    /// With no retries configured the failure is recorded and returned
    /// without compensation. Under strong consistency the first
    /// compensation error aborts the sweep and becomes the returned
    /// error; under eventual consistency every outcome is recorded and
    /// the original error propagates.
    pub(crate) fn run_rollback(
        &mut self,
        result: ContextMap,
        source: Option<EngineError>,
    ) -> Result<ContextMap, EngineError> {
        let message = source.as_ref().map(|e| e.to_string());
        self.record_result(&result, message.as_deref());
        self.set_status(InstanceStatus::Failed);

        if self.flow.total_attempts == 0 {
            return match source {
                Some(err) => Err(err),
                None => Ok(result),
            };
        }

        if self.resilience.is_none() {
            self.register_resilience();
        }

        let flow = Arc::clone(&self.flow);
        let strong = flow.consistency == Consistency::Strong;
        let attempt = self.attempt();

        for idx in (0..self.current).rev() {
            let step = &flow.steps()[idx];
            let Some(compensation) = step.compensation() else {
                continue;
            };
            let Some(snapshot) = self.ctxs.get(&idx).cloned() else {
                continue;
            };
            tracing::info!(instance_id = %self.id, step = idx, "running compensation");

            match compensation(self, snapshot.clone()) {
                Ok(output) => {
                    self.rollbacks.insert(
                        idx,
                        StepRecord {
                            step: idx,
                            ctx: snapshot,
                            attempt,
                            result: output,
                            error: None,
                        },
                    );
                }
                Err(err) => {
                    let message = err.to_string();
                    self.rollbacks.insert(
                        idx,
                        StepRecord {
                            step: idx,
                            ctx: snapshot,
                            attempt,
                            result: ContextMap::new(),
                            error: Some(message.clone()),
                        },
                    );
                    if strong {
                        return Err(EngineError::Compensation { step: idx, message });
                    }
                }
            }
        }

        match source {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    fn register_resilience(&mut self) {
        let Some(scheduler) = self.services.resilience.clone() else {
            tracing::warn!(
                instance_id = %self.id,
                "no resilience scheduler configured; instance will not be retried"
            );
            return;
        };
        let spec = RetrySpec {
            id: self.id.clone(),
            tag: self.tag.clone(),
            description: format!("flow: {}, {}", self.flow.name, self.flow.description),
            total_attempts: self.flow.total_attempts,
            time_attempts: self.flow.time_attempts,
            retention_time: self.flow.retention_time,
            tags: self.tags.clone(),
            team: self.flow.team.clone(),
            level: self.flow.level.clone(),
        };
        let cell = self.self_cell.clone();
        let id = self.id.clone();
        let driver: DriverFn = Arc::new(move |ctx: ContextMap| {
            let Some(cell) = cell.upgrade() else {
                return Err(EngineError::InstanceNotFound(id.clone()));
            };
            let mut instance = cell.lock();
            instance.drive(ctx, "resilience")
        });
        self.resilience = Some(scheduler.add_custom(spec, driver, self.ctx.clone()));
    }

    #[cfg(test)]
    pub(crate) fn set_resilience_handle(&mut self, handle: Arc<dyn ResilienceHandle>) {
        self.resilience = Some(handle);
    }
}

fn worker_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("status", &self.status)
            .field("current", &self.current)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkFlows;
    use serde_json::json;

    fn set(key: &'static str) -> impl Fn(&mut Instance, ContextMap) -> anyhow::Result<ContextMap> {
        move |_, _| {
            let mut out = ContextMap::new();
            out.insert(key.to_string(), json!("done"));
            Ok(out)
        }
    }

    #[test]
    fn view_merges_tags_at_top_level() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("orders", "1.0", "Orders", "", "tester")
            .step_fn("a", "", set("step_0"), false)
            .register()
            .unwrap();

        let mut tags = ContextMap::new();
        tags.insert("tenant".into(), json!("acme"));
        let view = registry
            .run("i-1", "orders", Some(0), tags, ContextMap::new(), "tester")
            .unwrap();
        assert_eq!(view["tenant"], json!("acme"));
        assert_eq!(view["tags"]["tenant"], json!("acme"));
        assert_eq!(view["worker_host"], json!(worker_host()));
    }

    #[test]
    fn enter_step_merges_and_snapshots_the_delta() {
        let registry = WorkFlows::new(Services::default());
        let flow = registry
            .flow("orders", "1.0", "Orders", "", "tester")
            .step_fn("a", "", set("step_0"), false)
            .register()
            .unwrap();

        let mut instance = Instance::new(
            flow,
            Arc::new(Services::default()),
            "i-1".into(),
            ContextMap::new(),
            0,
            "tester",
        );

        let mut seed = ContextMap::new();
        seed.insert("k".into(), json!(1));
        let merged = instance.enter_step(seed.clone());
        assert_eq!(merged["k"], json!(1));
        assert_eq!(instance.ctxs[&0], seed);
    }
}
