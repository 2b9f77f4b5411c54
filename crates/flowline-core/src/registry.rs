//! Process-wide directory of flows and active instances.
//!
//! [`WorkFlows`] holds flows by tag and active instances by id under a
//! single mutex. Drivers never hold that mutex: `run` resolves (or
//! creates) the instance slot under the lock, releases it, then claims
//! exclusive ownership of the instance with a try-lock — a second caller
//! racing on the same instance fails fast with "already running".
//! Completed instances are removed from the in-memory map; persistence
//! across the active window is the store hook's job.

use std::collections::HashMap;
use std::sync::Arc;

use flowline_types::{event, ContextMap};
use parking_lot::Mutex;
use serde_json::Value;

use crate::control::Controls;
use crate::error::EngineError;
use crate::flow::{steps_from_params, Flow, FlowBuilder};
use crate::instance::Instance;
use crate::services::Services;

/// An instance cell plus the control handle that stays reachable while a
/// driver owns the cell (used by `stop`).
#[derive(Clone)]
struct InstanceSlot {
    cell: Arc<Mutex<Instance>>,
    controls: Arc<Controls>,
}

#[derive(Default)]
struct State {
    flows: HashMap<String, Arc<Flow>>,
    instances: HashMap<String, InstanceSlot>,
}

/// The workflow registry and dispatch surface.
pub struct WorkFlows {
    services: Arc<Services>,
    state: Mutex<State>,
}

impl WorkFlows {
    pub fn new(services: Services) -> Arc<Self> {
        Arc::new(Self {
            services: Arc::new(services),
            state: Mutex::new(State::default()),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// True when the resilience scheduler (if any) reports healthy.
    pub fn health_check(&self) -> bool {
        self.services
            .resilience
            .as_ref()
            .map(|s| s.health_check())
            .unwrap_or(true)
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Start building a flow template.
    pub fn flow(
        self: &Arc<Self>,
        tag: &str,
        version: &str,
        name: &str,
        description: &str,
        created_by: &str,
    ) -> FlowBuilder {
        FlowBuilder::new(
            Arc::clone(self),
            Arc::clone(&self.services),
            tag,
            version,
            name,
            description,
            created_by,
        )
    }

    /// Start building a flow seeded with a native `Start` step.
    #[allow(clippy::too_many_arguments)]
    pub fn new_flow_fn<F>(
        self: &Arc<Self>,
        tag: &str,
        version: &str,
        name: &str,
        description: &str,
        f: F,
        stop: bool,
        created_by: &str,
    ) -> FlowBuilder
    where
        F: Fn(&mut Instance, ContextMap) -> anyhow::Result<ContextMap> + Send + Sync + 'static,
    {
        self.flow(tag, version, name, description, created_by)
            .step_fn("Start", "start of the workflow", f, stop)
    }

    /// Start building a flow seeded with a script `Start` step.
    #[allow(clippy::too_many_arguments)]
    pub fn new_flow_script(
        self: &Arc<Self>,
        tag: &str,
        version: &str,
        name: &str,
        description: &str,
        definition: &str,
        stop: bool,
        created_by: &str,
    ) -> FlowBuilder {
        self.flow(tag, version, name, description, created_by)
            .step_script("Start", "start of the workflow", definition, stop)
    }

    /// Build and register a script-step flow from a JSON payload.
    ///
    /// `tag`, `name` and `version` are required; each entry of `steps`
    /// requires `name` and `description`. Entries of `models` are warmed
    /// up against the data source, with failures reported on
    /// `workflow-error`.
    pub fn register_flow_from_params(
        self: &Arc<Self>,
        params: &Value,
    ) -> Result<Arc<Flow>, EngineError> {
        let tag = required_attr(params, "tag")?;
        let name = required_attr(params, "name")?;
        let version = required_attr(params, "version")?;
        let description = optional_attr(params, "description");
        let definition = optional_attr(params, "definition");
        let created_by = optional_attr(params, "created_by");
        let stop = params.get("stop").and_then(|v| v.as_bool()).unwrap_or(false);

        let mut builder = self.new_flow_script(
            &tag,
            &version,
            &name,
            &description,
            &definition,
            stop,
            &created_by,
        );
        for spec in steps_from_params(params)? {
            builder = builder.step_script(&spec.name, &spec.description, &spec.definition, spec.stop);
        }

        if let Some(models) = params.get("models").and_then(|v| v.as_array()) {
            for model in models {
                let database = model.get("database").and_then(|v| v.as_str()).unwrap_or("");
                let model_name = model.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if let Err(e) = self.services.data.model(database, model_name) {
                    tracing::warn!(database, model = model_name, error = %e, "model warm-up failed");
                    self.services.bus.publish(
                        event::WORKFLOW_ERROR,
                        event::error_payload(format!("model {database}.{model_name}: {e}")),
                    );
                }
            }
        }

        builder.register()
    }

    /// Pull a flow record through the store hook and register it.
    ///
    /// Only script steps survive persistence; function steps come back
    /// without callables.
    pub fn load_flow(self: &Arc<Self>, tag: &str) -> Result<Arc<Flow>, EngineError> {
        let Some(store) = &self.services.flow_store else {
            return Err(EngineError::FlowNotFound(tag.to_string()));
        };
        let record = store
            .load(tag)?
            .ok_or_else(|| EngineError::FlowNotFound(tag.to_string()))?;
        let flow = Arc::new(Flow::from_record(&record));
        self.insert_flow(Arc::clone(&flow));
        Ok(flow)
    }

    pub fn get_flow(&self, tag: &str) -> Option<Arc<Flow>> {
        self.state.lock().flows.get(tag).cloned()
    }

    pub(crate) fn insert_flow(&self, flow: Arc<Flow>) {
        self.state.lock().flows.insert(flow.tag.clone(), flow);
    }

    /// Delete a flow template. Running instances are unaffected; absent
    /// tags are a no-op.
    pub fn delete_flow(&self, tag: &str) -> Result<(), EngineError> {
        if let Some(store) = &self.services.flow_store {
            if let Err(e) = store.delete(tag) {
                tracing::error!(tag, error = %e, "failed to delete flow from store");
                self.services.bus.publish(
                    event::WORKFLOW_ERROR,
                    event::error_payload(format!("delete flow {tag}: {e}")),
                );
            }
        }
        let removed = self.state.lock().flows.remove(tag);
        if let Some(flow) = removed {
            let payload = serde_json::to_value(flow.record()).unwrap_or_default();
            self.services.bus.publish(event::FLOW_DELETE, payload);
            tracing::info!(tag, "flow deleted");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Run (or continue) an instance of the flow at `tag`.
    ///
    /// An empty `instance_id` gets a generated UUID. When `step` is set,
    /// the instance jumps there and restores that step's entry snapshot
    /// before driving. On normal return the instance leaves the in-memory
    /// map and its serialized view is returned; on error it stays
    /// registered for inspection and retries.
    pub fn run(
        &self,
        instance_id: &str,
        tag: &str,
        step: Option<usize>,
        tags: ContextMap,
        ctx: ContextMap,
        run_by: &str,
    ) -> Result<Value, EngineError> {
        let (id, slot) = self.get_or_create(instance_id, tag, step, &tags, run_by)?;
        let mut instance = slot
            .cell
            .try_lock()
            .ok_or_else(|| EngineError::AlreadyRunning(id.clone()))?;

        instance.set_tags(tags);
        if let Some(step) = step {
            instance.current = step;
            let snapshot = instance.ctxs.get(&step).cloned().unwrap_or_default();
            instance.enter_step(snapshot);
        }

        let outcome = instance.drive(ctx, run_by);
        let view = instance.view();
        let debug = instance.flow().debug;
        drop(instance);

        match outcome {
            Ok(_) => {
                self.remove_instance(&id);
                if debug {
                    tracing::debug!(instance_id = %id, view = %view, "run finished");
                }
                Ok(view)
            }
            Err(err) => Err(err),
        }
    }

    /// Continue a paused instance at its current step.
    pub fn resume(
        &self,
        instance_id: &str,
        tags: ContextMap,
        ctx: ContextMap,
        run_by: &str,
    ) -> Result<Value, EngineError> {
        let slot = self.find_instance(instance_id)?;
        let (tag, current) = {
            let instance = slot
                .cell
                .try_lock()
                .ok_or_else(|| EngineError::AlreadyRunning(instance_id.to_string()))?;
            (instance.tag.clone(), instance.current)
        };
        self.run(instance_id, &tag, Some(current), tags, ctx, run_by)
    }

    /// Set an instance back to pending. Results are kept.
    pub fn reset(&self, instance_id: &str, updated_by: &str) -> Result<(), EngineError> {
        let slot = self.find_instance(instance_id)?;
        let mut instance = slot.cell.lock();
        instance.updated_by = updated_by.to_string();
        instance.set_status(flowline_types::InstanceStatus::Pending);
        Ok(())
    }

    /// Run the compensation sweep with an empty context and no error seed.
    pub fn rollback(&self, instance_id: &str) -> Result<Value, EngineError> {
        let slot = self.find_instance(instance_id)?;
        let mut instance = slot
            .cell
            .try_lock()
            .ok_or_else(|| EngineError::AlreadyRunning(instance_id.to_string()))?;
        instance.run_rollback(ContextMap::new(), None)?;
        Ok(instance.view())
    }

    /// Request a pause after the instance's current step and re-emit its
    /// status. Effective immediately for idle instances and at the end of
    /// the in-flight step for running ones.
    pub fn stop(&self, instance_id: &str) -> Result<(), EngineError> {
        let slot = self.find_instance(instance_id)?;
        slot.controls.signal_stop();
        if let Some(mut instance) = slot.cell.try_lock() {
            instance.touch();
        }
        Ok(())
    }

    /// Delete an instance: store hook, in-memory map, `workflow-delete`.
    pub fn delete_instance(&self, instance_id: &str) -> Result<(), EngineError> {
        let slot = self.find_instance(instance_id)?;
        if let Some(store) = &self.services.instance_store {
            if let Err(e) = store.delete(instance_id) {
                tracing::error!(instance_id, error = %e, "failed to delete instance from store");
                self.services.bus.publish(
                    event::WORKFLOW_ERROR,
                    event::error_payload(format!("delete instance {instance_id}: {e}")),
                );
            }
        }
        let view = slot.cell.lock().view();
        self.remove_instance(instance_id);
        self.services.bus.publish(event::WORKFLOW_DELETE, view);
        tracing::info!(instance_id, "instance deleted");
        Ok(())
    }

    /// Serialized view of an instance. Falls back to the persisted record
    /// while a driver owns the instance.
    pub fn instance_view(&self, instance_id: &str) -> Result<Value, EngineError> {
        let slot = self.find_instance(instance_id)?;
        if let Some(instance) = slot.cell.try_lock() {
            return Ok(instance.view());
        }
        if let Some(store) = &self.services.instance_store {
            if let Ok(Some(record)) = store.load(instance_id) {
                return Ok(serde_json::to_value(record).unwrap_or_default());
            }
        }
        Err(EngineError::AlreadyRunning(instance_id.to_string()))
    }

    /// Number of instances in the in-memory map.
    pub fn count(&self) -> usize {
        self.state.lock().instances.len()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn get_or_create(
        &self,
        instance_id: &str,
        tag: &str,
        start: Option<usize>,
        tags: &ContextMap,
        created_by: &str,
    ) -> Result<(String, InstanceSlot), EngineError> {
        let id = if instance_id.is_empty() {
            uuid::Uuid::now_v7().to_string()
        } else {
            instance_id.to_string()
        };

        if let Some(slot) = self.lookup(&id)? {
            return Ok((id, slot));
        }

        let flow = self
            .get_flow(tag)
            .ok_or_else(|| EngineError::FlowNotFound(tag.to_string()))?;
        let instance = Instance::new(
            flow,
            Arc::clone(&self.services),
            id.clone(),
            tags.clone(),
            start.unwrap_or(0),
            created_by,
        );
        let slot = self.insert_instance(instance);
        Ok((id, slot))
    }

    /// Find an instance locally, falling back to the store hook. Store
    /// failures are logged and emitted, then treated as absence.
    fn lookup(&self, id: &str) -> Result<Option<InstanceSlot>, EngineError> {
        if let Some(slot) = self.state.lock().instances.get(id) {
            return Ok(Some(slot.clone()));
        }
        let Some(store) = &self.services.instance_store else {
            return Ok(None);
        };
        match store.load(id) {
            Ok(Some(record)) => {
                let flow = self
                    .get_flow(&record.tag)
                    .ok_or_else(|| EngineError::FlowNotFound(record.tag.clone()))?;
                let instance = Instance::from_record(flow, Arc::clone(&self.services), record);
                Ok(Some(self.insert_instance(instance)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::error!(instance_id = id, error = %e, "failed to load instance");
                self.services.bus.publish(
                    event::WORKFLOW_ERROR,
                    event::error_payload(format!("load instance {id}: {e}")),
                );
                Ok(None)
            }
        }
    }

    fn find_instance(&self, id: &str) -> Result<InstanceSlot, EngineError> {
        if id.is_empty() {
            return Err(EngineError::InstanceIdRequired);
        }
        self.lookup(id)?
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))
    }

    fn insert_instance(&self, instance: Instance) -> InstanceSlot {
        let id = instance.id.clone();
        let controls = Arc::clone(instance.controls());
        let cell = Arc::new(Mutex::new(instance));
        cell.lock().self_cell = Arc::downgrade(&cell);
        let slot = InstanceSlot { cell, controls };
        self.state.lock().instances.insert(id, slot.clone());
        slot
    }

    fn remove_instance(&self, id: &str) {
        self.state.lock().instances.remove(id);
    }
}

fn required_attr(params: &Value, attribute: &str) -> Result<String, EngineError> {
    params
        .get(attribute)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| EngineError::MissingAttribute(attribute.to_string()))
}

fn optional_attr(params: &Value, attribute: &str) -> String {
    params
        .get(attribute)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{EventBus, InstanceStore, ResilienceHandle, Services};
    use flowline_types::{InstanceRecord, InstanceStatus, StoreError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // -------------------------------------------------------------------
    // Test collaborators
    // -------------------------------------------------------------------

    /// In-memory instance store for pause/resume tests.
    #[derive(Default)]
    struct MapInstanceStore {
        records: Mutex<HashMap<String, InstanceRecord>>,
    }

    impl InstanceStore for MapInstanceStore {
        fn load(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError> {
            Ok(self.records.lock().get(id).cloned())
        }

        fn save(&self, record: &InstanceRecord) -> Result<(), StoreError> {
            self.records
                .lock()
                .insert(record.id.clone(), record.clone());
            Ok(())
        }

        fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.records.lock().remove(id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBus {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingBus {
        fn channels(&self) -> Vec<String> {
            self.events.lock().iter().map(|(c, _)| c.clone()).collect()
        }
    }

    impl EventBus for RecordingBus {
        fn publish(&self, channel: &str, payload: Value) {
            self.events.lock().push((channel.to_string(), payload));
        }
    }

    struct FixedHandle {
        attempt: u32,
        end: bool,
    }

    impl ResilienceHandle for FixedHandle {
        fn attempt(&self) -> u32 {
            self.attempt
        }

        fn is_end(&self) -> bool {
            self.end
        }
    }

    fn write_step(
        key: &'static str,
    ) -> impl Fn(&mut Instance, ContextMap) -> anyhow::Result<ContextMap> {
        move |_, _| {
            let mut out = ContextMap::new();
            out.insert(key.to_string(), json!("done"));
            Ok(out)
        }
    }

    fn failing_step(_: &mut Instance, _: ContextMap) -> anyhow::Result<ContextMap> {
        Err(anyhow::anyhow!("step blew up"))
    }

    fn log_compensation(
        log: Arc<Mutex<Vec<usize>>>,
        index: usize,
    ) -> impl Fn(&mut Instance, ContextMap) -> anyhow::Result<ContextMap> {
        move |_, ctx| {
            log.lock().push(index);
            Ok(ctx)
        }
    }

    fn empty() -> ContextMap {
        ContextMap::new()
    }

    // -------------------------------------------------------------------
    // Scenario 1: linear happy path
    // -------------------------------------------------------------------

    #[test]
    fn linear_happy_path() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .step_fn("one", "", write_step("step_1"), false)
            .step_fn("two", "", write_step("step_2"), false)
            .register()
            .unwrap();

        let view = registry
            .run("i1", "reg", Some(0), empty(), empty(), "u")
            .unwrap();

        assert_eq!(view["status"], json!("done"));
        assert_eq!(view["current"], json!(2));
        assert_eq!(view["ctx"]["step_0"], json!("done"));
        assert_eq!(view["ctx"]["step_1"], json!("done"));
        assert_eq!(view["ctx"]["step_2"], json!("done"));
        assert_eq!(view["results"].as_object().unwrap().len(), 3);
        // Completed instances leave the in-memory map.
        assert_eq!(registry.count(), 0);
    }

    // -------------------------------------------------------------------
    // Scenario 2: stop then continue
    // -------------------------------------------------------------------

    #[test]
    fn stop_then_continue() {
        let services = Services::builder()
            .instance_store(Arc::new(MapInstanceStore::default()))
            .build();
        let registry = WorkFlows::new(services);
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .step_fn("one", "", write_step("step_1"), true)
            .step_fn("two", "", write_step("step_2"), false)
            .register()
            .unwrap();

        let view = registry
            .run("i1", "reg", Some(0), empty(), empty(), "u")
            .unwrap();
        assert_eq!(view["status"], json!("pending"));
        assert_eq!(view["current"], json!(2));

        let view = registry.resume("i1", empty(), empty(), "u").unwrap();
        assert_eq!(view["status"], json!("done"));
        assert_eq!(view["ctx"]["step_2"], json!("done"));
    }

    // -------------------------------------------------------------------
    // Scenario 3: branch skips the trap step
    // -------------------------------------------------------------------

    #[test]
    fn branch_routes_around_failing_step() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("branchy", "1.0", "Branchy", "", "u")
            .step_fn(
                "zero",
                "",
                |_, _| {
                    let mut out = ContextMap::new();
                    out.insert("k".into(), json!(1));
                    Ok(out)
                },
                false,
            )
            .if_else("k == 1", 2, 1)
            .step_fn("trap", "", failing_step, false)
            .step_fn("two", "", write_step("step_2"), false)
            .register()
            .unwrap();

        let view = registry
            .run("i1", "branchy", Some(0), empty(), empty(), "u")
            .unwrap();

        assert_eq!(view["status"], json!("done"));
        let results = view["results"].as_object().unwrap();
        assert!(results.contains_key("0"));
        assert!(results.contains_key("2"));
        assert!(!results.contains_key("1"), "trap step must never run");
    }

    #[test]
    fn branch_false_takes_no_target() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("branchy", "1.0", "Branchy", "", "u")
            .step_fn(
                "zero",
                "",
                |_, _| {
                    let mut out = ContextMap::new();
                    out.insert("k".into(), json!(2));
                    Ok(out)
                },
                false,
            )
            .if_else("k == 1", 2, 1)
            .step_fn("one", "", write_step("step_1"), false)
            .step_fn("two", "", write_step("step_2"), false)
            .register()
            .unwrap();

        let view = registry
            .run("i1", "branchy", Some(0), empty(), empty(), "u")
            .unwrap();
        assert_eq!(view["status"], json!("done"));
        assert_eq!(view["ctx"]["step_1"], json!("done"));
    }

    #[test]
    fn non_boolean_branch_expression_fails_the_step() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("branchy", "1.0", "Branchy", "", "u")
            .step_fn(
                "zero",
                "",
                |_, _| {
                    let mut out = ContextMap::new();
                    out.insert("k".into(), json!(1));
                    Ok(out)
                },
                false,
            )
            .if_else("k + 1", 1, 1)
            .step_fn("one", "", write_step("step_1"), false)
            .register()
            .unwrap();

        let err = registry
            .run("i1", "branchy", Some(0), empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::NotBoolean { .. }));
        let view = registry.instance_view("i1").unwrap();
        assert_eq!(view["status"], json!("failed"));
    }

    // -------------------------------------------------------------------
    // Scenario 4: rollback under eventual consistency
    // -------------------------------------------------------------------

    #[test]
    fn rollback_eventual_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("comp", "1.0", "Compensated", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .rollback(log_compensation(Arc::clone(&log), 0))
            .step_fn("one", "", write_step("step_1"), false)
            .rollback(log_compensation(Arc::clone(&log), 1))
            .step_fn("two", "", failing_step, false)
            .rollback(log_compensation(Arc::clone(&log), 2))
            .resilience(1, Duration::from_secs(1), "team", "low")
            .register()
            .unwrap();

        let err = registry
            .run("i1", "comp", Some(0), empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::StepFailed { step: 2, .. }));

        // Reverse order: step 1's compensation before step 0's.
        assert_eq!(*log.lock(), vec![1, 0]);

        let view = registry.instance_view("i1").unwrap();
        assert_eq!(view["status"], json!("failed"));
        let rollbacks = view["rollbacks"].as_object().unwrap();
        assert!(rollbacks.contains_key("0"));
        assert!(rollbacks.contains_key("1"));
        assert!(!rollbacks.contains_key("2"));
    }

    // -------------------------------------------------------------------
    // Scenario 5: rollback under strong consistency with a failing
    // compensation
    // -------------------------------------------------------------------

    #[test]
    fn rollback_strong_aborts_on_first_compensation_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("comp", "1.0", "Compensated", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .rollback(log_compensation(Arc::clone(&log), 0))
            .step_fn("one", "", write_step("step_1"), false)
            .rollback(|_, _| Err(anyhow::anyhow!("compensation refused")))
            .step_fn("two", "", failing_step, false)
            .resilience(1, Duration::from_secs(1), "team", "low")
            .consistency(flowline_types::Consistency::Strong)
            .register()
            .unwrap();

        let err = registry
            .run("i1", "comp", Some(0), empty(), empty(), "u")
            .unwrap_err();
        match err {
            EngineError::Compensation { step, message } => {
                assert_eq!(step, 1);
                assert!(message.contains("compensation refused"));
            }
            other => panic!("expected compensation error, got {other}"),
        }

        // Step 0's compensation was never invoked.
        assert!(log.lock().is_empty());
        let view = registry.instance_view("i1").unwrap();
        let rollbacks = view["rollbacks"].as_object().unwrap();
        assert!(rollbacks.contains_key("1"));
        assert!(!rollbacks.contains_key("0"));
    }

    // -------------------------------------------------------------------
    // Scenario 6: goto loop termination
    // -------------------------------------------------------------------

    #[test]
    fn goto_signal_is_consumed_after_one_jump() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = WorkFlows::new(Services::default());
        let counter = Arc::clone(&invocations);
        registry
            .flow("looper", "1.0", "Looper", "", "u")
            .step_fn(
                "only",
                "",
                move |instance, ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut out = ContextMap::new();
                    if !ctx.contains_key("count") {
                        instance.go_to(0);
                        out.insert("count".into(), json!(1));
                    }
                    Ok(out)
                },
                false,
            )
            .register()
            .unwrap();

        let view = registry
            .run("i1", "looper", Some(0), empty(), empty(), "u")
            .unwrap();
        assert_eq!(view["status"], json!("done"));
        // First run jumps back once; the cleared signal ends the loop.
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn goto_wins_over_branch() {
        // A step that both jumps and carries a branch: the jump is taken
        // and the expression is never consulted.
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("mixed", "1.0", "Mixed signals", "", "u")
            .step_fn(
                "zero",
                "",
                |instance, _| {
                    instance.go_to(2);
                    let mut out = ContextMap::new();
                    out.insert("k".into(), json!(1));
                    Ok(out)
                },
                false,
            )
            .if_else("k == 1", 1, 1)
            .step_fn("trap", "", failing_step, false)
            .step_fn("two", "", write_step("step_2"), false)
            .register()
            .unwrap();

        let view = registry
            .run("i1", "mixed", Some(0), empty(), empty(), "u")
            .unwrap();
        assert_eq!(view["status"], json!("done"));
        assert_eq!(view["ctx"]["step_2"], json!("done"));
        assert!(!view["results"].as_object().unwrap().contains_key("1"));
    }

    // -------------------------------------------------------------------
    // Preconditions and laws
    // -------------------------------------------------------------------

    #[test]
    fn run_on_done_instance_is_rejected_without_mutation() {
        let store = Arc::new(MapInstanceStore::default());
        let services = Services::builder()
            .instance_store(Arc::clone(&store) as Arc<dyn InstanceStore>)
            .build();
        let registry = WorkFlows::new(services);
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("only", "", write_step("step_0"), false)
            .register()
            .unwrap();

        registry
            .run("i1", "reg", Some(0), empty(), empty(), "u")
            .unwrap();
        let before = store.records.lock().get("i1").cloned().unwrap();

        let err = registry
            .run("i1", "reg", None, empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyDone(_)));

        let after = store.records.lock().get("i1").cloned().unwrap();
        assert_eq!(after.status, InstanceStatus::Done);
        assert_eq!(after.results, before.results);
        assert_eq!(after.current, before.current);
    }

    #[test]
    fn unknown_tag_is_a_configuration_error() {
        let registry = WorkFlows::new(Services::default());
        let err = registry
            .run("i1", "missing", Some(0), empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::FlowNotFound(_)));
    }

    #[test]
    fn empty_id_generates_a_uuid() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("only", "", write_step("step_0"), false)
            .register()
            .unwrap();

        let view = registry
            .run("", "reg", Some(0), empty(), empty(), "u")
            .unwrap();
        let id = view["id"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn concurrent_driver_fails_fast_with_already_running() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("only", "", failing_step, false)
            .register()
            .unwrap();
        // Park a failed instance in the map, then hold its lock while a
        // second run attempt comes in.
        let _ = registry.run("i1", "reg", Some(0), empty(), empty(), "u");
        let slot = registry.find_instance("i1").unwrap();
        let _guard = slot.cell.lock();

        let err = registry
            .run("i1", "reg", None, empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
    }

    #[test]
    fn snapshot_fidelity_for_compensations() {
        // Each compensation must receive exactly the ctx its step saw on
        // entry.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = WorkFlows::new(Services::default());
        let log0 = Arc::clone(&seen);
        let log1 = Arc::clone(&seen);
        registry
            .flow("snap", "1.0", "Snapshots", "", "u")
            .step_fn("zero", "", write_step("from_0"), false)
            .rollback(move |_, ctx| {
                log0.lock().push((0, ctx.clone()));
                Ok(ctx)
            })
            .step_fn("one", "", write_step("from_1"), false)
            .rollback(move |_, ctx| {
                log1.lock().push((1, ctx.clone()));
                Ok(ctx)
            })
            .step_fn("two", "", failing_step, false)
            .resilience(1, Duration::from_secs(1), "", "")
            .register()
            .unwrap();

        let mut seed = ContextMap::new();
        seed.insert("seed".into(), json!(true));
        let _ = registry.run("i1", "snap", Some(0), empty(), seed.clone(), "u");

        let seen = seen.lock();
        // Step 1 entered with step 0's result; step 0 entered with the
        // caller's seed ctx.
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[0].1["from_0"], json!("done"));
        assert_eq!(seen[1].0, 0);
        assert_eq!(seen[1].1, seed);
    }

    #[test]
    fn no_compensation_without_retries_configured() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("comp", "1.0", "Compensated", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .rollback(log_compensation(Arc::clone(&log), 0))
            .step_fn("one", "", failing_step, false)
            .register()
            .unwrap();

        let err = registry
            .run("i1", "comp", Some(0), empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::StepFailed { .. }));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn exhausted_handle_makes_failure_terminal() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("only", "", failing_step, false)
            .resilience(1, Duration::from_secs(1), "", "")
            .register()
            .unwrap();

        let _ = registry.run("i1", "reg", Some(0), empty(), empty(), "u");
        let slot = registry.find_instance("i1").unwrap();
        slot.cell.lock().set_resilience_handle(Arc::new(FixedHandle {
            attempt: 1,
            end: true,
        }));

        // Re-drive fails again; with the handle exhausted the failure is
        // now terminal.
        let err = registry
            .run("i1", "reg", None, empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::StepFailed { .. }));
        let err = registry
            .run("i1", "reg", None, empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::Exhausted(_)));
    }

    // -------------------------------------------------------------------
    // Registry operations
    // -------------------------------------------------------------------

    #[test]
    fn reset_returns_to_pending_and_keeps_results() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .step_fn("one", "", failing_step, false)
            .register()
            .unwrap();

        let _ = registry.run("i1", "reg", Some(0), empty(), empty(), "u");
        registry.reset("i1", "operator").unwrap();

        let view = registry.instance_view("i1").unwrap();
        assert_eq!(view["status"], json!("pending"));
        assert_eq!(view["updated_by"], json!("operator"));
        assert!(!view["results"].as_object().unwrap().is_empty());
    }

    #[test]
    fn stop_request_pauses_after_next_step() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .step_fn("one", "", failing_step, false)
            .register()
            .unwrap();

        // Park a pending instance by creating then stopping before run.
        let _ = registry.get_or_create("i1", "reg", Some(0), &empty(), "u");
        registry.stop("i1").unwrap();

        let view = registry
            .run("i1", "reg", None, empty(), empty(), "u")
            .unwrap();
        // The stop request pauses the instance after step 0, so the
        // failing step never runs.
        assert_eq!(view["status"], json!("pending"));
        assert_eq!(view["current"], json!(1));
    }

    #[test]
    fn delete_instance_emits_workflow_delete() {
        let bus = Arc::new(RecordingBus::default());
        let services = Services::builder()
            .bus(Arc::clone(&bus) as Arc<dyn EventBus>)
            .build();
        let registry = WorkFlows::new(services);
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("only", "", failing_step, false)
            .register()
            .unwrap();

        let _ = registry.run("i1", "reg", Some(0), empty(), empty(), "u");
        registry.delete_instance("i1").unwrap();

        assert_eq!(registry.count(), 0);
        assert!(bus
            .channels()
            .iter()
            .any(|c| c == event::WORKFLOW_DELETE));
        assert!(matches!(
            registry.instance_view("i1").unwrap_err(),
            EngineError::InstanceNotFound(_)
        ));
    }

    #[test]
    fn replacing_a_flow_does_not_touch_parked_instances() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .step_fn("one", "", failing_step, false)
            .register()
            .unwrap();
        let _ = registry.run("i1", "reg", Some(0), empty(), empty(), "u");

        registry
            .flow("reg", "2.0", "Registration v2", "", "u")
            .step_fn("only", "", write_step("replacement"), false)
            .register()
            .unwrap();

        let slot = registry.find_instance("i1").unwrap();
        let instance = slot.cell.lock();
        assert_eq!(instance.flow().steps().len(), 2);
        assert_eq!(instance.flow().version, "1.0");
        assert_eq!(registry.get_flow("reg").unwrap().version, "2.0");
    }

    #[test]
    fn delete_flow_emits_flow_delete_once() {
        let bus = Arc::new(RecordingBus::default());
        let services = Services::builder()
            .bus(Arc::clone(&bus) as Arc<dyn EventBus>)
            .build();
        let registry = WorkFlows::new(services);
        registry
            .flow("reg", "1.0", "Registration", "", "u")
            .step_fn("only", "", write_step("step_0"), false)
            .register()
            .unwrap();

        registry.delete_flow("reg").unwrap();
        registry.delete_flow("reg").unwrap();

        let deletes = bus
            .channels()
            .iter()
            .filter(|c| *c == event::FLOW_DELETE)
            .count();
        assert_eq!(deletes, 1);
        assert!(registry.get_flow("reg").is_none());
    }

    #[test]
    fn explicit_rollback_records_compensations() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = Services::builder()
            .instance_store(Arc::new(MapInstanceStore::default()))
            .build();
        let registry = WorkFlows::new(services);
        registry
            .flow("comp", "1.0", "Compensated", "", "u")
            .step_fn("zero", "", write_step("step_0"), false)
            .rollback(log_compensation(Arc::clone(&log), 0))
            .step_fn("one", "", write_step("step_1"), true)
            .step_fn("two", "", write_step("step_2"), false)
            .resilience(1, Duration::from_secs(1), "", "")
            .register()
            .unwrap();

        // Step 1 pauses the instance; ask for an explicit rollback while
        // it sits at step 2.
        let _ = registry.run("i1", "comp", Some(0), empty(), empty(), "u");

        let view = registry.rollback("i1").unwrap();
        assert_eq!(view["status"], json!("failed"));
        assert_eq!(*log.lock(), vec![0]);
    }

    // -------------------------------------------------------------------
    // Script steps end to end
    // -------------------------------------------------------------------

    #[test]
    fn script_flow_accumulates_context() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("scripted", "1.0", "Scripted", "", "u")
            .step_script("zero", "", "let result = #{ a: 1 };", false)
            .step_script("one", "", "let result = #{ b: ctx.a + 1 };", false)
            .register()
            .unwrap();

        let view = registry
            .run("i1", "scripted", Some(0), empty(), empty(), "u")
            .unwrap();
        assert_eq!(view["status"], json!("done"));
        assert_eq!(view["ctx"]["a"], json!(1));
        assert_eq!(view["ctx"]["b"], json!(2));
    }

    #[test]
    fn script_branch_and_done_signal() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("scripted", "1.0", "Scripted", "", "u")
            .step_script("zero", "", "let result = #{ k: 1 };", false)
            .if_else("k == 1", 2, 1)
            .step_script("trap", "", "throw \"must not run\";", false)
            .step_script("two", "", "done(); let result = #{ finished: true };", false)
            .register()
            .unwrap();

        let view = registry
            .run("i1", "scripted", Some(0), empty(), empty(), "u")
            .unwrap();
        assert_eq!(view["status"], json!("done"));
        assert_eq!(view["ctx"]["finished"], json!(true));
    }

    #[test]
    fn empty_script_definition_fails_the_step() {
        let registry = WorkFlows::new(Services::default());
        registry
            .flow("scripted", "1.0", "Scripted", "", "u")
            .step_script("zero", "", "", false)
            .register()
            .unwrap();

        let err = registry
            .run("i1", "scripted", Some(0), empty(), empty(), "u")
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyDefinition { step: 0 }));
    }

    // -------------------------------------------------------------------
    // Flow payloads
    // -------------------------------------------------------------------

    #[test]
    fn register_flow_from_params_builds_script_steps() {
        let registry = WorkFlows::new(Services::default());
        let flow = registry
            .register_flow_from_params(&json!({
                "tag": "payload",
                "name": "From payload",
                "version": "1.0",
                "definition": "let result = #{ start: true };",
                "created_by": "loader",
                "steps": [
                    { "name": "next", "description": "second", "definition": "let result = #{ next: true };" },
                ],
            }))
            .unwrap();

        assert_eq!(flow.steps().len(), 2);
        let view = registry
            .run("i1", "payload", Some(0), empty(), empty(), "loader")
            .unwrap();
        assert_eq!(view["status"], json!("done"));
        assert_eq!(view["ctx"]["start"], json!(true));
        assert_eq!(view["ctx"]["next"], json!(true));
    }

    #[test]
    fn register_flow_from_params_requires_tag_name_version() {
        let registry = WorkFlows::new(Services::default());
        for missing in ["tag", "name", "version"] {
            let mut params = json!({
                "tag": "t", "name": "n", "version": "1",
            });
            params.as_object_mut().unwrap().remove(missing);
            let err = registry.register_flow_from_params(&params).unwrap_err();
            assert!(
                matches!(err, EngineError::MissingAttribute(ref a) if a == missing),
                "expected missing {missing}, got {err}"
            );
        }
    }
}
