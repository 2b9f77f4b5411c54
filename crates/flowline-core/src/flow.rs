//! Flow templates and their builder.
//!
//! A flow is an immutable ordered sequence of steps plus retry and
//! consistency configuration, identified by `tag`. Step insertion order
//! is execution order; indices are stable and used by branch targets and
//! jumps. Flows are assembled through [`FlowBuilder`], which persists the
//! template and emits `flow-set` after every mutator, then registered
//! into the [`crate::registry::WorkFlows`] directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowline_types::{event, Consistency, ContextMap, FlowRecord, StepSpec};

use crate::error::EngineError;
use crate::instance::Instance;
use crate::registry::WorkFlows;
use crate::services::Services;
use crate::step::Step;

/// Default retention when no resilience is configured.
const DEFAULT_RETENTION: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// An immutable workflow template.
#[derive(Debug)]
pub struct Flow {
    pub tag: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub total_attempts: u32,
    pub time_attempts: Duration,
    pub retention_time: Duration,
    pub team: String,
    pub level: String,
    pub consistency: Consistency,
    /// Diagnostic verbosity: log the serialized instance after a drive.
    pub debug: bool,
    steps: Vec<Step>,
}

impl Flow {
    fn new(tag: &str, version: &str, name: &str, description: &str, created_by: &str) -> Self {
        Self {
            tag: tag.to_string(),
            version: version.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_by: created_by.to_string(),
            total_attempts: 0,
            time_attempts: Duration::ZERO,
            retention_time: DEFAULT_RETENTION,
            team: String::new(),
            level: String::new(),
            consistency: Consistency::Eventual,
            debug: false,
            steps: Vec::new(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// The persistable view of this flow.
    pub fn record(&self) -> FlowRecord {
        FlowRecord {
            tag: self.tag.clone(),
            version: self.version.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            total_attempts: self.total_attempts,
            time_attempts: self.time_attempts.as_secs(),
            retention_time: self.retention_time.as_secs(),
            steps: self.steps.iter().map(Step::spec).collect(),
            tp_consistency: self.consistency,
            team: self.team.clone(),
            level: self.level.clone(),
            created_by: self.created_by.clone(),
        }
    }

    /// Rebuild a flow from its persisted record. Only script steps can be
    /// restored; function steps come back without their callables and
    /// fail at execution time.
    pub fn from_record(record: &FlowRecord) -> Self {
        Self {
            tag: record.tag.clone(),
            version: record.version.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            created_by: record.created_by.clone(),
            total_attempts: record.total_attempts,
            time_attempts: Duration::from_secs(record.time_attempts),
            retention_time: Duration::from_secs(record.retention_time),
            team: record.team.clone(),
            level: record.level.clone(),
            consistency: record.tp_consistency,
            debug: false,
            steps: record.steps.iter().map(Step::from_spec).collect(),
        }
    }

    /// Check that every branch references valid step indices.
    fn validate(&self) -> Result<(), EngineError> {
        let len = self.steps.len();
        for step in &self.steps {
            if let Some(branch) = &step.branch {
                for target in [branch.yes_go_to, branch.no_go_to] {
                    if target >= len {
                        return Err(EngineError::BranchOutOfRange { target, len });
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FlowBuilder
// ---------------------------------------------------------------------------

/// Chained builder for a flow template.
///
/// Obtained from [`WorkFlows::flow`] (or the `new_flow_*` seeders). Every
/// mutator persists the flow through the store hook and emits `flow-set`,
/// so partially built templates are already visible to observers, exactly
/// like incremental construction against a live registry.
pub struct FlowBuilder {
    flow: Flow,
    registry: Arc<WorkFlows>,
    services: Arc<Services>,
}

impl FlowBuilder {
    pub(crate) fn new(
        registry: Arc<WorkFlows>,
        services: Arc<Services>,
        tag: &str,
        version: &str,
        name: &str,
        description: &str,
        created_by: &str,
    ) -> Self {
        tracing::info!(
            tag,
            version,
            name,
            "flow created"
        );
        Self {
            flow: Flow::new(tag, version, name, description, created_by),
            registry,
            services,
        }
    }

    /// Append a native-callable step.
    pub fn step_fn<F>(mut self, name: &str, description: &str, f: F, stop: bool) -> Self
    where
        F: Fn(&mut Instance, ContextMap) -> anyhow::Result<ContextMap> + Send + Sync + 'static,
    {
        self.flow
            .steps
            .push(Step::function(name, description, Arc::new(f), stop));
        self.persist(&format!("step {} `{name}` added", self.flow.steps.len() - 1));
        self
    }

    /// Append a script step from inline source.
    pub fn step_script(mut self, name: &str, description: &str, definition: &str, stop: bool) -> Self {
        self.flow
            .steps
            .push(Step::script(name, description, definition, stop));
        self.persist(&format!("step {} `{name}` added", self.flow.steps.len() - 1));
        self
    }

    /// Append a script step read from a file.
    ///
    /// A read failure degrades to an empty definition (the step then fails
    /// at execution time) and is surfaced on `workflow-error`.
    pub fn step_script_file(
        self,
        name: &str,
        description: &str,
        path: impl AsRef<Path>,
        stop: bool,
    ) -> Self {
        let path = path.as_ref();
        let definition = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(
                    tag = self.flow.tag.as_str(),
                    path = %path.display(),
                    error = %e,
                    "failed to read step definition; using empty source"
                );
                self.services.bus.publish(
                    event::WORKFLOW_ERROR,
                    event::error_payload(format!(
                        "read step definition {}: {e}",
                        path.display()
                    )),
                );
                String::new()
            }
        };
        self.step_script(name, description, &definition, stop)
    }

    /// Attach a compensation callable to the most recently added step.
    pub fn rollback<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Instance, ContextMap) -> anyhow::Result<ContextMap> + Send + Sync + 'static,
    {
        match self.flow.steps.last_mut() {
            Some(step) => {
                step.set_compensation(Arc::new(f));
                let note = format!("rollback attached to step {}", self.flow.steps.len() - 1);
                self.persist(&note);
            }
            None => {
                tracing::warn!(tag = self.flow.tag.as_str(), "rollback called with no steps");
            }
        }
        self
    }

    /// Attach a branch to the most recently added step.
    ///
    /// Targets are validated against the final step list at registration.
    pub fn if_else(mut self, expression: &str, yes_go_to: usize, no_go_to: usize) -> Self {
        match self.flow.steps.last_mut() {
            Some(step) => {
                step.set_branch(expression, yes_go_to, no_go_to);
                let note = format!(
                    "branch `{expression}` ({yes_go_to}/{no_go_to}) on step {}",
                    self.flow.steps.len() - 1
                );
                self.persist(&note);
            }
            None => {
                tracing::warn!(tag = self.flow.tag.as_str(), "if_else called with no steps");
            }
        }
        self
    }

    /// Configure the retry policy. Bumps the retention time up to
    /// `total_attempts × time_attempts` when it is smaller.
    pub fn resilience(
        mut self,
        total_attempts: u32,
        time_attempts: Duration,
        team: &str,
        level: &str,
    ) -> Self {
        self.flow.total_attempts = total_attempts;
        self.flow.time_attempts = time_attempts;
        let floor = time_attempts.saturating_mul(total_attempts);
        if self.flow.retention_time < floor {
            self.flow.retention_time = floor;
        }
        self.flow.team = team.to_string();
        self.flow.level = level.to_string();
        self.persist(&format!(
            "resilience: {total_attempts} attempts every {time_attempts:?}"
        ));
        self
    }

    /// Set the retention time. The value never decreases and never drops
    /// below `total_attempts × time_attempts`.
    pub fn retention(mut self, retention_time: Duration) -> Self {
        let floor = self
            .flow
            .time_attempts
            .saturating_mul(self.flow.total_attempts);
        self.flow.retention_time = self.flow.retention_time.max(retention_time).max(floor);
        self.persist(&format!("retention: {:?}", self.flow.retention_time));
        self
    }

    /// Set the rollback abort semantics.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.flow.consistency = consistency;
        self.persist(&format!("consistency: {consistency:?}"));
        self
    }

    /// Enable diagnostic verbosity.
    pub fn debug(mut self) -> Self {
        self.flow.debug = true;
        self
    }

    /// Validate the template and insert it into the registry, replacing
    /// any prior flow at the same tag. Running instances keep the step
    /// list they were created with.
    pub fn register(self) -> Result<Arc<Flow>, EngineError> {
        self.flow.validate()?;
        let flow = Arc::new(self.flow);
        self.registry.insert_flow(Arc::clone(&flow));
        tracing::info!(
            tag = flow.tag.as_str(),
            steps = flow.steps().len(),
            "flow registered"
        );
        Ok(flow)
    }

    /// Persist the in-progress template and emit `flow-set`.
    fn persist(&self, action: &str) {
        let record = self.flow.record();
        if let Some(store) = &self.services.flow_store {
            if let Err(e) = store.save(&record) {
                tracing::error!(
                    tag = self.flow.tag.as_str(),
                    error = %e,
                    "failed to persist flow"
                );
                self.services.bus.publish(
                    event::WORKFLOW_ERROR,
                    event::error_payload(format!("save flow {}: {e}", self.flow.tag)),
                );
            }
        }
        let payload = serde_json::to_value(&record).unwrap_or_default();
        self.services.bus.publish(event::FLOW_SET, payload);
        tracing::debug!(tag = self.flow.tag.as_str(), action, "flow updated");
    }
}

// ---------------------------------------------------------------------------
// Flow payload loading
// ---------------------------------------------------------------------------

/// Extract the step specs from a flow JSON payload.
///
/// Each entry requires `name` and `description`; `definition` and `stop`
/// are optional.
pub(crate) fn steps_from_params(params: &serde_json::Value) -> Result<Vec<StepSpec>, EngineError> {
    let Some(entries) = params.get("steps").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let mut specs = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let name = required_step_attr(entry, "name", index)?;
        let description = required_step_attr(entry, "description", index)?;
        specs.push(StepSpec {
            name,
            description,
            kind: flowline_types::StepKind::Script,
            stop: entry.get("stop").and_then(|v| v.as_bool()).unwrap_or(false),
            expression: String::new(),
            yes_go_to: 0,
            no_go_to: 0,
            definition: entry
                .get("definition")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        });
    }
    Ok(specs)
}

fn required_step_attr(
    entry: &serde_json::Value,
    attribute: &str,
    step: usize,
) -> Result<String, EngineError> {
    match entry.get(attribute).and_then(|v| v.as_str()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(EngineError::MissingStepAttribute {
            attribute: attribute.to_string(),
            step,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
