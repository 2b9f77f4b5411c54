//! A single unit of work inside a flow.
//!
//! A step is either a native callable registered in-process or a script
//! body interpreted by the instance's embedded runtime. Steps may carry a
//! compensation callable (run in reverse order when a later step fails)
//! and a branch: an expression with true/false target indices consulted
//! after the body succeeds.

use std::sync::Arc;

use flowline_types::{ContextMap, InstanceStatus, StepKind, StepSpec};

use crate::error::EngineError;
use crate::instance::Instance;

/// Signature of native step callables and compensation callables.
pub type StepFn = Arc<dyn Fn(&mut Instance, ContextMap) -> anyhow::Result<ContextMap> + Send + Sync>;

/// Conditional jump attached to a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub expression: String,
    pub yes_go_to: usize,
    pub no_go_to: usize,
}

enum StepBody {
    Function(StepFn),
    Script(String),
}

/// One step of a flow template.
pub struct Step {
    pub name: String,
    pub description: String,
    /// Pause the instance after this step completes.
    pub stop: bool,
    pub branch: Option<Branch>,
    body: StepBody,
    compensation: Option<StepFn>,
}

impl Step {
    pub(crate) fn function(name: &str, description: &str, f: StepFn, stop: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            stop,
            branch: None,
            body: StepBody::Function(f),
            compensation: None,
        }
    }

    pub(crate) fn script(name: &str, description: &str, definition: &str, stop: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            stop,
            branch: None,
            body: StepBody::Script(definition.to_string()),
            compensation: None,
        }
    }

    /// Rebuild a step from its persisted spec. Native callables are not
    /// serializable; a restored function step fails when executed.
    pub(crate) fn from_spec(spec: &StepSpec) -> Self {
        let body = match spec.kind {
            StepKind::Script => StepBody::Script(spec.definition.clone()),
            StepKind::Function => {
                let name = spec.name.clone();
                StepBody::Function(Arc::new(move |_, _| {
                    Err(anyhow::anyhow!(
                        "native step `{name}` has no registered callable"
                    ))
                }))
            }
        };
        let branch = (!spec.expression.is_empty()).then(|| Branch {
            expression: spec.expression.clone(),
            yes_go_to: spec.yes_go_to,
            no_go_to: spec.no_go_to,
        });
        Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            stop: spec.stop,
            branch,
            body,
            compensation: None,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self.body {
            StepBody::Function(_) => StepKind::Function,
            StepBody::Script(_) => StepKind::Script,
        }
    }

    /// Script source; empty for native steps.
    pub fn definition(&self) -> &str {
        match &self.body {
            StepBody::Function(_) => "",
            StepBody::Script(definition) => definition,
        }
    }

    pub(crate) fn set_compensation(&mut self, f: StepFn) {
        self.compensation = Some(f);
    }

    pub(crate) fn compensation(&self) -> Option<&StepFn> {
        self.compensation.as_ref()
    }

    pub(crate) fn set_branch(&mut self, expression: &str, yes_go_to: usize, no_go_to: usize) {
        if expression.is_empty() {
            return;
        }
        self.branch = Some(Branch {
            expression: expression.to_string(),
            yes_go_to,
            no_go_to,
        });
    }

    /// Execute the step body against the instance.
    pub(crate) fn execute(
        &self,
        instance: &mut Instance,
        ctx: ContextMap,
    ) -> Result<ContextMap, EngineError> {
        instance.set_status(InstanceStatus::Running);
        match &self.body {
            StepBody::Function(f) => f(instance, ctx).map_err(|e| EngineError::StepFailed {
                step: instance.current,
                message: e.to_string(),
            }),
            StepBody::Script(definition) => instance.eval_script(definition),
        }
    }

    /// The persistable view of this step.
    pub fn spec(&self) -> StepSpec {
        let (expression, yes_go_to, no_go_to) = match &self.branch {
            Some(branch) => (
                branch.expression.clone(),
                branch.yes_go_to,
                branch.no_go_to,
            ),
            None => (String::new(), 0, 0),
        };
        StepSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            kind: self.kind(),
            stop: self.stop,
            expression,
            yes_go_to,
            no_go_to,
            definition: self.definition().to_string(),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("stop", &self.stop)
            .field("branch", &self.branch)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
