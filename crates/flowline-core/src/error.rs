//! Engine error type.
//!
//! Kinds follow the failure surfaces of the engine: configuration errors
//! return to the caller without state change, step-level errors trigger
//! the rollback sweep, compensation errors are recorded per step, and
//! collaborator failures are wrapped from their own error types.

use flowline_types::{HostError, StoreError};
use thiserror::Error;

/// Errors raised by the flowline engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No flow is registered under the given tag.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// No instance exists with the given id.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// An operation that requires an instance id received an empty one.
    #[error("instance id is required")]
    InstanceIdRequired,

    /// The instance already completed; no further step advances occur.
    #[error("instance {0} is already done")]
    AlreadyDone(String),

    /// Another driver currently owns the instance.
    #[error("instance {0} is already running")]
    AlreadyRunning(String),

    /// The resilience scheduler exhausted the configured attempts.
    #[error("instance {0} is terminally failed: attempts exhausted")]
    Exhausted(String),

    /// The instance position does not reference a step of its flow.
    #[error("step {current} is out of range for instance {id} ({len} steps)")]
    StepOutOfRange {
        id: String,
        current: usize,
        len: usize,
    },

    /// A branch was configured with a target outside the flow's steps.
    #[error("branch target {target} is out of range ({len} steps)")]
    BranchOutOfRange { target: usize, len: usize },

    /// A script step reached execution with no source.
    #[error("step {step} has an empty script definition")]
    EmptyDefinition { step: usize },

    /// The script runtime raised or the script threw.
    #[error("script failed at step {step}: {message}")]
    Script { step: usize, message: String },

    /// A native step callable returned an error.
    #[error("step {step} failed: {message}")]
    StepFailed { step: usize, message: String },

    /// A branch expression could not be evaluated.
    #[error("expression `{expression}` failed: {message}")]
    Expression { expression: String, message: String },

    /// A branch expression produced something other than a boolean.
    #[error("expression `{expression}` did not evaluate to a boolean: got {value}")]
    NotBoolean {
        expression: String,
        value: serde_json::Value,
    },

    /// A compensation callable returned an error.
    #[error("compensation failed at step {step}: {message}")]
    Compensation { step: usize, message: String },

    /// A flow payload is missing a required attribute.
    #[error("attribute `{0}` is required")]
    MissingAttribute(String),

    /// A step entry in a flow payload is missing a required attribute.
    #[error("attribute `{attribute}` is required on step {step}")]
    MissingStepAttribute { attribute: String, step: usize },

    /// A storage hook failed in a context where the failure must surface.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A host collaborator failed outside a script context.
    #[error(transparent)]
    Host(#[from] HostError),
}
