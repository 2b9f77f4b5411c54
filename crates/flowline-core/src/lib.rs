//! Flowline: a durable, resumable workflow execution engine.
//!
//! Flows are immutable ordered templates of steps; instances drive them
//! one step at a time with branching, pause/resume, rollback compensation
//! and retry registration. Steps are either native callables or scripts
//! interpreted by a per-instance embedded runtime with a host API
//! (logging, HTTP, cache, pub/sub, data queries).
//!
//! # Core workflow
//!
//! 1. Build a [`registry::WorkFlows`] with the collaborators you have
//!    (stores, bus, cache, HTTP client, resilience scheduler) via
//!    [`services::Services::builder`].
//! 2. Register flows through the chained builder:
//!    `registry.flow(tag, ...).step_fn(...).rollback(...).if_else(...)
//!    .resilience(...).register()`.
//! 3. Drive instances: `registry.run(id, tag, step, tags, ctx, by)`,
//!    then `resume`, `stop`, `reset`, `rollback` or `delete_instance`.
//!
//! Step bodies signal the driver through the instance: `done()` finishes,
//! `stop()` pauses, `go_to(step)` jumps — with that precedence. A step's
//! branch expression is evaluated after its body and routes to one of two
//! step indices. When a step fails, compensations run in reverse order
//! over the recorded entry snapshots, and the instance is handed to the
//! resilience scheduler when retries are configured.

pub mod control;
pub mod error;
pub mod expression;
pub mod flow;
pub mod instance;
pub mod registry;
pub mod script;
pub mod services;
pub mod step;

pub use control::Signal;
pub use error::EngineError;
pub use expression::ExpressionEvaluator;
pub use flow::{Flow, FlowBuilder};
pub use instance::Instance;
pub use registry::WorkFlows;
pub use script::ScriptLimits;
pub use services::{
    Cache, DataSource, DriverFn, EventBus, FlowStore, HttpClient, InstanceStore,
    ResilienceHandle, ResilienceScheduler, RetrySpec, Services, ServicesBuilder,
};
pub use step::{Branch, Step, StepFn};

pub use flowline_types::{
    Consistency, ContextMap, FlowRecord, HostError, InstanceRecord, InstanceStatus, StepKind,
    StepRecord, StepSpec, StoreError,
};
