//! Shared domain types for the flowline workflow engine.
//!
//! Everything serializable crosses crate boundaries through here: instance
//! and flow statuses, the persisted record layouts, per-step result records,
//! event channel names, and the error types raised by storage and host
//! collaborators. The engine itself lives in `flowline-core`; concrete
//! collaborator implementations live in `flowline-infra`.

pub mod error;
pub mod event;
pub mod record;
pub mod status;

pub use error::{HostError, StoreError};
pub use record::{FlowRecord, InstanceRecord, StepRecord, StepSpec};
pub use status::{Consistency, InstanceStatus, StepKind};

/// The mutable key/value context threaded through the steps of an instance.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;
