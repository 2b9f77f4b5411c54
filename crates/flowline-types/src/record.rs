//! Persisted record layouts for flows, instances, steps and results.
//!
//! These are the shapes handed to the storage hooks and emitted on the
//! event bus. Native callables and script runtime handles never appear
//! here; a flow record restored from storage can only rebuild script
//! steps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{Consistency, InstanceStatus, StepKind};
use crate::ContextMap;

// ---------------------------------------------------------------------------
// StepRecord
// ---------------------------------------------------------------------------

/// Outcome of one step execution (or one compensation invocation).
///
/// Written to `results[step]` on every execution, overwriting on retry,
/// and to `rollbacks[step]` for every compensation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Index of the step this record belongs to.
    pub step: usize,
    /// Context captured when the record was written: the cumulative merged
    /// context for results, the entry snapshot for rollbacks.
    pub ctx: ContextMap,
    /// Attempt number reported by the resilience handle (0 before the
    /// scheduler has re-driven the instance).
    pub attempt: u32,
    /// The value produced by the step body or compensation callable.
    pub result: ContextMap,
    /// Error message when the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

/// The persistable part of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub stop: bool,
    /// Branch expression; empty when the step has no branch.
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub yes_go_to: usize,
    #[serde(default)]
    pub no_go_to: usize,
    /// Script source for script steps; empty for native steps.
    #[serde(default)]
    pub definition: String,
}

// ---------------------------------------------------------------------------
// FlowRecord
// ---------------------------------------------------------------------------

/// Persisted view of a flow template.
///
/// Durations are expressed in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub tag: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub total_attempts: u32,
    /// Spacing between resilience attempts, in seconds.
    pub time_attempts: u64,
    /// How long the resilience scheduler retains the instance, in seconds.
    pub retention_time: u64,
    pub steps: Vec<StepSpec>,
    pub tp_consistency: Consistency,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub level: String,
    pub created_by: String,
}

// ---------------------------------------------------------------------------
// InstanceRecord
// ---------------------------------------------------------------------------

/// Persisted view of a workflow instance.
///
/// The user-facing serialized view additionally merges `tags` into the
/// top level; that merge is performed by the engine, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tag: String,
    pub id: String,
    pub created_by: String,
    pub updated_by: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    pub current: usize,
    pub ctx: ContextMap,
    /// Per-step context snapshots captured at entry to each step.
    pub ctxs: BTreeMap<usize, ContextMap>,
    pub pinned_data: ContextMap,
    pub results: BTreeMap<usize, StepRecord>,
    pub tags: ContextMap,
    pub rollbacks: BTreeMap<usize, StepRecord>,
    pub worker_host: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
