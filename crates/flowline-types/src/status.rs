//! Status and mode enums shared by the flow template and instance driver.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance.
///
/// `Done` and `Failed` are terminal for the driver; a failed instance may
/// still be re-driven by the resilience scheduler until its attempts are
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Done => "done",
            InstanceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rollback abort semantics for a flow.
///
/// Under `Strong` consistency the first compensation error aborts the
/// sweep; under `Eventual` every compensable step runs and errors are
/// recorded per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Strong,
    #[default]
    Eventual,
}

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A native callable registered in-process. Never serialized.
    Function,
    /// A user-authored script interpreted by the embedded runtime.
    Script,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_status_serializes_snake_case() {
        for (status, expected) in [
            (InstanceStatus::Pending, "\"pending\""),
            (InstanceStatus::Running, "\"running\""),
            (InstanceStatus::Done, "\"done\""),
            (InstanceStatus::Failed, "\"failed\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), expected);
            let parsed: InstanceStatus = serde_json::from_str(expected).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn instance_status_display_matches_serde() {
        assert_eq!(InstanceStatus::Pending.to_string(), "pending");
        assert_eq!(InstanceStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn consistency_defaults_to_eventual() {
        assert_eq!(Consistency::default(), Consistency::Eventual);
        assert_eq!(
            serde_json::to_string(&Consistency::Strong).unwrap(),
            "\"strong\""
        );
    }

    #[test]
    fn step_kind_serde_roundtrip() {
        for kind in [StepKind::Function, StepKind::Script] {
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: StepKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
