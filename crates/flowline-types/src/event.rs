//! Event channel names published by the engine.
//!
//! Payloads are the serialized views of the entity the event concerns,
//! except `WORKFLOW_ERROR` which carries `{"message": "..."}`.

/// A flow template was created or reconfigured.
pub const FLOW_SET: &str = "flow-set";

/// A flow template was deleted.
pub const FLOW_DELETE: &str = "flow-delete";

/// An instance changed state (status transition or persistence).
pub const WORKFLOW_SET: &str = "workflow-set";

/// An instance was deleted.
pub const WORKFLOW_DELETE: &str = "workflow-delete";

/// An engine-level failure: storage hooks, collaborator errors, script
/// file reads. Does not by itself abort an instance.
pub const WORKFLOW_ERROR: &str = "workflow-error";

/// Build the payload published on [`WORKFLOW_ERROR`].
pub fn error_payload(message: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "message": message.to_string() })
}
