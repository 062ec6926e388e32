//! Error taxonomy for validation, admission, and step execution.

use crate::tenant::TenantId;
use crate::types::{NodeId, WorkflowDirection, WorkflowId};
use serde::{Deserialize, Serialize};

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Structural problems found in a template before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("template has {count} steps, the maximum is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("edge {from} -> {to} references unknown node {missing}")]
    DanglingEdge {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },

    #[error("duplicate edge {from} -> {to}")]
    DuplicateEdge { from: NodeId, to: NodeId },

    #[error("node {node} has unknown step type '{step_type}'")]
    UnknownStepType { node: NodeId, step_type: String },

    #[error("node {node} is missing input '{input}': {reason}")]
    MissingInput {
        node: NodeId,
        input: String,
        reason: String,
    },

    #[error("node {node} sets input '{input}' both as a literal and from a previous node")]
    ConflictingInput { node: NodeId, input: String },

    #[error("workflow graph contains a cycle through {0:?}")]
    CyclicGraph(Vec<NodeId>),
}

/// Outcome classification reported by a step capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Eligible for retry, e.g. a remote resource that is not yet consistent.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Never retried, e.g. invalid configuration.
    #[error("terminal failure: {0}")]
    Terminal(String),
}

impl StepError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Why a node ended FAILED. Stored on the node in the workflow state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeFailure {
    #[error("{message}")]
    Terminal { message: String },

    #[error("retries exhausted after {attempts} attempts in {elapsed_ms}ms: {last_error}")]
    Timeout {
        attempts: u32,
        elapsed_ms: u64,
        last_error: String,
    },

    #[error("input '{input}' could not be bound from {source_node}.{output}")]
    MissingInput {
        input: String,
        source_node: NodeId,
        output: String,
    },

    #[error("predecessor {node} failed")]
    UpstreamFailed { node: NodeId },

    #[error("workflow deadline exceeded before the step started")]
    DeadlineExceeded,

    #[error("workflow was cancelled before the step started")]
    Cancelled,

    #[error("step panicked: {message}")]
    Panicked { message: String },
}

/// Caller-facing errors of the workflow service.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow orchestration is disabled")]
    Disabled,

    #[error("invalid template: {0}")]
    Validation(#[from] ValidationError),

    #[error(
        "tenant {tenant} already has {active} active {direction} workflows (maximum {max})"
    )]
    AdmissionRejected {
        tenant: TenantId,
        direction: WorkflowDirection,
        active: usize,
        max: usize,
    },

    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),

    #[error("maximum of {max} workflows reached")]
    LimitExceeded { max: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts() {
        let err: WorkflowError = ValidationError::DuplicateNode(NodeId::new("a")).into();
        assert!(matches!(err, WorkflowError::Validation(ValidationError::DuplicateNode(_))));
        assert!(err.to_string().contains("duplicate node id: a"));
    }

    #[test]
    fn test_node_failure_serializes_with_kind() {
        let failure = NodeFailure::UpstreamFailed {
            node: NodeId::new("a"),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "upstream_failed");
        assert_eq!(json["node"], "a");
    }
}
