use crate::error::NodeFailure;
use crate::types::{NodeId, WorkflowDirection, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// An event in a workflow's lifecycle log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(workflow_id: WorkflowId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Workflow lifecycle events
    WorkflowStarted {
        direction: WorkflowDirection,
        node_count: usize,
    },
    WorkflowCompleted {
        direction: WorkflowDirection,
        duration_ms: u64,
    },
    WorkflowFailed {
        direction: WorkflowDirection,
        failed_nodes: Vec<NodeId>,
        duration_ms: u64,
    },
    WorkflowCancelled {
        reason: String,
    },

    // Step lifecycle events
    StepScheduled {
        node_id: NodeId,
        step_type: String,
        layer: usize,
    },
    StepStarted {
        node_id: NodeId,
        attempt: u32,
    },
    StepRetrying {
        node_id: NodeId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        node_id: NodeId,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        node_id: NodeId,
        failure: NodeFailure,
    },
    StepSkipped {
        node_id: NodeId,
        failure: NodeFailure,
    },

    // Resource events
    ResourceCreated {
        node_id: NodeId,
        resource_type: String,
        resource_id: String,
    },
}

impl EventType {
    /// Whether the event closes an execution of the workflow
    pub fn ends_execution(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. } | Self::WorkflowCancelled { .. }
        )
    }
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a workflow, oldest first
    async fn get_workflow_events(&self, workflow_id: &WorkflowId) -> anyhow::Result<Vec<Event>>;
}

/// Event log kept in memory
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<HashMap<WorkflowId, Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .write()
            .await
            .entry(event.workflow_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_workflow_events(&self, workflow_id: &WorkflowId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }
}
