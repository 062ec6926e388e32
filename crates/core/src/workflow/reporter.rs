use super::registry::ResourceSpec;
use crate::error::NodeFailure;
use crate::events::{Event, EventLog, EventType};
use crate::storage::WorkflowStore;
use crate::types::{
    NodeId, NodeState, NodeStatus, ProvisioningStatus, ResourceCreated, StepOutputs,
    WorkflowDirection, WorkflowId, WorkflowState,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Owns the state of one workflow execution and persists every change.
///
/// Node transitions only move forward: a node that already reached a
/// terminal status keeps it.
pub struct StateReporter {
    store: Arc<dyn WorkflowStore>,
    event_log: Arc<dyn EventLog>,
    state: Mutex<WorkflowState>,
}

impl StateReporter {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        event_log: Arc<dyn EventLog>,
        state: WorkflowState,
    ) -> Self {
        Self {
            store,
            event_log,
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> WorkflowState {
        self.state.lock().await.clone()
    }

    /// Mark the execution as running and reset the given nodes to PENDING
    pub async fn begin<I>(&self, direction: WorkflowDirection, nodes: I)
    where
        I: IntoIterator<Item = (NodeId, String)>,
    {
        self.update(|state| {
            state.status = match direction {
                WorkflowDirection::Provision => ProvisioningStatus::Provisioning,
                WorkflowDirection::Deprovision => ProvisioningStatus::Deprovisioning,
            };
            state.error = None;
            if direction == WorkflowDirection::Provision {
                state.provision_start_time = Some(Utc::now());
                state.provision_end_time = None;
            }
            for (id, step_type) in nodes {
                state.nodes.insert(id, NodeState::pending(step_type));
            }
        })
        .await;
    }

    pub async fn node_started(&self, id: &NodeId) {
        self.transition(id, NodeStatus::InProgress, |node| {
            node.started_at = Some(Utc::now());
        })
        .await;
    }

    /// Record outputs, and the created resource when the step declares one
    pub async fn node_completed(
        &self,
        id: &NodeId,
        outputs: StepOutputs,
        attempts: u32,
        resource: Option<&ResourceSpec>,
    ) {
        let created = {
            let mut state = self.state.lock().await;
            let Some(node) = state.nodes.get_mut(id) else {
                tracing::warn!("Ignoring completion of unknown node {}", id);
                return;
            };
            if !node.status.can_transition_to(NodeStatus::Completed) {
                tracing::warn!("Node {} is already {:?}", id, node.status);
                return;
            }

            let created = resource.and_then(|spec| {
                let resource_id = outputs.get(&spec.output)?.as_str()?.to_string();
                Some(ResourceCreated {
                    node_id: id.clone(),
                    step_type: node.step_type.clone(),
                    resource_type: spec.resource_type.clone(),
                    resource_id,
                })
            });

            node.status = NodeStatus::Completed;
            node.attempts = attempts;
            node.completed_at = Some(Utc::now());
            node.outputs = Some(outputs);

            if let Some(resource) = &created {
                state.resources_created.retain(|r| {
                    !(r.node_id == resource.node_id && r.resource_type == resource.resource_type)
                });
                state.resources_created.push(resource.clone());
            }
            self.persist(&mut state);
            created
        };

        if let Some(resource) = created {
            let workflow_id = self.state.lock().await.workflow_id.clone();
            tracing::info!(
                "Node {} created {} {}",
                id,
                resource.resource_type,
                resource.resource_id
            );
            self.emit(
                workflow_id,
                EventType::ResourceCreated {
                    node_id: resource.node_id,
                    resource_type: resource.resource_type,
                    resource_id: resource.resource_id,
                },
            )
            .await;
        }
    }

    pub async fn node_failed(&self, id: &NodeId, failure: NodeFailure, attempts: u32) {
        self.transition(id, NodeStatus::Failed, move |node| {
            node.attempts = attempts;
            node.completed_at = Some(Utc::now());
            node.failure = Some(failure);
        })
        .await;
    }

    /// Set the overall outcome of the execution
    pub async fn finish(&self, status: ProvisioningStatus, error: Option<String>) {
        self.update(|state| {
            state.status = status;
            state.error = error;
            if status == ProvisioningStatus::Completed || status == ProvisioningStatus::Failed {
                state.provision_end_time = Some(Utc::now());
            }
        })
        .await;
    }

    /// Apply an arbitrary change and persist it
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut WorkflowState),
    {
        let mut state = self.state.lock().await;
        f(&mut state);
        self.persist(&mut state);
    }

    async fn transition<F>(&self, id: &NodeId, next: NodeStatus, f: F)
    where
        F: FnOnce(&mut NodeState),
    {
        let mut state = self.state.lock().await;
        let Some(node) = state.nodes.get_mut(id) else {
            tracing::warn!("Ignoring {:?} for unknown node {}", next, id);
            return;
        };
        if !node.status.can_transition_to(next) {
            tracing::warn!(
                "Rejected transition of node {} from {:?} to {:?}",
                id,
                node.status,
                next
            );
            return;
        }
        node.status = next;
        f(node);
        self.persist(&mut state);
    }

    fn persist(&self, state: &mut WorkflowState) {
        state.updated_at = Utc::now();
        let tenant = state.tenant_id.clone();
        if let Err(e) = self.store.put_state(tenant.as_ref(), state) {
            tracing::error!(
                "Failed to persist state of workflow {}: {:#}",
                state.workflow_id,
                e
            );
        }
    }

    async fn emit(&self, workflow_id: WorkflowId, event_type: EventType) {
        if let Err(e) = self
            .event_log
            .append(Event::new(workflow_id.clone(), event_type))
            .await
        {
            tracing::error!("Failed to append event for workflow {}: {}", workflow_id, e);
        }
    }
}
