use super::{scoped_key, WorkflowStore};
use crate::tenant::TenantId;
use crate::types::{Workflow, WorkflowId, WorkflowState};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::RwLock;

/// Workflow store kept in memory
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<String, Workflow>>,
    states: RwLock<HashMap<String, WorkflowState>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    fn put_workflow(&self, tenant: Option<&TenantId>, workflow: &Workflow) -> Result<()> {
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scoped_key(tenant, &workflow.id), workflow.clone());
        Ok(())
    }

    fn get_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&scoped_key(tenant, id))
            .cloned())
    }

    fn delete_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<bool> {
        Ok(self
            .workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&scoped_key(tenant, id))
            .is_some())
    }

    fn count_workflows(&self) -> Result<usize> {
        Ok(self.workflows.read().unwrap_or_else(|e| e.into_inner()).len())
    }

    fn put_state(&self, tenant: Option<&TenantId>, state: &WorkflowState) -> Result<()> {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scoped_key(tenant, &state.workflow_id), state.clone());
        Ok(())
    }

    fn get_state(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<Option<WorkflowState>> {
        Ok(self
            .states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&scoped_key(tenant, id))
            .cloned())
    }

    fn delete_state(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<bool> {
        Ok(self
            .states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&scoped_key(tenant, id))
            .is_some())
    }
}
