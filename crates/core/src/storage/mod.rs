pub mod event_log;
pub mod index;
pub mod memory;

pub use event_log::JsonlEventLog;
pub use index::RedbWorkflowStore;
pub use memory::MemoryWorkflowStore;

use crate::tenant::TenantId;
use crate::types::{Workflow, WorkflowId, WorkflowState};
use anyhow::Result;

/// Persistence of workflows and their states.
///
/// Every call is scoped by tenant; `None` is the single implicit tenant.
pub trait WorkflowStore: Send + Sync {
    fn put_workflow(&self, tenant: Option<&TenantId>, workflow: &Workflow) -> Result<()>;

    fn get_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<Option<Workflow>>;

    /// Returns whether something was deleted
    fn delete_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<bool>;

    /// Number of stored workflows across all tenants
    fn count_workflows(&self) -> Result<usize>;

    fn put_state(&self, tenant: Option<&TenantId>, state: &WorkflowState) -> Result<()>;

    fn get_state(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<Option<WorkflowState>>;

    fn delete_state(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<bool>;
}

/// Storage key of a record.
///
/// The tenant is length-prefixed and the unscoped form starts with `-`, so no
/// (tenant, id) pair can spell the key of another pair.
pub(crate) fn scoped_key(tenant: Option<&TenantId>, id: &WorkflowId) -> String {
    match tenant {
        Some(tenant) => format!("{}:{}/{}", tenant.0.len(), tenant, id),
        None => format!("-/{}", id),
    }
}
