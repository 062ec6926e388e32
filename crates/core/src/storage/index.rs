use super::{scoped_key, WorkflowStore};
use crate::tenant::TenantId;
use crate::types::{Workflow, WorkflowId, WorkflowState};
use anyhow::{Context, Result};
use redb::{Database, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const WORKFLOWS_TABLE: JsonTable = TableDefinition::new("workflows");
const STATES_TABLE: JsonTable = TableDefinition::new("workflow_states");

/// Workflow store backed by redb
#[derive(Clone)]
pub struct RedbWorkflowStore {
    db: Arc<Database>,
}

impl RedbWorkflowStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _workflows_table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            let _states_table = write_txn
                .open_table(STATES_TABLE)
                .context("Failed to open workflow states table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(
        &self,
        table_def: JsonTable,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let value = serde_json::to_vec(value).context("Failed to serialize record")?;
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(table_def)
                .context("Failed to open table")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table_def).context("Failed to open table")?;

        match table.get(key).context("Failed to get record")? {
            Some(guard) => {
                let record =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn remove(&self, table_def: JsonTable, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(table_def)
                .context("Failed to open table")?;
            let removed = table.remove(key).context("Failed to remove record")?;
            removed.is_some()
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }
}

impl WorkflowStore for RedbWorkflowStore {
    fn put_workflow(&self, tenant: Option<&TenantId>, workflow: &Workflow) -> Result<()> {
        self.put(WORKFLOWS_TABLE, &scoped_key(tenant, &workflow.id), workflow)
    }

    fn get_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<Option<Workflow>> {
        self.get(WORKFLOWS_TABLE, &scoped_key(tenant, id))
    }

    fn delete_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<bool> {
        self.remove(WORKFLOWS_TABLE, &scoped_key(tenant, id))
    }

    fn count_workflows(&self) -> Result<usize> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("Failed to open table")?;
        let len = table.len().context("Failed to count workflows")?;
        Ok(len as usize)
    }

    fn put_state(&self, tenant: Option<&TenantId>, state: &WorkflowState) -> Result<()> {
        self.put(STATES_TABLE, &scoped_key(tenant, &state.workflow_id), state)
    }

    fn get_state(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<Option<WorkflowState>> {
        self.get(STATES_TABLE, &scoped_key(tenant, id))
    }

    fn delete_state(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> Result<bool> {
        self.remove(STATES_TABLE, &scoped_key(tenant, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, NodeState, NodeStatus, ProvisioningStatus, Template};
    use tempfile::TempDir;

    #[test]
    fn test_redb_workflow_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbWorkflowStore::new(temp_dir.path().join("index.redb")).unwrap();
        let tenant = TenantId::new("acme");

        let workflow = Workflow {
            id: WorkflowId::generate(),
            template: Template::new("stored"),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            last_provisioned_at: None,
        };
        store.put_workflow(Some(&tenant), &workflow).unwrap();

        let retrieved = store
            .get_workflow(Some(&tenant), &workflow.id)
            .unwrap()
            .unwrap();
        assert_eq!(retrieved, workflow);
        assert!(store.get_workflow(None, &workflow.id).unwrap().is_none());
        assert_eq!(store.count_workflows().unwrap(), 1);

        let mut state = WorkflowState::new(workflow.id.clone(), Some(tenant.clone()));
        state.status = ProvisioningStatus::Completed;
        let mut node = NodeState::pending("noop");
        node.status = NodeStatus::Completed;
        state.nodes.insert(NodeId::new("a"), node);
        store.put_state(Some(&tenant), &state).unwrap();

        let loaded = store.get_state(Some(&tenant), &workflow.id).unwrap().unwrap();
        assert_eq!(loaded.status, ProvisioningStatus::Completed);
        assert_eq!(loaded.nodes[&NodeId::new("a")].status, NodeStatus::Completed);

        assert!(store.delete_state(Some(&tenant), &workflow.id).unwrap());
        assert!(store.delete_workflow(Some(&tenant), &workflow.id).unwrap());
        assert_eq!(store.count_workflows().unwrap(), 0);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.redb");
        let id = WorkflowId::new("persisted");
        {
            let store = RedbWorkflowStore::new(path.clone()).unwrap();
            store
                .put_state(None, &WorkflowState::new(id.clone(), None))
                .unwrap();
        }
        let store = RedbWorkflowStore::new(path).unwrap();
        assert!(store.get_state(None, &id).unwrap().is_some());
    }
}
