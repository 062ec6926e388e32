//! Steps that forward to an external service through an injected client.

use super::registry::{StepContext, WorkflowStep};
use crate::error::StepError;
use crate::types::{StepInputs, StepOutputs};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Opaque request/response client for remote lifecycle operations.
///
/// Implementations classify their own failures as transient or terminal.
/// The engine never manages the client's lifecycle, it only invokes it.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    async fn call(
        &self,
        operation: &str,
        params: &StepInputs,
    ) -> Result<serde_json::Value, StepError>;
}

/// Step kind whose only work is one remote call
pub struct RemoteActionStep {
    operation: String,
    client: Arc<dyn RemoteClient>,
}

impl RemoteActionStep {
    pub fn new(operation: impl Into<String>, client: Arc<dyn RemoteClient>) -> Self {
        Self {
            operation: operation.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl WorkflowStep for RemoteActionStep {
    async fn run(&self, ctx: &StepContext, inputs: StepInputs) -> Result<StepOutputs, StepError> {
        tracing::debug!(
            "Calling remote operation {} for node {} (attempt {})",
            self.operation,
            ctx.node_id,
            ctx.attempt
        );

        let response = self.client.call(&self.operation, &inputs).await?;
        match response {
            serde_json::Value::Object(fields) => Ok(fields.into_iter().collect()),
            other => Err(StepError::terminal(format!(
                "{} returned a non-object response: {}",
                self.operation, other
            ))),
        }
    }
}

/// In-process stand-in for the remote ML service.
///
/// Create operations mint ids, teardown operations forget them. A model
/// can only be deployed once it is registered. `with_pending_reads` makes
/// the first calls of an operation report a transient "not yet consistent"
/// failure, the way an eventually-consistent backend would.
#[derive(Default)]
pub struct SimulatedRemoteClient {
    resources: Mutex<HashMap<String, String>>,
    pending: Mutex<HashMap<String, u32>>,
}

impl SimulatedRemoteClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls of `operation` with a transient error
    pub fn with_pending_reads(self, operation: impl Into<String>, count: u32) -> Self {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation.into(), count);
        self
    }

    /// Ids of live resources of a type
    pub fn live(&self, resource_type: &str) -> Vec<String> {
        let resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = resources
            .iter()
            .filter(|(_, t)| t.as_str() == resource_type)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn create(&self, resource_type: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), resource_type.to_string());
        id
    }

    fn string_param<'a>(params: &'a StepInputs, name: &str) -> Result<&'a str, StepError> {
        params
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepError::terminal(format!("'{}' must be a string", name)))
    }
}

#[async_trait::async_trait]
impl RemoteClient for SimulatedRemoteClient {
    async fn call(
        &self,
        operation: &str,
        params: &StepInputs,
    ) -> Result<serde_json::Value, StepError> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(remaining) = pending.get_mut(operation) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StepError::transient(format!(
                        "{} not yet consistent",
                        operation
                    )));
                }
            }
        }

        match operation {
            "create_connector" => {
                Self::string_param(params, "name")?;
                Ok(serde_json::json!({ "connector_id": self.create("connector") }))
            }
            "register_remote_model" => {
                let connector = Self::string_param(params, "connector_id")?;
                if !self.live("connector").iter().any(|c| c == connector) {
                    return Err(StepError::terminal(format!(
                        "connector {} does not exist",
                        connector
                    )));
                }
                Ok(serde_json::json!({ "model_id": self.create("model") }))
            }
            "deploy_model" => {
                let model = Self::string_param(params, "model_id")?;
                if !self.live("model").iter().any(|m| m == model) {
                    return Err(StepError::terminal(format!("model {} does not exist", model)));
                }
                Ok(serde_json::json!({
                    "model_id": model,
                    "deploy_model_status": "COMPLETED",
                }))
            }
            "register_agent" => {
                Self::string_param(params, "name")?;
                Ok(serde_json::json!({ "agent_id": self.create("agent") }))
            }
            "delete_connector" | "delete_model" | "delete_agent" => {
                let key = match operation {
                    "delete_connector" => "connector_id",
                    "delete_model" => "model_id",
                    _ => "agent_id",
                };
                let id = Self::string_param(params, key)?;
                // Deleting something already gone counts as done.
                self.resources
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(id);
                Ok(serde_json::json!({ key: id }))
            }
            "undeploy_model" => {
                let model = Self::string_param(params, "model_id")?;
                Ok(serde_json::json!({ "model_id": model }))
            }
            other => Err(StepError::terminal(format!(
                "unsupported operation: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, WorkflowId};
    use serde_json::json;

    fn ctx() -> StepContext {
        StepContext {
            workflow_id: WorkflowId::new("wf"),
            node_id: NodeId::new("n"),
            tenant_id: None,
            attempt: 1,
        }
    }

    fn inputs(value: serde_json::Value) -> StepInputs {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_connector_model_lifecycle() {
        let client = Arc::new(SimulatedRemoteClient::new());
        let connector = RemoteActionStep::new("create_connector", client.clone());
        let out = connector
            .run(&ctx(), inputs(json!({ "name": "c", "protocol": "http" })))
            .await
            .unwrap();
        let connector_id = out["connector_id"].as_str().unwrap().to_string();

        let model = RemoteActionStep::new("register_remote_model", client.clone());
        let out = model
            .run(&ctx(), inputs(json!({ "name": "m", "connector_id": connector_id })))
            .await
            .unwrap();
        assert!(out.contains_key("model_id"));
        assert_eq!(client.live("model").len(), 1);

        let delete = RemoteActionStep::new("delete_connector", client.clone());
        delete
            .run(&ctx(), inputs(json!({ "connector_id": connector_id })))
            .await
            .unwrap();
        assert!(client.live("connector").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_connector_is_terminal() {
        let client = Arc::new(SimulatedRemoteClient::new());
        let model = RemoteActionStep::new("register_remote_model", client);
        let err = model
            .run(&ctx(), inputs(json!({ "name": "m", "connector_id": "missing" })))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_pending_reads_are_transient() {
        let client = SimulatedRemoteClient::new().with_pending_reads("create_connector", 1);
        let params = inputs(json!({ "name": "c", "protocol": "http" }));
        assert!(client
            .call("create_connector", &params)
            .await
            .unwrap_err()
            .is_transient());
        assert!(client.call("create_connector", &params).await.is_ok());
    }
}
