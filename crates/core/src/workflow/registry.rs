use super::remote::{RemoteActionStep, RemoteClient};
use crate::error::StepError;
use crate::tenant::TenantId;
use crate::types::{NodeId, StepInputs, StepOutputs, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Context handed to a step on every attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub tenant_id: Option<TenantId>,
    pub attempt: u32,
}

/// The executable capability behind a step type
#[async_trait::async_trait]
pub trait WorkflowStep: Send + Sync {
    /// Run once with fully bound inputs
    async fn run(&self, ctx: &StepContext, inputs: StepInputs) -> Result<StepOutputs, StepError>;
}

/// Remote resource a step creates, and how to tear it down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub resource_type: String,
    /// Output carrying the resource id
    pub output: String,
    /// Step type that deletes the resource
    pub teardown_step: String,
    /// Input of the teardown step receiving the resource id
    pub teardown_input: String,
}

impl ResourceSpec {
    pub fn new(
        resource_type: impl Into<String>,
        output: impl Into<String>,
        teardown_step: impl Into<String>,
        teardown_input: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            output: output.into(),
            teardown_step: teardown_step.into(),
            teardown_input: teardown_input.into(),
        }
    }
}

/// Registry entry for one step type
#[derive(Clone)]
pub struct StepDescriptor {
    pub step_type: String,
    pub required_inputs: Vec<String>,
    pub optional_inputs: BTreeMap<String, serde_json::Value>,
    pub outputs: Vec<String>,
    pub resource: Option<ResourceSpec>,
    pub step: Arc<dyn WorkflowStep>,
}

impl StepDescriptor {
    pub fn new(step_type: impl Into<String>, step: Arc<dyn WorkflowStep>) -> Self {
        Self {
            step_type: step_type.into(),
            required_inputs: Vec::new(),
            optional_inputs: BTreeMap::new(),
            outputs: Vec::new(),
            resource: None,
            step,
        }
    }

    pub fn required<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self, input: impl Into<String>, default: serde_json::Value) -> Self {
        self.optional_inputs.insert(input.into(), default);
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    pub fn creates_resource(mut self, resource: ResourceSpec) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn has_output(&self, output: &str) -> bool {
        self.outputs.iter().any(|o| o == output)
    }

    pub fn metadata(&self) -> StepMetadata {
        StepMetadata {
            step_type: self.step_type.clone(),
            required_inputs: self.required_inputs.clone(),
            optional_inputs: self.optional_inputs.clone(),
            outputs: self.outputs.clone(),
            resource: self.resource.clone(),
        }
    }
}

impl std::fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("step_type", &self.step_type)
            .field("required_inputs", &self.required_inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub step_type: String,
    pub required_inputs: Vec<String>,
    pub optional_inputs: BTreeMap<String, serde_json::Value>,
    pub outputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceSpec>,
}

/// Lookup table from step type to descriptor. Read-only once built.
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, StepDescriptor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop` and the remote-action kinds backed by `client`
    pub fn with_builtin_steps(client: Arc<dyn RemoteClient>) -> Self {
        let mut registry = Self::new();
        let remote = |operation: &str| -> Arc<dyn WorkflowStep> {
            Arc::new(RemoteActionStep::new(operation, client.clone()))
        };

        registry.register(StepDescriptor::new("noop", Arc::new(NoOpStep)));

        registry.register(
            StepDescriptor::new("create_connector", remote("create_connector"))
                .required(["name", "protocol"])
                .optional("description", json!(""))
                .optional("parameters", json!({}))
                .outputs(["connector_id"])
                .creates_resource(ResourceSpec::new(
                    "connector",
                    "connector_id",
                    "delete_connector",
                    "connector_id",
                )),
        );
        registry.register(
            StepDescriptor::new("register_remote_model", remote("register_remote_model"))
                .required(["name", "connector_id"])
                .optional("description", json!(""))
                .outputs(["model_id"])
                .creates_resource(ResourceSpec::new(
                    "model",
                    "model_id",
                    "delete_model",
                    "model_id",
                )),
        );
        registry.register(
            StepDescriptor::new("deploy_model", remote("deploy_model"))
                .required(["model_id"])
                .outputs(["model_id", "deploy_model_status"])
                .creates_resource(ResourceSpec::new(
                    "deployed_model",
                    "model_id",
                    "undeploy_model",
                    "model_id",
                )),
        );
        registry.register(
            StepDescriptor::new("register_agent", remote("register_agent"))
                .required(["name"])
                .optional("llm", json!(null))
                .optional("type", json!("conversational"))
                .outputs(["agent_id"])
                .creates_resource(ResourceSpec::new(
                    "agent",
                    "agent_id",
                    "delete_agent",
                    "agent_id",
                )),
        );

        for (teardown, input) in [
            ("delete_connector", "connector_id"),
            ("delete_model", "model_id"),
            ("undeploy_model", "model_id"),
            ("delete_agent", "agent_id"),
        ] {
            registry.register(
                StepDescriptor::new(teardown, remote(teardown))
                    .required([input])
                    .outputs([input]),
            );
        }

        registry
    }

    /// Add or replace a step type
    pub fn register(&mut self, descriptor: StepDescriptor) {
        self.steps.insert(descriptor.step_type.clone(), descriptor);
    }

    pub fn get(&self, step_type: &str) -> Option<&StepDescriptor> {
        self.steps.get(step_type)
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    /// All registered step types, sorted by name
    pub fn list(&self) -> Vec<StepMetadata> {
        let mut steps: Vec<_> = self.steps.values().map(|d| d.metadata()).collect();
        steps.sort_by(|a, b| a.step_type.cmp(&b.step_type));
        steps
    }
}

/// Step that does nothing. Useful for pure ordering nodes.
pub struct NoOpStep;

#[async_trait::async_trait]
impl WorkflowStep for NoOpStep {
    async fn run(&self, _ctx: &StepContext, _inputs: StepInputs) -> Result<StepOutputs, StepError> {
        Ok(StepOutputs::new())
    }
}
