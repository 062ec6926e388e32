use crate::error::NodeFailure;
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Literal or bound inputs handed to a step, keyed by input name
pub type StepInputs = BTreeMap<String, serde_json::Value>;

/// Named outputs produced by a completed step
pub type StepOutputs = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a stored workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random workflow ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node, unique within one template.
///
/// Ordering is lexical and drives the deterministic layering of the
/// execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User-submitted workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            tenant_id: None,
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, source: impl Into<String>, dest: impl Into<String>) -> Self {
        self.edges.push(WorkflowEdge::new(source, dest));
        self
    }

    pub fn node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

/// A declared step instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub user_inputs: StepInputs,
    /// Destination input name -> predecessor output
    #[serde(default)]
    pub previous_node_inputs: BTreeMap<String, InputBinding>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            step_type: step_type.into(),
            user_inputs: StepInputs::new(),
            previous_node_inputs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.user_inputs.insert(name.into(), value);
        self
    }

    pub fn with_binding(
        mut self,
        input: impl Into<String>,
        node: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.previous_node_inputs.insert(
            input.into(),
            InputBinding {
                node: NodeId::new(node),
                output: output.into(),
            },
        );
        self
    }
}

/// Reference to a named output of another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputBinding {
    pub node: NodeId,
    pub output: String,
}

/// Declared dependency between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: NodeId,
    pub dest: NodeId,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: NodeId::new(source),
            dest: NodeId::new(dest),
        }
    }
}

/// The two workflow directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowDirection {
    Provision,
    Deprovision,
}

impl std::fmt::Display for WorkflowDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Deprovision => write!(f, "deprovision"),
        }
    }
}

/// Overall status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    NotStarted,
    Provisioning,
    Completed,
    Failed,
    Deprovisioning,
}

impl ProvisioningStatus {
    /// Whether an execution is currently in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Deprovisioning)
    }
}

/// Status of a single node within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the forward-only lifecycle
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Recorded state of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub step_type: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<StepOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
}

impl NodeState {
    pub fn pending(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            outputs: None,
            failure: None,
        }
    }
}

/// A remote resource created by a provisioning step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCreated {
    pub node_id: NodeId,
    pub step_type: String,
    pub resource_type: String,
    pub resource_id: String,
}

/// Persisted status of a workflow and its nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub status: ProvisioningStatus,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeState>,
    #[serde(default)]
    pub resources_created: Vec<ResourceCreated>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub provision_start_time: Option<DateTime<Utc>>,
    pub provision_end_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_id: WorkflowId, tenant_id: Option<TenantId>) -> Self {
        Self {
            workflow_id,
            tenant_id,
            status: ProvisioningStatus::NotStarted,
            nodes: BTreeMap::new(),
            resources_created: Vec::new(),
            error: None,
            provision_start_time: None,
            provision_end_time: None,
            updated_at: Utc::now(),
        }
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Failed overall, but at least one node completed
    pub fn is_partial_success(&self) -> bool {
        self.status == ProvisioningStatus::Failed
            && self.nodes.values().any(|n| n.status == NodeStatus::Completed)
    }

    /// Outputs of every completed node
    pub fn completed_outputs(&self) -> BTreeMap<NodeId, StepOutputs> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Completed)
            .map(|(id, n)| (id.clone(), n.outputs.clone().unwrap_or_default()))
            .collect()
    }
}

/// A stored workflow: its template plus bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub template: Template,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_provisioned_at: Option<DateTime<Utc>>,
}
