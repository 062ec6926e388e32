use super::dag::{ExecutionPlan, WorkflowDag};
use super::registry::StepRegistry;
use crate::error::ValidationError;
use crate::settings::EngineSettings;
use crate::types::{NodeId, Template};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Rejects structurally invalid templates before anything executes.
///
/// Checks run in a fixed order and stop at the first failure.
pub struct GraphValidator {
    registry: Arc<StepRegistry>,
    max_steps: usize,
}

/// Output of a successful validation
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    pub dag: WorkflowDag,
    pub plan: ExecutionPlan,
}

impl GraphValidator {
    pub fn new(registry: Arc<StepRegistry>, settings: &EngineSettings) -> Self {
        Self {
            registry,
            max_steps: settings.max_workflow_steps,
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Validate and build the graph. Side-effect free.
    pub fn validate(&self, template: &Template) -> Result<WorkflowDag, ValidationError> {
        self.check_step_count(template)?;
        self.check_duplicate_nodes(template)?;
        self.check_edge_endpoints(template)?;
        self.check_duplicate_edges(template)?;
        self.check_step_types(template)?;
        self.check_inputs(template)?;

        let dag = WorkflowDag::build(template);
        if let Some(cycle) = dag.find_cycle() {
            return Err(ValidationError::CyclicGraph(cycle));
        }
        Ok(dag)
    }

    /// Validate, then sort into an execution plan
    pub fn plan(&self, template: &Template) -> Result<ValidatedWorkflow, ValidationError> {
        let dag = self.validate(template)?;
        let plan = dag.execution_plan()?;
        Ok(ValidatedWorkflow { dag, plan })
    }

    fn check_step_count(&self, template: &Template) -> Result<(), ValidationError> {
        if template.nodes.len() > self.max_steps {
            return Err(ValidationError::TooManySteps {
                count: template.nodes.len(),
                max: self.max_steps,
            });
        }
        Ok(())
    }

    fn check_duplicate_nodes(&self, template: &Template) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for node in &template.nodes {
            if !seen.insert(&node.id) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
        }
        Ok(())
    }

    fn check_edge_endpoints(&self, template: &Template) -> Result<(), ValidationError> {
        let ids: HashSet<&NodeId> = template.nodes.iter().map(|n| &n.id).collect();
        for edge in &template.edges {
            for endpoint in [&edge.source, &edge.dest] {
                if !ids.contains(endpoint) {
                    return Err(ValidationError::DanglingEdge {
                        from: edge.source.clone(),
                        to: edge.dest.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_duplicate_edges(&self, template: &Template) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for edge in &template.edges {
            if !seen.insert((&edge.source, &edge.dest)) {
                return Err(ValidationError::DuplicateEdge {
                    from: edge.source.clone(),
                    to: edge.dest.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_step_types(&self, template: &Template) -> Result<(), ValidationError> {
        for node in &template.nodes {
            if !self.registry.contains(&node.step_type) {
                return Err(ValidationError::UnknownStepType {
                    node: node.id.clone(),
                    step_type: node.step_type.clone(),
                });
            }
        }
        Ok(())
    }

    /// Every required input must come from a literal or from an existing
    /// output of an existing node, never from both.
    fn check_inputs(&self, template: &Template) -> Result<(), ValidationError> {
        let types: HashMap<&NodeId, &str> = template
            .nodes
            .iter()
            .map(|n| (&n.id, n.step_type.as_str()))
            .collect();

        for node in &template.nodes {
            for (input, binding) in &node.previous_node_inputs {
                if node.user_inputs.contains_key(input) {
                    return Err(ValidationError::ConflictingInput {
                        node: node.id.clone(),
                        input: input.clone(),
                    });
                }

                let missing = |reason: String| ValidationError::MissingInput {
                    node: node.id.clone(),
                    input: input.clone(),
                    reason,
                };

                let source_type = types
                    .get(&binding.node)
                    .ok_or_else(|| missing(format!("source node {} does not exist", binding.node)))?;
                let produces = self
                    .registry
                    .get(source_type)
                    .map(|d| d.has_output(&binding.output))
                    .unwrap_or(false);
                if !produces {
                    return Err(missing(format!(
                        "{} ({}) has no output '{}'",
                        binding.node, source_type, binding.output
                    )));
                }
            }

            let Some(descriptor) = self.registry.get(&node.step_type) else {
                continue;
            };
            for required in &descriptor.required_inputs {
                if !node.user_inputs.contains_key(required)
                    && !node.previous_node_inputs.contains_key(required)
                {
                    return Err(ValidationError::MissingInput {
                        node: node.id.clone(),
                        input: required.clone(),
                        reason: "not provided".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowNode;
    use crate::workflow::remote::SimulatedRemoteClient;
    use serde_json::json;

    fn validator(max_steps: usize) -> GraphValidator {
        let registry = Arc::new(StepRegistry::with_builtin_steps(Arc::new(
            SimulatedRemoteClient::new(),
        )));
        let settings = EngineSettings {
            max_workflow_steps: max_steps,
            ..Default::default()
        };
        GraphValidator::new(registry, &settings)
    }

    fn connector(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, "create_connector")
            .with_input("name", json!("openai"))
            .with_input("protocol", json!("http"))
    }

    fn model(id: &str, from: &str) -> WorkflowNode {
        WorkflowNode::new(id, "register_remote_model")
            .with_input("name", json!("embedder"))
            .with_binding("connector_id", from, "connector_id")
    }

    #[test]
    fn test_valid_template() {
        let template = Template::new("ok")
            .with_node(connector("c"))
            .with_node(model("m", "c"))
            .with_edge("c", "m");
        let validated = validator(10).plan(&template).unwrap();
        assert_eq!(validated.plan.layers().len(), 2);
    }

    #[test]
    fn test_too_many_steps() {
        let template = Template::new("big")
            .with_node(WorkflowNode::new("a", "noop"))
            .with_node(WorkflowNode::new("b", "noop"));
        assert_eq!(
            validator(1).validate(&template).unwrap_err(),
            ValidationError::TooManySteps { count: 2, max: 1 }
        );
    }

    #[test]
    fn test_duplicate_node() {
        let template = Template::new("dup")
            .with_node(WorkflowNode::new("a", "noop"))
            .with_node(WorkflowNode::new("a", "noop"));
        assert_eq!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::DuplicateNode(NodeId::new("a"))
        );
    }

    #[test]
    fn test_dangling_edge() {
        let template = Template::new("dangling")
            .with_node(WorkflowNode::new("a", "noop"))
            .with_edge("a", "ghost");
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::DanglingEdge { missing, .. } if missing == NodeId::new("ghost")
        ));
    }

    #[test]
    fn test_duplicate_edge() {
        let template = Template::new("dup-edge")
            .with_node(WorkflowNode::new("a", "noop"))
            .with_node(WorkflowNode::new("b", "noop"))
            .with_edge("a", "b")
            .with_edge("a", "b");
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::DuplicateEdge { .. }
        ));
    }

    #[test]
    fn test_unknown_step_type() {
        let template = Template::new("unknown").with_node(WorkflowNode::new("a", "teleport"));
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::UnknownStepType { step_type, .. } if step_type == "teleport"
        ));
    }

    #[test]
    fn test_missing_required_input() {
        let template = Template::new("missing").with_node(
            WorkflowNode::new("c", "create_connector").with_input("name", json!("x")),
        );
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::MissingInput { input, .. } if input == "protocol"
        ));
    }

    #[test]
    fn test_binding_to_unknown_output() {
        let template = Template::new("bad-output")
            .with_node(connector("c"))
            .with_node(
                WorkflowNode::new("m", "register_remote_model")
                    .with_input("name", json!("m"))
                    .with_binding("connector_id", "c", "model_id"),
            );
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::MissingInput { input, .. } if input == "connector_id"
        ));
    }

    #[test]
    fn test_binding_to_missing_node() {
        let template = Template::new("bad-source").with_node(model("m", "nowhere"));
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::MissingInput { reason, .. } if reason.contains("nowhere")
        ));
    }

    #[test]
    fn test_literal_and_binding_conflict() {
        let template = Template::new("conflict")
            .with_node(connector("c"))
            .with_node(model("m", "c").with_input("connector_id", json!("literal")));
        assert_eq!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::ConflictingInput {
                node: NodeId::new("m"),
                input: "connector_id".to_string(),
            }
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let template = Template::new("cycle")
            .with_node(WorkflowNode::new("a", "noop"))
            .with_node(WorkflowNode::new("b", "noop"))
            .with_edge("a", "b")
            .with_edge("b", "a");
        assert_eq!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::CyclicGraph(vec![NodeId::new("a"), NodeId::new("b")])
        );
    }

    #[test]
    fn test_cycle_through_binding_rejected() {
        let template = Template::new("binding-cycle")
            .with_node(connector("c"))
            .with_node(model("m", "c"))
            .with_edge("m", "c");
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::CyclicGraph(_)
        ));
    }

    #[test]
    fn test_first_error_wins() {
        // Duplicate node is checked before the dangling edge.
        let template = Template::new("many-problems")
            .with_node(WorkflowNode::new("a", "noop"))
            .with_node(WorkflowNode::new("a", "noop"))
            .with_edge("a", "ghost");
        assert!(matches!(
            validator(10).validate(&template).unwrap_err(),
            ValidationError::DuplicateNode(_)
        ));
    }

    #[test]
    fn test_revalidation_yields_same_plan() {
        let template = Template::new("idempotent")
            .with_node(connector("c"))
            .with_node(model("m", "c"))
            .with_node(WorkflowNode::new("x", "noop"));
        let v = validator(10);
        let before = template.clone();
        let first = v.plan(&template).unwrap().plan;
        let second = v.plan(&template).unwrap().plan;
        assert_eq!(first, second);
        assert_eq!(template, before);
    }
}
