//! Derived templates for deprovisioning and reprovisioning.

use super::dag::WorkflowDag;
use super::registry::StepRegistry;
use crate::error::{WorkflowError, WorkflowResult};
use crate::types::{
    NodeId, NodeStatus, ResourceCreated, Template, WorkflowEdge, WorkflowNode, WorkflowState,
};
use std::collections::{BTreeMap, BTreeSet};

/// Teardown template plus the resource each of its nodes deletes
#[derive(Debug, Clone)]
pub struct Teardown {
    pub template: Template,
    pub resources: BTreeMap<NodeId, ResourceCreated>,
}

/// Build the template that deletes every recorded resource.
///
/// A resource is deleted before any resource it was derived from: when the
/// node that created `a` is an ancestor of the node that created `b` in the
/// provisioning graph, `b`'s teardown precedes `a`'s.
pub fn teardown_template(
    name: &str,
    registry: &StepRegistry,
    provisioned: &WorkflowDag,
    resources: &[ResourceCreated],
) -> WorkflowResult<Teardown> {
    let mut template = Template::new(format!("{} (deprovision)", name));
    let mut nodes: Vec<(NodeId, &ResourceCreated)> = Vec::with_capacity(resources.len());

    for resource in resources {
        let spec = registry
            .get(&resource.step_type)
            .and_then(|d| d.resource.as_ref())
            .ok_or_else(|| {
                WorkflowError::invalid(format!(
                    "no teardown step known for {} created by {}",
                    resource.resource_type, resource.node_id
                ))
            })?;

        let id = NodeId::new(format!("{}_{}", spec.teardown_step, resource.node_id));
        template.nodes.push(
            WorkflowNode::new(id.as_str(), spec.teardown_step.as_str()).with_input(
                spec.teardown_input.as_str(),
                serde_json::Value::String(resource.resource_id.clone()),
            ),
        );
        nodes.push((id, resource));
    }

    for (a_id, a) in &nodes {
        for (b_id, b) in &nodes {
            if provisioned.is_ancestor(&a.node_id, &b.node_id) {
                template.edges.push(WorkflowEdge {
                    source: b_id.clone(),
                    dest: a_id.clone(),
                });
            }
        }
    }

    let resources = nodes
        .into_iter()
        .map(|(id, resource)| (id, resource.clone()))
        .collect();
    Ok(Teardown {
        template,
        resources,
    })
}

/// Difference between a provisioned template and its replacement
#[derive(Debug, Clone)]
pub struct ReprovisionDiff {
    /// Nodes that are new or whose definition changed
    pub changed: BTreeSet<NodeId>,
    /// Changed nodes and everything downstream of them
    pub rerun: BTreeSet<NodeId>,
    /// Nodes dropped from the template that were never provisioned
    pub removed: Vec<NodeId>,
    /// Graph of the nodes to rerun; bindings to untouched nodes are literals
    pub reduced: Template,
}

impl ReprovisionDiff {
    pub fn is_empty(&self) -> bool {
        self.rerun.is_empty() && self.removed.is_empty()
    }
}

/// Compute what a reprovision has to run.
///
/// `updated_dag` is the validated graph of `updated`; `state` holds the
/// outputs recorded for `current`.
pub fn reprovision_diff(
    current: &Template,
    updated: &Template,
    updated_dag: &WorkflowDag,
    state: &WorkflowState,
) -> WorkflowResult<ReprovisionDiff> {
    let provisioned = |id: &NodeId| {
        state
            .nodes
            .get(id)
            .map(|n| n.status == NodeStatus::Completed)
            .unwrap_or(false)
    };

    let mut removed = Vec::new();
    for node in &current.nodes {
        if updated.node(&node.id).is_none() {
            if provisioned(&node.id) {
                return Err(WorkflowError::invalid(format!(
                    "node {} is provisioned and cannot be removed; deprovision first",
                    node.id
                )));
            }
            removed.push(node.id.clone());
        }
    }

    let changed: BTreeSet<NodeId> = updated
        .nodes
        .iter()
        .filter(|node| match current.node(&node.id) {
            None => true,
            Some(old) => {
                old.step_type != node.step_type
                    || old.user_inputs != node.user_inputs
                    || old.previous_node_inputs != node.previous_node_inputs
                    || incoming(current, &node.id) != incoming(updated, &node.id)
                    || !provisioned(&node.id)
            }
        })
        .map(|node| node.id.clone())
        .collect();

    let mut rerun = changed.clone();
    for id in &changed {
        rerun.extend(updated_dag.descendants(id));
    }

    let mut reduced = Template::new(updated.name.clone());
    reduced.description = updated.description.clone();
    reduced.tenant_id = updated.tenant_id.clone();

    for node in updated.nodes.iter().filter(|n| rerun.contains(&n.id)) {
        let mut node = node.clone();
        let bindings = std::mem::take(&mut node.previous_node_inputs);
        for (input, binding) in bindings {
            if rerun.contains(&binding.node) {
                node.previous_node_inputs.insert(input, binding);
                continue;
            }
            let value = state
                .nodes
                .get(&binding.node)
                .and_then(|n| n.outputs.as_ref())
                .and_then(|outputs| outputs.get(&binding.output))
                .ok_or_else(|| {
                    WorkflowError::invalid(format!(
                        "no recorded output {}.{} for input '{}' of {}",
                        binding.node, binding.output, input, node.id
                    ))
                })?;
            node.user_inputs.insert(input, value.clone());
        }
        reduced.nodes.push(node);
    }

    reduced.edges = updated
        .edges
        .iter()
        .filter(|e| rerun.contains(&e.source) && rerun.contains(&e.dest))
        .cloned()
        .collect();

    Ok(ReprovisionDiff {
        changed,
        rerun,
        removed,
        reduced,
    })
}

fn incoming<'a>(template: &'a Template, id: &NodeId) -> BTreeSet<&'a NodeId> {
    template
        .edges
        .iter()
        .filter(|e| &e.dest == id)
        .map(|e| &e.source)
        .collect()
}
