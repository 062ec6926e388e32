use crate::error::ValidationError;
use crate::types::{NodeId, Template, WorkflowNode};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// DAG representation of a validated template.
///
/// Edges run from dependency to dependent and include both the declared
/// edges and the ones implied by previous-node-input bindings.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<WorkflowNode, ()>,
    node_indices: HashMap<NodeId, NodeIndex>,
}

impl WorkflowDag {
    /// Build the graph. Node ids must be unique and every edge endpoint and
    /// binding source must exist; the validator checks both first.
    pub(crate) fn build(template: &Template) -> Self {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node in &template.nodes {
            let idx = graph.add_node(node.clone());
            node_indices.insert(node.id.clone(), idx);
        }

        let explicit = template.edges.iter().map(|e| (&e.source, &e.dest));
        let implicit = template.nodes.iter().flat_map(|node| {
            node.previous_node_inputs
                .values()
                .map(move |binding| (&binding.node, &node.id))
        });

        for (source, dest) in explicit.chain(implicit) {
            if let (Some(&s), Some(&d)) = (node_indices.get(source), node_indices.get(dest)) {
                // update_edge keeps a single edge per ordered pair
                graph.update_edge(s, d, ());
            }
        }

        Self {
            graph,
            node_indices,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.node_indices.get(id).map(|&idx| &self.graph[idx])
    }

    /// Nodes in template order
    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(&idx) = self.node_indices.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Direct predecessors of a node, sorted
    pub fn dependencies(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct successors of a node, sorted
    pub fn dependents(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Whether `descendant` is reachable from `ancestor`
    pub fn is_ancestor(&self, ancestor: &NodeId, descendant: &NodeId) -> bool {
        match (
            self.node_indices.get(ancestor),
            self.node_indices.get(descendant),
        ) {
            (Some(&a), Some(&d)) if a != d => {
                petgraph::algo::has_path_connecting(&self.graph, a, d, None)
            }
            _ => false,
        }
    }

    /// All nodes reachable from `id`, excluding `id` itself
    pub fn descendants(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.node_indices.get(id) else {
            return found;
        };
        let mut dfs = petgraph::visit::Dfs::new(&self.graph, start);
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                found.insert(self.graph[idx].id.clone());
            }
        }
        found
    }

    /// Nodes with no dependencies, sorted
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Nodes of the first strongly connected component that forms a cycle
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .map(|scc| {
                let mut ids: Vec<NodeId> =
                    scc.into_iter().map(|n| self.graph[n].id.clone()).collect();
                ids.sort();
                ids
            })
            .min()
    }

    /// Kahn's algorithm, emitting ready layers.
    ///
    /// Each layer holds the nodes whose dependencies all sit in earlier
    /// layers, sorted by node id, so the same graph always yields the same
    /// plan. Residual nodes mean a cycle.
    pub fn execution_plan(&self) -> Result<ExecutionPlan, ValidationError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut ready: BTreeSet<(NodeId, NodeIndex)> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| (self.graph[n].id.clone(), n))
            .collect();

        let mut layers = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let layer: Vec<(NodeId, NodeIndex)> = std::mem::take(&mut ready).into_iter().collect();
            for (_, idx) in &layer {
                for succ in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&succ) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert((self.graph[succ].id.clone(), succ));
                        }
                    }
                }
            }
            placed += layer.len();
            layers.push(layer.into_iter().map(|(id, _)| id).collect());
        }

        if placed < self.graph.node_count() {
            let mut residual: Vec<NodeId> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| self.graph[n].id.clone())
                .collect();
            residual.sort();
            return Err(ValidationError::CyclicGraph(residual));
        }

        Ok(ExecutionPlan { layers })
    }
}

/// Deterministic layering of a validated graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    layers: Vec<Vec<NodeId>>,
}

impl ExecutionPlan {
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    /// Nodes in dispatch order, layer by layer
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.layers.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_of(&self, id: &NodeId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowNode;

    fn node(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, "noop")
    }

    fn ids(layer: &[NodeId]) -> Vec<&str> {
        layer.iter().map(NodeId::as_str).collect()
    }

    #[test]
    fn test_linear_dag() {
        let template = Template::new("linear")
            .with_node(node("step1"))
            .with_node(node("step2"))
            .with_node(node("step3"))
            .with_edge("step1", "step2")
            .with_edge("step2", "step3");

        let plan = WorkflowDag::build(&template).execution_plan().unwrap();
        assert_eq!(plan.layers().len(), 3);
        assert_eq!(ids(&plan.layers()[0]), vec!["step1"]);
        assert_eq!(ids(&plan.layers()[2]), vec!["step3"]);
    }

    #[test]
    fn test_parallel_dag_layers_sorted_by_id() {
        let template = Template::new("fan-in")
            .with_node(node("d"))
            .with_node(node("c"))
            .with_node(node("b"))
            .with_node(node("a"))
            .with_edge("a", "c")
            .with_edge("b", "c");

        let dag = WorkflowDag::build(&template);
        let plan = dag.execution_plan().unwrap();

        assert_eq!(ids(&plan.layers()[0]), vec!["a", "b", "d"]);
        assert_eq!(ids(&plan.layers()[1]), vec!["c"]);
        assert_eq!(dag.dependencies(&NodeId::new("c")).len(), 2);
        assert_eq!(dag.entry_nodes().len(), 3);
    }

    #[test]
    fn test_layering_respects_every_edge() {
        let template = Template::new("diamond")
            .with_node(node("a"))
            .with_node(node("b"))
            .with_node(node("c"))
            .with_node(node("d"))
            .with_node(node("e"))
            .with_edge("a", "b")
            .with_edge("a", "c")
            .with_edge("b", "d")
            .with_edge("c", "d")
            .with_edge("a", "e")
            .with_edge("d", "e");

        let plan = WorkflowDag::build(&template).execution_plan().unwrap();
        for edge in &template.edges {
            assert!(
                plan.layer_of(&edge.source).unwrap() < plan.layer_of(&edge.dest).unwrap(),
                "{} must precede {}",
                edge.source,
                edge.dest
            );
        }
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let template = Template::new("wide")
            .with_node(node("z"))
            .with_node(node("m"))
            .with_node(node("a"))
            .with_node(node("k"))
            .with_edge("z", "k");

        let first = WorkflowDag::build(&template).execution_plan().unwrap();
        let second = WorkflowDag::build(&template).execution_plan().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bindings_add_implicit_edges() {
        let template = Template::new("bound")
            .with_node(node("consumer").with_binding("x", "producer", "out"))
            .with_node(node("producer"));

        let dag = WorkflowDag::build(&template);
        assert_eq!(dag.dependencies(&NodeId::new("consumer")), vec![NodeId::new("producer")]);
        let plan = dag.execution_plan().unwrap();
        assert_eq!(ids(&plan.layers()[0]), vec!["producer"]);
    }

    #[test]
    fn test_cycle_detected_by_sorter() {
        let template = Template::new("cycle")
            .with_node(node("a"))
            .with_node(node("b"))
            .with_node(node("c"))
            .with_edge("a", "b")
            .with_edge("b", "a")
            .with_edge("c", "a");

        let dag = WorkflowDag::build(&template);
        assert_eq!(
            dag.execution_plan(),
            Err(ValidationError::CyclicGraph(vec![NodeId::new("a"), NodeId::new("b")]))
        );
        assert_eq!(dag.find_cycle(), Some(vec![NodeId::new("a"), NodeId::new("b")]));
    }

    #[test]
    fn test_descendants_and_ancestry() {
        let template = Template::new("chain")
            .with_node(node("a"))
            .with_node(node("b"))
            .with_node(node("c"))
            .with_node(node("x"))
            .with_edge("a", "b")
            .with_edge("b", "c");

        let dag = WorkflowDag::build(&template);
        let desc: Vec<_> = dag.descendants(&NodeId::new("a")).into_iter().collect();
        assert_eq!(desc, vec![NodeId::new("b"), NodeId::new("c")]);
        assert!(dag.is_ancestor(&NodeId::new("a"), &NodeId::new("c")));
        assert!(!dag.is_ancestor(&NodeId::new("c"), &NodeId::new("a")));
        assert!(!dag.is_ancestor(&NodeId::new("x"), &NodeId::new("c")));
    }
}
