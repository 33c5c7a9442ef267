//! Flat-array workflow graph with topological layering.
//!
//! Nodes and edges live in plain vectors and are addressed by index; the
//! id-to-index map exists only for loading and reporting. Layers come from
//! Kahn's algorithm over the non-sink nodes, sorted inside each layer by
//! node type priority.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, Result};
use shared_utils::types::{EdgeCondition, WorkflowData};

use crate::types::{Node, NodeKind};

#[derive(Clone, Copy, Debug)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub condition: EdgeCondition,
}

#[derive(Debug)]
pub struct WorkflowGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Outgoing / incoming edge indices per node, in declaration order.
    pub out_edges: Vec<Vec<usize>>,
    pub in_edges: Vec<Vec<usize>>,
    pub source: usize,
}

impl WorkflowGraph {
    pub fn build(
        data: &WorkflowData,
        mut hydrate: impl FnMut(&shared_utils::types::NodeSpec) -> Result<Node>,
    ) -> Result<WorkflowGraph> {
        let mut nodes = Vec::with_capacity(data.nodes.len());
        let mut index = HashMap::new();
        for spec in &data.nodes {
            if index.contains_key(&spec.id) {
                bail!("duplicate node id '{}'", spec.id);
            }
            index.insert(spec.id.clone(), nodes.len());
            nodes.push(hydrate(spec)?);
        }

        let mut edges = Vec::with_capacity(data.connections.len());
        let mut out_edges = vec![Vec::new(); nodes.len()];
        let mut in_edges = vec![Vec::new(); nodes.len()];
        for conn in &data.connections {
            let (Some(&from), Some(&to)) = (index.get(&conn.from), index.get(&conn.to)) else {
                bail!("connection {} -> {} references an unknown node", conn.from, conn.to);
            };
            let edge_idx = edges.len();
            edges.push(Edge {
                from,
                to,
                condition: EdgeCondition::parse(conn.condition.as_deref()),
            });
            out_edges[from].push(edge_idx);
            in_edges[to].push(edge_idx);
        }

        let sources: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Source { .. }))
            .map(|(i, _)| i)
            .collect();
        let source = match sources.as_slice() {
            [single] => *single,
            [] => bail!("workflow has no source node"),
            _ => bail!("workflow has {} source nodes, expected exactly one", sources.len()),
        };

        let graph = WorkflowGraph { nodes, edges, out_edges, in_edges, source };
        graph.validate_reachability()?;
        graph.layers()?;
        Ok(graph)
    }

    /// Every node must be reachable from the source.
    fn validate_reachability(&self) -> Result<()> {
        let mut seen = HashSet::from([self.source]);
        let mut queue = VecDeque::from([self.source]);
        while let Some(node) = queue.pop_front() {
            for &edge_idx in &self.out_edges[node] {
                let to = self.edges[edge_idx].to;
                if seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
        if seen.len() != self.nodes.len() {
            let orphans: Vec<&str> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !seen.contains(i))
                .map(|(_, n)| n.id.as_str())
                .collect();
            bail!("nodes not reachable from the source: {}", orphans.join(", "));
        }
        Ok(())
    }

    /// Kahn layering over non-sink nodes. Alert nodes are excluded: they run
    /// through edge traversal from their parents. A stall means a cycle,
    /// which is a load-time configuration error.
    pub fn layers(&self) -> Result<Vec<Vec<usize>>> {
        let scheduled: HashSet<usize> = (0..self.nodes.len())
            .filter(|&i| !self.nodes[i].is_sink())
            .collect();

        let mut indegree: HashMap<usize, usize> = scheduled.iter().map(|&i| (i, 0)).collect();
        for edge in &self.edges {
            if scheduled.contains(&edge.from) && scheduled.contains(&edge.to) {
                *indegree.get_mut(&edge.to).unwrap() += 1;
            }
        }

        let mut remaining = scheduled;
        let mut levels = Vec::new();
        while !remaining.is_empty() {
            let mut level: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|i| indegree[i] == 0)
                .collect();
            if level.is_empty() {
                bail!("workflow graph contains a cycle");
            }
            level.sort_by_key(|&i| (self.nodes[i].type_priority(), i));

            for &node in &level {
                remaining.remove(&node);
                for &edge_idx in &self.out_edges[node] {
                    let to = self.edges[edge_idx].to;
                    if let Some(count) = indegree.get_mut(&to) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            levels.push(level);
        }
        Ok(levels)
    }

    /// A layer may run in parallel only without function nodes: functions
    /// join all upstream results and therefore serialize.
    pub fn layer_allows_parallel(&self, layer: &[usize]) -> bool {
        !layer
            .iter()
            .any(|&i| matches!(self.nodes[i].kind, NodeKind::Function { .. }))
    }

    /// Direct upstream node indices, in edge declaration order.
    pub fn upstream_of(&self, node: usize) -> Vec<usize> {
        self.in_edges[node].iter().map(|&e| self.edges[e].from).collect()
    }

    /// Nearest ancestor roi node with configured regions, walking incoming
    /// edges breadth-first. ROI is branch-local: a roi node only ever scopes
    /// its own downstream, so the walk never crosses to sibling branches.
    /// Ties at the same hop distance resolve by edge declaration order.
    pub fn nearest_roi(&self, node: usize) -> Option<usize> {
        let mut seen = HashSet::from([node]);
        let mut queue: VecDeque<usize> = self.upstream_of(node).into_iter().collect();
        while let Some(candidate) = queue.pop_front() {
            if !seen.insert(candidate) {
                continue;
            }
            if let NodeKind::Roi { regions } = &self.nodes[candidate].kind {
                if !regions.is_empty() {
                    return Some(candidate);
                }
            }
            for upstream in self.upstream_of(candidate) {
                queue.push_back(upstream);
            }
        }
        None
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }
}
