//! Task graph: the dependency DAG produced by decomposition.
//!
//! Nodes are [`TaskNode`]s and an edge `a -> b` means `b` depends on `a`.
//! The graph is validated once at construction (unique ids, no dangling
//! dependencies, no cycles); afterwards only node status changes.

use crate::core::task::{GraphId, NodeId, NodeStatus, TaskNode};
use crate::error::{Error, Result};
use crate::lane::LaneId;
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};

/// Identifier given to the node of a single-node graph.
pub const SINGLE_NODE_ID: &str = "task-1";

/// The task dependency graph for one run.
pub struct TaskGraph {
    id: GraphId,
    goal: String,
    created_at: DateTime<Utc>,
    graph: DiGraph<TaskNode, ()>,
    /// Index mapping from NodeId to NodeIndex for fast lookups.
    index: HashMap<NodeId, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate a graph from decomposed nodes.
    ///
    /// # Errors
    /// - `Validation` for an empty node list, a duplicate id or a dependency
    ///   naming a node outside the graph
    /// - `CyclicGraph` when the dependencies form a cycle
    pub fn new(goal: &str, nodes: Vec<TaskNode>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::Validation("task graph has no nodes".to_string()));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in nodes {
            if index.contains_key(&node.id) {
                return Err(Error::Validation(format!("duplicate node id: {}", node.id)));
            }
            let id = node.id.clone();
            let idx = graph.add_node(node);
            index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for (id, &to) in &index {
            for dep in &graph[to].dependencies {
                let from = index.get(dep).ok_or_else(|| {
                    Error::Validation(format!("node {} depends on unknown node {}", id, dep))
                })?;
                edges.push((*from, to));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        toposort(&graph, None).map_err(|cycle| Error::CyclicGraph {
            node: graph[cycle.node_id()].id.to_string(),
        })?;

        Ok(Self {
            id: GraphId::new(),
            goal: goal.to_string(),
            created_at: Utc::now(),
            graph,
            index,
        })
    }

    /// Deterministic one-node graph covering the whole goal.
    pub fn single_node(goal: &str) -> Self {
        let title = crate::util::truncate(goal.lines().next().unwrap_or(goal), 80);
        let node = TaskNode::new(SINGLE_NODE_ID, title, goal)
            .with_criteria(&["The stated goal is fully addressed"]);

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let idx = graph.add_node(node);
        index.insert(NodeId::from(SINGLE_NODE_ID), idx);

        Self {
            id: GraphId::new(),
            goal: goal.to_string(),
            created_at: Utc::now(),
            graph,
            index,
        }
    }

    /// Parse a JSON array of nodes (the decomposition shape) into a graph.
    pub fn from_json(goal: &str, json: &str) -> Result<Self> {
        let nodes: Vec<TaskNode> = serde_json::from_str(json)?;
        Self::new(goal, nodes)
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&TaskNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut TaskNode> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| Error::Validation(format!("node {} not found in graph", id)))?;
        Ok(&mut self.graph[idx])
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Nodes `id` depends on.
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes that depend on `id`.
    pub fn dependents_of(&self, id: &NodeId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &NodeId, dir: Direction) -> Vec<&TaskNode> {
        match self.index.get(id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, dir)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    // ========== Scheduling Operations ==========

    /// Pending nodes whose dependencies are all in `resolved`
    /// (the completed-or-failed set), in insertion order.
    pub fn ready_nodes(&self, resolved: &HashSet<NodeId>) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter_map(|idx| {
                let node = &self.graph[idx];
                if !node.is_pending() {
                    return None;
                }
                let deps_resolved = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|dep| resolved.contains(&self.graph[dep].id));
                deps_resolved.then(|| node.id.clone())
            })
            .collect()
    }

    /// Ids of nodes still pending, in insertion order.
    pub fn pending_ids(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.is_pending())
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn set_status(&mut self, id: &NodeId, status: NodeStatus) -> Result<()> {
        self.node_mut(id)?.status = status;
        Ok(())
    }

    /// Mark a node complete, recording the lane whose merge completed it.
    pub fn complete(&mut self, id: &NodeId, lane_id: &LaneId) -> Result<()> {
        let node = self.node_mut(id)?;
        node.status = NodeStatus::Complete;
        node.merged_lane = Some(lane_id.clone());
        Ok(())
    }

    /// Mark every pending node blocked; returns the ids affected.
    pub fn block_pending(&mut self, reason: &str) -> Vec<NodeId> {
        let pending = self.pending_ids();
        for id in &pending {
            if let Some(&idx) = self.index.get(id) {
                self.graph[idx].status = NodeStatus::Blocked {
                    reason: reason.to_string(),
                };
            }
        }
        pending
    }

    pub fn count_where(&self, pred: impl Fn(&NodeStatus) -> bool) -> usize {
        self.nodes().filter(|n| pred(&n.status)).count()
    }

    /// Whether no node is pending or dispatched.
    pub fn all_resolved(&self) -> bool {
        self.nodes().all(TaskNode::is_resolved)
    }

    /// Nodes ordered so that each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicGraph {
            node: self.graph[cycle.node_id()].id.to_string(),
        })?;
        Ok(sorted.into_iter().map(|idx| &self.graph[idx]).collect())
    }
}

impl Serialize for TaskGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let nodes: Vec<&TaskNode> = self.nodes().collect();
        let mut s = serializer.serialize_struct("TaskGraph", 4)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("goal", &self.goal)?;
        s.serialize_field("createdAt", &self.created_at)?;
        s.serialize_field("nodes", &nodes)?;
        s.end()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("id", &self.id.short())
            .field("nodes", &self.len())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}
