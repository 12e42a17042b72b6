//! Workflow hierarchy - the static shape of a composed agent tree

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentKind};

/// Serializable view of a composed tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTree {
    pub name: String,
    /// Dot-delimited path from the root, e.g. `Pipeline.Collect.SourceA`
    pub path: String,
    pub kind: AgentKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AgentTree>,
}

/// Node in the workflow hierarchy
#[derive(Debug, Clone)]
struct HierarchyNode {
    name: String,
    kind: AgentKind,
    parent: Option<String>,
    children: Vec<String>,
}

/// Agents of a composed workflow, addressed by branch path.
///
/// Paths follow the branch tags composers put on events, minus the loop
/// `.iter<n>` segment. Siblings sharing a name share a node, just as their
/// events share a branch.
pub struct WorkflowHierarchy {
    /// All nodes by path
    nodes: HashMap<String, HierarchyNode>,
    /// Root path
    root: Option<String>,
}

impl WorkflowHierarchy {
    /// Create a new empty hierarchy
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
        }
    }

    /// Walk `root` and its sub-agents
    pub fn from_agent(root: &dyn Agent) -> Self {
        let mut hierarchy = Self::new();
        hierarchy.visit(root, None);
        hierarchy
    }

    fn visit(&mut self, agent: &dyn Agent, parent: Option<&str>) {
        let path = self.add_agent(agent.name(), agent.kind(), parent);
        for child in agent.sub_agents() {
            self.visit(child.as_ref(), Some(&path));
        }
    }

    /// Add a node under `parent` (or as the root) and return its path
    pub fn add_agent(&mut self, name: &str, kind: AgentKind, parent: Option<&str>) -> String {
        let path = match parent {
            Some(parent) => format!("{parent}.{name}"),
            None => name.to_string(),
        };

        if parent.is_none() {
            self.root = Some(path.clone());
        }

        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(p)) {
            if !parent.children.contains(&path) {
                parent.children.push(path.clone());
            }
        }

        self.nodes.entry(path.clone()).or_insert_with(|| HierarchyNode {
            name: name.to_string(),
            kind,
            parent: parent.map(str::to_string),
            children: Vec::new(),
        });

        path
    }

    /// Get the root path
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn kind(&self, path: &str) -> Option<AgentKind> {
        self.nodes.get(path).map(|n| n.kind)
    }

    /// Get parent of a node
    pub fn parent(&self, path: &str) -> Option<&str> {
        self.nodes.get(path).and_then(|n| n.parent.as_deref())
    }

    /// Get children of a node, in composition order
    pub fn children(&self, path: &str) -> Vec<String> {
        self.nodes.get(path).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Get depth of a node in the tree
    pub fn depth(&self, path: &str) -> usize {
        let mut depth = 0;
        let mut current = self.parent(path);

        while let Some(p) = current {
            depth += 1;
            current = self.parent(p);
        }

        depth
    }

    /// Get all paths at a specific depth, sorted
    pub fn paths_at_depth(&self, depth: usize) -> Vec<String> {
        let mut paths: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| self.depth(p) == depth)
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Paths of the leaf agents, sorted
    pub fn leaves(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.children.is_empty())
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Convert to a serializable tree; `None` when empty
    pub fn to_tree(&self) -> Option<AgentTree> {
        self.root.as_deref().and_then(|root| self.build_tree_node(root))
    }

    fn build_tree_node(&self, path: &str) -> Option<AgentTree> {
        let node = self.nodes.get(path)?;
        Some(AgentTree {
            name: node.name.clone(),
            path: path.to_string(),
            kind: node.kind,
            children: node
                .children
                .iter()
                .filter_map(|child| self.build_tree_node(child))
                .collect(),
        })
    }

    /// Get total node count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if hierarchy is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for WorkflowHierarchy {
    fn default() -> Self {
        Self::new()
    }
}
