use std::collections::{HashMap, HashSet};

/// Dependency graph over job ids. Edges run prerequisite -> dependent;
/// a node with in-degree zero has no unfinished prerequisites.
#[derive(Debug, Default)]
pub struct JobDag {
    /// node -> its direct dependents
    edges: HashMap<i64, HashSet<i64>>,
    in_degree: HashMap<i64, usize>,
}

impl JobDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: i64) {
        self.edges.entry(node).or_default();
        self.in_degree.entry(node).or_insert(0);
    }

    /// Add edge prerequisite -> dependent. Returns false (and changes
    /// nothing) for self-edges or edges that would close a cycle.
    pub fn add_edge(&mut self, prerequisite: i64, dependent: i64) -> bool {
        if prerequisite == dependent {
            return false;
        }
        self.add_node(prerequisite);
        self.add_node(dependent);
        if self.has_path(dependent, prerequisite) {
            return false;
        }
        if self
            .edges
            .get_mut(&prerequisite)
            .expect("node added above")
            .insert(dependent)
        {
            *self.in_degree.entry(dependent).or_insert(0) += 1;
        }
        true
    }

    /// Remove a node, decrementing the in-degree of its dependents
    /// (which may make them ready).
    pub fn remove_node(&mut self, node: i64) {
        for dependents in self.edges.values_mut() {
            dependents.remove(&node);
        }
        if let Some(dependents) = self.edges.remove(&node) {
            for dep in dependents {
                if let Some(d) = self.in_degree.get_mut(&dep) {
                    *d = d.saturating_sub(1);
                }
            }
        }
        self.in_degree.remove(&node);
    }

    /// Nodes with no remaining prerequisites.
    pub fn ready_nodes(&self) -> Vec<i64> {
        self.in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect()
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, node: i64) -> Vec<i64> {
        self.edges
            .get(&node)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, node: i64) -> bool {
        self.edges.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn has_path(&self, from: i64, to: i64) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = self.edges.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }
}
