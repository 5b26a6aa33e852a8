//! Feature dependency graph: cycle detection and topological ordering.

use crate::workflow::Workflow;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Dependency graph as `id -> ids` maps plus derived dependents.
///
/// Edges pointing at unknown ids are dropped at construction; reference
/// integrity is the validator's concern, not the graph's.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    deps: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl DepGraph {
    /// Build the feature dependency graph from a workflow.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut graph = Self::default();
        let known: BTreeSet<&str> = workflow
            .features()
            .filter(|f| !f.id.is_empty())
            .map(|f| f.id.as_str())
            .collect();
        for feature in workflow.features() {
            if feature.id.is_empty() {
                continue;
            }
            let deps = feature
                .depends_on
                .iter()
                .filter(|d| known.contains(d.as_str()))
                .cloned()
                .collect();
            graph.insert(feature.id.clone(), deps);
        }
        graph
    }

    /// Insert a node with its dependencies.
    pub fn insert(&mut self, id: String, deps: Vec<String>) {
        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(id.clone());
        }
        self.dependents.entry(id.clone()).or_default();
        self.deps.insert(id, deps);
    }

    /// All node ids in lexicographic order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Dependencies of a node.
    pub fn deps_of(&self, id: &str) -> &[String] {
        self.deps.get(id).map_or(&[], Vec::as_slice)
    }

    /// Nodes that depend on `id`.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Find a dependency cycle, if any.
    ///
    /// Depth-first search with an in-stack set; on a back-edge the cycle
    /// path is sliced out of the DFS stack and closed with the
    /// re-encountered node, e.g. `[a, b, a]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut in_stack: BTreeSet<&str> = BTreeSet::new();

        for start in self.deps.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            if let Some(cycle) = self.dfs(start, &mut visited, &mut stack, &mut in_stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut BTreeSet<&'a str>,
        stack: &mut Vec<&'a str>,
        in_stack: &mut BTreeSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);
        in_stack.insert(node);

        for dep in self.deps_of(node) {
            if in_stack.contains(dep.as_str()) {
                let pos = stack.iter().position(|n| *n == dep).unwrap_or(0);
                let mut path: Vec<String> = stack[pos..].iter().map(ToString::to_string).collect();
                path.push(dep.clone());
                return Some(path);
            }
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = self.dfs(dep, visited, stack, in_stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        in_stack.remove(node);
        None
    }

    /// Topological order via Kahn's algorithm.
    ///
    /// The ready queue is kept lexicographically sorted so the order is
    /// deterministic across runs. Cyclic graphs return a cycle error with
    /// the offending path.
    pub fn topo_sort(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .deps
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.deps.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(next);
            order.push(next.to_string());
            for dependent in self.dependents_of(next) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        if order.len() < self.deps.len() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(GraphError::Cycle { path });
        }
        Ok(order)
    }
}

/// Stable topological order of layers: depended-upon layers first,
/// declaration order preserved among layers whose dependencies are
/// already placed.
pub fn layer_order(workflow: &Workflow) -> Result<Vec<String>, GraphError> {
    let declared: Vec<&str> = workflow.layers.iter().map(|l| l.id.as_str()).collect();
    let known: BTreeSet<&str> = declared.iter().copied().collect();

    let mut remaining: Vec<&str> = declared.clone();
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(declared.len());

    while !remaining.is_empty() {
        let before = order.len();
        remaining.retain(|id| {
            let layer = workflow.layers.iter().find(|l| l.id == *id);
            let deps_placed = layer.is_some_and(|l| {
                l.depends_on
                    .iter()
                    .filter(|d| known.contains(d.as_str()))
                    .all(|d| placed.contains(d.as_str()))
            });
            if deps_placed {
                order.push((*id).to_string());
                placed.insert(id);
                false
            } else {
                true
            }
        });
        if order.len() == before {
            // No progress: the remaining layers form a cycle.
            let path: Vec<String> = remaining.iter().map(ToString::to_string).collect();
            return Err(GraphError::Cycle { path });
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_str;

    fn graph(edges: &[(&str, &[&str])]) -> DepGraph {
        let mut g = DepGraph::default();
        for (id, deps) in edges {
            g.insert(
                (*id).to_string(),
                deps.iter().map(ToString::to_string).collect(),
            );
        }
        g
    }

    #[test]
    fn topo_sort_orders_dependencies_first() {
        let g = graph(&[("c", &["a", "b"]), ("b", &[]), ("a", &[])]);
        let order = g.topo_sort().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_sort_breaks_ties_lexicographically() {
        let g = graph(&[("z", &[]), ("m", &[]), ("a", &[])]);
        assert_eq!(g.topo_sort().unwrap(), vec!["a", "m", "z"]);

        let g = graph(&[("b", &["root"]), ("a", &["root"]), ("root", &[])]);
        assert_eq!(g.topo_sort().unwrap(), vec!["root", "a", "b"]);
    }

    #[test]
    fn topo_sort_rejects_cycles() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let err = g.topo_sort().unwrap_err();
        let GraphError::Cycle { path } = err;
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn find_cycle_returns_closed_path() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let path = g.find_cycle().unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), path.last());
    }

    #[test]
    fn find_cycle_ignores_acyclic_diamond() {
        let g = graph(&[("d", &["b", "c"]), ("b", &["a"]), ("c", &["a"]), ("a", &[])]);
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        let path = g.find_cycle().unwrap();
        assert_eq!(path, vec!["a", "a"]);
    }

    #[test]
    fn from_workflow_drops_dangling_edges() {
        let doc = r#"schema_version: "1.0"
dag:
  name: Demo
layers:
  - id: L0
    features:
      - id: a
        description: A
        depends_on: [ghost]
"#;
        let parsed = parse_str(doc).unwrap();
        let g = DepGraph::from_workflow(&parsed.workflow);
        assert!(g.deps_of("a").is_empty());
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn dependents_are_derived() {
        let g = graph(&[("b", &["a"]), ("c", &["a"]), ("a", &[])]);
        assert_eq!(g.dependents_of("a"), &["b".to_string(), "c".to_string()]);
        assert!(g.dependents_of("b").is_empty());
    }

    #[test]
    fn layer_order_is_stable_topological() {
        let doc = r#"schema_version: "1.0"
dag:
  name: Demo
layers:
  - id: L2
    depends_on: [L0]
    features: []
  - id: L0
    features: []
  - id: L1
    features: []
"#;
        let parsed = parse_str(doc).unwrap();
        let order = layer_order(&parsed.workflow).unwrap();
        // L2 waits for L0; L0 and L1 keep declaration order.
        assert_eq!(order, vec!["L0", "L1", "L2"]);
    }

    #[test]
    fn layer_order_rejects_cycles() {
        let doc = r#"schema_version: "1.0"
dag:
  name: Demo
layers:
  - id: A
    depends_on: [B]
    features: []
  - id: B
    depends_on: [A]
    features: []
"#;
        let parsed = parse_str(doc).unwrap();
        assert!(layer_order(&parsed.workflow).is_err());
    }
}
