//! Dependency graph over unit names.
//!
//! Edges point requirer → required. Cascading removal is an explicit
//! worklist traversal over the adjacency structure, so termination and
//! cost stay proportional to the number of edges.

use indexmap::{IndexMap, IndexSet};

/// Requirer → required adjacency over normalized unit names.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: IndexMap<String, IndexSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a unit's outgoing requirement edges.
    pub fn set_requirements<I, S>(&mut self, unit: &str, requires: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: IndexSet<String> = requires.into_iter().map(Into::into).collect();
        self.edges.insert(unit.to_string(), set);
    }

    /// Drops a unit and its outgoing edges.
    pub fn remove(&mut self, unit: &str) {
        self.edges.shift_remove(unit);
    }

    /// Direct requirements of a unit.
    pub fn requirements(&self, unit: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(unit)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Units that directly require `unit`.
    pub fn dependents_of(&self, unit: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, requires)| requires.contains(unit))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Removes `failed` from the membership set and cascades: any member
    /// requiring a removed unit is removed too, transitively. Returns the
    /// cascaded removals (excluding `failed` itself) in removal order.
    pub fn cascade_remove(&self, failed: &str, members: &mut IndexSet<String>) -> Vec<String> {
        members.shift_remove(failed);
        let mut removed = Vec::new();
        let mut worklist = vec![failed.to_string()];
        while let Some(gone) = worklist.pop() {
            for dependent in self.dependents_of(&gone) {
                if members.shift_remove(&dependent) {
                    removed.push(dependent.clone());
                    worklist.push(dependent);
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[&str]) -> IndexSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn cascade_removes_transitive_dependents() {
        let mut graph = DependencyGraph::new();
        graph.set_requirements("B", ["A"]);
        graph.set_requirements("C", ["B"]);
        graph.set_requirements("D", Vec::<String>::new());

        let mut batch = members(&["A", "B", "C", "D"]);
        let removed = graph.cascade_remove("A", &mut batch);
        assert_eq!(removed, vec!["B", "C"]);
        assert_eq!(batch, members(&["D"]));
    }

    #[test]
    fn cascade_ignores_dependents_outside_the_batch() {
        let mut graph = DependencyGraph::new();
        graph.set_requirements("B", ["A"]);

        let mut batch = members(&["A"]);
        let removed = graph.cascade_remove("A", &mut batch);
        assert!(removed.is_empty());
        assert!(batch.is_empty());
    }

    #[test]
    fn diamond_dependency_removes_each_member_once() {
        let mut graph = DependencyGraph::new();
        graph.set_requirements("B", ["A"]);
        graph.set_requirements("C", ["A"]);
        graph.set_requirements("D", ["B", "C"]);

        let mut batch = members(&["A", "B", "C", "D"]);
        let mut removed = graph.cascade_remove("A", &mut batch);
        removed.sort();
        assert_eq!(removed, vec!["B", "C", "D"]);
        assert!(batch.is_empty());
    }

    #[test]
    fn requirement_replacement_drops_old_edges() {
        let mut graph = DependencyGraph::new();
        graph.set_requirements("B", ["A"]);
        graph.set_requirements("B", ["X"]);
        assert_eq!(graph.dependents_of("A"), Vec::<String>::new());
        assert_eq!(graph.dependents_of("X"), vec!["B"]);
        assert_eq!(graph.requirements("B").collect::<Vec<_>>(), vec!["X"]);
    }
}
