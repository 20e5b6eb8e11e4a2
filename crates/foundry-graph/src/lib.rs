//! Dependency graph construction and topological ordering.
//!
//! Packages are addressed by integer id internally (an arena, not a web
//! of `Rc`s); a parallel name -> id map lets callers build the graph from
//! plain `(name, deps)` pairs the way a submission arrives. Ordering ties
//! are broken by package name so the same input always produces the same
//! plan, matching the determinism `cargo_metadata`-style tooling commits
//! to.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected among packages: {0:?}")]
    Cycle(Vec<String>),
}

/// A dependency graph over package names, built once per build submission.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    name_to_id: BTreeMap<String, usize>,
    /// `deps[i]` holds the ids that node `i` depends on.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]` holds the ids that depend on node `i`.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph from `(name, deps)` pairs. A dependency name that is
    /// not itself one of the packages in `nodes` is treated as already
    /// satisfied (it lives outside this build) rather than an error,
    /// mirroring the "dependencies outside the build are pre-satisfied"
    /// rule from the data model.
    pub fn build(nodes: &[(String, Vec<String>)]) -> Self {
        let mut names = Vec::with_capacity(nodes.len());
        let mut name_to_id = BTreeMap::new();
        for (name, _) in nodes {
            let id = names.len();
            names.push(name.clone());
            name_to_id.insert(name.clone(), id);
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
        for (name, dep_names) in nodes {
            let id = name_to_id[name];
            for dep_name in dep_names {
                if let Some(&dep_id) = name_to_id.get(dep_name) {
                    deps[id].push(dep_id);
                    dependents[dep_id].push(id);
                }
            }
        }

        Self {
            names,
            name_to_id,
            deps,
            dependents,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.name_to_id.get(name).copied()
    }

    pub fn name_of(&self, id: usize) -> &str {
        &self.names[id]
    }

    /// In-build dependency names for a node (deps outside the build are
    /// already filtered out at construction time).
    pub fn deps_of(&self, id: usize) -> impl Iterator<Item = &str> {
        self.deps[id].iter().map(|&d| self.names[d].as_str())
    }

    /// Kahn's algorithm with a deterministic, name-ordered ready queue.
    /// Returns node ids in a valid topological order, or
    /// [`GraphError::Cycle`] naming every node still unresolved once the
    /// algorithm stalls.
    pub fn topo_sort(&self) -> Result<Vec<usize>, GraphError> {
        let mut indegree: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();

        let mut ready: BTreeSet<(String, usize)> = BTreeSet::new();
        for (id, deg) in indegree.iter().enumerate() {
            if *deg == 0 {
                ready.insert((self.names[id].clone(), id));
            }
        }

        let mut out = Vec::with_capacity(self.names.len());
        while let Some((name, id)) = ready.iter().next().cloned() {
            ready.remove(&(name, id));
            out.push(id);

            for &dependent in &self.dependents[id] {
                indegree[dependent] = indegree[dependent].saturating_sub(1);
                if indegree[dependent] == 0 {
                    ready.insert((self.names[dependent].clone(), dependent));
                }
            }
        }

        if out.len() != self.names.len() {
            let resolved: BTreeSet<usize> = out.iter().copied().collect();
            let unresolved = (0..self.names.len())
                .filter(|id| !resolved.contains(id))
                .map(|id| self.names[id].clone())
                .collect();
            return Err(GraphError::Cycle(unresolved));
        }

        Ok(out)
    }

    /// Topological order as package names, for callers that don't need ids.
    pub fn topo_sort_names(&self) -> Result<Vec<String>, GraphError> {
        Ok(self
            .topo_sort()?
            .into_iter()
            .map(|id| self.names[id].clone())
            .collect())
    }

}
