//! Service descriptor graph.
//!
//! Built once at startup. Construction fails on duplicate names, unknown
//! dependencies and cycles; a built graph is always acyclic, so layering and
//! shutdown ordering cannot fail.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServiceDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate service name {0:?}")]
    Duplicate(String),
    #[error("service {unit:?} depends on unknown service {dependency:?}")]
    UnknownDependency { unit: String, dependency: String },
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ServiceGraph {
    units: Vec<Arc<ServiceDescriptor>>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    layers: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Visiting,
    Done,
}

impl ServiceGraph {
    pub fn build(descriptors: &[ServiceDescriptor]) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, d) in descriptors.iter().enumerate() {
            if index.insert(d.name.clone(), i).is_some() {
                return Err(GraphError::Duplicate(d.name.clone()));
            }
        }

        let mut deps = vec![Vec::new(); descriptors.len()];
        let mut dependents = vec![Vec::new(); descriptors.len()];
        for (i, d) in descriptors.iter().enumerate() {
            for dep in &d.depends_on {
                let j = *index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    unit: d.name.clone(),
                    dependency: dep.clone(),
                })?;
                if !deps[i].contains(&j) {
                    deps[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        if let Some(cycle) = find_cycle(&deps) {
            return Err(GraphError::Cycle {
                cycle: cycle.into_iter().map(|i| descriptors[i].name.clone()).collect(),
            });
        }

        let layers = layer(&deps);

        Ok(Self {
            units: descriptors.iter().cloned().map(Arc::new).collect(),
            index,
            deps,
            dependents,
            layers,
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Unit names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.name.clone()).collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.index.get(name).map(|&i| &self.units[i])
    }

    pub fn descriptors(&self) -> &[Arc<ServiceDescriptor>] {
        &self.units
    }

    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.names_of(self.index.get(name).map(|&i| self.deps[i].as_slice()))
    }

    /// Units that declare `name` as a direct dependency.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.names_of(self.index.get(name).map(|&i| self.dependents[i].as_slice()))
    }

    /// Layered topological order: every unit sits one layer after its deepest
    /// dependency. Within a layer units keep declaration order.
    pub fn layers(&self) -> Vec<Vec<String>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&i| self.units[i].name.clone()).collect())
            .collect()
    }

    /// Layers in reverse: dependents stop before their dependencies.
    pub fn shutdown_order(&self) -> Vec<Vec<String>> {
        let mut layers = self.layers();
        layers.reverse();
        layers
    }

    fn names_of(&self, ids: Option<&[usize]>) -> Vec<String> {
        ids.unwrap_or_default()
            .iter()
            .map(|&i| self.units[i].name.clone())
            .collect()
    }
}

/// Depth-first search in declaration order. Returns the first cycle found as a
/// closed path, e.g. `[a, b, a]`.
fn find_cycle(deps: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::New; deps.len()];
    let mut stack: Vec<usize> = Vec::new();

    fn visit(
        node: usize,
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Visiting;
        stack.push(node);
        for &next in &deps[node] {
            match marks[next] {
                Mark::Visiting => {
                    let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[from..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(next, deps, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    for node in 0..deps.len() {
        if marks[node] == Mark::New {
            if let Some(cycle) = visit(node, deps, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn layer(deps: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut depth: Vec<Option<usize>> = vec![None; deps.len()];
    let mut remaining = deps.len();
    let mut layers: Vec<Vec<usize>> = Vec::new();

    while remaining > 0 {
        let level = layers.len();
        let current: Vec<usize> = (0..deps.len())
            .filter(|&i| depth[i].is_none())
            .filter(|&i| deps[i].iter().all(|&d| matches!(depth[d], Some(l) if l < level)))
            .collect();
        if current.is_empty() {
            // Unreachable for an acyclic graph.
            break;
        }
        for &i in &current {
            depth[i] = Some(level);
        }
        remaining -= current.len();
        layers.push(current);
    }

    layers
}
