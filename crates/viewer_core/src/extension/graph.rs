//! Extension dependency graph.
//!
//! # Responsibility
//! - Order extensions so every one follows all of its dependencies.
//! - Report every missing dependency and every cycle in one pass.
//! - Compute the dependency closure a mode needs.
//!
//! # Invariants
//! - Ties between ready extensions are broken by input position, so equal
//!   inputs always yield equal orders.

use crate::extension::manifest::ExtensionDescriptor;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// One extension as seen by the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode<'a> {
    pub id: &'a str,
    pub dependencies: Vec<&'a str>,
}

impl<'a> DependencyNode<'a> {
    pub fn new(id: &'a str, dependencies: Vec<&'a str>) -> Self {
        Self { id, dependencies }
    }

    pub fn from_descriptor(descriptor: &'a ExtensionDescriptor) -> Self {
        Self {
            id: descriptor.id.as_str(),
            dependencies: descriptor
                .dependencies
                .iter()
                .map(|dependency| dependency.id.as_str())
                .collect(),
        }
    }
}

/// Structural graph problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    MissingDependency { requester: String, missing: String },
    /// Cycle path; the first id is repeated at the end.
    CyclicDependency { cycle: Vec<String> },
}

impl Display for GraphError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDependency { requester, missing } => {
                write!(f, "extension `{requester}` depends on missing `{missing}`")
            }
            Self::CyclicDependency { cycle } => {
                write!(f, "dependency cycle: {}", cycle.join(" -> "))
            }
        }
    }
}

impl Error for GraphError {}

/// Returns node positions in dependency order.
///
/// Dependencies for which `is_satisfied` returns true (already loaded
/// extensions) impose no ordering constraint.
pub fn topological_order(
    nodes: &[DependencyNode<'_>],
    is_satisfied: impl Fn(&str) -> bool,
) -> Result<Vec<usize>, Vec<GraphError>> {
    let index: BTreeMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(position, node)| (node.id, position))
        .collect();

    let mut errors = Vec::new();
    let mut indegrees = vec![0_usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (position, node) in nodes.iter().enumerate() {
        for dependency in &node.dependencies {
            match index.get(dependency) {
                Some(&target) => {
                    indegrees[position] += 1;
                    dependents[target].push(position);
                    edges[position].push(target);
                }
                None if is_satisfied(*dependency) => {}
                None => errors.push(GraphError::MissingDependency {
                    requester: node.id.to_string(),
                    missing: dependency.to_string(),
                }),
            }
        }
    }

    let mut ready: BTreeSet<usize> = indegrees
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(position, _)| position)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(position) = ready.pop_first() {
        order.push(position);
        for &dependent in &dependents[position] {
            indegrees[dependent] = indegrees[dependent].saturating_sub(1);
            if indegrees[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < nodes.len() {
        let remaining: BTreeSet<usize> = (0..nodes.len())
            .filter(|position| indegrees[*position] > 0)
            .collect();
        for cycle in find_cycles(&remaining, &edges) {
            errors.push(GraphError::CyclicDependency {
                cycle: cycle
                    .into_iter()
                    .map(|position| nodes[position].id.to_string())
                    .collect(),
            });
        }
    }

    if errors.is_empty() {
        Ok(order)
    } else {
        Err(errors)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

fn find_cycles(remaining: &BTreeSet<usize>, edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; edges.len()];
    let mut cycles = Vec::new();
    let mut path = Vec::new();
    for &start in remaining {
        if marks[start] == Mark::Unvisited {
            visit(start, remaining, edges, &mut marks, &mut path, &mut cycles);
        }
    }
    cycles
}

fn visit(
    node: usize,
    remaining: &BTreeSet<usize>,
    edges: &[Vec<usize>],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
    cycles: &mut Vec<Vec<usize>>,
) {
    marks[node] = Mark::OnPath;
    path.push(node);
    for &next in &edges[node] {
        if !remaining.contains(&next) {
            continue;
        }
        match marks[next] {
            Mark::Unvisited => visit(next, remaining, edges, marks, path, cycles),
            Mark::OnPath => {
                if let Some(start) = path.iter().position(|entry| *entry == next) {
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    cycles.push(cycle);
                }
            }
            Mark::Done => {}
        }
    }
    path.pop();
    marks[node] = Mark::Done;
}

/// Descriptors needed by `roots`: the roots plus every transitive
/// dependency found in `available`, in `available` order.
///
/// Returns the first root id not present in `available` as the error.
/// Transitive dependencies missing from `available` are left out so the
/// loader can report them with their requester.
pub fn dependency_closure<'d, 'r>(
    roots: impl IntoIterator<Item = &'r str>,
    available: &'d [ExtensionDescriptor],
) -> Result<Vec<&'d ExtensionDescriptor>, String> {
    let by_id: BTreeMap<&str, usize> = available
        .iter()
        .enumerate()
        .map(|(position, descriptor)| (descriptor.id.as_str(), position))
        .collect();

    let mut selected = BTreeSet::new();
    let mut pending = Vec::new();
    for root in roots {
        let position = by_id.get(root).copied().ok_or_else(|| root.to_string())?;
        pending.push(position);
    }
    while let Some(position) = pending.pop() {
        if !selected.insert(position) {
            continue;
        }
        for dependency in &available[position].dependencies {
            if let Some(&target) = by_id.get(dependency.id.as_str()) {
                pending.push(target);
            }
        }
    }
    Ok(selected
        .into_iter()
        .map(|position| &available[position])
        .collect())
}

/// Missing dependencies and cycles inside a closure built by
/// [`dependency_closure`]. Empty when the closure can be loaded.
pub fn closure_errors(closure: &[&ExtensionDescriptor]) -> Vec<GraphError> {
    let nodes: Vec<DependencyNode<'_>> = closure
        .iter()
        .map(|descriptor| DependencyNode::from_descriptor(descriptor))
        .collect();
    topological_order(&nodes, |_| false).err().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{
        closure_errors, dependency_closure, topological_order, DependencyNode, GraphError,
    };
    use crate::extension::manifest::ExtensionDescriptor;

    fn ids<'a>(nodes: &[DependencyNode<'a>], order: &[usize]) -> Vec<&'a str> {
        order.iter().map(|position| nodes[*position].id).collect()
    }

    #[test]
    fn orders_dependencies_first_with_stable_ties() {
        let nodes = vec![
            DependencyNode::new("viewer", vec!["cornerstone", "default"]),
            DependencyNode::new("measurements", vec![]),
            DependencyNode::new("cornerstone", vec!["default"]),
            DependencyNode::new("default", vec![]),
        ];
        let order = topological_order(&nodes, |_| false).expect("acyclic graph");
        assert_eq!(
            ids(&nodes, &order),
            vec!["measurements", "default", "cornerstone", "viewer"]
        );
    }

    #[test]
    fn satisfied_dependencies_impose_no_edge() {
        let nodes = vec![DependencyNode::new("tools", vec!["default"])];
        let order = topological_order(&nodes, |id| id == "default").expect("default is loaded");
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn reports_every_missing_dependency_and_cycle() {
        let nodes = vec![
            DependencyNode::new("a", vec!["b"]),
            DependencyNode::new("b", vec!["a"]),
            DependencyNode::new("c", vec!["ghost"]),
            DependencyNode::new("d", vec!["d2"]),
            DependencyNode::new("d2", vec!["d"]),
        ];
        let errors = topological_order(&nodes, |_| false).expect_err("graph is broken");
        assert_eq!(
            errors,
            vec![
                GraphError::MissingDependency {
                    requester: "c".to_string(),
                    missing: "ghost".to_string(),
                },
                GraphError::CyclicDependency {
                    cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
                },
                GraphError::CyclicDependency {
                    cycle: vec!["d".to_string(), "d2".to_string(), "d".to_string()],
                },
            ]
        );
        assert_eq!(errors[1].to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn nodes_downstream_of_a_cycle_are_not_reported_as_cycles() {
        let nodes = vec![
            DependencyNode::new("x", vec!["y"]),
            DependencyNode::new("y", vec!["x"]),
            DependencyNode::new("z", vec!["x"]),
        ];
        let errors = topological_order(&nodes, |_| false).expect_err("cycle");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn closure_pulls_transitive_dependencies() {
        let available = vec![
            ExtensionDescriptor::new("default", "1.0.0"),
            ExtensionDescriptor::new("cornerstone", "1.0.0").depends_on("default"),
            ExtensionDescriptor::new("seg", "1.0.0").depends_on("cornerstone"),
            ExtensionDescriptor::new("unused", "1.0.0"),
        ];
        let closure = dependency_closure(["seg"], &available).expect("known root");
        let ids: Vec<&str> = closure.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["default", "cornerstone", "seg"]);

        assert_eq!(
            dependency_closure(["nope"], &available).expect_err("unknown root"),
            "nope"
        );
    }

    #[test]
    fn closure_errors_cover_transitive_problems() {
        let available = vec![
            ExtensionDescriptor::new("a", "1.0.0").depends_on("b"),
            ExtensionDescriptor::new("b", "1.0.0").depends_on("a"),
            ExtensionDescriptor::new("c", "1.0.0").depends_on("d"),
            ExtensionDescriptor::new("d", "1.0.0").depends_on("ghost"),
            ExtensionDescriptor::new("e", "1.0.0"),
        ];

        let cyclic = dependency_closure(["a"], &available).expect("a is available");
        assert!(matches!(
            closure_errors(&cyclic).as_slice(),
            [GraphError::CyclicDependency { .. }]
        ));

        let missing = dependency_closure(["c"], &available).expect("c is available");
        assert_eq!(
            closure_errors(&missing),
            vec![GraphError::MissingDependency {
                requester: "d".to_string(),
                missing: "ghost".to_string(),
            }]
        );

        let clean = dependency_closure(["e"], &available).expect("e is available");
        assert!(closure_errors(&clean).is_empty());
    }
}
