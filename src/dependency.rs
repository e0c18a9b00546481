//! Dependency analysis over branch-IR nodes.
//!
//! [`build_graph`] records two kinds of edges between nodes, identified by
//! their `Arc` pointer:
//!
//! - structural edges from an operation to each of its inputs and from a
//!   branch to its source and alternatives
//! - reuse edges from a variable occurrence to the previous occurrence of the
//!   same name
//!
//! [`partition`] greedily splits a list of expressions into groups whose
//! members have no direct dependency (in either direction) on each other.
//! A single group means every expression can already run side by side, so
//! there is nothing to split.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::expr::{Expr, ExprRef};

/// Identity of a node in a dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn of(expr: &ExprRef) -> Self {
        NodeId(Arc::as_ptr(expr) as usize)
    }
}

/// Directed "depends on" relation between nodes.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    edges: HashMap<NodeId, HashSet<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `dependent` depends on `dependency`.
    pub fn add_dependency(&mut self, dependent: &ExprRef, dependency: &ExprRef) {
        self.edges
            .entry(NodeId::of(dependent))
            .or_default()
            .insert(NodeId::of(dependency));
    }

    /// True if `dependent` directly depends on `dependency`.
    pub fn has_dependency(&self, dependent: &ExprRef, dependency: &ExprRef) -> bool {
        self.edges
            .get(&NodeId::of(dependent))
            .is_some_and(|deps| deps.contains(&NodeId::of(dependency)))
    }

    /// True if either node directly depends on the other.
    pub fn are_related(&self, a: &ExprRef, b: &ExprRef) -> bool {
        self.has_dependency(a, b) || self.has_dependency(b, a)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }
}

/// Builds the dependency graph of a list of root expressions.
///
/// Variables are tracked across all roots: every occurrence of a name (a
/// distinct node) depends on the previous one and then becomes the latest
/// definition.
pub fn build_graph(roots: &[ExprRef]) -> DependencyGraph {
    let mut builder = GraphBuilder::default();
    for root in roots {
        builder.analyze(root);
    }
    debug!(
        "Dependency graph over {} roots: {} edges",
        roots.len(),
        builder.graph.edge_count()
    );
    builder.graph
}

#[derive(Default)]
struct GraphBuilder {
    graph: DependencyGraph,
    definitions: HashMap<String, ExprRef>,
    visited: HashSet<NodeId>,
}

impl GraphBuilder {
    fn analyze(&mut self, expr: &ExprRef) {
        if !self.visited.insert(NodeId::of(expr)) {
            return;
        }
        match &**expr {
            Expr::Constant(_) => {}
            Expr::Variable(name) => {
                if let Some(previous) = self.definitions.insert(name.clone(), expr.clone()) {
                    self.graph.add_dependency(expr, &previous);
                }
            }
            Expr::Operation(operation) => {
                for input in &operation.inputs {
                    self.graph.add_dependency(expr, input);
                    self.analyze(input);
                }
            }
            Expr::Branch(branch) => {
                self.graph.add_dependency(expr, &branch.source);
                self.analyze(&branch.source);
                for alternative in &branch.alternatives {
                    self.graph.add_dependency(expr, alternative);
                    self.analyze(alternative);
                }
            }
        }
    }
}

/// Splits `exprs` into groups of mutually independent expressions.
///
/// Greedy and order dependent: the first unassigned expression opens a
/// group, then every later unassigned expression that is unrelated to all
/// members so far joins it. Every expression lands in exactly one group.
pub fn partition(exprs: &[ExprRef], graph: &DependencyGraph) -> Vec<Vec<ExprRef>> {
    partition_indices(exprs, graph)
        .into_iter()
        .map(|group| group.into_iter().map(|i| exprs[i].clone()).collect())
        .collect()
}

/// Same as [`partition`], returning positions in `exprs`.
pub fn partition_indices(exprs: &[ExprRef], graph: &DependencyGraph) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; exprs.len()];
    let mut groups = Vec::new();

    for start in 0..exprs.len() {
        if assigned[start] {
            continue;
        }
        assigned[start] = true;
        let mut group = vec![start];
        for candidate in start + 1..exprs.len() {
            if assigned[candidate] {
                continue;
            }
            let independent = group
                .iter()
                .all(|&member| !graph.are_related(&exprs[member], &exprs[candidate]));
            if independent {
                assigned[candidate] = true;
                group.push(candidate);
            }
        }
        groups.push(group);
    }
    groups
}
