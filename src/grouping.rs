//! Splitting an operation's inputs into groups that can be computed side by side.
//!
//! The strategy is picked from the operation:
//!
//! - **Associative** (`Add`, `Multiply`): inputs are ordered so that every
//!   input comes after the inputs it depends on, then packed into bins of at
//!   most `max_parallelism` members. A new bin starts when the current one is
//!   full or when the next input depends on (or is a dependency of) a member.
//! - **MatMul**: a product of exactly two matrices becomes four independent
//!   `MatMulBlock` quadrant products.
//! - **Generic** (everything else): like Associative, but after placing an
//!   input the bin also absorbs later inputs that are independent of every
//!   member, until it is full.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::dependency::{build_graph, DependencyGraph};
use crate::expr::{attr, Attribute, ExprRef, Op, Operation};

/// Input grouping heuristic for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingStrategy {
    Associative,
    MatMul,
    Generic,
}

impl GroupingStrategy {
    pub fn for_op(op: &Op) -> Self {
        match op {
            Op::Add | Op::Multiply => GroupingStrategy::Associative,
            Op::MatMul => GroupingStrategy::MatMul,
            _ => GroupingStrategy::Generic,
        }
    }

    /// Groups `inputs`, never putting more than `max_parallelism` inputs in one group.
    ///
    /// Every input appears in exactly one group, except for `MatMul` where
    /// the groups hold synthesized block products instead.
    pub fn group(&self, inputs: &[ExprRef], max_parallelism: usize) -> Vec<Vec<ExprRef>> {
        let capacity = max_parallelism.max(1);
        let groups = match self {
            GroupingStrategy::MatMul => return matmul_blocks(inputs),
            GroupingStrategy::Associative => bin_pack(inputs, capacity, false),
            GroupingStrategy::Generic => bin_pack(inputs, capacity, true),
        };
        debug!(
            "{:?} grouping of {} inputs: {:?}",
            self,
            inputs.len(),
            groups
        );
        groups
            .into_iter()
            .map(|group| group.into_iter().map(|i| inputs[i].clone()).collect())
            .collect()
    }
}

/// Groups the inputs of `op` with the matching strategy.
pub fn group_inputs(inputs: &[ExprRef], op: &Op, max_parallelism: usize) -> Vec<Vec<ExprRef>> {
    GroupingStrategy::for_op(op).group(inputs, max_parallelism)
}

fn bin_pack(inputs: &[ExprRef], capacity: usize, absorb_siblings: bool) -> Vec<Vec<usize>> {
    let graph = build_graph(inputs);
    let related = |a: usize, b: usize| graph.are_related(&inputs[a], &inputs[b]);
    let order = topological_order(inputs, &graph);

    let mut placed = vec![false; inputs.len()];
    let mut bins = Vec::new();
    let mut bin: Vec<usize> = Vec::new();

    for &candidate in &order {
        if placed[candidate] {
            continue;
        }
        if bin.len() >= capacity || bin.iter().any(|&member| related(member, candidate)) {
            bins.push(std::mem::take(&mut bin));
        }
        bin.push(candidate);
        placed[candidate] = true;

        if absorb_siblings {
            for &sibling in &order {
                if bin.len() >= capacity {
                    break;
                }
                if !placed[sibling] && bin.iter().all(|&member| !related(member, sibling)) {
                    bin.push(sibling);
                    placed[sibling] = true;
                }
            }
        }
    }
    if !bin.is_empty() {
        bins.push(bin);
    }
    bins
}

/// Positions of `inputs` ordered so that dependencies come first.
///
/// Only direct edges between the inputs themselves are considered; among the
/// inputs that are ready, the lowest position goes first.
fn topological_order(inputs: &[ExprRef], graph: &DependencyGraph) -> Vec<usize> {
    let n = inputs.len();
    let depends_on = |a: usize, b: usize| a != b && graph.has_dependency(&inputs[a], &inputs[b]);

    let mut remaining: BTreeSet<usize> = (0..n).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(&fallback) = remaining.iter().next() {
        let ready = remaining
            .iter()
            .copied()
            .find(|&i| !remaining.iter().any(|&j| depends_on(i, j)))
            .unwrap_or(fallback);
        remaining.remove(&ready);
        order.push(ready);
    }
    order
}

fn matmul_blocks(inputs: &[ExprRef]) -> Vec<Vec<ExprRef>> {
    if inputs.len() != 2 {
        warn!(
            "MatMul expects exactly 2 inputs, got {}; leaving it ungrouped",
            inputs.len()
        );
        return vec![inputs.to_vec()];
    }
    [(0, 0), (0, 1), (1, 0), (1, 1)]
        .into_iter()
        .map(|(row, col)| {
            vec![Operation::new(Op::MatMulBlock, inputs.to_vec())
                .with_attribute(attr::BLOCK_ROW, Attribute::Int(row))
                .with_attribute(attr::BLOCK_COL, Attribute::Int(col))
                .into_expr()]
        })
        .collect()
}
