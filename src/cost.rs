//! Serial versus parallel cost estimation.
//!
//! `Cost(expr)` is the unit cost of the node's operation plus the cost of
//! its children; leaves are free. For a `Parallel` plan:
//!
//! ```text
//! serial   = sum of Cost(member) over every member of every group
//! parallel = max over groups of (sum of Cost(member) in the group)
//!          + PARALLELIZATION_OVERHEAD + COMMUNICATION_COST
//!          + Cost(Combination)
//! ```
//!
//! The plan is worth it only if `parallel < serial`.

use std::collections::HashMap;

use log::debug;

use crate::errors::OptimizeError;
use crate::expr::{Expr, ExprRef, Op, Operation};
use crate::operators::{OperationRegistry, DEFAULT_UNIT_COST};

/// Fixed price of dispatching a parallel plan.
pub const PARALLELIZATION_OVERHEAD: f64 = 5.0;

/// Fixed price of collecting the group results.
pub const COMMUNICATION_COST: f64 = 2.0;

/// Decides whether a `Parallel` plan should be kept.
///
/// The optimizer is generic over this trait so that callers can plug in a
/// measured model, or force a decision in tests.
pub trait CostEstimator: Send + Sync {
    fn is_beneficial(&self, parallel: &Operation) -> Result<bool, OptimizeError>;
}

/// Unit-cost table with the fixed overheads above.
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    unit_costs: HashMap<String, f64>,
}

impl Default for CostModel {
    fn default() -> Self {
        Self::from_registry(&OperationRegistry::with_default_handlers())
    }
}

impl CostModel {
    /// Takes the unit cost of every handler in `registry`.
    pub fn from_registry(registry: &OperationRegistry) -> Self {
        Self {
            unit_costs: registry
                .unit_costs()
                .map(|(name, cost)| (name.to_string(), cost))
                .collect(),
        }
    }

    /// Sets the unit cost of one operation.
    pub fn with_unit_cost(mut self, name: &str, cost: f64) -> Self {
        self.unit_costs.insert(name.to_string(), cost);
        self
    }

    pub fn unit_cost(&self, op: &Op) -> f64 {
        self.unit_costs
            .get(op.name())
            .copied()
            .unwrap_or(DEFAULT_UNIT_COST)
    }

    /// Recursive cost of an expression. Attribute expressions are not counted.
    pub fn cost(&self, expr: &ExprRef) -> f64 {
        match &**expr {
            Expr::Constant(_) | Expr::Variable(_) => 0.0,
            Expr::Operation(operation) => {
                self.unit_cost(&operation.op)
                    + operation.inputs.iter().map(|input| self.cost(input)).sum::<f64>()
            }
            Expr::Branch(branch) => {
                self.cost(&branch.source)
                    + branch.alternatives.iter().map(|a| self.cost(a)).sum::<f64>()
                    + self.cost(&branch.combination)
            }
        }
    }

    /// Cost of running the plan's groups one after another.
    ///
    /// Sums the members of every group, which are the inputs the plan was
    /// split from (or the blocks that replace a matrix product). The
    /// `ParallelGroup` wrappers themselves cost nothing.
    pub fn serial_cost(&self, parallel: &Operation) -> f64 {
        parallel
            .inputs
            .iter()
            .map(|group| self.group_cost(group))
            .sum()
    }

    /// Cost of running the plan's groups side by side and combining the results.
    pub fn parallel_cost(&self, parallel: &Operation) -> f64 {
        let slowest = parallel
            .inputs
            .iter()
            .map(|group| self.group_cost(group))
            .fold(0.0, f64::max);
        let combination = parallel.combination().map_or(0.0, |c| self.cost(c));
        slowest + PARALLELIZATION_OVERHEAD + COMMUNICATION_COST + combination
    }

    fn group_cost(&self, group: &ExprRef) -> f64 {
        match &**group {
            Expr::Operation(operation) if operation.op == Op::ParallelGroup => {
                operation.inputs.iter().map(|member| self.cost(member)).sum()
            }
            _ => self.cost(group),
        }
    }
}

impl CostEstimator for CostModel {
    fn is_beneficial(&self, parallel: &Operation) -> Result<bool, OptimizeError> {
        if parallel.op != Op::Parallel {
            return Err(OptimizeError::NotParallel(parallel.op.name().to_string()));
        }
        let serial = self.serial_cost(parallel);
        let parallel_cost = self.parallel_cost(parallel);
        debug!(
            "Parallel plan over {} groups: serial cost {}, parallel cost {}",
            parallel.inputs.len(),
            serial,
            parallel_cost
        );
        Ok(parallel_cost < serial)
    }
}
