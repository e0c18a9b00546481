//! Operation handlers and the registry that holds them.
//!
//! A handler knows two things about one operation name: how to simplify an
//! occurrence of it (constant folding, identity rules) and its unit cost for
//! the cost model. Handlers are registered explicitly; the registry also
//! keeps the allow-list of operation names a valid function may use.
//!
//! Handlers never fail. An occurrence they cannot simplify (wrong arity,
//! division by a constant zero, a fold that would produce NaN or infinity)
//! is returned unchanged, with a warning where the input looks malformed.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use log::{debug, error, warn};

use crate::errors::OptimizeError;
use crate::expr::{Expr, ExprRef, Operation};

pub mod arithmetic;
pub mod exp;
pub mod ln;
pub mod matmul;
pub mod pow;
pub mod sqrt;
pub mod trigonometric;

/// Unit cost of operations without a handler.
pub const DEFAULT_UNIT_COST: f64 = 1.0;

/// Simplification rules and cost of one operation.
pub trait OperationHandler: Send + Sync {
    /// Operation name this handler is registered under.
    fn name(&self) -> &'static str;

    /// Returns a simpler equivalent of `operation`, or `None` to keep it.
    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        let _ = operation;
        None
    }

    /// Unit cost of one application of the operation.
    fn cost(&self) -> f64 {
        DEFAULT_UNIT_COST
    }
}

/// Names every registry admits, whether or not a handler exists for them.
const STRUCTURAL_OPERATIONS: &[&str] = &[
    "Plus",
    "LogicalNot",
    "Equal",
    "NotEqual",
    "LessThan",
    "LessThanOrEqual",
    "GreaterThan",
    "GreaterThanOrEqual",
    "Select",
    "Concatenate",
    "Compose",
    "MergedBranch",
    "Parallel",
    "ParallelGroup",
    "Serial",
    "SequentialComposition",
];

/// Explicitly populated table of operation handlers plus the operation allow-list.
pub struct OperationRegistry {
    handlers: HashMap<String, Box<dyn OperationHandler>>,
    allowed: BTreeSet<String>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers = self.handlers.keys().collect::<Vec<_>>();
        handlers.sort();
        f.debug_struct("OperationRegistry")
            .field("handlers", &handlers)
            .field("allowed", &self.allowed)
            .finish()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

impl OperationRegistry {
    /// A registry without handlers that admits only the structural operations.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            allowed: STRUCTURAL_OPERATIONS
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }

    /// A registry with handlers for every built-in arithmetic, transcendental
    /// and matrix operation.
    pub fn with_default_handlers() -> Self {
        let mut registry = Self::new();
        registry
            .register(arithmetic::AddHandler)
            .register(arithmetic::SubtractHandler)
            .register(arithmetic::MultiplyHandler)
            .register(arithmetic::DivideHandler)
            .register(arithmetic::NEGATE)
            .register(arithmetic::ABS)
            .register(pow::PowerHandler)
            .register(sqrt::SQRT)
            .register(exp::EXP)
            .register(ln::LOG)
            .register(trigonometric::SIN)
            .register(trigonometric::COS)
            .register(trigonometric::TAN)
            .register(matmul::MatMulHandler)
            .register(matmul::MatMulBlockHandler)
            .register(matmul::MatMulCombineHandler);
        registry
    }

    /// Adds (or replaces) a handler and admits its operation name.
    pub fn register<H: OperationHandler + 'static>(&mut self, handler: H) -> &mut Self {
        let name = handler.name().to_string();
        self.allowed.insert(name.clone());
        if self.handlers.insert(name.clone(), Box::new(handler)).is_some() {
            debug!("Replaced handler for {}", name);
        }
        self
    }

    /// Removes the handler for `name`; the name stays on the allow-list.
    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn OperationHandler>> {
        self.handlers.remove(name)
    }

    /// Admits an operation name that has no handler, e.g. a custom method call.
    pub fn allow(&mut self, name: &str) -> &mut Self {
        self.allowed.insert(name.to_string());
        self
    }

    pub fn handler(&self, name: &str) -> Option<&dyn OperationHandler> {
        self.handlers.get(name).map(|handler| handler.as_ref())
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    /// Fails with `MissingHandler` for the first name without a handler.
    pub fn require(&self, names: &[&str]) -> Result<(), OptimizeError> {
        match names.iter().find(|name| !self.handlers.contains_key(**name)) {
            Some(missing) => {
                error!("No handler registered for required operation {}", missing);
                Err(OptimizeError::MissingHandler(missing.to_string()))
            }
            None => Ok(()),
        }
    }

    /// Applies the handler for `operation`, if any.
    pub fn simplify(&self, operation: &Operation) -> Option<ExprRef> {
        self.handler(operation.op.name())?.optimize(operation)
    }

    /// `(name, unit cost)` of every registered handler.
    pub fn unit_costs(&self) -> impl Iterator<Item = (&str, f64)> {
        self.handlers
            .iter()
            .map(|(name, handler)| (name.as_str(), handler.cost()))
    }
}

/// Handler for a one-input element-wise function.
///
/// Folds constant inputs through `apply` when the result is finite.
#[derive(Debug, Clone, Copy)]
pub struct UnaryHandler {
    pub name: &'static str,
    pub cost: f64,
    pub apply: fn(f64) -> f64,
}

impl OperationHandler for UnaryHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        if !has_arity(operation, 1) {
            return None;
        }
        let value = operation.inputs[0].as_number()?;
        folded(self.name, (self.apply)(value))
    }

    fn cost(&self) -> f64 {
        self.cost
    }
}

/// Checks the input count, warning on mismatch.
pub(crate) fn has_arity(operation: &Operation, expected: usize) -> bool {
    if operation.inputs.len() == expected {
        return true;
    }
    warn!(
        "{} expects {} input(s), got {}; leaving it unchanged",
        operation.op,
        expected,
        operation.inputs.len()
    );
    false
}

/// A folded constant, or `None` if folding would produce NaN or infinity.
pub(crate) fn folded(name: &str, value: f64) -> Option<ExprRef> {
    if value.is_finite() {
        Some(Expr::number(value))
    } else {
        debug!("Not folding {}: result {} is not finite", name, value);
        None
    }
}

/// Numeric values of all inputs if every input is a constant.
pub(crate) fn constant_inputs(operation: &Operation) -> Option<Vec<f64>> {
    operation
        .inputs
        .iter()
        .map(|input| input.as_number())
        .collect()
}
