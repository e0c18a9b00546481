//! End-to-end pipeline from an expression string to optimized branch IR.
//!
//! A [`Program`] keeps every stage around so that callers can inspect or
//! evaluate each one:
//!
//! 1. the source-level function built by [`crate::parse`]
//! 2. the branch IR produced by [`crate::convert`]
//! 3. the optimized branch IR produced by [`Optimizer`]
//!
//! The optimized function is validated against the optimizer's registry
//! before the program is handed out.
//!
//! # Example
//!
//! ```
//! use branchvir::Program;
//!
//! let program = Program::new("f", "if(x > 0, sin(x), sin(y))").unwrap();
//! let value = program.eval(&[0.0, 0.5]).unwrap();
//! assert_eq!(value.as_scalar(), Some(0.5_f64.sin()));
//! ```

use std::fmt;

use colored::Colorize;
use itertools::Itertools;
use log::info;
use ndarray::arr0;

use crate::config::OptimizerConfig;
use crate::convert::convert;
use crate::cost::CostEstimator;
use crate::errors::PipelineError;
use crate::eval::{evaluate, Bindings, Value};
use crate::expr::{node_count, Function};
use crate::opt::Optimizer;
use crate::parse::build_function;
use crate::validate::validate;
use crate::vir::VirFunction;

/// An expression carried through parsing, lowering and optimization.
pub struct Program {
    expression: String,
    source: VirFunction,
    lowered: Function,
    optimized: Function,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Expression".cyan(), self.expression)?;
        writeln!(f, "    {}: {:?}", "Variables".cyan(), self.variables().collect_vec())?;
        writeln!(f, "    {}: {:?}", "Lowered".cyan(), self.lowered)?;
        writeln!(f, "    {}: {:?}", "Optimized".cyan(), self.optimized)?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", "Expression".cyan(), self.expression)?;
        writeln!(f, "{}: {}", "Source".cyan(), self.source)?;
        writeln!(
            f,
            "{} ({} nodes): {}",
            "Branch IR".cyan(),
            node_count(&self.lowered.body),
            self.lowered
        )?;
        write!(
            f,
            "{} ({} nodes): {}",
            "Optimized".cyan(),
            node_count(&self.optimized.body),
            self.optimized
        )
    }
}

impl Program {
    /// Builds and optimizes `expression` with the default optimizer.
    ///
    /// Variables are the free identifiers of the expression, in alphabetical order.
    pub fn new(name: &str, expression: &str) -> Result<Self, PipelineError> {
        let optimizer = Optimizer::new(OptimizerConfig::default())?;
        Self::with_optimizer(name, expression, &optimizer)
    }

    /// Builds `expression` and optimizes it with `optimizer`.
    ///
    /// # Errors
    /// * `PipelineError::Parse` if the expression cannot be parsed
    /// * `PipelineError::Convert` if it has no branch-IR lowering
    /// * `PipelineError::Optimize` if the cost model rejects a plan
    /// * `PipelineError::Validation` if the result is not a valid function,
    ///   e.g. an expression without variables
    pub fn with_optimizer<C: CostEstimator>(
        name: &str,
        expression: &str,
        optimizer: &Optimizer<C>,
    ) -> Result<Self, PipelineError> {
        let source = build_function(name, expression)?;
        let lowered = convert(&source)?;
        let optimized = optimizer.optimize(&lowered)?;
        validate(&optimized, optimizer.registry())?;
        info!(
            "Optimized {}: {} -> {} nodes",
            name,
            node_count(&lowered.body),
            node_count(&optimized.body)
        );
        Ok(Self {
            expression: expression.to_string(),
            source,
            lowered,
            optimized,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn source(&self) -> &VirFunction {
        &self.source
    }

    /// Branch IR before optimization.
    pub fn lowered(&self) -> &Function {
        &self.lowered
    }

    pub fn optimized(&self) -> &Function {
        &self.optimized
    }

    /// Parameter names, in the order `eval` expects their values.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.lowered.parameter_names()
    }

    /// Binds scalar `values` to the variables in order.
    pub fn bindings(&self, values: &[f64]) -> Result<Bindings, PipelineError> {
        let expected = self.lowered.parameters.len();
        if values.len() != expected {
            return Err(PipelineError::InvalidInputLength {
                expected,
                got: values.len(),
            });
        }
        Ok(self
            .variables()
            .zip(values)
            .map(|(name, value)| (name.to_string(), arr0(*value).into_dyn()))
            .collect())
    }

    /// Evaluates the optimized function for scalar inputs.
    pub fn eval(&self, values: &[f64]) -> Result<Value, PipelineError> {
        Ok(evaluate(&self.optimized, &self.bindings(values)?)?)
    }

    /// Evaluates the unoptimized branch IR for scalar inputs.
    pub fn eval_lowered(&self, values: &[f64]) -> Result<Value, PipelineError> {
        Ok(evaluate(&self.lowered, &self.bindings(values)?)?)
    }

    /// Evaluates the optimized function for arbitrary tensor bindings.
    pub fn evaluate(&self, bindings: &Bindings) -> Result<Value, PipelineError> {
        Ok(evaluate(&self.optimized, bindings)?)
    }
}
