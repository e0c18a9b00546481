//! Common-subexpression elimination, branch merging and parallel planning for
//! branch-oriented expression IR.
//!
//! This crate lowers expressions into a small intermediate representation
//! whose conditionals are explicit `Branch` nodes, and rewrites that IR:
//!
//! - structurally identical sub-expressions are shared
//! - constants are folded and identity operations removed
//! - nested branches are composed, shared operations are factored out of
//!   branch alternatives and duplicate alternatives are merged
//! - independent inputs of `Add`, `Multiply`, `MatMul`, `Subtract` and
//!   `Divide`, and independent branch alternatives, are grouped into
//!   `Parallel` plans when a cost model says it pays off, else into `Serial` ones
//!
//! Expression strings are parsed with [evalexpr](https://github.com/ISibboI/evalexpr);
//! a reference evaluator built on [ndarray](https://github.com/rust-ndarray/ndarray)
//! checks that optimized functions compute what the originals did.
//!
//! # Example
//!
//! ```rust
//! use branchvir::Program;
//!
//! let program = Program::new("f", "if(x > y, sin(x), sin(y))").unwrap();
//!
//! // The shared Sin was moved out of the branch
//! assert!(program.optimized().body.to_string().starts_with("Sin(Branch("));
//!
//! let value = program.eval(&[1.0, 2.0]).unwrap();
//! assert_eq!(value.as_scalar(), Some(2.0_f64.sin()));
//! ```

pub use config::OptimizerConfig;
pub use expr::{Expr, ExprRef, Function, Op};
pub use opt::Optimizer;
pub use program::Program;

pub mod prelude {
    pub use crate::config::OptimizerConfig;
    pub use crate::convert::convert;
    pub use crate::cost::{CostEstimator, CostModel};
    pub use crate::eval::{evaluate, Bindings, Value};
    pub use crate::expr::{Attribute, Branch, Expr, ExprRef, Function, Op, Operation};
    pub use crate::operators::{OperationHandler, OperationRegistry};
    pub use crate::opt::Optimizer;
    pub use crate::parse::build_function;
    pub use crate::program::Program;
    pub use crate::validate::validate;
}

/// Optimizer configuration
pub mod config;
/// Lowering from source-level IR into branch IR
pub mod convert;
/// Serial versus parallel cost estimation
pub mod cost;
/// Dependency graph and independent-group partitioning
pub mod dependency;
/// Error types for the various failure modes
pub mod errors;
/// Reference evaluator
pub mod eval;
/// Branch IR
pub mod expr;
/// Input grouping strategies for decomposable operations
pub mod grouping;
/// Canonical keys
pub mod key;
/// Per-operation simplification handlers and the handler registry
pub mod operators;
/// The optimizer
pub mod opt;
/// Expression strings to source-level IR
pub mod parse;
/// End-to-end pipeline
pub mod program;
/// Validity checks
pub mod validate;
/// Source-level IR
pub mod vir;
