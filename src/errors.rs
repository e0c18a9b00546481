//! Error types for the branchvir crate.
//!
//! Each stage of the pipeline has its own error enum:
//!
//! - `ParseError`: Errors while turning an expression string into the source-level IR
//! - `ConvertError`: Errors while lowering the source-level IR into branch IR
//! - `OptimizeError`: Errors raised by the optimizer, its registry or its cost model
//! - `EvalError`: Errors while evaluating branch IR
//! - `ValidationError`: A function that violates the IR validity rules
//! - `PipelineError`: High-level errors when working with a whole `Program`
//!
//! Each error type implements the standard Error trait and provides detailed error messages.

use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur while building the source-level IR from an expression string.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Error when parsing the expression string with evalexpr
    #[error("Failed to build evalexpr tree: {0}")]
    Evalexpr(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when encountering an operator that has no source-level counterpart
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when a constant is neither numeric nor boolean
    #[error("Expected numeric or boolean constant: {0}")]
    ConstOperator(String),
    /// Error when a function call has the wrong number of arguments
    #[error("Function {name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
}

/// Errors that can occur while lowering source-level IR into branch IR.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    /// The source construct has no branch-IR lowering
    #[error("Structural error: cannot lower {kind} into branch IR")]
    Structural { kind: &'static str },
}

/// Errors raised while optimizing a branch-IR function.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    /// A handler the optimizer depends on was not registered
    #[error("No handler registered for operation {0}")]
    MissingHandler(String),
    /// The optimizer configuration is unusable
    #[error("Invalid optimizer configuration: {0}")]
    InvalidConfig(String),
    /// The cost model was asked to judge something other than a `Parallel` operation
    #[error("Expected a Parallel operation, got {0}")]
    NotParallel(String),
}

/// Errors that can occur while evaluating branch IR.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// A variable that is neither bound nor a placeholder in scope
    #[error("Unbound variable: {0}")]
    UnboundVariable(String),
    /// An operation the evaluator has no semantics for
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// An operation received the wrong number of inputs
    #[error("Operation {name} expects {expected} input(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },
    /// Operand shapes cannot be combined
    #[error("Shape error in {op}: {message}")]
    Shape { op: String, message: String },
    /// An operation is missing an attribute it needs to be evaluated
    #[error("Operation {op} is missing attribute {attribute}")]
    MissingAttribute { op: String, attribute: String },
}

/// Violations of the branch-IR validity rules.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The function has an empty name
    #[error("Function name is empty")]
    EmptyName,
    /// The function declares no parameters
    #[error("Function {0} has no parameters")]
    NoParameters(String),
    /// A parameter has an empty name
    #[error("Parameter #{0} has an empty name")]
    EmptyParameterName(usize),
    /// A parameter has an empty type name
    #[error("Parameter {0} has an empty type name")]
    EmptyTypeName(String),
    /// Two parameters share a name
    #[error("Duplicate parameter: {0}")]
    DuplicateParameter(String),
    /// A parameter uses a name reserved for combination placeholders
    #[error("Parameter name {0} is reserved")]
    ReservedParameter(String),
    /// A variable that is neither a parameter nor a placeholder in scope
    #[error("Unbound variable: {0}")]
    UnboundVariable(String),
    /// An operation name outside the registry allow-list
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

/// High-level errors that can occur when working with a `Program`.
///
/// This enum wraps the errors of every pipeline stage so that callers can
/// use `?` across parsing, lowering, optimization and evaluation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Error when parsing the expression string
    #[error("Failed to parse expression")]
    Parse(#[from] ParseError),
    /// Error when lowering into branch IR
    #[error("Failed to lower expression")]
    Convert(#[from] ConvertError),
    /// Error when optimizing the branch IR
    #[error("Failed to optimize function")]
    Optimize(#[from] OptimizeError),
    /// Error when evaluating a function
    #[error("Failed to evaluate function")]
    Eval(#[from] EvalError),
    /// Error when a function fails validation
    #[error("Invalid function")]
    Validation(#[from] ValidationError),
    /// Error when the number of inputs does not match the number of parameters
    #[error("Invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
}
