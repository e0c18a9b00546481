//! Source-level expression IR.
//!
//! This is the tree produced by front ends (see [`crate::parse`]) before it is
//! lowered into branch IR by [`crate::convert`]. It is closer to what a user
//! writes: binary and unary operators, method calls, conditionals, and the
//! loop/reduction constructs that have no branch-IR lowering.
//!
//! Sub-trees are shared through `VirRef = Arc<VirExpr>`; the converter
//! memoizes on node identity, so a sub-tree referenced twice is lowered once.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::expr::{Constant, TypeInfo};

pub type VirRef = Arc<VirExpr>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl BinaryOperator {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "Add",
            BinaryOperator::Subtract => "Subtract",
            BinaryOperator::Multiply => "Multiply",
            BinaryOperator::Divide => "Divide",
            BinaryOperator::Power => "Power",
            BinaryOperator::Equal => "Equal",
            BinaryOperator::NotEqual => "NotEqual",
            BinaryOperator::LessThan => "LessThan",
            BinaryOperator::LessThanOrEqual => "LessThanOrEqual",
            BinaryOperator::GreaterThan => "GreaterThan",
            BinaryOperator::GreaterThanOrEqual => "GreaterThanOrEqual",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Power => "^",
            BinaryOperator::Equal => "==",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Negate,
    Abs,
    Sqrt,
    Plus,
    LogicalNot,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
}

impl UnaryOperator {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOperator::Negate => "Negate",
            UnaryOperator::Abs => "Abs",
            UnaryOperator::Sqrt => "Sqrt",
            UnaryOperator::Plus => "Plus",
            UnaryOperator::LogicalNot => "LogicalNot",
            UnaryOperator::Sin => "Sin",
            UnaryOperator::Cos => "Cos",
            UnaryOperator::Tan => "Tan",
            UnaryOperator::Exp => "Exp",
            UnaryOperator::Log => "Log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionKind {
    Sum,
    Product,
    Max,
    Min,
}

/// A node of the source-level IR.
#[derive(Debug, Clone, PartialEq)]
pub enum VirExpr {
    Constant(Constant),
    Variable(String),
    Binary {
        op: BinaryOperator,
        left: VirRef,
        right: VirRef,
    },
    Unary {
        op: UnaryOperator,
        operand: VirRef,
    },
    MethodCall {
        method: String,
        arguments: Vec<VirRef>,
    },
    Conditional {
        condition: VirRef,
        when_true: VirRef,
        when_false: VirRef,
    },
    Loop {
        variable: String,
        start: VirRef,
        end: VirRef,
        step: VirRef,
        body: VirRef,
    },
    Reduction {
        kind: ReductionKind,
        expression: VirRef,
    },
}

impl VirExpr {
    pub fn number(value: f64) -> VirRef {
        Arc::new(VirExpr::Constant(Constant::Number(value)))
    }

    pub fn boolean(value: bool) -> VirRef {
        Arc::new(VirExpr::Constant(Constant::Bool(value)))
    }

    pub fn variable(name: impl Into<String>) -> VirRef {
        Arc::new(VirExpr::Variable(name.into()))
    }

    pub fn binary(op: BinaryOperator, left: VirRef, right: VirRef) -> VirRef {
        Arc::new(VirExpr::Binary { op, left, right })
    }

    pub fn unary(op: UnaryOperator, operand: VirRef) -> VirRef {
        Arc::new(VirExpr::Unary { op, operand })
    }

    pub fn call(method: impl Into<String>, arguments: Vec<VirRef>) -> VirRef {
        Arc::new(VirExpr::MethodCall {
            method: method.into(),
            arguments,
        })
    }

    pub fn conditional(condition: VirRef, when_true: VirRef, when_false: VirRef) -> VirRef {
        Arc::new(VirExpr::Conditional {
            condition,
            when_true,
            when_false,
        })
    }
}

impl fmt::Display for VirExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirExpr::Constant(constant) => write!(f, "{}", constant),
            VirExpr::Variable(name) => f.write_str(name),
            VirExpr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            VirExpr::Unary { op, operand } => write!(f, "{}({})", op.name(), operand),
            VirExpr::MethodCall { method, arguments } => {
                write!(f, "{}({})", method, arguments.iter().join(", "))
            }
            VirExpr::Conditional {
                condition,
                when_true,
                when_false,
            } => write!(f, "({} ? {} : {})", condition, when_true, when_false),
            VirExpr::Loop {
                variable,
                start,
                end,
                step,
                body,
            } => write!(
                f,
                "for {} in {}..{} step {} {{ {} }}",
                variable, start, end, step, body
            ),
            VirExpr::Reduction { kind, expression } => write!(f, "{:?}({})", kind, expression),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirParameter {
    pub name: String,
    pub ty: TypeInfo,
}

/// A named source-level function.
#[derive(Debug, Clone, PartialEq)]
pub struct VirFunction {
    pub name: String,
    pub parameters: Vec<VirParameter>,
    pub body: VirRef,
}

impl VirFunction {
    /// A function whose parameters are all `double` scalars.
    pub fn scalar(name: &str, parameters: &[&str], body: VirRef) -> Self {
        Self {
            name: name.to_string(),
            parameters: parameters
                .iter()
                .map(|p| VirParameter {
                    name: p.to_string(),
                    ty: TypeInfo::scalar("double"),
                })
                .collect(),
            body,
        }
    }
}

impl fmt::Display for VirFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) = {}",
            self.name,
            self.parameters.iter().map(|p| &p.name).join(", "),
            self.body
        )
    }
}
