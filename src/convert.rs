//! Lowering of source-level IR into branch IR.
//!
//! Every source construct maps onto one branch-IR node:
//!
//! - constants and variables are copied
//! - binary and unary operators become operations named after the operator
//! - method calls become operations named after the callee
//! - conditionals become a `Branch` whose combination is
//!   `Select(condition, parallelResult_0, parallelResult_1)`
//!
//! Loops and reductions have no lowering and fail with
//! [`ConvertError::Structural`].
//!
//! The converter remembers every source node it has lowered, keyed by node
//! identity, so a sub-tree that is shared in the source stays shared in the
//! output.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::errors::ConvertError;
use crate::expr::{placeholder, Branch, Expr, ExprRef, Function, Op, Operation, Parameter, CONDITION};
use crate::vir::{VirExpr, VirFunction, VirRef};

/// Lowers a source-level function into branch IR.
///
/// Parameters keep their names and types; the body is lowered recursively.
///
/// # Errors
/// * `ConvertError::Structural` if the body contains a loop or a reduction
pub fn convert(function: &VirFunction) -> Result<Function, ConvertError> {
    let mut converter = Converter::new();
    let body = converter.lower(&function.body)?;
    debug!(
        "Lowered {} into branch IR ({} distinct source nodes)",
        function.name,
        converter.memo.len()
    );
    Ok(Function {
        name: function.name.clone(),
        parameters: function
            .parameters
            .iter()
            .map(|p| Parameter {
                name: p.name.clone(),
                ty: p.ty.clone(),
            })
            .collect(),
        body,
    })
}

/// Stateful lowering with a memo table keyed by source node identity.
#[derive(Debug, Default)]
pub struct Converter {
    memo: HashMap<usize, (VirRef, ExprRef)>,
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowers one source expression.
    pub fn lower(&mut self, expr: &VirRef) -> Result<ExprRef, ConvertError> {
        let id = Arc::as_ptr(expr) as usize;
        if let Some((_, lowered)) = self.memo.get(&id) {
            return Ok(lowered.clone());
        }

        let lowered = match &**expr {
            VirExpr::Constant(constant) => Arc::new(Expr::Constant(*constant)),
            VirExpr::Variable(name) => Expr::variable(name.as_str()),
            VirExpr::Binary { op, left, right } => {
                let left = self.lower(left)?;
                let right = self.lower(right)?;
                Expr::operation(op.name(), vec![left, right])
            }
            VirExpr::Unary { op, operand } => {
                let operand = self.lower(operand)?;
                Expr::operation(op.name(), vec![operand])
            }
            VirExpr::MethodCall { method, arguments } => {
                let inputs = arguments
                    .iter()
                    .map(|argument| self.lower(argument))
                    .collect::<Result<Vec<_>, _>>()?;
                Operation::new(callee_op(method), inputs).into_expr()
            }
            VirExpr::Conditional {
                condition,
                when_true,
                when_false,
            } => Branch {
                source: self.lower(condition)?,
                alternatives: vec![self.lower(when_true)?, self.lower(when_false)?],
                combination: select_combination(),
            }
            .into_expr(),
            VirExpr::Loop { .. } => return Err(ConvertError::Structural { kind: "loop" }),
            VirExpr::Reduction { .. } => {
                return Err(ConvertError::Structural { kind: "reduction" })
            }
        };

        self.memo.insert(id, (expr.clone(), lowered.clone()));
        Ok(lowered)
    }
}

/// `Select(condition, parallelResult_0, parallelResult_1)`
pub fn select_combination() -> ExprRef {
    Expr::operation(
        Op::Select,
        vec![Expr::variable(CONDITION), placeholder(0), placeholder(1)],
    )
}

/// Operation for a method call; well-known math functions map onto built-in operations.
fn callee_op(method: &str) -> Op {
    let short = method.rsplit('.').next().unwrap_or(method);
    match short.to_ascii_lowercase().as_str() {
        "sin" => Op::Sin,
        "cos" => Op::Cos,
        "tan" => Op::Tan,
        "exp" => Op::Exp,
        "log" | "ln" => Op::Log,
        "sqrt" => Op::Sqrt,
        "abs" => Op::Abs,
        "pow" => Op::Power,
        "matmul" => Op::MatMul,
        _ => Op::from(method),
    }
}
