//! Handler for `Power`.
//!
//! - `x ^ 1 → x`
//! - `x ^ 0 → 1`
//! - constant bases and exponents fold when the result is finite

use super::{folded, has_arity, OperationHandler};
use crate::expr::{Expr, ExprRef, Operation};

pub struct PowerHandler;

impl OperationHandler for PowerHandler {
    fn name(&self) -> &'static str {
        "Power"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        if !has_arity(operation, 2) {
            return None;
        }
        let (base, exponent) = (&operation.inputs[0], &operation.inputs[1]);
        match (base.as_number(), exponent.as_number()) {
            (Some(b), Some(e)) => folded("Power", b.powf(e)),
            (_, Some(e)) if e == 1.0 => Some(base.clone()),
            (_, Some(e)) if e == 0.0 => Some(Expr::number(1.0)),
            _ => None,
        }
    }
}
