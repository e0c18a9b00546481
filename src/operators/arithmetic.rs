//! Handlers for `Add`, `Subtract`, `Multiply`, `Divide`, `Negate` and `Abs`.
//!
//! Rules:
//! - all-constant inputs fold (as long as the result is finite)
//! - `x + 0 → x`, `x * 1 → x` (neutral constants are dropped from n-ary sums and products)
//! - `x - 0 → x`, `x / 1 → x`
//! - `x / 0` with constant operands is left alone and reported

use log::warn;

use super::{constant_inputs, folded, has_arity, OperationHandler, UnaryHandler};
use crate::expr::{ExprRef, Operation};

pub const NEGATE: UnaryHandler = UnaryHandler {
    name: "Negate",
    cost: 1.0,
    apply: negate,
};

pub const ABS: UnaryHandler = UnaryHandler {
    name: "Abs",
    cost: 1.0,
    apply: f64::abs,
};

fn negate(value: f64) -> f64 {
    -value
}

pub struct AddHandler;

impl OperationHandler for AddHandler {
    fn name(&self) -> &'static str {
        "Add"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        fold_neutral(operation, 0.0, |acc, value| acc + value)
    }

    fn cost(&self) -> f64 {
        1.0
    }
}

pub struct MultiplyHandler;

impl OperationHandler for MultiplyHandler {
    fn name(&self) -> &'static str {
        "Multiply"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        fold_neutral(operation, 1.0, |acc, value| acc * value)
    }

    fn cost(&self) -> f64 {
        2.0
    }
}

/// Shared rules of the n-ary associative operations.
fn fold_neutral(operation: &Operation, neutral: f64, combine: fn(f64, f64) -> f64) -> Option<ExprRef> {
    if operation.inputs.len() < 2 {
        warn!(
            "{} expects at least 2 inputs, got {}; leaving it unchanged",
            operation.op,
            operation.inputs.len()
        );
        return None;
    }
    if let Some(values) = constant_inputs(operation) {
        let (first, rest) = values.split_first()?;
        return folded(operation.op.name(), rest.iter().fold(*first, |acc, v| combine(acc, *v)));
    }

    let kept: Vec<ExprRef> = operation
        .inputs
        .iter()
        .filter(|input| input.as_number() != Some(neutral))
        .cloned()
        .collect();
    match kept.len() {
        n if n == operation.inputs.len() => None,
        1 => Some(kept[0].clone()),
        _ => Some(operation.with_inputs(kept).into_expr()),
    }
}

pub struct SubtractHandler;

impl OperationHandler for SubtractHandler {
    fn name(&self) -> &'static str {
        "Subtract"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        if !has_arity(operation, 2) {
            return None;
        }
        let (left, right) = (&operation.inputs[0], &operation.inputs[1]);
        match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => folded("Subtract", a - b),
            (_, Some(b)) if b == 0.0 => Some(left.clone()),
            _ => None,
        }
    }

    fn cost(&self) -> f64 {
        1.0
    }
}

pub struct DivideHandler;

impl OperationHandler for DivideHandler {
    fn name(&self) -> &'static str {
        "Divide"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        if !has_arity(operation, 2) {
            return None;
        }
        let (left, right) = (&operation.inputs[0], &operation.inputs[1]);
        match (left.as_number(), right.as_number()) {
            (Some(_), Some(b)) if b == 0.0 => {
                warn!("Division by zero detected while folding constants; leaving it unchanged");
                None
            }
            (Some(a), Some(b)) => folded("Divide", a / b),
            (_, Some(b)) if b == 1.0 => Some(left.clone()),
            _ => None,
        }
    }

    fn cost(&self) -> f64 {
        4.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, Op};

    fn var(name: &str) -> ExprRef {
        Expr::variable(name)
    }

    fn num(value: f64) -> ExprRef {
        Expr::number(value)
    }

    fn optimize(handler: &dyn OperationHandler, inputs: Vec<ExprRef>) -> Option<ExprRef> {
        handler.optimize(&Operation::new(handler.name(), inputs))
    }

    #[test]
    fn test_subtract() {
        let x = var("x");
        let result = optimize(&SubtractHandler, vec![x.clone(), num(0.0)]).unwrap();
        assert!(std::sync::Arc::ptr_eq(&result, &x));
        assert_eq!(optimize(&SubtractHandler, vec![num(5.0), num(3.0)]), Some(num(2.0)));
        assert_eq!(optimize(&SubtractHandler, vec![num(0.0), x.clone()]), None);
        // arity mismatch is not an error
        assert_eq!(optimize(&SubtractHandler, vec![x.clone(), num(0.0), x]), None);
    }

    #[test]
    fn test_divide() {
        let x = var("x");
        assert_eq!(optimize(&DivideHandler, vec![x.clone(), num(1.0)]), Some(x.clone()));
        assert_eq!(optimize(&DivideHandler, vec![num(6.0), num(4.0)]), Some(num(1.5)));
        assert_eq!(optimize(&DivideHandler, vec![num(1.0), num(0.0)]), None);
        assert_eq!(optimize(&DivideHandler, vec![x, num(0.0)]), None);
    }

    #[test]
    fn test_add_and_multiply() {
        let x = var("x");
        let y = var("y");
        assert_eq!(optimize(&AddHandler, vec![num(2.0), num(3.0)]), Some(num(5.0)));
        assert_eq!(optimize(&AddHandler, vec![x.clone(), num(0.0)]), Some(x.clone()));
        assert_eq!(
            optimize(&AddHandler, vec![x.clone(), num(0.0), y.clone()]).unwrap().to_string(),
            "Add(x, y)"
        );
        assert_eq!(optimize(&AddHandler, vec![x.clone(), y.clone()]), None);
        assert_eq!(optimize(&AddHandler, vec![x.clone()]), None);

        assert_eq!(optimize(&MultiplyHandler, vec![num(2.0), num(3.0), num(4.0)]), Some(num(24.0)));
        assert_eq!(optimize(&MultiplyHandler, vec![num(1.0), y.clone()]), Some(y));
        // x * 0 is not folded, x may be infinite
        assert_eq!(optimize(&MultiplyHandler, vec![x, num(0.0)]), None);
    }

    #[test]
    fn test_overflow_is_not_folded() {
        assert_eq!(
            optimize(&MultiplyHandler, vec![num(f64::MAX), num(2.0)]),
            None
        );
    }

    #[test]
    fn test_negate_and_abs() {
        assert_eq!(NEGATE.optimize(&Operation::new(Op::Negate, vec![num(3.0)])), Some(num(-3.0)));
        assert_eq!(ABS.optimize(&Operation::new(Op::Abs, vec![num(-3.0)])), Some(num(3.0)));
    }
}
