//! Handler for the exponential function `Exp`.

use super::UnaryHandler;

pub const EXP: UnaryHandler = UnaryHandler {
    name: "Exp",
    cost: 5.0,
    apply: f64::exp,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, Op, Operation};
    use crate::operators::OperationHandler;

    #[test]
    fn test_exp() {
        let zero = Operation::new(Op::Exp, vec![Expr::number(0.0)]);
        assert_eq!(EXP.optimize(&zero), Some(Expr::number(1.0)));

        // e^1000 overflows
        let huge = Operation::new(Op::Exp, vec![Expr::number(1000.0)]);
        assert_eq!(EXP.optimize(&huge), None);
        assert_eq!(EXP.cost(), 5.0);
    }
}
