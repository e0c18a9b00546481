//! Handlers for `MatMul` and its 2x2 block decomposition.
//!
//! None of these rewrite anything; they check arity and attributes, report
//! malformed occurrences, and provide unit costs. A block product is a full
//! matrix product over a quadrant, so it is priced like one.

use log::warn;

use super::{has_arity, OperationHandler};
use crate::expr::{attr, Attribute, ExprRef, Operation};

pub struct MatMulHandler;

impl OperationHandler for MatMulHandler {
    fn name(&self) -> &'static str {
        "MatMul"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        has_arity(operation, 2);
        None
    }

    fn cost(&self) -> f64 {
        10.0
    }
}

pub struct MatMulBlockHandler;

impl OperationHandler for MatMulBlockHandler {
    fn name(&self) -> &'static str {
        "MatMulBlock"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        if has_arity(operation, 2) && block_index(operation).is_none() {
            warn!("MatMulBlock without valid BlockRow/BlockCol attributes");
        }
        None
    }

    fn cost(&self) -> f64 {
        10.0
    }
}

pub struct MatMulCombineHandler;

impl OperationHandler for MatMulCombineHandler {
    fn name(&self) -> &'static str {
        "MatMulCombine"
    }

    fn optimize(&self, operation: &Operation) -> Option<ExprRef> {
        has_arity(operation, 4);
        None
    }
}

/// `(BlockRow, BlockCol)` of a block product, if both are 0 or 1.
pub fn block_index(operation: &Operation) -> Option<(usize, usize)> {
    let quadrant = |name| match operation.attribute(name).and_then(Attribute::as_int) {
        Some(index @ 0..=1) => Some(index as usize),
        _ => None,
    };
    Some((quadrant(attr::BLOCK_ROW)?, quadrant(attr::BLOCK_COL)?))
}
