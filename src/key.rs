//! Canonical keys for branch-IR expressions.
//!
//! Two expressions get the same key exactly when they are structurally equal:
//!
//! - `C:<value>` for constants
//! - `V:<name>` for variables
//! - `O:<name>(<key>,<key>,...)` for operations, followed by
//!   `{<len>:<attribute>=<value>;...}` when the operation carries attributes;
//!   text values are length-prefixed the same way (`s<len>:<text>`)
//! - `B:<source>[<alternative>,...]=><combination>` for branches
//!
//! Keys are plain strings, so there are no collisions to worry about. The
//! optimizer keys its common-subexpression cache on them.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;

use crate::expr::{Attribute, Expr, ExprRef, Operation};

/// Computes the canonical key of an expression.
pub fn key(expr: &ExprRef) -> String {
    Canonicalizer::new().key(expr)
}

/// Key generator with a memo table for shared sub-trees.
///
/// The memo is keyed by node identity and holds on to every node it has
/// seen, so an address can never be reused by a different node while the
/// canonicalizer is alive. Create one per optimization pass.
#[derive(Debug, Default)]
pub struct Canonicalizer {
    memo: HashMap<usize, (ExprRef, String)>,
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&mut self, expr: &ExprRef) -> String {
        let id = Arc::as_ptr(expr) as usize;
        if let Some((_, key)) = self.memo.get(&id) {
            return key.clone();
        }
        let key = match &**expr {
            Expr::Constant(constant) => return format!("C:{}", constant),
            Expr::Variable(name) => return format!("V:{}", name),
            Expr::Operation(operation) => self.operation_key(operation),
            Expr::Branch(branch) => {
                let source = self.key(&branch.source);
                let alternatives = branch
                    .alternatives
                    .iter()
                    .map(|alternative| self.key(alternative))
                    .join(",");
                let combination = self.key(&branch.combination);
                format!("B:{}[{}]=>{}", source, alternatives, combination)
            }
        };
        self.memo.insert(id, (expr.clone(), key.clone()));
        key
    }

    /// Key of an operation that has not been wrapped into an `ExprRef` yet.
    pub fn operation_key(&mut self, operation: &Operation) -> String {
        let inputs = operation
            .inputs
            .iter()
            .map(|input| self.key(input))
            .join(",");
        let mut key = format!("O:{}({})", operation.op, inputs);
        if !operation.attributes.is_empty() {
            let attributes = operation
                .attributes
                .iter()
                .map(|(name, value)| format!("{}:{}={}", name.len(), name, self.attribute_key(value)))
                .join(";");
            key.push('{');
            key.push_str(&attributes);
            key.push('}');
        }
        key
    }

    fn attribute_key(&mut self, attribute: &Attribute) -> String {
        match attribute {
            Attribute::Int(value) => format!("i{}", value),
            Attribute::Number(value) => format!("n{}", value),
            Attribute::Text(value) => format!("s{}:{}", value.len(), value),
            Attribute::Expr(expr) => self.key(expr),
        }
    }
}
