//! Branch-oriented expression IR.
//!
//! This module defines the tree the optimizer works on. The main types are:
//!
//! - `Expr`: a node, one of `Constant`, `Variable`, `Operation` or `Branch`
//! - `Op`: the name of an operation, a closed set of known names plus `Custom`
//! - `Attribute`: side data attached to an operation (block coordinates, combination plans)
//! - `Function`: a named body with typed parameters
//!
//! Nodes are immutable and shared through `ExprRef = Arc<Expr>`. Every rewrite
//! builds new nodes; the identity of a node (its `Arc` pointer) is what the
//! dependency analysis keys on, while its canonical key (see [`crate::key`]) is
//! what common-subexpression elimination keys on.
//!
//! # Branches and placeholders
//! A `Branch` evaluates its `source`, every alternative, and then its
//! `combination`. Inside a combination the reserved variable `condition`
//! stands for the value of the source and `parallelResult_<i>` for the value
//! of the i-th alternative. The same placeholders are used by `Parallel`,
//! `Serial` and `SequentialComposition` plans, where `parallelResult_<i>` is
//! the i-th group result.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::key::Canonicalizer;

/// Shared handle to an immutable expression node.
pub type ExprRef = Arc<Expr>;

/// Operation attributes, ordered by name so that keys and printing are stable.
pub type Attributes = BTreeMap<String, Attribute>;

/// Placeholder bound to the value of a branch source inside its combination.
pub const CONDITION: &str = "condition";

/// Prefix of the placeholders bound to alternative / group results.
pub const PLACEHOLDER_PREFIX: &str = "parallelResult_";

/// Well-known attribute names.
pub mod attr {
    /// Expression that combines the group results of a plan.
    pub const COMBINATION: &str = "Combination";
    /// Operation a `ParallelGroup` applies over its members.
    pub const REDUCE: &str = "Reduce";
    /// Pass-local label of a parallel plan.
    pub const PLAN: &str = "Plan";
    /// Row quadrant of a `MatMulBlock`.
    pub const BLOCK_ROW: &str = "BlockRow";
    /// Column quadrant of a `MatMulBlock`.
    pub const BLOCK_COL: &str = "BlockCol";
}

macro_rules! operations {
    ($($(#[$doc:meta])* $variant:ident),* $(,)?) => {
        /// Name of an operation.
        ///
        /// Known names get their own variant so that typos are caught when the
        /// IR is built; anything else is kept as `Custom` and has to be admitted
        /// by the operation registry's allow-list to pass validation.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Op {
            $($(#[$doc])* $variant,)*
            /// Operation outside the built-in vocabulary (e.g. a method call)
            Custom(String),
        }

        impl Op {
            /// The name used at the IR boundary, e.g. `"MatMulBlock"`.
            pub fn name(&self) -> &str {
                match self {
                    $(Op::$variant => stringify!($variant),)*
                    Op::Custom(name) => name,
                }
            }

            /// Every built-in operation.
            pub fn known() -> impl Iterator<Item = Op> {
                [$(Op::$variant),*].into_iter()
            }
        }

        impl From<&str> for Op {
            fn from(name: &str) -> Self {
                match name {
                    $(stringify!($variant) => Op::$variant,)*
                    other => Op::Custom(other.to_string()),
                }
            }
        }
    };
}

operations! {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Negate,
    Plus,
    Abs,
    Sqrt,
    LogicalNot,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    MatMul,
    /// One quadrant of a 2x2 block matrix product
    MatMulBlock,
    /// Reassembles four quadrants into a matrix
    MatMulCombine,
    /// Element-wise choice between two values
    Select,
    Concatenate,
    /// Left-then-right composition of two branch layers
    Compose,
    /// A set of structurally identical alternatives
    MergedBranch,
    Parallel,
    ParallelGroup,
    Serial,
    SequentialComposition,
}

impl Op {
    /// Structural operations introduced by the optimizer to describe a plan.
    pub fn is_plan_marker(&self) -> bool {
        matches!(
            self,
            Op::Parallel
                | Op::ParallelGroup
                | Op::Serial
                | Op::SequentialComposition
                | Op::Compose
                | Op::MergedBranch
        )
    }

    /// Operations whose inputs may be split into independently computed groups.
    pub fn is_decomposable(&self) -> bool {
        matches!(
            self,
            Op::Add | Op::Multiply | Op::MatMul | Op::Subtract | Op::Divide
        )
    }

    /// Operations whose inputs can be freely regrouped.
    pub fn is_associative(&self) -> bool {
        matches!(self, Op::Add | Op::Multiply)
    }

    /// Operations applied independently to every element of their inputs.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Subtract
                | Op::Multiply
                | Op::Divide
                | Op::Power
                | Op::Negate
                | Op::Plus
                | Op::Abs
                | Op::Sqrt
                | Op::LogicalNot
                | Op::Equal
                | Op::NotEqual
                | Op::LessThan
                | Op::LessThanOrEqual
                | Op::GreaterThan
                | Op::GreaterThanOrEqual
                | Op::Sin
                | Op::Cos
                | Op::Tan
                | Op::Exp
                | Op::Log
        )
    }
}

impl From<String> for Op {
    fn from(name: String) -> Self {
        Op::from(name.as_str())
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A literal value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Number(f64),
    Bool(bool),
}

impl Constant {
    /// Numeric view of the constant; booleans are 1 and 0.
    pub fn as_f64(&self) -> f64 {
        match self {
            Constant::Number(value) => *value,
            Constant::Bool(true) => 1.0,
            Constant::Bool(false) => 0.0,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Number(value) => write!(f, "{}", value),
            Constant::Bool(value) => write!(f, "{}", value),
        }
    }
}

/// Side data attached to an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Number(f64),
    Text(String),
    Expr(ExprRef),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Attribute::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_expr(&self) -> Option<&ExprRef> {
        match self {
            Attribute::Expr(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Int(value) => write!(f, "{}", value),
            Attribute::Number(value) => write!(f, "{}", value),
            Attribute::Text(value) => f.write_str(value),
            Attribute::Expr(value) => write!(f, "{}", value),
        }
    }
}

/// A named operation applied to an ordered list of inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op: Op,
    pub inputs: Vec<ExprRef>,
    pub attributes: Attributes,
}

impl Operation {
    pub fn new(op: impl Into<Op>, inputs: Vec<ExprRef>) -> Self {
        Self {
            op: op.into(),
            inputs,
            attributes: Attributes::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// The `Combination` attribute of a plan node.
    pub fn combination(&self) -> Option<&ExprRef> {
        self.attribute(attr::COMBINATION).and_then(Attribute::as_expr)
    }

    /// Same operation and attributes over different inputs.
    pub fn with_inputs(&self, inputs: Vec<ExprRef>) -> Self {
        Self {
            op: self.op.clone(),
            inputs,
            attributes: self.attributes.clone(),
        }
    }

    pub fn into_expr(self) -> ExprRef {
        Arc::new(Expr::Operation(self))
    }
}

/// A conditional: the combination decides how the alternatives form the result.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub source: ExprRef,
    pub alternatives: Vec<ExprRef>,
    pub combination: ExprRef,
}

impl Branch {
    pub fn into_expr(self) -> ExprRef {
        Arc::new(Expr::Branch(self))
    }
}

/// A node of the branch IR.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Constant),
    Variable(String),
    Operation(Operation),
    Branch(Branch),
}

impl Expr {
    pub fn number(value: f64) -> ExprRef {
        Arc::new(Expr::Constant(Constant::Number(value)))
    }

    pub fn boolean(value: bool) -> ExprRef {
        Arc::new(Expr::Constant(Constant::Bool(value)))
    }

    pub fn variable(name: impl Into<String>) -> ExprRef {
        Arc::new(Expr::Variable(name.into()))
    }

    pub fn operation(op: impl Into<Op>, inputs: Vec<ExprRef>) -> ExprRef {
        Operation::new(op, inputs).into_expr()
    }

    pub fn branch(source: ExprRef, alternatives: Vec<ExprRef>, combination: ExprRef) -> ExprRef {
        Branch {
            source,
            alternatives,
            combination,
        }
        .into_expr()
    }

    pub fn as_operation(&self) -> Option<&Operation> {
        match self {
            Expr::Operation(operation) => Some(operation),
            _ => None,
        }
    }

    /// Numeric value of a constant node.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Constant(constant) => Some(constant.as_f64()),
            _ => None,
        }
    }

    /// True if this node is an operation with the given name.
    pub fn is_op(&self, op: &Op) -> bool {
        matches!(self, Expr::Operation(operation) if &operation.op == op)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(constant) => write!(f, "{}", constant),
            Expr::Variable(name) => f.write_str(name),
            Expr::Operation(operation) => {
                write!(f, "{}", operation.op)?;
                if !operation.attributes.is_empty() {
                    write!(
                        f,
                        "{{{}}}",
                        operation
                            .attributes
                            .iter()
                            .map(|(name, value)| format!("{}={}", name, value))
                            .join(", ")
                    )?;
                }
                write!(f, "({})", operation.inputs.iter().join(", "))
            }
            Expr::Branch(branch) => write!(
                f,
                "Branch({}; [{}] => {})",
                branch.source,
                branch.alternatives.iter().join(", "),
                branch.combination
            ),
        }
    }
}

/// Type of a function parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    pub is_scalar: bool,
}

impl TypeInfo {
    pub fn scalar(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_scalar: true,
        }
    }

    pub fn tensor(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_scalar: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub ty: TypeInfo,
}

impl Parameter {
    pub fn new(name: &str, ty: TypeInfo) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

/// A named branch-IR function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub body: ExprRef,
}

impl Function {
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parameters = self
            .parameters
            .iter()
            .map(|p| {
                if p.ty.is_scalar {
                    format!("{}: {}", p.name, p.ty.name)
                } else {
                    format!("{}: {}[]", p.name, p.ty.name)
                }
            })
            .join(", ");
        write!(f, "{}({}) = {}", self.name, parameters, self.body)
    }
}

/// The placeholder for the i-th alternative or group result.
pub fn placeholder(index: usize) -> ExprRef {
    Expr::variable(format!("{}{}", PLACEHOLDER_PREFIX, index))
}

/// Slot index of a `parallelResult_<i>` name.
pub fn placeholder_index(name: &str) -> Option<usize> {
    name.strip_prefix(PLACEHOLDER_PREFIX)?.parse().ok()
}

/// True for `condition` and `parallelResult_<i>`.
pub fn is_placeholder(name: &str) -> bool {
    name == CONDITION || placeholder_index(name).is_some()
}

/// Renumbers the free `parallelResult_<i>` placeholders of a combination.
pub fn remap_placeholders(expr: &ExprRef, remap: &dyn Fn(usize) -> usize) -> ExprRef {
    rewrite_free(
        expr,
        &|name| placeholder_index(name).map(|index| placeholder(remap(index))),
        false,
    )
}

/// Replaces the free `condition` of a combination with `source`.
///
/// The right side of a `Compose` is skipped: there `condition` is the value of
/// the left side.
pub fn bind_condition(expr: &ExprRef, source: &ExprRef) -> ExprRef {
    rewrite_free(
        expr,
        &|name| (name == CONDITION).then(|| source.clone()),
        true,
    )
}

/// Rewrites variables of the current combination scope, leaving nested scopes alone.
fn rewrite_free(
    expr: &ExprRef,
    rewrite: &dyn Fn(&str) -> Option<ExprRef>,
    skip_compose_right: bool,
) -> ExprRef {
    match &**expr {
        Expr::Constant(_) => expr.clone(),
        Expr::Variable(name) => rewrite(name).unwrap_or_else(|| expr.clone()),
        Expr::Operation(operation) => {
            let inputs = operation
                .inputs
                .iter()
                .enumerate()
                .map(|(i, input)| {
                    let scoped = i == 1
                        && (operation.op == Op::SequentialComposition
                            || (skip_compose_right && operation.op == Op::Compose));
                    if scoped {
                        input.clone()
                    } else {
                        rewrite_free(input, rewrite, skip_compose_right)
                    }
                })
                .collect();
            operation.with_inputs(inputs).into_expr()
        }
        Expr::Branch(branch) => Branch {
            source: rewrite_free(&branch.source, rewrite, skip_compose_right),
            alternatives: branch
                .alternatives
                .iter()
                .map(|alternative| rewrite_free(alternative, rewrite, skip_compose_right))
                .collect(),
            combination: branch.combination.clone(),
        }
        .into_expr(),
    }
}

/// Number of distinct computational nodes reachable from `expr`.
///
/// Nodes are identified by canonical key, so shared and repeated
/// sub-expressions count once. Plan markers, placeholders and operations
/// built only from placeholders are free; attribute expressions are not
/// visited.
pub fn node_count(expr: &ExprRef) -> usize {
    let mut canon = Canonicalizer::new();
    let mut seen = HashSet::new();
    count_nodes(expr, &mut canon, &mut seen);
    seen.len()
}

fn count_nodes(expr: &ExprRef, canon: &mut Canonicalizer, seen: &mut HashSet<String>) {
    match &**expr {
        Expr::Constant(_) => {
            seen.insert(canon.key(expr));
        }
        Expr::Variable(name) => {
            if !is_placeholder(name) {
                seen.insert(canon.key(expr));
            }
        }
        Expr::Operation(operation) => {
            if !operation.op.is_plan_marker() && !is_glue(expr) {
                seen.insert(canon.key(expr));
            }
            for input in &operation.inputs {
                count_nodes(input, canon, seen);
            }
        }
        Expr::Branch(branch) => {
            seen.insert(canon.key(expr));
            count_nodes(&branch.source, canon, seen);
            for alternative in &branch.alternatives {
                count_nodes(alternative, canon, seen);
            }
            count_nodes(&branch.combination, canon, seen);
        }
    }
}

/// True for expressions whose every leaf is a placeholder.
fn is_glue(expr: &ExprRef) -> bool {
    match &**expr {
        Expr::Variable(name) => is_placeholder(name),
        Expr::Operation(operation) => {
            !operation.inputs.is_empty() && operation.inputs.iter().all(is_glue)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> ExprRef {
        Expr::variable(name)
    }

    fn select() -> ExprRef {
        Expr::operation(
            Op::Select,
            vec![var(CONDITION), placeholder(0), placeholder(1)],
        )
    }

    #[test]
    fn test_op_names_round_trip() {
        for op in Op::known() {
            assert_eq!(Op::from(op.name()), op);
        }
        assert_eq!(Op::from("Frobnicate"), Op::Custom("Frobnicate".into()));
        assert_eq!(Op::from("MatMulBlock").name(), "MatMulBlock");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholder_index("parallelResult_12"), Some(12));
        assert_eq!(placeholder_index("parallelResult_"), None);
        assert_eq!(placeholder_index("x"), None);
        assert!(is_placeholder("condition"));
        assert!(!is_placeholder("conditions"));
    }

    #[test]
    fn test_remap_placeholders() {
        let remapped = remap_placeholders(&select(), &|i| i * 3);
        assert_eq!(
            remapped.to_string(),
            "Select(condition, parallelResult_0, parallelResult_3)"
        );
    }

    #[test]
    fn test_remap_skips_nested_branch_combination() {
        let inner = Expr::branch(placeholder(1), vec![var("x"), var("y")], select());
        let remapped = remap_placeholders(&inner, &|i| i + 5);
        let Expr::Branch(branch) = &*remapped else {
            panic!("expected branch");
        };
        assert_eq!(branch.source.to_string(), "parallelResult_6");
        assert_eq!(branch.combination, select());
    }

    #[test]
    fn test_bind_condition_only_left_of_compose() {
        let compose = Expr::operation(Op::Compose, vec![select(), select()]);
        let bound = bind_condition(&compose, &var("c"));
        assert_eq!(
            bound.to_string(),
            "Compose(Select(c, parallelResult_0, parallelResult_1), \
             Select(condition, parallelResult_0, parallelResult_1))"
        );
    }

    #[test]
    fn test_node_count() {
        // (x + y) * (x + y): x, y, Add, Multiply
        let sum = || Expr::operation(Op::Add, vec![var("x"), var("y")]);
        let product = Expr::operation(Op::Multiply, vec![sum(), sum()]);
        assert_eq!(node_count(&product), 4);

        // plan markers and glue are free
        let serial = Operation::new(Op::Serial, vec![var("x"), var("y")])
            .with_attribute(
                attr::COMBINATION,
                Attribute::Expr(Expr::operation(
                    Op::Add,
                    vec![placeholder(0), placeholder(1)],
                )),
            )
            .into_expr();
        assert_eq!(node_count(&serial), 2);

        let branch = Expr::branch(var("c"), vec![var("x"), var("y")], select());
        assert_eq!(node_count(&branch), 4);
    }

    #[test]
    fn test_display() {
        let block = Operation::new(Op::MatMulBlock, vec![var("A"), var("B")])
            .with_attribute(attr::BLOCK_ROW, Attribute::Int(0))
            .with_attribute(attr::BLOCK_COL, Attribute::Int(1))
            .into_expr();
        assert_eq!(block.to_string(), "MatMulBlock{BlockCol=1, BlockRow=0}(A, B)");

        let function = Function {
            name: "f".into(),
            parameters: vec![
                Parameter::new("A", TypeInfo::tensor("double")),
                Parameter::new("x", TypeInfo::scalar("double")),
            ],
            body: Expr::operation(Op::Sin, vec![var("x")]),
        };
        assert_eq!(function.to_string(), "f(A: double[], x: double) = Sin(x)");
    }
}
