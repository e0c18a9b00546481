//! Reference evaluator for branch IR.
//!
//! Values are `ndarray` tensors of `f64`. Element-wise operations broadcast
//! NumPy-style, booleans are `1.0`/`0.0`. Evaluating a `Compose` node on its
//! own yields a [`Value::Pair`]; inside a combination it means "apply the
//! left side, then the right side".
//!
//! The evaluator exists to check that optimization preserves meaning, so it
//! favors clarity over speed: every node is evaluated where it is reached.

use std::collections::HashMap;
use std::fmt;

use log::debug;
use ndarray::{concatenate, s, Array1, Array2, ArrayD, ArrayView2, Axis, Ix2, IxDyn, Zip};
use rayon::prelude::*;

use crate::errors::EvalError;
use crate::expr::{
    attr, placeholder_index, Attribute, Attributes, Expr, ExprRef, Function, Op, Operation,
    CONDITION,
};

/// Values of the free variables of a function.
pub type Bindings = HashMap<String, ArrayD<f64>>;

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(ArrayD<f64>),
    /// Both sides of a `Compose`.
    Pair(Box<Value>, Box<Value>),
}

impl Value {
    pub fn scalar(value: f64) -> Self {
        Value::Tensor(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn as_tensor(&self) -> Option<&ArrayD<f64>> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            Value::Pair(..) => None,
        }
    }

    /// The single element of a one-element tensor.
    pub fn as_scalar(&self) -> Option<f64> {
        match self.as_tensor()? {
            tensor if tensor.len() == 1 => tensor.iter().next().copied(),
            _ => None,
        }
    }

    /// Compares two values with a relative tolerance.
    ///
    /// NaNs compare equal to each other, infinities to infinities of the same sign.
    pub fn approx_eq(&self, other: &Value, tolerance: f64) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => {
                let same_shape = a.shape() == b.shape() || (a.len() == 1 && b.len() == 1);
                same_shape
                    && a.iter()
                        .zip(b.iter())
                        .all(|(&x, &y)| close(x, y, tolerance))
            }
            (Value::Pair(a1, a2), Value::Pair(b1, b2)) => {
                a1.approx_eq(b1, tolerance) && a2.approx_eq(b2, tolerance)
            }
            _ => false,
        }
    }

    fn left(&self) -> &Value {
        match self {
            Value::Pair(left, _) => left,
            other => other,
        }
    }

    fn right(&self) -> &Value {
        match self {
            Value::Pair(_, right) => right,
            other => other,
        }
    }
}

fn close(x: f64, y: f64, tolerance: f64) -> bool {
    if x.is_nan() || y.is_nan() {
        return x.is_nan() && y.is_nan();
    }
    if x == y {
        return true;
    }
    (x - y).abs() <= tolerance * x.abs().max(y.abs()).max(1.0)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(tensor) if tensor.ndim() == 0 => match tensor.iter().next() {
                Some(value) => write!(f, "{}", value),
                None => f.write_str("[]"),
            },
            Value::Tensor(tensor) => write!(f, "{}", tensor),
            Value::Pair(left, right) => write!(f, "({}, {})", left, right),
        }
    }
}

/// Evaluates the body of `function` with its variables taken from `bindings`.
pub fn evaluate(function: &Function, bindings: &Bindings) -> Result<Value, EvalError> {
    Evaluator { bindings }.eval(&function.body, Scope::default())
}

/// Evaluates `function` once per set of bindings, on the rayon thread pool.
pub fn evaluate_batch(function: &Function, batch: &[Bindings]) -> Vec<Result<Value, EvalError>> {
    debug!("Evaluating {} over {} bindings", function.name, batch.len());
    batch
        .par_iter()
        .map(|bindings| evaluate(function, bindings))
        .collect()
}

/// Placeholders visible inside a combination.
#[derive(Clone, Copy, Default)]
struct Scope<'s> {
    condition: Option<&'s Value>,
    slots: &'s [Value],
}

struct Evaluator<'a> {
    bindings: &'a Bindings,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &ExprRef, scope: Scope<'_>) -> Result<Value, EvalError> {
        match &**expr {
            Expr::Constant(constant) => Ok(Value::scalar(constant.as_f64())),
            Expr::Variable(name) => self.lookup(name, scope),
            Expr::Operation(operation) => self.eval_operation(operation, scope),
            Expr::Branch(branch) => {
                let source = self.eval(&branch.source, scope)?;
                let alternatives = self.eval_all(&branch.alternatives, scope)?;
                self.combine(
                    &branch.combination,
                    Scope {
                        condition: Some(&source),
                        slots: &alternatives,
                    },
                )
            }
        }
    }

    fn eval_all(&self, exprs: &[ExprRef], scope: Scope<'_>) -> Result<Vec<Value>, EvalError> {
        exprs.iter().map(|expr| self.eval(expr, scope)).collect()
    }

    fn lookup(&self, name: &str, scope: Scope<'_>) -> Result<Value, EvalError> {
        let in_scope = match placeholder_index(name) {
            Some(index) => scope.slots.get(index),
            None if name == CONDITION => scope.condition,
            None => None,
        };
        if let Some(value) = in_scope {
            return Ok(value.clone());
        }
        self.bindings
            .get(name)
            .map(|tensor| Value::Tensor(tensor.clone()))
            .ok_or_else(|| EvalError::UnboundVariable(name.to_string()))
    }

    /// Evaluates a combination; a top-level `Compose` applies its left side, then its right side.
    fn combine(&self, combination: &ExprRef, scope: Scope<'_>) -> Result<Value, EvalError> {
        match &**combination {
            Expr::Operation(operation)
                if operation.op == Op::Compose && operation.inputs.len() == 2 =>
            {
                let left_slots: Vec<Value> = scope.slots.iter().map(|v| v.left().clone()).collect();
                let right_slots: Vec<Value> =
                    scope.slots.iter().map(|v| v.right().clone()).collect();
                let left = self.combine(
                    &operation.inputs[0],
                    Scope {
                        condition: scope.condition,
                        slots: &left_slots,
                    },
                )?;
                self.combine(
                    &operation.inputs[1],
                    Scope {
                        condition: Some(&left),
                        slots: &right_slots,
                    },
                )
            }
            _ => self.eval(combination, scope),
        }
    }

    fn eval_operation(&self, operation: &Operation, scope: Scope<'_>) -> Result<Value, EvalError> {
        match operation.op {
            Op::Parallel | Op::Serial => {
                let slots = self.plan_slots(operation, scope)?;
                let combination = plan_combination(operation)?;
                self.combine(combination, Scope { condition: None, slots: &slots })
            }
            Op::SequentialComposition => {
                expect_arity(operation, 2)?;
                let slots = match operation.inputs[0].as_operation() {
                    Some(plan) if matches!(plan.op, Op::Parallel | Op::Serial) => {
                        self.plan_slots(plan, scope)?
                    }
                    _ => vec![self.eval(&operation.inputs[0], scope)?],
                };
                self.combine(&operation.inputs[1], Scope { condition: None, slots: &slots })
            }
            Op::ParallelGroup => {
                let mut values = self.group_values(operation, scope)?;
                if values.len() != 1 {
                    return Err(arity_error(operation, "1 (or a Reduce attribute)"));
                }
                Ok(values.remove(0))
            }
            Op::Compose => {
                expect_arity(operation, 2)?;
                let left = self.eval(&operation.inputs[0], scope)?;
                let right = self.eval(&operation.inputs[1], scope)?;
                Ok(Value::Pair(Box::new(left), Box::new(right)))
            }
            Op::MergedBranch => match operation.inputs.first() {
                Some(first) => self.eval(first, scope),
                None => Err(arity_error(operation, "at least 1")),
            },
            _ => {
                let values = self.eval_all(&operation.inputs, scope)?;
                apply(&operation.op, &operation.attributes, values)
            }
        }
    }

    /// Slot values of a plan: one per reduced group, one per member otherwise.
    fn plan_slots(&self, plan: &Operation, scope: Scope<'_>) -> Result<Vec<Value>, EvalError> {
        if plan.op == Op::Serial {
            return self.eval_all(&plan.inputs, scope);
        }
        let mut slots = Vec::new();
        for group in &plan.inputs {
            match group.as_operation() {
                Some(group) if group.op == Op::ParallelGroup => {
                    slots.extend(self.group_values(group, scope)?)
                }
                _ => slots.push(self.eval(group, scope)?),
            }
        }
        Ok(slots)
    }

    fn group_values(&self, group: &Operation, scope: Scope<'_>) -> Result<Vec<Value>, EvalError> {
        let members = self.eval_all(&group.inputs, scope)?;
        match group.attribute(attr::REDUCE).and_then(Attribute::as_text) {
            Some(reduce) if members.len() > 1 => {
                Ok(vec![apply(&Op::from(reduce), &Attributes::new(), members)?])
            }
            _ => Ok(members),
        }
    }
}

fn plan_combination(plan: &Operation) -> Result<&ExprRef, EvalError> {
    plan.combination().ok_or_else(|| EvalError::MissingAttribute {
        op: plan.op.to_string(),
        attribute: attr::COMBINATION.to_string(),
    })
}

fn arity_error(operation: &Operation, expected: &str) -> EvalError {
    EvalError::Arity {
        name: operation.op.to_string(),
        expected: expected.to_string(),
        got: operation.inputs.len(),
    }
}

fn expect_arity(operation: &Operation, expected: usize) -> Result<(), EvalError> {
    if operation.inputs.len() == expected {
        Ok(())
    } else {
        Err(arity_error(operation, &expected.to_string()))
    }
}

fn shape_error(op: &Op, message: impl Into<String>) -> EvalError {
    EvalError::Shape {
        op: op.to_string(),
        message: message.into(),
    }
}

/// Applies a data operation to already evaluated inputs.
fn apply(op: &Op, attributes: &Attributes, values: Vec<Value>) -> Result<Value, EvalError> {
    let arity = |expected: &str| EvalError::Arity {
        name: op.to_string(),
        expected: expected.to_string(),
        got: values.len(),
    };

    // Select may pass whole values (including pairs) through
    if *op == Op::Select {
        let [condition, when_true, when_false] =
            <[Value; 3]>::try_from(values.clone()).map_err(|_| arity("3"))?;
        return select(op, condition, when_true, when_false);
    }

    let tensors = values
        .iter()
        .map(|value| {
            value
                .as_tensor()
                .ok_or_else(|| shape_error(op, "expected a tensor, got a composed pair"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let fold = |f: fn(f64, f64) -> f64| -> Result<Value, EvalError> {
        let (first, rest) = tensors.split_first().ok_or_else(|| arity("at least 1"))?;
        rest.iter()
            .try_fold((*first).clone(), |acc, next| zip_with(op, &acc, next, f))
            .map(Value::Tensor)
    };
    let unary = |f: fn(f64) -> f64| -> Result<Value, EvalError> {
        match tensors.as_slice() {
            [input] => Ok(Value::Tensor(input.mapv(f))),
            _ => Err(arity("1")),
        }
    };
    let compare = |f: fn(&f64, &f64) -> bool| -> Result<Value, EvalError> {
        match tensors.as_slice() {
            [left, right] => zip_with(op, left, right, |x, y| truth(f(&x, &y))).map(Value::Tensor),
            _ => Err(arity("2")),
        }
    };

    match op {
        Op::Add => fold(|x, y| x + y),
        Op::Subtract => fold(|x, y| x - y),
        Op::Multiply => fold(|x, y| x * y),
        Op::Divide => fold(|x, y| x / y),
        Op::Power => fold(f64::powf),
        Op::Negate => unary(|x| -x),
        Op::Plus => unary(|x| x),
        Op::Abs => unary(f64::abs),
        Op::Sqrt => unary(f64::sqrt),
        Op::LogicalNot => unary(|x| truth(x == 0.0)),
        Op::Sin => unary(f64::sin),
        Op::Cos => unary(f64::cos),
        Op::Tan => unary(f64::tan),
        Op::Exp => unary(f64::exp),
        Op::Log => unary(f64::ln),
        Op::Equal => compare(f64::eq),
        Op::NotEqual => compare(f64::ne),
        Op::LessThan => compare(f64::lt),
        Op::LessThanOrEqual => compare(f64::le),
        Op::GreaterThan => compare(f64::gt),
        Op::GreaterThanOrEqual => compare(f64::ge),
        Op::MatMul => match tensors.as_slice() {
            [a, b] => matmul(op, a, b, None),
            _ => Err(arity("2")),
        },
        Op::MatMulBlock => match tensors.as_slice() {
            [a, b] => {
                let quadrant = |name: &str| {
                    attributes
                        .get(name)
                        .and_then(Attribute::as_int)
                        .ok_or_else(|| EvalError::MissingAttribute {
                            op: op.to_string(),
                            attribute: name.to_string(),
                        })
                };
                let block = (quadrant(attr::BLOCK_ROW)?, quadrant(attr::BLOCK_COL)?);
                matmul(op, a, b, Some(block))
            }
            _ => Err(arity("2")),
        },
        Op::MatMulCombine => match tensors.as_slice() {
            [q00, q01, q10, q11] => combine_quadrants(op, [*q00, *q01, *q10, *q11]),
            _ => Err(arity("4")),
        },
        Op::Concatenate => Ok(Value::Tensor(
            Array1::from_iter(tensors.iter().flat_map(|tensor| tensor.iter().copied())).into_dyn(),
        )),
        _ => Err(EvalError::UnsupportedOperation(op.to_string())),
    }
}

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn select(op: &Op, condition: Value, when_true: Value, when_false: Value) -> Result<Value, EvalError> {
    let condition = match condition {
        Value::Tensor(tensor) => tensor,
        Value::Pair(..) => return Err(shape_error(op, "condition must be a tensor")),
    };
    if condition.ndim() == 0 {
        let picked = condition.iter().next().is_some_and(|&c| c != 0.0);
        return Ok(if picked { when_true } else { when_false });
    }
    let (Some(t), Some(f)) = (when_true.as_tensor(), when_false.as_tensor()) else {
        return Err(shape_error(op, "element-wise select needs tensor operands"));
    };
    let shape = broadcast_shape(op, &broadcast_shape(op, condition.shape(), t.shape())?, f.shape())?;
    let view = |tensor: &ArrayD<f64>| {
        tensor
            .broadcast(IxDyn(&shape))
            .map(|view| view.to_owned())
            .ok_or_else(|| shape_error(op, format!("cannot broadcast {:?} to {:?}", tensor.shape(), shape)))
    };
    let (c, t, f) = (view(&condition)?, view(t)?, view(f)?);
    Ok(Value::Tensor(
        Zip::from(&c)
            .and(&t)
            .and(&f)
            .map_collect(|&c, &t, &f| if c != 0.0 { t } else { f }),
    ))
}

/// NumPy broadcasting of two shapes.
fn broadcast_shape(op: &Op, a: &[usize], b: &[usize]) -> Result<Vec<usize>, EvalError> {
    let ndim = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        (i + shape.len())
            .checked_sub(ndim)
            .map_or(1, |index| shape[index])
    };
    (0..ndim)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => Err(shape_error(op, format!("shapes {:?} and {:?} do not broadcast", a, b))),
        })
        .collect()
}

fn zip_with(
    op: &Op,
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    f: impl Fn(f64, f64) -> f64,
) -> Result<ArrayD<f64>, EvalError> {
    if a.shape() == b.shape() {
        return Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)));
    }
    let shape = broadcast_shape(op, a.shape(), b.shape())?;
    let mismatch = || shape_error(op, format!("shapes {:?} and {:?} do not broadcast", a.shape(), b.shape()));
    let a = a.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    let b = b.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
}

/// Matrix product, or one quadrant of it when `block` is given.
///
/// Rows of the left factor split at `ceil(rows / 2)`, columns of the right
/// factor at `ceil(cols / 2)`.
fn matmul(
    op: &Op,
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    block: Option<(i64, i64)>,
) -> Result<Value, EvalError> {
    fn matrix<'t>(op: &Op, tensor: &'t ArrayD<f64>) -> Result<ArrayView2<'t, f64>, EvalError> {
        tensor
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| shape_error(op, format!("expected a matrix, got shape {:?}", tensor.shape())))
    }
    let (a, b) = (matrix(op, a)?, matrix(op, b)?);
    if a.ncols() != b.nrows() {
        return Err(shape_error(
            op,
            format!("cannot multiply {:?} by {:?}", a.shape(), b.shape()),
        ));
    }
    let product = match block {
        None => a.dot(&b),
        Some((row, col)) => {
            let half = |n: usize| n.div_ceil(2);
            let rows = match row {
                0 => 0..half(a.nrows()),
                1 => half(a.nrows())..a.nrows(),
                _ => return Err(shape_error(op, format!("block row {} out of range", row))),
            };
            let cols = match col {
                0 => 0..half(b.ncols()),
                1 => half(b.ncols())..b.ncols(),
                _ => return Err(shape_error(op, format!("block column {} out of range", col))),
            };
            a.slice(s![rows, ..]).dot(&b.slice(s![.., cols]))
        }
    };
    Ok(Value::Tensor(product.into_dyn()))
}

fn combine_quadrants(op: &Op, quadrants: [&ArrayD<f64>; 4]) -> Result<Value, EvalError> {
    let views = quadrants
        .iter()
        .map(|q| {
            q.view()
                .into_dimensionality::<Ix2>()
                .map_err(|_| shape_error(op, format!("expected a matrix, got shape {:?}", q.shape())))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let top = join(op, 1, &views[..2])?;
    let bottom = join(op, 1, &views[2..])?;
    let full = join(op, 0, &[top.view(), bottom.view()])?;
    Ok(Value::Tensor(full.into_dyn()))
}

fn join(op: &Op, axis: usize, parts: &[ArrayView2<f64>]) -> Result<Array2<f64>, EvalError> {
    concatenate(Axis(axis), parts).map_err(|e| shape_error(op, e.to_string()))
}
