//! Front end from evalexpr expression strings to source-level IR.
//!
//! The expression is parsed with [evalexpr](https://github.com/ISibboI/evalexpr)
//! and its operator tree is walked into a [`VirFunction`]. Free identifiers
//! become the function's parameters, sorted alphabetically and typed as
//! `double` scalars.
//!
//! # Supported syntax
//! * Arithmetic: `+`, `-`, `*`, `/`, `^` and unary `-`
//! * Comparisons: `==`, `!=`, `<`, `<=`, `>`, `>=` and logical `!`
//! * Numeric and boolean literals
//! * `if(condition, when_true, when_false)`
//! * `sin`, `cos`, `tan`, `exp`, `ln`/`log`, `sqrt`, `abs` (optionally prefixed with `math::`)
//! * Any other function call, kept as a method call named after the callee

use std::collections::BTreeSet;

use evalexpr::{build_operator_tree, Node, Operator};

use crate::errors::ParseError;
use crate::vir::{BinaryOperator, UnaryOperator, VirExpr, VirFunction, VirRef};

/// Parses `expression` into a source-level function called `name`.
///
/// # Example
/// ```
/// use branchvir::parse::build_function;
///
/// let function = build_function("f", "if(x > 0, sin(x), -y)").unwrap();
/// assert_eq!(function.parameters.len(), 2);
/// ```
pub fn build_function(name: &str, expression: &str) -> Result<VirFunction, ParseError> {
    let node: Node = build_operator_tree(expression)?;
    let symbols = extract_symbols(&node);
    let body = build_vir(&node)?;
    let parameters = symbols.iter().map(String::as_str).collect::<Vec<_>>();
    Ok(VirFunction::scalar(name, &parameters, body))
}

/// Collects the free identifiers of an operator tree in alphabetical order.
pub fn extract_symbols(node: &Node) -> Vec<String> {
    let mut symbols = BTreeSet::new();
    extract_symbols_from_node(node, &mut symbols);
    symbols.into_iter().collect()
}

fn extract_symbols_from_node(node: &Node, symbols: &mut BTreeSet<String>) {
    match node.operator() {
        Operator::VariableIdentifierRead { identifier } => {
            symbols.insert(identifier.to_string());
        }
        _ => {
            for child in node.children() {
                extract_symbols_from_node(child, symbols);
            }
        }
    }
}

/// Converts an evalexpr operator tree into source-level IR.
pub fn build_vir(node: &Node) -> Result<VirRef, ParseError> {
    match node.operator() {
        // evalexpr keeps n-ary sums and products flat; fold them left
        Operator::Add => fold_binary(BinaryOperator::Add, node),
        Operator::Mul => fold_binary(BinaryOperator::Multiply, node),
        Operator::Sub => binary(BinaryOperator::Subtract, node),
        Operator::Div => binary(BinaryOperator::Divide, node),
        Operator::Exp => binary(BinaryOperator::Power, node),
        Operator::Eq => binary(BinaryOperator::Equal, node),
        Operator::Neq => binary(BinaryOperator::NotEqual, node),
        Operator::Lt => binary(BinaryOperator::LessThan, node),
        Operator::Leq => binary(BinaryOperator::LessThanOrEqual, node),
        Operator::Gt => binary(BinaryOperator::GreaterThan, node),
        Operator::Geq => binary(BinaryOperator::GreaterThanOrEqual, node),
        Operator::Neg => unary(UnaryOperator::Negate, node.children(), "-"),
        Operator::Not => unary(UnaryOperator::LogicalNot, node.children(), "!"),
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(VirExpr::number(*f)),
            evalexpr::Value::Int(i) => Ok(VirExpr::number(*i as f64)),
            evalexpr::Value::Boolean(b) => Ok(VirExpr::boolean(*b)),
            _ => Err(ParseError::ConstOperator(format!("{:?}", value))),
        },
        Operator::VariableIdentifierRead { identifier } => Ok(VirExpr::variable(identifier.as_str())),
        Operator::FunctionIdentifier { identifier } => {
            let arguments = call_arguments(node);
            let name = identifier.strip_prefix("math::").unwrap_or(identifier.as_str());
            match name {
                "if" => {
                    let [condition, when_true, when_false] = expect_arguments::<3>(name, &arguments)?;
                    Ok(VirExpr::conditional(
                        build_vir(condition)?,
                        build_vir(when_true)?,
                        build_vir(when_false)?,
                    ))
                }
                "sin" => call_unary(UnaryOperator::Sin, name, &arguments),
                "cos" => call_unary(UnaryOperator::Cos, name, &arguments),
                "tan" => call_unary(UnaryOperator::Tan, name, &arguments),
                "exp" => call_unary(UnaryOperator::Exp, name, &arguments),
                "ln" | "log" => call_unary(UnaryOperator::Log, name, &arguments),
                "sqrt" => call_unary(UnaryOperator::Sqrt, name, &arguments),
                "abs" => call_unary(UnaryOperator::Abs, name, &arguments),
                _ => Ok(VirExpr::call(
                    identifier.as_str(),
                    arguments
                        .iter()
                        .map(|argument| build_vir(argument))
                        .collect::<Result<Vec<_>, _>>()?,
                )),
            }
        }
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                build_vir(&children[0])
            } else {
                Err(ParseError::RootNode(format!("{} children", children.len())))
            }
        }
        _ => Err(ParseError::UnsupportedOperator(format!(
            "{:?}",
            node.operator()
        ))),
    }
}

fn fold_binary(op: BinaryOperator, node: &Node) -> Result<VirRef, ParseError> {
    let children = node.children();
    let Some((first, rest)) = children.split_first() else {
        return Err(ParseError::Arity {
            name: op.name().to_string(),
            expected: 2,
            got: 0,
        });
    };
    rest.iter().try_fold(build_vir(first)?, |acc, child| {
        Ok(VirExpr::binary(op, acc, build_vir(child)?))
    })
}

fn binary(op: BinaryOperator, node: &Node) -> Result<VirRef, ParseError> {
    let children = node.children().iter().collect::<Vec<_>>();
    let [left, right] = expect_arguments::<2>(op.name(), &children)?;
    Ok(VirExpr::binary(op, build_vir(left)?, build_vir(right)?))
}

fn unary(op: UnaryOperator, children: &[Node], name: &str) -> Result<VirRef, ParseError> {
    let children = children.iter().collect::<Vec<_>>();
    call_unary(op, name, &children)
}

fn call_unary(op: UnaryOperator, name: &str, arguments: &[&Node]) -> Result<VirRef, ParseError> {
    let [operand] = expect_arguments::<1>(name, arguments)?;
    Ok(VirExpr::unary(op, build_vir(operand)?))
}

fn expect_arguments<'a, const N: usize>(
    name: &str,
    arguments: &[&'a Node],
) -> Result<[&'a Node; N], ParseError> {
    <[&Node; N]>::try_from(arguments).map_err(|_| ParseError::Arity {
        name: name.to_string(),
        expected: N,
        got: arguments.len(),
    })
}

/// Arguments of a function call, looking through the parenthesis group and argument tuple.
fn call_arguments(node: &Node) -> Vec<&Node> {
    let mut current = node.children();
    while let [single] = current {
        match single.operator() {
            Operator::RootNode => current = single.children(),
            Operator::Tuple => return single.children().iter().collect(),
            _ => break,
        }
    }
    current.iter().collect()
}
