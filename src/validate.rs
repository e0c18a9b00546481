//! Validity rules for branch-IR functions.
//!
//! A function is valid when:
//! - its name is not empty and it declares at least one parameter
//! - every parameter has a unique, non-empty name and a non-empty type name
//! - every variable names a parameter, or is a placeholder used inside a
//!   combination (a branch combination, a `Combination` attribute, or the
//!   second input of a `SequentialComposition`)
//! - every operation name is on the registry's allow-list

use std::collections::HashSet;

use crate::errors::ValidationError;
use crate::expr::{is_placeholder, Attribute, Expr, ExprRef, Function, Op};
use crate::operators::OperationRegistry;

/// Checks `function` against the validity rules, reporting the first violation.
pub fn validate(function: &Function, registry: &OperationRegistry) -> Result<(), ValidationError> {
    if function.name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if function.parameters.is_empty() {
        return Err(ValidationError::NoParameters(function.name.clone()));
    }

    let mut parameters = HashSet::new();
    for (position, parameter) in function.parameters.iter().enumerate() {
        if parameter.name.is_empty() {
            return Err(ValidationError::EmptyParameterName(position));
        }
        if parameter.ty.name.is_empty() {
            return Err(ValidationError::EmptyTypeName(parameter.name.clone()));
        }
        if is_placeholder(&parameter.name) {
            return Err(ValidationError::ReservedParameter(parameter.name.clone()));
        }
        if !parameters.insert(parameter.name.as_str()) {
            return Err(ValidationError::DuplicateParameter(parameter.name.clone()));
        }
    }

    Validator {
        parameters,
        registry,
    }
    .check(&function.body, false)
}

struct Validator<'a> {
    parameters: HashSet<&'a str>,
    registry: &'a OperationRegistry,
}

impl Validator<'_> {
    fn check(&self, expr: &ExprRef, in_combination: bool) -> Result<(), ValidationError> {
        match &**expr {
            Expr::Constant(_) => Ok(()),
            Expr::Variable(name) => {
                let bound = self.parameters.contains(name.as_str())
                    || (in_combination && is_placeholder(name));
                if bound {
                    Ok(())
                } else {
                    Err(ValidationError::UnboundVariable(name.clone()))
                }
            }
            Expr::Operation(operation) => {
                if !self.registry.is_allowed(operation.op.name()) {
                    return Err(ValidationError::UnknownOperation(
                        operation.op.name().to_string(),
                    ));
                }
                for (position, input) in operation.inputs.iter().enumerate() {
                    let scoped = position == 1 && operation.op == Op::SequentialComposition;
                    self.check(input, in_combination || scoped)?;
                }
                for attribute in operation.attributes.values() {
                    if let Attribute::Expr(combination) = attribute {
                        self.check(combination, true)?;
                    }
                }
                Ok(())
            }
            Expr::Branch(branch) => {
                self.check(&branch.source, in_combination)?;
                for alternative in &branch.alternatives {
                    self.check(alternative, in_combination)?;
                }
                self.check(&branch.combination, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::select_combination;
    use crate::expr::{attr, placeholder, Operation, Parameter, TypeInfo};

    fn var(name: &str) -> ExprRef {
        Expr::variable(name)
    }

    fn function(body: ExprRef) -> Function {
        Function {
            name: "f".into(),
            parameters: vec![
                Parameter::new("x", TypeInfo::scalar("double")),
                Parameter::new("y", TypeInfo::scalar("double")),
            ],
            body,
        }
    }

    fn check(function: &Function) -> Result<(), ValidationError> {
        validate(function, &OperationRegistry::with_default_handlers())
    }

    #[test]
    fn test_valid_function() {
        let body = Expr::branch(
            Expr::operation(Op::LessThan, vec![var("x"), var("y")]),
            vec![var("x"), Expr::operation(Op::Sin, vec![var("y")])],
            select_combination(),
        );
        assert_eq!(check(&function(body)), Ok(()));
    }

    #[test]
    fn test_header_rules() {
        let mut f = function(var("x"));
        f.name.clear();
        assert_eq!(check(&f), Err(ValidationError::EmptyName));

        let mut f = function(var("x"));
        f.parameters.clear();
        assert_eq!(check(&f), Err(ValidationError::NoParameters("f".into())));

        let mut f = function(var("x"));
        f.parameters[1].ty.name.clear();
        assert_eq!(check(&f), Err(ValidationError::EmptyTypeName("y".into())));

        let mut f = function(var("x"));
        f.parameters[1].name = "x".into();
        assert_eq!(check(&f), Err(ValidationError::DuplicateParameter("x".into())));

        let mut f = function(var("x"));
        f.parameters[0].name.clear();
        assert_eq!(check(&f), Err(ValidationError::EmptyParameterName(0)));

        let mut f = function(var("x"));
        f.parameters[1].name = "condition".into();
        assert_eq!(check(&f), Err(ValidationError::ReservedParameter("condition".into())));
    }

    #[test]
    fn test_unbound_variables() {
        assert_eq!(
            check(&function(var("z"))),
            Err(ValidationError::UnboundVariable("z".into()))
        );
        // placeholders are only bound inside combinations
        assert_eq!(
            check(&function(placeholder(0))),
            Err(ValidationError::UnboundVariable("parallelResult_0".into()))
        );

        let serial = Operation::new(Op::Serial, vec![var("x"), var("y")])
            .with_attribute(
                attr::COMBINATION,
                Attribute::Expr(Expr::operation(Op::Add, vec![placeholder(0), placeholder(1)])),
            )
            .into_expr();
        assert_eq!(check(&function(serial)), Ok(()));

        let sequence = Expr::operation(
            Op::SequentialComposition,
            vec![var("x"), Expr::operation(Op::Negate, vec![placeholder(0)])],
        );
        assert_eq!(check(&function(sequence)), Ok(()));
    }

    #[test]
    fn test_operation_allow_list() {
        let body = Expr::operation(Op::Custom("Blend".into()), vec![var("x")]);
        assert_eq!(
            check(&function(body.clone())),
            Err(ValidationError::UnknownOperation("Blend".into()))
        );

        let mut registry = OperationRegistry::with_default_handlers();
        registry.allow("Blend");
        assert_eq!(validate(&function(body), &registry), Ok(()));
    }
}
