//! Common-subexpression elimination, branch merging and parallel planning.
//!
//! Pass pipeline (per node, bottom-up)
//! -----------------------------------
//!  1. **cse**         – structurally identical operations collapse onto one
//!                       shared node, keyed by their canonical key.
//!  2. **simplify**    – the registered handler folds constants and applies
//!                       identity rules.
//!  3. **decompose**   – `Add`, `Multiply`, `MatMul`, `Subtract` and `Divide`
//!                       get their inputs grouped; the cost model decides
//!                       between a `Parallel` plan and a flat `Serial` one.
//!  4. **branches**    – nested branches are composed into one, a shared
//!                       operation is factored out of all alternatives,
//!                       duplicate alternatives are merged, and dependent
//!                       alternatives are planned like operation inputs.
//!
//! Every call to [`Optimizer::optimize`] runs a fresh `Pass` that owns the
//! expression cache, the canonicalization memo and the plan counter, so
//! nothing leaks from one function into the next and one optimizer can be
//! shared across threads.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::OptimizerConfig;
use crate::cost::{CostEstimator, CostModel};
use crate::dependency::{build_graph, partition_indices};
use crate::errors::OptimizeError;
use crate::expr::{
    attr, bind_condition, node_count, placeholder, placeholder_index, remap_placeholders, Attribute, Branch, Expr,
    ExprRef, Function, Op, Operation,
};
use crate::grouping::GroupingStrategy;
use crate::key::Canonicalizer;
use crate::operators::OperationRegistry;

/// Operations the optimizer rewrites into or decomposes; their handlers must be registered.
pub const REQUIRED_HANDLERS: [&str; 7] = [
    "Add",
    "Multiply",
    "Subtract",
    "Divide",
    "MatMul",
    "MatMulBlock",
    "MatMulCombine",
];

/// Immutable optimizer settings: configuration, handler registry and cost model.
#[derive(Debug)]
pub struct Optimizer<C = CostModel> {
    config: OptimizerConfig,
    registry: OperationRegistry,
    cost_model: C,
}

impl Optimizer<CostModel> {
    /// An optimizer with the default handlers and cost table.
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizeError> {
        Self::with_registry(config, OperationRegistry::with_default_handlers())
    }

    /// An optimizer over a custom registry; unit costs come from its handlers.
    pub fn with_registry(
        config: OptimizerConfig,
        registry: OperationRegistry,
    ) -> Result<Self, OptimizeError> {
        let cost_model = CostModel::from_registry(&registry);
        Optimizer::with_cost_model(config, registry, cost_model)
    }
}

impl<C: CostEstimator> Optimizer<C> {
    /// Fails eagerly if the configuration is invalid or a required handler is missing.
    pub fn with_cost_model(
        config: OptimizerConfig,
        registry: OperationRegistry,
        cost_model: C,
    ) -> Result<Self, OptimizeError> {
        config.validate()?;
        registry.require(&REQUIRED_HANDLERS)?;
        Ok(Self {
            config,
            registry,
            cost_model,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn cost_model(&self) -> &C {
        &self.cost_model
    }

    /// Optimizes one function. Parameters are kept, the body is rewritten.
    ///
    /// Factoring a shared operation out of a branch can add a node when the
    /// operation is also used elsewhere; if the rewritten body ends up larger
    /// than the input, the pass is repeated without that rewrite.
    pub fn optimize(&self, function: &Function) -> Result<Function, OptimizeError> {
        let mut body = self.run_pass(function, true)?;
        let before = node_count(&function.body);
        if node_count(&body) > before {
            debug!(
                "Optimized {} grew past {} nodes; retrying without operation extraction",
                function.name, before
            );
            let retry = self.run_pass(function, false)?;
            if node_count(&retry) <= node_count(&body) {
                body = retry;
            }
        }
        Ok(Function {
            name: function.name.clone(),
            parameters: function.parameters.clone(),
            body,
        })
    }

    fn run_pass(&self, function: &Function, extract_common: bool) -> Result<ExprRef, OptimizeError> {
        let mut pass = Pass::new(self, extract_common);
        let body = pass.optimize_expression(&function.body)?;
        debug!(
            "Optimized {}: {} cached nodes, {} parallel plans considered",
            function.name,
            pass.cache.len(),
            pass.plans
        );
        Ok(body)
    }

    /// Optimizes many functions on the rayon thread pool, each in its own pass.
    pub fn optimize_all(&self, functions: &[Function]) -> Vec<Result<Function, OptimizeError>> {
        functions
            .par_iter()
            .map(|function| self.optimize(function))
            .collect()
    }
}

/// State of one optimization run.
struct Pass<'a, C> {
    optimizer: &'a Optimizer<C>,
    canon: Canonicalizer,
    cache: HashMap<String, ExprRef>,
    plans: usize,
    extract_common: bool,
}

impl<'a, C: CostEstimator> Pass<'a, C> {
    fn new(optimizer: &'a Optimizer<C>, extract_common: bool) -> Self {
        Self {
            optimizer,
            canon: Canonicalizer::new(),
            cache: HashMap::new(),
            plans: 0,
            extract_common,
        }
    }

    fn optimize_expression(&mut self, expr: &ExprRef) -> Result<ExprRef, OptimizeError> {
        match &**expr {
            Expr::Constant(_) | Expr::Variable(_) => Ok(expr.clone()),
            Expr::Operation(operation) => self.optimize_operation(operation),
            Expr::Branch(branch) => {
                // identical branches must end up as one node, plan labels included
                let key = self.canon.key(expr);
                if let Some(cached) = self.cache.get(&key) {
                    debug!("CSE hit for a branch");
                    return Ok(cached.clone());
                }
                let result = self.optimize_branch(branch)?;
                self.cache.insert(key, result.clone());
                Ok(result)
            }
        }
    }

    fn next_plan_label(&mut self) -> Attribute {
        let label = format!("plan_{}", self.plans);
        self.plans += 1;
        Attribute::Text(label)
    }

    // ────────────────────────────────────────────────────────────────────────
    //  Operations – cse, simplify, decompose
    // ────────────────────────────────────────────────────────────────────────
    fn optimize_operation(&mut self, operation: &Operation) -> Result<ExprRef, OptimizeError> {
        let inputs = operation
            .inputs
            .iter()
            .map(|input| self.optimize_expression(input))
            .collect::<Result<Vec<_>, _>>()?;
        let rebuilt = operation.with_inputs(inputs);

        let key = self.canon.operation_key(&rebuilt);
        if let Some(cached) = self.cache.get(&key) {
            debug!("CSE hit for {}", rebuilt.op);
            return Ok(cached.clone());
        }

        let simplified = match self.optimizer.registry.simplify(&rebuilt) {
            Some(simplified) => {
                debug!("Simplified {} to {}", rebuilt.op, simplified);
                simplified
            }
            None => rebuilt.into_expr(),
        };
        let result = match &*simplified {
            Expr::Operation(operation) if self.should_decompose(operation) => {
                self.decompose(operation, &simplified)?
            }
            _ => simplified,
        };

        self.cache.insert(key, result.clone());
        Ok(result)
    }

    fn should_decompose(&self, operation: &Operation) -> bool {
        self.optimizer.config.parallelize_operations
            && operation.op.is_decomposable()
            && operation.inputs.len() >= 2
    }

    /// Splits the inputs of a decomposable operation into a parallel or serial plan.
    fn decompose(
        &mut self,
        operation: &Operation,
        original: &ExprRef,
    ) -> Result<ExprRef, OptimizeError> {
        let op = &operation.op;
        let groups = GroupingStrategy::for_op(op)
            .group(&operation.inputs, self.optimizer.config.max_parallelism);
        if groups.len() <= 1 {
            debug!("No parallel split for {}", op);
            return Ok(original.clone());
        }
        if !op.is_associative() && *op != Op::MatMul && !keeps_order(&groups, &operation.inputs) {
            debug!("Not splitting {}: its inputs would be reordered", op);
            return Ok(original.clone());
        }

        info!("Creating parallel plan for {} with {} groups", op, groups.len());
        let reduce = (*op != Op::MatMul).then(|| Attribute::Text(op.name().to_string()));
        let group_ops = groups
            .iter()
            .map(|members| {
                let group = Operation::new(Op::ParallelGroup, members.clone());
                let group = match &reduce {
                    Some(reduce) => group.with_attribute(attr::REDUCE, reduce.clone()),
                    None => group,
                };
                group.into_expr()
            })
            .collect();
        let combination = combining_operation(op, groups.len());
        let parallel = Operation::new(Op::Parallel, group_ops)
            .with_attribute(attr::COMBINATION, Attribute::Expr(combination.clone()))
            .with_attribute(attr::PLAN, self.next_plan_label());

        if self.optimizer.cost_model.is_beneficial(&parallel)? {
            return Ok(Expr::operation(
                Op::SequentialComposition,
                vec![parallel.into_expr(), combination],
            ));
        }

        info!("Parallel plan for {} is not beneficial; falling back to serial", op);
        let members = if *op == Op::MatMul {
            groups.into_iter().flatten().collect()
        } else {
            operation.inputs.clone()
        };
        let combination = combining_operation(op, members.len());
        Ok(serial(members, combination))
    }

    // ────────────────────────────────────────────────────────────────────────
    //  Branches – nesting, common operation, duplicates, planning
    // ────────────────────────────────────────────────────────────────────────
    fn optimize_branch(&mut self, branch: &Branch) -> Result<ExprRef, OptimizeError> {
        let source = self.optimize_expression(&branch.source)?;
        let alternatives = branch
            .alternatives
            .iter()
            .map(|alternative| self.optimize_expression(alternative))
            .collect::<Result<Vec<_>, _>>()?;
        let combination = self.optimize_expression(&branch.combination)?;

        if let Expr::Branch(inner) = &*source {
            if !inner.alternatives.is_empty() && !alternatives.is_empty() {
                let (alternatives, combination) = compose_nested(inner, &alternatives, &combination);
                debug!(
                    "Merged nested branch into {} composed alternatives",
                    alternatives.len()
                );
                return self.plan_branch(inner.source.clone(), alternatives, combination);
            }
        }

        if self.extract_common {
            if let Some(extracted) =
                self.extract_common_operation(&source, &alternatives, &combination)?
            {
                return Ok(extracted);
            }
        }

        let (alternatives, combination) = self.merge_duplicates(alternatives, &combination);
        self.plan_branch(source, alternatives, combination)
    }

    /// `Branch(s, [Op(a_i, t...)], Select(...))` → `Op(Branch(s, [a_i], Select(...)), t...)`.
    ///
    /// Only applies when every alternative is the same element-wise operation
    /// with identical trailing inputs and attributes, and the combination
    /// is a `Select` that picks one of two alternatives.
    fn extract_common_operation(
        &mut self,
        source: &ExprRef,
        alternatives: &[ExprRef],
        combination: &ExprRef,
    ) -> Result<Option<ExprRef>, OptimizeError> {
        if !picks_alternative(combination) {
            return Ok(None);
        }
        let Some(operations) = alternatives
            .iter()
            .map(|alternative| alternative.as_operation())
            .collect::<Option<Vec<_>>>()
        else {
            return Ok(None);
        };
        let Some(first) = operations.first() else {
            return Ok(None);
        };
        if !first.op.is_elementwise() || first.inputs.is_empty() {
            return Ok(None);
        }

        let first = *first;
        let first_tail = tail_keys(&mut self.canon, first);
        for &operation in &operations[1..] {
            let shared = operation.op == first.op
                && operation.inputs.len() == first.inputs.len()
                && operation.attributes == first.attributes
                && tail_keys(&mut self.canon, operation) == first_tail;
            if !shared {
                return Ok(None);
            }
        }

        debug!(
            "Extracting common {} out of {} alternatives",
            first.op,
            alternatives.len()
        );
        let heads = operations
            .iter()
            .map(|operation| operation.inputs[0].clone())
            .collect();
        let (heads, combination) = self.merge_duplicates(heads, combination);
        let inner = self.plan_branch(source.clone(), heads, combination)?;

        let mut inputs = vec![inner];
        inputs.extend(first.inputs[1..].iter().cloned());
        Ok(Some(first.with_inputs(inputs).into_expr()))
    }

    /// Collapses alternatives with equal keys into `MergedBranch` nodes.
    fn merge_duplicates(
        &mut self,
        alternatives: Vec<ExprRef>,
        combination: &ExprRef,
    ) -> (Vec<ExprRef>, ExprRef) {
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Vec<ExprRef>> = Vec::new();
        let mut remap = Vec::with_capacity(alternatives.len());
        for alternative in &alternatives {
            let key = self.canon.key(alternative);
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(alternative.clone());
            remap.push(slot);
        }
        if groups.len() == alternatives.len() {
            return (alternatives, combination.clone());
        }

        debug!(
            "Merged {} alternatives into {}",
            alternatives.len(),
            groups.len()
        );
        let merged = groups
            .into_iter()
            .map(|mut group| {
                if group.len() == 1 {
                    group.remove(0)
                } else {
                    Expr::operation(Op::MergedBranch, group)
                }
            })
            .collect();
        let combination = remap_placeholders(combination, &|i| remap.get(i).copied().unwrap_or(i));
        (merged, combination)
    }

    /// Turns a branch with dependent alternatives into a parallel or serial plan.
    fn plan_branch(
        &mut self,
        source: ExprRef,
        alternatives: Vec<ExprRef>,
        combination: ExprRef,
    ) -> Result<ExprRef, OptimizeError> {
        let graph = build_graph(&alternatives);
        let groups = partition_indices(&alternatives, &graph);
        if groups.len() <= 1 {
            return Ok(Branch {
                source,
                alternatives,
                combination,
            }
            .into_expr());
        }

        info!(
            "Creating parallel plan for a branch with {} groups",
            groups.len()
        );
        let mut position = vec![0; alternatives.len()];
        for (flat, &index) in groups.iter().flatten().enumerate() {
            position[index] = flat;
        }
        let bound = bind_condition(&combination, &source);
        let regrouped = remap_placeholders(&bound, &|i| position.get(i).copied().unwrap_or(i));
        let group_ops = groups
            .iter()
            .map(|members| {
                Expr::operation(
                    Op::ParallelGroup,
                    members.iter().map(|&i| alternatives[i].clone()).collect(),
                )
            })
            .collect();
        let parallel = Operation::new(Op::Parallel, group_ops)
            .with_attribute(attr::COMBINATION, Attribute::Expr(regrouped))
            .with_attribute(attr::PLAN, self.next_plan_label());

        if self.optimizer.cost_model.is_beneficial(&parallel)? {
            Ok(parallel.into_expr())
        } else {
            info!("Parallel plan for branch is not beneficial; falling back to serial");
            Ok(serial(alternatives, bound))
        }
    }
}

/// True for `Select(c, parallelResult_i, parallelResult_j)` where `c` reads
/// no alternative. Only then does `Select` commute with an element-wise
/// operation applied to every alternative.
fn picks_alternative(combination: &ExprRef) -> bool {
    let Some(select) = combination.as_operation() else {
        return false;
    };
    let is_slot = |expr: &ExprRef| {
        matches!(&**expr, Expr::Variable(name) if placeholder_index(name).is_some())
    };
    select.op == Op::Select
        && select.inputs.len() == 3
        && !reads_slot(&select.inputs[0])
        && is_slot(&select.inputs[1])
        && is_slot(&select.inputs[2])
}

fn reads_slot(expr: &ExprRef) -> bool {
    match &**expr {
        Expr::Constant(_) => false,
        Expr::Variable(name) => placeholder_index(name).is_some(),
        Expr::Operation(operation) => operation.inputs.iter().any(reads_slot),
        Expr::Branch(branch) => {
            reads_slot(&branch.source)
                || branch.alternatives.iter().any(reads_slot)
                || reads_slot(&branch.combination)
        }
    }
}

/// Keys of every input after the first.
fn tail_keys(canon: &mut Canonicalizer, operation: &Operation) -> Vec<String> {
    operation.inputs[1..]
        .iter()
        .map(|input| canon.key(input))
        .collect()
}

/// True if flattening `groups` reproduces `inputs` and only the first group
/// holds more than one member, so a left fold over the group results equals
/// a left fold over the inputs.
fn keeps_order(groups: &[Vec<ExprRef>], inputs: &[ExprRef]) -> bool {
    let flattened = groups.iter().flatten();
    groups.iter().skip(1).all(|group| group.len() == 1)
        && flattened.clone().count() == inputs.len()
        && flattened.zip(inputs).all(|(a, b)| Arc::ptr_eq(a, b))
}

/// Composes a branch whose source is itself a branch.
///
/// The result has one alternative `Compose(inner_i, outer_j)` per pair, at
/// position `i * m + j`. The inner combination is re-indexed to read the
/// left halves, the outer one keeps its indices and reads the right halves.
fn compose_nested(
    inner: &Branch,
    alternatives: &[ExprRef],
    combination: &ExprRef,
) -> (Vec<ExprRef>, ExprRef) {
    let m = alternatives.len();
    let composed = inner
        .alternatives
        .iter()
        .flat_map(|parent| {
            alternatives
                .iter()
                .map(move |child| Expr::operation(Op::Compose, vec![parent.clone(), child.clone()]))
        })
        .collect();
    let parent_combination = remap_placeholders(&inner.combination, &|i| i * m);
    let combination = Expr::operation(Op::Compose, vec![parent_combination, combination.clone()]);
    (composed, combination)
}

fn serial(members: Vec<ExprRef>, combination: ExprRef) -> ExprRef {
    Operation::new(Op::Serial, members)
        .with_attribute(attr::COMBINATION, Attribute::Expr(combination))
        .into_expr()
}

/// Expression that merges `count` group results of a split `op`.
///
/// - `Add`, `Multiply`: one flat application over all placeholders
/// - `MatMul`: `MatMulCombine` over the four quadrants
/// - `Subtract`, `Divide`: left fold `((p0 op p1) op p2) ...`
/// - element-wise functions and anything unknown: `Concatenate`
pub fn combining_operation(op: &Op, count: usize) -> ExprRef {
    let placeholders: Vec<ExprRef> = (0..count).map(placeholder).collect();
    match op {
        Op::Add | Op::Multiply => Expr::operation(op.clone(), placeholders),
        Op::MatMul => {
            if count != 4 {
                warn!("MatMulCombine expects 4 block results, got {}", count);
            }
            Expr::operation(Op::MatMulCombine, placeholders)
        }
        Op::Subtract | Op::Divide => {
            let mut placeholders = placeholders.into_iter();
            match placeholders.next() {
                Some(first) => placeholders.fold(first, |acc, next| {
                    Expr::operation(op.clone(), vec![acc, next])
                }),
                None => Expr::operation(Op::Concatenate, Vec::new()),
            }
        }
        Op::Sin | Op::Cos | Op::Exp | Op::Log => Expr::operation(Op::Concatenate, placeholders),
        _ => {
            warn!("No combining strategy for {}; concatenating results", op);
            Expr::operation(Op::Concatenate, placeholders)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::select_combination;
    use crate::eval::{evaluate, Bindings};
    use crate::expr::{node_count, Parameter, TypeInfo, CONDITION};
    use ndarray::arr0;

    fn var(name: &str) -> ExprRef {
        Expr::variable(name)
    }

    fn op(op: Op, inputs: Vec<ExprRef>) -> ExprRef {
        Expr::operation(op, inputs)
    }

    fn function(body: ExprRef, parameters: &[&str]) -> Function {
        Function {
            name: "f".into(),
            parameters: parameters
                .iter()
                .map(|p| Parameter::new(p, TypeInfo::scalar("double")))
                .collect(),
            body,
        }
    }

    /// Cost estimator with a fixed answer.
    struct Always(bool);

    impl CostEstimator for Always {
        fn is_beneficial(&self, parallel: &Operation) -> Result<bool, OptimizeError> {
            assert_eq!(parallel.op, Op::Parallel);
            Ok(self.0)
        }
    }

    fn optimizer_with(answer: bool) -> Optimizer<Always> {
        Optimizer::with_cost_model(
            OptimizerConfig::default(),
            OperationRegistry::with_default_handlers(),
            Always(answer),
        )
        .unwrap()
    }

    fn optimize(body: ExprRef, parameters: &[&str]) -> ExprRef {
        Optimizer::new(OptimizerConfig::default())
            .unwrap()
            .optimize(&function(body, parameters))
            .unwrap()
            .body
    }

    #[test]
    fn test_missing_handler_fails_eagerly() {
        let mut registry = OperationRegistry::with_default_handlers();
        registry.unregister("MatMulCombine");
        assert_eq!(
            Optimizer::with_registry(OptimizerConfig::default(), registry).unwrap_err(),
            OptimizeError::MissingHandler("MatMulCombine".to_string())
        );
        assert!(matches!(
            Optimizer::new(OptimizerConfig::default().with_max_parallelism(0)),
            Err(OptimizeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_handler_rewrites() {
        let x = var("x");
        assert_eq!(optimize(op(Op::Subtract, vec![x.clone(), Expr::number(0.0)]), &["x"]), x);
        assert_eq!(optimize(op(Op::Power, vec![x.clone(), Expr::number(1.0)]), &["x"]), x);
        assert_eq!(
            optimize(op(Op::Power, vec![x.clone(), Expr::number(0.0)]), &["x"]),
            Expr::number(1.0)
        );
        assert_eq!(optimize(op(Op::Sin, vec![Expr::number(0.0)]), &["x"]), Expr::number(0.0));
    }

    #[test]
    fn test_rewrites_cascade_bottom_up() {
        // (x - (2 - 2)) ^ (3 - 2) → x
        let body = op(
            Op::Power,
            vec![
                op(Op::Subtract, vec![var("x"), op(Op::Subtract, vec![Expr::number(2.0), Expr::number(2.0)])]),
                op(Op::Subtract, vec![Expr::number(3.0), Expr::number(2.0)]),
            ],
        );
        assert_eq!(optimize(body, &["x"]), var("x"));
    }

    #[test]
    fn test_common_subexpressions_are_shared() {
        let body = op(
            Op::Multiply,
            vec![
                op(Op::Sin, vec![var("x")]),
                op(Op::Sin, vec![var("x")]),
            ],
        );
        let optimizer = Optimizer::new(OptimizerConfig::default().with_operation_parallelism(false))
            .unwrap();
        let optimized = optimizer.optimize(&function(body, &["x"])).unwrap().body;
        let product = optimized.as_operation().unwrap();
        assert_eq!(product.op, Op::Multiply);
        assert!(Arc::ptr_eq(&product.inputs[0], &product.inputs[1]));
        assert_eq!(node_count(&optimized), 3);
    }

    #[test]
    fn test_independent_inputs_split_into_capped_groups() {
        let inputs = ["a", "b", "c", "d", "e"].map(var).to_vec();
        let body = op(Op::Add, inputs.clone());
        let optimizer = optimizer_with(true);
        let optimized = optimizer
            .optimize(&function(body, &["a", "b", "c", "d", "e"]))
            .unwrap()
            .body;

        let sequence = optimized.as_operation().unwrap();
        assert_eq!(sequence.op, Op::SequentialComposition);
        let parallel = sequence.inputs[0].as_operation().unwrap();
        assert_eq!(parallel.op, Op::Parallel);
        assert_eq!(parallel.inputs.len(), 2);
        let sizes: Vec<usize> = parallel
            .inputs
            .iter()
            .map(|g| g.as_operation().unwrap().inputs.len())
            .collect();
        assert_eq!(sizes, [4, 1]);
        assert_eq!(
            parallel.attribute(attr::REDUCE),
            None,
            "the reduce attribute lives on the groups"
        );
        assert_eq!(
            parallel.inputs[0].as_operation().unwrap().attribute(attr::REDUCE),
            Some(&Attribute::Text("Add".into()))
        );
        assert_eq!(
            sequence.inputs[1].to_string(),
            "Add(parallelResult_0, parallelResult_1)"
        );
        assert_eq!(parallel.combination(), Some(&sequence.inputs[1]));
    }

    #[test]
    fn test_unprofitable_plan_falls_back_to_serial() {
        let inputs = ["a", "b", "c", "d", "e"].map(var).to_vec();
        let body = op(Op::Add, inputs.clone());
        let optimized = optimizer_with(false)
            .optimize(&function(body, &["a", "b", "c", "d", "e"]))
            .unwrap()
            .body;

        let serial = optimized.as_operation().unwrap();
        assert_eq!(serial.op, Op::Serial);
        assert_eq!(serial.inputs, inputs);
        assert_eq!(
            serial.combination().unwrap().to_string(),
            "Add(parallelResult_0, parallelResult_1, parallelResult_2, parallelResult_3, parallelResult_4)"
        );
    }

    #[test]
    fn test_sequential_accumulation_is_not_split() {
        // x + (x + 1) + (x + 2) + ... + (x + 9), nested left to right
        let mut body = var("x");
        for k in 1..10 {
            body = op(Op::Add, vec![body, op(Op::Add, vec![var("x"), Expr::number(k as f64)])]);
        }
        let before = node_count(&body);
        let optimized = optimize(body, &["x"]);
        let text = optimized.to_string();
        assert!(!text.contains("Parallel"), "{}", text);
        assert!(!text.contains("Serial"), "{}", text);
        assert_eq!(node_count(&optimized), before);
    }

    #[test]
    fn test_matmul_blocks() {
        let body = op(Op::MatMul, vec![var("A"), var("B")]);
        let optimized = optimizer_with(true)
            .optimize(&function(body.clone(), &["A", "B"]))
            .unwrap()
            .body;
        let sequence = optimized.as_operation().unwrap();
        assert_eq!(sequence.op, Op::SequentialComposition);
        assert_eq!(
            sequence.inputs[1].to_string(),
            "MatMulCombine(parallelResult_0, parallelResult_1, parallelResult_2, parallelResult_3)"
        );
        let parallel = sequence.inputs[0].as_operation().unwrap();
        assert_eq!(parallel.inputs.len(), 4);
        for group in &parallel.inputs {
            let group = group.as_operation().unwrap();
            assert_eq!(group.attribute(attr::REDUCE), None);
            assert!(group.inputs[0].is_op(&Op::MatMulBlock));
        }

        // serial cost is the work in the groups: four blocks of 10, against the
        // slowest block plus overhead 5, communication 2 and MatMulCombine 1
        let costs = CostModel::default();
        assert_eq!(costs.serial_cost(parallel), 40.0);
        assert_eq!(costs.parallel_cost(parallel), 18.0);
        assert!(optimize(body.clone(), &["A", "B"]).is_op(&Op::SequentialComposition));

        let optimized = optimizer_with(false)
            .optimize(&function(body, &["A", "B"]))
            .unwrap()
            .body;
        let serial = optimized.as_operation().unwrap();
        assert_eq!(serial.op, Op::Serial);
        assert_eq!(serial.inputs.len(), 4);
        assert!(serial.inputs.iter().all(|block| block.is_op(&Op::MatMulBlock)));
        assert_eq!(
            serial.combination().unwrap().to_string(),
            "MatMulCombine(parallelResult_0, parallelResult_1, parallelResult_2, parallelResult_3)"
        );
    }

    #[test]
    fn test_subtract_split_respects_order() {
        // Exp(t) - t: t must be computed first, the split would reorder
        let t = op(Op::Sin, vec![var("x")]);
        let body = op(Op::Subtract, vec![op(Op::Exp, vec![t.clone()]), t.clone()]);
        let optimized = optimizer_with(true).optimize(&function(body, &["x"])).unwrap().body;
        assert!(optimized.is_op(&Op::Subtract), "{}", optimized);

        // t - Exp(t) keeps its order and is split
        let body = op(Op::Subtract, vec![t.clone(), op(Op::Exp, vec![t])]);
        let optimized = optimizer_with(true).optimize(&function(body, &["x"])).unwrap().body;
        let sequence = optimized.as_operation().unwrap();
        assert_eq!(sequence.op, Op::SequentialComposition);
        assert_eq!(
            sequence.inputs[1].to_string(),
            "Subtract(parallelResult_0, parallelResult_1)"
        );
    }

    #[test]
    fn test_operation_parallelism_can_be_disabled() {
        let body = op(Op::Add, ["a", "b", "c", "d", "e"].map(var).to_vec());
        let optimizer = Optimizer::with_cost_model(
            OptimizerConfig::default().with_operation_parallelism(false),
            OperationRegistry::with_default_handlers(),
            Always(true),
        )
        .unwrap();
        let optimized = optimizer.optimize(&function(body.clone(), &["a"])).unwrap().body;
        assert_eq!(optimized, body);
    }

    #[test]
    fn test_combining_operations() {
        assert_eq!(
            combining_operation(&Op::Multiply, 3).to_string(),
            "Multiply(parallelResult_0, parallelResult_1, parallelResult_2)"
        );
        assert_eq!(
            combining_operation(&Op::Divide, 3).to_string(),
            "Divide(Divide(parallelResult_0, parallelResult_1), parallelResult_2)"
        );
        assert_eq!(
            combining_operation(&Op::Sin, 2).to_string(),
            "Concatenate(parallelResult_0, parallelResult_1)"
        );
        assert_eq!(
            combining_operation(&Op::Custom("Blend".into()), 2).to_string(),
            "Concatenate(parallelResult_0, parallelResult_1)"
        );
    }

    #[test]
    fn test_simple_branch_is_kept() {
        let body = Expr::branch(
            op(Op::GreaterThan, vec![var("x"), Expr::number(0.0)]),
            vec![var("x"), op(Op::Negate, vec![var("y")])],
            select_combination(),
        );
        let optimized = optimize(body.clone(), &["x", "y"]);
        assert_eq!(optimized, body);
    }

    #[test]
    fn test_common_operation_is_extracted() {
        // c ? Sin(a) : Sin(b) → Sin(c ? a : b)
        let body = Expr::branch(
            var("c"),
            vec![op(Op::Sin, vec![var("a")]), op(Op::Sin, vec![var("b")])],
            select_combination(),
        );
        let optimized = optimize(body, &["a", "b", "c"]);
        assert_eq!(
            optimized.to_string(),
            "Sin(Branch(c; [a, b] => Select(condition, parallelResult_0, parallelResult_1)))"
        );

        // trailing inputs must agree
        let body = Expr::branch(
            var("c"),
            vec![
                op(Op::Add, vec![var("a"), var("t")]),
                op(Op::Add, vec![var("b"), var("u")]),
            ],
            select_combination(),
        );
        assert!(matches!(&*optimize(body, &["a", "b", "c", "t", "u"]), Expr::Branch(_)));

        // matrix products do not distribute over an element-wise select
        let body = Expr::branch(
            var("c"),
            vec![
                op(Op::MatMul, vec![var("A"), var("B")]),
                op(Op::MatMul, vec![var("C"), var("B")]),
            ],
            select_combination(),
        );
        let optimized = optimizer_with(false)
            .optimize(&function(body, &["A", "B", "C", "c"]))
            .unwrap()
            .body;
        assert!(matches!(&*optimized, Expr::Branch(_)), "{}", optimized);
    }

    #[test]
    fn test_extraction_needs_a_select_between_alternatives() {
        let combinations = [
            // the false side is a constant, not an alternative
            op(Op::Select, vec![var(CONDITION), placeholder(0), Expr::number(5.0)]),
            // an alternative decides instead of the source
            op(Op::Select, vec![placeholder(0), var(CONDITION), placeholder(1)]),
        ];
        let bindings: Bindings = [("a", 1.0), ("b", 2.0), ("c", 0.0)]
            .into_iter()
            .map(|(name, value)| (name.to_string(), arr0(value).into_dyn()))
            .collect();

        for combination in combinations {
            let body = Expr::branch(
                var("c"),
                vec![op(Op::Exp, vec![var("a")]), op(Op::Exp, vec![var("b")])],
                combination,
            );
            let f = function(body, &["a", "b", "c"]);
            let optimized = Optimizer::new(OptimizerConfig::default())
                .unwrap()
                .optimize(&f)
                .unwrap();
            assert!(!optimized.body.is_op(&Op::Exp), "{}", optimized.body);

            let expected = evaluate(&f, &bindings).unwrap();
            let actual = evaluate(&optimized, &bindings).unwrap();
            assert!(actual.approx_eq(&expected, 1e-12), "{} != {}", actual, expected);
        }
    }

    #[test]
    fn test_extraction_that_would_grow_the_tree_is_undone() {
        // Sin(x) ? Sin(x) : Sin(x), the shared Sin is also the source
        let sin = || op(Op::Sin, vec![var("x")]);
        let body = Expr::branch(sin(), vec![sin(), sin()], select_combination());
        let before = node_count(&body);
        let optimized = optimize(body, &["x"]);
        assert!(matches!(&*optimized, Expr::Branch(_)), "{}", optimized);
        assert!(node_count(&optimized) <= before);
    }

    #[test]
    fn test_identical_branches_are_shared() {
        let t = op(Op::Tan, vec![op(Op::Tan, vec![op(Op::Tan, vec![var("x")])])]);
        let branch = || {
            Expr::branch(
                var("c"),
                vec![t.clone(), op(Op::Exp, vec![t.clone()])],
                select_combination(),
            )
        };
        let body = op(
            Op::Subtract,
            vec![op(Op::Negate, vec![branch()]), op(Op::Abs, vec![branch()])],
        );
        let optimized = optimizer_with(true).optimize(&function(body, &["c", "x"])).unwrap().body;
        let text = optimized.to_string();
        assert!(text.contains("plan_0"), "{}", text);
        assert!(!text.contains("plan_1"), "{}", text);
    }

    #[test]
    fn test_duplicate_alternatives_are_merged() {
        let body = Expr::branch(
            var("c"),
            vec![var("x"), var("x")],
            select_combination(),
        );
        let optimized = optimize(body, &["c", "x"]);
        assert_eq!(
            optimized.to_string(),
            "Branch(c; [MergedBranch(x, x)] => Select(condition, parallelResult_0, parallelResult_0))"
        );
    }

    #[test]
    fn test_nested_branches_are_composed() {
        // (c ? a : b) ? p : q
        let inner = Expr::branch(var("c"), vec![var("a"), var("b")], select_combination());
        let body = Expr::branch(inner, vec![var("p"), var("q")], select_combination());
        let optimized = optimize(body, &["a", "b", "c", "p", "q"]);
        let Expr::Branch(branch) = &*optimized else {
            panic!("expected a branch, got {}", optimized);
        };
        assert_eq!(branch.source, var("c"));
        let alternatives: Vec<String> = branch.alternatives.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            alternatives,
            ["Compose(a, p)", "Compose(a, q)", "Compose(b, p)", "Compose(b, q)"]
        );
        assert_eq!(
            branch.combination.to_string(),
            "Compose(Select(condition, parallelResult_0, parallelResult_2), \
             Select(condition, parallelResult_0, parallelResult_1))"
        );
    }

    #[test]
    fn test_dependent_alternatives_become_a_plan() {
        // c ? T : Exp(T) with T = Tan(Tan(Tan(x))) shared
        let t = op(Op::Tan, vec![op(Op::Tan, vec![op(Op::Tan, vec![var("x")])])]);
        let body = Expr::branch(
            var("c"),
            vec![t.clone(), op(Op::Exp, vec![t])],
            select_combination(),
        );
        let optimized = optimize(body.clone(), &["c", "x"]);
        let parallel = optimized.as_operation().unwrap();
        assert_eq!(parallel.op, Op::Parallel);
        assert_eq!(parallel.inputs.len(), 2);
        assert_eq!(
            parallel.combination().unwrap().to_string(),
            "Select(c, parallelResult_0, parallelResult_1)"
        );
        assert_eq!(parallel.attribute(attr::PLAN), Some(&Attribute::Text("plan_0".into())));

        let serial = optimizer_with(false).optimize(&function(body, &["c", "x"])).unwrap().body;
        let serial = serial.as_operation().unwrap();
        assert_eq!(serial.op, Op::Serial);
        assert_eq!(serial.inputs.len(), 2);
        assert!(!serial.combination().unwrap().to_string().contains(CONDITION));
    }

    #[test]
    fn test_each_call_starts_fresh() {
        let body = op(Op::Add, vec![op(Op::Sin, vec![var("x")]), var("y")]);
        let optimizer = Optimizer::new(OptimizerConfig::default()).unwrap();
        let f = function(body, &["x", "y"]);
        let first = optimizer.optimize(&f).unwrap();
        let second = optimizer.optimize(&f).unwrap();
        assert_eq!(first, second);
        // no node is shared between the two results
        assert!(!Arc::ptr_eq(&first.body, &second.body));
    }

    #[test]
    fn test_optimize_all_matches_sequential_runs() {
        let optimizer = Optimizer::new(OptimizerConfig::default()).unwrap();
        let functions: Vec<Function> = (0..8)
            .map(|k| {
                function(
                    op(Op::Multiply, vec![var("x"), Expr::number(k as f64)]),
                    &["x"],
                )
            })
            .collect();
        let results = optimizer.optimize_all(&functions);
        for (function, result) in functions.iter().zip(results) {
            assert_eq!(result.unwrap(), optimizer.optimize(function).unwrap());
        }
    }
}
