//! Optimizer Benchmarks
//!
//! Two groups:
//!
//! ### 1. Optimization (`benchmark_optimization`)
//! Lowers a set of expressions once during setup, then measures a single
//! `Optimizer::optimize` call per iteration. Each call runs a fresh pass, so
//! this is the full cost of CSE, branch merging and parallel planning.
//!
//! ### 2. Evaluation (`benchmark_evaluation`)
//! Compares the reference evaluator on the lowered branch IR against the
//! optimized IR for the same inputs.
//!
//! Run with: `cargo bench --bench optimize`

use std::hint::black_box;

use branchvir::convert::convert;
use branchvir::eval::{evaluate, Bindings};
use branchvir::parse::build_function;
use branchvir::{Function, Optimizer, OptimizerConfig};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::arr0;

const EXPRESSIONS: [&str; 6] = [
    "2.2 * a + 1.1",
    "(a^3 + b^2*c - 2*a*b + c) / ((a+b)*(b+c)*(a+c) + 1)",
    "sin(a) * sin(a) + cos(a) * cos(a)",
    "if(a > b, sin(a) + c, sin(b) + c)",
    "if(if(a > 0, b, c) > 1, exp(a), exp(b))",
    "if(a > b, tan(tan(tan(a))), exp(tan(tan(tan(a)))))",
];

fn lowered(expression: &str) -> Function {
    let source = build_function("bench", expression).expect("expression parses");
    convert(&source).expect("expression lowers")
}

fn bindings(function: &Function) -> Bindings {
    function
        .parameter_names()
        .enumerate()
        .map(|(i, name)| (name.to_string(), arr0(0.5 + i as f64).into_dyn()))
        .collect()
}

fn benchmark_optimization(c: &mut Criterion) {
    let optimizer = Optimizer::new(OptimizerConfig::default()).expect("default optimizer");
    let mut group = c.benchmark_group("Optimization");

    for (i, expression) in EXPRESSIONS.iter().enumerate() {
        let function = lowered(expression);
        group.bench_with_input(
            BenchmarkId::new("Optimize", format!("expr_{}", i)),
            &function,
            |b, function| b.iter(|| black_box(optimizer.optimize(function))),
        );
    }

    group.finish();
}

fn benchmark_evaluation(c: &mut Criterion) {
    let optimizer = Optimizer::new(OptimizerConfig::default()).expect("default optimizer");
    let mut group = c.benchmark_group("Evaluation");

    for (i, expression) in EXPRESSIONS.iter().enumerate() {
        let function = lowered(expression);
        let optimized = optimizer.optimize(&function).expect("optimizes");
        let inputs = bindings(&function);

        group.bench_with_input(
            BenchmarkId::new("Lowered", format!("expr_{}", i)),
            &inputs,
            |b, inputs| b.iter(|| black_box(evaluate(&function, inputs))),
        );
        group.bench_with_input(
            BenchmarkId::new("Optimized", format!("expr_{}", i)),
            &inputs,
            |b, inputs| b.iter(|| black_box(evaluate(&optimized, inputs))),
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_optimization, benchmark_evaluation);
criterion_main!(benches);
