use branchvir::{Optimizer, OptimizerConfig, Program};
use clap::Parser;
use env_logger::Env;
use std::process;

#[derive(Parser)]
#[command(name = "branchvir")]
#[command(about = "Lower an expression to branch IR and optimize it")]
#[command(version)]
struct Args {
    /// Expression to optimize, e.g. "if(x > 0, sin(x), sin(y))"
    expression: String,

    /// Name of the generated function
    #[arg(long, default_value = "kernel")]
    name: String,

    /// Largest number of inputs placed in one parallel group
    #[arg(long, default_value_t = 4)]
    max_parallelism: usize,

    /// Only plan branches, never split operation inputs
    #[arg(long)]
    no_operation_parallelism: bool,

    /// Comma-separated values for the variables, in alphabetical order
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    eval: Option<Vec<f64>>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = OptimizerConfig::new()
        .with_max_parallelism(args.max_parallelism)
        .with_operation_parallelism(!args.no_operation_parallelism);
    let optimizer = Optimizer::new(config)?;
    let program = Program::with_optimizer(&args.name, &args.expression, &optimizer)?;
    println!("{}", program);

    if let Some(values) = &args.eval {
        let variables = program.variables().collect::<Vec<_>>().join(", ");
        println!("Inputs ({}): {:?}", variables, values);
        println!("Branch IR value: {}", program.eval_lowered(values)?);
        println!("Optimized value: {}", program.eval(values)?);
    }
    Ok(())
}
