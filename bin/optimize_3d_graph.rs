//! Optimize a 3D pose graph read from a g2o file.
//!
//! The first pose (lowest id) is held constant to remove the gauge freedom. The initial and
//! optimized poses are written as `<stem>_original.txt` / `<stem>_optimized.txt`
//! (`id px py pz qx qy qz qw`) and the optimized graph as `<stem>_optimized.g2o`.

use clap::{Parser, ValueEnum};
use lsq_graph::init_logger;
use lsq_graph::io::{G2oLoader, write_poses};
use lsq_graph::linalg::LinearSolverType;
use lsq_graph::optimizer::{OptimizerConfig, Strategy, TrustRegionOptimizer};
use lsq_graph::LsqResult;
use lsq_graph::core::CoreError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    Lm,
    Gn,
    Dogleg,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Lm => Strategy::LevenbergMarquardt,
            StrategyArg::Gn => Strategy::GaussNewton,
            StrategyArg::Dogleg => Strategy::Dogleg,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SolverArg {
    Block,
    Sparse,
}

#[derive(Parser)]
#[command(name = "optimize_3d_graph")]
#[command(about = "Optimize a 3D pose graph (VERTEX_SE3:QUAT / EDGE_SE3:QUAT)")]
struct Args {
    /// g2o file to optimize
    input: PathBuf,

    /// Directory for the pose and g2o outputs
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(short, long, default_value_t = 200)]
    max_iterations: usize,

    #[arg(short, long, value_enum, default_value_t = StrategyArg::Lm)]
    strategy: StrategyArg,

    #[arg(long, value_enum, default_value_t = SolverArg::Sparse)]
    linear_solver: SolverArg,

    /// Relative cost decrease below which the run stops
    #[arg(long, default_value_t = 1e-6)]
    cost_tolerance: f64,

    /// Wall-clock budget in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Print the iteration table
    #[arg(short, long)]
    verbose: bool,
}

fn output_path(args: &Args, suffix: &str) -> PathBuf {
    let stem = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("graph");
    args.output_dir.join(format!("{stem}{suffix}"))
}

fn run(args: &Args) -> LsqResult<()> {
    let mut graph = G2oLoader::load(&args.input)?;
    info!(
        "Loaded {}: {} poses, {} constraints",
        args.input.display(),
        graph.poses.len(),
        graph.constraints.len()
    );

    let original_path = output_path(args, "_original.txt");
    write_poses(&original_path, &graph.poses)?;

    let (mut problem, block_ids) = graph.build_problem()?;
    let (&first_pose, &first_block) = block_ids
        .iter()
        .next()
        .ok_or_else(|| CoreError::InvalidInput("the graph has no poses".to_string()).log())?;
    problem.set_constant(first_block)?;
    info!("Holding pose {} constant", first_pose);

    let mut config = OptimizerConfig::new()
        .with_strategy(args.strategy.into())
        .with_linear_solver(match args.linear_solver {
            SolverArg::Block => LinearSolverType::BlockCholesky,
            SolverArg::Sparse => LinearSolverType::SparseCholesky,
        })
        .with_max_iterations(args.max_iterations)
        .with_cost_relative_tolerance(args.cost_tolerance)
        .with_verbose(args.verbose);
    if let Some(seconds) = args.timeout {
        config = config.with_timeout(web_time::Duration::from_secs_f64(seconds));
    }

    let mut optimizer = TrustRegionOptimizer::new(config);
    let summary = optimizer.optimize(&mut problem)?;
    info!("{}", summary);
    if !summary.is_converged() {
        warn!("Stopped before convergence: {}", summary.status);
    }

    graph.update_poses(&problem, &block_ids)?;
    let optimized_path = output_path(args, "_optimized.txt");
    write_poses(&optimized_path, &graph.poses)?;
    let g2o_path = output_path(args, "_optimized.g2o");
    G2oLoader::write(&graph, &g2o_path)?;

    for path in [&original_path, &optimized_path, &g2o_path] {
        info!("Wrote {}", path.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logger();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.chain());
            ExitCode::FAILURE
        }
    }
}
