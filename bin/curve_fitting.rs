//! Fit `y = exp(a·x² + b·x + c)` to noisy samples of `exp(x² + 2x + 1)`.

use clap::{Parser, ValueEnum};
use lsq_graph::core::loss_functions::{CauchyLoss, HuberLoss, LossFunction};
use lsq_graph::core::problem::Problem;
use lsq_graph::factors::CurveResidual;
use lsq_graph::init_logger;
use lsq_graph::linalg::LinearSolverType;
use lsq_graph::optimizer::{OptimizerConfig, Strategy, TrustRegionOptimizer};
use lsq_graph::LsqResult;
use nalgebra::dvector;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::process::ExitCode;
use tracing::{error, info};

const TRUE_PARAMETERS: [f64; 3] = [1.0, 2.0, 1.0];

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
enum LossArg {
    L2,
    Huber,
    Cauchy,
}

#[derive(Parser)]
#[command(name = "curve_fitting")]
#[command(about = "Fit an exponential curve to synthetic noisy samples")]
struct Args {
    /// Number of samples, x = i / samples
    #[arg(short = 'n', long, default_value_t = 100)]
    samples: usize,

    /// Standard deviation of the Gaussian noise added to y
    #[arg(long, default_value_t = 1.0)]
    sigma: f64,

    /// Seed of the noise generator
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(short, long, value_enum, default_value_t = StrategyArg::Lm)]
    strategy: StrategyArg,

    /// Use faer's sparse Cholesky instead of the block Cholesky solver
    #[arg(long)]
    sparse: bool,

    #[arg(long, value_enum, default_value_t = LossArg::L2)]
    loss: LossArg,

    /// Scale of the robust loss
    #[arg(long, default_value_t = 1.0)]
    loss_scale: f64,

    #[arg(short, long, default_value_t = 100)]
    max_iterations: usize,

    /// Print the iteration table
    #[arg(short, long)]
    verbose: bool,
}

/// One standard normal sample (Box–Muller).
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn create_loss(args: &Args) -> LsqResult<Option<Box<dyn LossFunction>>> {
    let loss: Box<dyn LossFunction> = match args.loss {
        LossArg::L2 => return Ok(None),
        LossArg::Huber => Box::new(HuberLoss::new(args.loss_scale)?),
        LossArg::Cauchy => Box::new(CauchyLoss::new(args.loss_scale)?),
    };
    Ok(Some(loss))
}

fn run(args: &Args) -> LsqResult<()> {
    let [a, b, c] = TRUE_PARAMETERS;
    let mut rng = StdRng::seed_from_u64(args.seed);

    // Noise-free data still needs a finite residual weight.
    let weight_sigma = if args.sigma > 0.0 { args.sigma } else { 1.0 };

    let mut problem = Problem::new();
    let abc = problem.add_euclidean_block(dvector![0.0, 0.0, 0.0])?;
    for i in 0..args.samples {
        let x = i as f64 / args.samples as f64;
        let y = (a * x * x + b * x + c).exp() + args.sigma * gaussian(&mut rng);
        let residual = CurveResidual::new(x, y, weight_sigma);
        problem.add_residual_with_loss(&[abc], Box::new(residual), create_loss(args)?)?;
    }
    info!(
        "Curve fitting: {} samples, sigma {}, seed {}, strategy {}",
        args.samples,
        args.sigma,
        args.seed,
        Strategy::from(args.strategy)
    );

    let config = OptimizerConfig::new()
        .with_strategy(args.strategy.into())
        .with_linear_solver(if args.sparse {
            LinearSolverType::SparseCholesky
        } else {
            LinearSolverType::BlockCholesky
        })
        .with_max_iterations(args.max_iterations)
        .with_verbose(args.verbose);
    let mut optimizer = TrustRegionOptimizer::new(config);
    let summary = optimizer.optimize(&mut problem)?;

    info!("{}", summary);
    let estimate = problem.parameter_value(abc)?;
    info!("Estimated a, b, c = {:.6}, {:.6}, {:.6}", estimate[0], estimate[1], estimate[2]);
    info!("Ground truth a, b, c = {:.6}, {:.6}, {:.6}", a, b, c);
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
