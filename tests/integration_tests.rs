//! End-to-end tests: curve fitting, pose-graph cycles, gauge handling, numerical failure
//! policies, robust losses and g2o input.

use approx::assert_abs_diff_eq;
use lsq_graph::core::CoreError;
use lsq_graph::core::loss_functions::{HuberLoss, LossFunction};
use lsq_graph::core::pose_graph::{PoseConstraint, PoseGraph};
use lsq_graph::core::problem::Problem;
use lsq_graph::core::residual_block::NumericalFailurePolicy;
use lsq_graph::factors::{CurveResidual, PriorResidual, Residual};
use lsq_graph::linalg::LinearSolverType;
use lsq_graph::manifold::Pose3;
use lsq_graph::optimizer::{
    OptimizerConfig, OptimizerError, SolverState, SolverSummary, Strategy, TrustRegionOptimizer,
};
use nalgebra::{DMatrix, DVector, Matrix6, UnitQuaternion, Vector3, dvector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_2;
use web_time::Duration;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const STRATEGIES: [Strategy; 3] = [
    Strategy::LevenbergMarquardt,
    Strategy::GaussNewton,
    Strategy::Dogleg,
];
const LINEAR_SOLVERS: [LinearSolverType; 2] = [
    LinearSolverType::BlockCholesky,
    LinearSolverType::SparseCholesky,
];

fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// `y = exp(x² + 2x + 1) + σ·n` at `x = i / samples`, fitted from `(0, 0, 0)`.
fn curve_problem(samples: usize, sigma: f64, seed: u64) -> Result<(Problem, usize), CoreError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let weight_sigma = if sigma > 0.0 { sigma } else { 1.0 };

    let mut problem = Problem::new();
    let abc = problem.add_euclidean_block(dvector![0.0, 0.0, 0.0])?;
    for i in 0..samples {
        let x = i as f64 / samples as f64;
        let y = (x * x + 2.0 * x + 1.0).exp() + sigma * gaussian(&mut rng);
        problem.add_residual(&[abc], Box::new(CurveResidual::new(x, y, weight_sigma)))?;
    }
    Ok((problem, abc))
}

/// Unit square walked counter-clockwise, turning 90° about z at every corner.
fn square_poses() -> BTreeMap<usize, Pose3> {
    let corners = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(1.0, 1.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
    ];
    corners
        .iter()
        .enumerate()
        .map(|(i, corner)| {
            let yaw = UnitQuaternion::from_euler_angles(0.0, 0.0, i as f64 * FRAC_PI_2);
            (i, Pose3::new(yaw, *corner))
        })
        .collect()
}

fn relative(from: &Pose3, to: &Pose3) -> Pose3 {
    let inverse = from.rotation.inverse();
    Pose3::new(inverse * to.rotation, inverse * (to.translation - from.translation))
}

/// Four-pose cycle with exact measurements and perturbed initial values (pose 0 exact).
fn square_graph() -> PoseGraph {
    let truth = square_poses();
    let mut graph = PoseGraph::new();
    for (&id, pose) in &truth {
        let initial = if id == 0 {
            *pose
        } else {
            let k = id as f64;
            let noise = UnitQuaternion::from_euler_angles(0.05 * k, -0.03, 0.08);
            Pose3::new(
                noise * pose.rotation,
                pose.translation + Vector3::new(0.1, -0.15 * k, 0.05),
            )
        };
        graph.add_pose(id, initial);
    }
    for i in 0..4 {
        let j = (i + 1) % 4;
        graph.add_constraint(PoseConstraint {
            begin: i,
            end: j,
            measurement: relative(&truth[&i], &truth[&j]),
            information: Matrix6::identity(),
        });
    }
    graph
}

fn tight_config(strategy: Strategy, linear_solver: LinearSolverType) -> OptimizerConfig {
    OptimizerConfig::new()
        .with_strategy(strategy)
        .with_linear_solver(linear_solver)
        .with_max_iterations(100)
        .with_cost_relative_tolerance(1e-12)
        .with_gradient_tolerance(1e-12)
}

fn assert_monotone(summary: &SolverSummary) {
    let history = &summary.iteration_history;
    assert_eq!(history.len(), summary.iterations + 1);
    for pair in history.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        if before.iteration > 0 && !before.accepted {
            assert_eq!(after.cost, before.cost, "a rejected step changed the cost");
        }
        assert!(after.cost <= before.cost);
    }
    for record in history.iter().filter(|r| r.accepted) {
        assert!(record.trial_cost < record.cost);
    }
}

/// Residual that is NaN wherever it is evaluated.
struct PoisonResidual;

impl Residual for PoisonResidual {
    fn residual_dimension(&self) -> usize {
        1
    }

    fn num_parameter_blocks(&self) -> usize {
        1
    }

    fn evaluate(
        &self,
        _params: &[&DVector<f64>],
        compute_jacobians: bool,
    ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>) {
        let jacobians = compute_jacobians.then(|| vec![DMatrix::from_element(1, 1, f64::NAN)]);
        (DVector::from_element(1, f64::NAN), jacobians)
    }
}

/// `r = a·x + b − y` over the block `[a, b]`.
struct LineResidual {
    x: f64,
    y: f64,
}

impl Residual for LineResidual {
    fn residual_dimension(&self) -> usize {
        1
    }

    fn num_parameter_blocks(&self) -> usize {
        1
    }

    fn evaluate(
        &self,
        params: &[&DVector<f64>],
        compute_jacobians: bool,
    ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>) {
        let (a, b) = (params[0][0], params[0][1]);
        let residual = dvector![a * self.x + b - self.y];
        let jacobians = compute_jacobians.then(|| vec![DMatrix::from_row_slice(1, 2, &[self.x, 1.0])]);
        (residual, jacobians)
    }
}

#[test]
fn test_curve_fitting_noise_free() -> TestResult {
    let (mut problem, abc) = curve_problem(100, 0.0, 1)?;
    let mut optimizer = TrustRegionOptimizer::new(tight_config(
        Strategy::LevenbergMarquardt,
        LinearSolverType::BlockCholesky,
    ));
    let summary = optimizer.optimize(&mut problem)?;

    assert!(summary.is_converged(), "status {}", summary.status);
    let estimate = problem.parameter_value(abc)?;
    assert_abs_diff_eq!(estimate[0], 1.0, epsilon = 1e-4);
    assert_abs_diff_eq!(estimate[1], 2.0, epsilon = 1e-4);
    assert_abs_diff_eq!(estimate[2], 1.0, epsilon = 1e-4);
    assert!(summary.final_cost < 1e-8);
    assert_monotone(&summary);
    Ok(())
}

#[test]
fn test_curve_fitting_with_noise() -> TestResult {
    for linear_solver in LINEAR_SOLVERS {
        let (mut problem, abc) = curve_problem(100, 1.0, 42)?;
        let config = OptimizerConfig::new()
            .with_strategy(Strategy::LevenbergMarquardt)
            .with_linear_solver(linear_solver);
        let mut optimizer = TrustRegionOptimizer::new(config);
        let summary = optimizer.optimize(&mut problem)?;

        assert!(
            matches!(
                summary.status,
                SolverState::Converged(_) | SolverState::MaxIterationsReached
            ),
            "status {}",
            summary.status
        );
        assert!(summary.final_cost < summary.initial_cost);
        let estimate = problem.parameter_value(abc)?;
        assert_abs_diff_eq!(estimate[0], 1.0, epsilon = 0.25);
        assert_abs_diff_eq!(estimate[1], 2.0, epsilon = 0.25);
        assert_abs_diff_eq!(estimate[2], 1.0, epsilon = 0.25);
        assert_monotone(&summary);
    }
    Ok(())
}

#[test]
fn test_pose_cycle_all_strategies_and_solvers() -> TestResult {
    let truth = square_poses();
    for strategy in STRATEGIES {
        for linear_solver in LINEAR_SOLVERS {
            let mut graph = square_graph();
            let (mut problem, block_ids) = graph.build_problem()?;
            problem.set_constant(block_ids[&0])?;

            let mut optimizer = TrustRegionOptimizer::new(tight_config(strategy, linear_solver));
            let summary = optimizer.optimize(&mut problem)?;

            assert!(
                summary.is_converged(),
                "{strategy} / {linear_solver}: {}",
                summary.status
            );
            assert!(summary.final_cost < 1e-10, "{strategy} / {linear_solver}");
            assert_monotone(&summary);

            graph.update_poses(&problem, &block_ids)?;
            for (id, pose) in &graph.poses {
                assert!(
                    pose.is_approx(&truth[id], 1e-4),
                    "{strategy} / {linear_solver}: pose {id} = {pose:?}"
                );
            }
        }
    }
    Ok(())
}

#[test]
fn test_pose_cycle_without_fixed_block_is_singular() -> TestResult {
    let graph = square_graph();
    let (mut problem, _) = graph.build_problem()?;
    let before = problem.parameter_values();

    let mut optimizer = TrustRegionOptimizer::new(OptimizerConfig::new());
    let result = optimizer.optimize(&mut problem);

    assert!(matches!(
        result,
        Err(OptimizerError::SingularSystem { iteration: 0, .. })
    ));
    assert_eq!(optimizer.state(), SolverState::Failed);
    assert_eq!(problem.parameter_values(), before);
    Ok(())
}

#[test]
fn test_pose_prior_removes_gauge_freedom() -> TestResult {
    let truth = square_poses();
    let graph = square_graph();
    let (mut problem, block_ids) = graph.build_problem()?;
    problem.add_residual(&[block_ids[&0]], Box::new(PriorResidual::pose(truth[&0])))?;

    let mut optimizer = TrustRegionOptimizer::new(tight_config(
        Strategy::LevenbergMarquardt,
        LinearSolverType::BlockCholesky,
    ));
    let summary = optimizer.optimize(&mut problem)?;

    assert!(summary.is_converged());
    assert!(summary.final_cost < 1e-10);
    Ok(())
}

#[test]
fn test_rerun_after_convergence_is_stable() -> TestResult {
    let graph = square_graph();
    let (mut problem, block_ids) = graph.build_problem()?;
    problem.set_constant(block_ids[&0])?;

    let config = tight_config(Strategy::Dogleg, LinearSolverType::BlockCholesky);
    let first = TrustRegionOptimizer::new(config.clone()).optimize(&mut problem)?;
    let values = problem.parameter_values();

    let second = TrustRegionOptimizer::new(config).optimize(&mut problem)?;
    assert!(second.is_converged());
    assert!(second.final_cost <= first.final_cost);
    assert!(second.iterations <= 2);
    for (after, before) in problem.parameter_values().iter().zip(&values) {
        assert_abs_diff_eq!(*after, *before, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn test_unknown_block_is_rejected() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_euclidean_block(dvector![0.0])?;

    let result = problem.add_residual(&[x + 5], Box::new(PriorResidual::euclidean(dvector![1.0])));
    assert!(matches!(result, Err(CoreError::UnknownBlock { id }) if id == x + 5));
    assert_eq!(problem.num_residual_blocks(), 0);

    let mut graph = PoseGraph::new();
    graph.add_pose(0, Pose3::identity());
    graph.add_constraint(PoseConstraint {
        begin: 0,
        end: 7,
        measurement: Pose3::identity(),
        information: Matrix6::identity(),
    });
    assert!(matches!(
        graph.build_problem(),
        Err(CoreError::UnknownBlock { id: 7 })
    ));
    Ok(())
}

#[test]
fn test_numerical_failure_fail_fast() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_euclidean_block(dvector![0.0])?;
    problem.add_residual(&[x], Box::new(PriorResidual::euclidean(dvector![3.0])))?;
    let poison = problem.add_residual(&[x], Box::new(PoisonResidual))?;

    let mut optimizer = TrustRegionOptimizer::new(
        OptimizerConfig::new().with_numerical_failure_policy(NumericalFailurePolicy::FailFast),
    );
    let result = optimizer.optimize(&mut problem);

    assert!(matches!(
        result,
        Err(OptimizerError::NumericalFailure { iteration: 0, residual, .. }) if residual == poison
    ));
    assert_eq!(optimizer.state(), SolverState::Failed);
    assert_eq!(problem.parameter_value(x)?, &dvector![0.0]);
    Ok(())
}

#[test]
fn test_numerical_failure_skip_and_warn() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_euclidean_block(dvector![0.0])?;
    problem.add_residual(&[x], Box::new(PriorResidual::euclidean(dvector![3.0])))?;
    let poison = problem.add_residual(&[x], Box::new(PoisonResidual))?;

    let mut optimizer = TrustRegionOptimizer::new(
        OptimizerConfig::new()
            .with_numerical_failure_policy(NumericalFailurePolicy::SkipAndWarn)
            .with_cost_relative_tolerance(1e-12),
    );
    let summary = optimizer.optimize(&mut problem)?;

    assert!(summary.is_converged());
    assert_eq!(summary.skipped_residuals, vec![poison]);
    assert_abs_diff_eq!(problem.parameter_value(x)?[0], 3.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_zero_timeout_stops_immediately() -> TestResult {
    let (mut problem, abc) = curve_problem(50, 0.0, 3)?;
    let mut optimizer =
        TrustRegionOptimizer::new(OptimizerConfig::new().with_timeout(Duration::ZERO));
    let summary = optimizer.optimize(&mut problem)?;

    assert_eq!(summary.status, SolverState::MaxIterationsReached);
    assert!(summary.timed_out);
    assert_eq!(summary.iterations, 0);
    assert_eq!(problem.parameter_value(abc)?, &dvector![0.0, 0.0, 0.0]);
    Ok(())
}

/// Fit `y = 2x + 1` with one gross outlier, optionally under a Huber loss.
fn fit_line_with_outlier(robust: bool) -> Result<DVector<f64>, Box<dyn std::error::Error>> {
    let mut problem = Problem::new();
    let line = problem.add_euclidean_block(dvector![0.0, 0.0])?;
    for i in 0..20 {
        let x = i as f64 * 0.5;
        let mut y = 2.0 * x + 1.0;
        if i == 10 {
            y += 100.0;
        }
        let loss: Option<Box<dyn LossFunction>> = if robust {
            Some(Box::new(HuberLoss::new(1.0)?))
        } else {
            None
        };
        problem.add_residual_with_loss(&[line], Box::new(LineResidual { x, y }), loss)?;
    }
    let config = OptimizerConfig::new()
        .with_max_iterations(200)
        .with_cost_relative_tolerance(1e-12);
    TrustRegionOptimizer::new(config).optimize(&mut problem)?;
    Ok(problem.parameter_value(line)?.clone())
}

#[test]
fn test_huber_loss_limits_outlier_influence() -> TestResult {
    let truth = dvector![2.0, 1.0];
    let plain_error = (fit_line_with_outlier(false)? - &truth).norm();
    let robust_error = (fit_line_with_outlier(true)? - &truth).norm();

    assert!(plain_error > 1.0, "plain error {plain_error}");
    assert!(
        robust_error < plain_error / 2.0,
        "robust {robust_error} vs plain {plain_error}"
    );
    Ok(())
}

#[cfg(feature = "io")]
#[test]
fn test_g2o_graph_optimization() -> TestResult {
    use lsq_graph::io::G2oLoader;

    let graph = square_graph();
    let identity_upper = "1 0 0 0 0 0 1 0 0 0 0 1 0 0 0 1 0 0 1 0 1";
    let mut content = String::from("# square\n");
    for (id, pose) in &graph.poses {
        let v = pose.to_vector();
        content.push_str(&format!(
            "VERTEX_SE3:QUAT {id} {} {} {} {} {} {} {}\n",
            v[4], v[5], v[6], v[0], v[1], v[2], v[3]
        ));
    }
    for constraint in &graph.constraints {
        let v = constraint.measurement.to_vector();
        content.push_str(&format!(
            "EDGE_SE3:QUAT {} {} {} {} {} {} {} {} {} {identity_upper}\n",
            constraint.begin, constraint.end, v[4], v[5], v[6], v[0], v[1], v[2], v[3]
        ));
    }

    let mut loaded = G2oLoader::parse_content(&content)?;
    assert_eq!(loaded.poses.len(), 4);
    assert_eq!(loaded.constraints.len(), 4);

    let (mut problem, block_ids) = loaded.build_problem()?;
    problem.set_constant(block_ids[&0])?;
    let summary = TrustRegionOptimizer::new(tight_config(
        Strategy::LevenbergMarquardt,
        LinearSolverType::SparseCholesky,
    ))
    .optimize(&mut problem)?;
    assert!(summary.is_converged());
    assert!(summary.final_cost < 1e-10);

    loaded.update_poses(&problem, &block_ids)?;
    let truth = square_poses();
    for (id, pose) in &loaded.poses {
        assert!(pose.is_approx(&truth[id], 1e-4), "pose {id}");
    }
    Ok(())
}
