//! The trust-region loop shared by all strategies.
//!
//! ```text
//! assemble H, g, F at x
//! loop:
//!     ‖g‖∞ small / F = 0 / budget exhausted  → stop
//!     δ = policy.propose(H, g)
//!     ‖δ‖ small                               → stop
//!     F_trial = F(x ⊞ δ)                      (candidate values, problem untouched)
//!     ρ = (F − F_trial) / pred
//!     ρ > 0:  commit x ⊞ δ, policy.accept, re-assemble
//!     else:   policy.reject, retry on the same linearization
//! ```
//!
//! Parameter values only change on an accepted step, so an error at any point leaves the
//! problem at the last accepted state.

use crate::core::{CoreError, problem::Problem};
use crate::linalg::{
    Damping, LinearSystem,
    assembler::{assemble, evaluate_cost},
    create_linear_solver,
};
use crate::optimizer::{
    ConvergenceReason, IterationRecord, OptimizerConfig, OptimizerError, OptimizerResult,
    SolverState, SolverSummary, create_step_policy,
};
use nalgebra::DVector;
use std::collections::HashSet;
use tracing::{debug, info};
use web_time::Instant;

/// Gain ratios with a predicted reduction below this are decided by the sign of the actual
/// reduction alone.
const MIN_PREDICTED_REDUCTION: f64 = 1e-15;

/// Nonlinear least-squares solver over a [`Problem`].
///
/// # Example
///
/// ```
/// use lsq_graph::core::problem::Problem;
/// use lsq_graph::factors::CurveResidual;
/// use lsq_graph::optimizer::{OptimizerConfig, TrustRegionOptimizer};
/// use nalgebra::dvector;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut problem = Problem::new();
/// let abc = problem.add_euclidean_block(dvector![0.0, 0.0, 0.0])?;
/// for i in 0..50 {
///     let x = i as f64 / 50.0;
///     let y = (x * x + 2.0 * x + 1.0).exp();
///     problem.add_residual(&[abc], Box::new(CurveResidual::new(x, y, 1.0)))?;
/// }
///
/// let mut optimizer = TrustRegionOptimizer::new(OptimizerConfig::new());
/// let summary = optimizer.optimize(&mut problem)?;
/// assert!(summary.is_converged());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TrustRegionOptimizer {
    config: OptimizerConfig,
    state: SolverState,
}

impl TrustRegionOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            state: SolverState::Initialized,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// State of the last (or current) run.
    pub fn state(&self) -> SolverState {
        self.state
    }

    fn fail(&mut self, error: OptimizerError) -> OptimizerError {
        self.state = SolverState::Failed;
        error.log()
    }

    fn trace(&self, line: &str) {
        if self.config.solver_verbose {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }

    fn linearize(
        &mut self,
        problem: &Problem,
        layout: &crate::linalg::BlockLayout,
        iteration: usize,
    ) -> OptimizerResult<LinearSystem> {
        assemble(
            problem,
            layout,
            &problem.value_refs(),
            self.config.numerical_failure_policy,
        )
        .map_err(|e| self.fail(OptimizerError::from_core(iteration, e)))
    }

    /// Minimize the problem's cost, updating its parameter values in place.
    ///
    /// Returns a summary on convergence or when the iteration/time budget runs out. On
    /// `Err` the state is [`SolverState::Failed`] and the values are those of the last
    /// accepted step.
    pub fn optimize(&mut self, problem: &mut Problem) -> OptimizerResult<SolverSummary> {
        let start_time = Instant::now();
        self.state = SolverState::Initialized;

        if let Err(e) = self.config.validate() {
            self.state = SolverState::Failed;
            return Err(e);
        }
        if problem.num_residual_blocks() == 0 || problem.num_free_blocks() == 0 {
            return Err(self.fail(OptimizerError::EmptyProblem));
        }

        let config = self.config.clone();
        config.print_configuration();

        let layout = problem.free_layout();
        let mut solver = create_linear_solver(config.linear_solver);
        let mut policy = create_step_policy(&config);

        let mut system = self.linearize(problem, &layout, 0)?;
        let initial_cost = system.cost;

        if config.check_gauge {
            solver
                .solve(&system.hessian, &system.gradient, Damping::None)
                .map_err(|e| self.fail(OptimizerError::from_linalg(0, e)))?;
        }
        policy.on_linearization(&system, true);
        let mut skip: HashSet<usize> = system.skipped.iter().copied().collect();

        let mut history = Vec::with_capacity(config.max_iterations + 1);
        let initial_record = IterationRecord {
            iteration: 0,
            cost: initial_cost,
            trial_cost: initial_cost,
            cost_change: 0.0,
            gradient_norm: system.gradient_max_norm(),
            step_norm: 0.0,
            gain_ratio: 0.0,
            damping: policy.region_size(),
            accepted: false,
            iter_time_ms: 0.0,
            total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
        };
        self.trace(&IterationRecord::header());
        self.trace(&initial_record.line());
        history.push(initial_record);

        self.state = SolverState::Iterating;
        let mut iteration = 0;
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut timed_out = false;

        let status = loop {
            let gradient_norm = system.gradient_max_norm();
            if gradient_norm <= config.gradient_tolerance {
                break SolverState::Converged(ConvergenceReason::GradientTolerance);
            }
            if system.cost == 0.0 {
                break SolverState::Converged(ConvergenceReason::CostRelativeTolerance);
            }
            if iteration >= config.max_iterations {
                break SolverState::MaxIterationsReached;
            }
            if let Some(timeout) = config.timeout
                && start_time.elapsed() >= timeout
            {
                timed_out = true;
                break SolverState::MaxIterationsReached;
            }

            let attempt = iteration + 1;
            let iter_start = Instant::now();
            let region_size = policy.region_size();

            let step = policy
                .propose(&system, solver.as_mut())
                .map_err(|e| self.fail(OptimizerError::from_linalg(attempt, e)))?;

            let step_norm = step.delta.norm();
            let parameter_norm = free_parameter_norm(problem);
            if step_norm <= config.step_tolerance * (parameter_norm + config.step_tolerance) {
                break SolverState::Converged(ConvergenceReason::StepTolerance);
            }
            iteration = attempt;

            let candidate = problem
                .candidate_values(&layout, &step.delta)
                .map_err(|e| self.fail(OptimizerError::from_core(attempt, e)))?;
            let candidate_refs: Vec<&DVector<f64>> = candidate.iter().collect();
            let trial_cost = match evaluate_cost(problem, &candidate_refs, &skip) {
                Ok(cost) if cost.is_finite() => cost,
                Ok(_) => f64::INFINITY,
                Err(CoreError::NumericalFailure { residual, message }) => {
                    debug!(
                        "Iteration {}: residual block {} is not finite at the trial point ({})",
                        attempt, residual, message
                    );
                    f64::INFINITY
                }
                Err(e) => return Err(self.fail(OptimizerError::from_core(attempt, e))),
            };

            let cost = system.cost;
            let actual_reduction = cost - trial_cost;
            let rho = if step.predicted_reduction.abs() < MIN_PREDICTED_REDUCTION {
                if actual_reduction > 0.0 { 1.0 } else { 0.0 }
            } else {
                actual_reduction / step.predicted_reduction
            };
            let accepted = rho > 0.0 && actual_reduction > 0.0;

            let mut converged_on_cost = false;
            let mut exhausted = false;
            if accepted {
                successful_steps += 1;
                problem.commit_values(candidate);
                policy.accept(rho, &step);

                system = self.linearize(problem, &layout, attempt)?;
                skip = system.skipped.iter().copied().collect();
                policy.on_linearization(&system, false);

                converged_on_cost =
                    actual_reduction.abs() <= config.cost_relative_tolerance * cost;
            } else {
                unsuccessful_steps += 1;
                exhausted = !policy.reject(rho, &step);
            }

            let record = IterationRecord {
                iteration: attempt,
                cost,
                trial_cost,
                cost_change: actual_reduction,
                gradient_norm,
                step_norm,
                gain_ratio: rho,
                damping: region_size,
                accepted,
                iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
            };
            self.trace(&record.line());
            history.push(record);

            if converged_on_cost {
                break SolverState::Converged(ConvergenceReason::CostRelativeTolerance);
            }
            if exhausted {
                break SolverState::Converged(ConvergenceReason::TrustRegionExhausted);
            }
        };

        self.state = status;
        let summary = SolverSummary {
            strategy: config.strategy,
            linear_solver: config.linear_solver,
            initial_cost,
            final_cost: system.cost,
            iterations: iteration,
            successful_steps,
            unsuccessful_steps,
            status,
            timed_out,
            final_gradient_norm: system.gradient_max_norm(),
            skipped_residuals: system.skipped.clone(),
            iteration_history: history,
            total_time: start_time.elapsed(),
        };
        self.trace(&summary.to_string());
        Ok(summary)
    }
}

/// `‖x‖` over the free blocks' stored values.
fn free_parameter_norm(problem: &Problem) -> f64 {
    problem
        .parameter_blocks()
        .iter()
        .filter(|block| !block.is_constant())
        .map(|block| block.value().norm_squared())
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::Residual;
    use crate::optimizer::Strategy;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// `r = [10(y − x²), 1 − x]`, minimum at (1, 1).
    struct Rosenbrock;

    impl Residual for Rosenbrock {
        fn residual_dimension(&self) -> usize {
            2
        }

        fn num_parameter_blocks(&self) -> usize {
            1
        }

        fn evaluate(
            &self,
            params: &[&DVector<f64>],
            compute_jacobians: bool,
        ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>) {
            let (x, y) = (params[0][0], params[0][1]);
            let residual = dvector![10.0 * (y - x * x), 1.0 - x];
            let jacobians = compute_jacobians
                .then(|| vec![DMatrix::from_row_slice(2, 2, &[-20.0 * x, 10.0, -1.0, 0.0])]);
            (residual, jacobians)
        }
    }

    fn rosenbrock_problem() -> Result<(Problem, usize), CoreError> {
        let mut problem = Problem::new();
        let id = problem.add_euclidean_block(dvector![-1.2, 1.0])?;
        problem.add_residual(&[id], Box::new(Rosenbrock))?;
        Ok((problem, id))
    }

    #[test]
    fn test_rosenbrock_all_strategies() -> TestResult {
        for strategy in [Strategy::LevenbergMarquardt, Strategy::GaussNewton, Strategy::Dogleg] {
            let (mut problem, id) = rosenbrock_problem()?;
            let config = OptimizerConfig::new()
                .with_strategy(strategy)
                .with_cost_relative_tolerance(1e-14);
            let mut optimizer = TrustRegionOptimizer::new(config);
            let summary = optimizer.optimize(&mut problem)?;

            assert!(summary.is_converged(), "{strategy}: {}", summary.status);
            assert_eq!(optimizer.state(), summary.status);
            let solution = problem.parameter_value(id)?;
            assert_abs_diff_eq!(solution[0], 1.0, epsilon = 1e-4);
            assert_abs_diff_eq!(solution[1], 1.0, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_trace_counts_attempts() -> TestResult {
        let (mut problem, _) = rosenbrock_problem()?;
        let mut optimizer = TrustRegionOptimizer::new(OptimizerConfig::new());
        let summary = optimizer.optimize(&mut problem)?;

        assert_eq!(summary.iteration_history.len(), summary.iterations + 1);
        assert_eq!(
            summary.iterations,
            summary.successful_steps + summary.unsuccessful_steps
        );
        assert_eq!(summary.iteration_history[0].cost, summary.initial_cost);
        for record in summary.iteration_history.iter().skip(1) {
            if record.accepted {
                assert!(record.trial_cost < record.cost);
            }
        }
        Ok(())
    }

    #[test]
    fn test_iteration_budget() -> TestResult {
        let (mut problem, _) = rosenbrock_problem()?;
        let config = OptimizerConfig::new().with_max_iterations(2);
        let mut optimizer = TrustRegionOptimizer::new(config);
        let summary = optimizer.optimize(&mut problem)?;
        assert_eq!(summary.status, SolverState::MaxIterationsReached);
        assert_eq!(summary.iterations, 2);
        assert!(!summary.timed_out);
        Ok(())
    }

    #[test]
    fn test_empty_problem() -> TestResult {
        let mut problem = Problem::new();
        let mut optimizer = TrustRegionOptimizer::new(OptimizerConfig::new());
        assert!(matches!(
            optimizer.optimize(&mut problem),
            Err(OptimizerError::EmptyProblem)
        ));
        assert_eq!(optimizer.state(), SolverState::Failed);

        let (mut problem, id) = rosenbrock_problem()?;
        problem.set_constant(id)?;
        assert!(matches!(
            optimizer.optimize(&mut problem),
            Err(OptimizerError::EmptyProblem)
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_config_fails_before_iterating() -> TestResult {
        let (mut problem, id) = rosenbrock_problem()?;
        let before = problem.parameter_value(id)?.clone();
        let config = OptimizerConfig::new().with_initial_damping_scale(-1.0);
        let mut optimizer = TrustRegionOptimizer::new(config);
        assert!(matches!(
            optimizer.optimize(&mut problem),
            Err(OptimizerError::InvalidParameters(_))
        ));
        assert_eq!(problem.parameter_value(id)?, &before);
        Ok(())
    }
}
