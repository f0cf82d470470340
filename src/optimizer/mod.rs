//! Trust-region optimization of a [`Problem`].
//!
//! One loop ([`TrustRegionOptimizer`]) drives every strategy; the strategies differ only in
//! how a step is proposed from the linear system and how a gain ratio updates their state
//! ([`StepPolicy`]):
//! - Levenberg-Marquardt: damped normal equations, Nielsen damping update
//! - Gauss-Newton: undamped normal equations, backtracking on rejection
//! - Dogleg: Powell dogleg between the Cauchy point and the Gauss-Newton step
//!
//! The cost is `F(x) = Σ ρ(‖S r‖²)` without a ½ factor, so the quadratic model used for the
//! gain ratio is `F(δ) ≈ F + 2gᵀδ + δᵀHδ`.

use crate::core::CoreError;
use crate::linalg::{self, LinAlgError, LinearSolver, LinearSolverType, LinearSystem};
use crate::core::residual_block::NumericalFailurePolicy;
use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::{debug, error, info};
use web_time::Duration;

pub mod dog_leg;
pub mod gauss_newton;
pub mod levenberg_marquardt;
pub mod trust_region;

pub use dog_leg::DogLeg;
pub use gauss_newton::GaussNewton;
pub use levenberg_marquardt::LevenbergMarquardt;
pub use trust_region::TrustRegionOptimizer;

/// Step strategy of the trust-region loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    GaussNewton,
    /// Dogleg trust region
    Dogleg,
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            Strategy::GaussNewton => write!(f, "Gauss-Newton"),
            Strategy::Dogleg => write!(f, "Dogleg"),
        }
    }
}

/// Diagonal matrix `D` in the Levenberg-Marquardt system `(H + λD) δ = −g`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DampingScaling {
    /// `D = I`
    #[default]
    Identity,
    /// `D = diag(H)`, clamped to `[1e-6, 1e32]`
    HessianDiagonal,
}

/// Why a run converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceReason {
    /// `‖g‖∞ ≤ gradient_tolerance`
    GradientTolerance,
    /// `|ΔF| ≤ cost_relative_tolerance · F` on an accepted step, or `F = 0`
    CostRelativeTolerance,
    /// `‖δ‖ ≤ step_tolerance · (‖x‖ + step_tolerance)`
    StepTolerance,
    /// Damping too large, trust region too small or line search exhausted
    TrustRegionExhausted,
}

impl Display for ConvergenceReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceReason::GradientTolerance => write!(f, "gradient tolerance reached"),
            ConvergenceReason::CostRelativeTolerance => write!(f, "cost tolerance reached"),
            ConvergenceReason::StepTolerance => write!(f, "step tolerance reached"),
            ConvergenceReason::TrustRegionExhausted => write!(f, "trust region exhausted"),
        }
    }
}

/// Lifecycle of one optimization run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    #[default]
    Initialized,
    Iterating,
    Converged(ConvergenceReason),
    /// Iteration or wall-clock budget exhausted; the estimate is usable
    MaxIterationsReached,
    Failed,
}

impl SolverState {
    pub fn is_converged(&self) -> bool {
        matches!(self, SolverState::Converged(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SolverState::Converged(_) | SolverState::MaxIterationsReached | SolverState::Failed
        )
    }
}

impl Display for SolverState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SolverState::Initialized => write!(f, "Initialized"),
            SolverState::Iterating => write!(f, "Iterating"),
            SolverState::Converged(reason) => write!(f, "Converged ({reason})"),
            SolverState::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            SolverState::Failed => write!(f, "Failed"),
        }
    }
}

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The normal equations are singular, usually an unfixed gauge freedom
    #[error("Singular linear system at iteration {iteration}{}", block_suffix(.block))]
    SingularSystem {
        iteration: usize,
        block: Option<usize>,
    },

    /// A residual evaluated to NaN/Inf at the current estimate
    #[error("Numerical failure in residual block {residual} at iteration {iteration}: {message}")]
    NumericalFailure {
        iteration: usize,
        residual: usize,
        message: String,
    },

    /// Problem has no residual blocks or no free parameter blocks
    #[error("Problem has no variables to optimize")]
    EmptyProblem,

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),

    /// Problem evaluation failed for a reason other than non-finite values
    #[error("Problem evaluation failed: {0}")]
    Core(#[from] CoreError),
}

fn block_suffix(block: &Option<usize>) -> String {
    block
        .map(|id| format!(" (parameter block {id})"))
        .unwrap_or_default()
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }

    /// Attach the iteration index to a linear algebra failure.
    pub(crate) fn from_linalg(iteration: usize, error: LinAlgError) -> Self {
        match error {
            LinAlgError::SingularMatrix { block } => {
                OptimizerError::SingularSystem { iteration, block }
            }
            other => OptimizerError::LinAlg(other),
        }
    }

    /// Attach the iteration index to an evaluation failure.
    pub(crate) fn from_core(iteration: usize, error: CoreError) -> Self {
        match error {
            CoreError::NumericalFailure { residual, message } => OptimizerError::NumericalFailure {
                iteration,
                residual,
                message,
            },
            other => OptimizerError::Core(other),
        }
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Configuration of a [`TrustRegionOptimizer`] run.
///
/// ```
/// use lsq_graph::optimizer::{OptimizerConfig, Strategy};
///
/// let config = OptimizerConfig::new()
///     .with_strategy(Strategy::Dogleg)
///     .with_max_iterations(50)
///     .with_gradient_tolerance(1e-12);
/// assert_eq!(config.max_iterations, 50);
/// ```
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub strategy: Strategy,
    pub linear_solver: LinearSolverType,
    /// Maximum number of iterations (accepted and rejected steps)
    pub max_iterations: usize,
    /// Convergence tolerance for `‖g‖∞`
    pub gradient_tolerance: f64,
    /// Convergence tolerance for `|ΔF| / F`
    pub cost_relative_tolerance: f64,
    /// Convergence tolerance for `‖δ‖ / (‖x‖ + tol)`
    pub step_tolerance: f64,
    /// τ in `λ₀ = τ · max(diag H)`
    pub initial_damping_scale: f64,
    pub damping_scaling: DampingScaling,
    /// Levenberg-Marquardt gives up once λ exceeds this
    pub max_damping: f64,
    pub initial_trust_region_radius: f64,
    pub min_trust_region_radius: f64,
    /// Gauss-Newton step halvings before giving up on a linearization
    pub max_line_search_steps: usize,
    pub numerical_failure_policy: NumericalFailurePolicy,
    /// Factor the undamped system once before iterating to detect gauge freedom
    pub check_gauge: bool,
    /// Log the iteration table at `info` instead of `debug`
    pub solver_verbose: bool,
    /// Wall-clock budget, checked at iteration boundaries
    pub timeout: Option<Duration>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            linear_solver: LinearSolverType::default(),
            max_iterations: 100,
            gradient_tolerance: 1e-10,
            cost_relative_tolerance: 1e-6,
            step_tolerance: 1e-8,
            initial_damping_scale: 1e-5,
            damping_scaling: DampingScaling::default(),
            max_damping: 1e32,
            initial_trust_region_radius: 1e4,
            min_trust_region_radius: 1e-32,
            max_line_search_steps: 10,
            numerical_failure_policy: NumericalFailurePolicy::default(),
            check_gauge: true,
            solver_verbose: false,
            timeout: None,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_linear_solver(mut self, linear_solver: LinearSolverType) -> Self {
        self.linear_solver = linear_solver;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_cost_relative_tolerance(mut self, cost_relative_tolerance: f64) -> Self {
        self.cost_relative_tolerance = cost_relative_tolerance;
        self
    }

    pub fn with_step_tolerance(mut self, step_tolerance: f64) -> Self {
        self.step_tolerance = step_tolerance;
        self
    }

    pub fn with_initial_damping_scale(mut self, tau: f64) -> Self {
        self.initial_damping_scale = tau;
        self
    }

    pub fn with_damping_scaling(mut self, damping_scaling: DampingScaling) -> Self {
        self.damping_scaling = damping_scaling;
        self
    }

    pub fn with_max_damping(mut self, max_damping: f64) -> Self {
        self.max_damping = max_damping;
        self
    }

    pub fn with_trust_region_radius(mut self, initial: f64, min: f64) -> Self {
        self.initial_trust_region_radius = initial;
        self.min_trust_region_radius = min;
        self
    }

    pub fn with_max_line_search_steps(mut self, steps: usize) -> Self {
        self.max_line_search_steps = steps;
        self
    }

    pub fn with_numerical_failure_policy(mut self, policy: NumericalFailurePolicy) -> Self {
        self.numerical_failure_policy = policy;
        self
    }

    pub fn with_check_gauge(mut self, check_gauge: bool) -> Self {
        self.check_gauge = check_gauge;
        self
    }

    pub fn with_verbose(mut self, solver_verbose: bool) -> Self {
        self.solver_verbose = solver_verbose;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject tolerances and trust-region settings that cannot work.
    pub fn validate(&self) -> OptimizerResult<()> {
        let non_negative = [
            ("gradient_tolerance", self.gradient_tolerance),
            ("cost_relative_tolerance", self.cost_relative_tolerance),
            ("step_tolerance", self.step_tolerance),
            ("min_trust_region_radius", self.min_trust_region_radius),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(OptimizerError::InvalidParameters(format!(
                    "{name} must be finite and non-negative, got {value}"
                ))
                .log());
            }
        }

        let positive = [
            ("initial_damping_scale", self.initial_damping_scale),
            ("max_damping", self.max_damping),
            ("initial_trust_region_radius", self.initial_trust_region_radius),
        ];
        for (name, value) in positive {
            if value.is_nan() || value <= 0.0 {
                return Err(OptimizerError::InvalidParameters(format!(
                    "{name} must be positive, got {value}"
                ))
                .log());
            }
        }

        if self.min_trust_region_radius >= self.initial_trust_region_radius {
            return Err(OptimizerError::InvalidParameters(format!(
                "min_trust_region_radius {:.2e} must be below the initial radius {:.2e}",
                self.min_trust_region_radius, self.initial_trust_region_radius
            ))
            .log());
        }
        Ok(())
    }

    /// Log the configuration (`info` when verbose, `debug` otherwise).
    pub fn print_configuration(&self) {
        let text = format!(
            "Configuration:\n  Strategy:            {}\n  Linear solver:       {}\n  Max iterations:      {}\n  Gradient tolerance:  {:.2e}\n  Cost tolerance:      {:.2e}\n  Step tolerance:      {:.2e}\n  Timeout:             {:?}\n  Damping scale (tau): {:.2e}\n  Damping scaling:     {:?}\n  Max damping:         {:.2e}\n  Trust region radius: {:.2e} (min {:.2e})\n  Line search steps:   {}\n  Failure policy:      {:?}\n  Gauge check:         {}",
            self.strategy,
            self.linear_solver,
            self.max_iterations,
            self.gradient_tolerance,
            self.cost_relative_tolerance,
            self.step_tolerance,
            self.timeout,
            self.initial_damping_scale,
            self.damping_scaling,
            self.max_damping,
            self.initial_trust_region_radius,
            self.min_trust_region_radius,
            self.max_line_search_steps,
            self.numerical_failure_policy,
            if self.check_gauge { "enabled" } else { "disabled" },
        );
        if self.solver_verbose {
            info!("{}", text);
        } else {
            debug!("{}", text);
        }
    }
}

/// A step proposed by a [`StepPolicy`].
#[derive(Debug, Clone)]
pub struct ProposedStep {
    pub delta: DVector<f64>,
    /// Decrease of the quadratic model, `−2gᵀδ − δᵀHδ`
    pub predicted_reduction: f64,
}

/// Strategy-specific part of the trust-region loop.
pub trait StepPolicy: Send {
    /// Called on every new linearization; `first` is true for the initial one.
    fn on_linearization(&mut self, system: &LinearSystem, first: bool);

    /// Step for the current linearization and policy state.
    fn propose(
        &mut self,
        system: &LinearSystem,
        solver: &mut dyn LinearSolver,
    ) -> linalg::LinAlgResult<ProposedStep>;

    /// The step was accepted with gain ratio `rho > 0`.
    fn accept(&mut self, rho: f64, step: &ProposedStep);

    /// The step was rejected. Returns `false` once the policy cannot shrink further.
    fn reject(&mut self, rho: f64, step: &ProposedStep) -> bool;

    /// Damping λ or trust-region radius Δ, for the iteration trace.
    fn region_size(&self) -> f64;
}

/// Model decrease `−2gᵀδ − δᵀHδ` of `F(δ) ≈ F + 2gᵀδ + δᵀHδ`.
pub fn predicted_reduction(system: &LinearSystem, delta: &DVector<f64>) -> f64 {
    -2.0 * system.gradient.dot(delta) - system.hessian.quadratic_form(delta)
}

/// Create the step policy for `config.strategy`.
pub fn create_step_policy(config: &OptimizerConfig) -> Box<dyn StepPolicy> {
    match config.strategy {
        Strategy::LevenbergMarquardt => Box::new(LevenbergMarquardt::new(config)),
        Strategy::GaussNewton => Box::new(GaussNewton::new(config)),
        Strategy::Dogleg => Box::new(DogLeg::new(config)),
    }
}

/// One row of the iteration trace.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    /// Iteration number (0 = initial linearization)
    pub iteration: usize,
    /// Cost before the step
    pub cost: f64,
    /// Cost at the proposed point (`cost` for iteration 0)
    pub trial_cost: f64,
    /// `cost − trial_cost`
    pub cost_change: f64,
    /// `‖g‖∞` of the linearization the step was computed from
    pub gradient_norm: f64,
    pub step_norm: f64,
    pub gain_ratio: f64,
    /// λ (Levenberg-Marquardt) or Δ (Dogleg) used for the step
    pub damping: f64,
    pub accepted: bool,
    pub iter_time_ms: f64,
    pub total_time_ms: f64,
}

impl IterationRecord {
    pub fn header() -> String {
        format!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "tr_ratio",
            "tr_radius",
            "iter_time",
            "total_time",
            "status"
        )
    }

    pub fn line(&self) -> String {
        let status = if self.iteration == 0 {
            "-"
        } else if self.accepted {
            "✓"
        } else {
            "✗"
        };
        format!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.gain_ratio,
            self.damping,
            self.iter_time_ms,
            self.total_time_ms,
            status
        )
    }
}

/// Outcome of a run that did not fail.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub strategy: Strategy,
    pub linear_solver: LinearSolverType,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Accepted plus rejected steps
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub status: SolverState,
    /// Whether `MaxIterationsReached` came from the wall-clock budget
    pub timed_out: bool,
    pub final_gradient_norm: f64,
    /// Residual blocks skipped at the last linearization
    pub skipped_residuals: Vec<usize>,
    pub iteration_history: Vec<IterationRecord>,
    pub total_time: Duration,
}

impl SolverSummary {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
}

impl Display for SolverSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} Final Result", self.strategy)?;
        if self.is_converged() {
            writeln!(f, "CONVERGED ({})", self.status)?;
        } else {
            writeln!(f, "NOT CONVERGED ({})", self.status)?;
        }
        if self.timed_out {
            writeln!(f, "  wall-clock budget exhausted")?;
        }

        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(
            f,
            "  Successful steps:   {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "  Unsuccessful steps: {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f)?;
        writeln!(f, "Gradient:")?;
        writeln!(f, "  Final norm: {:.2e}", self.final_gradient_norm)?;
        if !self.skipped_residuals.is_empty() {
            writeln!(f, "  Skipped residual blocks: {:?}", self.skipped_residuals)?;
        }
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(f, "  Linear solver: {}", self.linear_solver)?;
        writeln!(
            f,
            "  Total time:    {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}
