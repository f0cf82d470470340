//! Powell's dogleg step policy.
//!
//! The step is chosen on the path from the origin through the Cauchy point
//!
//! ```text
//! p_c = −α·g,   α = ‖g‖² / (gᵀ H g)
//! ```
//!
//! (the minimizer of the model along steepest descent) to the Gauss-Newton step `h_gn`
//! solving `H·h_gn = −g`, truncated at the trust-region radius Δ:
//!
//! 1. `‖h_gn‖ ≤ Δ`: take the Gauss-Newton step
//! 2. `‖p_c‖ ≥ Δ`: steepest descent scaled to the boundary
//! 3. otherwise: `p_c + β·(h_gn − p_c)` with β placing the step on the boundary
//!
//! Both end points depend only on the linearization and are cached across rejected steps.
//!
//! Radius update on the gain ratio ρ:
//! - `ρ > 0.75`: `Δ ← max(Δ, 3‖δ‖)`
//! - `ρ < 0.25` (including every rejected step): `Δ ← Δ/2`
//!
//! The policy is exhausted once Δ drops below `min_trust_region_radius`.
//!
//! # References
//!
//! - Nocedal, J. & Wright, S. (2006). *Numerical Optimization* (2nd ed.). Springer. Chapter 4.
//! - Ceres Solver `DoglegStrategy`.

use crate::linalg::{Damping, LinAlgResult, LinearSolver, LinearSystem};
use crate::optimizer::{OptimizerConfig, ProposedStep, StepPolicy, predicted_reduction};
use nalgebra::DVector;

const GOOD_STEP_QUALITY: f64 = 0.75;
const POOR_STEP_QUALITY: f64 = 0.25;

/// Kind of step taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// Full Gauss-Newton step
    GaussNewton,
    /// Scaled steepest descent
    SteepestDescent,
    /// Interpolation between the Cauchy point and the Gauss-Newton step
    DogLeg,
}

#[derive(Debug, Clone)]
struct CachedPath {
    cauchy_point: DVector<f64>,
    gauss_newton: DVector<f64>,
}

#[derive(Debug, Clone)]
pub struct DogLeg {
    radius: f64,
    min_radius: f64,
    path: Option<CachedPath>,
    last_step_type: Option<StepType>,
}

impl DogLeg {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            radius: config.initial_trust_region_radius,
            min_radius: config.min_trust_region_radius,
            path: None,
            last_step_type: None,
        }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn last_step_type(&self) -> Option<StepType> {
        self.last_step_type
    }

    fn compute_path(
        system: &LinearSystem,
        solver: &mut dyn LinearSolver,
    ) -> LinAlgResult<CachedPath> {
        let gradient = &system.gradient;
        let g_norm_sq = gradient.norm_squared();
        let g_h_g = system.hessian.quadratic_form(gradient);
        let alpha = if g_h_g.abs() > 1e-15 { g_norm_sq / g_h_g } else { 1.0 };

        Ok(CachedPath {
            cauchy_point: gradient * -alpha,
            gauss_newton: solver.solve(&system.hessian, gradient, Damping::None)?,
        })
    }
}

/// Point of the dogleg path inside radius `delta`.
pub fn dog_leg_step(
    gradient: &DVector<f64>,
    cauchy_point: &DVector<f64>,
    gauss_newton: &DVector<f64>,
    delta: f64,
) -> (DVector<f64>, StepType) {
    if gauss_newton.norm() <= delta {
        return (gauss_newton.clone(), StepType::GaussNewton);
    }

    let cauchy_norm = cauchy_point.norm();
    if cauchy_norm >= delta {
        let gradient_norm = gradient.norm();
        if gradient_norm == 0.0 {
            return (DVector::zeros(gradient.len()), StepType::SteepestDescent);
        }
        return (gradient * (-delta / gradient_norm), StepType::SteepestDescent);
    }

    // ‖p_c + β v‖² = Δ² with v = h_gn − p_c:  a β² + 2 b β + c = 0.
    let v = gauss_newton - cauchy_point;
    let a = v.norm_squared();
    let b = cauchy_point.dot(&v);
    let c = cauchy_norm * cauchy_norm - delta * delta;
    let d_squared = b * b - a * c;

    let beta = if d_squared < 0.0 || a.abs() < 1e-15 {
        1.0
    } else {
        let d = d_squared.sqrt();
        // Pick the form without cancellation.
        if b <= 0.0 { (-b + d) / a } else { -c / (b + d) }
    };
    let beta = beta.clamp(0.0, 1.0);

    (cauchy_point + v * beta, StepType::DogLeg)
}

impl StepPolicy for DogLeg {
    fn on_linearization(&mut self, _system: &LinearSystem, _first: bool) {
        self.path = None;
    }

    fn propose(
        &mut self,
        system: &LinearSystem,
        solver: &mut dyn LinearSolver,
    ) -> LinAlgResult<ProposedStep> {
        let path = match self.path.take() {
            Some(path) => path,
            None => Self::compute_path(system, solver)?,
        };
        let (delta, step_type) = dog_leg_step(
            &system.gradient,
            &path.cauchy_point,
            &path.gauss_newton,
            self.radius,
        );
        self.path = Some(path);
        self.last_step_type = Some(step_type);

        let predicted_reduction = predicted_reduction(system, &delta);
        Ok(ProposedStep {
            delta,
            predicted_reduction,
        })
    }

    fn accept(&mut self, rho: f64, step: &ProposedStep) {
        if rho > GOOD_STEP_QUALITY {
            self.radius = self.radius.max(3.0 * step.delta.norm());
        } else if rho < POOR_STEP_QUALITY {
            self.radius *= 0.5;
        }
    }

    fn reject(&mut self, _rho: f64, _step: &ProposedStep) -> bool {
        self.radius *= 0.5;
        self.radius >= self.min_radius
    }

    fn region_size(&self) -> f64 {
        self.radius
    }
}
