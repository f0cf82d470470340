//! Levenberg-Marquardt step policy.
//!
//! Each step solves the damped normal equations
//!
//! ```text
//! (H + λ·D)·δ = −g
//! ```
//!
//! with `D = I` or `D = diag(H)` ([`DampingScaling`]). The predicted reduction of the
//! quadratic model has the closed form `δᵀ(λDδ − g)`.
//!
//! The damping starts at `λ₀ = τ · max(diag H)` and adapts to the gain ratio ρ
//! (Nielsen's update):
//!
//! ```text
//! accepted (ρ > 0):  λ ← λ · max(1/3, 1 − (2ρ − 1)³),  ν ← 2
//! rejected:          λ ← λ · ν,                        ν ← 2ν
//! ```
//!
//! The policy is exhausted once λ exceeds `max_damping`.
//!
//! # References
//!
//! - Madsen, K., Nielsen, H. B., & Tingleff, O. (2004). *Methods for Non-Linear Least Squares Problems* (2nd ed.). Chapter 3.
//! - Nielsen, H. B. (1999). "Damping Parameter in Marquardt's Method". Technical Report IMM-REP-1999-05.

use crate::linalg::{Damping, LinAlgResult, LinearSolver, LinearSystem};
use crate::optimizer::{DampingScaling, OptimizerConfig, ProposedStep, StepPolicy};
use nalgebra::DVector;
use tracing::debug;

/// Lower bound on λ.
const MIN_DAMPING: f64 = 1e-12;
/// Clamp range of `diag(H)` when it scales the damping.
const MIN_DIAGONAL: f64 = 1e-6;
const MAX_DIAGONAL: f64 = 1e32;

#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    initial_damping_scale: f64,
    scaling: DampingScaling,
    max_damping: f64,
    damping: f64,
    nu: f64,
    diagonal: DVector<f64>,
}

impl LevenbergMarquardt {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            initial_damping_scale: config.initial_damping_scale,
            scaling: config.damping_scaling,
            max_damping: config.max_damping,
            damping: MIN_DAMPING,
            nu: 2.0,
            diagonal: DVector::zeros(0),
        }
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    fn damping_term(&self) -> Damping<'_> {
        match self.scaling {
            DampingScaling::Identity => Damping::Identity(self.damping),
            DampingScaling::HessianDiagonal => Damping::Diagonal(self.damping, &self.diagonal),
        }
    }
}

impl StepPolicy for LevenbergMarquardt {
    fn on_linearization(&mut self, system: &LinearSystem, first: bool) {
        let diagonal = system.hessian.diagonal();
        if first {
            self.damping = (self.initial_damping_scale * diagonal.max()).max(MIN_DAMPING);
            self.nu = 2.0;
            debug!("Levenberg-Marquardt: initial damping {:.3e}", self.damping);
        }
        if self.scaling == DampingScaling::HessianDiagonal {
            self.diagonal = diagonal.map(|d| d.clamp(MIN_DIAGONAL, MAX_DIAGONAL));
        }
    }

    fn propose(
        &mut self,
        system: &LinearSystem,
        solver: &mut dyn LinearSolver,
    ) -> LinAlgResult<ProposedStep> {
        let damping = self.damping_term();
        let delta = solver.solve(&system.hessian, &system.gradient, damping)?;
        let predicted_reduction =
            self.damping * damping.weighted_norm_squared(&delta) - delta.dot(&system.gradient);
        Ok(ProposedStep {
            delta,
            predicted_reduction,
        })
    }

    fn accept(&mut self, rho: f64, _step: &ProposedStep) {
        let coff = 2.0 * rho - 1.0;
        self.damping *= (1.0_f64 / 3.0).max(1.0 - coff * coff * coff);
        self.damping = self.damping.max(MIN_DAMPING);
        self.nu = 2.0;
    }

    fn reject(&mut self, _rho: f64, _step: &ProposedStep) -> bool {
        self.damping *= self.nu;
        self.nu *= 2.0;
        self.damping <= self.max_damping
    }

    fn region_size(&self) -> f64 {
        self.damping
    }
}
