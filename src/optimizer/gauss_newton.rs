//! Gauss-Newton step policy with backtracking.
//!
//! The full step solves the undamped normal equations `H·δ = −g` once per linearization. A
//! rejected step is halved and retried against the same linearization, up to
//! `max_line_search_steps` times, before the policy reports that it is exhausted.

use crate::linalg::{Damping, LinAlgResult, LinearSolver, LinearSystem};
use crate::optimizer::{OptimizerConfig, ProposedStep, StepPolicy, predicted_reduction};
use nalgebra::DVector;

#[derive(Debug, Clone)]
pub struct GaussNewton {
    max_line_search_steps: usize,
    /// Undamped step of the current linearization
    full_step: Option<DVector<f64>>,
    step_scale: f64,
    halvings: usize,
}

impl GaussNewton {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            max_line_search_steps: config.max_line_search_steps,
            full_step: None,
            step_scale: 1.0,
            halvings: 0,
        }
    }

    /// Fraction of the full step currently proposed.
    pub fn step_scale(&self) -> f64 {
        self.step_scale
    }
}

impl StepPolicy for GaussNewton {
    fn on_linearization(&mut self, _system: &LinearSystem, _first: bool) {
        self.full_step = None;
        self.step_scale = 1.0;
        self.halvings = 0;
    }

    fn propose(
        &mut self,
        system: &LinearSystem,
        solver: &mut dyn LinearSolver,
    ) -> LinAlgResult<ProposedStep> {
        let full_step = match self.full_step.take() {
            Some(step) => step,
            None => solver.solve(&system.hessian, &system.gradient, Damping::None)?,
        };
        let delta = &full_step * self.step_scale;
        self.full_step = Some(full_step);

        let predicted_reduction = predicted_reduction(system, &delta);
        Ok(ProposedStep {
            delta,
            predicted_reduction,
        })
    }

    fn accept(&mut self, _rho: f64, _step: &ProposedStep) {}

    fn reject(&mut self, _rho: f64, _step: &ProposedStep) -> bool {
        self.halvings += 1;
        self.step_scale *= 0.5;
        self.halvings <= self.max_line_search_steps
    }

    fn region_size(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{BlockCholeskySolver, BlockSparseMatrix};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn system() -> LinearSystem {
        let mut hessian = BlockSparseMatrix::new(vec![2], vec![0]);
        hessian.add_block(0, 0, &DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]));
        LinearSystem {
            hessian,
            gradient: dvector![2.0, -4.0],
            cost: 10.0,
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_full_step_solves_normal_equations() -> TestResult {
        let mut gn = GaussNewton::new(&OptimizerConfig::new());
        let system = system();
        gn.on_linearization(&system, true);

        let step = gn.propose(&system, &mut BlockCholeskySolver::new())?;
        assert_relative_eq!(step.delta, dvector![-1.0, 1.0], epsilon = 1e-12);
        // −2gᵀδ − δᵀHδ = 12 − 6
        assert_relative_eq!(step.predicted_reduction, 6.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_rejection_halves_the_step_until_exhausted() -> TestResult {
        let config = OptimizerConfig::new().with_max_line_search_steps(2);
        let mut gn = GaussNewton::new(&config);
        let system = system();
        let mut solver = BlockCholeskySolver::new();
        gn.on_linearization(&system, true);

        let full = gn.propose(&system, &mut solver)?;
        assert!(gn.reject(-1.0, &full));
        let half = gn.propose(&system, &mut solver)?;
        assert_relative_eq!(half.delta, &full.delta * 0.5, epsilon = 1e-12);

        assert!(gn.reject(-1.0, &half));
        assert!(!gn.reject(-1.0, &half));

        // A new linearization restarts from the full step.
        gn.on_linearization(&system, false);
        assert_eq!(gn.step_scale(), 1.0);
        Ok(())
    }
}
