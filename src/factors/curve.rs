//! Exponential curve residual: `r = y − exp(a·x² + b·x + c)`.

use super::{JacobianMode, NUMERIC_DIFF_STEP, Residual, numeric_jacobians};
use crate::manifold::Euclidean;
use nalgebra::{DMatrix, DVector};

/// One sample `(x, y)` of the curve `y = exp(a·x² + b·x + c) + w`, `w ~ N(0, σ²)`.
///
/// Connects a single 3-dimensional Euclidean block holding `(a, b, c)`. The information is
/// `1/σ²`.
///
/// # Example
///
/// ```
/// use lsq_graph::factors::{CurveResidual, Residual};
/// use nalgebra::dvector;
///
/// let residual = CurveResidual::new(0.5, 1.0_f64.exp(), 1.0);
/// let abc = dvector![0.0, 0.0, 1.0];
/// let (r, jacobians) = residual.evaluate(&[&abc], true);
///
/// assert!(r[0].abs() < 1e-12);
/// assert_eq!(jacobians.unwrap()[0].shape(), (1, 3));
/// ```
#[derive(Debug, Clone)]
pub struct CurveResidual {
    pub x: f64,
    pub y: f64,
    pub sigma: f64,
    pub jacobian_mode: JacobianMode,
}

impl CurveResidual {
    pub fn new(x: f64, y: f64, sigma: f64) -> Self {
        Self {
            x,
            y,
            sigma,
            jacobian_mode: JacobianMode::Analytic,
        }
    }

    pub fn with_jacobian_mode(mut self, mode: JacobianMode) -> Self {
        self.jacobian_mode = mode;
        self
    }

    /// Model value `exp(a·x² + b·x + c)`.
    pub fn model(&self, abc: &DVector<f64>) -> f64 {
        (abc[0] * self.x * self.x + abc[1] * self.x + abc[2]).exp()
    }
}

impl Residual for CurveResidual {
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
        let e = self.model(params[0]);
        let residual = DVector::from_element(1, self.y - e);

        if !compute_jacobians {
            return (residual, None);
        }

        let jacobians = match self.jacobian_mode {
            JacobianMode::Analytic => vec![DMatrix::from_row_slice(
                1,
                3,
                &[-e * self.x * self.x, -e * self.x, -e],
            )],
            JacobianMode::Numeric => {
                numeric_jacobians(self, params, &[&Euclidean::new(3)], NUMERIC_DIFF_STEP)
            }
        };

        (residual, Some(jacobians))
    }

    fn information(&self) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, 1.0 / (self.sigma * self.sigma))
    }
}
