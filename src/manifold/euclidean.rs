//! Rⁿ - n-dimensional Euclidean space
//!
//! Updates are plain vector addition and the tangent space coincides with the space itself,
//! so `D_local == D_global`.

use crate::manifold::{Manifold, ManifoldType};
use nalgebra::DVector;

/// Euclidean parameterization of fixed dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Euclidean {
    dimension: usize,
}

impl Euclidean {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Manifold for Euclidean {
    fn dimension_global(&self) -> usize {
        self.dimension
    }

    fn dimension_local(&self) -> usize {
        self.dimension
    }

    fn apply_update(&self, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
        x + delta
    }

    fn origin(&self) -> DVector<f64> {
        DVector::zeros(self.dimension)
    }

    fn is_valid(&self, x: &DVector<f64>, _tolerance: f64) -> bool {
        x.len() == self.dimension && x.iter().all(|v| v.is_finite())
    }

    fn manifold_type(&self) -> ManifoldType {
        ManifoldType::Euclidean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_zero_update_is_exact_identity() {
        let manifold = Euclidean::new(3);
        let values = [
            dvector![0.0, 0.0, 0.0],
            dvector![1.0, -2.5, 3.25],
            dvector![1e-300, -1e300, 0.1 + 0.2],
        ];

        for x in values {
            let updated = manifold.apply_update(&x, &DVector::zeros(3));
            assert_eq!(updated, x);
        }
    }

    #[test]
    fn test_update_is_addition() {
        let manifold = Euclidean::new(2);
        let x = dvector![1.0, 2.0];
        let delta = dvector![0.5, -1.0];

        assert_eq!(manifold.apply_update(&x, &delta), dvector![1.5, 1.0]);
    }

    #[test]
    fn test_dimensions_and_origin() {
        let manifold = Euclidean::new(4);
        assert_eq!(manifold.dimension_global(), 4);
        assert_eq!(manifold.dimension_local(), 4);
        assert_eq!(manifold.origin(), DVector::zeros(4));
        assert!(manifold.is_valid(&dvector![1.0, 2.0, 3.0, 4.0], 1e-9));
        assert!(!manifold.is_valid(&dvector![1.0, f64::NAN, 3.0, 4.0], 1e-9));
    }
}
