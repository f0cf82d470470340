//! Residual blocks: a residual bound to parameter blocks, its whitening and its robust loss.
//!
//! Linearizing a residual block at a set of values proceeds as follows:
//!
//! 1. evaluate the [`Residual`] and check the shape of every output
//! 2. reject NaN/Inf in the residual or any Jacobian with [`CoreError::NumericalFailure`]
//! 3. whiten: `r ← S r`, `J_i ← S J_i` with `SᵀS = Ω`
//! 4. cost term `ρ(s)` with `s = ‖r‖²` (plain `s` without a loss)
//! 5. with a loss, rescale `r` and `J_i` through the [`Corrector`]
//!
//! `S` is computed once, when the block is created: `S = Lᵀ` for the Cholesky factor
//! `Ω = L Lᵀ`, or `S = diag(√λ) Vᵀ` from the eigen-decomposition when `Ω` is only positive
//! semi-definite.

use crate::core::{CoreError, CoreResult, corrector::Corrector, loss_functions::LossFunction};
use crate::factors::Residual;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Relative tolerance for the symmetry and PSD checks on information matrices.
const INFORMATION_TOLERANCE: f64 = 1e-9;

/// What to do when a residual evaluates to NaN/Inf at the current estimate.
///
/// Trial points are never fatal: a non-finite trial cost rejects the step under either policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NumericalFailurePolicy {
    /// Abort the run with a numerical failure error
    #[default]
    FailFast,
    /// Leave the residual block out of the current iteration and log a warning
    SkipAndWarn,
}

/// Whitened, robustified residual and Jacobians at one point.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub residual: DVector<f64>,
    pub jacobians: Vec<DMatrix<f64>>,
    /// `ρ(‖S r‖²)`
    pub cost: f64,
}

/// One residual term of the problem.
pub struct ResidualBlock {
    id: usize,
    parameter_ids: Vec<usize>,
    local_dimensions: Vec<usize>,
    residual: Box<dyn Residual>,
    loss: Option<Box<dyn LossFunction>>,
    sqrt_information: DMatrix<f64>,
}

impl std::fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualBlock")
            .field("id", &self.id)
            .field("parameter_ids", &self.parameter_ids)
            .field("residual_dimension", &self.residual.residual_dimension())
            .field("has_loss", &self.loss.is_some())
            .finish()
    }
}

impl ResidualBlock {
    /// Create a residual block.
    ///
    /// `local_dimensions[i]` is the tangent size of parameter block `parameter_ids[i]`.
    pub fn new(
        id: usize,
        parameter_ids: Vec<usize>,
        local_dimensions: Vec<usize>,
        residual: Box<dyn Residual>,
        loss: Option<Box<dyn LossFunction>>,
    ) -> CoreResult<Self> {
        if residual.num_parameter_blocks() != parameter_ids.len() {
            return Err(CoreError::DimensionMismatch(format!(
                "residual block {id} expects {} parameter blocks, got {}",
                residual.num_parameter_blocks(),
                parameter_ids.len()
            ))
            .log());
        }
        debug_assert_eq!(parameter_ids.len(), local_dimensions.len());

        let sqrt_information = sqrt_information(id, &residual.information(), residual.residual_dimension())?;

        Ok(Self {
            id,
            parameter_ids,
            local_dimensions,
            residual,
            loss,
            sqrt_information,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn parameter_ids(&self) -> &[usize] {
        &self.parameter_ids
    }

    pub fn residual_dimension(&self) -> usize {
        self.residual.residual_dimension()
    }

    pub fn has_loss(&self) -> bool {
        self.loss.is_some()
    }

    /// Whitening matrix `S` with `SᵀS = Ω`.
    pub fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_information
    }

    fn numerical_failure(&self, message: impl Into<String>) -> CoreError {
        CoreError::NumericalFailure {
            residual: self.id,
            message: message.into(),
        }
    }

    fn evaluate_checked(
        &self,
        params: &[&DVector<f64>],
        compute_jacobians: bool,
    ) -> CoreResult<(DVector<f64>, Option<Vec<DMatrix<f64>>>)> {
        let k = self.residual_dimension();
        let (residual, jacobians) = self.residual.evaluate(params, compute_jacobians);

        if residual.len() != k {
            return Err(CoreError::DimensionMismatch(format!(
                "residual block {} returned {} entries, expected {k}",
                self.id,
                residual.len()
            ))
            .log());
        }
        if residual.iter().any(|v| !v.is_finite()) {
            return Err(self.numerical_failure("residual contains NaN or Inf"));
        }

        let Some(jacobians) = jacobians else {
            if compute_jacobians {
                return Err(CoreError::DimensionMismatch(format!(
                    "residual block {} returned no Jacobians",
                    self.id
                ))
                .log());
            }
            return Ok((residual, None));
        };

        if jacobians.len() != self.parameter_ids.len() {
            return Err(CoreError::DimensionMismatch(format!(
                "residual block {} returned {} Jacobian blocks, expected {}",
                self.id,
                jacobians.len(),
                self.parameter_ids.len()
            ))
            .log());
        }
        for (i, (jacobian, &local_dim)) in jacobians.iter().zip(&self.local_dimensions).enumerate() {
            if jacobian.shape() != (k, local_dim) {
                return Err(CoreError::DimensionMismatch(format!(
                    "residual block {}: Jacobian {i} is {:?}, expected ({k}, {local_dim})",
                    self.id,
                    jacobian.shape()
                ))
                .log());
            }
            if jacobian.iter().any(|v| !v.is_finite()) {
                return Err(self.numerical_failure(format!("Jacobian {i} contains NaN or Inf")));
            }
        }

        Ok((residual, Some(jacobians)))
    }

    fn robust_cost(&self, squared_norm: f64) -> CoreResult<f64> {
        let cost = match &self.loss {
            Some(loss) => loss.evaluate(squared_norm)[0],
            None => squared_norm,
        };
        if !cost.is_finite() {
            return Err(self.numerical_failure(format!("cost evaluated to {cost}")));
        }
        Ok(cost)
    }

    /// Cost `ρ(‖S r‖²)` at `params`, without Jacobians.
    pub fn cost(&self, params: &[&DVector<f64>]) -> CoreResult<f64> {
        let (residual, _) = self.evaluate_checked(params, false)?;
        let whitened = &self.sqrt_information * residual;
        self.robust_cost(whitened.norm_squared())
    }

    /// Whitened and robustified residual and Jacobians at `params`.
    pub fn linearize(&self, params: &[&DVector<f64>]) -> CoreResult<Linearization> {
        let (residual, jacobians) = self.evaluate_checked(params, true)?;
        let jacobians = jacobians.unwrap_or_default();

        let mut residual = &self.sqrt_information * residual;
        let mut jacobians: Vec<DMatrix<f64>> = jacobians
            .into_iter()
            .map(|jacobian| &self.sqrt_information * jacobian)
            .collect();

        let squared_norm = residual.norm_squared();
        let cost = self.robust_cost(squared_norm)?;

        if let Some(loss) = &self.loss {
            let corrector = Corrector::new(loss.as_ref(), squared_norm);
            corrector.correct_jacobians(&residual, &mut jacobians);
            corrector.correct_residuals(&mut residual);
        }

        Ok(Linearization {
            residual,
            jacobians,
            cost,
        })
    }
}

/// Whitening matrix `S` with `SᵀS = information`.
///
/// Rejects non-square, wrongly sized, non-symmetric and indefinite matrices.
pub fn sqrt_information(
    residual_id: usize,
    information: &DMatrix<f64>,
    dimension: usize,
) -> CoreResult<DMatrix<f64>> {
    if information.shape() != (dimension, dimension) {
        return Err(CoreError::DimensionMismatch(format!(
            "residual block {residual_id}: information matrix is {:?}, expected ({dimension}, {dimension})",
            information.shape()
        ))
        .log());
    }
    if information.iter().any(|v| !v.is_finite()) {
        return Err(CoreError::InvalidInput(format!(
            "residual block {residual_id}: information matrix contains NaN or Inf"
        ))
        .log());
    }

    let scale = information.amax().max(1.0);
    let asymmetry = (information - information.transpose()).amax();
    if asymmetry > INFORMATION_TOLERANCE * scale {
        return Err(CoreError::InvalidInput(format!(
            "residual block {residual_id}: information matrix is not symmetric (max asymmetry {asymmetry:.3e})"
        ))
        .log());
    }

    if let Some(cholesky) = information.clone().cholesky() {
        return Ok(cholesky.l().transpose());
    }

    // Positive semi-definite: fall back to the eigen-decomposition.
    let eigen = SymmetricEigen::new(information.clone());
    let min_eigenvalue = eigen.eigenvalues.min();
    if min_eigenvalue < -INFORMATION_TOLERANCE * scale {
        return Err(CoreError::InvalidInput(format!(
            "residual block {residual_id}: information matrix is not positive semi-definite (min eigenvalue {min_eigenvalue:.3e})"
        ))
        .log());
    }

    let sqrt_eigenvalues = eigen.eigenvalues.map(|lambda| lambda.max(0.0).sqrt());
    Ok(DMatrix::from_diagonal(&sqrt_eigenvalues) * eigen.eigenvectors.transpose())
}
