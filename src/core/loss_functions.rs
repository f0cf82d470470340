//! Robust loss functions for outlier rejection.
//!
//! With a robust loss ρ the cost of a residual block becomes `ρ(s)` with `s = ‖S r‖²`
//! (the whitened squared norm) instead of `s`. Every loss evaluates `[ρ(s), ρ'(s), ρ''(s)]`;
//! the first two derivatives feed the [`Corrector`](crate::core::corrector::Corrector), which
//! rescales residuals and Jacobians so the linear system sees an equivalent reweighted
//! least-squares problem.
//!
//! All losses satisfy `ρ(0) = 0`, `ρ'(0) = 1`, so they agree with plain least squares near
//! the optimum and only differ on large residuals.
//!
//! | Loss | ρ(s) for large s | Outlier weight ρ'(s) |
//! |------|------------------|----------------------|
//! | [`L2Loss`] | `s` | 1 |
//! | [`HuberLoss`] | `2δ√s − δ²` | `δ/√s` |
//! | [`CauchyLoss`] | `c²·ln(1 + s/c²)` | `1/(1 + s/c²)` |
//! | [`TukeyBiweightLoss`] | `c²/3` (constant) | 0 |
//!
//! # Example
//!
//! ```
//! use lsq_graph::core::loss_functions::{HuberLoss, LossFunction};
//! # fn example() -> lsq_graph::core::CoreResult<()> {
//! let huber = HuberLoss::new(1.0)?;
//!
//! let [rho, rho_prime, _] = huber.evaluate(0.5);
//! assert_eq!(rho, 0.5);
//! assert_eq!(rho_prime, 1.0);
//!
//! let [_, rho_prime, _] = huber.evaluate(16.0);
//! assert_eq!(rho_prime, 0.25);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use crate::core::{CoreError, CoreResult};

/// Robust loss `ρ(s)` on the squared whitened residual norm.
pub trait LossFunction: Send + Sync {
    /// Evaluate `[ρ(s), ρ'(s), ρ''(s)]` at `s = ‖S r‖² ≥ 0`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

fn check_scale(name: &str, scale: f64) -> CoreResult<()> {
    if scale <= 0.0 || !scale.is_finite() {
        return Err(CoreError::LossFunction(format!(
            "{name} scale must be positive and finite, got {scale}"
        ))
        .log());
    }
    Ok(())
}

/// Plain least squares: `ρ(s) = s`.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Loss;

impl L2Loss {
    pub fn new() -> Self {
        Self
    }
}

impl LossFunction for L2Loss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        [s, 1.0, 0.0]
    }
}

/// Huber loss: quadratic up to `‖r‖ = δ`, linear beyond.
///
/// ```text
/// ρ(s) = s               for s ≤ δ²
/// ρ(s) = 2δ√s − δ²       for s > δ²
/// ```
#[derive(Debug, Clone)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    /// Create a Huber loss with threshold `δ > 0`.
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("Huber", scale)?;
        Ok(Self {
            scale,
            scale2: scale * scale,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy (Lorentzian) loss.
///
/// ```text
/// ρ(s)   = c²·ln(1 + s/c²)
/// ρ'(s)  = 1 / (1 + s/c²)
/// ρ''(s) = −1 / (c²·(1 + s/c²)²)
/// ```
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale2: f64,
    inv_scale2: f64,
}

impl CauchyLoss {
    /// Create a Cauchy loss with scale `c > 0`.
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("Cauchy", scale)?;
        let scale2 = scale * scale;
        Ok(Self {
            scale2,
            inv_scale2: 1.0 / scale2,
        })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.inv_scale2;
        let inv = 1.0 / sum;
        [
            self.scale2 * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.inv_scale2 * inv * inv,
        ]
    }
}

/// Tukey biweight loss. Redescending: residuals with `‖r‖ > c` contribute a constant cost
/// and no gradient.
///
/// ```text
/// ρ(s) = c²/3·(1 − (1 − s/c²)³)   for s ≤ c²
/// ρ(s) = c²/3                     for s > c²
/// ```
#[derive(Debug, Clone)]
pub struct TukeyBiweightLoss {
    scale2: f64,
}

impl TukeyBiweightLoss {
    /// Create a Tukey biweight loss with cutoff `c > 0`.
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("Tukey", scale)?;
        Ok(Self {
            scale2: scale * scale,
        })
    }
}

impl LossFunction for TukeyBiweightLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            return [self.scale2 / 3.0, 0.0, 0.0];
        }

        let value = 1.0 - s / self.scale2;
        let value_sq = value * value;
        [
            self.scale2 / 3.0 * (1.0 - value_sq * value),
            value_sq,
            -2.0 / self.scale2 * value,
        ]
    }
}
