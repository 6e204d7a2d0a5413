//! Second-order correction for robust loss functions.
//!
//! Given a residual `r` with `s = ||r||²` and a loss evaluation `[ρ, ρ', ρ'']`, the corrector
//! rescales the residual and its Jacobian so that a plain least-squares solver working on
//! `(r̃, J̃)` sees the same gradient and a Gauss-Newton approximation of the Hessian of the
//! robustified cost `½ ρ(s)` (Triggs et al., "Bundle Adjustment: A Modern Synthesis").
//!
//! ```text
//! α  = 1 - √(1 + 2 s ρ''/ρ')          (α = 0 when s = 0 or ρ'' ≤ 0)
//! r̃  = √ρ' / (1 - α) · r
//! J̃  = √ρ' · (I - α r rᵀ / s) · J
//! ```
//!
//! so that `J̃ᵀ r̃ = ρ' Jᵀ r`. `correct_jacobian` reads the uncorrected residuals and must
//! therefore run before `correct_residuals`.

/// Scale factors derived from one loss evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Build a corrector from the squared residual norm and `[ρ, ρ', ρ'']` at that norm.
    ///
    /// # Panics
    ///
    /// Panics if `sq_norm < 0` or `ρ' ≤ 0`; the loss contract guarantees neither happens.
    pub fn new(sq_norm: f64, rho: &[f64; 3]) -> Self {
        assert!(sq_norm >= 0.0, "squared norm must be non-negative, got {sq_norm}");
        assert!(rho[1] > 0.0, "loss derivative rho' must be positive, got {}", rho[1]);

        let sqrt_rho1 = rho[1].sqrt();

        // No curvature correction needed
        if sq_norm == 0.0 || rho[2] <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        // α is the root of ½α² - α - (ρ''/ρ') s = 0 that keeps 1 - α positive
        let d = 1.0 + 2.0 * sq_norm * rho[2] / rho[1];
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Scale residuals in place: `r̃ = residual_scaling · r`.
    pub fn correct_residuals(&self, residuals: &mut [f64]) {
        for value in residuals.iter_mut() {
            *value *= self.residual_scaling;
        }
    }

    /// Correct a row-major `num_rows × num_cols` Jacobian in place.
    ///
    /// `residuals` must be the uncorrected residual vector.
    pub fn correct_jacobian(
        &self,
        num_rows: usize,
        num_cols: usize,
        residuals: &[f64],
        jacobian: &mut [f64],
    ) {
        if self.alpha_sq_norm == 0.0 {
            for value in jacobian.iter_mut() {
                *value *= self.sqrt_rho1;
            }
            return;
        }

        for c in 0..num_cols {
            let r_transpose_j: f64 = (0..num_rows)
                .map(|r| jacobian[r * num_cols + c] * residuals[r])
                .sum();
            for r in 0..num_rows {
                let entry = &mut jacobian[r * num_cols + c];
                *entry = self.sqrt_rho1 * (*entry - self.alpha_sq_norm * residuals[r] * r_transpose_j);
            }
        }
    }

    pub fn residual_scaling(&self) -> f64 {
        self.residual_scaling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::{HuberLoss, LossFunction, TolerantLoss};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Jᵀr for a row-major Jacobian.
    fn gradient(rows: usize, cols: usize, jacobian: &[f64], residuals: &[f64]) -> Vec<f64> {
        (0..cols)
            .map(|c| (0..rows).map(|r| jacobian[r * cols + c] * residuals[r]).sum())
            .collect()
    }

    #[test]
    fn test_corrector_trivial_loss_is_identity() {
        let residuals = [1.0, -2.0];
        let sq_norm = 5.0;
        let corrector = Corrector::new(sq_norm, &[sq_norm, 1.0, 0.0]);

        let mut corrected_residuals = residuals;
        let mut jacobian = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        corrector.correct_jacobian(2, 3, &residuals, &mut jacobian);
        corrector.correct_residuals(&mut corrected_residuals);

        assert_eq!(corrected_residuals, residuals);
        assert_eq!(jacobian, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_corrector_huber_outlier_downweights() -> TestResult {
        let loss = HuberLoss::new(1.0)?;
        let residuals = [5.0, 5.0, 5.0];
        let sq_norm = 75.0;
        let corrector = Corrector::new(sq_norm, &loss.evaluate(sq_norm));

        // Huber has ρ'' < 0 in the outlier region, so only first-order scaling applies
        assert!(corrector.alpha_sq_norm == 0.0);
        assert!(corrector.sqrt_rho1 > 0.0 && corrector.sqrt_rho1 < 1.0);

        let mut corrected = residuals;
        corrector.correct_residuals(&mut corrected);
        for (c, r) in corrected.iter().zip(&residuals) {
            assert!((c - corrector.sqrt_rho1 * r).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_corrected_gradient_matches_robust_gradient() -> TestResult {
        // Tolerant loss has ρ'' > 0, exercising the curvature term
        let loss = TolerantLoss::new(1.0, 0.5)?;
        let residuals = [1.0, 1.0];
        let sq_norm = 2.0;
        let rho = loss.evaluate(sq_norm);
        assert!(rho[2] > 0.0);

        let original_jacobian = [1.0, 0.5, -0.3, 0.2, 2.0, 1.0];
        let expected: Vec<f64> = gradient(2, 3, &original_jacobian, &residuals)
            .iter()
            .map(|g| rho[1] * g)
            .collect();

        let corrector = Corrector::new(sq_norm, &rho);
        assert!(corrector.alpha_sq_norm != 0.0);
        let mut jacobian = original_jacobian;
        let mut corrected = residuals;
        corrector.correct_jacobian(2, 3, &residuals, &mut jacobian);
        corrector.correct_residuals(&mut corrected);

        let actual = gradient(2, 3, &jacobian, &corrected);
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-12, "{a} vs {e}");
        }
        Ok(())
    }

    #[test]
    fn test_correction_order_matters() -> TestResult {
        let loss = TolerantLoss::new(1.0, 0.5)?;
        let residuals = [1.0, 1.0];
        let sq_norm = 2.0;
        let corrector = Corrector::new(sq_norm, &loss.evaluate(sq_norm));

        let mut in_order = [1.0, 0.5, -0.3, 0.2];
        corrector.correct_jacobian(2, 2, &residuals, &mut in_order);

        let mut scaled = residuals;
        corrector.correct_residuals(&mut scaled);
        let mut out_of_order = [1.0, 0.5, -0.3, 0.2];
        corrector.correct_jacobian(2, 2, &scaled, &mut out_of_order);

        let difference: f64 = in_order
            .iter()
            .zip(&out_of_order)
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(difference > 1e-6);
        Ok(())
    }

    #[test]
    fn test_zero_residual_uses_first_order_scaling() {
        let corrector = Corrector::new(0.0, &[0.0, 0.25, 3.0]);
        assert_eq!(corrector.residual_scaling(), 0.5);
        assert_eq!(corrector.alpha_sq_norm, 0.0);
    }

    #[test]
    #[should_panic(expected = "rho' must be positive")]
    fn test_non_positive_rho1_panics() {
        let _ = Corrector::new(1.0, &[1.0, 0.0, 0.0]);
    }

    #[test]
    #[should_panic(expected = "squared norm must be non-negative")]
    fn test_negative_sq_norm_panics() {
        let _ = Corrector::new(-1.0, &[1.0, 1.0, 0.0]);
    }
}
