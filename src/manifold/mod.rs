//! Manifolds for over-parameterized parameter blocks.
//!
//! Some decision variables live on a space whose natural representation has more
//! coordinates than degrees of freedom. A unit quaternion stores four numbers but only
//! three of them are free; a block with a few coordinates held fixed has fewer free
//! directions than entries. A [`Manifold`] describes such a block through:
//!
//! - **ambient size**: number of stored coordinates (`x ∈ Rⁿ`)
//! - **tangent size**: number of free directions (`δ ∈ Rᵐ`, `m ≤ n`)
//! - **Plus**: the retraction `x ⊞ δ` mapping a tangent step back onto the manifold
//! - **PlusJacobian**: `∂(x ⊞ δ)/∂δ` at `δ = 0`, an `n × m` row-major matrix
//!
//! Residual blocks use the plus-Jacobian to map Jacobians computed with respect to the
//! ambient coordinates into the tangent space (`J_tangent = J_ambient · P`), which is what
//! the linear solver works with.
//!
//! | Manifold               | ambient | tangent | Plus                      |
//! | ---------------------- | ------- | ------- | ------------------------- |
//! | [`EuclideanManifold`]  | n       | n       | `x + δ`                   |
//! | [`SubsetManifold`]     | n       | n - k   | `x + δ` on free entries   |
//! | [`QuaternionManifold`] | 4       | 3       | `exp(δ) ⊗ q`              |

use thiserror::Error;

pub mod euclidean;
pub mod quaternion;
pub mod subset;

pub use euclidean::EuclideanManifold;
pub use quaternion::QuaternionManifold;
pub use subset::SubsetManifold;

/// Errors that can occur while building a manifold.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifoldError {
    /// A constant coordinate index does not exist in the ambient space
    #[error("Constant index {index} is out of range for a manifold of size {size}")]
    InvalidConstantIndex { index: usize, size: usize },

    /// The same coordinate was listed as constant twice
    #[error("Constant index {index} was specified more than once")]
    DuplicateConstantIndex { index: usize },

    /// Ambient dimension of zero
    #[error("Manifold ambient size must be positive")]
    EmptyAmbientSpace,
}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Retraction contract consumed by parameter blocks.
///
/// Implementations must be pure functions of their inputs; parameter blocks call them
/// concurrently from several threads during [`Program::plus`](crate::core::program::Program::plus).
pub trait Manifold: Send + Sync {
    /// Number of stored (ambient) coordinates.
    fn ambient_size(&self) -> usize;

    /// Dimension of the tangent space.
    fn tangent_size(&self) -> usize;

    /// Compute `x_plus_delta = x ⊞ delta`.
    ///
    /// `x` and `x_plus_delta` have `ambient_size()` entries, `delta` has `tangent_size()`.
    /// Returns `false` if the retraction cannot be evaluated at this point.
    fn plus(&self, x: &[f64], delta: &[f64], x_plus_delta: &mut [f64]) -> bool;

    /// Write `∂(x ⊞ δ)/∂δ` at `δ = 0` as a row-major `ambient_size × tangent_size` matrix.
    fn plus_jacobian(&self, x: &[f64], jacobian: &mut [f64]) -> bool;
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::Manifold;

    /// Central-difference estimate of the plus-Jacobian at `x`, row-major.
    pub fn numeric_plus_jacobian(manifold: &dyn Manifold, x: &[f64]) -> Vec<f64> {
        let n = manifold.ambient_size();
        let m = manifold.tangent_size();
        let h = 1e-6;
        let mut jacobian = vec![0.0; n * m];
        let mut forward = vec![0.0; n];
        let mut backward = vec![0.0; n];
        for col in 0..m {
            let mut delta = vec![0.0; m];
            delta[col] = h;
            assert!(manifold.plus(x, &delta, &mut forward));
            delta[col] = -h;
            assert!(manifold.plus(x, &delta, &mut backward));
            for row in 0..n {
                jacobian[row * m + col] = (forward[row] - backward[row]) / (2.0 * h);
            }
        }
        jacobian
    }
}
