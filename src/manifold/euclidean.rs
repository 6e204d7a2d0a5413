//! Euclidean space Rⁿ as a manifold.

use super::{Manifold, ManifoldError, ManifoldResult};

/// Rⁿ with the ordinary vector addition as its retraction.
///
/// Attaching this manifold to a parameter block is equivalent to attaching none, except
/// that residual blocks route the Jacobian through the (identity) plus-Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EuclideanManifold {
    size: usize,
}

impl EuclideanManifold {
    pub fn new(size: usize) -> ManifoldResult<Self> {
        if size == 0 {
            return Err(ManifoldError::EmptyAmbientSpace);
        }
        Ok(Self { size })
    }
}

impl Manifold for EuclideanManifold {
    fn ambient_size(&self) -> usize {
        self.size
    }

    fn tangent_size(&self) -> usize {
        self.size
    }

    fn plus(&self, x: &[f64], delta: &[f64], x_plus_delta: &mut [f64]) -> bool {
        for ((out, xi), di) in x_plus_delta.iter_mut().zip(x).zip(delta) {
            *out = xi + di;
        }
        true
    }

    fn plus_jacobian(&self, _x: &[f64], jacobian: &mut [f64]) -> bool {
        jacobian.fill(0.0);
        for i in 0..self.size {
            jacobian[i * self.size + i] = 1.0;
        }
        true
    }
}
