//! Rⁿ with a subset of coordinates held constant.

use super::{Manifold, ManifoldError, ManifoldResult};

/// Euclidean manifold whose listed coordinates never move.
///
/// The tangent space only spans the free coordinates, so its dimension is
/// `size - constant_indices.len()`. When every coordinate is constant the tangent size is
/// zero and a parameter block using this manifold is treated as constant.
///
/// # Example
///
/// ```
/// use apex_nlls::manifold::{Manifold, SubsetManifold};
/// # fn main() -> Result<(), apex_nlls::manifold::ManifoldError> {
///
/// // Keep the z coordinate of a 3D point fixed
/// let manifold = SubsetManifold::new(3, &[2])?;
/// assert_eq!(manifold.tangent_size(), 2);
///
/// let mut out = [0.0; 3];
/// manifold.plus(&[1.0, 2.0, 3.0], &[0.1, 0.2], &mut out);
/// assert_eq!(out, [1.1, 2.2, 3.0]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetManifold {
    tangent_size: usize,
    constancy_mask: Vec<bool>,
}

impl SubsetManifold {
    pub fn new(size: usize, constant_indices: &[usize]) -> ManifoldResult<Self> {
        if size == 0 {
            return Err(ManifoldError::EmptyAmbientSpace);
        }
        let mut constancy_mask = vec![false; size];
        for &index in constant_indices {
            if index >= size {
                return Err(ManifoldError::InvalidConstantIndex { index, size });
            }
            if constancy_mask[index] {
                return Err(ManifoldError::DuplicateConstantIndex { index });
            }
            constancy_mask[index] = true;
        }
        Ok(Self {
            tangent_size: size - constant_indices.len(),
            constancy_mask,
        })
    }
}

impl Manifold for SubsetManifold {
    fn ambient_size(&self) -> usize {
        self.constancy_mask.len()
    }

    fn tangent_size(&self) -> usize {
        self.tangent_size
    }

    fn plus(&self, x: &[f64], delta: &[f64], x_plus_delta: &mut [f64]) -> bool {
        let mut j = 0;
        for (i, &constant) in self.constancy_mask.iter().enumerate() {
            if constant {
                x_plus_delta[i] = x[i];
            } else {
                x_plus_delta[i] = x[i] + delta[j];
                j += 1;
            }
        }
        true
    }

    fn plus_jacobian(&self, _x: &[f64], jacobian: &mut [f64]) -> bool {
        if self.tangent_size == 0 {
            return true;
        }
        jacobian.fill(0.0);
        let mut j = 0;
        for (i, &constant) in self.constancy_mask.iter().enumerate() {
            if !constant {
                jacobian[i * self.tangent_size + j] = 1.0;
                j += 1;
            }
        }
        true
    }
}
