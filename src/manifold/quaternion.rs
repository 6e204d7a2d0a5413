//! Unit quaternions as a manifold.
//!
//! Parameter blocks store rotations as Hamilton quaternions `[w, x, y, z]`. The tangent space
//! is the 3-vector of a rotation increment applied on the left:
//!
//! ```text
//! q ⊞ δ = exp(δ) ⊗ q,    exp(δ) = [cos|δ|, sin|δ|/|δ| · δ]
//! ```
//!
//! Since `exp(δ)` has unit norm, a unit quaternion stays unit under the retraction.

use nalgebra::Quaternion;

use super::Manifold;

/// Hamilton unit quaternion `[w, x, y, z]` with a left-multiplicative retraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuaternionManifold;

impl QuaternionManifold {
    pub fn new() -> Self {
        QuaternionManifold
    }
}

impl Manifold for QuaternionManifold {
    fn ambient_size(&self) -> usize {
        4
    }

    fn tangent_size(&self) -> usize {
        3
    }

    fn plus(&self, x: &[f64], delta: &[f64], x_plus_delta: &mut [f64]) -> bool {
        let norm_delta = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();

        if norm_delta == 0.0 {
            x_plus_delta[..4].copy_from_slice(&x[..4]);
            return true;
        }

        let sin_delta_by_delta = norm_delta.sin() / norm_delta;
        let q_delta = Quaternion::new(
            norm_delta.cos(),
            sin_delta_by_delta * delta[0],
            sin_delta_by_delta * delta[1],
            sin_delta_by_delta * delta[2],
        );
        let q = Quaternion::new(x[0], x[1], x[2], x[3]);
        let result = q_delta * q;

        x_plus_delta[0] = result.w;
        x_plus_delta[1] = result.i;
        x_plus_delta[2] = result.j;
        x_plus_delta[3] = result.k;
        true
    }

    fn plus_jacobian(&self, x: &[f64], jacobian: &mut [f64]) -> bool {
        let (w, qx, qy, qz) = (x[0], x[1], x[2], x[3]);
        #[rustfmt::skip]
        let values = [
            -qx, -qy, -qz,
              w,  qz, -qy,
            -qz,   w,  qx,
             qy, -qx,   w,
        ];
        jacobian[..12].copy_from_slice(&values);
        true
    }
}
