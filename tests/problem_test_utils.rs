//! Shared cost functions and helpers for the problem integration tests

#![allow(dead_code)]

use apex_nlls::CostFunction;
use faer::sparse::SparseColMat;

/// Exponential curve observation: r = y - exp(m·x + c) over blocks [m], [c]
pub struct ExponentialResidual {
    pub x: f64,
    pub y: f64,
}

impl CostFunction for ExponentialResidual {
    fn parameter_block_sizes(&self) -> &[usize] {
        &[1, 1]
    }

    fn num_residuals(&self) -> usize {
        1
    }

    fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> bool {
        let m = parameters[0][0];
        let c = parameters[1][0];
        let prediction = (m * self.x + c).exp();
        residuals[0] = self.y - prediction;

        if let Some(jacobians) = jacobians {
            if let Some(jacobian) = jacobians[0].as_deref_mut() {
                jacobian[0] = -self.x * prediction;
            }
            if let Some(jacobian) = jacobians[1].as_deref_mut() {
                jacobian[0] = -prediction;
            }
        }
        true
    }
}

/// r = x - target for a block of `target.len()` values, identity Jacobian
pub struct Prior {
    pub target: Vec<f64>,
    sizes: [usize; 1],
}

impl Prior {
    pub fn new(target: &[f64]) -> Self {
        Self {
            target: target.to_vec(),
            sizes: [target.len()],
        }
    }
}

impl CostFunction for Prior {
    fn parameter_block_sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn num_residuals(&self) -> usize {
        self.target.len()
    }

    fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> bool {
        let n = self.target.len();
        for i in 0..n {
            residuals[i] = parameters[0][i] - self.target[i];
        }
        if let Some(jacobians) = jacobians {
            if let Some(jacobian) = jacobians[0].as_deref_mut() {
                jacobian.fill(0.0);
                for i in 0..n {
                    jacobian[i * n + i] = 1.0;
                }
            }
        }
        true
    }
}

/// Scalar difference r = a - b
pub struct Difference;

impl CostFunction for Difference {
    fn parameter_block_sizes(&self) -> &[usize] {
        &[1, 1]
    }

    fn num_residuals(&self) -> usize {
        1
    }

    fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> bool {
        residuals[0] = parameters[0][0] - parameters[1][0];
        if let Some(jacobians) = jacobians {
            if let Some(jacobian) = jacobians[0].as_deref_mut() {
                jacobian[0] = 1.0;
            }
            if let Some(jacobian) = jacobians[1].as_deref_mut() {
                jacobian[0] = -1.0;
            }
        }
        true
    }
}

/// Densify a sparse Jacobian into rows
pub fn dense(matrix: &SparseColMat<usize, f64>) -> Vec<Vec<f64>> {
    let mut result = vec![vec![0.0; matrix.ncols()]; matrix.nrows()];
    let symbolic = matrix.symbolic();
    for col in 0..matrix.ncols() {
        let rows = symbolic.row_idx_of_col_raw(col);
        let values = matrix.val_of_col(col);
        for (&row, &value) in rows.iter().zip(values) {
            result[row][col] += value;
        }
    }
    result
}

/// Points on y = exp(0.3 x + 0.1), with every tenth observation pushed far off the curve
pub fn exponential_observations(n: usize) -> Vec<(f64, f64)> {
    (0..n)
        .map(|i| {
            let x = i as f64 * 0.1;
            let mut y = (0.3 * x + 0.1).exp();
            if i % 10 == 5 {
                y += 5.0;
            }
            (x, y)
        })
        .collect()
}
