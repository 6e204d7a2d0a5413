//! Robust exponential curve fitting
//!
//! Fits y = exp(m·x + c) to samples that contain gross outliers, once with plain least
//! squares and once with a Cauchy loss. The problem is reduced, then a small
//! Levenberg-Marquardt loop runs on the reduced program using the evaluator's corrected
//! Jacobian and gradient, and the result is copied back into the problem.
//!
//! ```bash
//! cargo run --example robust_curve_fitting
//! RUST_LOG=debug cargo run --example robust_curve_fitting
//! ```

use std::sync::Arc;

use apex_nlls::core::evaluator::{Evaluator, EvaluatorOptions};
use apex_nlls::{CostFunction, EvaluationRequest, Loss, Problem, init_logger};
use faer::sparse::SparseColMat;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

/// r = y - exp(m·x + c)
struct ExponentialResidual {
    x: f64,
    y: f64,
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
        let prediction = (parameters[0][0] * self.x + parameters[1][0]).exp();
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

const TRUE_M: f64 = 0.3;
const TRUE_C: f64 = 0.1;

/// Samples on the true curve with a deterministic ripple and one outlier in every seven.
fn samples(n: usize) -> Vec<(f64, f64)> {
    (0..n)
        .map(|i| {
            let x = 5.0 * i as f64 / n as f64;
            let noise = 0.02 * (i as f64 * 1.7).sin();
            let outlier = if i % 7 == 3 { 3.0 } else { 0.0 };
            (x, (TRUE_M * x + TRUE_C).exp() + noise + outlier)
        })
        .collect()
}

fn to_dense(jacobian: &SparseColMat<usize, f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(jacobian.nrows(), jacobian.ncols());
    let symbolic = jacobian.symbolic();
    for col in 0..jacobian.ncols() {
        for (&row, &value) in symbolic.row_idx_of_col_raw(col).iter().zip(jacobian.val_of_col(col)) {
            dense[(row, col)] += value;
        }
    }
    dense
}

/// Levenberg-Marquardt on the reduced program of `problem`; writes the solution back.
fn solve(problem: &mut Problem, max_iterations: usize) -> Result<f64, Box<dyn std::error::Error>> {
    let reduced = problem.reduced_program()?;
    let mut program = reduced.program;
    let evaluator = Evaluator::new(&program, EvaluatorOptions::default())?;
    let num_effective = program.num_effective_parameters();

    let mut state = program.state_vector();
    let mut candidate = vec![0.0; state.len()];
    let mut lambda = 1e-3;
    let mut current = evaluator.evaluate(&mut program, &state, true, EvaluationRequest::all())?;
    info!("Initial cost: {:.6e}", current.cost + reduced.fixed_cost);

    for iteration in 0..max_iterations {
        let (Some(jacobian), Some(gradient)) = (current.jacobian.as_ref(), current.gradient.as_ref()) else {
            return Err("evaluator did not return derivatives".into());
        };
        let jacobian = to_dense(jacobian);
        let gradient = DVector::from_column_slice(gradient);
        if gradient.amax() < 1e-10 {
            debug!("Gradient tolerance reached at iteration {}", iteration);
            break;
        }

        let mut hessian = jacobian.transpose() * &jacobian;
        for i in 0..num_effective {
            hessian[(i, i)] += lambda * hessian[(i, i)].max(1e-12);
        }
        let Some(cholesky) = hessian.cholesky() else {
            warn!("Damped normal equations are not positive definite, increasing damping");
            lambda *= 10.0;
            continue;
        };
        let step = cholesky.solve(&(-gradient));

        program.plus(&state, step.as_slice(), &mut candidate, None, 1)?;
        let trial = evaluator.evaluate(&mut program, &candidate, true, EvaluationRequest::all())?;
        if trial.cost < current.cost {
            debug!(
                "Iteration {:2}: cost {:.6e} -> {:.6e}, lambda {:.1e}",
                iteration, current.cost, trial.cost, lambda
            );
            std::mem::swap(&mut state, &mut candidate);
            current = trial;
            lambda = (lambda / 3.0).max(1e-12);
            if step.norm() < 1e-12 {
                break;
            }
        } else {
            lambda *= 4.0;
        }
    }

    program.state_vector_to_parameter_blocks(&state)?;
    problem.update_from_program(&program)?;
    Ok(current.cost + reduced.fixed_cost)
}

fn build(loss: Option<Loss>) -> Problem {
    let mut problem = Problem::default();
    problem.add_parameter_block("m", &[0.0]);
    problem.add_parameter_block("c", &[0.0]);
    for (x, y) in samples(70) {
        problem.add_residual_block(Arc::new(ExponentialResidual { x, y }), loss.clone(), &["m", "c"]);
    }
    problem
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();

    for (name, loss) in [("plain least squares", None), ("Cauchy(0.1)", Some(Loss::cauchy(0.1)?))] {
        let mut problem = build(loss);
        info!(
            "Fitting with {}: {} residual blocks, {} parameters",
            name,
            problem.num_residual_blocks(),
            problem.num_parameters()
        );
        let cost = solve(&mut problem, 100)?;
        let m = problem.parameter_block_values("m")[0];
        let c = problem.parameter_block_values("c")[0];
        info!(
            "{}: m = {:.4} (true {}), c = {:.4} (true {}), final cost {:.6e}",
            name, m, TRUE_M, c, TRUE_C, cost
        );
    }
    Ok(())
}
