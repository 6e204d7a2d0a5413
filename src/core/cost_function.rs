//! User-supplied contracts consumed by residual blocks and evaluators.

/// A vector-valued function of one or more parameter blocks.
///
/// `parameter_block_sizes()` fixes how many parameter blocks a residual using this cost
/// function references and the ambient size of each. `evaluate` receives one slice per
/// parameter block, in that order, and writes `num_residuals()` values into `residuals`.
///
/// When `jacobians` is present, it holds one slot per parameter block. A `Some` slot must
/// be filled with `∂r/∂x_i` as a row-major `num_residuals × parameter_block_sizes()[i]`
/// matrix, computed with respect to the ambient coordinates; the residual block maps it
/// into the tangent space afterwards. `None` slots are not needed and must be skipped.
///
/// Returning `false` reports that the function could not be evaluated at this point.
///
/// # Example
///
/// ```
/// use apex_nlls::CostFunction;
///
/// /// r = x - target, for a 2D point x
/// struct PointPrior {
///     target: [f64; 2],
/// }
///
/// impl CostFunction for PointPrior {
///     fn parameter_block_sizes(&self) -> &[usize] {
///         &[2]
///     }
///
///     fn num_residuals(&self) -> usize {
///         2
///     }
///
///     fn evaluate(
///         &self,
///         parameters: &[&[f64]],
///         residuals: &mut [f64],
///         jacobians: Option<&mut [Option<&mut [f64]>]>,
///     ) -> bool {
///         residuals[0] = parameters[0][0] - self.target[0];
///         residuals[1] = parameters[0][1] - self.target[1];
///         if let Some(jacobians) = jacobians {
///             if let Some(jacobian) = jacobians[0].as_deref_mut() {
///                 jacobian.copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
///             }
///         }
///         true
///     }
/// }
/// ```
pub trait CostFunction: Send + Sync {
    /// Ambient size of each parameter block, in argument order.
    fn parameter_block_sizes(&self) -> &[usize];

    /// Dimension of the residual vector.
    fn num_residuals(&self) -> usize;

    /// Compute residuals and, optionally, the requested Jacobian blocks.
    fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> bool;
}

/// Hook invoked before a batch of cost-function evaluations.
///
/// Implementations can use it to refresh shared state that many cost functions read
/// (for example a cache keyed by the current parameter values).
pub trait EvaluationCallback: Send + Sync {
    /// `new_evaluation_point` is `true` when parameter values may have changed since the
    /// previous call.
    fn prepare_for_evaluation(&self, evaluate_jacobians: bool, new_evaluation_point: bool);
}
