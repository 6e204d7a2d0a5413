//! # Apex NLLS
//!
//! Problem representation and residual evaluation core for robust nonlinear least squares.
//!
//! ## Features
//!
//! - **Parameter and residual blocks**: a graph of decision variables and vector-valued
//!   cost terms with strict index/offset bookkeeping for downstream linear solvers
//! - **Robust loss functions**: Huber, SoftLOne, Cauchy, Arctan, Tolerant, Tukey and
//!   the composed, scaled and wrapper combinators, with analytic derivatives
//! - **Second-order correction**: the corrector rescales residuals and Jacobians so that a
//!   plain least-squares solver sees the robustified problem
//! - **Manifolds**: over-parameterized blocks (quaternions, subsets) with chain-rule
//!   Jacobians in the tangent space
//! - **Reduced programs**: constant residuals and parameter blocks are stripped and their
//!   cost folded into a fixed offset
//! - **Parallel evaluation**: rayon-backed retraction and residual evaluation

pub mod core;
pub mod error;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;

pub use crate::core::{
    CoreError, CoreResult,
    cost_function::{CostFunction, EvaluationCallback},
    loss_functions::{Loss, LossFunction},
    parameter_block::ParameterBlockId,
    problem::{
        EvaluateOptions, EvaluationRequest, Problem, ProblemEvaluation, ProblemOptions,
        ResidualBlockEvaluation,
    },
    program::{Program, ReducedProgram},
    residual_block::ResidualBlockId,
};
pub use error::{ApexNllsError, ApexNllsResult};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{EuclideanManifold, Manifold, QuaternionManifold, SubsetManifold};
