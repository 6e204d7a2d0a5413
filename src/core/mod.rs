//! Core problem representation for the apex-nlls library
//!
//! This module contains the fundamental building blocks of a robust least-squares problem:
//! - Parameter blocks with bounds, constancy and manifolds
//! - Residual blocks and the user cost-function contract
//! - Loss functions for robust estimation and the corrector that applies them
//! - Programs (ordered, indexed views of the problem) and their evaluation
//! - The user-facing [`problem::Problem`] graph builder

use thiserror::Error;
use tracing::error;

pub mod corrector;
pub mod cost_function;
pub mod evaluator;
pub mod loss_functions;
pub mod parameter_block;
pub mod problem;
pub mod program;
pub mod residual_block;

/// Core-specific error types for problem construction and evaluation
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Invalid input parameters (non-positive loss scale, bad options, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A cost function or manifold failed, or produced non-finite output
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Program index/offset bookkeeping is inconsistent
    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    /// Parameter values or bounds are infeasible
    #[error("Infeasible: {0}")]
    Infeasible(String),

    /// Manifold plus or plus-Jacobian failed on a parameter block
    #[error("Manifold error: {0}")]
    Manifold(String),

    /// A parallel task failed or the thread configuration is unusable
    #[error("Parallel computation error: {0}")]
    ParallelComputation(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```
    /// use apex_nlls::core::CoreError;
    ///
    /// let err = CoreError::InvalidProgram("index mismatch".to_string()).log();
    /// assert!(err.to_string().contains("index mismatch"));
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_display() {
        assert_eq!(
            CoreError::Infeasible("block x".into()).to_string(),
            "Infeasible: block x"
        );
        assert_eq!(
            CoreError::ParallelComputation("aborted".into()).to_string(),
            "Parallel computation error: aborted"
        );
    }

    #[test]
    fn test_core_error_log_returns_self() {
        let err = CoreError::Evaluation("nan".into()).log_with_source("source");
        assert!(matches!(err, CoreError::Evaluation(ref msg) if msg == "nan"));
    }
}
