//! Error types for the apex-nlls library
//!
//! This module provides the crate-level error and result types. Module-specific errors
//! ([`CoreError`], [`ManifoldError`]) convert into [`ApexNllsError`] so callers can use a
//! single `?` chain. All errors use the `thiserror` crate for automatic trait implementations.

use crate::{core::CoreError, manifold::ManifoldError};
use thiserror::Error;

/// Main result type used throughout the apex-nlls library
pub type ApexNllsResult<T> = Result<T, ApexNllsError>;

/// Main error type for the apex-nlls library
#[derive(Debug, Clone, Error)]
pub enum ApexNllsError {
    /// Problem, program or evaluation errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Manifold construction or retraction errors
    #[error(transparent)]
    Manifold(#[from] ManifoldError),
}
