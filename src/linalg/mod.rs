//! Dense linear algebra routines for the normal equations.
//!
//! The solver stores `H` and `b` as dense matrices indexed by the variable
//! ordering; sparsity is exploited structurally (block-diagonal landmark
//! elimination) rather than through a sparse matrix format.

pub mod dense;
pub mod pcg;
pub mod schur;

use thiserror::Error;

/// Linear-algebra error type for cairn-solver
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Operand shapes are inconsistent
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A diagonal landmark block could not be inverted
    #[error("landmark block at offset {offset} (dim {dim}) is singular")]
    SingularBlock { offset: usize, dim: usize },

    /// The reduced system could not be factorized
    #[error("factorization of the linear system failed")]
    FactorizationFailed,
}

/// Result type for linear-algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

pub use dense::{selfadjoint_pseudo_inverse, solve_damped, solve_symmetric};
pub use pcg::pcg_solve;
pub use schur::{schur_reduce, schur_solve, SchurReduced};
