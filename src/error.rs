//! Error types for the cairn-solver library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.

use crate::linalg;
use thiserror::Error;

/// Main result type used throughout the cairn-solver library
pub type CairnResult<T> = Result<T, CairnError>;

/// Main error type for the cairn-solver library
#[derive(Debug, Clone, Error)]
pub enum CairnError {
    /// Solve invoked on a problem with no edges or no vertices
    #[error("cannot solve a problem without edges or vertices")]
    EmptyProblem,

    /// Solver kind index outside the supported set
    #[error("solver kind {0} is not recognized (0 = Levenberg-Marquardt, 1 = Dog Leg)")]
    InvalidSolverKind(u32),

    /// Vertex with this id is already part of the problem
    #[error("vertex {0} has been added before")]
    DuplicateVertex(u64),

    /// Edge with this id is already part of the problem
    #[error("edge {0} has been added before")]
    DuplicateEdge(u64),

    /// Vertex id not present in the problem
    #[error("vertex {0} is not in the problem")]
    UnknownVertex(u64),

    /// Edge id not present in the problem
    #[error("edge {0} is not in the problem")]
    UnknownEdge(u64),

    /// A vertex reached assembly without an ordering index
    #[error("vertex {0} has no ordering index; run ordering before assembly")]
    MissingOrdering(u64),

    /// Marginalization invoked with an empty vertex set
    #[error("marginalization requires at least one vertex")]
    EmptyMarginalization,

    /// Stored prior dimensions disagree with the pose ordering
    #[error("prior dimension {actual} does not match the pose block dimension {expected}")]
    PriorDimensionMismatch { expected: usize, actual: usize },

    /// Linear algebra operation failed
    #[error("linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CairnError::DuplicateVertex(7);
        assert_eq!(error.to_string(), "vertex 7 has been added before");

        let error = CairnError::InvalidSolverKind(3);
        assert!(error.to_string().contains("3"));
    }

    #[test]
    fn test_linalg_error_conversion() {
        let inner = linalg::LinAlgError::FactorizationFailed;
        let error = CairnError::from(inner);
        match error {
            CairnError::LinAlg(_) => {}
            _ => panic!("expected LinAlg error"),
        }
    }

    #[test]
    fn test_result_round_trip() {
        let ok: CairnResult<usize> = Ok(42);
        assert!(ok.is_ok());

        let err: CairnResult<usize> = Err(CairnError::EmptyProblem);
        assert!(err.is_err());
    }
}
