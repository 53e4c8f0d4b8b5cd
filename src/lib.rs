//! # Cairn Solver
//!
//! A graph optimization back-end for SLAM and visual-inertial estimation.
//! Camera poses, speed/bias states and landmarks enter as vertices; residuals
//! with analytic Jacobians and information matrices enter as factor edges.
//! The solver iteratively refines the vertices to minimize the robustified
//! sum of squared residuals.
//!
//! ## Features
//!
//! - **Trust-region drivers**: Levenberg-Marquardt with the Nielsen damping
//!   law and Powell's Dog Leg with an adaptive radius
//! - **Block-structured linear solve**: Schur complement elimination of the
//!   landmark block before a dense factorization on the pose block
//! - **Parallel Hessian assembly**: serial, thread-partitioned and
//!   rayon-reduction backends with identical results up to floating-point
//!   reassociation
//! - **Keyframe marginalization**: retired states fold into a Gaussian prior
//!   through nullspace-safe eigendecomposition inverses
//! - **Robust kernels**: Huber, Cauchy and Tukey reweighting of outlier
//!   residuals
//!
//! ## Example
//!
//! ```
//! use cairn_solver::{
//!     LinearEdge, Problem, ProblemKind, SolverKind, SolverOptions, VectorVertex, VertexKind,
//! };
//! use nalgebra::dvector;
//!
//! let options = SolverOptions::new().with_cost_log_path(None);
//! let mut problem = Problem::with_options(ProblemKind::Generic, options);
//! problem
//!     .add_vertex(Box::new(VectorVertex::new(
//!         0,
//!         VertexKind::Pose,
//!         dvector![2.0, -1.0],
//!     )))
//!     .unwrap();
//! problem
//!     .add_edge(Box::new(LinearEdge::prior(0, 0, dvector![0.0, 0.0])))
//!     .unwrap();
//!
//! let report = problem.solve(SolverKind::LevenbergMarquardt, 10).unwrap();
//! assert!(report.final_chi < 1e-8);
//! ```

pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod optimizer;

pub use crate::core::{
    CauchyLoss, Edge, EdgeId, HuberLoss, IdGenerator, LinearEdge, Loss, Problem, ProblemKind,
    TrivialLoss, TukeyLoss, VectorVertex, Vertex, VertexId, VertexKind,
};
pub use crate::error::{CairnError, CairnResult};
pub use crate::linalg::LinAlgError;
pub use crate::logger::{init_logger, init_logger_with_level};
pub use crate::optimizer::{
    DogLeg, HessianBackend, LevenbergMarquardt, SolverKind, SolverOptions, SolverReport,
};
