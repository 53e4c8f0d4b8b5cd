//! Factor edges of the optimization graph.
//!
//! An edge measures a function of its incident vertices: it produces a
//! residual, one Jacobian block per vertex, an SPD information matrix and,
//! optionally, a robust kernel. Edges reference vertices by id only; the
//! problem resolves the references when it asks an edge to relinearize.

use nalgebra::{DMatrix, DVector};
use std::fmt;

use super::loss::Loss;
use super::vertex::{Vertex, VertexId};

/// Unique identifier for edges in the problem
pub type EdgeId = u64;

/// Factor interface consumed by the solver core.
///
/// `compute_residual` and `compute_jacobians` must be re-invokable and
/// idempotent for a fixed parameter state; the accessors return whatever the
/// last computation produced. The `vertices` slice is always aligned with
/// `vertex_ids()`.
pub trait Edge: fmt::Debug + Send + Sync {
    /// Stable identifier, unique within a problem
    fn id(&self) -> EdgeId;

    /// Incident vertices, in Jacobian order
    fn vertex_ids(&self) -> &[VertexId];

    /// Residual dimension `D_r`
    fn residual_dimension(&self) -> usize;

    /// Recompute the residual at the vertices' current parameters
    fn compute_residual(&mut self, vertices: &[&dyn Vertex]);

    /// Recompute the Jacobian blocks at the vertices' current parameters
    fn compute_jacobians(&mut self, vertices: &[&dyn Vertex]);

    /// Residual from the last `compute_residual` call
    fn residual(&self) -> &DVector<f64>;

    /// Jacobian blocks from the last `compute_jacobians` call, aligned with
    /// `vertex_ids()`; block `i` has shape `D_r x local_dimension(v_i)`
    fn jacobians(&self) -> &[DMatrix<f64>];

    /// Information matrix (inverse measurement covariance)
    fn information(&self) -> &DMatrix<f64>;

    /// Robust kernel, if any
    fn loss(&self) -> Option<&dyn Loss> {
        None
    }

    /// Squared error `r^T Ω r` at the current residual
    fn chi2(&self) -> f64 {
        let residual = self.residual();
        (self.information() * residual).dot(residual)
    }

    /// Robustified squared error `rho(r^T Ω r)` used in cost accumulation
    fn robust_chi2(&self) -> f64 {
        let e2 = self.chi2();
        match self.loss() {
            Some(loss) => loss.evaluate(e2)[0],
            None => e2,
        }
    }

    /// Robust weighting of the current residual.
    ///
    /// Returns the scalar gradient weight `rho'` and the effective information
    /// matrix. With a kernel attached the effective information is the
    /// symmetric Triggs-corrected form
    /// `rho' Ω + 2 rho'' (Ω r)(Ω r)^T`, with the rank-one correction dropped
    /// when `rho' + 2 rho'' e2 <= 0`; without a kernel it is `Ω` itself with
    /// weight 1.
    fn robust_info(&self) -> (f64, DMatrix<f64>) {
        match self.loss() {
            Some(loss) => {
                let e2 = self.chi2();
                let rho = loss.evaluate(e2);
                let mut info = self.information() * rho[1];
                if rho[1] + 2.0 * rho[2] * e2 > 0.0 {
                    let weighted = self.information() * self.residual();
                    info += 2.0 * rho[2] * &weighted * weighted.transpose();
                }
                (rho[1], info)
            }
            None => (1.0, self.information().clone()),
        }
    }
}

/// Linear factor over vector-valued vertices.
///
/// Measures `r = sum_i A_i x_i - z` with constant coefficient blocks `A_i`,
/// so the Jacobians never change between relinearizations. Covers priors
/// (`A = I`), relative constraints (`A_0 = -I`, `A_1 = I`) and linearized
/// observation models; the nonlinear factors of a full pipeline implement the
/// same trait outside the core.
#[derive(Debug)]
pub struct LinearEdge {
    id: EdgeId,
    vertex_ids: Vec<VertexId>,
    coefficients: Vec<DMatrix<f64>>,
    measurement: DVector<f64>,
    information: DMatrix<f64>,
    loss: Option<Box<dyn Loss>>,
    residual: DVector<f64>,
}

impl LinearEdge {
    /// Create a linear factor.
    ///
    /// Every coefficient block must have `measurement.len()` rows and as many
    /// columns as the matching vertex has parameters.
    pub fn new(
        id: EdgeId,
        vertex_ids: Vec<VertexId>,
        coefficients: Vec<DMatrix<f64>>,
        measurement: DVector<f64>,
        information: DMatrix<f64>,
    ) -> Self {
        debug_assert_eq!(vertex_ids.len(), coefficients.len());
        debug_assert!(coefficients
            .iter()
            .all(|block| block.nrows() == measurement.len()));
        let dim = measurement.len();
        Self {
            id,
            vertex_ids,
            coefficients,
            measurement,
            information,
            loss: None,
            residual: DVector::zeros(dim),
        }
    }

    /// Unary prior factor `r = x - z` with identity Jacobian.
    pub fn prior(id: EdgeId, vertex: VertexId, measurement: DVector<f64>) -> Self {
        let dim = measurement.len();
        Self::new(
            id,
            vec![vertex],
            vec![DMatrix::identity(dim, dim)],
            measurement,
            DMatrix::identity(dim, dim),
        )
    }

    /// Binary relative factor `r = x_j - x_i - z`.
    pub fn between(id: EdgeId, from: VertexId, to: VertexId, measurement: DVector<f64>) -> Self {
        let dim = measurement.len();
        Self::new(
            id,
            vec![from, to],
            vec![
                -DMatrix::identity(dim, dim),
                DMatrix::identity(dim, dim),
            ],
            measurement,
            DMatrix::identity(dim, dim),
        )
    }

    /// Attach a robust kernel.
    pub fn with_loss(mut self, loss: Box<dyn Loss>) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Replace the information matrix.
    pub fn with_information(mut self, information: DMatrix<f64>) -> Self {
        debug_assert_eq!(information.nrows(), self.measurement.len());
        self.information = information;
        self
    }
}

impl Edge for LinearEdge {
    fn id(&self) -> EdgeId {
        self.id
    }

    fn vertex_ids(&self) -> &[VertexId] {
        &self.vertex_ids
    }

    fn residual_dimension(&self) -> usize {
        self.measurement.len()
    }

    fn compute_residual(&mut self, vertices: &[&dyn Vertex]) {
        debug_assert_eq!(vertices.len(), self.coefficients.len());
        self.residual.copy_from(&self.measurement);
        self.residual.neg_mut();
        for (block, vertex) in self.coefficients.iter().zip(vertices) {
            self.residual += block * vertex.parameters();
        }
    }

    fn compute_jacobians(&mut self, _vertices: &[&dyn Vertex]) {
        // Coefficients are the Jacobians; nothing to relinearize.
    }

    fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    fn jacobians(&self) -> &[DMatrix<f64>] {
        &self.coefficients
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn loss(&self) -> Option<&dyn Loss> {
        self.loss.as_deref()
    }
}
