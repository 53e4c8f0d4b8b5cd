//! The optimization problem: graph storage, ordering, prior and state updates.
//!
//! A `Problem` owns its vertices and edges in id-keyed maps (edges reference
//! vertices by id only) and maintains an incidence index from vertex id to
//! edge ids. SLAM problems additionally partition the state into a leading
//! pose-class block and a trailing landmark-class block so the linear solver
//! can eliminate landmarks by Schur complement and the marginalizer can fold
//! retired keyframes into a Gaussian prior.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use tracing::{info, warn};

use crate::error::{CairnError, CairnResult};
use crate::linalg::{self, LinAlgError};
use crate::optimizer::{DogLeg, LevenbergMarquardt, SolverKind, SolverOptions, SolverReport};

use super::edge::{Edge, EdgeId};
use super::vertex::{Vertex, VertexId};

/// Structure of the optimization problem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    /// No pose/landmark structure; the linear solver factorizes the full
    /// system directly
    Generic,
    /// Pose-class variables first, landmark-class variables second; the
    /// linear solver eliminates landmarks by Schur complement
    Slam,
}

/// Graph optimization problem over vertices and factor edges.
pub struct Problem {
    kind: ProblemKind,
    options: SolverOptions,
    vertices: BTreeMap<VertexId, Box<dyn Vertex>>,
    edges: BTreeMap<EdgeId, Box<dyn Edge>>,
    vertex_to_edges: HashMap<VertexId, Vec<EdgeId>>,
    pub(crate) pose_ids: BTreeSet<VertexId>,
    pub(crate) landmark_ids: BTreeSet<VertexId>,
    pub(crate) ordering_poses: usize,
    pub(crate) ordering_landmarks: usize,
    pub(crate) ordering_generic: usize,
    pub(crate) hessian: DMatrix<f64>,
    pub(crate) b: DVector<f64>,
    pub(crate) delta_x: DVector<f64>,
    pub(crate) h_prior: DMatrix<f64>,
    pub(crate) b_prior: DVector<f64>,
    b_prior_backup: DVector<f64>,
    pub(crate) err_prior: DVector<f64>,
    err_prior_backup: DVector<f64>,
    pub(crate) jt_prior_inv: DMatrix<f64>,
    pub(crate) hessian_millis: f64,
}

impl Problem {
    /// Create an empty problem of the given kind with default options.
    pub fn new(kind: ProblemKind) -> Self {
        Self::with_options(kind, SolverOptions::default())
    }

    /// Create an empty problem with explicit solver options.
    pub fn with_options(kind: ProblemKind, options: SolverOptions) -> Self {
        Self {
            kind,
            options,
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            vertex_to_edges: HashMap::new(),
            pose_ids: BTreeSet::new(),
            landmark_ids: BTreeSet::new(),
            ordering_poses: 0,
            ordering_landmarks: 0,
            ordering_generic: 0,
            hessian: DMatrix::zeros(0, 0),
            b: DVector::zeros(0),
            delta_x: DVector::zeros(0),
            h_prior: DMatrix::zeros(0, 0),
            b_prior: DVector::zeros(0),
            b_prior_backup: DVector::zeros(0),
            err_prior: DVector::zeros(0),
            err_prior_backup: DVector::zeros(0),
            jt_prior_inv: DMatrix::zeros(0, 0),
            hessian_millis: 0.0,
        }
    }

    /// Problem kind selected at construction
    pub fn kind(&self) -> ProblemKind {
        self.kind
    }

    /// Solver options
    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Mutable solver options
    pub fn options_mut(&mut self) -> &mut SolverOptions {
        &mut self.options
    }

    // ---- graph mutation -------------------------------------------------

    /// Add a vertex. Rejects duplicate ids without mutating the problem.
    ///
    /// Adding a pose-class vertex to a SLAM problem grows the stored prior by
    /// the vertex's local dimension, new rows and columns zeroed.
    pub fn add_vertex(&mut self, vertex: Box<dyn Vertex>) -> CairnResult<()> {
        let id = vertex.id();
        if self.vertices.contains_key(&id) {
            return Err(CairnError::DuplicateVertex(id));
        }
        if self.kind == ProblemKind::Slam && vertex.kind().is_pose() {
            self.resize_prior(vertex.local_dimension());
        }
        self.vertices.insert(id, vertex);
        Ok(())
    }

    /// Remove a vertex and all edges incident to it.
    pub fn remove_vertex(&mut self, id: VertexId) -> CairnResult<()> {
        if !self.vertices.contains_key(&id) {
            return Err(CairnError::UnknownVertex(id));
        }
        for edge_id in self.connected_edges(id) {
            self.remove_edge(edge_id)?;
        }
        if let Some(vertex) = self.vertices.get_mut(&id) {
            vertex.set_ordering_id(None);
        }
        self.pose_ids.remove(&id);
        self.landmark_ids.remove(&id);
        self.vertices.remove(&id);
        self.vertex_to_edges.remove(&id);
        Ok(())
    }

    /// Add an edge. Every incident vertex must already be in the problem.
    pub fn add_edge(&mut self, edge: Box<dyn Edge>) -> CairnResult<()> {
        let id = edge.id();
        if self.edges.contains_key(&id) {
            return Err(CairnError::DuplicateEdge(id));
        }
        for vertex_id in edge.vertex_ids() {
            if !self.vertices.contains_key(vertex_id) {
                return Err(CairnError::UnknownVertex(*vertex_id));
            }
        }
        for vertex_id in edge.vertex_ids() {
            self.vertex_to_edges.entry(*vertex_id).or_default().push(id);
        }
        self.edges.insert(id, edge);
        Ok(())
    }

    /// Remove an edge.
    pub fn remove_edge(&mut self, id: EdgeId) -> CairnResult<()> {
        if self.edges.remove(&id).is_none() {
            return Err(CairnError::UnknownEdge(id));
        }
        // Incidence entries of removed edges go stale and are filtered on
        // lookup; only vertex removal erases them.
        Ok(())
    }

    /// Edges currently incident to a vertex, in insertion order.
    pub fn connected_edges(&self, vertex_id: VertexId) -> Vec<EdgeId> {
        self.vertex_to_edges
            .get(&vertex_id)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| self.edges.contains_key(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- accessors ------------------------------------------------------

    /// Look up a vertex by id.
    pub fn vertex(&self, id: VertexId) -> Option<&dyn Vertex> {
        self.vertices.get(&id).map(|vertex| vertex.as_ref())
    }

    /// Look up a vertex by id, mutably.
    pub fn vertex_mut(&mut self, id: VertexId) -> Option<&mut (dyn Vertex + 'static)> {
        self.vertices.get_mut(&id).map(|vertex| vertex.as_mut())
    }

    /// Look up an edge by id.
    pub fn edge(&self, id: EdgeId) -> Option<&dyn Edge> {
        self.edges.get(&id).map(|edge| edge.as_ref())
    }

    /// Number of vertices
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Number of edges
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Assembled Hessian (valid after `assemble_hessian`)
    pub fn hessian(&self) -> &DMatrix<f64> {
        &self.hessian
    }

    /// Assembled right-hand side of the normal equations (negative gradient)
    pub fn gradient(&self) -> &DVector<f64> {
        &self.b
    }

    /// Last computed state increment
    pub fn delta_x(&self) -> &DVector<f64> {
        &self.delta_x
    }

    /// Dimension of the pose-class block
    pub fn ordering_poses(&self) -> usize {
        self.ordering_poses
    }

    /// Dimension of the landmark-class block
    pub fn ordering_landmarks(&self) -> usize {
        self.ordering_landmarks
    }

    /// Total state dimension
    pub fn ordering_generic(&self) -> usize {
        self.ordering_generic
    }

    /// Prior Hessian on the pose block
    pub fn prior_hessian(&self) -> &DMatrix<f64> {
        &self.h_prior
    }

    /// Prior right-hand side
    pub fn prior_b(&self) -> &DVector<f64> {
        &self.b_prior
    }

    /// Prior error vector
    pub fn prior_error(&self) -> &DVector<f64> {
        &self.err_prior
    }

    // ---- ordering (pose block first, landmark block second) -------------

    /// Assign contiguous ordering indices to every vertex.
    ///
    /// Vertices are visited in ascending id order, so the result is
    /// deterministic given the vertex set and re-running is idempotent. For
    /// SLAM problems pose-class indices come first and landmark-class indices
    /// are shifted behind them afterwards.
    pub fn set_ordering(&mut self) {
        self.ordering_poses = 0;
        self.ordering_generic = 0;
        self.ordering_landmarks = 0;
        self.pose_ids.clear();
        self.landmark_ids.clear();

        let slam = self.kind == ProblemKind::Slam;
        for vertex in self.vertices.values_mut() {
            let dim = vertex.local_dimension();
            if slam {
                if vertex.kind().is_pose() {
                    vertex.set_ordering_id(Some(self.ordering_poses));
                    self.pose_ids.insert(vertex.id());
                    self.ordering_poses += dim;
                } else {
                    // Tentative index local to the landmark partition; shifted
                    // behind the pose block below.
                    vertex.set_ordering_id(Some(self.ordering_landmarks));
                    self.landmark_ids.insert(vertex.id());
                    self.ordering_landmarks += dim;
                }
            } else {
                vertex.set_ordering_id(Some(self.ordering_generic));
            }
            self.ordering_generic += dim;
        }

        if slam {
            let pose_dim = self.ordering_poses;
            for id in &self.landmark_ids {
                if let Some(vertex) = self.vertices.get_mut(id) {
                    let tentative = vertex.ordering_id().unwrap_or(0);
                    vertex.set_ordering_id(Some(tentative + pose_dim));
                }
            }
        }

        debug_assert!(self.check_ordering());
    }

    /// Validate that the SLAM ordering partition is contiguous and gap-free.
    pub fn check_ordering(&self) -> bool {
        if self.kind != ProblemKind::Slam {
            return true;
        }
        let mut current = 0;
        for id in self.pose_ids.iter().chain(self.landmark_ids.iter()) {
            match self.vertices.get(id) {
                Some(vertex) if vertex.ordering_id() == Some(current) => {
                    current += vertex.local_dimension();
                }
                _ => return false,
            }
        }
        current == self.ordering_generic
    }

    // ---- prior ----------------------------------------------------------

    /// Grow the stored prior by `dim`, new rows and columns zeroed.
    ///
    /// Used for lazy prior growth when keyframe states are appended after a
    /// marginalization pass built the prior.
    pub fn extend_hessians_prior_size(&mut self, dim: usize) {
        self.resize_prior(dim);
    }

    fn resize_prior(&mut self, dim: usize) {
        let size = self.h_prior.nrows() + dim;
        self.h_prior.resize_mut(size, size, 0.0);
        self.b_prior.resize_vertically_mut(size, 0.0);
    }

    /// Fold the stored prior into the assembled `H` and `b`.
    ///
    /// Fixed pose-class vertices are held exactly, so their rows, columns and
    /// segments are zeroed in working copies first; the stored prior keeps the
    /// information for later iterations. Landmarks carry no prior.
    pub(crate) fn fold_prior(&mut self) -> CairnResult<()> {
        if self.h_prior.nrows() == 0 {
            return Ok(());
        }
        if self.h_prior.nrows() != self.ordering_poses {
            return Err(CairnError::PriorDimensionMismatch {
                expected: self.ordering_poses,
                actual: self.h_prior.nrows(),
            });
        }

        let mut h_prior_tmp = self.h_prior.clone();
        let mut b_prior_tmp = self.b_prior.clone();
        for vertex in self.vertices.values() {
            if vertex.kind().is_pose() && vertex.is_fixed() {
                let Some(index) = vertex.ordering_id() else {
                    continue;
                };
                let dim = vertex.local_dimension();
                h_prior_tmp
                    .view_mut((index, 0), (dim, self.ordering_poses))
                    .fill(0.0);
                h_prior_tmp
                    .view_mut((0, index), (self.ordering_poses, dim))
                    .fill(0.0);
                b_prior_tmp.rows_mut(index, dim).fill(0.0);
            }
        }

        let pose_dim = self.ordering_poses;
        let mut h_block = self.hessian.view_mut((0, 0), (pose_dim, pose_dim));
        h_block += &h_prior_tmp;
        let mut b_block = self.b.rows_mut(0, pose_dim);
        b_block += &b_prior_tmp;
        Ok(())
    }

    // ---- cost -----------------------------------------------------------

    /// Robustified total cost at the residuals of the last linearization.
    pub fn current_chi2(&self) -> f64 {
        let mut chi: f64 = self.edges.values().map(|edge| edge.robust_chi2()).sum();
        if self.err_prior.nrows() > 0 {
            chi += self.err_prior.norm_squared();
        }
        0.5 * chi
    }

    /// Recompute every residual at the current parameters, then the cost.
    pub(crate) fn recompute_chi2(&mut self) -> CairnResult<f64> {
        let vertices = &self.vertices;
        let mut chi = 0.0;
        for edge in self.edges.values_mut() {
            let refs = resolve_vertices(vertices, edge.vertex_ids())?;
            edge.compute_residual(&refs);
            chi += edge.robust_chi2();
        }
        if self.err_prior.nrows() > 0 {
            chi += self.err_prior.norm_squared();
        }
        Ok(0.5 * chi)
    }

    // ---- state update / rollback ----------------------------------------

    /// Apply the current `delta_x` to every vertex through its retraction and
    /// propagate the prior by a first-order Taylor update.
    ///
    /// Everything mutated here is backed up first, so a rejected step can be
    /// undone exactly by `rollback_states`.
    pub fn update_states(&mut self) {
        for vertex in self.vertices.values_mut() {
            vertex.back_up_parameters();
            let Some(index) = vertex.ordering_id() else {
                continue;
            };
            let dim = vertex.local_dimension();
            vertex.plus(self.delta_x.rows(index, dim));
        }

        if self.err_prior.nrows() > 0 {
            self.b_prior_backup.clone_from(&self.b_prior);
            self.err_prior_backup.clone_from(&self.err_prior);
            if self.h_prior.nrows() != self.ordering_poses {
                warn!(
                    prior_dim = self.h_prior.nrows(),
                    pose_dim = self.ordering_poses,
                    "prior dimensions inconsistent with the ordering; skipping prior update"
                );
                return;
            }

            self.b_prior -= &self.h_prior * self.delta_x.rows(0, self.ordering_poses);
            let rows = self
                .ordering_poses
                .saturating_sub(self.options.prior_error_offset);
            self.err_prior = -(&self.jt_prior_inv * self.b_prior.rows(0, rows));
        }
    }

    /// Undo the last `update_states` exactly.
    pub fn rollback_states(&mut self) {
        for vertex in self.vertices.values_mut() {
            vertex.roll_back_parameters();
        }
        if self.err_prior.nrows() > 0 {
            self.b_prior.clone_from(&self.b_prior_backup);
            self.err_prior.clone_from(&self.err_prior_backup);
        }
    }

    // ---- linear solve ----------------------------------------------------

    /// Solve `(H + damping) dx = b` for the problem structure at hand.
    ///
    /// Generic problems damp the full diagonal and factorize directly. SLAM
    /// problems eliminate the landmark block first and damp only the reduced
    /// pose diagonal.
    pub(crate) fn solve_linear(&self, lambda: f64) -> CairnResult<DVector<f64>> {
        match self.kind {
            ProblemKind::Generic => {
                linalg::dense::solve_damped(&self.hessian, &self.b, lambda)
                    .ok_or(CairnError::LinAlg(LinAlgError::FactorizationFailed))
            }
            ProblemKind::Slam => {
                let blocks = self.landmark_schur_blocks();
                Ok(linalg::schur::schur_solve(
                    &self.hessian,
                    &self.b,
                    self.ordering_poses,
                    self.ordering_landmarks,
                    &blocks,
                    lambda,
                )?)
            }
        }
    }

    /// Diagonal landmark blocks as `(offset, dim)` local to the landmark
    /// partition.
    pub(crate) fn landmark_schur_blocks(&self) -> Vec<(usize, usize)> {
        self.landmark_ids
            .iter()
            .filter_map(|id| {
                let vertex = self.vertices.get(id)?;
                let index = vertex.ordering_id()?;
                Some((index - self.ordering_poses, vertex.local_dimension()))
            })
            .collect()
    }

    // ---- solve ----------------------------------------------------------

    /// Run a trust-region solve for up to `iterations` outer steps.
    pub fn solve(&mut self, kind: SolverKind, iterations: usize) -> CairnResult<SolverReport> {
        if self.edges.is_empty() || self.vertices.is_empty() {
            return Err(CairnError::EmptyProblem);
        }

        let start = Instant::now();
        self.hessian_millis = 0.0;

        let mut report = match kind {
            SolverKind::LevenbergMarquardt => LevenbergMarquardt::new().run(self, iterations)?,
            SolverKind::DogLeg => DogLeg::new().run(self, iterations)?,
        };
        report.solve_time = start.elapsed();
        report.hessian_millis = self.hessian_millis;

        let solve_millis = report.solve_time.as_secs_f64() * 1e3;
        self.append_cost_log(solve_millis, report.hessian_millis);
        info!(
            kind = %report.kind,
            iterations = report.iterations,
            final_chi = report.final_chi,
            solve_millis,
            "solve finished"
        );
        self.hessian_millis = 0.0;
        Ok(report)
    }

    fn append_cost_log(&self, solve_millis: f64, hessian_millis: f64) {
        let Some(path) = &self.options.cost_log_path else {
            return;
        };
        let line = format!("{solve_millis:.6} {hessian_millis:.6}\n");
        let written = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(error) = written {
            warn!(%error, path = %path.display(), "failed to append the solver cost log");
        }
    }

    // ---- shared lookups --------------------------------------------------

    pub(crate) fn vertices_mut(&mut self) -> &mut BTreeMap<VertexId, Box<dyn Vertex>> {
        &mut self.vertices
    }

    pub(crate) fn edges(&self) -> &BTreeMap<EdgeId, Box<dyn Edge>> {
        &self.edges
    }

    pub(crate) fn graph_mut(
        &mut self,
    ) -> (
        &BTreeMap<VertexId, Box<dyn Vertex>>,
        &mut BTreeMap<EdgeId, Box<dyn Edge>>,
    ) {
        (&self.vertices, &mut self.edges)
    }
}

/// Resolve edge vertex ids against the vertex map, preserving edge order.
pub(crate) fn resolve_vertices<'a>(
    vertices: &'a BTreeMap<VertexId, Box<dyn Vertex>>,
    ids: &[VertexId],
) -> CairnResult<Vec<&'a dyn Vertex>> {
    ids.iter()
        .map(|id| {
            vertices
                .get(id)
                .map(|vertex| vertex.as_ref())
                .ok_or(CairnError::UnknownVertex(*id))
        })
        .collect()
}
