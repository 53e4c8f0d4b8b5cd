//! Marginalization of retired keyframes into a Gaussian prior.
//!
//! The information carried by a keyframe and the landmarks it anchors is
//! folded into a quadratic prior on the remaining pose state: landmarks are
//! eliminated by the block-diagonal Schur complement, the keyframe block is
//! moved to the tail of the system and eliminated through a nullspace-safe
//! eigendecomposition inverse, and the resulting prior is re-expressed in
//! square-root form so later solves can evaluate a prior error vector.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{CairnError, CairnResult};
use crate::linalg::dense::selfadjoint_pseudo_inverse;
use crate::linalg::{schur, LinAlgError};

use super::assembly::{apply_contribution, edge_contribution, vertex_metas};
use super::problem::{resolve_vertices, Problem};
use super::vertex::VertexId;

/// Eigenvalues at or below this threshold count as nullspace.
const NULLSPACE_EPS: f64 = 1e-8;

/// Prior entries below this magnitude are numerical chaff and dropped.
const PRIOR_CHAFF_EPS: f64 = 1e-9;

impl Problem {
    /// Marginalize pose-class vertices (and the landmarks anchored to the
    /// first of them) into the stored prior, then remove them.
    ///
    /// `marg_vertex_ids[0]` is the keyframe whose incident edges (visual
    /// observations and pre-integration constraints) feed the reduced system;
    /// `pose_dim` is the total pose-block dimension to preserve, normally
    /// `ordering_poses`. Landmarks observed by those edges must not be
    /// shared with edges that should survive; remove such edges first.
    pub fn marginalize(
        &mut self,
        marg_vertex_ids: &[VertexId],
        pose_dim: usize,
    ) -> CairnResult<()> {
        let Some(&keyframe_id) = marg_vertex_ids.first() else {
            return Err(CairnError::EmptyMarginalization);
        };
        if self.vertex(keyframe_id).is_none() {
            return Err(CairnError::UnknownVertex(keyframe_id));
        }

        self.set_ordering();
        let marg_edges = self.connected_edges(keyframe_id);

        // Landmarks touched by the marginalized edges get fresh contiguous
        // indices behind the preserved pose block; pose indices stay as the
        // ordering assigned them. The map records (assigned index, dim).
        let mut marg_landmarks: BTreeMap<VertexId, (usize, usize)> = BTreeMap::new();
        let mut marg_landmark_size = 0usize;
        for edge_id in &marg_edges {
            let incident: Vec<VertexId> = self
                .edges()
                .get(edge_id)
                .map(|edge| edge.vertex_ids().to_vec())
                .unwrap_or_default();
            for vertex_id in incident {
                let Some(vertex) = self.vertices_mut().get_mut(&vertex_id) else {
                    continue;
                };
                if vertex.kind().is_landmark() && !marg_landmarks.contains_key(&vertex_id) {
                    let index = pose_dim + marg_landmark_size;
                    vertex.set_ordering_id(Some(index));
                    marg_landmarks.insert(vertex_id, (index, vertex.local_dimension()));
                    marg_landmark_size += vertex.local_dimension();
                }
            }
        }
        debug!(
            keyframe = keyframe_id,
            edges = marg_edges.len(),
            landmarks = marg_landmarks.len(),
            "marginalizing keyframe"
        );

        // Assemble the reduced system over the marginalized edges only. Fixed
        // vertices stay in; both H and b use the robust-reweighted
        // information here.
        let size = pose_dim + marg_landmark_size;
        let mut h_marg = DMatrix::zeros(size, size);
        let mut b_marg = DVector::zeros(size);
        {
            let (vertices, edges) = self.graph_mut();
            for edge_id in &marg_edges {
                let Some(edge) = edges.get_mut(edge_id) else {
                    continue;
                };
                let refs = resolve_vertices(vertices, edge.vertex_ids())?;
                let metas = vertex_metas(&refs)?;
                edge.compute_residual(&refs);
                edge.compute_jacobians(&refs);
                let contribution = edge_contribution(&**edge, &metas, false, true);
                apply_contribution(&mut h_marg, &mut b_marg, &contribution);
            }
        }

        // Eliminate the landmark partition.
        if marg_landmark_size > 0 {
            let blocks: Vec<(usize, usize)> = marg_landmarks
                .values()
                .map(|&(index, dim)| (index - pose_dim, dim))
                .collect();
            let reduced = schur::schur_reduce(&h_marg, &b_marg, pose_dim, marg_landmark_size, &blocks)?;
            h_marg = reduced.h_reduced;
            b_marg = reduced.b_reduced;
        }

        // Fold the existing prior into the reduced system.
        if self.h_prior.nrows() > 0 {
            if self.h_prior.nrows() != pose_dim {
                return Err(CairnError::PriorDimensionMismatch {
                    expected: pose_dim,
                    actual: self.h_prior.nrows(),
                });
            }
            h_marg += &self.h_prior;
            b_marg += &self.b_prior;
        }

        // Move every marginalized block to the bottom-right, highest ordering
        // index first so earlier moves stay valid.
        let mut marg_blocks: Vec<(usize, usize)> = Vec::with_capacity(marg_vertex_ids.len());
        for vertex_id in marg_vertex_ids {
            let vertex = self
                .vertex(*vertex_id)
                .ok_or(CairnError::UnknownVertex(*vertex_id))?;
            let index = vertex
                .ordering_id()
                .ok_or(CairnError::MissingOrdering(*vertex_id))?;
            marg_blocks.push((index, vertex.local_dimension()));
        }
        marg_blocks.sort_unstable();

        let marg_dim: usize = marg_blocks.iter().map(|&(_, dim)| dim).sum();
        if marg_dim > pose_dim {
            return Err(CairnError::LinAlg(LinAlgError::DimensionMismatch(format!(
                "marginalized dimension {marg_dim} exceeds the preserved pose dimension {pose_dim}"
            ))));
        }
        for &(index, dim) in marg_blocks.iter().rev() {
            shift_block_to_tail(&mut h_marg, &mut b_marg, index, dim, pose_dim);
        }

        // Eliminate the marginalized block with a nullspace-safe inverse.
        let kept_dim = pose_dim - marg_dim;
        let a_mm = {
            let block = h_marg.view((kept_dim, kept_dim), (marg_dim, marg_dim));
            0.5 * (block.clone_owned() + block.transpose())
        };
        let a_mm_inv = selfadjoint_pseudo_inverse(&a_mm, NULLSPACE_EPS);

        let b_mm = b_marg.rows(kept_dim, marg_dim).clone_owned();
        let a_rm = h_marg.view((0, kept_dim), (kept_dim, marg_dim)).clone_owned();
        let a_mr = h_marg.view((kept_dim, 0), (marg_dim, kept_dim)).clone_owned();
        let a_rr = h_marg.view((0, 0), (kept_dim, kept_dim)).clone_owned();
        let b_rr = b_marg.rows(0, kept_dim).clone_owned();

        let coupling = &a_rm * &a_mm_inv;
        self.h_prior = a_rr - &coupling * a_mr;
        self.b_prior = b_rr - coupling * b_mm;

        // Square-root form: H_prior = J^T J with J = sqrt(S) V^T, and the
        // inverse transpose used to map b_prior back to an error vector.
        let eigen = self.h_prior.clone().symmetric_eigen();
        let s = eigen
            .eigenvalues
            .map(|value| if value > NULLSPACE_EPS { value } else { 0.0 });
        let s_inv = eigen
            .eigenvalues
            .map(|value| if value > NULLSPACE_EPS { 1.0 / value } else { 0.0 });
        let s_sqrt = s.map(f64::sqrt);
        let s_inv_sqrt = s_inv.map(f64::sqrt);

        self.jt_prior_inv = DMatrix::from_diagonal(&s_inv_sqrt) * eigen.eigenvectors.transpose();
        self.err_prior = -(&self.jt_prior_inv * &self.b_prior);

        let j = DMatrix::from_diagonal(&s_sqrt) * eigen.eigenvectors.transpose();
        self.h_prior = j.transpose() * &j;
        self.h_prior = self
            .h_prior
            .map(|value| if value.abs() > PRIOR_CHAFF_EPS { value } else { 0.0 });

        // Drop the marginalized vertices; their edges go with them.
        for vertex_id in marg_vertex_ids {
            self.remove_vertex(*vertex_id)?;
        }
        let landmark_ids: Vec<VertexId> = marg_landmarks.keys().copied().collect();
        for vertex_id in landmark_ids {
            self.remove_vertex(vertex_id)?;
        }
        Ok(())
    }
}

/// Move the `dim`-wide block at `index` to the end of the `reserve`-sized
/// leading system, shifting everything behind it forward.
fn shift_block_to_tail(
    h: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    index: usize,
    dim: usize,
    reserve: usize,
) {
    let trailing = reserve - index - dim;

    let rows = h.view((index, 0), (dim, reserve)).clone_owned();
    let below = h.view((index + dim, 0), (trailing, reserve)).clone_owned();
    h.view_mut((index, 0), (trailing, reserve)).copy_from(&below);
    h.view_mut((reserve - dim, 0), (dim, reserve)).copy_from(&rows);

    let cols = h.view((0, index), (reserve, dim)).clone_owned();
    let right = h.view((0, index + dim), (reserve, trailing)).clone_owned();
    h.view_mut((0, index), (reserve, trailing)).copy_from(&right);
    h.view_mut((0, reserve - dim), (reserve, dim)).copy_from(&cols);

    let segment = b.rows(index, dim).clone_owned();
    let tail = b.rows(index + dim, trailing).clone_owned();
    b.rows_mut(index, trailing).copy_from(&tail);
    b.rows_mut(reserve - dim, dim).copy_from(&segment);
}
