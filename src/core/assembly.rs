//! Hessian and gradient accumulation from the factor edges.
//!
//! Every edge contributes `J_i^T W J_j` blocks to `H` and `-rho' J_i^T Ω r`
//! segments to `b` at the ordering indices of its incident vertices. `H` uses
//! the robust-kernel-reweighted information `W = Ω̃` while `b` uses the raw
//! `Ω` scaled by `rho'`; the asymmetry is part of the robust linearization and
//! must not be "fixed". Three accumulation backends produce identical results
//! up to floating-point reassociation.

use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{CairnError, CairnResult};
use crate::optimizer::HessianBackend;

use super::edge::Edge;
use super::problem::{resolve_vertices, Problem};
use super::vertex::Vertex;

/// Ordering snapshot of one incident vertex.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VertexMeta {
    pub index: usize,
    pub dim: usize,
    pub fixed: bool,
}

/// Collect ordering metadata for an edge's incident vertices.
pub(crate) fn vertex_metas(vertices: &[&dyn Vertex]) -> CairnResult<Vec<VertexMeta>> {
    vertices
        .iter()
        .map(|vertex| {
            let index = vertex
                .ordering_id()
                .ok_or(CairnError::MissingOrdering(vertex.id()))?;
            Ok(VertexMeta {
                index,
                dim: vertex.local_dimension(),
                fixed: vertex.is_fixed(),
            })
        })
        .collect()
}

/// Dense blocks and gradient segments produced by a single edge.
///
/// Computed without touching the shared system so parallel backends can do
/// the expensive products outside any lock.
pub(crate) struct EdgeContribution {
    blocks: Vec<(usize, usize, DMatrix<f64>)>,
    segments: Vec<(usize, DVector<f64>)>,
}

/// Linearize one edge into its scatter contributions.
///
/// `skip_fixed` drops fixed vertices entirely (the solve path); the
/// marginalizer keeps them. `robust_gradient` switches the gradient segments
/// from `-rho' J^T Ω r` (solve path) to `-J^T Ω̃ r` (marginalization path).
pub(crate) fn edge_contribution(
    edge: &dyn Edge,
    metas: &[VertexMeta],
    skip_fixed: bool,
    robust_gradient: bool,
) -> EdgeContribution {
    let jacobians = edge.jacobians();
    let residual = edge.residual();
    let (drho, robust_info) = edge.robust_info();

    let mut blocks = Vec::new();
    let mut segments = Vec::new();
    for (i, meta_i) in metas.iter().enumerate() {
        if skip_fixed && meta_i.fixed {
            continue;
        }
        debug_assert_eq!(jacobians[i].ncols(), meta_i.dim);
        let jt_w = jacobians[i].transpose() * &robust_info;
        for (j, meta_j) in metas.iter().enumerate().skip(i) {
            if skip_fixed && meta_j.fixed {
                continue;
            }
            blocks.push((meta_i.index, meta_j.index, &jt_w * &jacobians[j]));
        }
        let gradient = if robust_gradient {
            &jt_w * residual
        } else {
            jacobians[i].transpose() * (edge.information() * residual) * drho
        };
        segments.push((meta_i.index, -gradient));
    }
    EdgeContribution { blocks, segments }
}

/// Scatter one edge's contributions into the system, mirroring off-diagonal
/// blocks into the symmetric lower triangle.
pub(crate) fn apply_contribution(
    h: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    contribution: &EdgeContribution,
) {
    for (row, col, block) in &contribution.blocks {
        let mut upper = h.view_mut((*row, *col), (block.nrows(), block.ncols()));
        upper += block;
        if row != col {
            let mut lower = h.view_mut((*col, *row), (block.ncols(), block.nrows()));
            lower += &block.transpose();
        }
    }
    for (index, segment) in &contribution.segments {
        let mut rows = b.rows_mut(*index, segment.nrows());
        rows += segment;
    }
}

impl Problem {
    /// Build `H` and `b` from all edges with the configured backend, fold the
    /// prior in and reset the state increment.
    ///
    /// Requires `set_ordering` to have run since the last graph mutation.
    pub fn assemble_hessian(&mut self) -> CairnResult<()> {
        let start = Instant::now();
        let size = self.ordering_generic;
        let backend = self.options().backend;
        let (h, b) = match backend {
            HessianBackend::Serial => self.accumulate_serial(size)?,
            HessianBackend::Partitioned => self.accumulate_partitioned(size)?,
            HessianBackend::Reduction => self.accumulate_reduction(size)?,
        };
        self.hessian = h;
        self.b = b;
        self.hessian_millis += start.elapsed().as_secs_f64() * 1e3;

        self.fold_prior()?;
        self.delta_x = DVector::zeros(size);
        Ok(())
    }

    fn accumulate_serial(&mut self, size: usize) -> CairnResult<(DMatrix<f64>, DVector<f64>)> {
        let mut h = DMatrix::zeros(size, size);
        let mut b = DVector::zeros(size);
        let (vertices, edges) = self.graph_mut();
        for edge in edges.values_mut() {
            let refs = resolve_vertices(vertices, edge.vertex_ids())?;
            let metas = vertex_metas(&refs)?;
            edge.compute_residual(&refs);
            edge.compute_jacobians(&refs);
            let contribution = edge_contribution(&**edge, &metas, true, false);
            apply_contribution(&mut h, &mut b, &contribution);
        }
        Ok((h, b))
    }

    fn accumulate_partitioned(&mut self, size: usize) -> CairnResult<(DMatrix<f64>, DVector<f64>)> {
        let workers = self.options().assembly_threads.max(1);
        let (vertices, edges) = self.graph_mut();

        // Snapshot the edges in id order so stripe assignment is
        // deterministic, resolving vertex references up front.
        let mut work = Vec::with_capacity(edges.len());
        for edge in edges.values_mut() {
            let refs = resolve_vertices(vertices, edge.vertex_ids())?;
            let metas = vertex_metas(&refs)?;
            work.push((edge, refs, metas));
        }
        let mut buckets: Vec<Vec<_>> = (0..workers).map(|_| Vec::new()).collect();
        for (position, item) in work.into_iter().enumerate() {
            buckets[position % workers].push(item);
        }

        // Stripes share pose blocks, so every scatter into H and b runs under
        // the one lock; the per-edge products happen outside it.
        let shared = Mutex::new((DMatrix::zeros(size, size), DVector::zeros(size)));
        let shared_ref = &shared;
        thread::scope(|scope| {
            for bucket in buckets {
                scope.spawn(move || {
                    for (edge, refs, metas) in bucket {
                        edge.compute_residual(&refs);
                        edge.compute_jacobians(&refs);
                        let contribution = edge_contribution(&**edge, &metas, true, false);
                        let mut guard = shared_ref.lock().unwrap();
                        let (h_ref, b_ref) = &mut *guard;
                        apply_contribution(h_ref, b_ref, &contribution);
                    }
                });
            }
        });
        let (h, b) = shared.into_inner().unwrap();
        Ok((h, b))
    }

    fn accumulate_reduction(&mut self, size: usize) -> CairnResult<(DMatrix<f64>, DVector<f64>)> {
        let (vertices, edges) = self.graph_mut();
        let mut work = Vec::with_capacity(edges.len());
        for edge in edges.values_mut() {
            let refs = resolve_vertices(vertices, edge.vertex_ids())?;
            let metas = vertex_metas(&refs)?;
            work.push((edge, refs, metas));
        }

        let (h, b) = work
            .par_iter_mut()
            .map(|(edge, refs, metas)| {
                edge.compute_residual(refs);
                edge.compute_jacobians(refs);
                edge_contribution(&***edge, metas, true, false)
            })
            .fold(
                || (DMatrix::zeros(size, size), DVector::zeros(size)),
                |(mut h, mut b), contribution| {
                    apply_contribution(&mut h, &mut b, &contribution);
                    (h, b)
                },
            )
            .reduce(
                || (DMatrix::zeros(size, size), DVector::zeros(size)),
                |(mut h1, mut b1), (h2, b2)| {
                    h1 += h2;
                    b1 += b2;
                    (h1, b1)
                },
            );
        Ok((h, b))
    }
}
