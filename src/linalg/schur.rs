//! Schur complement elimination of the landmark block.
//!
//! For SLAM problems the normal equations are partitioned as
//!
//! ```text
//! [ H_rr  H_rs ] [ dx_r ]   [ b_r ]
//! [ H_sr  H_ss ] [ dx_s ] = [ b_s ]
//! ```
//!
//! with `r` the reserved pose block and `s` the landmark block. `H_ss` is
//! exactly block-diagonal whenever every edge touches at most one landmark, so
//! its inverse is formed one small diagonal block at a time and the pose block
//! is reduced before a single dense factorization.

use nalgebra::{DMatrix, DVector};

use super::{dense, LinAlgError, LinAlgResult};

/// Outcome of eliminating the landmark block.
#[derive(Debug, Clone)]
pub struct SchurReduced {
    /// Reduced pose-block Hessian `H_rr - H_rs H_ss^-1 H_sr`
    pub h_reduced: DMatrix<f64>,
    /// Reduced pose-block right-hand side `b_r - H_rs H_ss^-1 b_s`
    pub b_reduced: DVector<f64>,
    /// Block-diagonal inverse of `H_ss`, kept for back-substitution
    pub hss_inv: DMatrix<f64>,
}

/// Eliminate the landmark block from the normal equations.
///
/// `landmark_blocks` lists `(offset, dim)` pairs local to the landmark
/// partition; only those diagonal blocks of `H_ss` are inverted, off-diagonal
/// entries are ignored.
pub fn schur_reduce(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    reserve_size: usize,
    schur_size: usize,
    landmark_blocks: &[(usize, usize)],
) -> LinAlgResult<SchurReduced> {
    let total = reserve_size + schur_size;
    if h.nrows() != total || h.ncols() != total || b.nrows() != total {
        return Err(LinAlgError::DimensionMismatch(format!(
            "expected a {total}x{total} system, got H {}x{} and b {}",
            h.nrows(),
            h.ncols(),
            b.nrows()
        )));
    }

    let h_rr = h.view((0, 0), (reserve_size, reserve_size));
    let h_rs = h.view((0, reserve_size), (reserve_size, schur_size));
    let h_sr = h.view((reserve_size, 0), (schur_size, reserve_size));
    let h_ss = h.view((reserve_size, reserve_size), (schur_size, schur_size));
    let b_r = b.rows(0, reserve_size);
    let b_s = b.rows(reserve_size, schur_size);

    let mut hss_inv = DMatrix::zeros(schur_size, schur_size);
    for &(offset, dim) in landmark_blocks {
        if offset + dim > schur_size {
            return Err(LinAlgError::DimensionMismatch(format!(
                "landmark block {offset}+{dim} exceeds the schur partition {schur_size}"
            )));
        }
        let block = h_ss.view((offset, offset), (dim, dim)).clone_owned();
        let inverse = block
            .try_inverse()
            .ok_or(LinAlgError::SingularBlock { offset, dim })?;
        hss_inv
            .view_mut((offset, offset), (dim, dim))
            .copy_from(&inverse);
    }

    let t = h_rs * &hss_inv;
    let h_reduced = h_rr.clone_owned() - &t * h_sr;
    let b_reduced = b_r.clone_owned() - &t * b_s;

    Ok(SchurReduced {
        h_reduced,
        b_reduced,
        hss_inv,
    })
}

/// Solve the full system through the Schur complement.
///
/// Damping `lambda` is applied on the reduced pose diagonal only; the landmark
/// update is recovered by back-substitution through the cached block-diagonal
/// inverse.
pub fn schur_solve(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    reserve_size: usize,
    schur_size: usize,
    landmark_blocks: &[(usize, usize)],
    lambda: f64,
) -> LinAlgResult<DVector<f64>> {
    let reduced = schur_reduce(h, b, reserve_size, schur_size, landmark_blocks)?;

    let mut h_damped = reduced.h_reduced;
    for i in 0..reserve_size {
        h_damped[(i, i)] += lambda;
    }

    let dx_r = dense::solve_symmetric(&h_damped, &reduced.b_reduced)
        .ok_or(LinAlgError::FactorizationFailed)?;

    let h_sr = h.view((reserve_size, 0), (schur_size, reserve_size));
    let b_s = b.rows(reserve_size, schur_size);
    let dx_s = &reduced.hss_inv * (b_s.clone_owned() - h_sr * &dx_r);

    let mut dx = DVector::zeros(reserve_size + schur_size);
    dx.rows_mut(0, reserve_size).copy_from(&dx_r);
    dx.rows_mut(reserve_size, schur_size).copy_from(&dx_s);
    Ok(dx)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    /// Build a small SLAM-shaped system: 2 pose dims, 2 scalar landmarks with
    /// a block-diagonal landmark block.
    fn build_system() -> (DMatrix<f64>, DVector<f64>, Vec<(usize, usize)>) {
        let h = DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 0.5, 1.0, 0.0, //
                0.5, 3.0, 0.0, 1.0, //
                1.0, 0.0, 2.0, 0.0, //
                0.0, 1.0, 0.0, 5.0,
            ],
        );
        let b = DVector::from_vec(vec![1.0, -2.0, 0.5, 1.5]);
        let blocks = vec![(0, 1), (1, 1)];
        (h, b, blocks)
    }

    #[test]
    fn test_schur_solve_matches_dense_solve() {
        let (h, b, blocks) = build_system();

        let dx_schur = schur_solve(&h, &b, 2, 2, &blocks, 0.0).unwrap();
        let dx_dense = dense::solve_symmetric(&h, &b).unwrap();

        assert!((dx_schur - dx_dense).amax() < TOLERANCE);
    }

    #[test]
    fn test_reduction_shapes() {
        let (h, b, blocks) = build_system();
        let reduced = schur_reduce(&h, &b, 2, 2, &blocks).unwrap();

        assert_eq!(reduced.h_reduced.nrows(), 2);
        assert_eq!(reduced.h_reduced.ncols(), 2);
        assert_eq!(reduced.b_reduced.nrows(), 2);
    }

    #[test]
    fn test_singular_landmark_block_reported() {
        let (mut h, b, blocks) = build_system();
        h[(2, 2)] = 0.0;

        let result = schur_reduce(&h, &b, 2, 2, &blocks);
        match result {
            Err(LinAlgError::SingularBlock { offset: 0, dim: 1 }) => {}
            other => panic!("expected a singular block error, got {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_reported() {
        let (h, b, blocks) = build_system();
        assert!(schur_reduce(&h, &b, 3, 2, &blocks).is_err());
    }

    #[test]
    fn test_empty_schur_partition() {
        // No landmarks: the reduction degenerates to the pose system itself.
        let h = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]);
        let b = DVector::from_vec(vec![2.0, 4.0]);

        let dx = schur_solve(&h, &b, 2, 0, &[], 0.0).unwrap();
        assert!((dx[0] - 1.0).abs() < TOLERANCE);
        assert!((dx[1] - 2.0).abs() < TOLERANCE);
    }
}
