//! Dense symmetric solves and nullspace-safe inverses.

use nalgebra::{Cholesky, DMatrix, DVector};

/// Relative eigenvalue cutoff for the pseudo-inverse fallback.
const PINV_EPS: f64 = 1e-10;

/// Solve a symmetric positive semi-definite system `A x = b`.
///
/// Attempts a Cholesky factorization first. Near the semi-definite boundary
/// (zero rows from fixed variables, gauge freedoms) Cholesky fails and the
/// solve falls back to a self-adjoint eigendecomposition pseudo-inverse, which
/// returns the minimum-norm solution and zeros along the nullspace.
pub fn solve_symmetric(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    if a.nrows() != a.ncols() || a.nrows() != b.nrows() {
        return None;
    }
    if let Some(chol) = Cholesky::new(a.clone()) {
        return Some(chol.solve(b));
    }
    let scale = a.amax();
    let eps = if scale > 0.0 { PINV_EPS * scale } else { PINV_EPS };
    Some(selfadjoint_pseudo_inverse(a, eps) * b)
}

/// Solve the damped system `(A + lambda I) x = b`.
pub fn solve_damped(a: &DMatrix<f64>, b: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
    let mut damped = a.clone();
    for i in 0..damped.nrows().min(damped.ncols()) {
        damped[(i, i)] += lambda;
    }
    solve_symmetric(&damped, b)
}

/// Moore-Penrose-style inverse of a symmetric matrix.
///
/// Eigenvalues with magnitude at most `eps` are treated as nullspace and
/// inverted to zero; the remaining spectrum is inverted and reconstituted with
/// the original eigenvectors.
pub fn selfadjoint_pseudo_inverse(m: &DMatrix<f64>, eps: f64) -> DMatrix<f64> {
    let eigen = m.clone().symmetric_eigen();
    let inverted = eigen
        .eigenvalues
        .map(|value| if value > eps { 1.0 / value } else { 0.0 });
    &eigen.eigenvectors * DMatrix::from_diagonal(&inverted) * eigen.eigenvectors.transpose()
}
