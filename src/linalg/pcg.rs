//! Jacobi-preconditioned conjugate gradient.
//!
//! General-purpose iterative alternative to the direct factorization for
//! well-conditioned symmetric positive definite systems. The SLAM path never
//! uses it; callers opt in explicitly.

use nalgebra::{DMatrix, DVector};

/// Relative residual tolerance for termination.
const RESIDUAL_TOLERANCE: f64 = 1e-6;

/// Solve `A x = b` by conjugate gradient with a Jacobi preconditioner.
///
/// Iterates until `||r_k|| < 1e-6 ||r_0||` or the iteration cap is reached;
/// `max_iterations` defaults to `2 * n`.
pub fn pcg_solve(a: &DMatrix<f64>, b: &DVector<f64>, max_iterations: Option<usize>) -> DVector<f64> {
    let n = b.nrows();
    debug_assert_eq!(a.nrows(), a.ncols());
    debug_assert_eq!(a.nrows(), n);

    let cap = max_iterations.unwrap_or(2 * n);
    let m_inv: DVector<f64> = a
        .diagonal()
        .map(|d| if d.abs() > f64::EPSILON { 1.0 / d } else { 1.0 });

    let mut x = DVector::zeros(n);
    // r = b - A * 0 = b
    let mut r = b.clone();
    let threshold = RESIDUAL_TOLERANCE * r.norm();

    let mut z = m_inv.component_mul(&r);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    let mut iterations = 0;
    while r.norm() > threshold && iterations < cap {
        let w = a * &p;
        let alpha = rz / p.dot(&w);
        x += alpha * &p;
        r -= alpha * &w;

        z = m_inv.component_mul(&r);
        let rz_next = r.dot(&z);
        let beta = rz_next / rz;
        p = &z + beta * &p;
        rz = rz_next;
        iterations += 1;
    }
    x
}
