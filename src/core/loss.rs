//! Robust kernel implementations for outlier rejection
//!
//! Robust kernels damp the influence of outlier residuals by replacing the
//! squared error `e2 = r^T Ω r` with `rho(e2)` in the cost, and reweighting
//! the normal equations with the first two derivatives of `rho`.
//!
//! # Kernels
//!
//! - `TrivialLoss`: identity (no robustification)
//! - `HuberLoss`: quadratic for small errors, linear for large
//! - `CauchyLoss`: heavy-tailed, never fully rejects
//! - `TukeyLoss`: redescending, completely rejects large outliers

use std::fmt;

/// Trait for robust kernel functions.
///
/// `evaluate` returns `[rho(e2), rho'(e2), rho''(e2)]` for the squared error
/// `e2`. The first derivative scales the gradient contribution of an edge and
/// the pair `(rho', rho'')` defines its effective information matrix.
pub trait Loss: fmt::Debug + Send + Sync {
    /// Evaluate the kernel and its first two derivatives at `e2 = r^T Ω r`.
    fn evaluate(&self, squared_error: f64) -> [f64; 3];
}

/// Identity kernel: `rho(x) = x`.
#[derive(Debug, Clone, Default)]
pub struct TrivialLoss;

impl Loss for TrivialLoss {
    fn evaluate(&self, squared_error: f64) -> [f64; 3] {
        [squared_error, 1.0, 0.0]
    }
}

/// Huber robust kernel.
///
/// Quadratic inside the threshold, linear outside:
/// `rho(x) = x` for `sqrt(x) <= delta`, else `2 delta sqrt(x) - delta^2`.
#[derive(Debug, Clone)]
pub struct HuberLoss {
    delta: f64,
}

impl HuberLoss {
    /// Create a Huber kernel with threshold `delta` on the unsquared error.
    pub fn new(delta: f64) -> Self {
        Self { delta }
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, squared_error: f64) -> [f64; 3] {
        let delta_squared = self.delta * self.delta;
        if squared_error <= delta_squared {
            [squared_error, 1.0, 0.0]
        } else {
            let error = squared_error.sqrt();
            let rho1 = self.delta / error;
            [
                2.0 * self.delta * error - delta_squared,
                rho1,
                -0.5 * rho1 / squared_error,
            ]
        }
    }
}

/// Cauchy robust kernel: `rho(x) = c^2 ln(1 + x / c^2)`.
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale_squared: f64,
}

impl CauchyLoss {
    /// Create a Cauchy kernel with scale `c`.
    pub fn new(scale: f64) -> Self {
        Self {
            scale_squared: scale * scale,
        }
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, squared_error: f64) -> [f64; 3] {
        let aux = squared_error / self.scale_squared + 1.0;
        let rho1 = 1.0 / aux;
        [
            self.scale_squared * aux.ln(),
            rho1,
            -rho1 * rho1 / self.scale_squared,
        ]
    }
}

/// Tukey biweight kernel.
///
/// Redescending M-estimator; residuals beyond the threshold contribute a
/// constant cost and zero gradient.
#[derive(Debug, Clone)]
pub struct TukeyLoss {
    delta: f64,
}

impl TukeyLoss {
    /// Create a Tukey kernel with threshold `delta` on the unsquared error.
    pub fn new(delta: f64) -> Self {
        Self { delta }
    }
}

impl Loss for TukeyLoss {
    fn evaluate(&self, squared_error: f64) -> [f64; 3] {
        let delta_squared = self.delta * self.delta;
        if squared_error.sqrt() <= self.delta {
            let aux = 1.0 - squared_error / delta_squared;
            [
                delta_squared * (1.0 - aux * aux * aux) / 3.0,
                aux * aux,
                -2.0 * aux / delta_squared,
            ]
        } else {
            [delta_squared / 3.0, 0.0, 0.0]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_trivial_loss_is_identity() {
        let loss = TrivialLoss;
        let rho = loss.evaluate(4.2);
        assert_eq!(rho, [4.2, 1.0, 0.0]);
    }

    #[test]
    fn test_huber_quadratic_region() {
        let loss = HuberLoss::new(2.0);
        let rho = loss.evaluate(1.0);
        assert_eq!(rho, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_huber_linear_region() {
        let loss = HuberLoss::new(1.0);
        let e2 = 9.0;
        let rho = loss.evaluate(e2);
        // rho = 2 * 1 * 3 - 1 = 5, rho' = 1/3
        assert!((rho[0] - 5.0).abs() < TOLERANCE);
        assert!((rho[1] - 1.0 / 3.0).abs() < TOLERANCE);
        assert!(rho[2] < 0.0);
    }

    #[test]
    fn test_huber_continuous_at_threshold() {
        let loss = HuberLoss::new(1.5);
        let below = loss.evaluate(2.25 - 1e-9);
        let above = loss.evaluate(2.25 + 1e-9);
        assert!((below[0] - above[0]).abs() < 1e-6);
        assert!((below[1] - above[1]).abs() < 1e-6);
    }

    #[test]
    fn test_cauchy_downweights_large_errors() {
        let loss = CauchyLoss::new(1.0);
        let small = loss.evaluate(0.01);
        let large = loss.evaluate(100.0);
        assert!(small[1] > large[1]);
        assert!(large[1] > 0.0);
    }

    #[test]
    fn test_tukey_rejects_beyond_threshold() {
        let loss = TukeyLoss::new(2.0);
        let rho = loss.evaluate(100.0);
        assert!((rho[0] - 4.0 / 3.0).abs() < TOLERANCE);
        assert_eq!(rho[1], 0.0);
        assert_eq!(rho[2], 0.0);
    }

    #[test]
    fn test_tukey_inside_threshold() {
        let loss = TukeyLoss::new(2.0);
        let rho = loss.evaluate(0.0);
        assert_eq!(rho[0], 0.0);
        assert_eq!(rho[1], 1.0);
    }
}
