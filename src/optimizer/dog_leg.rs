//! Dog Leg optimization algorithm implementation.
//!
//! Trust region method blending the Gauss-Newton direction with the steepest
//! descent direction. The Gauss-Newton step is computed without Levenberg
//! damping; the trust radius alone controls the step length.

use std::time::Duration;

use nalgebra::DVector;
use tracing::debug;

use crate::core::Problem;
use crate::error::CairnResult;
use crate::optimizer::{SolverKind, SolverReport};

/// Initial trust radius.
const INITIAL_RADIUS: f64 = 1e4;
/// Lower bound on the trust radius.
const MIN_RADIUS: f64 = 1e-7;
/// Consecutive rejected steps before the inner loop is abandoned.
const MAX_STEP_RETRIES: usize = 10;
/// Outer loop stops once the cost decrease falls below this.
const CHI_DECREASE_TOLERANCE: f64 = 1e-5;
/// Outer loop stops once the gradient norm falls below this.
const GRADIENT_TOLERANCE: f64 = 1e-5;
/// Outer loop also stops once the cost drops below this fraction of the
/// initial cost.
const RELATIVE_STOP_FACTOR: f64 = 1e-15;

/// Region the Dog Leg step landed in; selects the predicted-reduction
/// formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepKind {
    /// Full Gauss-Newton step inside the radius
    GaussNewton,
    /// Radius-truncated steepest descent (Cauchy point outside the radius)
    Cauchy,
    /// Blend along the dog leg path between the Cauchy point and Gauss-Newton
    Blend,
}

/// Dog Leg driver operating on a [`Problem`].
#[derive(Debug)]
pub struct DogLeg {
    radius: f64,
    current_chi: f64,
    stop_threshold: f64,
    alpha: f64,
    beta: f64,
    accepted_steps: usize,
    rejected_steps: usize,
}

impl DogLeg {
    /// Create a driver in its pre-initialization state.
    pub fn new() -> Self {
        Self {
            radius: INITIAL_RADIUS,
            current_chi: 0.0,
            stop_threshold: 0.0,
            alpha: 0.0,
            beta: 0.0,
            accepted_steps: 0,
            rejected_steps: 0,
        }
    }

    /// Current trust radius.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub(crate) fn run(
        &mut self,
        problem: &mut Problem,
        iterations: usize,
    ) -> CairnResult<SolverReport> {
        problem.set_ordering();
        problem.assemble_hessian()?;
        self.initialize(problem);
        let initial_chi = self.current_chi;

        let mut stop = false;
        let mut iteration = 0;
        let mut last_chi = 0.0;
        while !stop && iteration < iterations {
            debug!(
                iteration,
                chi = self.current_chi,
                radius = self.radius,
                "dog leg iteration"
            );
            let mut step_ok = false;
            let mut failures = 0;
            while !step_ok && failures < MAX_STEP_RETRIES {
                let (step, kind) = self.compute_step(problem)?;
                problem.delta_x = step;
                problem.update_states();
                step_ok = self.evaluate_step(problem, kind)?;
                if step_ok {
                    self.accepted_steps += 1;
                    problem.assemble_hessian()?;
                    failures = 0;
                } else {
                    self.rejected_steps += 1;
                    failures += 1;
                    problem.rollback_states();
                }
            }
            if !step_ok {
                debug!(failures, "step retries exhausted; moving to the next outer iteration");
            }
            iteration += 1;

            if (iteration > 1 && last_chi - self.current_chi < CHI_DECREASE_TOLERANCE)
                || problem.b.norm() < GRADIENT_TOLERANCE
                || self.current_chi < self.stop_threshold
            {
                debug!(chi = self.current_chi, "converged, stopping");
                stop = true;
            }
            last_chi = self.current_chi;
        }

        Ok(SolverReport {
            kind: SolverKind::DogLeg,
            iterations: iteration,
            initial_chi,
            final_chi: self.current_chi,
            accepted_steps: self.accepted_steps,
            rejected_steps: self.rejected_steps,
            converged: stop,
            solve_time: Duration::ZERO,
            hessian_millis: 0.0,
        })
    }

    fn initialize(&mut self, problem: &Problem) {
        self.current_chi = problem.current_chi2();
        self.stop_threshold = RELATIVE_STOP_FACTOR * self.current_chi;
        self.radius = INITIAL_RADIUS;
    }

    /// Compute the dog leg step for the current radius.
    ///
    /// `h_gn` solves the undamped normal equations; `h_sd = b` scaled by
    /// `alpha = |b|^2 / (b^T H b)` is the Cauchy point.
    pub(crate) fn compute_step(
        &mut self,
        problem: &Problem,
    ) -> CairnResult<(DVector<f64>, StepKind)> {
        let h_gn = problem.solve_linear(0.0)?;

        let h_b = &problem.hessian * &problem.b;
        self.alpha = problem.b.norm_squared() / problem.b.dot(&h_b);
        let h_sd = problem.b.clone();

        let gn_norm = h_gn.norm();
        let sd_norm = h_sd.norm();
        if gn_norm <= self.radius {
            Ok((h_gn, StepKind::GaussNewton))
        } else if self.alpha * sd_norm >= self.radius {
            Ok((h_sd * (self.radius / sd_norm), StepKind::Cauchy))
        } else {
            let a = h_sd * self.alpha;
            let difference = &h_gn - &a;
            let c = a.dot(&difference);
            let discriminant = (c * c
                + difference.norm_squared() * (self.radius * self.radius - a.norm_squared()))
            .sqrt();
            self.beta = if c <= 0.0 {
                (-c + discriminant) / difference.norm_squared()
            } else {
                (self.radius * self.radius - a.norm_squared()) / (c + discriminant)
            };
            debug_assert!(self.beta > 0.0 && self.beta < 1.0);
            Ok((a + self.beta * difference, StepKind::Blend))
        }
    }

    /// Gain-ratio test and radius update for the step already applied.
    pub(crate) fn evaluate_step(
        &mut self,
        problem: &mut Problem,
        kind: StepKind,
    ) -> CairnResult<bool> {
        let temp_chi = problem.recompute_chi2()?;

        let b_norm = problem.b.norm();
        let predicted = match kind {
            StepKind::GaussNewton => self.current_chi,
            StepKind::Cauchy => {
                self.radius * (2.0 * self.alpha * b_norm - self.radius) / (2.0 * self.alpha)
            }
            StepKind::Blend => {
                0.5 * self.alpha * (1.0 - self.beta) * (1.0 - self.beta)
                    * problem.b.norm_squared()
                    + self.beta * (2.0 - self.beta) * self.current_chi
            }
        };
        let rho = (self.current_chi - temp_chi) / predicted;

        if rho > 0.75 && temp_chi.is_finite() {
            self.radius = self.radius.max(3.0 * problem.delta_x.norm());
        } else if rho < 0.25 {
            self.radius = (0.5 * self.radius).max(MIN_RADIUS);
        }

        if rho > 0.0 && temp_chi.is_finite() {
            self.current_chi = temp_chi;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Default for DogLeg {
    fn default() -> Self {
        Self::new()
    }
}
