//! Trust-region solvers for the graph optimization back-end.
//!
//! Two outer loops are provided:
//! - Levenberg-Marquardt with the Nielsen damping update
//! - Powell's Dog Leg with an adaptive trust radius
//!
//! Both drive the same problem machinery: ordering, Hessian assembly, the
//! structured linear solve and the state updater.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CairnError;

pub mod dog_leg;
pub mod levenberg_marquardt;

pub use dog_leg::DogLeg;
pub use levenberg_marquardt::LevenbergMarquardt;

/// Type of optimization solver algorithm to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    /// Levenberg-Marquardt algorithm (adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Dog Leg algorithm (trust region method)
    DogLeg,
}

impl TryFrom<u32> for SolverKind {
    type Error = CairnError;

    fn try_from(kind: u32) -> Result<Self, Self::Error> {
        match kind {
            0 => Ok(SolverKind::LevenbergMarquardt),
            1 => Ok(SolverKind::DogLeg),
            other => Err(CairnError::InvalidSolverKind(other)),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverKind::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            SolverKind::DogLeg => write!(f, "Dog Leg"),
        }
    }
}

/// Backend used to accumulate the Hessian and gradient from the edges
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HessianBackend {
    /// Single sequential traversal in edge-id order
    Serial,
    /// Fixed pool of worker threads striping the edge list, scattering into a
    /// shared matrix under a lock
    Partitioned,
    /// Thread-local accumulators summed after the parallel phase
    #[default]
    Reduction,
}

/// Solver configuration shared by both drivers.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Hessian accumulation backend
    pub backend: HessianBackend,
    /// Worker count for the partitioned backend
    pub assembly_threads: usize,
    /// Cost log destination; `None` disables the log
    pub cost_log_path: Option<PathBuf>,
    /// Trailing pose dimensions excluded from the prior error update.
    ///
    /// Dimensions appended to the prior after it was built (for example a
    /// newly inserted keyframe state grown via `extend_hessians_prior_size`)
    /// are not part of the prior error representation; this offset tells the
    /// state updater how many trailing entries of `b_prior` to skip.
    pub prior_error_offset: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            backend: HessianBackend::default(),
            assembly_threads: 4,
            cost_log_path: Some(PathBuf::from("solver_cost.txt")),
            prior_error_offset: 0,
        }
    }
}

impl SolverOptions {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the Hessian accumulation backend.
    pub fn with_backend(mut self, backend: HessianBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the worker count for the partitioned backend.
    pub fn with_assembly_threads(mut self, threads: usize) -> Self {
        self.assembly_threads = threads.max(1);
        self
    }

    /// Set the cost log destination (`None` disables the log).
    pub fn with_cost_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.cost_log_path = path;
        self
    }

    /// Set the prior-error tail offset.
    pub fn with_prior_error_offset(mut self, offset: usize) -> Self {
        self.prior_error_offset = offset;
        self
    }
}

/// Summary of a completed solve.
#[derive(Debug, Clone)]
pub struct SolverReport {
    /// Algorithm that produced the result
    pub kind: SolverKind,
    /// Outer iterations performed
    pub iterations: usize,
    /// Cost before the first step
    pub initial_chi: f64,
    /// Cost after the last accepted step
    pub final_chi: f64,
    /// Accepted trust-region steps
    pub accepted_steps: usize,
    /// Rejected trust-region steps
    pub rejected_steps: usize,
    /// Whether a convergence criterion (rather than the iteration cap) ended
    /// the solve
    pub converged: bool,
    /// Wall time of the whole solve
    pub solve_time: Duration,
    /// Accumulated wall time of Hessian assembly, in milliseconds
    pub hessian_millis: f64,
}

impl fmt::Display for SolverReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} Optimization Summary ===", self.kind)?;
        writeln!(f, "Initial cost:       {:.6e}", self.initial_chi)?;
        writeln!(f, "Final cost:         {:.6e}", self.final_chi)?;
        writeln!(
            f,
            "Cost reduction:     {:.6e} ({:.2}%)",
            self.initial_chi - self.final_chi,
            100.0 * (self.initial_chi - self.final_chi) / self.initial_chi.max(1e-12)
        )?;
        writeln!(f, "Outer iterations:   {}", self.iterations)?;
        writeln!(f, "Accepted steps:     {}", self.accepted_steps)?;
        writeln!(f, "Rejected steps:     {}", self.rejected_steps)?;
        writeln!(f, "Converged:          {}", self.converged)?;
        writeln!(f, "Total time:         {:?}", self.solve_time)?;
        writeln!(f, "Hessian assembly:   {:.3} ms", self.hessian_millis)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solver_kind_from_index() {
        assert_eq!(
            SolverKind::try_from(0).unwrap(),
            SolverKind::LevenbergMarquardt
        );
        assert_eq!(SolverKind::try_from(1).unwrap(), SolverKind::DogLeg);
        assert!(SolverKind::try_from(2).is_err());
    }

    #[test]
    fn test_options_builder() {
        let options = SolverOptions::new()
            .with_backend(HessianBackend::Partitioned)
            .with_assembly_threads(8)
            .with_cost_log_path(None)
            .with_prior_error_offset(15);

        assert_eq!(options.backend, HessianBackend::Partitioned);
        assert_eq!(options.assembly_threads, 8);
        assert!(options.cost_log_path.is_none());
        assert_eq!(options.prior_error_offset, 15);
    }

    #[test]
    fn test_assembly_threads_floor() {
        let options = SolverOptions::new().with_assembly_threads(0);
        assert_eq!(options.assembly_threads, 1);
    }

    #[test]
    fn test_report_display_mentions_kind() {
        let report = SolverReport {
            kind: SolverKind::DogLeg,
            iterations: 3,
            initial_chi: 1.0,
            final_chi: 0.1,
            accepted_steps: 3,
            rejected_steps: 1,
            converged: true,
            solve_time: Duration::from_millis(5),
            hessian_millis: 1.25,
        };
        let text = report.to_string();
        assert!(text.contains("Dog Leg"));
        assert!(text.contains("Accepted steps"));
    }
}
