//! Optimization variables (vertices) of the factor graph.
//!
//! A vertex owns its parameter vector and exposes the retraction used by the
//! solvers to apply tangent-space increments. Concrete manifold types (SE3
//! poses, inverse-depth landmarks, ...) live outside the core; the solver only
//! consumes the capability interface plus the classification tag below.

use nalgebra::{DVector, DVectorView};
use std::fmt;

/// Unique identifier for vertices in the problem
pub type VertexId = u64;

/// Classification tag for vertices.
///
/// The tag set is closed and part of the solver contract: the ordering and the
/// marginalizer partition the state into a pose-class block and a
/// landmark-class block based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexKind {
    /// Camera/body pose (SE3-like state)
    Pose,
    /// Inertial speed and IMU bias state
    SpeedBias,
    /// Landmark parameterized by a 3D point
    PointXyz,
    /// Landmark parameterized by inverse depth
    InverseDepth,
}

impl VertexKind {
    /// Pose-class vertices occupy the reserved (leading) ordering block.
    pub fn is_pose(self) -> bool {
        matches!(self, VertexKind::Pose | VertexKind::SpeedBias)
    }

    /// Landmark-class vertices occupy the trailing ordering block and are
    /// eliminated by the Schur complement.
    pub fn is_landmark(self) -> bool {
        matches!(self, VertexKind::PointXyz | VertexKind::InverseDepth)
    }

    /// Stable type-info string for the tag.
    pub fn type_info(self) -> &'static str {
        match self {
            VertexKind::Pose => "VertexPose",
            VertexKind::SpeedBias => "VertexSpeedBias",
            VertexKind::PointXyz => "VertexPointXYZ",
            VertexKind::InverseDepth => "VertexInverseDepth",
        }
    }
}

impl fmt::Display for VertexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_info())
    }
}

/// Capability interface consumed by the solver core.
///
/// Implementations own a parameter vector of ambient dimension `D_a` and a
/// tangent space of dimension `D_l <= D_a`; `plus` is the retraction applying
/// a tangent increment to the stored parameters. `back_up_parameters` /
/// `roll_back_parameters` provide the single-level save/restore the
/// trust-region drivers rely on for rejected steps.
pub trait Vertex: fmt::Debug + Send + Sync {
    /// Stable identifier, unique within a problem
    fn id(&self) -> VertexId;

    /// Classification tag
    fn kind(&self) -> VertexKind;

    /// Stored parameter vector (ambient representation)
    fn parameters(&self) -> &DVector<f64>;

    /// Ambient dimension `D_a`
    fn dimension(&self) -> usize {
        self.parameters().len()
    }

    /// Tangent-space dimension `D_l` (defaults to the ambient dimension)
    fn local_dimension(&self) -> usize {
        self.parameters().len()
    }

    /// Whether the vertex is held exactly at its current estimate
    fn is_fixed(&self) -> bool;

    /// Fix or free the vertex
    fn set_fixed(&mut self, fixed: bool);

    /// Ordering index assigned by the problem, `None` when unassigned
    fn ordering_id(&self) -> Option<usize>;

    /// Assign or clear the ordering index
    fn set_ordering_id(&mut self, ordering_id: Option<usize>);

    /// Retraction: apply a tangent increment of length `local_dimension`
    fn plus(&mut self, delta: DVectorView<'_, f64>);

    /// Save the current parameters for a later rollback
    fn back_up_parameters(&mut self);

    /// Restore the parameters saved by the last backup
    fn roll_back_parameters(&mut self);
}

/// Problem-scoped allocator for vertex and edge identifiers.
///
/// Identifiers are handed out monotonically; keeping the counter next to the
/// problem (instead of a process-wide global) makes id assignment reproducible
/// per problem instance.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    /// Create a generator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next identifier.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Euclidean vertex: parameters live in `R^n` and the retraction is addition.
///
/// Serves as the baseline implementation for states without manifold
/// structure (landmarks, biases) and as the building block of the test suite.
#[derive(Debug, Clone)]
pub struct VectorVertex {
    id: VertexId,
    kind: VertexKind,
    parameters: DVector<f64>,
    backup: DVector<f64>,
    fixed: bool,
    ordering_id: Option<usize>,
}

impl VectorVertex {
    /// Create a vertex from an initial parameter vector.
    pub fn new(id: VertexId, kind: VertexKind, parameters: DVector<f64>) -> Self {
        let backup = parameters.clone();
        Self {
            id,
            kind,
            parameters,
            backup,
            fixed: false,
            ordering_id: None,
        }
    }

    /// Create a fixed vertex.
    pub fn new_fixed(id: VertexId, kind: VertexKind, parameters: DVector<f64>) -> Self {
        let mut vertex = Self::new(id, kind, parameters);
        vertex.fixed = true;
        vertex
    }

    /// Replace the stored parameters.
    pub fn set_parameters(&mut self, parameters: DVector<f64>) {
        self.parameters = parameters;
    }
}

impl Vertex for VectorVertex {
    fn id(&self) -> VertexId {
        self.id
    }

    fn kind(&self) -> VertexKind {
        self.kind
    }

    fn parameters(&self) -> &DVector<f64> {
        &self.parameters
    }

    fn is_fixed(&self) -> bool {
        self.fixed
    }

    fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    fn ordering_id(&self) -> Option<usize> {
        self.ordering_id
    }

    fn set_ordering_id(&mut self, ordering_id: Option<usize>) {
        self.ordering_id = ordering_id;
    }

    fn plus(&mut self, delta: DVectorView<'_, f64>) {
        self.parameters += delta;
    }

    fn back_up_parameters(&mut self) {
        self.backup.copy_from(&self.parameters);
    }

    fn roll_back_parameters(&mut self) {
        self.parameters.copy_from(&self.backup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_kind_classification() {
        assert!(VertexKind::Pose.is_pose());
        assert!(VertexKind::SpeedBias.is_pose());
        assert!(VertexKind::PointXyz.is_landmark());
        assert!(VertexKind::InverseDepth.is_landmark());
        assert!(!VertexKind::Pose.is_landmark());
        assert_eq!(VertexKind::SpeedBias.type_info(), "VertexSpeedBias");
    }

    #[test]
    fn test_id_generator_is_monotonic() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_vector_vertex_plus() {
        let mut vertex = VectorVertex::new(0, VertexKind::PointXyz, dvector![1.0, 2.0, 3.0]);
        let delta = dvector![0.5, -1.0, 0.0];
        vertex.plus(delta.rows(0, 3));
        assert_eq!(vertex.parameters(), &dvector![1.5, 1.0, 3.0]);
        assert_eq!(vertex.local_dimension(), 3);
    }

    #[test]
    fn test_backup_and_rollback_are_exact() {
        let mut vertex = VectorVertex::new(3, VertexKind::Pose, dvector![0.1, 0.2]);
        vertex.back_up_parameters();
        let delta = dvector![1e-17, 3.7];
        vertex.plus(delta.rows(0, 2));
        vertex.roll_back_parameters();
        assert_eq!(vertex.parameters()[0].to_bits(), (0.1f64).to_bits());
        assert_eq!(vertex.parameters()[1].to_bits(), (0.2f64).to_bits());
    }

    #[test]
    fn test_ordering_id_round_trip() {
        let mut vertex = VectorVertex::new(5, VertexKind::InverseDepth, dvector![2.0]);
        assert_eq!(vertex.ordering_id(), None);
        vertex.set_ordering_id(Some(12));
        assert_eq!(vertex.ordering_id(), Some(12));
        vertex.set_ordering_id(None);
        assert_eq!(vertex.ordering_id(), None);
    }
}
