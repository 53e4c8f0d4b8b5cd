//! Shared scene builders for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use cairn_solver::{
    LinearEdge, Problem, ProblemKind, SolverOptions, VectorVertex, Vertex, VertexKind,
};
use nalgebra::{dvector, DVector};

/// Landmark vertex ids start here; pose ids count from zero.
pub const LANDMARK_ID_BASE: u64 = 100;

pub fn quiet_options() -> SolverOptions {
    SolverOptions::new().with_cost_log_path(None)
}

pub fn pose_truth(i: u64) -> DVector<f64> {
    dvector![i as f64, 0.1 * i as f64, -0.05 * i as f64]
}

pub fn landmark_truth(j: u64) -> DVector<f64> {
    dvector![0.5 * j as f64, 1.0 + 0.3 * j as f64, 2.0 - 0.2 * j as f64]
}

/// Deterministic sub-0.1 perturbation so initial estimates differ from the
/// generating values without pulling in a random number generator.
pub fn perturbation(seed: u64) -> DVector<f64> {
    let s = seed as f64;
    dvector![
        0.07 * (12.9898 * s).sin(),
        0.05 * (78.233 * s).sin(),
        0.06 * (37.719 * s).sin()
    ]
}

/// Build a fully observed SLAM scene: `n_poses` 3-dim poses chained by
/// relative constraints, `n_landmarks` 3-dim landmarks observed from every
/// pose, and a prior anchoring pose 0. Measurements are exact; initial
/// estimates are perturbed unless overridden.
pub fn build_slam_scene(
    n_poses: u64,
    n_landmarks: u64,
    options: SolverOptions,
    overrides: &HashMap<u64, DVector<f64>>,
    fixed: &[u64],
) -> Problem {
    let mut problem = Problem::with_options(ProblemKind::Slam, options);

    for i in 0..n_poses {
        let initial = overrides
            .get(&i)
            .cloned()
            .unwrap_or_else(|| pose_truth(i) + perturbation(i + 1));
        let vertex = if fixed.contains(&i) {
            VectorVertex::new_fixed(i, VertexKind::Pose, initial)
        } else {
            VectorVertex::new(i, VertexKind::Pose, initial)
        };
        problem.add_vertex(Box::new(vertex)).unwrap();
    }
    for j in 0..n_landmarks {
        let id = LANDMARK_ID_BASE + j;
        let initial = overrides
            .get(&id)
            .cloned()
            .unwrap_or_else(|| landmark_truth(j) + perturbation(id + 1));
        problem
            .add_vertex(Box::new(VectorVertex::new(id, VertexKind::PointXyz, initial)))
            .unwrap();
    }

    let mut edge_id = 0;
    problem
        .add_edge(Box::new(LinearEdge::prior(edge_id, 0, pose_truth(0))))
        .unwrap();
    edge_id += 1;

    for i in 0..n_poses - 1 {
        let measurement = pose_truth(i + 1) - pose_truth(i);
        problem
            .add_edge(Box::new(LinearEdge::between(edge_id, i, i + 1, measurement)))
            .unwrap();
        edge_id += 1;
    }

    for i in 0..n_poses {
        for j in 0..n_landmarks {
            let id = LANDMARK_ID_BASE + j;
            let measurement = landmark_truth(j) - pose_truth(i);
            problem
                .add_edge(Box::new(LinearEdge::between(edge_id, i, id, measurement)))
                .unwrap();
            edge_id += 1;
        }
    }
    problem
}

/// `(offset, dim)` landmark blocks local to the schur partition, read back
/// from the assigned ordering.
pub fn landmark_blocks(problem: &Problem, n_landmarks: u64) -> Vec<(usize, usize)> {
    let reserve = problem.ordering_poses();
    (0..n_landmarks)
        .map(|j| {
            let vertex = problem.vertex(LANDMARK_ID_BASE + j).unwrap();
            (vertex.ordering_id().unwrap() - reserve, vertex.local_dimension())
        })
        .collect()
}
