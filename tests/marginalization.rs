//! Marginalization round-trip: folding the oldest keyframe into a prior must
//! preserve the optimum of the remaining keyframes.

mod common;

use std::collections::HashMap;

use cairn_solver::{SolverKind, Vertex};
use common::{build_slam_scene, quiet_options, LANDMARK_ID_BASE};
use nalgebra::DVector;

#[test]
fn marginalizing_oldest_keyframe_preserves_the_optimum() {
    let n_poses = 3u64;
    let n_landmarks = 4u64;

    // Solve the full problem to convergence.
    let mut problem = build_slam_scene(n_poses, n_landmarks, quiet_options(), &HashMap::new(), &[]);
    problem.solve(SolverKind::LevenbergMarquardt, 30).unwrap();

    let mut converged: HashMap<u64, DVector<f64>> = HashMap::new();
    for i in 0..n_poses {
        converged.insert(i, problem.vertex(i).unwrap().parameters().clone());
    }
    for j in 0..n_landmarks {
        let id = LANDMARK_ID_BASE + j;
        converged.insert(id, problem.vertex(id).unwrap().parameters().clone());
    }

    // Path A: marginalize keyframe 0 (which anchors every landmark through
    // its observations) and re-solve the remaining two keyframes against the
    // resulting prior.
    problem.set_ordering();
    let pose_dim = problem.ordering_poses();
    problem.marginalize(&[0], pose_dim).unwrap();

    assert!(problem.vertex(0).is_none());
    for j in 0..n_landmarks {
        assert!(
            problem.vertex(LANDMARK_ID_BASE + j).is_none(),
            "landmark {j} should have been marginalized with the keyframe"
        );
    }
    assert_eq!(problem.prior_hessian().nrows(), 6);
    assert!(problem.prior_error().iter().all(|value| value.is_finite()));

    problem.solve(SolverKind::LevenbergMarquardt, 30).unwrap();

    // Path B: re-solve the original problem with keyframe 0 fixed at its
    // converged value.
    let mut conditioned = build_slam_scene(n_poses, n_landmarks, quiet_options(), &converged, &[0]);
    conditioned
        .solve(SolverKind::LevenbergMarquardt, 30)
        .unwrap();

    for i in 1..n_poses {
        let marginalized = problem.vertex(i).unwrap().parameters().clone();
        let fixed = conditioned.vertex(i).unwrap().parameters().clone();
        assert!(
            (&marginalized - &fixed).amax() < 1e-6,
            "keyframe {i} drifted after marginalization: {}",
            (&marginalized - &fixed).amax()
        );
    }
}

#[test]
fn prior_keeps_remaining_problem_solvable_with_new_measurements() {
    let n_poses = 3u64;
    let n_landmarks = 3u64;
    let mut problem = build_slam_scene(n_poses, n_landmarks, quiet_options(), &HashMap::new(), &[]);
    problem.solve(SolverKind::LevenbergMarquardt, 30).unwrap();

    problem.set_ordering();
    let pose_dim = problem.ordering_poses();
    problem.marginalize(&[0], pose_dim).unwrap();

    // Without the prior the remaining chain (one relative edge) would be
    // gauge-free; the prior must keep the system positive definite.
    let report = problem.solve(SolverKind::LevenbergMarquardt, 10).unwrap();
    assert!(report.final_chi.is_finite());
    for i in 1..n_poses {
        assert!(problem
            .vertex(i)
            .unwrap()
            .parameters()
            .iter()
            .all(|value| value.is_finite()));
    }
}
