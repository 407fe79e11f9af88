//! Integration tests for EI and grad-EI evaluation on the CPU backend.

mod common;

use std::sync::Arc;

use common::*;
use optlearn::prelude::*;

#[test]
fn test_closed_form_single_point() {
    let gp = IndependentGp {
        dim: 1,
        variance: 1.0,
    };
    let config = EiConfig::builder()
        .with_num_mc(1 << 18)
        .with_best_so_far(0.0)
        .build()
        .unwrap();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &config).unwrap();
    let mut state =
        ExpectedImprovementState::new(&evaluator, &[0.25], &[], 1, 0, false, PhiloxRng::new(17, 0))
            .unwrap();

    let ei = evaluator.compute_expected_improvement(&mut state).unwrap();
    let expected = 1.0 / (2.0 * std::f64::consts::PI).sqrt();
    assert!(
        (ei - expected).abs() < 0.01,
        "EI {ei} too far from closed form {expected}"
    );
}

#[test]
fn test_fixed_draws_match_host_reference() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(500, -0.1))
        .unwrap();
    let mut draw_rng = PhiloxRng::new(3, 0);
    let draws = RandomDraws::generate(&evaluator, 3, &mut draw_rng);
    let ei_draws = draws.ei.clone();

    let mut state = ExpectedImprovementState::with_random_draws(
        &evaluator,
        &CANDIDATES,
        &BEING_SAMPLED,
        2,
        1,
        false,
        PhiloxRng::new(1, 0),
        draws,
    )
    .unwrap();

    let ei = evaluator.compute_expected_improvement(&mut state).unwrap();
    let expected = reference_ei(state.mean(), state.cholesky(), &ei_draws, -0.1);
    assert!((ei - expected).abs() < 1e-12, "{ei} vs {expected}");

    // Fixed draws do not change between calls.
    let again = evaluator.compute_expected_improvement(&mut state).unwrap();
    assert_eq!(ei, again);
}

#[test]
fn test_identically_seeded_states_agree() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(1000, 0.0))
        .unwrap();
    let build = || {
        ExpectedImprovementState::new(
            &evaluator,
            &CANDIDATES,
            &BEING_SAMPLED,
            2,
            1,
            true,
            PhiloxRng::new(99, 0),
        )
        .unwrap()
    };
    let mut a = build();
    let mut b = build();

    let ei_a = evaluator.compute_expected_improvement(&mut a).unwrap();
    let ei_b = evaluator.compute_expected_improvement(&mut b).unwrap();
    assert_eq!(ei_a, ei_b);

    let mut grad_a = [0.0; 4];
    let mut grad_b = [0.0; 4];
    evaluator.compute_grad_expected_improvement(&mut a, &mut grad_a).unwrap();
    evaluator.compute_grad_expected_improvement(&mut b, &mut grad_b).unwrap();
    assert_eq!(grad_a, grad_b);
}

#[test]
fn test_distinct_seed_stream_pairs_give_distinct_estimates() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(512, 0.0))
        .unwrap();
    let ei_for = |seed, stream| {
        let mut state = ExpectedImprovementState::new(
            &evaluator,
            &CANDIDATES,
            &BEING_SAMPLED,
            2,
            1,
            false,
            PhiloxRng::new(seed, stream),
        )
        .unwrap();
        evaluator.compute_expected_improvement(&mut state).unwrap()
    };

    assert_ne!(ei_for(1, 1), ei_for(2, 2));
    assert_ne!(ei_for(5, 0), ei_for(4, 1));
}

#[test]
fn test_state_bound_to_allocating_backend() {
    let gp = fitted_gp();
    let config = small_config(256, 0.0);
    let home = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &config).unwrap();
    let foreign = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &config).unwrap();
    let build = || {
        ExpectedImprovementState::new(
            &home,
            &CANDIDATES,
            &BEING_SAMPLED,
            2,
            1,
            true,
            PhiloxRng::new(13, 0),
        )
        .unwrap()
    };
    let mut state = build();
    let mut reference = build();

    assert!(matches!(
        foreign.compute_expected_improvement(&mut state),
        Err(EiError::InvalidState(_))
    ));
    let mut grad = [0.0; 4];
    assert!(matches!(
        foreign.compute_grad_expected_improvement(&mut state, &mut grad),
        Err(EiError::InvalidState(_))
    ));

    // Rejected dispatches do not consume kernel seeds.
    assert_eq!(
        home.compute_expected_improvement(&mut state).unwrap(),
        home.compute_expected_improvement(&mut reference).unwrap()
    );

    // Resynchronizing moves the buffers to the other backend.
    state.setup_state(&foreign, &CANDIDATES).unwrap();
    assert!(foreign.compute_expected_improvement(&mut state).is_ok());
    assert!(matches!(
        home.compute_expected_improvement(&mut state),
        Err(EiError::InvalidState(_))
    ));
}

#[test]
fn test_successive_calls_continue_sequence() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(256, 0.0))
        .unwrap();
    let mut state = ExpectedImprovementState::new(
        &evaluator,
        &CANDIDATES,
        &BEING_SAMPLED,
        2,
        1,
        false,
        PhiloxRng::new(5, 0),
    )
    .unwrap();

    let first = evaluator.compute_expected_improvement(&mut state).unwrap();
    let second = evaluator.compute_expected_improvement(&mut state).unwrap();
    assert_ne!(first, second, "second call must not reuse the first call's draws");
}

#[test]
fn test_ei_monotone_in_best_so_far() {
    let gp = fitted_gp();
    let mut previous = 0.0;
    for best in [-1.0, -0.5, -0.2, 0.0, 0.3, 1.0] {
        let evaluator =
            ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(512, best)).unwrap();
        let draws = RandomDraws::generate(&evaluator, 3, &mut PhiloxRng::new(8, 0));
        let mut state = ExpectedImprovementState::with_random_draws(
            &evaluator,
            &CANDIDATES,
            &BEING_SAMPLED,
            2,
            1,
            false,
            PhiloxRng::new(8, 1),
            draws,
        )
        .unwrap();

        let ei = evaluator.compute_expected_improvement(&mut state).unwrap();
        assert!(ei >= previous, "EI decreased from {previous} to {ei} at best={best}");
        previous = ei;
    }
    assert!(previous > 0.0);
}

#[test]
fn test_gradient_matches_finite_difference() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(2048, 0.0))
        .unwrap();
    let mut draw_rng = PhiloxRng::new(21, 0);
    let generated = RandomDraws::generate(&evaluator, 3, &mut draw_rng);
    let draws = RandomDraws::shared(generated.ei);

    let mut state = ExpectedImprovementState::with_random_draws(
        &evaluator,
        &CANDIDATES,
        &BEING_SAMPLED,
        2,
        1,
        true,
        PhiloxRng::new(2, 0),
        draws,
    )
    .unwrap();

    let mut grad = [0.0; 4];
    evaluator.compute_grad_expected_improvement(&mut state, &mut grad).unwrap();

    let h = 1e-6;
    for k in 0..CANDIDATES.len() {
        let mut plus = CANDIDATES;
        let mut minus = CANDIDATES;
        plus[k] += h;
        minus[k] -= h;

        state.update_current_point(&evaluator, &plus).unwrap();
        let ei_plus = evaluator.compute_expected_improvement(&mut state).unwrap();
        state.update_current_point(&evaluator, &minus).unwrap();
        let ei_minus = evaluator.compute_expected_improvement(&mut state).unwrap();

        let fd = (ei_plus - ei_minus) / (2.0 * h);
        assert!(
            (fd - grad[k]).abs() < 1e-4 + 1e-3 * grad[k].abs(),
            "coordinate {k}: finite difference {fd}, gradient {}",
            grad[k]
        );
    }
    assert!(grad.iter().any(|g| g.abs() > 1e-6), "gradient unexpectedly zero");
}

#[test]
fn test_gradient_requires_gradient_state() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(64, 0.0))
        .unwrap();
    let mut state = ExpectedImprovementState::new(
        &evaluator,
        &CANDIDATES,
        &[],
        2,
        0,
        false,
        PhiloxRng::new(1, 0),
    )
    .unwrap();

    let mut grad = [0.0; 4];
    let err = evaluator
        .compute_grad_expected_improvement(&mut state, &mut grad)
        .unwrap_err();
    assert!(matches!(err, EiError::InvalidState(_)));
}

#[test]
fn test_gradient_output_length_checked() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(64, 0.0))
        .unwrap();
    let mut state = ExpectedImprovementState::new(
        &evaluator,
        &CANDIDATES,
        &[],
        2,
        0,
        true,
        PhiloxRng::new(1, 0),
    )
    .unwrap();
    let mut grad = [0.0; 3];
    assert!(matches!(
        evaluator.compute_grad_expected_improvement(&mut state, &mut grad),
        Err(EiError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_zero_draws_rejected() {
    let gp = fitted_gp();
    let config = EiConfig {
        num_mc: 0,
        ..EiConfig::default()
    };
    let err = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &config)
        .err()
        .expect("num_mc = 0 must be rejected");
    assert!(matches!(err, EiError::InvalidConfiguration(_)));
}

#[test]
fn test_degenerate_batches() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(128, 0.5))
        .unwrap();

    // Only running experiments: EI is defined, the gradient is empty.
    let mut state = ExpectedImprovementState::new(
        &evaluator,
        &[],
        &BEING_SAMPLED,
        0,
        1,
        true,
        PhiloxRng::new(4, 0),
    )
    .unwrap();
    assert_eq!(state.get_problem_size(), 0);
    assert!(evaluator.compute_expected_improvement(&mut state).unwrap() > 0.0);
    evaluator.compute_grad_expected_improvement(&mut state, &mut []).unwrap();

    // Empty union.
    let mut empty =
        ExpectedImprovementState::new(&evaluator, &[], &[], 0, 0, false, PhiloxRng::new(4, 1))
            .unwrap();
    assert_eq!(evaluator.compute_expected_improvement(&mut empty).unwrap(), 0.0);
}

#[test]
fn test_activation_failure() {
    let gp = fitted_gp();
    let config = EiConfig::builder().with_device(3).build().unwrap();
    let err = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &config)
        .err()
        .expect("device 3 does not exist");
    assert!(matches!(err, EiError::GpuActivation { device_id: 3, .. }));
}

#[test]
fn test_evaluators_on_one_backend_share_device() {
    let gp = fitted_gp();
    let backend = Arc::new(CpuBackend::with_device_count(2));
    let first = ExpectedImprovementEvaluator::new(&gp, Arc::clone(&backend), &small_config(64, 0.0));
    assert!(first.is_ok());

    let config = EiConfig::builder().with_device(1).build().unwrap();
    let second = ExpectedImprovementEvaluator::new(&gp, Arc::clone(&backend), &config);
    assert!(matches!(second.err(), Some(EiError::GpuActivation { .. })));

    let other_backend = Arc::new(CpuBackend::with_device_count(2));
    assert!(ExpectedImprovementEvaluator::new(&gp, other_backend, &config).is_ok());
}

#[test]
fn test_allocation_failure_is_resource_error() {
    let gp = fitted_gp();
    let backend = Arc::new(CpuBackend::new().with_memory_limit(8));
    let evaluator =
        ExpectedImprovementEvaluator::new(&gp, backend, &small_config(64, 0.0)).unwrap();
    let err = ExpectedImprovementState::new(
        &evaluator,
        &CANDIDATES,
        &BEING_SAMPLED,
        2,
        1,
        true,
        PhiloxRng::new(1, 0),
    )
    .err()
    .expect("buffers exceed the memory limit");
    assert!(matches!(err, EiError::GpuResource { .. }));
    assert_eq!(evaluator.backend().memory_tracker().allocation_count(), 0);
}

#[test]
fn test_concurrent_states_on_threads() {
    let gp = fitted_gp();
    let evaluator = ExpectedImprovementEvaluator::new(&gp, cpu_backend(), &small_config(512, 0.0))
        .unwrap();

    let sequential: Vec<f64> = (0..4u64)
        .map(|seed| {
            let mut state = ExpectedImprovementState::new(
                &evaluator,
                &CANDIDATES,
                &BEING_SAMPLED,
                2,
                1,
                false,
                PhiloxRng::new(seed, 0),
            )
            .unwrap();
            evaluator.compute_expected_improvement(&mut state).unwrap()
        })
        .collect();

    let concurrent: Vec<f64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4u64)
            .map(|seed| {
                let evaluator = &evaluator;
                scope.spawn(move || {
                    let mut state = ExpectedImprovementState::new(
                        evaluator,
                        &CANDIDATES,
                        &BEING_SAMPLED,
                        2,
                        1,
                        false,
                        PhiloxRng::new(seed, 0),
                    )
                    .unwrap();
                    evaluator.compute_expected_improvement(&mut state).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(sequential, concurrent);
}
