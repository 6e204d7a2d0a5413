//! Integration tests for reduced programs
//!
//! A reduced program drops constant and unused parameter blocks together with residual
//! blocks that only read constant blocks. The cost of the dropped residuals must reappear
//! as the fixed cost, and the surviving program must be indexed for a solver.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use apex_nlls::core::evaluator::{Evaluator, EvaluatorOptions};
use apex_nlls::{
    CoreError, EvaluateOptions, EvaluationRequest, Loss, Problem, ProblemOptions,
    QuaternionManifold,
};

mod problem_test_utils;
use problem_test_utils::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// a - b - c chain with priors on both ends and an unused block
fn chain() -> Problem {
    chain_with(ProblemOptions::default())
}

fn chain_with(options: ProblemOptions) -> Problem {
    let mut problem = Problem::new(options);
    problem.add_parameter_block("a", &[1.0]);
    problem.add_parameter_block("b", &[3.0]);
    problem.add_parameter_block("c", &[2.0]);
    problem.add_parameter_block("unused", &[7.0]);
    problem.add_residual_block(Arc::new(Prior::new(&[0.0])), Some(Loss::cauchy(1.0).unwrap()), &["a"]);
    problem.add_residual_block(Arc::new(Difference), None, &["a", "b"]);
    problem.add_residual_block(Arc::new(Difference), None, &["b", "c"]);
    problem.add_residual_block(Arc::new(Prior::new(&[5.0])), None, &["c"]);
    problem
}

#[test]
fn test_fixed_cost_plus_reduced_cost_equals_full_cost() -> TestResult {
    let mut problem = chain();
    problem.set_parameter_block_constant("a");

    let full = problem.evaluate(&EvaluateOptions::default(), EvaluationRequest::cost_only())?;
    let reduced = problem.reduced_program()?;

    assert_eq!(reduced.removed_parameter_blocks, vec!["a", "unused"]);
    assert_eq!(reduced.program.num_parameter_blocks(), 2);
    assert_eq!(reduced.program.num_residual_blocks(), 3);
    // Cauchy(1) prior on a = 1: ½ ln(2)
    assert!((reduced.fixed_cost - 0.5 * 2.0_f64.ln()).abs() < 1e-12);

    let mut program = reduced.program;
    assert!(program.is_valid());
    let evaluator = Evaluator::new(&program, EvaluatorOptions::default())?;
    let state = program.state_vector();
    let evaluation = evaluator.evaluate(&mut program, &state, true, EvaluationRequest::all())?;

    assert!((evaluation.cost + reduced.fixed_cost - full.cost).abs() < 1e-12);
    let jacobian = evaluation.jacobian.as_ref().ok_or("missing Jacobian")?;
    assert_eq!(jacobian.nrows(), 3);
    assert_eq!(jacobian.ncols(), 2);
    Ok(())
}

#[test]
fn test_fully_varying_problem_reduces_to_itself() -> TestResult {
    let mut problem = chain();
    problem.remove_parameter_block("unused");
    let keys = problem.parameter_block_keys();

    let reduced = problem.reduced_program()?;
    assert!(reduced.removed_parameter_blocks.is_empty());
    assert_eq!(reduced.fixed_cost, 0.0);
    assert_eq!(reduced.program.num_residual_blocks(), 4);
    assert!(reduced.program.is_valid());

    let reduced_keys: Vec<&str> = reduced
        .program
        .parameter_block_iter()
        .map(|block| block.key())
        .collect();
    assert_eq!(reduced_keys, keys);
    Ok(())
}

#[test]
fn test_everything_constant_gives_an_empty_program() -> TestResult {
    let mut problem = chain();
    for key in ["a", "b", "c", "unused"] {
        problem.set_parameter_block_constant(key);
    }

    let full = problem.evaluate(&EvaluateOptions::default(), EvaluationRequest::cost_only())?;
    let reduced = problem.reduced_program()?;
    assert_eq!(reduced.program.num_parameter_blocks(), 0);
    assert_eq!(reduced.program.num_residual_blocks(), 0);
    assert!((reduced.fixed_cost - full.cost).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_failing_constant_residual_aborts_reduction() {
    struct Broken;
    impl apex_nlls::CostFunction for Broken {
        fn parameter_block_sizes(&self) -> &[usize] {
            &[1]
        }
        fn num_residuals(&self) -> usize {
            1
        }
        fn evaluate(
            &self,
            _parameters: &[&[f64]],
            residuals: &mut [f64],
            _jacobians: Option<&mut [Option<&mut [f64]>]>,
        ) -> bool {
            residuals[0] = f64::NAN;
            true
        }
    }

    let mut problem = chain();
    problem.add_residual_block(Arc::new(Broken), None, &["a"]);
    problem.set_parameter_block_constant("a");
    assert!(matches!(
        problem.reduced_program(),
        Err(CoreError::Evaluation(_))
    ));
}

#[test]
fn test_solver_step_round_trips_through_the_problem() -> TestResult {
    let mut problem = chain();
    problem.add_parameter_block_with_manifold(
        "q",
        &[1.0, 0.0, 0.0, 0.0],
        Arc::new(QuaternionManifold::new()),
    )?;
    problem.add_residual_block(Arc::new(Prior::new(&[1.0, 0.0, 0.0, 0.0])), None, &["q"]);
    problem.set_parameter_lower_bound("b", 0, 2.5);

    let reduced = problem.reduced_program()?;
    let mut program = reduced.program;
    assert_eq!(program.num_parameters(), 7);
    assert_eq!(program.num_effective_parameters(), 6);

    // a, b, c then q in program order; push b below its bound and rotate q about z
    let state = program.state_vector();
    let delta = [0.5, -2.0, 1.0, 0.0, 0.0, std::f64::consts::FRAC_PI_4];
    let mut next = vec![0.0; state.len()];
    program.plus(&state, &delta, &mut next, None, 2)?;
    assert_eq!(&next[..3], &[1.5, 2.5, 3.0]);
    let half = std::f64::consts::FRAC_1_SQRT_2;
    assert!((next[3] - half).abs() < 1e-12);
    assert!((next[6] - half).abs() < 1e-12);

    program.state_vector_to_parameter_blocks(&next)?;
    program.is_feasible()?;
    problem.update_from_program(&program)?;

    assert_eq!(problem.parameter_block_values("b"), &[2.5]);
    assert_eq!(problem.parameter_block_values("unused"), &[7.0]);
    let q = problem.parameter_block_values("q");
    assert!((q.iter().map(|v| v * v).sum::<f64>() - 1.0).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_fast_removal_option_does_not_change_the_reduction() -> TestResult {
    let mut fast = chain_with(ProblemOptions::new().with_fast_removal(true));
    let mut slow = chain();
    fast.remove_parameter_block("b");
    slow.remove_parameter_block("b");

    let fast_reduced = fast.reduced_program()?;
    let slow_reduced = slow.reduced_program()?;
    assert_eq!(fast_reduced.removed_parameter_blocks, slow_reduced.removed_parameter_blocks);
    assert_eq!(
        fast_reduced.program.state_vector(),
        slow_reduced.program.state_vector()
    );
    Ok(())
}
