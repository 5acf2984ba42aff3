use newton_damped::{
    solve, solve_with_monitor, Control, DampedNewton, EvalFailure, JacobianMode, JacobianMut,
    NewtonCfg, Problem, ProblemClass, SolveStatus, SolverError, SystemFn, SystemWithJac,
};
use proptest::prelude::*;

/// `F(x) = A x - b` with `A = [[2, 1], [1, 3]]`, `b = [3, 4]`.
struct LinearSystem;

impl Problem<f64> for LinearSystem {
    fn residual(&mut self, x: &[f64], f: &mut [f64]) -> Result<(), EvalFailure> {
        f[0] = 2.0 * x[0] + x[1] - 3.0;
        f[1] = x[0] + 3.0 * x[1] - 4.0;
        Ok(())
    }

    fn jacobian(&mut self, _x: &[f64], jac: &mut JacobianMut<'_, f64>) -> Result<(), EvalFailure> {
        jac.set(0, 0, 2.0);
        jac.set(0, 1, 1.0);
        jac.set(1, 0, 1.0);
        jac.set(1, 1, 3.0);
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }
}

#[test]
fn linear_system_converges_in_one_iteration() {
    let cfg = NewtonCfg::default()
        .with_class(ProblemClass::Linear)
        .with_jacobian(JacobianMode::Analytic)
        .with_rtol(1e-10);
    let mut x = [0.0, 0.0];
    let stats = solve(&mut LinearSystem, &mut x, &[1.0, 1.0], cfg).unwrap();

    assert_eq!(stats.status, SolveStatus::Converged);
    assert_eq!(stats.iterations, 1);
    assert_eq!(stats.fcn_evals, 2);
    assert_eq!(stats.jac_evals, 1);
    assert!((x[0] - 1.0).abs() < 1e-12);
    assert!((x[1] - 1.0).abs() < 1e-12);
}

/// Chebyquad for n = 2: average of the shifted Chebyshev polynomials minus
/// their integrals over [0, 1].
struct Chebyquad2;

impl Problem<f64> for Chebyquad2 {
    fn residual(&mut self, x: &[f64], f: &mut [f64]) -> Result<(), EvalFailure> {
        let y0 = 2.0 * x[0] - 1.0;
        let y1 = 2.0 * x[1] - 1.0;
        f[0] = 0.5 * (y0 + y1);
        f[1] = 0.5 * ((2.0 * y0 * y0 - 1.0) + (2.0 * y1 * y1 - 1.0)) + 1.0 / 3.0;
        Ok(())
    }

    fn jacobian(&mut self, x: &[f64], jac: &mut JacobianMut<'_, f64>) -> Result<(), EvalFailure> {
        for j in 0..2 {
            let y = 2.0 * x[j] - 1.0;
            jac.set(0, j, 1.0);
            jac.set(1, j, 4.0 * y);
        }
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }
}

#[test]
fn chebyquad_two_converges_quickly() {
    let cfg = NewtonCfg::default()
        .with_class(ProblemClass::HighlyNonlinear)
        .with_jacobian(JacobianMode::Analytic)
        .with_rtol(1e-5);
    let mut x = [1.0 / 3.0, 2.0 / 3.0];
    let stats = solve(&mut Chebyquad2, &mut x, &[1.0, 1.0], cfg).unwrap();

    assert_eq!(stats.status, SolveStatus::Converged);
    assert!(stats.iterations <= 10, "took {} iterations", stats.iterations);

    let mut f = [0.0; 2];
    Chebyquad2.residual(&x, &mut f).unwrap();
    let rms = ((f[0] * f[0] + f[1] * f[1]) / 2.0).sqrt();
    assert!(rms < 1e-5, "residual RMS {rms}");
    // Roots are (1 -+ 1/sqrt(3)) / 2.
    let lo = 0.5 - 0.5 / 3f64.sqrt();
    let hi = 0.5 + 0.5 / 3f64.sqrt();
    assert!((x[0] - lo).abs() < 1e-6);
    assert!((x[1] - hi).abs() < 1e-6);
}

#[test]
fn chebyquad_with_adaptive_differences_matches_analytic() {
    let cfg = NewtonCfg::default()
        .with_class(ProblemClass::HighlyNonlinear)
        .with_jacobian(JacobianMode::AdaptiveDiff)
        .with_rtol(1e-8);
    let mut x = [1.0 / 3.0, 2.0 / 3.0];
    let stats = solve(&mut Chebyquad2, &mut x, &[1.0, 1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert!((x[0] - (0.5 - 0.5 / 3f64.sqrt())).abs() < 1e-7);
    assert!(stats.fcn_evals_jac >= 2 * stats.jac_evals);
}

#[test]
fn zero_jacobian_reports_singular() {
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] * x[0] - x[1] * x[1];
        f[1] = 2.0 * x[0] * x[1];
        Ok(())
    });
    let cfg = NewtonCfg::default().with_class(ProblemClass::HighlyNonlinear);
    let mut x = [0.0, 0.0];
    let stats = solve(&mut problem, &mut x, &[1.0, 1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::SingularJacobian);
}

fn atan_fence() -> SystemWithJac<
    impl FnMut(&[f64], &mut [f64]) -> Result<(), EvalFailure>,
    impl FnMut(&[f64], &mut JacobianMut<'_, f64>) -> Result<(), EvalFailure>,
> {
    SystemWithJac {
        f: |x: &[f64], f: &mut [f64]| {
            f[0] = x[0].atan() - std::f64::consts::FRAC_PI_3;
            Ok(())
        },
        jac: |x: &[f64], jac: &mut JacobianMut<'_, f64>| {
            jac.set(0, 0, 1.0 / (1.0 + x[0] * x[0]));
            Ok(())
        },
    }
}

#[test]
fn damping_rescues_the_atan_fence() {
    // Undamped Newton diverges from x0 = 10.
    let cfg = NewtonCfg::default()
        .with_jacobian(JacobianMode::Analytic)
        .ordinary_newton()
        .with_rtol(1e-10);
    let mut x = [10.0];
    let stats = solve(&mut atan_fence(), &mut x, &[1.0], cfg).unwrap();
    assert_ne!(stats.status, SolveStatus::Converged);

    // The damped iteration converges, and some step had to be damped.
    let cfg = NewtonCfg::default()
        .with_class(ProblemClass::HighlyNonlinear)
        .with_jacobian(JacobianMode::Analytic)
        .with_rtol(1e-10);
    let mut x = [10.0];
    let stats = solve(&mut atan_fence(), &mut x, &[1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert!((x[0] - 3f64.sqrt()).abs() < 1e-8);
    assert!(stats.history.damping.iter().any(|&fc| fc < 1.0));
    for &fc in &stats.history.damping {
        assert!((1e-4..=1.0).contains(&fc));
    }
}

fn tridiagonal(x: &[f64], f: &mut [f64]) -> Result<(), EvalFailure> {
    let n = x.len();
    for i in 0..n {
        let left = if i > 0 { x[i - 1] } else { 0.0 };
        let right = if i + 1 < n { x[i + 1] } else { 0.0 };
        f[i] = (3.0 - 2.0 * x[i]) * x[i] - left - 2.0 * right + 1.0;
    }
    Ok(())
}

#[test]
fn banded_and_dense_storage_agree() {
    let n = 8;
    let dense_cfg = NewtonCfg::default()
        .with_class(ProblemClass::MildlyNonlinear)
        .with_rtol(1e-12);
    let banded_cfg = dense_cfg.banded(1, 1);

    let mut xd = vec![-1.0; n];
    let sd = solve(&mut SystemFn(tridiagonal), &mut xd, &vec![1.0; n], dense_cfg).unwrap();
    let mut xb = vec![-1.0; n];
    let sb = solve(&mut SystemFn(tridiagonal), &mut xb, &vec![1.0; n], banded_cfg).unwrap();

    assert_eq!(sd.status, SolveStatus::Converged);
    assert_eq!(sb.status, SolveStatus::Converged);
    assert_eq!(sd.iterations, sb.iterations);
    for i in 0..n {
        assert!(
            (xd[i] - xb[i]).abs() < 1e-10,
            "component {i}: {} vs {}",
            xd[i],
            xb[i]
        );
    }
}

#[test]
fn successive_calls_match_a_single_run() {
    let chunked_cfg = NewtonCfg::default()
        .with_class(ProblemClass::HighlyNonlinear)
        .with_rtol(1e-10)
        .with_max_iter(1)
        .with_successive(true);
    let mut solver = DampedNewton::new(1, chunked_cfg).unwrap();
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] * x[0] - 2.0;
        Ok(())
    });
    let mut x_chunked = [1.0];
    let mut calls = 0;
    let chunked = loop {
        let stats = solver
            .solve(&mut problem, &mut x_chunked, &[1.0])
            .unwrap();
        calls += 1;
        assert!(calls <= 5, "did not finish within five single-iteration calls");
        if stats.status != SolveStatus::Pending {
            break stats;
        }
    };

    let whole_cfg = NewtonCfg::default()
        .with_class(ProblemClass::HighlyNonlinear)
        .with_rtol(1e-10)
        .with_max_iter(5);
    let mut x_whole = [1.0];
    let whole = solve(&mut problem, &mut x_whole, &[1.0], whole_cfg).unwrap();

    assert_eq!(chunked.status, SolveStatus::Converged);
    assert_eq!(whole.status, SolveStatus::Converged);
    assert_eq!(x_chunked[0], x_whole[0]);
    assert_eq!(chunked.iterations, whole.iterations);
    assert_eq!(chunked.fcn_evals, whole.fcn_evals);
    assert_eq!(chunked.history.damping, whole.history.damping);
}

#[test]
fn scalar_newton_reaches_sqrt_two() {
    let cfg = NewtonCfg::default()
        .with_class(ProblemClass::HighlyNonlinear)
        .with_rtol(1e-10);
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] * x[0] - 2.0;
        Ok(())
    });
    let mut x = [1.0];
    let stats = solve(&mut problem, &mut x, &[1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert!(stats.iterations <= 6, "took {} iterations", stats.iterations);
    assert!((x[0] - 2f64.sqrt()).abs() < 1e-9);
    assert!(stats.achieved_tol <= 1e-10);

    // Work counters: one residual per accepted step plus the initial one,
    // every retry accounted as corrector or rank-1 rejection.
    assert!(stats.fcn_evals >= stats.iterations + 1);
    assert!(stats.jac_evals <= stats.iterations);
    assert!(
        stats.corrector_steps + stats.rank1_rejected
            >= stats.fcn_evals - stats.iterations - 1
    );

    // Achieved precision shrinks monotonically on a convergent run.
    for pair in stats.history.precision.windows(2) {
        assert!(pair[1] <= pair[0] * (1.0 + 1e-12));
    }
}

#[test]
fn negative_scale_entries_are_rejected() {
    let cfg = NewtonCfg::default();
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] - 1.0;
        Ok(())
    });
    let mut x = [0.0];
    let err = solve(&mut problem, &mut x, &[-1.0], cfg).unwrap_err();
    assert_eq!(err, SolverError::InvalidScale);
    // Rejected before anything ran.
    assert_eq!(x[0], 0.0);
}

#[test]
fn missing_analytic_jacobian_is_rejected() {
    let cfg = NewtonCfg::default().with_jacobian(JacobianMode::Analytic);
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] - 1.0;
        Ok(())
    });
    let mut x = [0.0];
    let err = solve(&mut problem, &mut x, &[1.0], cfg).unwrap_err();
    assert_eq!(err, SolverError::MissingJacobian);
}

#[test]
fn tiny_tolerances_are_clamped_not_fatal() {
    let cfg = NewtonCfg::default().with_rtol(1e-300);
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] * x[0] - 2.0;
        Ok(())
    });
    let mut x = [1.0];
    let stats = solve(&mut problem, &mut x, &[1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert!((x[0] - 2f64.sqrt()).abs() < 1e-14);
}

#[test]
fn ordinary_newton_records_unit_damping_only() {
    let cfg = NewtonCfg::default().ordinary_newton().with_rtol(1e-12);
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] * x[0] - 2.0;
        Ok(())
    });
    let mut x = [1.0];
    let stats = solve(&mut problem, &mut x, &[1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert!(stats.history.damping.iter().all(|&fc| fc == 1.0));
}

#[test]
fn simplified_newton_factorizes_once() {
    let cfg = NewtonCfg::default().simplified_newton().with_rtol(1e-10).with_max_iter(200);
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] * x[0] - 2.0;
        Ok(())
    });
    let mut x = [1.4];
    let stats = solve(&mut problem, &mut x, &[1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert_eq!(stats.jac_evals, 1);
    assert!((x[0] - 2f64.sqrt()).abs() < 1e-9);
}

#[test]
fn rank1_updates_save_jacobian_builds() {
    let n = 8;
    let mut cfg = NewtonCfg::default()
        .with_class(ProblemClass::MildlyNonlinear)
        .with_rank1(true)
        .with_rtol(1e-13);
    cfg.sigma = Some(1.5);
    let mut x = vec![-1.0; n];
    let stats = solve(&mut SystemFn(tridiagonal), &mut x, &vec![1.0; n], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert!(
        stats.jac_evals < stats.iterations,
        "no Jacobian build was saved: {} builds over {} iterations",
        stats.jac_evals,
        stats.iterations
    );

    let mut f = vec![0.0; n];
    tridiagonal(&x, &mut f).unwrap();
    let rms = (f.iter().map(|v| v * v).sum::<f64>() / n as f64).sqrt();
    assert!(rms < 1e-10, "residual RMS {rms}");
}

#[test]
fn monitor_can_cancel_between_iterations() {
    let cfg = NewtonCfg::default()
        .with_class(ProblemClass::HighlyNonlinear)
        .with_rtol(1e-12);
    let mut problem = SystemFn(|x: &[f64], f: &mut [f64]| {
        f[0] = x[0] * x[0] - 2.0;
        Ok(())
    });
    let mut x = [1.0];
    let stats = solve_with_monitor(&mut problem, &mut x, &[1.0], cfg, |record| {
        if record.iter >= 2 {
            Control::Cancel
        } else {
            Control::Continue
        }
    })
    .unwrap();
    assert_eq!(stats.status, SolveStatus::Cancelled);
    assert_eq!(stats.iterations, 2);
}

#[test]
fn failing_residual_is_reported() {
    let cfg = NewtonCfg::default();
    let mut problem = SystemFn(|_x: &[f64], _f: &mut [f64]| Err(EvalFailure));
    let mut x = [1.0];
    let stats = solve(&mut problem, &mut x, &[1.0], cfg).unwrap();
    assert_eq!(stats.status, SolveStatus::EvalFailed);
    assert_eq!(stats.fcn_evals, 1);
}

proptest! {
    /// Left-multiplying the system by a diagonal matrix must not change the
    /// iteration. Powers of two keep the row equilibration exact, so the
    /// runs are comparable to the last bit.
    #[test]
    fn iterates_are_invariant_under_row_rescaling(e0 in -6i32..=6, e1 in -6i32..=6) {
        let base = NewtonCfg::default()
            .with_class(ProblemClass::HighlyNonlinear)
            .with_rtol(1e-10);

        let mut plain = SystemFn(|x: &[f64], f: &mut [f64]| {
            f[0] = x[0] * x[0] + x[1] - 3.0;
            f[1] = x[0] - x[1] * x[1];
            Ok(())
        });
        let mut x_plain = [2.0, 0.5];
        let stats_plain = solve(&mut plain, &mut x_plain, &[1.0, 1.0], base).unwrap();

        let d = [2f64.powi(e0), 2f64.powi(e1)];
        let mut scaled = SystemFn(move |x: &[f64], f: &mut [f64]| {
            f[0] = d[0] * (x[0] * x[0] + x[1] - 3.0);
            f[1] = d[1] * (x[0] - x[1] * x[1]);
            Ok(())
        });
        let mut x_scaled = [2.0, 0.5];
        let stats_scaled = solve(&mut scaled, &mut x_scaled, &[1.0, 1.0], base).unwrap();

        prop_assert_eq!(stats_plain.status, SolveStatus::Converged);
        prop_assert_eq!(stats_scaled.status, SolveStatus::Converged);
        prop_assert_eq!(stats_plain.iterations, stats_scaled.iterations);
        for (a, b) in stats_plain
            .history
            .iterates
            .iter()
            .zip(stats_scaled.history.iterates.iter())
        {
            for (ai, bi) in a.iter().zip(b.iter()) {
                prop_assert!((ai - bi).abs() <= 1e-12 * (1.0 + ai.abs()));
            }
        }
    }
}
