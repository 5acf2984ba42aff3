//! The damped Newton engine and its driver surface.
//!
//! One iteration runs the phases: setup (scale, Jacobian, factorize),
//! ordinary correction, convergence test, a-priori damping prediction,
//! corrector loop (trial step + simplified correction + monotonicity test),
//! rank-1 decision, commit. The damping estimates are the affine-invariant
//! local Lipschitz quantities: all norms are taken in the scale `xw`.

use log::debug;

use crate::broyden::BroydenChain;
use crate::config::{JacobianMode, NewtonCfg, Params};
use crate::jacobian::{self, DiffParams};
use crate::linalg::{Factorization, JacStorage};
use crate::report::{Control, History, IterationStats, SolveStats, SolveStatus};
use crate::scaling;
use crate::{EvalFailure, MachineConsts, Problem, Real, SolverError};

/// Retry budget of one corrector loop; reaching it means the level could not
/// be made monotone even with the damping floor in reach.
const CORRECTOR_LIMIT: usize = 30;

/// Solve `F(x) = 0` with the default monitor.
///
/// `x` carries the initial guess and is overwritten with the final iterate;
/// `xscal` provides per-component lower bounds for the iteration scale.
pub fn solve<T: Real, P: Problem<T>>(
    problem: &mut P,
    x: &mut [T],
    xscal: &[T],
    cfg: NewtonCfg<T>,
) -> Result<SolveStats<T>, SolverError> {
    solve_with_monitor(problem, x, xscal, cfg, |_| Control::Continue)
}

/// Like [`solve`], with a per-iteration monitor callback that can cancel the
/// run between iterations.
pub fn solve_with_monitor<T, P, M>(
    problem: &mut P,
    x: &mut [T],
    xscal: &[T],
    cfg: NewtonCfg<T>,
    monitor: M,
) -> Result<SolveStats<T>, SolverError>
where
    T: Real,
    P: Problem<T>,
    M: FnMut(&IterationStats<T>) -> Control,
{
    let mut solver = DampedNewton::new(x.len(), cfg)?;
    solver.solve_with_monitor(problem, x, xscal, monitor)
}

/// A damped Newton solver with persistent workspace.
///
/// The workspace survives across `solve` calls when the configuration is in
/// successive-call mode, so a long run can be chunked into batches of
/// `max_iter` iterations: a batch that returns [`SolveStatus::Pending`]
/// resumes exactly where it stopped. Terminal outcomes drop the state; the
/// next call starts a fresh run.
pub struct DampedNewton<T: Real> {
    n: usize,
    n_real: T,
    params: Params<T>,
    machine: MachineConsts<T>,
    diff: DiffParams<T>,
    state: Option<State<T>>,
}

struct State<T: Real> {
    x: Vec<T>,
    xa: Vec<T>,
    f: Vec<T>,
    f_valid: bool,
    /// Ordinary correction, unscaled.
    dx: Vec<T>,
    /// Ordinary correction in the factorization scale.
    dx1: Vec<T>,
    /// Previous damped correction `fca * dx`.
    dxqa: Vec<T>,
    /// Simplified correction at the current iterate w.r.t. the previous
    /// factorization; one of the two Lipschitz probes of the predictor.
    dxbar: Vec<T>,
    have_prev: bool,
    eta: Vec<T>,
    xscal: Vec<T>,
    xw: Vec<T>,
    fw: Vec<T>,
    jac: JacStorage<T>,
    fact: Option<Factorization<T>>,
    chain: BroydenChain<T>,
    fca: T,
    conv: T,
    sumx: T,
    dlevf: T,
    niter: usize,
    ncorr: usize,
    nfcn: usize,
    nfcnj: usize,
    njac: usize,
    nrejr1: usize,
    need_fresh: bool,
    history: History<T>,
    done: Option<SolveStatus>,
    achieved: T,
    // scratch
    xt: Vec<T>,
    ft: Vec<T>,
    fu: Vec<T>,
    rhs: Vec<T>,
}

impl<T: Real> State<T> {
    fn new(x0: &[T], xscal: Vec<T>, params: &Params<T>, machine: &MachineConsts<T>, etaini: T) -> Self {
        let n = x0.len();
        let mut history = History::with_capacity(params.max_iter);
        history.iterates.push(x0.to_vec());
        Self {
            x: x0.to_vec(),
            xa: x0.to_vec(),
            f: vec![T::zero(); n],
            f_valid: false,
            dx: vec![T::zero(); n],
            dx1: vec![T::zero(); n],
            dxqa: vec![T::zero(); n],
            dxbar: vec![T::zero(); n],
            have_prev: false,
            eta: vec![etaini; n],
            xscal,
            xw: vec![T::one(); n],
            fw: vec![T::one(); n],
            jac: JacStorage::new(n, params.storage),
            fact: None,
            chain: BroydenChain::new(params.nbroy.max(1)),
            fca: params.fc_start,
            conv: machine.great,
            sumx: T::zero(),
            dlevf: T::zero(),
            niter: 0,
            ncorr: 0,
            nfcn: 0,
            nfcnj: 0,
            njac: 0,
            nrejr1: 0,
            need_fresh: true,
            history,
            done: None,
            achieved: machine.great,
            xt: vec![T::zero(); n],
            ft: vec![T::zero(); n],
            fu: vec![T::zero(); n],
            rhs: vec![T::zero(); n],
        }
    }
}

impl<T: Real> DampedNewton<T> {
    /// Validate the configuration for a system of dimension `n`.
    pub fn new(n: usize, cfg: NewtonCfg<T>) -> Result<Self, SolverError> {
        let machine = MachineConsts::new();
        let params = Params::resolve(&cfg, n, &machine)?;
        Ok(Self {
            n,
            n_real: T::from(n).expect("dimension as scalar"),
            params,
            machine,
            diff: DiffParams::new(&machine),
            state: None,
        })
    }

    /// Drop any persistent iteration state; the next call starts fresh.
    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn solve<P: Problem<T>>(
        &mut self,
        problem: &mut P,
        x: &mut [T],
        xscal: &[T],
    ) -> Result<SolveStats<T>, SolverError> {
        self.solve_with_monitor(problem, x, xscal, |_| Control::Continue)
    }

    pub fn solve_with_monitor<P, M>(
        &mut self,
        problem: &mut P,
        x: &mut [T],
        xscal: &[T],
        mut monitor: M,
    ) -> Result<SolveStats<T>, SolverError>
    where
        P: Problem<T>,
        M: FnMut(&IterationStats<T>) -> Control,
    {
        if x.len() != self.n {
            return Err(SolverError::DimensionMismatch {
                expected: self.n,
                actual: x.len(),
            });
        }
        if xscal.len() != self.n {
            return Err(SolverError::DimensionMismatch {
                expected: self.n,
                actual: xscal.len(),
            });
        }
        if self.params.jacobian == JacobianMode::Analytic && !problem.has_jacobian() {
            return Err(SolverError::MissingJacobian);
        }

        let resume = self.params.successive
            && self
                .state
                .as_ref()
                .is_some_and(|s| s.done.is_none_or(|d| d.resumable()));
        if !resume {
            let mut scale = xscal.to_vec();
            scaling::precondition_scale(&mut scale, self.params.rtol, self.params.class, &self.machine)?;
            self.state = Some(State::new(x, scale, &self.params, &self.machine, self.diff.etaini));
        }
        let params = self.params;
        let machine = self.machine;
        let diff = self.diff;
        let n_real = self.n_real;
        let st = self.state.as_mut().ok_or(SolverError::EmptySystem)?;
        st.done = None;

        let budget = st.niter + params.max_iter;
        let status = loop {
            if let Some(done) = st.done {
                break done;
            }
            if let Err(EvalFailure) = iterate(st, problem, &params, &machine, &diff, n_real, &mut monitor) {
                st.done = Some(SolveStatus::EvalFailed);
            }
            if st.done.is_none() && st.niter >= budget {
                st.done = Some(if params.successive {
                    SolveStatus::Pending
                } else {
                    SolveStatus::IterationLimit
                });
            }
        };

        x.copy_from_slice(&st.x);
        let stats = SolveStats {
            status,
            achieved_tol: st.achieved,
            scale: st.xw.clone(),
            iterations: st.niter,
            corrector_steps: st.ncorr,
            fcn_evals: st.nfcn,
            fcn_evals_jac: st.nfcnj,
            jac_evals: st.njac,
            rank1_rejected: st.nrejr1,
            rank1_chain: st.chain.len(),
            history: st.history.clone(),
        };
        if !status.resumable() {
            self.state = None;
        }
        Ok(stats)
    }
}

fn all_finite<T: Real>(v: &[T]) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// One accepted Newton step (or a terminal verdict in `st.done`).
fn iterate<T, P, M>(
    st: &mut State<T>,
    problem: &mut P,
    params: &Params<T>,
    machine: &MachineConsts<T>,
    diff: &DiffParams<T>,
    n_real: T,
    monitor: &mut M,
) -> Result<(), EvalFailure>
where
    T: Real,
    P: Problem<T>,
    M: FnMut(&IterationStats<T>) -> Control,
{
    let n = st.x.len();
    let one = T::one();
    let half = T::from(0.5).expect("small constant");
    let four = T::from(4.0).expect("small constant");

    if !st.f_valid {
        st.nfcn += 1;
        problem.residual(&st.x, &mut st.f)?;
        if !all_finite(&st.f) {
            return Err(EvalFailure);
        }
        st.f_valid = true;
    }

    // A rank-1 rejection loops back here with a halved, pinned factor.
    let mut fc_pinned: Option<T> = None;
    'refresh: loop {
        // Phase A: scaling, Jacobian, factorization. A standing
        // factorization is reused by Broyden chains and simplified Newton.
        if st.fact.is_none() || (st.need_fresh && !params.simplified) {
            scaling::iterate_scale(&mut st.xw, &st.xscal, &st.x, &st.xa, params.fixed_scale, machine);
            st.njac += 1;
            st.jac.zero();
            match params.jacobian {
                JacobianMode::Analytic => problem.jacobian(&st.x, &mut st.jac.view())?,
                JacobianMode::ForwardDiff => jacobian::plain(
                    problem, &mut st.jac, &mut st.x, &st.f, &mut st.fu, &st.xw, diff, &mut st.nfcnj,
                )?,
                JacobianMode::AdaptiveDiff => jacobian::adaptive(
                    problem, &mut st.jac, &mut st.x, &st.f, &mut st.fu, &st.xw, &mut st.eta,
                    st.conv, diff, &mut st.nfcnj,
                )?,
            }
            if params.row_scaling {
                scaling::equilibrate_rows(&mut st.jac, &mut st.fw);
            } else {
                st.fw.fill(one);
            }
            for j in 0..n {
                st.jac.scale_col(j, st.xw[j]);
            }
            match Factorization::factor(&st.jac) {
                Ok(fact) => st.fact = Some(fact),
                Err(_) => {
                    st.done = Some(SolveStatus::SingularJacobian);
                    return Ok(());
                }
            }
            st.chain.clear();
        }
        st.need_fresh = false;
        let Some(fact) = st.fact.as_ref() else {
            st.done = Some(SolveStatus::SingularJacobian);
            return Ok(());
        };

        // Phase B: ordinary Newton correction in the factorization scale.
        for i in 0..n {
            st.rhs[i] = -(st.fw[i] * st.f[i]);
        }
        fact.solve_in_place(&mut st.rhs);
        st.chain.apply(&mut st.rhs);
        if !all_finite(&st.rhs) {
            st.done = Some(SolveStatus::SingularJacobian);
            return Ok(());
        }
        st.dx1.copy_from_slice(&st.rhs);
        for i in 0..n {
            st.dx[i] = st.dx1[i] * st.xw[i];
        }
        let lv = scaling::levels(&st.dx1, &st.f);
        st.conv = lv.conv;
        st.sumx = lv.sumx;
        st.dlevf = lv.dlevf;
        let normdx = (lv.sumx / n_real).sqrt();
        st.achieved = normdx;

        // Phase C: converged already - the full correction is the accepted
        // final step.
        if normdx <= params.rtol {
            st.xa.copy_from_slice(&st.x);
            for i in 0..n {
                st.x[i] = st.x[i] + st.dx[i];
            }
            st.fca = one;
            st.niter += 1;
            st.history.iterates.push(st.x.clone());
            st.history.natural_level.push(st.sumx);
            st.history.simplified_level.push(st.sumx);
            st.history.standard_level.push(st.dlevf);
            st.history.precision.push(normdx);
            st.history.damping.push(one);
            let record = IterationStats {
                iter: st.niter,
                normdx,
                natural_level: st.sumx,
                standard_level: st.dlevf,
                damping: one,
                corrector_steps: 0,
                broyden_len: st.chain.len(),
            };
            debug!(
                "iter {:>3}  normdx {:>12.5e}  level {:>12.5e}  fc {:.5e}  new {}",
                record.iter,
                record.normdx.to_f64().unwrap_or(f64::NAN),
                record.standard_level.to_f64().unwrap_or(f64::NAN),
                record.damping.to_f64().unwrap_or(f64::NAN),
                record.broyden_len,
            );
            // The run is finished either way, so a cancel verdict from the
            // monitor changes nothing here.
            let _ = monitor(&record);
            st.done = Some(SolveStatus::Converged);
            return Ok(());
        }

        // Phase D: a-priori damping factor.
        let mut fc = match fc_pinned.take() {
            Some(pinned) => pinned,
            None if !params.damped => one,
            None if !st.have_prev => params.fc_start,
            None => predictor(st, params, machine, half),
        };

        // Phase E: corrector loop. Trial step, simplified correction with
        // the standing factorization, natural monotonicity test.
        let mut increased = false;
        let mut trials = 0usize;
        let (sumxs, dmycor) = loop {
            trials += 1;
            for i in 0..n {
                st.xt[i] = st.x[i] + fc * st.dx[i];
            }
            st.nfcn += 1;
            problem.residual(&st.xt, &mut st.ft)?;

            if !all_finite(&st.ft) {
                // Out-of-domain trial: shrink like a failed monotonicity
                // test. Undamped modes have no way to recover.
                if !params.damped {
                    return Err(EvalFailure);
                }
                st.ncorr += 1;
                if fc <= params.fc_min {
                    st.done = Some(SolveStatus::DampingTooSmall);
                    return Ok(());
                }
                if trials > CORRECTOR_LIMIT {
                    st.done = Some(SolveStatus::NonMonotone);
                    return Ok(());
                }
                fc = (fc * half).max(params.fc_min);
                continue;
            }

            for i in 0..n {
                st.rhs[i] = -(st.fw[i] * st.ft[i]);
            }
            fact.solve_in_place(&mut st.rhs);
            st.chain.apply(&mut st.rhs);
            if !all_finite(&st.rhs) {
                st.done = Some(SolveStatus::SingularJacobian);
                return Ok(());
            }
            let mut sumxs = T::zero();
            let mut dnm = T::zero();
            let omfc = one - fc;
            for i in 0..n {
                sumxs = sumxs + st.rhs[i] * st.rhs[i];
                let d = st.rhs[i] - omfc * st.dx1[i];
                dnm = dnm + d * d;
            }
            let dnm = dnm.sqrt();
            // A-posteriori estimate of the damping factor the local
            // Lipschitz constant would allow.
            let dmycor = if dnm > machine.small {
                fc * fc * half * st.sumx.sqrt() / dnm
            } else {
                machine.great
            };

            if !params.damped || sumxs <= st.sumx {
                // Accepted; possibly redo once with the larger factor the
                // a-posteriori estimate justifies.
                if params.damped
                    && !increased
                    && fc < one
                    && dmycor >= four * fc
                    && dmycor <= params.sigma2
                {
                    let mut next = dmycor.min(one);
                    if params.bounded {
                        next = next.min(st.fca * params.fc_band);
                    }
                    if next > fc {
                        st.ncorr += 1;
                        increased = true;
                        fc = next;
                        continue;
                    }
                }
                break (sumxs, dmycor);
            }

            // Monotonicity violated.
            if st.chain.len() > 0 {
                // The Broyden continuation is no longer trustworthy: reject
                // the rank-1 step and redo the iteration with a fresh
                // Jacobian at half the damping.
                st.nrejr1 += 1;
                st.need_fresh = true;
                st.chain.clear();
                fc_pinned = Some((fc * half).max(params.fc_min));
                continue 'refresh;
            }
            st.ncorr += 1;
            if fc <= params.fc_min {
                st.done = Some(SolveStatus::DampingTooSmall);
                return Ok(());
            }
            if trials > CORRECTOR_LIMIT {
                st.done = Some(SolveStatus::NonMonotone);
                return Ok(());
            }
            fc = dmycor.min(fc * half).max(params.fc_min);
        };

        // The simplified correction, descaled; it seeds the next predictor.
        for i in 0..n {
            st.dxbar[i] = st.rhs[i] * st.xw[i];
        }

        // Phase F: keep the factorization through a rank-1 update when the
        // accepted step sits well inside the trust region the a-posteriori
        // estimate allows.
        let take_rank1 = params.rank1
            && !st.chain.is_full()
            && dmycor >= params.sigma * fc
            && st.conv <= params.sigma2 * params.fc_min;
        if take_rank1 {
            let omfc = one - fc;
            for i in 0..n {
                st.rhs[i] = st.fw[i] * (st.ft[i] - omfc * st.f[i]);
            }
            fact.solve_in_place(&mut st.rhs);
            st.chain.apply(&mut st.rhs);
            let mut s = vec![T::zero(); n];
            for i in 0..n {
                s[i] = fc * st.dx1[i];
            }
            if all_finite(&st.rhs) && st.chain.try_push(s, st.rhs.clone()) {
                st.need_fresh = false;
            } else {
                st.need_fresh = true;
            }
        } else {
            st.need_fresh = true;
        }

        // Phase G: commit.
        st.xa.copy_from_slice(&st.x);
        st.x.copy_from_slice(&st.xt);
        st.f.copy_from_slice(&st.ft);
        for i in 0..n {
            st.dxqa[i] = fc * st.dx[i];
        }
        st.have_prev = true;
        st.fca = fc;
        st.niter += 1;

        st.history.iterates.push(st.x.clone());
        st.history.natural_level.push(st.sumx);
        st.history.simplified_level.push(sumxs);
        st.history.standard_level.push(st.dlevf);
        st.history.precision.push(normdx);
        st.history.damping.push(fc);

        let record = IterationStats {
            iter: st.niter,
            normdx,
            natural_level: st.sumx,
            standard_level: st.dlevf,
            damping: fc,
            corrector_steps: trials - 1,
            broyden_len: st.chain.len(),
        };
        debug!(
            "iter {:>3}  normdx {:>12.5e}  level {:>12.5e}  fc {:.5e}  new {}",
            record.iter,
            record.normdx.to_f64().unwrap_or(f64::NAN),
            record.standard_level.to_f64().unwrap_or(f64::NAN),
            record.damping.to_f64().unwrap_or(f64::NAN),
            record.broyden_len,
        );
        if monitor(&record) == Control::Cancel {
            st.done = Some(SolveStatus::Cancelled);
            return Ok(());
        }

        // Full steps converge through the simplified correction, saving the
        // Jacobian a fresh build would cost.
        if fc == one {
            let norms = (sumxs / n_real).sqrt();
            if norms <= params.rtol {
                for i in 0..n {
                    st.x[i] = st.x[i] + st.dxbar[i];
                }
                if let Some(last) = st.history.iterates.last_mut() {
                    last.copy_from_slice(&st.x);
                }
                st.achieved = norms;
                st.done = Some(SolveStatus::Converged);
            }
        }
        return Ok(());
    }
}

/// A-priori damping prediction from the previous damped correction, the
/// simplified correction at the current iterate, and the new ordinary
/// correction.
fn predictor<T: Real>(st: &State<T>, params: &Params<T>, machine: &MachineConsts<T>, half: T) -> T {
    let one = T::one();
    let a = scaling::scaled_norm(&st.dxqa, &st.xw);
    let b = scaling::scaled_norm(&st.dxbar, &st.xw);
    let mut diff2 = T::zero();
    for i in 0..st.dx.len() {
        let d = (st.dxbar[i] - st.dx[i]) / st.xw[i];
        diff2 = diff2 + d * d;
    }
    let denom = diff2.sqrt() * scaling::scaled_norm(&st.dx, &st.xw);

    let mut fcpri = if denom > machine.small && a * b > T::zero() {
        let mut mu = a * b / denom;
        if params.class == crate::config::ProblemClass::ExtremelyNonlinear {
            mu = mu * half;
        }
        mu.min(one)
    } else {
        one
    };
    if params.bounded {
        fcpri = fcpri
            .min(st.fca * params.fc_band)
            .max(st.fca / params.fc_band);
    }
    fcpri.max(params.fc_min).min(one)
}
