//! Forward-difference approximation of the Jacobian.
//!
//! Dense sweeps perturb one column at a time; band sweeps perturb whole
//! column groups of stride `ml + mu + 1`, whose derivative supports hit
//! disjoint rows. The feedback-controlled variants carry a per-component
//! denominator difference `eta` that is re-tuned from the observed
//! discretization error, with at most one retry per column (or group).

use crate::linalg::JacStorage;
use crate::{EvalFailure, MachineConsts, Problem, Real};

/// Constants of the differencing kernels, all derived from machine epsilon.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DiffParams<T> {
    /// Relative perturbation of the plain sweep, `sqrt(10 eps)`.
    pub ajdel: T,
    /// Absolute floor of the perturbation magnitude.
    pub ajmin: T,
    /// Target relative discretization error, `sqrt(1.1 eps)`.
    pub etadif: T,
    /// Initial denominator difference.
    pub etaini: T,
    pub etamin: T,
    pub etamax: T,
    /// Correction max-norm under which column refinement is skipped.
    pub small2: T,
}

impl<T: Real> DiffParams<T> {
    pub fn new(machine: &MachineConsts<T>) -> Self {
        let ten = T::from(10.0).expect("small constant");
        let epdiff = (ten * machine.eps).sqrt();
        let etamax = epdiff.sqrt();
        let etadif = (T::from(1.1).expect("small constant") * machine.eps).sqrt();
        Self {
            ajdel: epdiff,
            ajmin: T::zero(),
            etadif,
            etaini: etadif.sqrt(),
            etamin: epdiff * etamax,
            etamax,
            small2: T::from(0.1).expect("small constant"),
        }
    }
}

#[inline]
fn perturbation<T: Real>(w: T, yscal: T, ajmin: T, delta: T) -> T {
    let mag = w.abs().max(ajmin).max(yscal) * delta;
    if w < T::zero() {
        -mag
    } else {
        mag
    }
}

/// Relative discretization error of one difference column; terms whose
/// numerator and denominator both vanish are skipped.
fn column_error<T: Real>(f: &[T], fu: &[T]) -> T {
    let mut sum = T::zero();
    for (&a, &b) in f.iter().zip(fu.iter()) {
        let w = a.abs().max(b.abs());
        if !w.is_zero() {
            let r = (b - a) / w;
            sum = sum + r * r;
        }
    }
    let n = T::from(f.len()).expect("dimension as scalar");
    (sum / n).sqrt()
}

/// Plain forward differences, dense or banded by storage.
pub(crate) fn plain<T: Real, P: Problem<T>>(
    problem: &mut P,
    jac: &mut JacStorage<T>,
    x: &mut [T],
    f: &[T],
    fu: &mut [T],
    xw: &[T],
    dp: &DiffParams<T>,
    nfcnj: &mut usize,
) -> Result<(), EvalFailure> {
    let n = x.len();
    match jac.bandwidths() {
        None => {
            for k in 0..n {
                let w = x[k];
                let u = perturbation(w, xw[k], dp.ajmin, dp.ajdel);
                x[k] = w + u;
                *nfcnj += 1;
                let res = problem.residual(x, fu);
                x[k] = w;
                res?;
                let mut view = jac.view();
                for i in 0..n {
                    view.set(i, k, (fu[i] - f[i]) / u);
                }
            }
        }
        Some((ml, mu)) => {
            let ldab = ml + mu + 1;
            let mut u = vec![T::zero(); n];
            let mut wsave = vec![T::zero(); n];
            for g in 0..ldab.min(n) {
                for k in (g..n).step_by(ldab) {
                    wsave[k] = x[k];
                    u[k] = perturbation(x[k], xw[k], dp.ajmin, dp.ajdel);
                    x[k] = wsave[k] + u[k];
                }
                *nfcnj += 1;
                let res = problem.residual(x, fu);
                for k in (g..n).step_by(ldab) {
                    x[k] = wsave[k];
                }
                res?;
                let mut view = jac.view();
                for k in (g..n).step_by(ldab) {
                    for i in k.saturating_sub(mu)..(k + ml + 1).min(n) {
                        view.set(i, k, (fu[i] - f[i]) / u[k]);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Feedback-controlled forward differences, dense or banded by storage.
///
/// Each column is evaluated with its own denominator difference `eta[k]`;
/// the observed relative error re-tunes `eta[k]` towards `etadif` and the
/// column is repeated once when the difference drowned in roundoff.
pub(crate) fn adaptive<T: Real, P: Problem<T>>(
    problem: &mut P,
    jac: &mut JacStorage<T>,
    x: &mut [T],
    f: &[T],
    fu: &mut [T],
    xw: &[T],
    eta: &mut [T],
    conv: T,
    dp: &DiffParams<T>,
    nfcnj: &mut usize,
) -> Result<(), EvalFailure> {
    let n = x.len();
    match jac.bandwidths() {
        None => {
            for k in 0..n {
                let mut is = 0;
                loop {
                    let w = x[k];
                    let u = perturbation(w, xw[k], dp.ajmin, eta[k]);
                    x[k] = w + u;
                    *nfcnj += 1;
                    let res = problem.residual(x, fu);
                    x[k] = w;
                    res?;
                    let sumd = column_error(f, fu);
                    {
                        let mut view = jac.view();
                        for i in 0..n {
                            view.set(i, k, (fu[i] - f[i]) / u);
                        }
                    }
                    let mut fine = true;
                    if !sumd.is_zero() && is == 0 {
                        eta[k] = ((dp.etadif / sumd).sqrt() * eta[k])
                            .max(dp.etamin)
                            .min(dp.etamax);
                        is = 1;
                        fine = conv < dp.small2 || sumd >= dp.etamin;
                    }
                    if fine {
                        break;
                    }
                }
            }
        }
        Some((ml, mu)) => {
            let ldab = ml + mu + 1;
            let mut u = vec![T::zero(); n];
            let mut wsave = vec![T::zero(); n];
            for g in 0..ldab.min(n) {
                let mut is = 0;
                loop {
                    for k in (g..n).step_by(ldab) {
                        wsave[k] = x[k];
                        u[k] = perturbation(x[k], xw[k], dp.ajmin, eta[k]);
                        x[k] = wsave[k] + u[k];
                    }
                    *nfcnj += 1;
                    let res = problem.residual(x, fu);
                    for k in (g..n).step_by(ldab) {
                        x[k] = wsave[k];
                    }
                    res?;
                    let mut fine = true;
                    for k in (g..n).step_by(ldab) {
                        let lo = k.saturating_sub(mu);
                        let hi = (k + ml + 1).min(n);
                        let sumd = column_error(&f[lo..hi], &fu[lo..hi]);
                        {
                            let mut view = jac.view();
                            for i in lo..hi {
                                view.set(i, k, (fu[i] - f[i]) / u[k]);
                            }
                        }
                        if !sumd.is_zero() && is == 0 {
                            eta[k] = ((dp.etadif / sumd).sqrt() * eta[k])
                                .max(dp.etamin)
                                .min(dp.etamax);
                            fine = fine && (conv < dp.small2 || sumd >= dp.etamin);
                        }
                    }
                    if is == 0 && !fine {
                        is = 1;
                        continue;
                    }
                    break;
                }
            }
        }
    }
    Ok(())
}
