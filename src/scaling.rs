//! Iterate scaling, Jacobian row equilibration, and the level functions the
//! damping heuristics reason about.

use log::warn;

use crate::config::ProblemClass;
use crate::linalg::JacStorage;
use crate::{MachineConsts, Real, SolverError};

/// Precondition the user scaling vector once per solve: replace zeros by the
/// class-dependent default and force every entry into the safe magnitude
/// window. Negative entries are rejected.
pub(crate) fn precondition_scale<T: Real>(
    xscal: &mut [T],
    rtol: T,
    class: ProblemClass,
    machine: &MachineConsts<T>,
) -> Result<(), SolverError> {
    if xscal.iter().any(|&s| s < T::zero()) {
        return Err(SolverError::InvalidScale);
    }
    let default = match class {
        ProblemClass::HighlyNonlinear | ProblemClass::ExtremelyNonlinear => rtol,
        _ => T::one(),
    };
    let mut clamped = false;
    for s in xscal.iter_mut() {
        if s.is_zero() {
            *s = default;
        } else if *s < machine.small {
            *s = machine.small;
            clamped = true;
        } else if *s > machine.great {
            *s = machine.great;
            clamped = true;
        }
    }
    if clamped {
        warn!("scaling entries clamped into the safe magnitude window");
    }
    Ok(())
}

/// Derive the scaling vector for the next factorization from the
/// preconditioned user scale and the last two iterates.
///
/// Strict positivity of `xw` is what keeps the iteration affine invariant
/// and every scaled division overflow-safe.
pub(crate) fn iterate_scale<T: Real>(
    xw: &mut [T],
    xscal: &[T],
    x: &[T],
    xa: &[T],
    fixed: bool,
    machine: &MachineConsts<T>,
) {
    if fixed {
        xw.copy_from_slice(xscal);
        return;
    }
    let half = T::from(0.5).expect("small constant");
    for i in 0..xw.len() {
        let mid = (x[i].abs() + xa[i].abs()) * half;
        xw[i] = xscal[i].max(mid.max(machine.small)).min(machine.great);
    }
}

/// Left-scale the Jacobian by the reciprocal row infinity norms; zero rows
/// are left untouched with a unit factor. Returns the factors in `fw`.
pub(crate) fn equilibrate_rows<T: Real>(jac: &mut JacStorage<T>, fw: &mut [T]) {
    for (k, w) in fw.iter_mut().enumerate() {
        let max = jac.row_max_abs(k);
        if max.is_zero() {
            *w = T::one();
        } else {
            *w = max.recip();
            jac.scale_row(k, *w);
        }
    }
}

/// The three level quantities of one Newton correction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Levels<T> {
    /// Scaled max norm of the correction.
    pub conv: T,
    /// Scaled natural level, `sum(dx1^2)`.
    pub sumx: T,
    /// Standard level, `||F||_2 / sqrt(n)`.
    pub dlevf: T,
}

pub(crate) fn levels<T: Real>(dx1: &[T], f: &[T]) -> Levels<T> {
    let mut conv = T::zero();
    let mut sumx = T::zero();
    for &v in dx1 {
        conv = conv.max(v.abs());
        sumx = sumx + v * v;
    }
    let mut sumf = T::zero();
    for &v in f {
        sumf = sumf + v * v;
    }
    let n = T::from(f.len()).expect("dimension as scalar");
    Levels {
        conv,
        sumx,
        dlevf: (sumf / n).sqrt(),
    }
}

/// Scaled Euclidean norm `||v ./ xw||_2`.
pub(crate) fn scaled_norm<T: Real>(v: &[T], xw: &[T]) -> T {
    let mut sum = T::zero();
    for (&vi, &wi) in v.iter().zip(xw.iter()) {
        let s = vi / wi;
        sum = sum + s * s;
    }
    sum.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Storage;

    #[test]
    fn preconditioning_replaces_zeros_and_rejects_negatives() {
        let machine = MachineConsts::<f64>::new();
        let mut xscal = vec![0.0, 2.0, 1e-40];
        precondition_scale(&mut xscal, 1e-6, ProblemClass::HighlyNonlinear, &machine).unwrap();
        assert_eq!(xscal[0], 1e-6);
        assert_eq!(xscal[1], 2.0);
        assert_eq!(xscal[2], machine.small);

        let mut bad = vec![1.0, -1.0];
        assert_eq!(
            precondition_scale(&mut bad, 1e-6, ProblemClass::MildlyNonlinear, &machine)
                .unwrap_err(),
            SolverError::InvalidScale
        );
        // Rejected without mutation.
        assert_eq!(bad, vec![1.0, -1.0]);
    }

    #[test]
    fn iterate_scale_uses_the_midpoint_magnitude() {
        let machine = MachineConsts::<f64>::new();
        let mut xw = vec![0.0; 2];
        iterate_scale(
            &mut xw,
            &[1e-3, 1e-3],
            &[4.0, -1e-9],
            &[2.0, 1e-9],
            false,
            &machine,
        );
        assert_eq!(xw[0], 3.0);
        assert_eq!(xw[1], 1e-3);

        iterate_scale(&mut xw, &[0.5, 0.25], &[4.0, 0.0], &[2.0, 0.0], true, &machine);
        assert_eq!(xw, vec![0.5, 0.25]);
    }

    #[test]
    fn row_equilibration_round_trips() {
        let n = 4;
        let mut jac = JacStorage::<f64>::new(n, Storage::Dense);
        let entries = [
            [4.0, -2.0, 0.0, 1.0],
            [0.5, 8.0, 0.25, 0.0],
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 1.0, 1.0, -16.0],
        ];
        {
            let mut view = jac.view();
            for i in 0..n {
                for j in 0..n {
                    view.set(i, j, entries[i][j]);
                }
            }
        }
        let mut fw = vec![0.0; n];
        equilibrate_rows(&mut jac, &mut fw);
        assert_eq!(fw, vec![0.25, 0.125, 1.0, 1.0 / 16.0]);

        // Dividing the scaled rows by fw recovers the original matrix.
        for i in 0..n {
            jac.scale_row(i, 1.0 / fw[i]);
        }
        for i in 0..n {
            assert!((jac.row_max_abs(i) - entries[i].iter().fold(0.0f64, |a, b| a.max(b.abs())))
                .abs()
                < 1e-15);
        }
    }

    #[test]
    fn level_functions() {
        let l = levels(&[0.5, -2.0, 1.0], &[3.0, 0.0, 4.0, 0.0]);
        assert_eq!(l.conv, 2.0);
        assert_eq!(l.sumx, 5.25);
        assert_eq!(l.dlevf, 2.5);
    }
}
