//! Jacobian storage and the factorize/solve adapter.
//!
//! Dense systems go through faer's full-pivoting LU. Band matrices use the
//! classic in-place banded LU with partial pivoting; faer has no banded
//! factorization, and the band layout is part of this solver's interface.

use faer::linalg::solvers::FullPivLu;
use faer::mat::MatMut;
use faer::prelude::Solve;
use faer::Mat;

use crate::config::Storage;
use crate::Real;

/// Band matrix in column-major band storage.
///
/// The logical element `(i, j)` with `-mu <= i - j <= ml` lives at storage
/// row `mu + i - j` of column `j`. The array carries `2*ml + mu + 1` rows;
/// the extra `ml` rows below the working band become fill-in space during
/// factorization. All offset math stays behind the helpers here.
#[derive(Clone, Debug)]
pub(crate) struct BandMat<T> {
    n: usize,
    ml: usize,
    mu: usize,
    data: Vec<T>,
}

impl<T: Real> BandMat<T> {
    pub fn new(n: usize, ml: usize, mu: usize) -> Self {
        let rows = 2 * ml + mu + 1;
        Self {
            n,
            ml,
            mu,
            data: vec![T::zero(); rows * n],
        }
    }

    #[inline]
    fn rows(&self) -> usize {
        2 * self.ml + self.mu + 1
    }

    #[inline]
    fn idx(&self, storage_row: usize, col: usize) -> usize {
        debug_assert!(storage_row < self.rows());
        col * self.rows() + storage_row
    }

    #[inline]
    pub fn in_band(&self, i: usize, j: usize) -> bool {
        i + self.mu >= j && j + self.ml >= i
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        debug_assert!(self.in_band(i, j));
        self.data[self.idx(self.mu + i - j, j)]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        debug_assert!(self.in_band(i, j));
        let at = self.idx(self.mu + i - j, j);
        self.data[at] = value;
    }

    /// Column indices of the in-band slice of row `i`.
    pub fn row_range(&self, i: usize) -> core::ops::Range<usize> {
        i.saturating_sub(self.ml)..(i + self.mu + 1).min(self.n)
    }

    /// Row indices of the in-band slice of column `j`.
    pub fn col_range(&self, j: usize) -> core::ops::Range<usize> {
        j.saturating_sub(self.mu)..(j + self.ml + 1).min(self.n)
    }

    pub fn zero(&mut self) {
        self.data.fill(T::zero());
    }
}

/// Jacobian storage, dense or banded.
pub(crate) enum JacStorage<T> {
    Dense(Mat<T>),
    Banded(BandMat<T>),
}

impl<T: Real> JacStorage<T> {
    pub fn new(n: usize, storage: Storage) -> Self {
        match storage {
            Storage::Dense => JacStorage::Dense(Mat::zeros(n, n)),
            Storage::Banded { lower, upper } => JacStorage::Banded(BandMat::new(n, lower, upper)),
        }
    }

    pub fn zero(&mut self) {
        match self {
            JacStorage::Dense(a) => a.fill(T::zero()),
            JacStorage::Banded(a) => a.zero(),
        }
    }

    pub fn view(&mut self) -> JacobianMut<'_, T> {
        JacobianMut { storage: self }
    }

    /// Scale row `i` by `factor` (in-band slice only for band storage).
    pub fn scale_row(&mut self, i: usize, factor: T) {
        match self {
            JacStorage::Dense(a) => {
                for j in 0..a.ncols() {
                    a[(i, j)] = a[(i, j)] * factor;
                }
            }
            JacStorage::Banded(a) => {
                for j in a.row_range(i) {
                    a.set(i, j, a.get(i, j) * factor);
                }
            }
        }
    }

    /// Scale column `j` by `factor`.
    pub fn scale_col(&mut self, j: usize, factor: T) {
        match self {
            JacStorage::Dense(a) => {
                for i in 0..a.nrows() {
                    a[(i, j)] = a[(i, j)] * factor;
                }
            }
            JacStorage::Banded(a) => {
                for i in a.col_range(j) {
                    a.set(i, j, a.get(i, j) * factor);
                }
            }
        }
    }

    /// Bandwidths `(lower, upper)` for band storage.
    pub fn bandwidths(&self) -> Option<(usize, usize)> {
        match self {
            JacStorage::Dense(_) => None,
            JacStorage::Banded(a) => Some((a.ml, a.mu)),
        }
    }

    /// Infinity norm of row `i` over the stored entries.
    pub fn row_max_abs(&self, i: usize) -> T {
        match self {
            JacStorage::Dense(a) => {
                let mut max = T::zero();
                for j in 0..a.ncols() {
                    max = max.max(a[(i, j)].abs());
                }
                max
            }
            JacStorage::Banded(a) => {
                let mut max = T::zero();
                for j in a.row_range(i) {
                    max = max.max(a.get(i, j).abs());
                }
                max
            }
        }
    }
}

/// Mutable fill view handed to Jacobian callbacks and the finite-difference
/// kernels. Writing a structural zero outside the band is ignored.
pub struct JacobianMut<'a, T> {
    storage: &'a mut JacStorage<T>,
}

impl<T: Real> JacobianMut<'_, T> {
    pub fn nrows(&self) -> usize {
        match &*self.storage {
            JacStorage::Dense(a) => a.nrows(),
            JacStorage::Banded(a) => a.n,
        }
    }

    /// Bandwidths `(lower, upper)` for band storage.
    pub fn bandwidths(&self) -> Option<(usize, usize)> {
        match &*self.storage {
            JacStorage::Dense(_) => None,
            JacStorage::Banded(a) => Some((a.ml, a.mu)),
        }
    }

    pub fn set(&mut self, i: usize, j: usize, value: T) {
        match self.storage {
            JacStorage::Dense(a) => a[(i, j)] = value,
            JacStorage::Banded(a) => {
                if a.in_band(i, j) {
                    a.set(i, j, value);
                } else {
                    debug_assert!(value.is_zero(), "nonzero entry outside the declared band");
                }
            }
        }
    }
}

/// The factorization could not be completed (exact zero pivot).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Singular;

/// A factorized, scaled Jacobian; solves reuse it across corrector steps and
/// Broyden chains.
pub(crate) enum Factorization<T: Real> {
    Dense(FullPivLu<T>),
    Banded(BandLu<T>),
}

impl<T: Real> Factorization<T> {
    pub fn factor(jac: &JacStorage<T>) -> Result<Self, Singular> {
        match jac {
            JacStorage::Dense(a) => Ok(Factorization::Dense(a.full_piv_lu())),
            JacStorage::Banded(a) => BandLu::factor(a).map(Factorization::Banded),
        }
    }

    pub fn solve_in_place(&self, b: &mut [T]) {
        match self {
            Factorization::Dense(lu) => {
                let n = b.len();
                let mut rhs = MatMut::from_column_major_slice_mut(b, n, 1);
                let solution = lu.solve(rhs.as_ref());
                rhs.copy_from(&solution);
            }
            Factorization::Banded(lu) => lu.solve_in_place(b),
        }
    }
}

/// In-place banded LU with partial pivoting.
pub(crate) struct BandLu<T> {
    n: usize,
    ml: usize,
    mu: usize,
    data: Vec<T>,
    ipvt: Vec<usize>,
}

impl<T: Real> BandLu<T> {
    /// Diagonal storage row after the factorization shift.
    #[inline]
    fn diag(&self) -> usize {
        self.ml + self.mu
    }

    #[inline]
    fn idx(&self, storage_row: usize, col: usize) -> usize {
        col * (2 * self.ml + self.mu + 1) + storage_row
    }

    fn factor(band: &BandMat<T>) -> Result<Self, Singular> {
        let (n, ml, mu) = (band.n, band.ml, band.mu);
        let mut lu = Self {
            n,
            ml,
            mu,
            data: band.data.clone(),
            ipvt: vec![0; n],
        };

        // Shift the working band down by ml rows; the vacated rows become
        // fill-in space for the pivoted upper band.
        for j in 0..n {
            for r in (0..=ml + mu).rev() {
                let v = lu.data[lu.idx(r, j)];
                let to = lu.idx(r + ml, j);
                lu.data[to] = v;
            }
            for r in 0..ml {
                let at = lu.idx(r, j);
                lu.data[at] = T::zero();
            }
        }

        let d = lu.diag();
        let mut ju = 0usize;
        for k in 0..n.saturating_sub(1) {
            let lm = ml.min(n - 1 - k);

            // Partial pivoting over the column slice below the diagonal.
            let mut l = d;
            let mut amax = lu.data[lu.idx(d, k)].abs();
            for r in d + 1..=d + lm {
                let v = lu.data[lu.idx(r, k)].abs();
                if v > amax {
                    amax = v;
                    l = r;
                }
            }
            lu.ipvt[k] = l - d + k;
            if lu.data[lu.idx(l, k)].is_zero() {
                return Err(Singular);
            }
            if l != d {
                let (il, id) = (lu.idx(l, k), lu.idx(d, k));
                lu.data.swap(il, id);
            }

            let t = -lu.data[lu.idx(d, k)].recip();
            for r in d + 1..=d + lm {
                let at = lu.idx(r, k);
                lu.data[at] = lu.data[at] * t;
            }

            ju = ju.max(mu + lu.ipvt[k] + 1).min(n);
            let mut lrow = l;
            let mut mm = d;
            for j in k + 1..ju {
                lrow -= 1;
                mm -= 1;
                let t = lu.data[lu.idx(lrow, j)];
                if lrow != mm {
                    let mv = lu.data[lu.idx(mm, j)];
                    let at = lu.idx(lrow, j);
                    lu.data[at] = mv;
                    let at = lu.idx(mm, j);
                    lu.data[at] = t;
                }
                for r in 1..=lm {
                    let at = lu.idx(mm + r, j);
                    lu.data[at] = lu.data[at] + t * lu.data[lu.idx(d + r, k)];
                }
            }
        }
        lu.ipvt[n - 1] = n - 1;
        if lu.data[lu.idx(d, n - 1)].is_zero() {
            return Err(Singular);
        }
        Ok(lu)
    }

    fn solve_in_place(&self, b: &mut [T]) {
        let (n, ml, d) = (self.n, self.ml, self.diag());

        // Forward: apply the stored multipliers and row interchanges.
        if ml > 0 {
            for k in 0..n.saturating_sub(1) {
                let lm = ml.min(n - 1 - k);
                let l = self.ipvt[k];
                let t = b[l];
                if l != k {
                    b[l] = b[k];
                    b[k] = t;
                }
                for r in 1..=lm {
                    b[k + r] = b[k + r] + t * self.data[self.idx(d + r, k)];
                }
            }
        }

        // Back substitution on the (widened) upper band.
        for k in (0..n).rev() {
            b[k] = b[k] / self.data[self.idx(d, k)];
            let lm = k.min(d);
            let t = -b[k];
            for r in 0..lm {
                b[k - lm + r] = b[k - lm + r] + t * self.data[self.idx(d - lm + r, k)];
            }
        }
    }
}
