//! Solve outcomes, counters, per-iteration history, and the monitor seam.

/// Terminal (or resumable) outcome of a solve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Scaled correction RMS fell below the tolerance.
    Converged,
    /// The iteration batch is exhausted in successive-call mode; call
    /// `solve` again to continue.
    Pending,
    /// Reached the iteration limit without converging.
    IterationLimit,
    /// The damping factor fell to its minimum and the step still grew the
    /// natural level.
    DampingTooSmall,
    /// Singular Jacobian: the factorization failed or produced a
    /// non-finite correction.
    SingularJacobian,
    /// The corrector could not restore monotonicity within its retry
    /// budget.
    NonMonotone,
    /// A user callback reported failure.
    EvalFailed,
    /// The monitor callback cancelled the solve.
    Cancelled,
}

impl SolveStatus {
    pub fn converged(&self) -> bool {
        matches!(self, SolveStatus::Converged)
    }

    /// Whether the state survives for a successive call.
    pub fn resumable(&self) -> bool {
        matches!(self, SolveStatus::Pending)
    }
}

/// Append-only per-iteration history, one entry per accepted step. Vectors
/// are pre-allocated for the iteration budget so recording never reallocates
/// mid-step.
#[derive(Debug, Clone)]
pub struct History<T> {
    /// Accepted iterates, starting with the initial guess.
    pub iterates: Vec<Vec<T>>,
    /// Scaled natural level `sum(dx1^2)` of the ordinary correction.
    pub natural_level: Vec<T>,
    /// Scaled natural level of the accepted simplified correction.
    pub simplified_level: Vec<T>,
    /// Standard level `||F||_2 / sqrt(n)`.
    pub standard_level: Vec<T>,
    /// Achieved scaled correction RMS.
    pub precision: Vec<T>,
    /// Accepted damping factor.
    pub damping: Vec<T>,
}

impl<T> History<T> {
    pub(crate) fn with_capacity(iters: usize) -> Self {
        Self {
            iterates: Vec::with_capacity(iters + 1),
            natural_level: Vec::with_capacity(iters + 1),
            simplified_level: Vec::with_capacity(iters + 1),
            standard_level: Vec::with_capacity(iters + 1),
            precision: Vec::with_capacity(iters + 1),
            damping: Vec::with_capacity(iters + 1),
        }
    }
}

/// Summary of a solve call: outcome, work counters, and history.
#[derive(Debug, Clone)]
pub struct SolveStats<T> {
    pub status: SolveStatus,
    /// Scaled correction RMS of the last recorded step; at most `rtol` on
    /// convergence.
    pub achieved_tol: T,
    /// Final scaling vector.
    pub scale: Vec<T>,
    /// Accepted Newton steps.
    pub iterations: usize,
    /// Rejected corrector trials (damping reductions and increases).
    pub corrector_steps: usize,
    /// Residual evaluations, excluding differencing.
    pub fcn_evals: usize,
    /// Residual evaluations spent on difference approximations.
    pub fcn_evals_jac: usize,
    /// Jacobian builds (analytic or difference sweeps).
    pub jac_evals: usize,
    /// Rejected rank-1 steps.
    pub rank1_rejected: usize,
    /// Length of the rank-1 chain at return.
    pub rank1_chain: usize,
    pub history: History<T>,
}

/// Per-iteration record handed to the monitor callback.
#[derive(Debug, Clone, Copy)]
pub struct IterationStats<T> {
    /// Iteration number of the step just accepted, starting at 1.
    pub iter: usize,
    /// Scaled correction RMS of the ordinary correction.
    pub normdx: T,
    /// Scaled natural level of the ordinary correction.
    pub natural_level: T,
    /// Standard level `||F||_2 / sqrt(n)` at the previous iterate.
    pub standard_level: T,
    /// Damping factor the step was accepted with.
    pub damping: T,
    /// Corrector trials this iteration needed.
    pub corrector_steps: usize,
    /// Current rank-1 chain length.
    pub broyden_len: usize,
}

/// Monitor verdict; `Cancel` stops the solve between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Cancel,
}
