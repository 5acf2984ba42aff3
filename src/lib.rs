#![doc = include_str!("../README.md")]

mod broyden;
mod config;
mod jacobian;
mod linalg;
mod report;
mod scaling;
mod solver;

pub use config::{BoundedDamping, JacobianMode, NewtonCfg, ProblemClass, Storage};
pub use linalg::JacobianMut;
pub use report::{Control, History, IterationStats, SolveStats, SolveStatus};
pub use solver::{solve, solve_with_monitor, DampedNewton};

use core::fmt::{self, Display, Formatter};
use faer_traits::ComplexField;
use num_traits::Float;

/// Scalar type the solver is generic over: a real floating-point field that
/// faer can factorize and whose safe magnitude window is known.
pub trait Real: Float + FloatBounds + ComplexField<Real = Self> {}

impl<T: Float + FloatBounds + ComplexField<Real = T>> Real for T {}

/// Safe magnitude window of a floating-point type.
///
/// `small_magnitude` is the smallest value whose reciprocal is still finite
/// with headroom for the scaled divisions the solver performs; its reciprocal
/// is the largest safe magnitude.
pub trait FloatBounds: Float {
    fn small_magnitude() -> Self;
}

impl FloatBounds for f64 {
    fn small_magnitude() -> Self {
        1.0e-35
    }
}

impl FloatBounds for f32 {
    fn small_magnitude() -> Self {
        1.0e-17
    }
}

/// Machine constants the iteration reasons with.
#[derive(Clone, Copy, Debug)]
pub struct MachineConsts<T> {
    /// Machine epsilon.
    pub eps: T,
    /// Smallest safe magnitude; scaling entries never drop below this.
    pub small: T,
    /// Largest safe magnitude, `1 / small`.
    pub great: T,
}

impl<T: Real> MachineConsts<T> {
    pub fn new() -> Self {
        let small = T::small_magnitude();
        Self {
            eps: T::epsilon(),
            small,
            great: small.recip(),
        }
    }
}

impl<T: Real> Default for MachineConsts<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A system of `n` nonlinear equations in `n` unknowns.
///
/// `residual` fills `f` with `F(x)`; a failing evaluation (out of domain,
/// overflow in user code) is reported through `Err(EvalFailure)` and aborts
/// the solve. `jacobian` is only consulted when the configuration selects
/// [`JacobianMode::Analytic`]; implementors must also override
/// `has_jacobian` to return `true` so the request can be validated up front.
pub trait Problem<T> {
    fn residual(&mut self, x: &[T], f: &mut [T]) -> Result<(), EvalFailure>;

    fn jacobian(&mut self, x: &[T], jac: &mut JacobianMut<'_, T>) -> Result<(), EvalFailure> {
        let _ = (x, jac);
        Err(EvalFailure)
    }

    fn has_jacobian(&self) -> bool {
        false
    }
}

/// A user callback could not be evaluated at the requested point.
#[derive(Clone, Copy, Debug)]
pub struct EvalFailure;

impl Display for EvalFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("user function evaluation failed")
    }
}

impl std::error::Error for EvalFailure {}

/// Rejected inputs, detected before the iteration touches any state.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SolverError {
    /// The system dimension is zero.
    #[error("the system must have at least one equation")]
    EmptySystem,
    /// `x` or the scaling vector does not match the configured dimension.
    #[error("slice of length {actual} does not match dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// The relative tolerance is not positive.
    #[error("the relative tolerance must be positive")]
    InvalidTolerance,
    /// The user scaling vector carries a negative entry.
    #[error("scaling entries must be nonnegative")]
    InvalidScale,
    /// Banded storage with bandwidths that do not fit the dimension.
    #[error("bandwidths must be smaller than the dimension")]
    InvalidBandwidth,
    /// An analytic Jacobian was requested but the problem does not provide one.
    #[error("analytic Jacobian requested but the problem does not provide one")]
    MissingJacobian,
}

/// Problems backed by a residual closure, convenient for tests and small
/// callers that do not want a dedicated type.
pub struct SystemFn<F>(pub F);

impl<T, F> Problem<T> for SystemFn<F>
where
    F: FnMut(&[T], &mut [T]) -> Result<(), EvalFailure>,
{
    fn residual(&mut self, x: &[T], f: &mut [T]) -> Result<(), EvalFailure> {
        (self.0)(x, f)
    }
}

/// Residual plus analytic Jacobian closures.
pub struct SystemWithJac<F, J> {
    pub f: F,
    pub jac: J,
}

impl<T, F, J> Problem<T> for SystemWithJac<F, J>
where
    F: FnMut(&[T], &mut [T]) -> Result<(), EvalFailure>,
    J: FnMut(&[T], &mut JacobianMut<'_, T>) -> Result<(), EvalFailure>,
{
    fn residual(&mut self, x: &[T], f: &mut [T]) -> Result<(), EvalFailure> {
        (self.f)(x, f)
    }

    fn jacobian(&mut self, x: &[T], jac: &mut JacobianMut<'_, T>) -> Result<(), EvalFailure> {
        (self.jac)(x, jac)
    }

    fn has_jacobian(&self) -> bool {
        true
    }
}
