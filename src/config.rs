//! Solver configuration and the derived per-solve parameter set.

use log::warn;
use num_traits::Float;

use crate::{MachineConsts, Real, SolverError};

/// Problem class; selects the damping defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProblemClass {
    /// `F` is linear; the solve finishes in one full step.
    Linear,
    /// Mildly nonlinear; full initial step.
    MildlyNonlinear,
    /// Highly nonlinear; cautious initial damping.
    HighlyNonlinear,
    /// Extremely nonlinear; very small initial damping, bounded damping on
    /// by default.
    ExtremelyNonlinear,
}

/// Where the Jacobian comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JacobianMode {
    /// The problem supplies an analytic Jacobian.
    Analytic,
    /// Plain forward differences with a fixed relative perturbation.
    ForwardDiff,
    /// Forward differences with feedback-controlled per-component
    /// denominator differences.
    AdaptiveDiff,
}

/// Jacobian storage mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Storage {
    Dense,
    /// Band matrix with `lower` subdiagonals and `upper` superdiagonals.
    Banded { lower: usize, upper: usize },
}

impl Storage {
    pub(crate) fn working_bandwidth(&self) -> Option<usize> {
        match *self {
            Storage::Dense => None,
            Storage::Banded { lower, upper } => Some(lower + upper + 1),
        }
    }
}

/// Bounded-damping strategy: restrict the damping factor to a multiplicative
/// window around its previous value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundedDamping {
    /// On exactly for [`ProblemClass::ExtremelyNonlinear`].
    Auto,
    On,
    Off,
}

/// Configuration for a damped Newton solve.
///
/// `None` fields fall back to defaults derived from the problem class, the
/// storage mode and the rank-1 setting; see the builder methods for the
/// exact values.
#[derive(Clone, Copy, Debug)]
pub struct NewtonCfg<T> {
    /// Relative tolerance on the scaled correction norm.
    pub rtol: T,
    pub class: ProblemClass,
    pub jacobian: JacobianMode,
    pub storage: Storage,
    /// Enable rank-1 (Broyden) continuation of a factorized Jacobian.
    pub rank1: bool,
    /// Maximum consecutive rank-1 steps. Default: `max(ml + mu + 1, 10)`
    /// banded, `min(n, 10)` dense.
    pub max_broyden: Option<usize>,
    /// Ordinary (undamped) Newton: damping factor pinned to 1, no
    /// monotonicity test.
    pub ordinary: bool,
    /// Simplified Newton: factorize once, reuse the factorization for every
    /// step. Implies `ordinary` and disables rank-1 updates.
    pub simplified: bool,
    pub bounded: BoundedDamping,
    /// Bounding factor for bounded damping. Default 10.
    pub fc_band: T,
    /// Initial damping factor. Defaults per class: 1, 1, 1e-2, 1e-4.
    pub fc_start: Option<T>,
    /// Minimum damping factor. Default 1e-4, or 1e-8 for the extremely
    /// nonlinear class.
    pub fc_min: Option<T>,
    /// Rank-1 decision threshold. Default 3 when `rank1`, else `10 / fc_min`.
    pub sigma: Option<T>,
    /// Corrector-increase threshold. Default `10 / fc_min`.
    pub sigma2: Option<T>,
    /// Iterations per `solve` call.
    pub max_iter: usize,
    /// Equilibrate the Jacobian rows before factorizing.
    pub row_scaling: bool,
    /// Take the user scaling vector verbatim instead of deriving the scale
    /// from the iterates.
    pub fixed_scale: bool,
    /// Successive-call mode: keep the iteration state across `solve` calls
    /// so a run can be continued in chunks of `max_iter` iterations.
    pub successive: bool,
}

impl<T: Float> Default for NewtonCfg<T> {
    fn default() -> Self {
        Self {
            rtol: T::from(1e-8).expect("type must represent the default tolerance"),
            class: ProblemClass::MildlyNonlinear,
            jacobian: JacobianMode::ForwardDiff,
            storage: Storage::Dense,
            rank1: false,
            max_broyden: None,
            ordinary: false,
            simplified: false,
            bounded: BoundedDamping::Auto,
            fc_band: T::from(10.0).expect("type must represent the bounding factor"),
            fc_start: None,
            fc_min: None,
            sigma: None,
            sigma2: None,
            max_iter: 50,
            row_scaling: true,
            fixed_scale: false,
            successive: false,
        }
    }
}

impl<T: Float> NewtonCfg<T> {
    pub fn with_rtol(mut self, rtol: T) -> Self {
        self.rtol = rtol;
        self
    }
    pub fn with_class(mut self, class: ProblemClass) -> Self {
        self.class = class;
        self
    }
    pub fn with_jacobian(mut self, mode: JacobianMode) -> Self {
        self.jacobian = mode;
        self
    }
    pub fn banded(mut self, lower: usize, upper: usize) -> Self {
        self.storage = Storage::Banded { lower, upper };
        self
    }
    pub fn with_rank1(mut self, enabled: bool) -> Self {
        self.rank1 = enabled;
        self
    }
    pub fn with_max_broyden(mut self, n: usize) -> Self {
        self.max_broyden = Some(n);
        self
    }
    pub fn ordinary_newton(mut self) -> Self {
        self.ordinary = true;
        self
    }
    pub fn simplified_newton(mut self) -> Self {
        self.simplified = true;
        self
    }
    pub fn with_bounded(mut self, bounded: BoundedDamping) -> Self {
        self.bounded = bounded;
        self
    }
    pub fn with_fc_start(mut self, fc: T) -> Self {
        self.fc_start = Some(fc);
        self
    }
    pub fn with_fc_min(mut self, fc: T) -> Self {
        self.fc_min = Some(fc);
        self
    }
    pub fn with_max_iter(mut self, n: usize) -> Self {
        self.max_iter = n;
        self
    }
    pub fn without_row_scaling(mut self) -> Self {
        self.row_scaling = false;
        self
    }
    pub fn with_fixed_scale(mut self, fixed: bool) -> Self {
        self.fixed_scale = fixed;
        self
    }
    pub fn with_successive(mut self, successive: bool) -> Self {
        self.successive = successive;
        self
    }
}

/// Fully resolved parameters: defaults applied, ranges enforced.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Params<T> {
    pub rtol: T,
    pub class: ProblemClass,
    pub jacobian: JacobianMode,
    pub storage: Storage,
    pub rank1: bool,
    pub nbroy: usize,
    pub ordinary: bool,
    pub simplified: bool,
    /// Damping machinery active at all.
    pub damped: bool,
    pub bounded: bool,
    pub fc_band: T,
    pub fc_start: T,
    pub fc_min: T,
    pub sigma: T,
    pub sigma2: T,
    pub max_iter: usize,
    pub row_scaling: bool,
    pub fixed_scale: bool,
    pub successive: bool,
}

impl<T: Real> Params<T> {
    pub(crate) fn resolve(
        cfg: &NewtonCfg<T>,
        n: usize,
        machine: &MachineConsts<T>,
    ) -> Result<Self, SolverError> {
        if n == 0 {
            return Err(SolverError::EmptySystem);
        }
        if let Storage::Banded { lower, upper } = cfg.storage {
            if lower >= n || upper >= n {
                return Err(SolverError::InvalidBandwidth);
            }
        }

        if !(cfg.rtol > T::zero()) {
            return Err(SolverError::InvalidTolerance);
        }
        let ten = T::from(10.0).expect("small integer constant");
        let rtol_floor = ten * machine.eps * T::from(n).expect("dimension as scalar");
        let rtol_ceil = T::from(0.1).expect("small constant");
        let mut rtol = cfg.rtol;
        if rtol < rtol_floor {
            warn!("rtol raised to the smallest meaningful value for this dimension");
            rtol = rtol_floor;
        } else if rtol > rtol_ceil {
            warn!("rtol lowered to 0.1, larger values are not meaningful");
            rtol = rtol_ceil;
        }

        let simplified = cfg.simplified;
        let ordinary = cfg.ordinary || simplified;
        let rank1 = cfg.rank1 && !ordinary;

        let one = T::one();
        let fc_min = cfg.fc_min.unwrap_or_else(|| {
            let fc = if cfg.class == ProblemClass::ExtremelyNonlinear {
                1e-8
            } else {
                1e-4
            };
            T::from(fc).expect("default minimum damping")
        });
        let fc_min = fc_min.max(machine.small).min(one);

        let fc_start = cfg.fc_start.unwrap_or_else(|| {
            let fc = match cfg.class {
                ProblemClass::Linear | ProblemClass::MildlyNonlinear => 1.0,
                ProblemClass::HighlyNonlinear => 1e-2,
                ProblemClass::ExtremelyNonlinear => 1e-4,
            };
            T::from(fc).expect("default initial damping")
        });
        let fc_start = if ordinary {
            one
        } else {
            fc_start.max(fc_min).min(one)
        };

        let sigma_guard = ten / fc_min;
        let sigma = if rank1 {
            cfg.sigma
                .unwrap_or_else(|| T::from(3.0).expect("default rank-1 threshold"))
                .max(one)
        } else {
            sigma_guard
        };
        let sigma2 = cfg.sigma2.unwrap_or(sigma_guard).max(one);

        let nbroy = if rank1 {
            let default = match cfg.storage {
                Storage::Dense => n.min(10),
                Storage::Banded { lower, upper } => (lower + upper + 1).max(10),
            };
            cfg.max_broyden.unwrap_or(default).max(1)
        } else {
            0
        };

        let bounded = !ordinary
            && match cfg.bounded {
                BoundedDamping::Auto => cfg.class == ProblemClass::ExtremelyNonlinear,
                BoundedDamping::On => true,
                BoundedDamping::Off => false,
            };

        Ok(Self {
            rtol,
            class: cfg.class,
            jacobian: cfg.jacobian,
            storage: cfg.storage,
            rank1,
            nbroy,
            ordinary,
            simplified,
            damped: !ordinary && cfg.class != ProblemClass::Linear,
            bounded,
            fc_band: cfg.fc_band.max(one),
            fc_start,
            fc_min,
            sigma,
            sigma2,
            max_iter: cfg.max_iter.max(1),
            row_scaling: cfg.row_scaling,
            fixed_scale: cfg.fixed_scale,
            successive: cfg.successive,
        })
    }
}
