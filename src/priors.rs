//! A module for prior models used as the mean of the GP model.
//!
//! A prior gives the mean value of an observation followed by the mean of
//! its derivative components. The following priors are implemented:
//! * zero,
//! * constant, optionally updated from the training data.

use crate::errors::{GpError, Result};
use crate::kernels::Observation;
use crate::utils::{cho_solve, tiled_prior_mean};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use std::fmt;

/// A trait for prior mean models used in GP regression
pub trait Prior<F: Float>: Clone + Default + fmt::Debug + fmt::Display + Sync {
    /// Mean value followed by its `D` derivatives computed at `probe`,
    /// a point of dimension `D`. Returns a (1 + D,) vector.
    fn prior(&self, probe: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F>;

    /// Whether the prior is refitted from the data at each training
    fn use_update(&self) -> bool {
        false
    }

    /// Refit the prior given training observations `xt`, targets `yt`
    /// and the lower Cholesky factor `l` of the regularized kernel matrix.
    fn update<X: Observation>(
        &mut self,
        _xt: &[X],
        _yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
        _l: &Array2<F>,
    ) -> Result<()> {
        Ok(())
    }
}

/// A null function as mean of the GP
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ZeroPrior();

impl<F: Float> Prior<F> for ZeroPrior {
    fn prior(&self, probe: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        Array1::zeros(probe.len() + 1)
    }
}

impl fmt::Display for ZeroPrior {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ZeroPrior")
    }
}

/// A constant function as mean of the GP.
///
/// When updated, the constant is set to the value maximizing the marginal likelihood:
/// `c = (u^T.K^-1.y) / (u^T.K^-1.u)` where `u` is the mean of the unit constant prior.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantPrior<F: Float> {
    constant: F,
    use_update: bool,
}

impl<F: Float> Default for ConstantPrior<F> {
    fn default() -> Self {
        ConstantPrior::new(F::zero())
    }
}

impl<F: Float> ConstantPrior<F> {
    /// Constructor of a fixed constant prior
    pub fn new(constant: F) -> Self {
        ConstantPrior {
            constant,
            use_update: false,
        }
    }

    /// Enable or disable the constant refit at each training
    pub fn with_update(mut self, use_update: bool) -> Self {
        self.use_update = use_update;
        self
    }

    /// Current constant value
    pub fn constant(&self) -> F {
        self.constant
    }

    /// Set constant value
    pub fn set_constant(&mut self, constant: F) {
        self.constant = constant;
    }
}

impl<F: Float> Prior<F> for ConstantPrior<F> {
    fn prior(&self, probe: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let mut mean = Array1::zeros(probe.len() + 1);
        mean[0] = self.constant;
        mean
    }

    fn use_update(&self) -> bool {
        self.use_update
    }

    fn update<X: Observation>(
        &mut self,
        xt: &[X],
        yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
        l: &Array2<F>,
    ) -> Result<()> {
        let n_derivatives = yt.ncols().saturating_sub(1);
        let u = tiled_prior_mean(&ConstantPrior::new(F::one()), xt.len(), n_derivatives)?;
        if u.len() != l.nrows() {
            return Err(GpError::ShapeError(format!(
                "{} targets for a kernel matrix of size {}",
                u.len(),
                l.nrows()
            )));
        }
        let w = cho_solve(l, &u)?;
        let y = yt.iter().copied().collect::<Array1<F>>();
        let denom = w.dot(&u);
        if denom == F::zero() {
            return Err(GpError::InvalidValueError(
                "constant prior cannot be updated: null normalization factor".to_string(),
            ));
        }
        self.constant = w.dot(&y) / denom;
        Ok(())
    }
}

impl<F: Float> fmt::Display for ConstantPrior<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConstantPrior({})", self.constant)
    }
}
