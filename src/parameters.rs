use crate::algorithm::GaussianProcess;
use crate::errors::{GpError, Result};
use crate::hyperparameters::Hyperparameters;
use crate::kernels::KernelModel;
use crate::priors::Prior;
use crate::{GP_OPTIM_MAX_EVAL, GP_OPTIM_MIN_EVAL};
use linfa::{Float, ParamGuard};

/// A set of validated GP parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct GpValidParams<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> {
    /// Prior model giving the mean of values and derivatives
    pub(crate) prior: Mean,
    /// Kernel used as prior covariance
    pub(crate) kernel: Kern,
    /// Regularization level of the kernel matrix diagonal
    pub(crate) noise: F,
    /// Ratio between value and derivative regularizations
    pub(crate) noisefactor: F,
    /// Hyperparameters overriding the kernel defaults
    pub(crate) hyperparameters: Hyperparameters<F>,
}

impl<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> Default for GpValidParams<F, Mean, Kern> {
    fn default() -> GpValidParams<F, Mean, Kern> {
        GpValidParams {
            prior: Mean::default(),
            kernel: Kern::default(),
            noise: F::cast(GpValidParams::<F, Mean, Kern>::DEFAULT_NOISE),
            noisefactor: F::cast(GpValidParams::<F, Mean, Kern>::DEFAULT_NOISEFACTOR),
            hyperparameters: Hyperparameters::new(),
        }
    }
}

impl<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> GpValidParams<F, Mean, Kern> {
    /// Default regularization level
    pub const DEFAULT_NOISE: f64 = 5e-3;
    /// Default ratio between value and derivative regularizations
    pub const DEFAULT_NOISEFACTOR: f64 = 0.5;

    /// Get prior model
    pub fn prior(&self) -> &Mean {
        &self.prior
    }

    /// Get kernel
    pub fn kernel(&self) -> &Kern {
        &self.kernel
    }

    /// Get regularization level
    pub fn noise(&self) -> F {
        self.noise
    }

    /// Get ratio between value and derivative regularizations
    pub fn noisefactor(&self) -> F {
        self.noisefactor
    }

    /// Get user specified hyperparameters (kernel defaults not included)
    pub fn hyperparameters(&self) -> &Hyperparameters<F> {
        &self.hyperparameters
    }

    /// Kernel default hyperparameters overridden by the user specified ones
    pub fn initial_hyperparameters(&self) -> Result<Hyperparameters<F>> {
        self.kernel
            .set_params(&self.kernel.default_hyperparameters(), &self.hyperparameters)
    }

    /// Create an untrained GP from these parameters
    pub fn build(&self) -> Result<GaussianProcess<F, Mean, Kern>> {
        GaussianProcess::from_valid_params(self)
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified to build a
/// [GP regression](struct.GaussianProcess.html).
pub struct GpParams<F: Float, Mean: Prior<F>, Kern: KernelModel<F>>(GpValidParams<F, Mean, Kern>);

impl<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> GpParams<F, Mean, Kern> {
    /// A constructor for GP parameters given prior and kernel models
    pub fn new(prior: Mean, kernel: Kern) -> GpParams<F, Mean, Kern> {
        Self(GpValidParams {
            prior,
            kernel,
            ..Default::default()
        })
    }

    /// A constructor for GP parameters from validated parameters
    pub fn new_from_valid(params: &GpValidParams<F, Mean, Kern>) -> Self {
        Self(params.clone())
    }

    /// Set prior model.
    pub fn prior(mut self, prior: Mean) -> Self {
        self.0.prior = prior;
        self
    }

    /// Set kernel.
    pub fn kernel(mut self, kernel: Kern) -> Self {
        self.0.kernel = kernel;
        self
    }

    /// Set regularization level.
    ///
    /// Value rows are regularized with `noise * noisefactor`, derivative rows with `noise`.
    pub fn noise(mut self, noise: F) -> Self {
        self.0.noise = noise;
        self
    }

    /// Set ratio between value and derivative regularizations.
    pub fn noisefactor(mut self, noisefactor: F) -> Self {
        self.0.noisefactor = noisefactor;
        self
    }

    /// Set hyperparameters values, the ones not given keep the kernel defaults
    pub fn hyperparameters(mut self, hyperparameters: Hyperparameters<F>) -> Self {
        self.0.hyperparameters.merge(&hyperparameters);
        self
    }

    /// Check parameters and create an untrained GP
    pub fn build(self) -> Result<GaussianProcess<F, Mean, Kern>> {
        self.check_ref()?.build()
    }
}

impl<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> From<GpValidParams<F, Mean, Kern>>
    for GpParams<F, Mean, Kern>
{
    fn from(valid: GpValidParams<F, Mean, Kern>) -> Self {
        GpParams(valid)
    }
}

impl<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> ParamGuard for GpParams<F, Mean, Kern> {
    type Checked = GpValidParams<F, Mean, Kern>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !(self.0.noise > F::zero()) {
            return Err(GpError::InvalidValueError(format!(
                "`noise` should be strictly positive, got {}",
                self.0.noise
            )));
        }
        if !(self.0.noisefactor > F::zero()) {
            return Err(GpError::InvalidValueError(format!(
                "`noisefactor` should be strictly positive, got {}",
                self.0.noisefactor
            )));
        }
        let hyperparameters = self.0.initial_hyperparameters()?;
        if hyperparameters.weight()? == F::zero() {
            return Err(GpError::InvalidValueError(
                "kernel `weight` cannot be 0".to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Minimizer used to fit hyperparameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HyperOptAlgorithm {
    /// Bounded quasi-Newton SQP method with BFGS updates, gradients are computed by finite differences
    #[default]
    Slsqp,
    /// Derivative-free linear approximations method
    Cobyla,
}

/// Parameters of the hyperparameters fitting
/// (see [`GaussianProcess::fit_hyperparameters_with`]).
#[derive(Clone, Debug, PartialEq)]
pub struct HyperOptParams<F: Float> {
    /// Gradient tolerance, the function tolerance being 1% of it
    pub(crate) tol: F,
    /// Optional (lower, upper) bounds, one pair per fitted hyperparameter
    pub(crate) bounds: Option<Vec<(F, F)>>,
    /// Max number of likelihood evaluations
    pub(crate) max_eval: usize,
    pub(crate) algorithm: HyperOptAlgorithm,
}

impl<F: Float> Default for HyperOptParams<F> {
    fn default() -> Self {
        HyperOptParams {
            tol: F::cast(HyperOptParams::<F>::DEFAULT_TOL),
            bounds: None,
            max_eval: GP_OPTIM_MAX_EVAL,
            algorithm: HyperOptAlgorithm::default(),
        }
    }
}

impl<F: Float> HyperOptParams<F> {
    /// Default gradient tolerance
    pub const DEFAULT_TOL: f64 = 1e-2;

    /// Fitting parameters with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set gradient tolerance
    pub fn tol(mut self, tol: F) -> Self {
        self.tol = tol;
        self
    }

    /// Set (lower, upper) bounds, one pair per fitted hyperparameter
    pub fn bounds(mut self, bounds: Option<Vec<(F, F)>>) -> Self {
        self.bounds = bounds;
        self
    }

    /// Set the max number of likelihood evaluations.
    /// Given max_eval has to be greater than [crate::GP_OPTIM_MIN_EVAL] otherwise
    /// max_eval is set to [crate::GP_OPTIM_MIN_EVAL].
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.max_eval = GP_OPTIM_MIN_EVAL.max(max_eval);
        self
    }

    /// Set minimizer
    pub fn algorithm(mut self, algorithm: HyperOptAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Get gradient tolerance
    pub fn get_tol(&self) -> F {
        self.tol
    }

    /// Get bounds
    pub fn get_bounds(&self) -> Option<&[(F, F)]> {
        self.bounds.as_deref()
    }

    /// Get the max number of likelihood evaluations
    pub fn get_max_eval(&self) -> usize {
        self.max_eval
    }

    /// Get minimizer
    pub fn get_algorithm(&self) -> HyperOptAlgorithm {
        self.algorithm
    }

    /// Check fitting parameters against the `n_params` fitted hyperparameters
    pub(crate) fn check(&self, n_params: usize) -> Result<()> {
        if !(self.tol > F::zero()) {
            return Err(GpError::InvalidValueError(format!(
                "`tol` should be strictly positive, got {}",
                self.tol
            )));
        }
        if let Some(bounds) = &self.bounds {
            if bounds.len() != n_params {
                return Err(GpError::InvalidValueError(format!(
                    "{} bounds given for {} hyperparameters",
                    bounds.len(),
                    n_params
                )));
            }
            if let Some((lo, up)) = bounds.iter().find(|(lo, up)| !(lo <= up)) {
                return Err(GpError::InvalidValueError(format!(
                    "bad bounds ({lo}, {up}): lower bound should be less than upper bound"
                )));
            }
        }
        Ok(())
    }
}
