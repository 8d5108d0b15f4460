use crate::errors::{GpError, Result};
use crate::hyperparameters::{Hyperparameters, WEIGHT};
use crate::kernels::{KernelModel, Observation};
use crate::optimization::{
    gradient, optimize_params, projected_gradient, OptimParams, UNBOUNDED,
};
use crate::parameters::{GpParams, GpValidParams, HyperOptParams};
use crate::priors::Prior;
use crate::utils::{cho_solve, flatten, into_f64, regularization, tiled_prior_mean};

use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};

use log::{debug, info, warn};
use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Minimum of likelihood evaluations for hyperparameters fitting
pub const GP_OPTIM_MIN_EVAL: usize = 25;
/// Maximum of likelihood evaluations for hyperparameters fitting
pub const GP_OPTIM_MAX_EVAL: usize = 1000;

/// Internal parameters computed by GP training
/// used later on in prediction computations
#[derive(Debug, Clone)]
pub(crate) struct GpInnerParams<F: Float, X> {
    /// Training inputs
    xt: Vec<X>,
    /// Training targets (n, 1 + D)
    yt: Array2<F>,
    /// Number of derivatives of every training input
    dim: usize,
    /// Prior mean of a single observation (1 + D,)
    prior_mean: Array1<F>,
    /// Residual of the targets wrt the prior mean
    a0: Array1<F>,
    /// GP weights: solution of `(K + diag(r^2)).alpha = a0`
    alpha: Array1<F>,
    /// Cholesky factor of the regularized kernel matrix
    l: Array2<F>,
    /// Hyperparameters used for training
    hyperparameters: Hyperparameters<F>,
    /// Regularization level used for training
    noise: F,
}

/// A GP regression of a scalar function (an energy) observed together
/// with its derivatives (the forces).
///
/// The target is modeled as a gaussian process:
///
/// `Y(x) = m(x) + Z(x)`
///
/// where:
/// * `m(x)` is the prior mean of the value and its derivatives
/// * `Z(x)` a centered gaussian process of covariance `k(x, x')`, the kernel,
///   parameterized by named hyperparameters among which a multiplicative `weight`.
///
/// When the kernel handles derivatives, every observation `x` of derivative dimension `D`
/// contributes `1 + D` rows (value, then derivatives) to the kernel matrix which is
/// regularized by adding `(noise * noisefactor)^2` on value rows and `noise^2` on
/// derivative rows before its Cholesky factorization.
///
/// # Noise ratio
///
/// On the first call to [`GaussianProcess::set_hyperparams`], the ratio `noise / weight`
/// is locked: afterwards the regularization level follows the weight. Use
/// [`GaussianProcess::reset_noise_ratio`] to release it.
///
/// # Example
///
/// ```no_run
/// use forcegp::{kernels::*, priors::*, GaussianProcess};
/// use ndarray::{array, Array1};
///
/// // values and derivatives of f(x) = sin(x)
/// let xt: Vec<Array1<f64>> = vec![array![0.], array![1.], array![2.]];
/// let yt = array![[0f64.sin(), 0f64.cos()], [1f64.sin(), 1f64.cos()], [2f64.sin(), 2f64.cos()]];
///
/// let mut gp = GaussianProcess::<f64, ConstantPrior<f64>, SquaredExponentialGradKernel>::params(
///         ConstantPrior::default().with_update(true),
///         SquaredExponentialGradKernel(),
///     )
///     .noise(1e-3)
///     .build()
///     .expect("GP built");
/// gp.train(&xt, &yt, None).expect("GP trained");
/// gp.fit_hyperparameters(&xt, &yt, &["scale"], Some(&[(0.1, 10.)]), 1e-2)
///     .expect("Hyperparameters fitted");
///
/// let (f, cov) = gp.predict(&array![1.5], true).expect("GP prediction");
///```
#[derive(Debug, Clone)]
pub struct GaussianProcess<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> {
    /// Prior mean model
    prior: Mean,
    /// Prior covariance model
    kernel: Kern,
    /// Current kernel hyperparameters
    hyperparameters: Hyperparameters<F>,
    /// Current regularization level
    noise: F,
    /// Locked `noise / weight` ratio
    noise_ratio: Option<F>,
    /// Ratio between value and derivative regularizations
    noisefactor: F,
    /// Trained state, None when not trained or when training failed
    inner_params: Option<GpInnerParams<F, Kern::Input>>,
}

impl<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> fmt::Display
    for GaussianProcess<F, Mean, Kern>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "GP(prior={}, kernel={}, hyperparameters={}, noise={})",
            self.prior, self.kernel, self.hyperparameters, self.noise,
        )
    }
}

/// Result of the hyperparameters fitting
#[derive(Clone, Debug, PartialEq)]
pub struct HyperFitResult<F: Float> {
    /// Hyperparameters of the model after fitting
    pub hyperparameters: Hyperparameters<F>,
    /// Whether the minimization converged, otherwise the model is left unchanged
    pub converged: bool,
    /// Negative log likelihood at the returned hyperparameters
    pub neg_log_likelihood: F,
}

/// Use of the kernel weight calibration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightCalibration {
    /// Only compute the optimal weight
    Estimate,
    /// Set the optimal weight and retrain
    Update,
}

impl FromStr for WeightCalibration {
    type Err = GpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "estimate" => Ok(WeightCalibration::Estimate),
            "update" => Ok(WeightCalibration::Update),
            _ => Err(GpError::InvalidValueError(format!(
                "weight calibration should be either `estimate` or `update`, got `{s}`"
            ))),
        }
    }
}

impl<F: Float, Mean: Prior<F>, Kern: KernelModel<F>> GaussianProcess<F, Mean, Kern> {
    /// Gp parameters contructor
    pub fn params<NewMean: Prior<F>, NewKern: KernelModel<F>>(
        prior: NewMean,
        kernel: NewKern,
    ) -> GpParams<F, NewMean, NewKern> {
        GpParams::new(prior, kernel)
    }

    /// Untrained GP built from validated parameters, the noise ratio being not locked yet
    pub(crate) fn from_valid_params(params: &GpValidParams<F, Mean, Kern>) -> Result<Self> {
        Ok(GaussianProcess {
            prior: params.prior().clone(),
            kernel: *params.kernel(),
            hyperparameters: params.initial_hyperparameters()?,
            noise: params.noise(),
            noise_ratio: None,
            noisefactor: params.noisefactor(),
            inner_params: None,
        })
    }

    /// Prior mean model
    pub fn prior(&self) -> &Mean {
        &self.prior
    }

    /// Kernel
    pub fn kernel(&self) -> &Kern {
        &self.kernel
    }

    /// Current hyperparameters
    pub fn hyperparameters(&self) -> &Hyperparameters<F> {
        &self.hyperparameters
    }

    /// Current regularization level
    pub fn noise(&self) -> F {
        self.noise
    }

    /// Locked `noise / weight` ratio if any
    pub fn noise_ratio(&self) -> Option<F> {
        self.noise_ratio
    }

    /// Ratio between value and derivative regularizations
    pub fn noisefactor(&self) -> F {
        self.noisefactor
    }

    /// Whether the model holds a valid trained state
    pub fn is_trained(&self) -> bool {
        self.inner_params.is_some()
    }

    fn inner(&self) -> Result<&GpInnerParams<F, Kern::Input>> {
        self.inner_params.as_ref().ok_or(GpError::NotTrained)
    }

    /// GP weights of the trained model
    pub fn weights(&self) -> Result<&Array1<F>> {
        Ok(&self.inner()?.alpha)
    }

    /// Lower Cholesky factor of the regularized kernel matrix of the trained model
    pub fn cholesky_factor(&self) -> Result<&Array2<F>> {
        Ok(&self.inner()?.l)
    }

    /// Training inputs of the trained model
    pub fn training_inputs(&self) -> Result<&[Kern::Input]> {
        Ok(&self.inner()?.xt)
    }

    /// Training targets of the trained model
    pub fn training_targets(&self) -> Result<&Array2<F>> {
        Ok(&self.inner()?.yt)
    }

    /// Hyperparameters and regularization level used by the trained model
    pub fn trained_hyperparameters(&self) -> Result<(&Hyperparameters<F>, F)> {
        let inner = self.inner()?;
        Ok((&inner.hyperparameters, inner.noise))
    }

    /// Set given hyperparameters and regularization level.
    ///
    /// Given names have to be handled by the kernel, otherwise nothing is changed.
    /// On the first call, the `noise / weight` ratio is locked and then `noise`
    /// is always recomputed as `ratio * weight`: the given `noise` is ignored.
    /// The model has to be retrained to take the new values into account.
    pub fn set_hyperparams(&mut self, params: &Hyperparameters<F>, noise: F) -> Result<()> {
        let hyperparameters = self.kernel.set_params(&self.hyperparameters, params)?;
        let weight = hyperparameters.weight()?;
        if weight == F::zero() {
            return Err(GpError::InvalidValueError(
                "kernel `weight` cannot be 0".to_string(),
            ));
        }
        self.hyperparameters = hyperparameters;
        let ratio = *self.noise_ratio.get_or_insert(noise / weight);
        self.noise = ratio * weight;
        Ok(())
    }

    /// Release the `noise / weight` ratio, the next call to
    /// [`GaussianProcess::set_hyperparams`] locks it again.
    pub fn reset_noise_ratio(&mut self) {
        self.noise_ratio = None;
    }

    /// Number of derivatives of the training inputs and number of derivative
    /// components of the targets, after checking inputs and targets shapes
    fn check_training_data(
        &self,
        xt: &[Kern::Input],
        yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(usize, usize)> {
        let Some(first) = xt.first() else {
            return Err(GpError::ShapeError(
                "training requires at least one observation".to_string(),
            ));
        };
        if yt.nrows() != xt.len() {
            return Err(GpError::ShapeError(format!(
                "{} targets given for {} training inputs",
                yt.nrows(),
                xt.len()
            )));
        }
        let dim = first.n_derivatives();
        if let Some(x) = xt.iter().find(|x| x.n_derivatives() != dim) {
            return Err(GpError::ShapeError(format!(
                "training inputs of different dimensions {} and {}",
                dim,
                x.n_derivatives()
            )));
        }
        let n_derivatives = if self.kernel.with_derivatives() { dim } else { 0 };
        if yt.ncols() != 1 + n_derivatives {
            return Err(GpError::ShapeError(format!(
                "targets should have {} columns (value and derivatives), got {}",
                1 + n_derivatives,
                yt.ncols()
            )));
        }
        Ok((dim, n_derivatives))
    }

    /// Train the GP with the current hyperparameters on inputs `xt` and targets `yt`,
    /// a (n, 1 + D) matrix of values and derivatives (or (n, 1) when the kernel
    /// does not handle derivatives).
    ///
    /// When given, `noise` overrides the regularization level for this call only
    /// (the noise ratio does not apply and the model noise is left unchanged).
    /// On numerical failure, the model is left untrained.
    pub fn train(
        &mut self,
        xt: &[Kern::Input],
        yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
        noise: Option<F>,
    ) -> Result<()> {
        let (dim, n_derivatives) = self.check_training_data(xt, yt)?;
        let noise = match noise {
            Some(noise) if !(noise >= F::zero() && noise.is_finite()) => {
                return Err(GpError::InvalidValueError(format!(
                    "`noise` should be positive, got {noise}"
                )));
            }
            Some(noise) => noise,
            None => self.noise,
        };
        self.inner_params = None;

        let now = Instant::now();
        let n = xt.len();
        let hyperparameters = self.hyperparameters.clone();
        let mut k = self.kernel.kernel_matrix(xt, &hyperparameters)?;
        if k.iter().any(|v| !v.is_finite()) {
            warn!("GP training: kernel matrix with non finite values ({hyperparameters})");
            return Err(GpError::FactorizationError(format!(
                "kernel matrix has non finite values with {hyperparameters}"
            )));
        }
        let reg = regularization(noise, self.noisefactor, n, n_derivatives);
        k.diag_mut().zip_mut_with(&reg, |kii, r| *kii += *r * *r);

        let l = k.cholesky().map_err(|err| {
            warn!("GP training: Cholesky factorization failed ({hyperparameters}, noise={noise})");
            GpError::FactorizationError(format!("{err} with {hyperparameters} and noise={noise}"))
        })?;

        if self.prior.use_update() {
            self.prior.update(xt, yt, &l)?;
        }
        let prior_mean = self.prior.prior(&Array1::<F>::ones(n_derivatives));
        let mean = tiled_prior_mean(&self.prior, n, n_derivatives)?;
        let a0 = flatten(yt) - &mean;
        let alpha = cho_solve(&l, &a0)?;
        debug!(
            "GP trained on {} observations ({} rows) in {}ms",
            n,
            a0.len(),
            now.elapsed().as_millis()
        );

        self.inner_params = Some(GpInnerParams {
            xt: xt.to_vec(),
            yt: yt.to_owned(),
            dim,
            prior_mean,
            a0,
            alpha,
            l,
            hyperparameters,
            noise,
        });
        Ok(())
    }

    /// Negative log marginal likelihood of the trained model:
    /// `0.5 * a0.alpha + sum(log(diag(L))) + n/2 * log(2pi)`
    /// where `n` is the number of training observations.
    pub fn trained_neg_log_likelihood(&self) -> Result<F> {
        let inner = self.inner()?;
        let n = F::cast(inner.xt.len());
        let two = F::cast(2.);
        let datafit = inner.a0.dot(&inner.alpha) / two;
        let complexity = inner.l.diag().mapv(|v| v.ln()).sum();
        let normalization = n / two * (two * F::cast(std::f64::consts::PI)).ln();
        Ok(datafit + complexity + normalization)
    }

    /// Set `params` values to the hyperparameters `names`, retrain on (`xt`, `yt`)
    /// and return the negative log marginal likelihood.
    pub fn neg_log_likelihood(
        &mut self,
        params: &[F],
        xt: &[Kern::Input],
        yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
        names: &[&str],
    ) -> Result<F> {
        let hyperparameters = Hyperparameters::from_values(names, params)?;
        self.check_training_data(xt, yt)?;
        self.set_hyperparams(&hyperparameters, self.noise)?;
        self.train(xt, yt, None)?;
        self.trained_neg_log_likelihood()
    }

    /// Predict value and derivatives at `x` as a (1 + D,) vector,
    /// and optionally its (1 + D, 1 + D) covariance matrix.
    pub fn predict(
        &self,
        x: &Kern::Input,
        get_variance: bool,
    ) -> Result<(Array1<F>, Option<Array2<F>>)> {
        let inner = self.inner()?;
        if x.n_derivatives() != inner.dim {
            return Err(GpError::ShapeError(format!(
                "prediction input of dimension {} for a GP trained in dimension {}",
                x.n_derivatives(),
                inner.dim
            )));
        }
        let hyperparameters = &inner.hyperparameters;
        let k = self.kernel.kernel_vector(x, &inner.xt, hyperparameters)?;
        let f = &inner.prior_mean + &k.dot(&inner.alpha);
        if !get_variance {
            return Ok((f, None));
        }
        let v = inner.l.solve_triangular(&k.t(), UPLO::Lower)?;
        let cov = self.kernel.kernel(x, x, hyperparameters)? - v.t().dot(&v);
        Ok((f, Some(cov)))
    }

    /// Predict variances of value and derivatives at `x` as a (1 + D,) vector
    pub fn predict_var(&self, x: &Kern::Input) -> Result<Array1<F>> {
        let (_, cov) = self.predict(x, true)?;
        let cov = cov.ok_or(GpError::NotTrained)?;
        // Remove negative round-off
        Ok(cov
            .diag()
            .mapv(|v| if v < F::zero() { F::zero() } else { v }))
    }

    /// Predict values and derivatives at every `x` of `xs`
    /// as a (n, 1 + D) matrix.
    pub fn predict_values(&self, xs: &[Kern::Input]) -> Result<Array2<F>> {
        let inner = self.inner()?;
        let mut values = Array2::zeros((xs.len(), inner.prior_mean.len()));
        for (x, mut row) in xs.iter().zip(values.rows_mut()) {
            let (f, _) = self.predict(x, false)?;
            row.assign(&f);
        }
        Ok(values)
    }

    /// Fit hyperparameters `names` by minimizing the negative log marginal likelihood
    /// within optional `bounds` with a gradient tolerance `tol`.
    ///
    /// See [`GaussianProcess::fit_hyperparameters_with`].
    pub fn fit_hyperparameters(
        &mut self,
        xt: &[Kern::Input],
        yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
        names: &[&str],
        bounds: Option<&[(F, F)]>,
        tol: F,
    ) -> Result<HyperFitResult<F>> {
        let params = HyperOptParams::new()
            .tol(tol)
            .bounds(bounds.map(|b| b.to_vec()));
        self.fit_hyperparameters_with(xt, yt, names, &params)
    }

    /// Fit hyperparameters `names` by minimizing the negative log marginal likelihood
    /// starting from their current values.
    ///
    /// The gradient test against `tol` is only done at the starting point: when every
    /// component of the central differences gradient, projected on the bounds, is under
    /// `tol`, the starting point is kept without searching. During the search, the
    /// minimizer stops when the relative decrease of the objective is under `0.01 * tol`.
    /// There is no gradient criterion at later iterates.
    /// Trial points where training fails are rejected.
    ///
    /// When converged, the model is retrained with the fitted hyperparameters
    /// (never worse than the starting ones). Otherwise the model is left unchanged
    /// and the result is flagged as not converged.
    pub fn fit_hyperparameters_with(
        &mut self,
        xt: &[Kern::Input],
        yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
        names: &[&str],
        params: &HyperOptParams<F>,
    ) -> Result<HyperFitResult<F>> {
        if names.is_empty() {
            return Err(GpError::InvalidValueError(
                "no hyperparameter to fit".to_string(),
            ));
        }
        let known = self.kernel.hyperparameter_names();
        if let Some(unknown) = names.iter().find(|n| !known.contains(*n)) {
            return Err(GpError::UnknownHyperparameter(format!(
                "`{unknown}` is not a hyperparameter of {} kernel",
                self.kernel
            )));
        }
        params.check(names.len())?;
        self.check_training_data(xt, yt)?;

        let snapshot = self.clone();
        // lock noise ratio before any evaluation
        self.set_hyperparams(&Hyperparameters::new(), self.noise)?;

        let bounds: Vec<(f64, f64)> = match params.get_bounds() {
            Some(bounds) => bounds
                .iter()
                .map(|(lo, up)| (into_f64(lo), into_f64(up)))
                .collect(),
            None => vec![(-UNBOUNDED, UNBOUNDED); names.len()],
        };
        let seed: Vec<f64> = self
            .hyperparameters
            .select(names)?
            .iter()
            .zip(&bounds)
            .map(|(v, (lo, up))| into_f64(v).clamp(*lo, *up))
            .collect();

        let model = RefCell::new(self.clone());
        let objective = |p: &[f64]| -> f64 {
            let values = p.iter().map(|v| F::cast(*v)).collect::<Vec<_>>();
            match model.borrow_mut().neg_log_likelihood(&values, xt, yt, names) {
                Ok(nll) if nll.is_finite() => {
                    let nll = into_f64(&nll);
                    debug!("GP -logP({p:?}) = {nll}");
                    nll
                }
                Ok(_) => f64::INFINITY,
                Err(err) => {
                    debug!("GP -logP({p:?}) rejected: {err}");
                    f64::INFINITY
                }
            }
        };

        let tol = into_f64(&params.get_tol());
        let now = Instant::now();
        let seed_is_optimal = || {
            let grad0 = projected_gradient(&gradient(&objective, &seed), &seed, &bounds);
            debug!("GP -logP gradient at starting point = {grad0:?}");
            grad0.iter().all(|g| g.abs() <= tol)
        };
        let f0 = objective(&seed);
        let (x_best, f_best, converged) = if !f0.is_finite() {
            warn!("GP hyperparameters fitting: training fails at starting point {seed:?}");
            (seed.clone(), f0, false)
        } else if seed_is_optimal() {
            (seed.clone(), f0, true)
        } else {
            let res = optimize_params(
                &objective,
                &seed,
                &bounds,
                OptimParams {
                    algorithm: params.get_algorithm(),
                    ftol_rel: 0.01 * tol,
                    ftol_abs: 0.,
                    maxeval: params.get_max_eval(),
                },
            );
            if res.converged && res.fmin <= f0 {
                (res.x_opt, res.fmin, true)
            } else {
                (seed.clone(), f0, res.converged)
            }
        };
        info!(
            "GP hyperparameters fitting of {names:?} in {}ms: converged={converged}, -logP={f_best}",
            now.elapsed().as_millis()
        );

        if !converged {
            *self = snapshot;
            return Ok(HyperFitResult {
                hyperparameters: self.hyperparameters.clone(),
                converged,
                neg_log_likelihood: F::cast(f0),
            });
        }

        let values = x_best.iter().map(|v| F::cast(*v)).collect::<Vec<_>>();
        match self.neg_log_likelihood(&values, xt, yt, names) {
            Ok(nll) => Ok(HyperFitResult {
                hyperparameters: self.hyperparameters.clone(),
                converged,
                neg_log_likelihood: nll,
            }),
            Err(err) => {
                *self = snapshot;
                Err(err)
            }
        }
    }

    /// Compute the optimal kernel weight for the targets `yt`:
    /// `sqrt((y - m).alpha / N)` where `N` is the total number of observed components
    /// and `alpha` the weights of the trained model.
    ///
    /// With [`WeightCalibration::Estimate`], the current weight has to be 1 and the model
    /// is only trained if not already. With [`WeightCalibration::Update`], the weight is set
    /// to the computed value and the model is retrained.
    pub fn fit_weight_only(
        &mut self,
        xt: &[Kern::Input],
        yt: &ArrayBase<impl Data<Elem = F>, Ix2>,
        option: WeightCalibration,
    ) -> Result<F> {
        if option == WeightCalibration::Estimate && self.hyperparameters.weight()? != F::one() {
            return Err(GpError::InvalidValueError(format!(
                "weight estimation requires a unit weight, got {}",
                self.hyperparameters.weight()?
            )));
        }
        let (_, n_derivatives) = self.check_training_data(xt, yt)?;
        if !self.is_trained() {
            self.train(xt, yt, None)?;
        }
        let inner = self.inner()?;
        let residual = flatten(yt) - &tiled_prior_mean(&self.prior, xt.len(), n_derivatives)?;
        if residual.len() != inner.alpha.len() {
            return Err(GpError::ShapeError(format!(
                "{} target components given for a GP trained on {}",
                residual.len(),
                inner.alpha.len()
            )));
        }
        let n = F::cast(residual.len());
        let factor = (residual.dot(&inner.alpha) / n).sqrt();
        debug!("GP weight calibration factor = {factor}");

        if option == WeightCalibration::Update {
            let weight = Hyperparameters::new().with(WEIGHT, factor);
            self.set_hyperparams(&weight, self.noise)?;
            self.train(xt, yt, None)?;
        }
        Ok(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::SCALE;
    use crate::kernels::*;
    use crate::parameters::HyperOptAlgorithm;
    use crate::priors::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, s, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;

    /// Values and gradients of `sin(x0) + 0.5 * cos(x1)` at `n` random points,
    /// derivatives columns being dropped when the kernel does not handle them
    fn training_data<K: KernelModel<f64, Input = Array1<f64>>>(
        kernel: &K,
        n: usize,
        seed: u64,
    ) -> (Vec<Array1<f64>>, Array2<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x = Array2::random_using((n, 2), Uniform::new(0., 3.), &mut rng);
        let xt: Vec<Array1<f64>> = x.rows().into_iter().map(|r| r.to_owned()).collect();
        let mut yt = Array2::zeros((n, 3));
        for (i, xi) in xt.iter().enumerate() {
            yt[[i, 0]] = xi[0].sin() + 0.5 * xi[1].cos();
            yt[[i, 1]] = xi[0].cos();
            yt[[i, 2]] = -0.5 * xi[1].sin();
        }
        let ncols = if kernel.with_derivatives() { 3 } else { 1 };
        (xt, yt.slice(s![.., ..ncols]).to_owned())
    }

    fn scenario_gp() -> (
        GaussianProcess<f64, ZeroPrior, SquaredExponentialKernel>,
        Vec<Array1<f64>>,
        Array2<f64>,
    ) {
        let xt = vec![array![0.], array![1.], array![2.]];
        let yt = array![[1.0], [2.0], [1.5]];
        let mut gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialKernel>::params(
            ZeroPrior(),
            SquaredExponentialKernel(),
        )
        .noise(0.1)
        .build()
        .expect("GP built");
        gp.train(&xt, &yt, None).expect("GP trained");
        (gp, xt, yt)
    }

    #[test]
    fn test_scenario_three_points() {
        let (gp, xt, yt) = scenario_gp();
        for (x, y) in xt.iter().zip(yt.column(0)) {
            let (f, cov) = gp.predict(x, true).unwrap();
            assert_eq!(1, f.len());
            assert_abs_diff_eq!(*y, f[0], epsilon = 1e-2);
            let var = cov.unwrap()[[0, 0]];
            assert!(var >= 0.);
            assert_abs_diff_eq!(0., var, epsilon = 1e-2);
        }
        let far = array![10.];
        assert_abs_diff_eq!(0., gp.predict(&far, false).unwrap().0[0], epsilon = 1e-10);
        assert_abs_diff_eq!(1., gp.predict_var(&far).unwrap()[0], epsilon = 1e-10);
    }

    #[test]
    fn test_scenario_likelihood() {
        let (mut gp, xt, yt) = scenario_gp();
        let nll = gp.trained_neg_log_likelihood().unwrap();
        assert_abs_diff_eq!(4.30456, nll, epsilon = 1e-4);
        let nll2 = gp
            .neg_log_likelihood(&[1., 1.], &xt, &yt, &[WEIGHT, SCALE])
            .unwrap();
        assert_abs_diff_eq!(nll, nll2, epsilon = 1e-12);
    }

    macro_rules! test_gp {
        ($prior:ident, $kern:ident) => {
            paste! {

                #[test]
                fn [<test_gp_ $prior:snake _ $kern:snake >]() {
                    let kernel = [<$kern Kernel>]();
                    let (xt, yt) = training_data(&kernel, 8, 42);
                    let mut gp = GpParams::<f64, _, _>::new([<$prior Prior>]::default(), kernel)
                    .build()
                    .expect("GP built");
                    gp.train(&xt, &yt, None).expect("GP trained");

                    // L.(L^T.a) = y - m
                    let mean = tiled_prior_mean::<f64, _>(gp.prior(), xt.len(), yt.ncols() - 1).unwrap();
                    let residual = flatten(&yt) - &mean;
                    let l = gp.cholesky_factor().unwrap();
                    let a = gp.weights().unwrap();
                    assert_abs_diff_eq!(l.dot(&l.t().dot(a)), residual, epsilon = 1e-8);

                    // interpolation and positive variances at training points
                    let values = gp.predict_values(&xt).unwrap();
                    assert_eq!(yt.shape(), values.shape());
                    assert_abs_diff_eq!(yt, values, epsilon = 1e-1);
                    for x in xt.iter() {
                        let (_, cov) = gp.predict(x, true).unwrap();
                        let cov = cov.unwrap();
                        assert_abs_diff_eq!(cov, cov.t().to_owned(), epsilon = 1e-10);
                        assert!(cov.diag().iter().all(|v| *v > -1e-8));
                        assert!(gp.predict_var(x).unwrap().iter().all(|v| *v >= 0.));
                    }

                    // positive variances elsewhere
                    let (xtest, _) = training_data(&kernel, 20, 43);
                    for x in xtest.iter() {
                        let var = gp.predict_var(x).unwrap();
                        assert_eq!(yt.ncols(), var.len());
                        assert!(var.iter().all(|v| *v >= 0.));
                    }
                }
            }
        };
    }

    test_gp!(Zero, SquaredExponential);
    test_gp!(Zero, SquaredExponentialGrad);
    test_gp!(Constant, SquaredExponential);
    test_gp!(Constant, SquaredExponentialGrad);

    #[test]
    fn test_noise_ratio_lock() {
        let mut gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialGradKernel>::params(
            ZeroPrior(),
            SquaredExponentialGradKernel(),
        )
        .build()
        .unwrap();
        assert_eq!(None, gp.noise_ratio());

        gp.set_hyperparams(&Hyperparameters::new().with(WEIGHT, 2.), 0.1)
            .unwrap();
        assert_abs_diff_eq!(0.05, gp.noise_ratio().unwrap(), epsilon = 1e-15);
        assert_abs_diff_eq!(0.1, gp.noise(), epsilon = 1e-15);

        gp.set_hyperparams(&Hyperparameters::new().with(WEIGHT, 4.), 1.)
            .unwrap();
        assert_abs_diff_eq!(0.2, gp.noise(), epsilon = 1e-15);
        gp.set_hyperparams(&Hyperparameters::new().with(SCALE, 0.3), 1.)
            .unwrap();
        assert_abs_diff_eq!(0.2, gp.noise(), epsilon = 1e-15);
        assert_eq!(Some(0.3), gp.hyperparameters().get(SCALE));

        gp.reset_noise_ratio();
        gp.set_hyperparams(&Hyperparameters::new(), 1.).unwrap();
        assert_abs_diff_eq!(1., gp.noise(), epsilon = 1e-15);
        assert_abs_diff_eq!(0.25, gp.noise_ratio().unwrap(), epsilon = 1e-15);
    }

    #[test]
    fn test_predict_uses_trained_state() {
        let (mut gp, _, _) = scenario_gp();
        let x = array![0.5];
        let (f, cov) = gp.predict(&x, true).unwrap();
        gp.set_hyperparams(&Hyperparameters::new().with(WEIGHT, 3.).with(SCALE, 0.2), 0.1)
            .unwrap();
        let (f2, cov2) = gp.predict(&x, true).unwrap();
        assert_eq!(f, f2);
        assert_eq!(cov, cov2);
        let (hp, noise) = gp.trained_hyperparameters().unwrap();
        assert_eq!(Some(1.), hp.get(WEIGHT));
        assert_eq!(0.1, noise);
        assert_abs_diff_eq!(0.1, gp.noise(), epsilon = 1e-15);
    }

    #[test]
    fn test_set_hyperparams_errors() {
        let mut gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialKernel>::params(
            ZeroPrior(),
            SquaredExponentialKernel(),
        )
        .build()
        .unwrap();
        let before = gp.hyperparameters().clone();
        let res = gp.set_hyperparams(
            &Hyperparameters::new().with(SCALE, 0.2).with("theta", 1.),
            0.1,
        );
        assert!(matches!(res, Err(GpError::UnknownHyperparameter(_))));
        let res = gp.set_hyperparams(&Hyperparameters::new().with(WEIGHT, 0.), 0.1);
        assert!(matches!(res, Err(GpError::InvalidValueError(_))));
        assert_eq!(&before, gp.hyperparameters());
        assert_eq!(None, gp.noise_ratio());
    }

    #[test]
    fn test_train_shape_errors() {
        let mut gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialGradKernel>::params(
            ZeroPrior(),
            SquaredExponentialGradKernel(),
        )
        .build()
        .unwrap();
        let xt = vec![array![0., 1.], array![1., 0.]];
        let empty: Vec<Array1<f64>> = vec![];
        assert!(matches!(
            gp.train(&empty, &Array2::<f64>::zeros((0, 3)), None),
            Err(GpError::ShapeError(_))
        ));
        assert!(matches!(
            gp.train(&xt, &Array2::zeros((3, 3)), None),
            Err(GpError::ShapeError(_))
        ));
        assert!(matches!(
            gp.train(&xt, &Array2::zeros((2, 1)), None),
            Err(GpError::ShapeError(_))
        ));
        let mixed = vec![array![0., 1.], array![1.]];
        assert!(matches!(
            gp.train(&mixed, &Array2::zeros((2, 3)), None),
            Err(GpError::ShapeError(_))
        ));
        assert!(!gp.is_trained());

        gp.train(&xt, &Array2::zeros((2, 3)), None).unwrap();
        assert!(matches!(
            gp.predict(&array![0.], false),
            Err(GpError::ShapeError(_))
        ));
    }

    #[test]
    fn test_neg_log_likelihood_shape_error_keeps_state() {
        let (mut gp, xt, _) = scenario_gp();
        let before = gp.hyperparameters().clone();
        let (trained_before, _) = gp.trained_hyperparameters().unwrap();
        let trained_before = trained_before.clone();

        let bad_yt = Array2::zeros((3, 2));
        assert!(matches!(
            gp.neg_log_likelihood(&[0.3], &xt, &bad_yt, &[SCALE]),
            Err(GpError::ShapeError(_))
        ));
        assert_eq!(&before, gp.hyperparameters());
        assert_eq!(None, gp.noise_ratio());
        assert_abs_diff_eq!(0.1, gp.noise(), epsilon = 1e-15);
        let (trained, _) = gp.trained_hyperparameters().unwrap();
        assert_eq!(&trained_before, trained);
    }

    #[test]
    fn test_train_noise_override() {
        let (mut gp, xt, yt) = scenario_gp();
        let nll = gp.trained_neg_log_likelihood().unwrap();

        gp.train(&xt, &yt, Some(0.5)).unwrap();
        let (_, noise) = gp.trained_hyperparameters().unwrap();
        assert_eq!(0.5, noise);
        assert_abs_diff_eq!(0.1, gp.noise(), epsilon = 1e-15);
        assert!((gp.trained_neg_log_likelihood().unwrap() - nll).abs() > 1e-6);

        gp.train(&xt, &yt, None).unwrap();
        let (_, noise) = gp.trained_hyperparameters().unwrap();
        assert_abs_diff_eq!(0.1, noise, epsilon = 1e-15);
        assert_abs_diff_eq!(nll, gp.trained_neg_log_likelihood().unwrap(), epsilon = 1e-12);

        assert!(matches!(
            gp.train(&xt, &yt, Some(-1.)),
            Err(GpError::InvalidValueError(_))
        ));
    }

    #[test]
    fn test_not_trained() {
        let gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialKernel>::params(
            ZeroPrior(),
            SquaredExponentialKernel(),
        )
        .build()
        .unwrap();
        assert!(matches!(
            gp.predict(&array![0.], false),
            Err(GpError::NotTrained)
        ));
        assert!(matches!(gp.predict_var(&array![0.]), Err(GpError::NotTrained)));
        assert!(matches!(gp.weights(), Err(GpError::NotTrained)));
        assert!(matches!(
            gp.trained_neg_log_likelihood(),
            Err(GpError::NotTrained)
        ));
    }

    #[test]
    fn test_factorization_failure() {
        let (mut gp, xt, yt) = scenario_gp();
        assert!(gp.is_trained());
        let dup = vec![array![0.5], array![0.5], array![1.]];
        let res = gp.train(&dup, &yt, Some(0.));
        assert!(matches!(res, Err(GpError::FactorizationError(_))));
        assert!(!gp.is_trained());
        assert!(matches!(
            gp.predict(&xt[0], true),
            Err(GpError::NotTrained)
        ));
    }

    #[test]
    fn test_non_finite_kernel() {
        let (mut gp, xt, yt) = scenario_gp();
        gp.set_hyperparams(&Hyperparameters::new().with(WEIGHT, f64::INFINITY), 0.1)
            .unwrap();
        let res = gp.train(&xt, &yt, None);
        assert!(matches!(res, Err(GpError::FactorizationError(_))));
        assert!(!gp.is_trained());
    }

    #[test]
    fn test_constant_prior_update() {
        let xt = vec![array![0.], array![0.7], array![1.5], array![2.]];
        let yt = Array::from_elem((4, 1), 1.7);
        let mut gp = GaussianProcess::<f64, ConstantPrior<f64>, SquaredExponentialKernel>::params(
            ConstantPrior::default().with_update(true),
            SquaredExponentialKernel(),
        )
        .build()
        .unwrap();
        gp.train(&xt, &yt, None).unwrap();
        assert_abs_diff_eq!(1.7, gp.prior().constant(), epsilon = 1e-10);
        let (f, _) = gp.predict(&array![20.], false).unwrap();
        assert_abs_diff_eq!(1.7, f[0], epsilon = 1e-10);
    }

    #[test]
    fn test_weight_calibration() {
        let kernel = SquaredExponentialGradKernel();
        let (xt, yt) = training_data(&kernel, 6, 42);
        let mut gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialGradKernel>::params(
            ZeroPrior(),
            kernel,
        )
        .build()
        .unwrap();

        let factor = gp
            .fit_weight_only(&xt, &yt, WeightCalibration::Estimate)
            .unwrap();
        let inner = gp.inner_params.as_ref().unwrap();
        let expected = (inner.a0.dot(&inner.alpha) / (6. * 3.)).sqrt();
        assert_abs_diff_eq!(expected, factor, epsilon = 1e-12);
        assert_eq!(1., gp.hyperparameters().weight().unwrap());

        let updated = gp
            .fit_weight_only(&xt, &yt, WeightCalibration::Update)
            .unwrap();
        assert_abs_diff_eq!(factor, updated, epsilon = 1e-12);
        assert_abs_diff_eq!(factor, gp.hyperparameters().weight().unwrap(), epsilon = 1e-12);
        let inner = gp.inner_params.as_ref().unwrap();
        assert_abs_diff_eq!(factor, inner.hyperparameters.weight().unwrap(), epsilon = 1e-12);

        let res = gp.fit_weight_only(&xt, &yt, WeightCalibration::Estimate);
        assert!(matches!(res, Err(GpError::InvalidValueError(_))));
    }

    #[test]
    fn test_weight_calibration_uses_given_targets() {
        let kernel = SquaredExponentialGradKernel();
        let (xt, yt) = training_data(&kernel, 6, 42);
        let mut gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialGradKernel>::params(
            ZeroPrior(),
            kernel,
        )
        .build()
        .unwrap();
        let factor = gp
            .fit_weight_only(&xt, &yt, WeightCalibration::Estimate)
            .unwrap();

        // model already trained on yt: weights are kept, residuals come from given targets
        let scaled = &yt * 2.;
        let scaled_factor = gp
            .fit_weight_only(&xt, &scaled, WeightCalibration::Estimate)
            .unwrap();
        assert_abs_diff_eq!(factor * 2f64.sqrt(), scaled_factor, epsilon = 1e-10);

        let res = gp.fit_weight_only(
            &xt[..4],
            &yt.slice(s![..4, ..]),
            WeightCalibration::Estimate,
        );
        assert!(matches!(res, Err(GpError::ShapeError(_))));
    }

    #[test]
    fn test_weight_calibration_parse() {
        assert_eq!(
            WeightCalibration::Estimate,
            "estimate".parse::<WeightCalibration>().unwrap()
        );
        assert_eq!(
            WeightCalibration::Update,
            "update".parse::<WeightCalibration>().unwrap()
        );
        assert!(matches!(
            "both".parse::<WeightCalibration>(),
            Err(GpError::InvalidValueError(_))
        ));
    }

    macro_rules! test_fit_hyperparameters {
        ($algo:ident) => {
            paste! {

                #[test]
                fn [<test_fit_hyperparameters_ $algo:snake>]() {
                    let kernel = SquaredExponentialGradKernel();
                    let (xt, yt) = training_data(&kernel, 8, 42);
                    let mut gp = GaussianProcess::<f64, ConstantPrior<f64>, SquaredExponentialGradKernel>::params(
                        ConstantPrior::default().with_update(true),
                        kernel,
                    )
                    .hyperparameters(Hyperparameters::new().with(SCALE, 0.4))
                    .noise(1e-3)
                    .build()
                    .unwrap();
                    let seed_nll = gp
                        .neg_log_likelihood(&[0.4], &xt, &yt, &[SCALE])
                        .unwrap();

                    let params = HyperOptParams::new()
                        .bounds(Some(vec![(0.1, 5.)]))
                        .algorithm(HyperOptAlgorithm::$algo);
                    let res = gp
                        .fit_hyperparameters_with(&xt, &yt, &[SCALE], &params)
                        .unwrap();
                    assert!(res.converged);
                    assert!(res.neg_log_likelihood <= seed_nll);
                    assert_eq!(&res.hyperparameters, gp.hyperparameters());
                    assert_abs_diff_eq!(
                        res.neg_log_likelihood,
                        gp.trained_neg_log_likelihood().unwrap(),
                        epsilon = 1e-10
                    );
                    let scale = gp.hyperparameters().value(SCALE).unwrap();
                    assert!((0.1..=5.).contains(&scale));
                    assert!(gp.is_trained());
                }
            }
        };
    }

    test_fit_hyperparameters!(Slsqp);
    test_fit_hyperparameters!(Cobyla);

    fn fitting_gp() -> GaussianProcess<f64, ConstantPrior<f64>, SquaredExponentialGradKernel> {
        GaussianProcess::<f64, ConstantPrior<f64>, SquaredExponentialGradKernel>::params(
            ConstantPrior::default().with_update(true),
            SquaredExponentialGradKernel(),
        )
        .hyperparameters(Hyperparameters::new().with(SCALE, 0.4))
        .noise(1e-3)
        .build()
        .unwrap()
    }

    #[test]
    fn test_fit_hyperparameters_convenience() {
        let (xt, yt) = training_data(&SquaredExponentialGradKernel(), 8, 42);
        let mut gp = fitting_gp();
        let seed_nll = gp.neg_log_likelihood(&[0.4], &xt, &yt, &[SCALE]).unwrap();
        let res = gp
            .fit_hyperparameters(&xt, &yt, &[SCALE], Some(&[(0.1, 5.)]), 1e-2)
            .unwrap();
        assert!(res.converged);
        assert!(res.neg_log_likelihood <= seed_nll);

        let mut gp2 = fitting_gp();
        let params = HyperOptParams::new().tol(1e-2).bounds(Some(vec![(0.1, 5.)]));
        let res2 = gp2
            .fit_hyperparameters_with(&xt, &yt, &[SCALE], &params)
            .unwrap();
        assert!(res2.converged);
        assert_abs_diff_eq!(res.neg_log_likelihood, res2.neg_log_likelihood, epsilon = 1e-10);
        assert_eq!(res.hyperparameters, res2.hyperparameters);
    }

    #[test]
    fn test_fit_hyperparameters_errors() {
        let (mut gp, xt, yt) = scenario_gp();
        let before = gp.hyperparameters().clone();
        assert!(matches!(
            gp.fit_hyperparameters(&xt, &yt, &[], None, 1e-2),
            Err(GpError::InvalidValueError(_))
        ));
        assert!(matches!(
            gp.fit_hyperparameters(&xt, &yt, &["theta"], None, 1e-2),
            Err(GpError::UnknownHyperparameter(_))
        ));
        assert!(matches!(
            gp.fit_hyperparameters(&xt, &yt, &[SCALE], Some(&[(0.1, 1.), (0.1, 1.)]), 1e-2),
            Err(GpError::InvalidValueError(_))
        ));
        assert!(matches!(
            gp.fit_hyperparameters(&xt, &yt, &[SCALE], Some(&[(1., 0.1)]), 1e-2),
            Err(GpError::InvalidValueError(_))
        ));
        assert!(matches!(
            gp.neg_log_likelihood(&[1., 2.], &xt, &yt, &[SCALE]),
            Err(GpError::ShapeError(_))
        ));
        assert_eq!(&before, gp.hyperparameters());
        assert_eq!(None, gp.noise_ratio());
    }

    #[test]
    fn test_failed_fit_restores_model() {
        let xt = vec![array![0.5], array![0.5], array![1.]];
        let yt = array![[1.], [1.], [2.]];
        let mut gp = GaussianProcess::<f64, ZeroPrior, SquaredExponentialKernel>::params(
            ZeroPrior(),
            SquaredExponentialKernel(),
        )
        .build()
        .unwrap();
        // null noise locked
        gp.set_hyperparams(&Hyperparameters::new(), 0.).unwrap();
        assert!(gp.train(&xt, &yt, None).is_err());
        let before = gp.hyperparameters().clone();

        // training fails everywhere as noise stays null
        let params = HyperOptParams::new()
            .bounds(Some(vec![(0.1, 10.)]))
            .max_eval(30);
        let res = gp
            .fit_hyperparameters_with(&xt, &yt, &[SCALE], &params)
            .unwrap();
        assert!(!res.converged);
        assert_eq!(before, res.hyperparameters);
        assert_eq!(&before, gp.hyperparameters());
        assert_eq!(Some(0.), gp.noise_ratio());
        assert_eq!(0., gp.noise());
        assert!(!gp.is_trained());
    }

    #[test]
    fn test_display() {
        let (gp, _, _) = scenario_gp();
        assert_eq!(
            "GP(prior=ZeroPrior, kernel=SquaredExponential, hyperparameters={scale: 1, weight: 1}, noise=0.1)",
            gp.to_string()
        );
    }
}
