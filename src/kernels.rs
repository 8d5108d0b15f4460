//! A module for kernels used as prior covariance of the GP model.
//!
//! A kernel may model function values only or function values together with their
//! derivatives (i.e. energies and forces). In the latter case each observation
//! of derivative dimension `D` contributes a `(1 + D)` block to the kernel matrix.
//!
//! The following kernels are implemented:
//! * squared exponential on values,
//! * squared exponential on values and gradients.

use crate::errors::{GpError, Result};
use crate::hyperparameters::{Hyperparameters, SCALE, WEIGHT};
use linfa::Float;
use ndarray::{s, Array1, Array2};
use std::fmt;

/// An observation handled as an opaque feature vector by the kernels
/// which only have to know its number of derivative components.
pub trait Observation {
    /// Number of derivative components attached to the observation
    fn n_derivatives(&self) -> usize;
}

/// A plain coordinates vector has one derivative per coordinate
impl<F: Float> Observation for Array1<F> {
    fn n_derivatives(&self) -> usize {
        self.len()
    }
}

/// A trait for using a kernel in GP regression.
///
/// Kernels are stateless: hyperparameters values are given at each evaluation.
/// A kernel is expected to factorize as `k(x, x') = weight^2 * f(x, x')`
/// where `f` does not depend on the `weight` hyperparameter.
pub trait KernelModel<F: Float>: Clone + Copy + Default + fmt::Display + fmt::Debug + Sync {
    /// Type of the observations the kernel is computed on
    type Input: Observation + Clone + fmt::Debug;

    /// Names of the hyperparameters handled by the kernel, `weight` included
    fn hyperparameter_names(&self) -> &'static [&'static str];

    /// Default hyperparameters values
    fn default_hyperparameters(&self) -> Hyperparameters<F>;

    /// Whether derivative observations are modeled
    fn with_derivatives(&self) -> bool;

    /// Scalar kernel value `k(x1, x2)`
    fn value(&self, x1: &Self::Input, x2: &Self::Input, hp: &Hyperparameters<F>) -> Result<F>;

    /// Covariance block between observations at `x1` and `x2`:
    /// (1 + D1, 1 + D2) matrix with derivatives, (1, 1) matrix otherwise.
    fn kernel(
        &self,
        x1: &Self::Input,
        x2: &Self::Input,
        hp: &Hyperparameters<F>,
    ) -> Result<Array2<F>>;

    /// Number of rows contributed by `x` in the kernel matrix
    fn block_size(&self, x: &Self::Input) -> usize {
        if self.with_derivatives() {
            1 + x.n_derivatives()
        } else {
            1
        }
    }

    /// Merge `params` into `current` hyperparameters.
    /// Fails without merging anything if one of the names is not handled by the kernel.
    fn set_params(
        &self,
        current: &Hyperparameters<F>,
        params: &Hyperparameters<F>,
    ) -> Result<Hyperparameters<F>> {
        let known = self.hyperparameter_names();
        if let Some(unknown) = params.names().find(|n| !known.contains(n)) {
            return Err(GpError::UnknownHyperparameter(format!(
                "`{unknown}` is not a hyperparameter of {self} kernel (expected one of {known:?})"
            )));
        }
        let mut merged = current.clone();
        merged.merge(params);
        Ok(merged)
    }

    /// Kernel blocks between `x` and every training observation of `xt` stacked horizontally
    fn kernel_vector(
        &self,
        x: &Self::Input,
        xt: &[Self::Input],
        hp: &Hyperparameters<F>,
    ) -> Result<Array2<F>> {
        let ncols: usize = xt.iter().map(|xi| self.block_size(xi)).sum();
        let mut k = Array2::zeros((self.block_size(x), ncols));
        let mut offset = 0;
        for xi in xt {
            let block = self.kernel(x, xi, hp)?;
            let width = block.ncols();
            k.slice_mut(s![.., offset..offset + width]).assign(&block);
            offset += width;
        }
        Ok(k)
    }

    /// Symmetric kernel matrix of the training observations `xt`
    fn kernel_matrix(&self, xt: &[Self::Input], hp: &Hyperparameters<F>) -> Result<Array2<F>> {
        let sizes = xt.iter().map(|x| self.block_size(x)).collect::<Vec<_>>();
        let offsets = sizes
            .iter()
            .scan(0, |acc, size| {
                let offset = *acc;
                *acc += size;
                Some(offset)
            })
            .collect::<Vec<_>>();
        let n: usize = sizes.iter().sum();
        let mut k = Array2::zeros((n, n));
        for (i, xi) in xt.iter().enumerate() {
            for (j, xj) in xt.iter().enumerate().skip(i) {
                let block = self.kernel(xi, xj, hp)?;
                let (ri, rj) = (offsets[i]..offsets[i] + sizes[i], offsets[j]..offsets[j] + sizes[j]);
                k.slice_mut(s![ri.clone(), rj.clone()]).assign(&block);
                if i != j {
                    k.slice_mut(s![rj, ri]).assign(&block.t());
                }
            }
        }
        Ok(k)
    }
}

/// Weight and length scale of the squared exponential kernels
fn se_hyperparameters<F: Float>(hp: &Hyperparameters<F>) -> Result<(F, F)> {
    let weight = hp.value(WEIGHT)?;
    let scale = hp.value(SCALE)?;
    if scale == F::zero() {
        return Err(GpError::InvalidValueError(
            "squared exponential length scale should not be zero".to_string(),
        ));
    }
    Ok((weight, scale))
}

fn check_same_dim<F: Float>(x1: &Array1<F>, x2: &Array1<F>) -> Result<()> {
    if x1.len() != x2.len() {
        return Err(GpError::ShapeError(format!(
            "kernel evaluated between observations of dimensions {} and {}",
            x1.len(),
            x2.len()
        )));
    }
    Ok(())
}

/// `weight^2 * exp(-|x1 - x2|^2 / (2 * scale^2))`
fn se_value<F: Float>(x1: &Array1<F>, x2: &Array1<F>, weight: F, scale: F) -> F {
    let d2 = (x1 - x2).mapv(|v| v * v).sum();
    weight * weight * F::exp(-d2 / (F::cast(2.) * scale * scale))
}

/// Squared exponential kernel on function values only
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SquaredExponentialKernel();

impl<F: Float> KernelModel<F> for SquaredExponentialKernel {
    type Input = Array1<F>;

    fn hyperparameter_names(&self) -> &'static [&'static str] {
        &[WEIGHT, SCALE]
    }

    fn default_hyperparameters(&self) -> Hyperparameters<F> {
        Hyperparameters::new()
            .with(WEIGHT, F::one())
            .with(SCALE, F::one())
    }

    fn with_derivatives(&self) -> bool {
        false
    }

    fn value(&self, x1: &Array1<F>, x2: &Array1<F>, hp: &Hyperparameters<F>) -> Result<F> {
        check_same_dim(x1, x2)?;
        let (weight, scale) = se_hyperparameters(hp)?;
        Ok(se_value(x1, x2, weight, scale))
    }

    fn kernel(&self, x1: &Array1<F>, x2: &Array1<F>, hp: &Hyperparameters<F>) -> Result<Array2<F>> {
        let k = self.value(x1, x2, hp)?;
        Ok(Array2::from_elem((1, 1), k))
    }
}

impl fmt::Display for SquaredExponentialKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}

/// Squared exponential kernel on function values and gradients.
///
/// With `d = x1 - x2` and `k = k(x1, x2)`, the covariance block reads:
///
/// ```text
/// | k                 k * d^T / scale^2                            |
/// | -k * d / scale^2  k * (I - d.d^T / scale^2) / scale^2          |
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SquaredExponentialGradKernel();

impl<F: Float> KernelModel<F> for SquaredExponentialGradKernel {
    type Input = Array1<F>;

    fn hyperparameter_names(&self) -> &'static [&'static str] {
        &[WEIGHT, SCALE]
    }

    fn default_hyperparameters(&self) -> Hyperparameters<F> {
        Hyperparameters::new()
            .with(WEIGHT, F::one())
            .with(SCALE, F::one())
    }

    fn with_derivatives(&self) -> bool {
        true
    }

    fn value(&self, x1: &Array1<F>, x2: &Array1<F>, hp: &Hyperparameters<F>) -> Result<F> {
        check_same_dim(x1, x2)?;
        let (weight, scale) = se_hyperparameters(hp)?;
        Ok(se_value(x1, x2, weight, scale))
    }

    fn kernel(&self, x1: &Array1<F>, x2: &Array1<F>, hp: &Hyperparameters<F>) -> Result<Array2<F>> {
        check_same_dim(x1, x2)?;
        let (weight, scale) = se_hyperparameters(hp)?;
        let nd = x1.len();
        let l2 = scale * scale;
        let k = se_value(x1, x2, weight, scale);
        let d = x1 - x2;

        let mut block = Array2::zeros((nd + 1, nd + 1));
        block[[0, 0]] = F::one();
        // derivatives wrt x2
        let grad = d.mapv(|v| v / l2);
        block.slice_mut(s![0, 1..]).assign(&grad);
        block.slice_mut(s![1.., 0]).assign(&grad.mapv(|v| -v));
        for i in 0..nd {
            for j in 0..nd {
                let delta = if i == j { F::one() } else { F::zero() };
                block[[i + 1, j + 1]] = (delta - d[i] * d[j] / l2) / l2;
            }
        }
        Ok(block.mapv(|v| v * k))
    }
}

impl fmt::Display for SquaredExponentialGradKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponentialGrad")
    }
}
