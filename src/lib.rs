//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! of a scalar function observed together with its derivatives, typically
//! energies and forces of atomic structures in active learning optimizers.
//!
//! Every observation of derivative dimension `D` brings `1 + D` targets (the value
//! followed by the gradient) which are modeled jointly thanks to kernels
//! differentiated wrt their arguments.
//!
//! GP regression is implemented by [GaussianProcess] parameterized by [GpParams].
//! Once trained, the model predicts values and derivatives with their covariance.
//! Kernel hyperparameters can be fitted by maximizing the marginal likelihood
//! ([GaussianProcess::fit_hyperparameters]) and the kernel weight calibrated
//! in closed form ([GaussianProcess::fit_weight_only]).
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod errors;
pub mod hyperparameters;
pub mod kernels;
pub mod priors;

mod parameters;
mod utils;

mod optimization;

pub use algorithm::*;
pub use errors::*;
pub use hyperparameters::Hyperparameters;
pub use parameters::*;
