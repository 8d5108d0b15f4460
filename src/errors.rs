use thiserror::Error;

/// A result type for GP regression algorithm
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using [`GaussianProcess`](crate::GaussianProcess)
#[derive(Error, Debug)]
pub enum GpError {
    /// When training inputs, targets or parameters do not have matching shapes
    #[error("Shape error: {0}")]
    ShapeError(String),
    /// When a hyperparameter name is not handled by the kernel
    #[error("Unknown hyperparameter: {0}")]
    UnknownHyperparameter(String),
    /// When the regularized kernel matrix cannot be Cholesky-factorized
    #[error("Factorization error: {0}")]
    FactorizationError(String),
    /// When a trained model is required
    #[error("Gaussian process is not trained")]
    NotTrained,
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
