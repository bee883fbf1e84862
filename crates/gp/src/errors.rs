use thiserror::Error;

/// A result type for GP regression algorithm
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when building kernels, fitting or evaluating a [`GaussianProcess`](crate::GaussianProcess)
#[derive(Error, Debug)]
pub enum GpError {
    /// When feature vectors, kernel blocks or targets have inconsistent dimensions
    #[error("Dimension error: {0}")]
    DimensionError(String),
    /// When the kernel matrix stays non positive definite after the jitter retries
    #[error("Numerical instability: {0}")]
    NumericalInstabilityError(String),
    /// When a metric cannot be computed for the given data (ex: MAPE with a zero target)
    #[error("Undefined metric: {0}")]
    UndefinedMetricError(String),
    /// When the training objective becomes non finite and the policy is to abort
    #[error("Optimization diverged at step {step}: objective = {value}")]
    OptimizationDivergenceError {
        /// Index of the failing training step
        step: usize,
        /// Objective value found at that step
        value: f64,
    },
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
