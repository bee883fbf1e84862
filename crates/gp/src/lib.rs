//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! on bags of time series, where each sample is a set of paths summarized either by a
//! precomputed (expected signature) kernel matrix or by flattened path features.
//!
//! Four kernels are available through [KernelMode]:
//! * a linear kernel given by a precomputed Gram matrix,
//! * an RBF kernel in the feature space of a precomputed Gram matrix,
//! * ARD kernels on raw features with one lengthscale per path dimension or per feature,
//!   optionally with an RBF on top.
//!
//! GP models are implemented by [GaussianProcess] parameterized by [GpParams].
//! Hyperparameters are fitted by maximizing the marginal likelihood with a fixed budget of
//! Adam steps configured by [TrainerParams], see [train].
//!
//! The [experiment] module runs train/test experiments scored with the [metrics] module.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod covariance_models;
mod errors;
pub mod experiment;
pub mod kernels;
pub mod metrics;

mod parameters;
mod transform;

mod optimization;

pub use algorithm::*;
pub use covariance_models::{CovarianceModel, Query};
pub use errors::*;
pub use optimization::*;
pub use parameters::*;
pub use transform::*;

/// Default jitter first added to the kernel diagonal when its factorization fails
pub const GP_DEFAULT_JITTER: f64 = 1e-6;
/// Default number of jitter increases before reporting a numerical instability
pub const GP_MAX_JITTER_RETRIES: usize = 5;

/// Default number of training steps for precomputed kernels
pub const GP_PRECOMPUTED_STEPS: usize = 20000;
/// Default number of training steps for ARD kernels
pub const GP_ARD_STEPS: usize = 3000;
/// Default number of training steps of the naive experiments
pub const GP_NAIVE_STEPS: usize = 2000;
