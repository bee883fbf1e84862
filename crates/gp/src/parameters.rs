use crate::errors::{GpError, Result};
use crate::transform::PositiveTransform;
use crate::{GP_DEFAULT_JITTER, GP_MAX_JITTER_RETRIES};
use linfa::{Float, ParamGuard};

use ndarray::{array, Array1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kernel used by the GP to build its covariance blocks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum KernelMode {
    /// Precomputed (signature) Gram matrix scaled by the variance: `variance * K`
    #[default]
    PrecomputedLinear,
    /// RBF kernel in the feature space of a precomputed Gram matrix:
    /// `variance * exp(-(K[i][i] + K[j][j] - 2 K[i][j]) / (2 l^2))`
    RbfOverPrecomputed,
    /// Kernel on raw features with one lengthscale per path dimension,
    /// feature column `j` being scaled by lengthscale `j % path_dims`
    Ard {
        /// Number of channels of the underlying paths
        path_dims: usize,
    },
    /// Kernel on raw features with one lengthscale per raw coordinate
    ArdFull,
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelMode::PrecomputedLinear => write!(f, "PrecomputedLinear"),
            KernelMode::RbfOverPrecomputed => write!(f, "RbfOverPrecomputed"),
            KernelMode::Ard { path_dims } => write!(f, "Ard(path_dims={path_dims})"),
            KernelMode::ArdFull => write!(f, "ArdFull"),
        }
    }
}

impl KernelMode {
    /// Whether the mode works on a precomputed kernel matrix rather than on raw features
    pub fn is_precomputed(&self) -> bool {
        matches!(
            self,
            KernelMode::PrecomputedLinear | KernelMode::RbfOverPrecomputed
        )
    }

    /// Number of lengthscales of the mode given the number of raw features
    pub fn n_lengthscales(&self, n_features: usize) -> usize {
        match self {
            KernelMode::PrecomputedLinear => 0,
            KernelMode::RbfOverPrecomputed => 1,
            KernelMode::Ard { path_dims } => *path_dims,
            KernelMode::ArdFull => n_features,
        }
    }

    /// Hyperparameters optimized when none are specified.
    ///
    /// The linear precomputed kernel has no lengthscale and the ARD linear kernel
    /// keeps its variance fixed, its scale being already carried by the lengthscales.
    pub fn default_trainable(&self, rbf_top: bool) -> Vec<HyperParam> {
        match self {
            KernelMode::PrecomputedLinear => vec![HyperParam::Variance, HyperParam::Noise],
            KernelMode::Ard { .. } | KernelMode::ArdFull if !rbf_top => {
                vec![HyperParam::Lengthscale, HyperParam::Noise]
            }
            _ => vec![
                HyperParam::Lengthscale,
                HyperParam::Variance,
                HyperParam::Noise,
            ],
        }
    }
}

/// Names of the kernel hyperparameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum HyperParam {
    /// Lengthscale(s) of the kernel
    Lengthscale,
    /// Signal variance
    Variance,
    /// Observation noise variance added to the kernel diagonal
    Noise,
}

/// Kernel hyperparameters in their constrained (strictly positive) form
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Hyperparameters<F: Float> {
    /// Lengthscales, either one value broadcast to every lengthscale of the mode
    /// or exactly one value per lengthscale
    pub lengthscale: Array1<F>,
    /// Signal variance
    pub variance: F,
    /// Noise variance
    pub noise: F,
}

impl<F: Float> Default for Hyperparameters<F> {
    fn default() -> Self {
        Hyperparameters {
            lengthscale: array![F::one()],
            variance: F::one(),
            noise: F::one(),
        }
    }
}

impl<F: Float> fmt::Display for Hyperparameters<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "lengthscale={}, variance={}, noise={}",
            self.lengthscale, self.variance, self.noise
        )
    }
}

impl<F: Float> Hyperparameters<F> {
    /// Constructor
    pub fn new(lengthscale: Array1<F>, variance: F, noise: F) -> Self {
        Hyperparameters {
            lengthscale,
            variance,
            noise,
        }
    }
}

/// A set of validated GP parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize",
        deserialize = "F: Deserialize<'de>"
    ))
)]
pub struct GpValidParams<F: Float> {
    /// Kernel used to build covariance blocks
    pub(crate) mode: KernelMode,
    /// Initial values of the hyperparameters
    pub(crate) init: Hyperparameters<F>,
    /// Hyperparameters optimized during training, mode default when None
    pub(crate) trainable: Option<Vec<HyperParam>>,
    /// Whether ARD modes put an RBF on top of the scaled linear kernel
    pub(crate) rbf_top: bool,
    /// Positivity map applied to raw hyperparameters
    pub(crate) transform: PositiveTransform,
    /// First jitter added to the diagonal when Cholesky factorization fails
    pub(crate) jitter: F,
    /// Number of jitter increases (x10 each) before giving up
    pub(crate) max_jitter_retries: usize,
}

impl<F: Float> Default for GpValidParams<F> {
    fn default() -> GpValidParams<F> {
        GpValidParams {
            mode: KernelMode::default(),
            init: Hyperparameters::default(),
            trainable: None,
            rbf_top: false,
            transform: PositiveTransform::default(),
            jitter: F::cast(GP_DEFAULT_JITTER),
            max_jitter_retries: GP_MAX_JITTER_RETRIES,
        }
    }
}

impl<F: Float> GpValidParams<F> {
    /// Get kernel mode
    pub fn mode(&self) -> KernelMode {
        self.mode
    }

    /// Get initial hyperparameters
    pub fn init(&self) -> &Hyperparameters<F> {
        &self.init
    }

    /// Get optimized hyperparameters
    pub fn trainable(&self) -> Vec<HyperParam> {
        self.trainable
            .clone()
            .unwrap_or_else(|| self.mode.default_trainable(self.rbf_top))
    }

    /// Whether an RBF is applied on top of the ARD scaled kernel
    pub fn rbf_top(&self) -> bool {
        self.rbf_top
    }

    /// Get positivity transform
    pub fn transform(&self) -> PositiveTransform {
        self.transform
    }

    /// Get initial jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Get the max number of jitter retries
    pub fn max_jitter_retries(&self) -> usize {
        self.max_jitter_retries
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified for the construction of
/// a [GaussianProcess](crate::GaussianProcess).
pub struct GpParams<F: Float>(GpValidParams<F>);

impl<F: Float> Default for GpParams<F> {
    fn default() -> Self {
        Self(GpValidParams::default())
    }
}

impl<F: Float> GpParams<F> {
    /// A constructor for GP parameters given the kernel mode
    pub fn new(mode: KernelMode) -> GpParams<F> {
        Self(GpValidParams {
            mode,
            ..Default::default()
        })
    }

    /// Set kernel mode
    pub fn mode(mut self, mode: KernelMode) -> Self {
        self.0.mode = mode;
        self
    }

    /// Set initial hyperparameters
    pub fn init(mut self, init: Hyperparameters<F>) -> Self {
        self.0.init = init;
        self
    }

    /// Set initial lengthscale(s), one value is broadcast to all lengthscales
    pub fn lengthscale_init(mut self, lengthscale: Array1<F>) -> Self {
        self.0.init.lengthscale = lengthscale;
        self
    }

    /// Set initial signal variance
    pub fn variance_init(mut self, variance: F) -> Self {
        self.0.init.variance = variance;
        self
    }

    /// Set initial noise variance
    pub fn noise_init(mut self, noise: F) -> Self {
        self.0.init.noise = noise;
        self
    }

    /// Set the hyperparameters to optimize, the others being kept at their initial values
    pub fn trainable(mut self, trainable: Vec<HyperParam>) -> Self {
        self.0.trainable = Some(trainable);
        self
    }

    /// Put an RBF on top of the scaled linear kernel in ARD modes
    pub fn rbf_top(mut self, rbf_top: bool) -> Self {
        self.0.rbf_top = rbf_top;
        self
    }

    /// Set positivity transform
    pub fn transform(mut self, transform: PositiveTransform) -> Self {
        self.0.transform = transform;
        self
    }

    /// Set initial jitter.
    ///
    /// Jitter is only added when the Cholesky factorization of the noisy kernel fails
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the max number of jitter retries
    pub fn max_jitter_retries(mut self, max_jitter_retries: usize) -> Self {
        self.0.max_jitter_retries = max_jitter_retries;
        self
    }
}

fn check_positive<F: Float>(name: &str, value: F) -> Result<()> {
    if value <= F::zero() || !value.is_finite() {
        return Err(GpError::InvalidValueError(format!(
            "`{name}` should be strictly positive and finite, got {value}"
        )));
    }
    Ok(())
}

impl<F: Float> ParamGuard for GpParams<F> {
    type Checked = GpValidParams<F>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let params = &self.0;
        if let KernelMode::Ard { path_dims } = params.mode {
            if path_dims == 0 {
                return Err(GpError::InvalidValueError(
                    "`path_dims` cannot be 0!".to_string(),
                ));
            }
        }
        if params.mode != KernelMode::PrecomputedLinear {
            if params.init.lengthscale.is_empty() {
                return Err(GpError::InvalidValueError(
                    "initial lengthscale cannot be empty".to_string(),
                ));
            }
            for &l in params.init.lengthscale.iter() {
                check_positive("lengthscale", l)?;
            }
        }
        check_positive("variance", params.init.variance)?;
        check_positive("noise", params.init.noise)?;
        check_positive("jitter", params.jitter)?;

        if params.mode == KernelMode::PrecomputedLinear
            && params
                .trainable
                .as_ref()
                .is_some_and(|t| t.contains(&HyperParam::Lengthscale))
        {
            return Err(GpError::InvalidValueError(
                "PrecomputedLinear kernel has no lengthscale to train".to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = GpParams::<f64>::default().check().unwrap();
        assert_eq!(params.mode(), KernelMode::PrecomputedLinear);
        assert_eq!(
            params.trainable(),
            vec![HyperParam::Variance, HyperParam::Noise]
        );
        assert_eq!(params.init().variance, 1.);
    }

    #[test]
    fn test_default_trainable() {
        let ard = KernelMode::Ard { path_dims: 2 };
        assert_eq!(
            ard.default_trainable(false),
            vec![HyperParam::Lengthscale, HyperParam::Noise]
        );
        assert_eq!(ard.default_trainable(true).len(), 3);
        assert_eq!(KernelMode::RbfOverPrecomputed.default_trainable(false).len(), 3);
    }

    #[test]
    fn test_n_lengthscales() {
        assert_eq!(KernelMode::PrecomputedLinear.n_lengthscales(10), 0);
        assert_eq!(KernelMode::RbfOverPrecomputed.n_lengthscales(10), 1);
        assert_eq!(KernelMode::Ard { path_dims: 2 }.n_lengthscales(10), 2);
        assert_eq!(KernelMode::ArdFull.n_lengthscales(10), 10);
    }

    #[test]
    fn test_invalid_params() {
        assert!(GpParams::<f64>::new(KernelMode::Ard { path_dims: 0 })
            .check()
            .is_err());
        assert!(GpParams::new(KernelMode::RbfOverPrecomputed)
            .lengthscale_init(array![-1.0])
            .check()
            .is_err());
        assert!(GpParams::new(KernelMode::ArdFull)
            .lengthscale_init(Array1::<f64>::zeros(0))
            .check()
            .is_err());
        assert!(GpParams::<f64>::default().noise_init(0.).check().is_err());
        assert!(GpParams::<f64>::default()
            .jitter(f64::NAN)
            .check()
            .is_err());
        assert!(GpParams::<f64>::default()
            .trainable(vec![HyperParam::Lengthscale])
            .check()
            .is_err());
    }

    #[cfg(feature = "serializable")]
    #[test]
    fn test_serialize_params() {
        let params = GpParams::<f64>::new(KernelMode::Ard { path_dims: 3 })
            .rbf_top(true)
            .check()
            .unwrap();
        let json = serde_json::to_string(&params).unwrap();
        let loaded: GpValidParams<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(params, loaded);
    }
}
