use crate::covariance_models::{ArdCov, Covariance, CovarianceModel, PrecomputedCov, Query};
use crate::errors::{GpError, Result};
use crate::kernels::slice;
use crate::parameters::{GpValidParams, HyperParam, Hyperparameters, KernelMode};

use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use log::{debug, warn};
use ndarray::{s, Array1, Array2, Axis, Zip};
use std::cell::OnceCell;
use std::fmt;

/// Training data of a [`GaussianProcess`]
#[derive(Clone, Debug)]
pub enum TrainingInputs<F: Float> {
    /// Base kernel over all samples (n_samples, n_samples) and the indices of the training samples.
    /// Used by precomputed kernel modes.
    Precomputed {
        /// Full base kernel matrix
        kernel: Array2<F>,
        /// Training sample indices
        train: Vec<usize>,
    },
    /// Training feature rows (n_train, n_features). Used by ARD kernel modes.
    Features(Array2<F>),
}

/// Predictive distribution at query points
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction<F: Float> {
    /// Predictive mean
    pub mean: Array1<F>,
    /// Predictive standard deviation
    pub std: Array1<F>,
}

/// Cholesky factorization of the noisy training kernel and the derived quantities
#[derive(Clone, Debug)]
struct Factorization<F: Float> {
    /// Training kernel without noise
    k_train: Array2<F>,
    /// Lower Cholesky factor of `k_train + (noise + jitter) I`
    chol: Array2<F>,
    /// `(k_train + (noise + jitter) I)^-1 y`
    alpha: Array1<F>,
    /// Jitter added on top of the noise
    jitter: F,
    /// Negative log marginal likelihood
    nll: F,
}

/// Values derived from one hyperparameter setting, filled lazily
#[derive(Clone, Debug)]
struct ModelCache<F: Float> {
    /// Hyperparameter version the cached values were computed with
    version: u64,
    factorization: OnceCell<Factorization<F>>,
    /// Covariance over all samples, RBF over precomputed kernel only
    full_covariance: OnceCell<Array2<F>>,
}

impl<F: Float> ModelCache<F> {
    fn new(version: u64) -> Self {
        ModelCache {
            version,
            factorization: OnceCell::new(),
            full_covariance: OnceCell::new(),
        }
    }
}

/// Gaussian process regression with a zero prior mean.
///
/// The model owns its training inputs, its targets and its hyperparameters kept in an
/// unconstrained form `theta_raw = [lengthscales.., variance, noise]`, the constrained values
/// being obtained through the [`PositiveTransform`](crate::PositiveTransform) of its parameters.
/// Likelihood and predictions use the Cholesky factorization of the noisy training kernel,
/// computed once per hyperparameter setting.
///
/// ```no_run
/// use bagsig_gp::{GaussianProcess, GpParams, KernelMode, Query, TrainingInputs};
/// use bagsig_gp::kernels::linear_gram;
/// use linfa::ParamGuard;
/// use ndarray::array;
///
/// let x = array![[0.], [1.], [2.], [3.], [4.]];
/// let params = GpParams::new(KernelMode::PrecomputedLinear).check().unwrap();
/// let inputs = TrainingInputs::Precomputed { kernel: linear_gram(&x), train: vec![0, 1, 2, 3] };
/// let gp = GaussianProcess::new(params, inputs, array![0., 1., 2., 3.]).unwrap();
/// let pred = gp.predict(Query::Indices(&[4])).unwrap();
/// println!("mean={} std={}", pred.mean, pred.std);
/// ```
#[derive(Clone, Debug)]
pub struct GaussianProcess<F: Float> {
    /// Parameters used to build this model
    params: GpValidParams<F>,
    /// Kernel blocks provider
    covariance: Covariance<F>,
    /// Training outputs
    y_train: Array1<F>,
    /// Unconstrained hyperparameters
    theta_raw: Array1<F>,
    /// Whether each `theta_raw` component is optimized
    trainable: Vec<bool>,
    /// Incremented at each hyperparameter update
    version: u64,
    cache: ModelCache<F>,
}

impl<F: Float> fmt::Display for GaussianProcess<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "GP(mode={}, rbf_top={}, {}, n_train={})",
            self.params.mode(),
            self.params.rbf_top(),
            self.hyperparameters(),
            self.n_train()
        )
    }
}

impl<F: Float> GaussianProcess<F> {
    /// Build a GP from validated parameters, training inputs and training outputs.
    ///
    /// Precomputed kernel modes expect [`TrainingInputs::Precomputed`], ARD modes expect
    /// [`TrainingInputs::Features`]. The initial lengthscale is broadcast when it holds one value.
    pub fn new(params: GpValidParams<F>, inputs: TrainingInputs<F>, y_train: Array1<F>) -> Result<Self> {
        let mode = params.mode();
        let covariance = match inputs {
            TrainingInputs::Precomputed { kernel, train } if mode.is_precomputed() => {
                Covariance::Precomputed(PrecomputedCov::new(
                    kernel,
                    train,
                    mode == KernelMode::RbfOverPrecomputed,
                )?)
            }
            TrainingInputs::Features(x) if !mode.is_precomputed() => {
                Covariance::Ard(ArdCov::new(x, mode, params.rbf_top())?)
            }
            _ => {
                return Err(GpError::InvalidValueError(format!(
                    "{mode} kernel does not match the kind of training inputs"
                )))
            }
        };
        if covariance.n_train() != y_train.len() {
            return Err(GpError::DimensionError(format!(
                "{} training samples but {} training outputs",
                covariance.n_train(),
                y_train.len()
            )));
        }
        if y_train.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(
                "training outputs should be finite".to_string(),
            ));
        }

        let m = covariance.n_lengthscales();
        let init = params.init();
        let lengthscale = match init.lengthscale.len() {
            _ if m == 0 => Array1::zeros(0),
            1 => Array1::from_elem(m, init.lengthscale[0]),
            l if l == m => init.lengthscale.to_owned(),
            l => {
                return Err(GpError::DimensionError(format!(
                    "initial lengthscale should have 1 or {m} values, got {l}"
                )))
            }
        };
        let transform = params.transform();
        let mut theta_raw = Array1::zeros(m + 2);
        theta_raw
            .slice_mut(s![..m])
            .assign(&transform.to_unconstrained_array(&lengthscale)?);
        theta_raw[m] = transform.to_unconstrained(init.variance)?;
        theta_raw[m + 1] = transform.to_unconstrained(init.noise)?;

        let mut trainable = vec![false; m + 2];
        for p in params.trainable() {
            match p {
                HyperParam::Lengthscale => trainable[..m].fill(true),
                HyperParam::Variance => trainable[m] = true,
                HyperParam::Noise => trainable[m + 1] = true,
            }
        }
        debug!(
            "GP {mode} built with {} training samples, {} hyperparameters ({} trainable)",
            y_train.len(),
            m + 2,
            trainable.iter().filter(|&&t| t).count()
        );

        Ok(GaussianProcess {
            params,
            covariance,
            y_train,
            theta_raw,
            trainable,
            version: 0,
            cache: ModelCache::new(0),
        })
    }

    /// Parameters used to build the model
    pub fn params(&self) -> &GpValidParams<F> {
        &self.params
    }

    /// Kernel mode
    pub fn mode(&self) -> KernelMode {
        self.params.mode()
    }

    /// Number of training samples
    pub fn n_train(&self) -> usize {
        self.y_train.len()
    }

    /// Training outputs
    pub fn y_train(&self) -> &Array1<F> {
        &self.y_train
    }

    /// Number of lengthscales, the first components of `theta_raw`
    pub fn n_lengthscales(&self) -> usize {
        self.covariance.n_lengthscales()
    }

    /// Unconstrained hyperparameters `[lengthscales.., variance, noise]`
    pub fn theta_raw(&self) -> &Array1<F> {
        &self.theta_raw
    }

    /// Mask of the optimized components of `theta_raw`
    pub fn trainable_mask(&self) -> &[bool] {
        &self.trainable
    }

    /// Hyperparameter version, incremented by each [`GaussianProcess::set_theta_raw`]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the unconstrained hyperparameters, discarding every cached value
    pub fn set_theta_raw(&mut self, theta_raw: Array1<F>) -> Result<()> {
        self.check_theta_raw(&theta_raw)?;
        self.theta_raw = theta_raw;
        self.version += 1;
        self.cache = ModelCache::new(self.version);
        Ok(())
    }

    /// Constrained hyperparameters with one lengthscale value per lengthscale
    pub fn hyperparameters(&self) -> Hyperparameters<F> {
        self.constrained(&self.theta_raw)
    }

    /// Constrained lengthscales
    pub fn lengthscales(&self) -> Array1<F> {
        self.hyperparameters().lengthscale
    }

    /// Constrained signal variance
    pub fn variance(&self) -> F {
        self.hyperparameters().variance
    }

    /// Constrained noise variance
    pub fn noise(&self) -> F {
        self.hyperparameters().noise
    }

    /// Jitter added to the noisy training kernel diagonal to get it factorized
    pub fn jitter(&self) -> Result<F> {
        Ok(self.factorization()?.jitter)
    }

    /// Negative log marginal likelihood of the training outputs at the current hyperparameters
    pub fn neg_log_marginal_likelihood(&self) -> Result<F> {
        Ok(self.factorization()?.nll)
    }

    /// Negative log marginal likelihood and its gradient wrt the unconstrained hyperparameters
    /// `theta_raw`, given in the `[lengthscales.., variance, noise]` layout.
    ///
    /// Gradient components of non trainable hyperparameters are zero.
    /// Nothing is cached as `theta_raw` may differ from the model one.
    pub fn nll_with_gradient(&self, theta_raw: &Array1<F>) -> Result<(F, Array1<F>)> {
        self.check_theta_raw(theta_raw)?;
        let hyp = self.constrained(theta_raw);
        let fact = self.factorize(&hyp)?;
        let n = self.n_train();
        let m = self.n_lengthscales();

        // dNLL/dp = -1/2 tr((alpha alpha^T - K^-1) dK/dp)
        let l_inv = fact.chol.solve_triangular(&Array2::eye(n), UPLO::Lower)?;
        let k_inv = l_inv.t().dot(&l_inv);
        let alpha = fact.alpha.view().insert_axis(Axis(1));
        let w = alpha.dot(&alpha.t()) - k_inv;
        let half = F::cast(0.5);

        let mut grad = Array1::zeros(m + 2);
        if self.trainable[..=m].iter().any(|&t| t) {
            let derivatives = self.covariance.train_block_derivatives(&hyp, &fact.k_train);
            derivatives
                .iter()
                .enumerate()
                .filter(|(p, _)| self.trainable[*p])
                .for_each(|(p, dk)| grad[p] = -half * (&w * dk).sum());
        }
        if self.trainable[m + 1] {
            grad[m + 1] = -half * w.diag().sum();
        }
        let grad = grad * self.params.transform().derivative_array(theta_raw);
        Ok((fact.nll, grad))
    }

    /// Predict mean and standard deviation of the latent function at `query`.
    ///
    /// Precomputed modes accept [`Query::Indices`] and [`Query::Blocks`],
    /// ARD modes accept [`Query::Features`].
    pub fn predict(&self, query: Query<F>) -> Result<Prediction<F>> {
        let hyp = self.hyperparameters();
        let (k_cross, k_diag) = match (&self.covariance, &query) {
            (Covariance::Precomputed(cov), Query::Indices(idx))
                if self.mode() == KernelMode::RbfOverPrecomputed =>
            {
                let full = self.full_covariance(cov, &hyp)?;
                let cross = slice(full, cov.train_indices(), idx)?;
                (cross, full.diag().select(Axis(0), idx))
            }
            _ => self.covariance.cross_block(&hyp, &query)?,
        };
        let fact = self.factorization()?;
        posterior(fact, &k_cross, &k_diag)
    }

    /// Predict mean and standard deviation at the training samples
    pub fn predict_on_training(&self) -> Result<Prediction<F>> {
        let fact = self.factorization()?;
        posterior(fact, &fact.k_train, &fact.k_train.diag().to_owned())
    }

    fn check_theta_raw(&self, theta_raw: &Array1<F>) -> Result<()> {
        if theta_raw.len() != self.theta_raw.len() {
            return Err(GpError::DimensionError(format!(
                "expected {} raw hyperparameters, got {}",
                self.theta_raw.len(),
                theta_raw.len()
            )));
        }
        if theta_raw.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "raw hyperparameters should be finite, got {theta_raw}"
            )));
        }
        Ok(())
    }

    fn constrained(&self, theta_raw: &Array1<F>) -> Hyperparameters<F> {
        let m = self.n_lengthscales();
        let values = self.params.transform().to_constrained_array(theta_raw);
        Hyperparameters::new(values.slice(s![..m]).to_owned(), values[m], values[m + 1])
    }

    fn factorize(&self, hyp: &Hyperparameters<F>) -> Result<Factorization<F>> {
        let k_train = self.covariance.train_block(hyp);
        let mut k = k_train.to_owned();
        k.diag_mut().mapv_inplace(|v| v + hyp.noise);
        let (chol, jitter) =
            jittered_cholesky(k, self.params.jitter(), self.params.max_jitter_retries())?;

        let y = self.y_train.view().insert_axis(Axis(1));
        let z = chol.solve_triangular(&y, UPLO::Lower)?;
        let alpha = chol
            .t()
            .solve_triangular(&z, UPLO::Upper)?
            .remove_axis(Axis(1));

        // 1/2 y^T K^-1 y + 1/2 log|K| + n/2 log(2 pi)
        let half = F::cast(0.5);
        let data_fit = half * z.mapv(|v| v * v).sum();
        let log_det = chol.diag().mapv(|v| v.ln()).sum();
        let n = F::cast(self.n_train());
        let nll = data_fit + log_det + half * n * F::cast(2. * std::f64::consts::PI).ln();

        Ok(Factorization {
            k_train,
            chol,
            alpha,
            jitter,
            nll,
        })
    }

    fn factorization(&self) -> Result<&Factorization<F>> {
        debug_assert_eq!(self.cache.version, self.version);
        if let Some(fact) = self.cache.factorization.get() {
            return Ok(fact);
        }
        let fact = self.factorize(&self.hyperparameters())?;
        Ok(self.cache.factorization.get_or_init(|| fact))
    }

    fn full_covariance(&self, cov: &PrecomputedCov<F>, hyp: &Hyperparameters<F>) -> Result<&Array2<F>> {
        debug_assert_eq!(self.cache.version, self.version);
        if let Some(full) = self.cache.full_covariance.get() {
            return Ok(full);
        }
        let full = cov.full_covariance(hyp)?;
        debug!("Full covariance ({}, {}) computed", full.nrows(), full.ncols());
        Ok(self.cache.full_covariance.get_or_init(|| full))
    }
}

/// Posterior mean and standard deviation given the train/query kernel block
/// and the query self-kernel values
fn posterior<F: Float>(
    fact: &Factorization<F>,
    k_cross: &Array2<F>,
    k_diag: &Array1<F>,
) -> Result<Prediction<F>> {
    let mean = k_cross.t().dot(&fact.alpha);
    let v = fact.chol.solve_triangular(k_cross, UPLO::Lower)?;
    let explained = v.mapv(|e| e * e).sum_axis(Axis(0));
    let std = Zip::from(k_diag)
        .and(&explained)
        .map_collect(|&d, &e| (d - e).max(F::zero()).sqrt());
    Ok(Prediction { mean, std })
}

/// Cholesky factorization of `k`, retried with an increasing jitter `jitter * 10^i`
/// (i = 0..max_retries) added to the diagonal when `k` is not numerically positive definite.
///
/// Returns the lower factor and the jitter actually added.
fn jittered_cholesky<F: Float>(k: Array2<F>, jitter: F, max_retries: usize) -> Result<(Array2<F>, F)> {
    if k.iter().any(|v| !v.is_finite()) {
        return Err(GpError::NumericalInstabilityError(
            "kernel matrix has non finite values".to_string(),
        ));
    }
    let ten = F::cast(10.);
    for attempt in 0..=max_retries {
        let added = if attempt == 0 {
            F::zero()
        } else {
            jitter * ten.powi(attempt as i32 - 1)
        };
        let mut kj = k.to_owned();
        kj.diag_mut().mapv_inplace(|v| v + added);
        if let Ok(chol) = kj.cholesky() {
            if chol.diag().iter().all(|&d| d > F::zero() && d.is_finite()) {
                if attempt > 0 {
                    warn!("Kernel matrix not positive definite, jitter {added} added to its diagonal");
                }
                return Ok((chol, added));
            }
        }
    }
    Err(GpError::NumericalInstabilityError(format!(
        "kernel matrix ({n}, {n}) not positive definite after {max_retries} jitter retries",
        n = k.nrows()
    )))
}
