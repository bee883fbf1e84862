//! Hyperparameters training by minimization of the negative log marginal likelihood
//! with the Adam optimizer over the unconstrained hyperparameters.
//!
//! Training runs a fixed number of steps, there is no convergence check.
use crate::algorithm::GaussianProcess;
use crate::errors::{GpError, Result};
use crate::parameters::KernelMode;
use crate::{GP_ARD_STEPS, GP_PRECOMPUTED_STEPS};

use linfa::{Float, ParamGuard};
use log::{debug, info, warn};
use ndarray::{Array1, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// What to do when a training step yields a non finite objective or gradient,
/// or a kernel which cannot be factorized
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum DivergencePolicy {
    /// Record the step as failed, keep hyperparameters and optimizer moments
    /// unchanged, halve the step size and go on
    #[default]
    RejectStep,
    /// Stop training with an [`GpError::OptimizationDivergenceError`]
    Abort,
}

/// Adam optimizer settings
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct TrainerParams {
    pub(crate) n_steps: usize,
    pub(crate) learning_rate: f64,
    pub(crate) beta1: f64,
    pub(crate) beta2: f64,
    pub(crate) epsilon: f64,
    pub(crate) record_curve: bool,
    pub(crate) divergence: DivergencePolicy,
}

impl Default for TrainerParams {
    fn default() -> Self {
        TrainerParams {
            n_steps: GP_PRECOMPUTED_STEPS,
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            record_curve: false,
            divergence: DivergencePolicy::default(),
        }
    }
}

impl TrainerParams {
    /// Default settings with the given number of steps
    pub fn new(n_steps: usize) -> Self {
        TrainerParams {
            n_steps,
            ..Default::default()
        }
    }

    /// Default settings with the step budget used for the given kernel mode
    pub fn for_mode(mode: KernelMode) -> Self {
        if mode.is_precomputed() {
            Self::new(GP_PRECOMPUTED_STEPS)
        } else {
            Self::new(GP_ARD_STEPS)
        }
    }

    /// Set the number of steps
    pub fn n_steps(mut self, n_steps: usize) -> Self {
        self.n_steps = n_steps;
        self
    }

    /// Set the learning rate
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the decay rates of the first and second moment estimates
    pub fn betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Set the term added to the denominator for numerical stability
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Record the objective value at each step
    pub fn record_curve(mut self, record_curve: bool) -> Self {
        self.record_curve = record_curve;
        self
    }

    /// Set the divergence policy
    pub fn divergence(mut self, divergence: DivergencePolicy) -> Self {
        self.divergence = divergence;
        self
    }

    /// Get the number of steps
    pub fn steps(&self) -> usize {
        self.n_steps
    }
}

impl ParamGuard for TrainerParams {
    type Checked = TrainerParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !(self.learning_rate > 0. && self.learning_rate.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "learning rate should be strictly positive, got {}",
                self.learning_rate
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0. ..1.).contains(&beta) {
                return Err(GpError::InvalidValueError(format!(
                    "`{name}` should be in [0, 1), got {beta}"
                )));
            }
        }
        if !(self.epsilon > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "epsilon should be strictly positive, got {}",
                self.epsilon
            )));
        }
        Ok(self)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self)
    }
}

/// Outcome of a training run
#[derive(Clone, Debug)]
pub struct TrainingReport<F: Float> {
    /// Objective before the first step
    pub initial_nll: F,
    /// Objective at the final hyperparameters
    pub final_nll: F,
    /// Number of steps run
    pub n_steps: usize,
    /// Objective at the start of each step when recorded
    pub curve: Option<Vec<F>>,
    /// Steps rejected under [`DivergencePolicy::RejectStep`]
    pub failed_steps: Vec<usize>,
}

/// Adam first and second moment estimates with the count of updates they went through
struct AdamMoments<F: Float> {
    m: Array1<F>,
    v: Array1<F>,
    n_updates: i32,
}

/// Candidate hyperparameters with the moments to keep if they are accepted
struct AdamProposal<F: Float> {
    theta: Array1<F>,
    m: Array1<F>,
    v: Array1<F>,
}

impl<F: Float> AdamMoments<F> {
    fn new(n: usize) -> Self {
        AdamMoments {
            m: Array1::zeros(n),
            v: Array1::zeros(n),
            n_updates: 0,
        }
    }

    /// Adam step from `theta` along `grad`, non trainable components are left unchanged
    fn propose(
        &self,
        theta: &Array1<F>,
        grad: &Array1<F>,
        mask: &[bool],
        learning_rate: F,
        params: &TrainerParams,
    ) -> AdamProposal<F> {
        let (beta1, beta2) = (F::cast(params.beta1), F::cast(params.beta2));
        let epsilon = F::cast(params.epsilon);
        let m = &self.m * beta1 + grad * (F::one() - beta1);
        let v = &self.v * beta2 + grad.mapv(|g| g * g) * (F::one() - beta2);
        // bias correction counts accepted updates only
        let t = self.n_updates + 1;
        let bias1 = F::one() - beta1.powi(t);
        let bias2 = F::one() - beta2.powi(t);

        let mut candidate = theta.to_owned();
        Zip::from(&mut candidate)
            .and(&m)
            .and(&v)
            .and(mask)
            .for_each(|c, &mi, &vi, &trainable| {
                if trainable {
                    *c -= learning_rate * (mi / bias1) / ((vi / bias2).sqrt() + epsilon);
                }
            });
        AdamProposal {
            theta: candidate,
            m,
            v,
        }
    }

    fn accept(&mut self, m: Array1<F>, v: Array1<F>) {
        self.m = m;
        self.v = v;
        self.n_updates += 1;
    }
}

/// Objective value and gradient at `theta_raw`, or the objective value
/// (`NaN` when not computable) if the step cannot be used
fn evaluate<F: Float>(
    model: &GaussianProcess<F>,
    theta_raw: &Array1<F>,
) -> std::result::Result<(F, Array1<F>), f64> {
    match model.nll_with_gradient(theta_raw) {
        Ok((nll, grad)) if nll.is_finite() && grad.iter().all(|g| g.is_finite()) => Ok((nll, grad)),
        Ok((nll, _)) => Err(nll.to_f64().unwrap_or(f64::NAN)),
        Err(err) => {
            debug!("Objective evaluation failed: {err}");
            Err(f64::NAN)
        }
    }
}

/// Train the trainable hyperparameters of `model` with `params.steps()` Adam steps
/// on the negative log marginal likelihood.
///
/// The model hyperparameters are updated in place after each accepted step.
/// Fails if the initial hyperparameters give a non computable objective.
pub fn train<F: Float>(model: &mut GaussianProcess<F>, params: &TrainerParams) -> Result<TrainingReport<F>> {
    let params = params.check_ref()?;
    let now = Instant::now();
    debug!("Training {model} with {} Adam steps", params.n_steps);

    let mask = model.trainable_mask().to_vec();
    let mut learning_rate = F::cast(params.learning_rate);

    let mut theta = model.theta_raw().to_owned();
    let (mut nll, mut grad) = match model.nll_with_gradient(&theta)? {
        (nll, grad) if nll.is_finite() && grad.iter().all(|g| g.is_finite()) => (nll, grad),
        (nll, _) => {
            return Err(GpError::OptimizationDivergenceError {
                step: 0,
                value: nll.to_f64().unwrap_or(f64::NAN),
            })
        }
    };
    let initial_nll = nll;

    let mut moments = AdamMoments::new(theta.len());
    let mut curve = params.record_curve.then(|| Vec::with_capacity(params.n_steps));
    let mut failed_steps = Vec::new();

    for step in 0..params.n_steps {
        if let Some(curve) = curve.as_mut() {
            curve.push(nll);
        }
        let proposal = moments.propose(&theta, &grad, &mask, learning_rate, params);
        match evaluate(model, &proposal.theta) {
            Ok((new_nll, new_grad)) => {
                model.set_theta_raw(proposal.theta.to_owned())?;
                theta = proposal.theta;
                moments.accept(proposal.m, proposal.v);
                nll = new_nll;
                grad = new_grad;
            }
            Err(value) => match params.divergence {
                DivergencePolicy::Abort => {
                    return Err(GpError::OptimizationDivergenceError { step, value })
                }
                DivergencePolicy::RejectStep => {
                    warn!("Training step {step} rejected (objective = {value})");
                    failed_steps.push(step);
                    learning_rate = learning_rate * F::cast(0.5);
                }
            },
        }
    }

    info!(
        "GP training ({} steps, {} rejected) done in {:?}: nll {} -> {}, {}",
        params.n_steps,
        failed_steps.len(),
        now.elapsed(),
        initial_nll,
        nll,
        model.hyperparameters()
    );
    Ok(TrainingReport {
        initial_nll,
        final_nll: nll,
        n_steps: params.n_steps,
        curve,
        failed_steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TrainingInputs;
    use crate::covariance_models::Query;
    use crate::kernels::linear_gram;
    use crate::metrics::{r_squared, rmse, UndefinedMetricPolicy};
    use crate::parameters::{GpParams, HyperParam};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2, Axis};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::{Normal, Uniform};
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_linear_toy_problem() {
        let _ = env_logger::builder().is_test(true).try_init();
        let x = array![[0.], [1.], [2.], [3.], [4.]];
        let y_train = array![0., 1., 2., 3.];
        let params = GpParams::new(KernelMode::PrecomputedLinear)
            .variance_init(1.)
            .noise_init(1.)
            .check()
            .unwrap();
        let inputs = TrainingInputs::Precomputed {
            kernel: linear_gram(&x),
            train: vec![0, 1, 2, 3],
        };
        let mut gp = GaussianProcess::new(params, inputs, y_train.clone()).unwrap();
        let report = train(&mut gp, &TrainerParams::new(500)).unwrap();
        assert!(report.final_nll <= report.initial_nll);
        assert!(report.failed_steps.is_empty());

        let pred = gp.predict(Query::Indices(&[4])).unwrap();
        let test_rmse = rmse(&array![4.], &pred.mean).unwrap();
        assert!(test_rmse < 1., "test rmse = {test_rmse}");

        let pred = gp.predict_on_training().unwrap();
        let r2 = r_squared(&y_train, &pred.mean, UndefinedMetricPolicy::Error).unwrap();
        assert!(r2 > 0.99, "train r2 = {r2}");
    }

    #[test]
    fn test_training_decreases_nll() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array2::random_using((30, 4), Uniform::new(-1., 1.), &mut rng);
        let noise = Array2::random_using((30, 1), Normal::new(0., 0.1).unwrap(), &mut rng);
        let y = x.map_axis(Axis(1), |r| 2. * r[0] - r[3]) + noise.column(0);
        let params = GpParams::new(KernelMode::Ard { path_dims: 2 })
            .check()
            .unwrap();
        let mut gp = GaussianProcess::new(params, TrainingInputs::Features(x), y).unwrap();
        let nll0 = gp.neg_log_marginal_likelihood().unwrap();
        let report = train(&mut gp, &TrainerParams::new(200).record_curve(true)).unwrap();
        assert_abs_diff_eq!(report.initial_nll, nll0, epsilon = 1e-12);
        assert!(report.final_nll < report.initial_nll);
        assert_abs_diff_eq!(
            gp.neg_log_marginal_likelihood().unwrap(),
            report.final_nll,
            epsilon = 1e-10
        );
        let curve = report.curve.unwrap();
        assert_eq!(curve.len(), 200);
        assert_eq!(curve[0], report.initial_nll);
        assert_eq!(gp.version(), 200);
    }

    #[test]
    fn test_non_trainable_untouched() {
        let x = array![[0.], [1.], [2.], [3.]];
        let params = GpParams::new(KernelMode::PrecomputedLinear)
            .trainable(vec![HyperParam::Noise])
            .check()
            .unwrap();
        let inputs = TrainingInputs::Precomputed {
            kernel: linear_gram(&x),
            train: vec![0, 1, 2, 3],
        };
        let mut gp = GaussianProcess::new(params, inputs, array![1., 0., 2., 1.]).unwrap();
        let variance = gp.variance();
        let noise = gp.noise();
        train(&mut gp, &TrainerParams::new(50)).unwrap();
        assert_eq!(gp.variance(), variance);
        assert!(gp.noise() != noise);
    }

    fn singular_model() -> GaussianProcess<f64> {
        // training noise collapses to 0 on a rank one kernel
        let params = GpParams::new(KernelMode::PrecomputedLinear)
            .trainable(vec![HyperParam::Noise])
            .max_jitter_retries(0)
            .check()
            .unwrap();
        let inputs = TrainingInputs::Precomputed {
            kernel: Array2::ones((3, 3)),
            train: vec![0, 1, 2],
        };
        GaussianProcess::new(params, inputs, array![1., 1., 1.]).unwrap()
    }

    #[test]
    fn test_divergence_abort() {
        let mut gp = singular_model();
        let theta0 = gp.theta_raw().to_owned();
        let trainer = TrainerParams::new(5)
            .learning_rate(50.)
            .divergence(DivergencePolicy::Abort);
        assert!(matches!(
            train(&mut gp, &trainer),
            Err(GpError::OptimizationDivergenceError { step: 0, .. })
        ));
        assert_eq!(gp.theta_raw(), &theta0);
        assert_eq!(gp.version(), 0);
    }

    #[test]
    fn test_divergence_reject_step() {
        let mut gp = singular_model();
        let trainer = TrainerParams::new(5).learning_rate(50.);
        let report = train(&mut gp, &trainer).unwrap();
        assert_eq!(report.failed_steps[0], 0);
        assert!(report.final_nll.is_finite());
        assert!(gp.theta_raw().iter().all(|v| v.is_finite()));
        assert!(gp.neg_log_marginal_likelihood().is_ok());
    }

    #[test]
    fn test_adam_bias_correction_counts_accepted_updates() {
        let params = TrainerParams::default();
        let mask = [true, false];
        let theta = Array1::<f64>::zeros(2);
        let grad = array![2., -0.5];
        let mut moments = AdamMoments::new(2);

        // first step of a constant gradient moves by the learning rate
        let first = moments.propose(&theta, &grad, &mask, 0.1, &params);
        assert_abs_diff_eq!(first.theta[0], -0.1, epsilon = 1e-6);
        assert_eq!(first.theta[1], 0.);

        // a rejected proposal leaves the moments as they were
        let retry = moments.propose(&theta, &grad, &mask, 0.05, &params);
        assert_abs_diff_eq!(retry.theta[0], -0.05, epsilon = 1e-6);
        assert_eq!(moments.n_updates, 0);

        moments.accept(first.m, first.v);
        assert_eq!(moments.n_updates, 1);
        let second = moments.propose(&first.theta, &grad, &mask, 0.1, &params);
        assert_abs_diff_eq!(second.theta[0], -0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_trainer_params() {
        assert_eq!(TrainerParams::for_mode(KernelMode::RbfOverPrecomputed).steps(), 20000);
        assert_eq!(TrainerParams::for_mode(KernelMode::ArdFull).steps(), 3000);
        assert!(TrainerParams::default().learning_rate(0.).check().is_err());
        assert!(TrainerParams::default().betas(0.9, 1.).check().is_err());
        assert!(TrainerParams::default().epsilon(-1.).check().is_err());
        assert!(TrainerParams::default().check().is_ok());
    }
}
