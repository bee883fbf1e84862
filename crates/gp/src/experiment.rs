//! Train/test experiments: build a GP on the training samples, fit its hyperparameters,
//! then score its predictions on both training and test samples.
//!
//! Data is given either as a precomputed kernel over all samples
//! ([`experiment_precomputed`]), as feature rows ([`experiment_ard`]) or as bags of paths
//! flattened into feature rows ([`naive_experiment`], [`naive_experiment_prefix`]).
//! Independent trials (one seed each) are run in parallel with [`run_trials`].

use crate::algorithm::{GaussianProcess, TrainingInputs};
use crate::covariance_models::Query;
use crate::errors::{GpError, Result};
use crate::kernels::flatten_bags;
use crate::metrics::{Scores, UndefinedMetricPolicy};
use crate::optimization::{train, TrainerParams, TrainingReport};
use crate::parameters::{GpParams, GpValidParams, KernelMode};
use crate::GP_NAIVE_STEPS;

use linfa::{Float, ParamGuard};
use log::info;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::seq::SliceRandom;
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Disjoint train and test sample indices
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct IndexSplit {
    train: Vec<usize>,
    test: Vec<usize>,
    n_samples: usize,
}

impl IndexSplit {
    /// Constructor, fails when indices overlap, are repeated or out of `0..n_samples`,
    /// or when the train set is empty.
    pub fn new(train: Vec<usize>, test: Vec<usize>, n_samples: usize) -> Result<Self> {
        if train.is_empty() {
            return Err(GpError::InvalidValueError(
                "train set cannot be empty".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(train.len() + test.len());
        for &i in train.iter().chain(test.iter()) {
            if i >= n_samples {
                return Err(GpError::InvalidValueError(format!(
                    "sample index {i} out of range for {n_samples} samples"
                )));
            }
            if !seen.insert(i) {
                return Err(GpError::InvalidValueError(format!(
                    "sample index {i} used twice in the split"
                )));
            }
        }
        Ok(IndexSplit {
            train,
            test,
            n_samples,
        })
    }

    /// Random split with `ceil(test_fraction * n_samples)` test samples
    pub fn random(n_samples: usize, test_fraction: f64, seed: u64) -> Result<Self> {
        if !(test_fraction > 0. && test_fraction < 1.) {
            return Err(GpError::InvalidValueError(format!(
                "test fraction should be in (0, 1), got {test_fraction}"
            )));
        }
        let n_test = (test_fraction * n_samples as f64).ceil() as usize;
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let mut indices: Vec<usize> = (0..n_samples).collect();
        indices.shuffle(&mut rng);
        let train = indices.split_off(n_test.min(n_samples));
        Self::new(train, indices, n_samples)
    }

    /// First `n_train` samples for training, the others for test
    pub fn prefix(n_samples: usize, n_train: usize) -> Result<Self> {
        if n_train > n_samples {
            return Err(GpError::InvalidValueError(format!(
                "cannot train on {n_train} samples out of {n_samples}"
            )));
        }
        Self::new((0..n_train).collect(), (n_train..n_samples).collect(), n_samples)
    }

    /// Training sample indices
    pub fn train(&self) -> &[usize] {
        &self.train
    }

    /// Test sample indices
    pub fn test(&self) -> &[usize] {
        &self.test
    }

    /// Number of samples the split was built for
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }
}

/// GP, trainer and scoring settings of an experiment
#[derive(Clone, Debug)]
pub struct ExperimentConfig<F: Float> {
    /// GP parameters
    pub gp: GpValidParams<F>,
    /// Training settings
    pub trainer: TrainerParams,
    /// Value of the scores undefined for the data (R2 or MAPE)
    pub metric_policy: UndefinedMetricPolicy,
}

impl<F: Float> ExperimentConfig<F> {
    /// Constructor
    pub fn new(gp: GpValidParams<F>, trainer: TrainerParams) -> Self {
        ExperimentConfig {
            gp,
            trainer,
            metric_policy: UndefinedMetricPolicy::default(),
        }
    }

    /// Precomputed kernel experiment, optionally with an RBF over the kernel
    pub fn precomputed(rbf: bool) -> Result<Self> {
        let mode = if rbf {
            KernelMode::RbfOverPrecomputed
        } else {
            KernelMode::PrecomputedLinear
        };
        Ok(Self::new(GpParams::new(mode).check()?, TrainerParams::for_mode(mode)))
    }

    /// ARD experiment on feature rows
    pub fn ard(mode: KernelMode, rbf_top: bool) -> Result<Self> {
        let gp = GpParams::new(mode).rbf_top(rbf_top).check()?;
        Ok(Self::new(gp, TrainerParams::for_mode(mode)))
    }

    /// Experiment on flattened bags
    pub fn naive(mode: KernelMode, rbf_top: bool) -> Result<Self> {
        let gp = GpParams::new(mode).rbf_top(rbf_top).check()?;
        Ok(Self::new(gp, TrainerParams::new(GP_NAIVE_STEPS)))
    }

    /// Set the value of undefined scores
    pub fn metric_policy(mut self, policy: UndefinedMetricPolicy) -> Self {
        self.metric_policy = policy;
        self
    }

    /// Set the training settings
    pub fn trainer(mut self, trainer: TrainerParams) -> Self {
        self.trainer = trainer;
        self
    }
}

/// Scores of an experiment
#[derive(Clone, Debug)]
pub struct ExperimentScores<F: Float> {
    /// Scores of the predictions at training samples
    pub train: Scores<F>,
    /// Scores of the predictions at test samples
    pub test: Scores<F>,
    /// Fitted lengthscales, for the one lengthscale per feature kernel only
    pub lengthscales: Option<Array1<F>>,
    /// Training outcome
    pub training: TrainingReport<F>,
}

/// Targets and split should both match the number of samples of the data
fn check_dimensions<F: Float>(
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    split: &IndexSplit,
    n_samples: usize,
) -> Result<()> {
    if y.len() != n_samples {
        return Err(GpError::DimensionError(format!(
            "{} targets for {n_samples} samples",
            y.len()
        )));
    }
    if split.n_samples() != n_samples {
        return Err(GpError::DimensionError(format!(
            "split built for {} samples, data has {n_samples} samples",
            split.n_samples()
        )));
    }
    Ok(())
}

/// Train the model then score it against train and test targets
fn fit_and_score<F: Float>(
    mut gp: GaussianProcess<F>,
    query: Query<F>,
    y_test: &Array1<F>,
    config: &ExperimentConfig<F>,
) -> Result<ExperimentScores<F>> {
    let training = train(&mut gp, &config.trainer)?;
    let pred_test = gp.predict(query)?;
    let pred_train = gp.predict_on_training()?;
    let train = Scores::compute(gp.y_train(), &pred_train.mean, config.metric_policy)?;
    let test = Scores::compute(y_test, &pred_test.mean, config.metric_policy)?;
    let lengthscales = (gp.mode() == KernelMode::ArdFull).then(|| gp.lengthscales());
    info!("{gp}: train {train} / test {test}");
    Ok(ExperimentScores {
        train,
        test,
        lengthscales,
        training,
    })
}

/// Experiment on a precomputed kernel `kernel` over all samples with targets `y`
pub fn experiment_precomputed<F: Float>(
    kernel: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    split: &IndexSplit,
    config: &ExperimentConfig<F>,
) -> Result<ExperimentScores<F>> {
    check_dimensions(y, split, kernel.nrows())?;
    let inputs = TrainingInputs::Precomputed {
        kernel: kernel.to_owned(),
        train: split.train().to_vec(),
    };
    let gp = GaussianProcess::new(config.gp.clone(), inputs, y.select(Axis(0), split.train()))?;
    let y_test = y.select(Axis(0), split.test());
    fit_and_score(gp, Query::Indices(split.test()), &y_test, config)
}

/// Experiment on feature rows `x` (n_samples, n_features) with targets `y`
pub fn experiment_ard<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    split: &IndexSplit,
    config: &ExperimentConfig<F>,
) -> Result<ExperimentScores<F>> {
    check_dimensions(y, split, x.nrows())?;
    let x_train = x.select(Axis(0), split.train());
    let x_test = x.select(Axis(0), split.test());
    let inputs = TrainingInputs::Features(x_train);
    let gp = GaussianProcess::new(config.gp.clone(), inputs, y.select(Axis(0), split.train()))?;
    let y_test = y.select(Axis(0), split.test());
    fit_and_score(gp, Query::Features(x_test.view()), &y_test, config)
}

/// Experiment on bags of paths given as (length, dim) arrays, flattened time-major
/// into feature rows
pub fn naive_experiment<F: Float>(
    bags: &[Array2<F>],
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    split: &IndexSplit,
    config: &ExperimentConfig<F>,
) -> Result<ExperimentScores<F>> {
    let x = flatten_bags(bags)?;
    experiment_ard(&x, y, split, config)
}

/// [`naive_experiment`] training on the first `n_train` bags and testing on the others
pub fn naive_experiment_prefix<F: Float>(
    bags: &[Array2<F>],
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    n_train: usize,
    config: &ExperimentConfig<F>,
) -> Result<ExperimentScores<F>> {
    let split = IndexSplit::prefix(bags.len(), n_train)?;
    naive_experiment(bags, y, &split, config)
}

/// Scores of repeated experiments with their mean and standard deviation
#[derive(Clone, Debug)]
pub struct TrialSummary<F: Float> {
    /// Scores of each trial, in seed order
    pub trials: Vec<ExperimentScores<F>>,
    /// Mean of train scores
    pub train_mean: Scores<F>,
    /// Standard deviation of train scores
    pub train_std: Scores<F>,
    /// Mean of test scores
    pub test_mean: Scores<F>,
    /// Standard deviation of test scores
    pub test_std: Scores<F>,
}

/// Mean and (population) standard deviation of each score
fn mean_std<F: Float>(scores: &[Scores<F>]) -> (Scores<F>, Scores<F>) {
    let n = F::cast(scores.len());
    let stat = |get: fn(&Scores<F>) -> F| {
        let mean = scores.iter().map(get).fold(F::zero(), |acc, v| acc + v) / n;
        let var = scores
            .iter()
            .map(|s| (get(s) - mean) * (get(s) - mean))
            .fold(F::zero(), |acc, v| acc + v)
            / n;
        (mean, var.sqrt())
    };
    let (rmse, rmse_std) = stat(|s| s.rmse);
    let (r2, r2_std) = stat(|s| s.r2);
    let (mape, mape_std) = stat(|s| s.mape);
    (
        Scores { rmse, r2, mape },
        Scores {
            rmse: rmse_std,
            r2: r2_std,
            mape: mape_std,
        },
    )
}

/// Run `n_trials` independent experiments in parallel, trial `i` getting seed `i`
/// (typically used for [`IndexSplit::random`]).
///
/// Fails with the first failing trial error.
pub fn run_trials<F, E>(n_trials: usize, experiment: E) -> Result<TrialSummary<F>>
where
    F: Float,
    E: Fn(u64) -> Result<ExperimentScores<F>> + Sync + Send,
{
    if n_trials == 0 {
        return Err(GpError::InvalidValueError(
            "at least one trial is required".to_string(),
        ));
    }
    let trials = (0..n_trials as u64)
        .into_par_iter()
        .map(&experiment)
        .collect::<Result<Vec<_>>>()?;
    let train: Vec<Scores<F>> = trials.iter().map(|t| t.train).collect();
    let test: Vec<Scores<F>> = trials.iter().map(|t| t.test).collect();
    let (train_mean, train_std) = mean_std(&train);
    let (test_mean, test_std) = mean_std(&test);
    info!("{n_trials} trials: train {train_mean} (std {train_std}) / test {test_mean} (std {test_std})");
    Ok(TrialSummary {
        trials,
        train_mean,
        train_std,
        test_mean,
        test_std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::linear_gram;
    use ndarray::{array, Array, Array3};
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;

    /// Bags of 2d random walks, target is an offset sum of endpoints
    fn bags_dataset(n_bags: usize, seed: u64) -> (Vec<Array2<f64>>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let steps = Array3::random_using((n_bags, 6, 2), Normal::new(0., 0.3).unwrap(), &mut rng);
        let bags: Vec<Array2<f64>> = steps
            .outer_iter()
            .map(|s| {
                let mut path = s.to_owned();
                path.accumulate_axis_inplace(Axis(0), |&prev, cur| *cur += prev);
                path
            })
            .collect();
        let y = Array::from_iter(bags.iter().map(|b| 5. + b[[5, 0]] - 0.5 * b[[5, 1]]));
        (bags, y)
    }

    #[test]
    fn test_index_split() {
        assert!(IndexSplit::new(vec![0, 1], vec![2, 3], 4).is_ok());
        assert!(IndexSplit::new(vec![0, 1], vec![1, 3], 4).is_err());
        assert!(IndexSplit::new(vec![0, 0], vec![3], 4).is_err());
        assert!(IndexSplit::new(vec![0, 1], vec![4], 4).is_err());
        assert!(IndexSplit::new(vec![], vec![1], 4).is_err());
    }

    #[test]
    fn test_random_split() {
        let split = IndexSplit::random(10, 0.2, 3).unwrap();
        assert_eq!(split.test().len(), 2);
        assert_eq!(split.train().len(), 8);
        let mut all: Vec<usize> = split.train().iter().chain(split.test()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(split, IndexSplit::random(10, 0.2, 3).unwrap());
        assert!(IndexSplit::random(10, 1., 3).is_err());
    }

    #[test]
    fn test_prefix_split() {
        let split = IndexSplit::prefix(5, 3).unwrap();
        assert_eq!(split.train(), &[0, 1, 2]);
        assert_eq!(split.test(), &[3, 4]);
        assert!(IndexSplit::prefix(5, 6).is_err());
    }

    #[test]
    fn test_experiment_precomputed() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (bags, y) = bags_dataset(40, 0);
        let kernel = linear_gram(&flatten_bags(&bags).unwrap());
        let split = IndexSplit::random(40, 0.2, 0).unwrap();
        let config = ExperimentConfig::precomputed(false)
            .unwrap()
            .trainer(TrainerParams::new(300));
        let scores = experiment_precomputed(&kernel, &y, &split, &config).unwrap();
        assert!(scores.train.r2 > 0.9, "train r2 = {}", scores.train.r2);
        assert!(scores.test.rmse.is_finite());
        assert!(scores.lengthscales.is_none());
        assert!(scores.training.final_nll <= scores.training.initial_nll);
    }

    #[test]
    fn test_experiment_rbf_precomputed() {
        let (bags, y) = bags_dataset(30, 1);
        let kernel = linear_gram(&flatten_bags(&bags).unwrap());
        let split = IndexSplit::random(30, 0.2, 1).unwrap();
        let config = ExperimentConfig::precomputed(true)
            .unwrap()
            .trainer(TrainerParams::new(100));
        let scores = experiment_precomputed(&kernel, &y, &split, &config).unwrap();
        assert!(scores.train.rmse.is_finite() && scores.test.rmse.is_finite());
        assert!(scores.training.final_nll <= scores.training.initial_nll);
    }

    #[test]
    fn test_experiment_ard_full_lengthscales() {
        let (bags, y) = bags_dataset(30, 2);
        let x = flatten_bags(&bags).unwrap();
        let split = IndexSplit::random(30, 0.2, 2).unwrap();
        let config = ExperimentConfig::ard(KernelMode::ArdFull, false)
            .unwrap()
            .trainer(TrainerParams::new(100));
        let scores = experiment_ard(&x, &y, &split, &config).unwrap();
        let lengthscales = scores.lengthscales.unwrap();
        assert_eq!(lengthscales.len(), 12);
        assert!(lengthscales.iter().all(|&l| l > 0.));

        let config = ExperimentConfig::ard(KernelMode::Ard { path_dims: 2 }, true)
            .unwrap()
            .trainer(TrainerParams::new(100));
        let scores = experiment_ard(&x, &y, &split, &config).unwrap();
        assert!(scores.lengthscales.is_none());
    }

    #[test]
    fn test_naive_experiments() {
        let (bags, y) = bags_dataset(30, 3);
        let config = ExperimentConfig::naive(KernelMode::Ard { path_dims: 2 }, false)
            .unwrap()
            .trainer(TrainerParams::new(100));
        let split = IndexSplit::random(30, 0.2, 3).unwrap();
        let scores = naive_experiment(&bags, &y, &split, &config).unwrap();
        assert!(scores.test.r2.is_finite());

        let scores = naive_experiment_prefix(&bags, &y, 24, &config).unwrap();
        assert!(scores.train.r2 > 0.9, "train r2 = {}", scores.train.r2);
    }

    #[test]
    fn test_experiment_errors() {
        let (bags, y) = bags_dataset(10, 4);
        let x = flatten_bags(&bags).unwrap();
        let split = IndexSplit::prefix(10, 8).unwrap();
        let config = ExperimentConfig::precomputed(false).unwrap();
        assert!(matches!(
            experiment_ard(&x, &y, &split, &config),
            Err(GpError::InvalidValueError(_))
        ));
        assert!(matches!(
            experiment_precomputed(&linear_gram(&x), &y.slice(ndarray::s![..9]), &split, &config),
            Err(GpError::DimensionError(_))
        ));
        let config = ExperimentConfig::naive(KernelMode::ArdFull, false)
            .unwrap()
            .trainer(TrainerParams::new(10));
        let all_train = IndexSplit::prefix(10, 10).unwrap();
        assert!(matches!(
            naive_experiment(&bags, &y, &all_train, &config),
            Err(GpError::DimensionError(_))
        ));
    }

    #[test]
    fn test_split_larger_than_data() {
        let (bags, y) = bags_dataset(4, 6);
        let x = flatten_bags(&bags).unwrap();
        let split = IndexSplit::new(vec![0, 1, 2], vec![5], 6).unwrap();
        let config = ExperimentConfig::precomputed(false).unwrap();
        assert!(matches!(
            experiment_precomputed(&linear_gram(&x), &y, &split, &config),
            Err(GpError::DimensionError(_))
        ));
        let config = ExperimentConfig::ard(KernelMode::ArdFull, false).unwrap();
        assert!(matches!(
            experiment_ard(&x, &y, &split, &config),
            Err(GpError::DimensionError(_))
        ));
    }

    #[test]
    fn test_linear_toy_experiment() {
        // train on x = 0..3, predict x = 4
        let x = array![[0.0_f64], [1.], [2.], [3.], [4.]];
        let y = array![0.0_f64, 1., 2., 3., 4.];
        let split = IndexSplit::prefix(5, 4).unwrap();
        let config = ExperimentConfig::precomputed(false)
            .unwrap()
            .trainer(TrainerParams::new(500));
        // zero target and a single test sample
        assert!(matches!(
            experiment_precomputed(&linear_gram(&x), &y, &split, &config),
            Err(GpError::UndefinedMetricError(_))
        ));

        let config = config.metric_policy(UndefinedMetricPolicy::Sentinel(f64::NAN));
        let scores = experiment_precomputed(&linear_gram(&x), &y, &split, &config).unwrap();
        assert!(scores.test.rmse < 1., "test rmse = {}", scores.test.rmse);
        assert!(scores.test.r2.is_nan());
        assert!(scores.train.r2 > 0.99, "train r2 = {}", scores.train.r2);
        assert!(scores.train.mape.is_nan());
        assert!(scores.test.mape.is_finite());
    }

    #[test]
    fn test_run_trials() {
        let (bags, y) = bags_dataset(30, 5);
        let kernel = linear_gram(&flatten_bags(&bags).unwrap());
        let config = ExperimentConfig::precomputed(false)
            .unwrap()
            .trainer(TrainerParams::new(100));
        let summary = run_trials(3, |seed| {
            let split = IndexSplit::random(30, 0.2, seed)?;
            experiment_precomputed(&kernel, &y, &split, &config)
        })
        .unwrap();
        assert_eq!(summary.trials.len(), 3);
        let rmses: Vec<f64> = summary.trials.iter().map(|t| t.test.rmse).collect();
        let min = rmses.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = rmses.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(summary.test_mean.rmse >= min - 1e-12 && summary.test_mean.rmse <= max + 1e-12);
        assert!(summary.test_std.rmse >= 0.);
        assert!(run_trials::<f64, _>(0, |seed| {
            let split = IndexSplit::random(30, 0.2, seed)?;
            experiment_precomputed(&kernel, &y, &split, &config)
        })
        .is_err());
    }
}
