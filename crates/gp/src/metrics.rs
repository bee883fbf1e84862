//! A module for metrics to evaluate GP regression predictions.
//!
//! Targets and predictions are first ordered by ascending targets (stable sort) so that
//! the scores do not depend on the sample order, up to the last bit.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, ArrayBase, Axis, Data, Ix1, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// What a metric returns when it is undefined for the data:
/// R2 with constant targets or MAPE with a zero target
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum UndefinedMetricPolicy {
    /// Fail with an `UndefinedMetricError`
    #[default]
    Error,
    /// Return the given value
    Sentinel(f64),
}

/// Targets and predictions ordered by ascending targets
fn sorted_by_target<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<(Array1<F>, Array1<F>)> {
    if y_true.len() != y_pred.len() {
        return Err(GpError::DimensionError(format!(
            "{} targets but {} predictions",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(GpError::DimensionError(
            "cannot compute a metric on empty data".to_string(),
        ));
    }
    let mut order: Vec<usize> = (0..y_true.len()).collect();
    order.sort_by(|&a, &b| y_true[a].partial_cmp(&y_true[b]).unwrap_or(Ordering::Equal));
    Ok((
        y_true.select(Axis(0), &order),
        y_pred.select(Axis(0), &order),
    ))
}

/// Root mean squared error
pub fn rmse<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    let (y_true, y_pred) = sorted_by_target(y_true, y_pred)?;
    let mse = (&y_true - &y_pred).mapv(|e| e * e).sum() / F::cast(y_true.len());
    Ok(mse.sqrt())
}

impl UndefinedMetricPolicy {
    fn apply<F: Float>(self, what: &str) -> Result<F> {
        match self {
            UndefinedMetricPolicy::Error => Err(GpError::UndefinedMetricError(what.to_string())),
            UndefinedMetricPolicy::Sentinel(v) => Ok(F::cast(v)),
        }
    }
}

/// Coefficient of determination `1 - SS_res / SS_tot`.
///
/// Undefined when the targets have no variance (ex: a single sample).
pub fn r_squared<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    policy: UndefinedMetricPolicy,
) -> Result<F> {
    let (y_true, y_pred) = sorted_by_target(y_true, y_pred)?;
    let mean = y_true.sum() / F::cast(y_true.len());
    let ss_tot = y_true.mapv(|y| (y - mean) * (y - mean)).sum();
    if ss_tot == F::zero() {
        return policy.apply("R2 with constant targets");
    }
    let ss_res = (&y_true - &y_pred).mapv(|e| e * e).sum();
    Ok(F::one() - ss_res / ss_tot)
}

/// Mean absolute percentage error `mean(|y - y_pred| / y)`.
///
/// The denominator is the signed target, so negative targets give negative terms.
pub fn mape<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    policy: UndefinedMetricPolicy,
) -> Result<F> {
    let (y_true, y_pred) = sorted_by_target(y_true, y_pred)?;
    if y_true.iter().any(|&y| y == F::zero()) {
        return policy.apply("MAPE with a zero target");
    }
    let ratios = Zip::from(&y_true)
        .and(&y_pred)
        .map_collect(|&y, &p| num_traits::Float::abs(y - p) / y);
    Ok(ratios.sum() / F::cast(y_true.len()))
}

/// RMSE, R2 and MAPE of a set of predictions
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Scores<F: Float> {
    /// Root mean squared error
    pub rmse: F,
    /// Coefficient of determination
    pub r2: F,
    /// Mean absolute percentage error
    pub mape: F,
}

impl<F: Float> fmt::Display for Scores<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rmse={}, r2={}, mape={}", self.rmse, self.r2, self.mape)
    }
}

impl<F: Float> Scores<F> {
    /// Compute all scores, `policy` giving the undefined ones
    pub fn compute(
        y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
        y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
        policy: UndefinedMetricPolicy,
    ) -> Result<Self> {
        Ok(Scores {
            rmse: rmse(y_true, y_pred)?,
            r2: r_squared(y_true, y_pred, policy)?,
            mape: mape(y_true, y_pred, policy)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::seq::SliceRandom;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_rmse() {
        let y = array![1., 2., 3., 4.];
        assert_eq!(rmse(&y, &y).unwrap(), 0.);
        let p = array![2., 2., 3., 2.];
        assert_abs_diff_eq!(rmse(&y, &p).unwrap(), (5.0_f64 / 4.).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_r_squared() {
        let y = array![1., 2., 3., 4.];
        let policy = UndefinedMetricPolicy::Error;
        assert_eq!(r_squared(&y, &y, policy).unwrap(), 1.);
        let mean = Array1::from_elem(4, 2.5);
        assert_abs_diff_eq!(r_squared(&y, &mean, policy).unwrap(), 0., epsilon = 1e-12);
        assert!(matches!(
            r_squared(&array![2., 2.], &array![1., 3.], policy),
            Err(GpError::UndefinedMetricError(_))
        ));
        assert_eq!(
            r_squared(&array![2., 2.], &array![1., 3.], UndefinedMetricPolicy::Sentinel(-1.)).unwrap(),
            -1.
        );
    }

    #[test]
    fn test_scores_single_sample() {
        let y = array![4.0_f64];
        let p = array![3.5_f64];
        assert!(matches!(
            Scores::compute(&y, &p, UndefinedMetricPolicy::Error),
            Err(GpError::UndefinedMetricError(_))
        ));
        let scores = Scores::compute(&y, &p, UndefinedMetricPolicy::Sentinel(f64::NAN)).unwrap();
        assert_abs_diff_eq!(scores.rmse, 0.5, epsilon = 1e-12);
        assert!(scores.r2.is_nan());
        assert_abs_diff_eq!(scores.mape, 0.125, epsilon = 1e-12);
    }

    #[test]
    fn test_mape() {
        let y = array![2., 4.];
        let p = array![1., 5.];
        assert_abs_diff_eq!(
            mape(&y, &p, UndefinedMetricPolicy::Error).unwrap(),
            (0.5 + 0.25) / 2.,
            epsilon = 1e-12
        );
        // signed denominator
        let y = array![-2., 4.];
        let p = array![-1., 5.];
        assert_abs_diff_eq!(
            mape(&y, &p, UndefinedMetricPolicy::Error).unwrap(),
            (-0.5 + 0.25) / 2.,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_mape_zero_target() {
        let y = array![0., 4.];
        let p = array![1., 5.];
        assert!(matches!(
            mape(&y, &p, UndefinedMetricPolicy::Error),
            Err(GpError::UndefinedMetricError(_))
        ));
        assert_eq!(mape(&y, &p, UndefinedMetricPolicy::Sentinel(f64::INFINITY)).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_dimension_errors() {
        let y = array![1., 2.];
        assert!(matches!(rmse(&y, &array![1.]), Err(GpError::DimensionError(_))));
        let empty = Array1::<f64>::zeros(0);
        assert!(matches!(
            Scores::compute(&empty, &empty, UndefinedMetricPolicy::Error),
            Err(GpError::DimensionError(_))
        ));
    }

    #[test]
    fn test_permutation_invariance() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let y = Array1::random_using(50, Uniform::new(0.5, 10.), &mut rng);
        let p = &y + &Array1::random_using(50, Uniform::new(-1., 1.), &mut rng);
        let scores = Scores::compute(&y, &p, UndefinedMetricPolicy::Error).unwrap();

        let mut perm: Vec<usize> = (0..50).collect();
        perm.shuffle(&mut rng);
        let y_perm = y.select(Axis(0), &perm);
        let p_perm = p.select(Axis(0), &perm);
        let scores_perm = Scores::compute(&y_perm, &p_perm, UndefinedMetricPolicy::Error).unwrap();
        assert_eq!(scores, scores_perm);
    }
}
