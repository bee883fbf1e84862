//! Positivity maps between the unconstrained optimization domain and
//! the strictly positive kernel hyperparameters (lengthscale, variance, noise).

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smooth strictly increasing map from `R` to `R+*`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum PositiveTransform {
    /// `log(1 + exp(raw))`
    #[default]
    Softplus,
    /// `exp(raw)`, i.e. optimization on a log scale
    Exp,
}

impl fmt::Display for PositiveTransform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PositiveTransform::Softplus => write!(f, "Softplus"),
            PositiveTransform::Exp => write!(f, "Exp"),
        }
    }
}

impl PositiveTransform {
    /// Map an unconstrained value to a strictly positive one.
    ///
    /// The result is floored at the smallest positive normal value so that
    /// a very negative `raw` never yields an exact zero.
    pub fn to_constrained<F: Float>(&self, raw: F) -> F {
        let value = match self {
            // max(r, 0) + ln(1 + exp(-|r|)) does not overflow for large r
            PositiveTransform::Softplus => {
                raw.max(F::zero()) + (-num_traits::Float::abs(raw)).exp().ln_1p()
            }
            PositiveTransform::Exp => raw.exp(),
        };
        value.max(F::min_positive_value())
    }

    /// Inverse map, only used to get initial raw values from user given positive values.
    pub fn to_unconstrained<F: Float>(&self, value: F) -> Result<F> {
        if value <= F::zero() || !value.is_finite() {
            return Err(GpError::InvalidValueError(format!(
                "hyperparameter value should be strictly positive and finite, got {value}"
            )));
        }
        let raw = match self {
            // ln(exp(v) - 1) = v + ln(1 - exp(-v))
            PositiveTransform::Softplus if value > F::cast(20.) => {
                value + (-(-value).exp()).ln_1p()
            }
            PositiveTransform::Softplus => value.exp_m1().ln(),
            PositiveTransform::Exp => value.ln(),
        };
        Ok(raw)
    }

    /// Derivative of [`PositiveTransform::to_constrained`] wrt `raw`
    pub fn derivative<F: Float>(&self, raw: F) -> F {
        match self {
            PositiveTransform::Softplus => {
                // sigmoid
                if raw >= F::zero() {
                    F::one() / (F::one() + (-raw).exp())
                } else {
                    let e = raw.exp();
                    e / (F::one() + e)
                }
            }
            PositiveTransform::Exp => raw.exp(),
        }
    }

    /// Elementwise [`PositiveTransform::to_constrained`]
    pub fn to_constrained_array<F: Float>(
        &self,
        raw: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        raw.mapv(|v| self.to_constrained(v))
    }

    /// Elementwise [`PositiveTransform::to_unconstrained`]
    pub fn to_unconstrained_array<F: Float>(
        &self,
        values: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        values
            .iter()
            .map(|&v| self.to_unconstrained(v))
            .collect::<Result<Vec<_>>>()
            .map(Array1::from_vec)
    }

    /// Elementwise [`PositiveTransform::derivative`]
    pub fn derivative_array<F: Float>(
        &self,
        raw: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        raw.mapv(|v| self.derivative(v))
    }
}
