//! Covariance models building the kernel blocks needed by the GP likelihood and predictor.
//!
//! Two families are implemented:
//! * [`PrecomputedCov`]: the kernel is given as a full Gram matrix over all samples
//!   (typically an expected signature kernel) used either as is or through an RBF,
//! * [`ArdCov`]: the kernel is computed from raw feature rows with per-group lengthscales,
//!   either as a scaled linear kernel or as an RBF on the scaled features.
//!
//! Both take the constrained [`Hyperparameters`] where `lengthscale` holds exactly one
//! value per lengthscale of the model.

use crate::errors::{GpError, Result};
use crate::kernels::{implicit_sq_distances, pairwise_sq_distances, rbf_wrap, rbf_wrap_cross, slice};
use crate::parameters::{Hyperparameters, KernelMode};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix2, Zip};

/// Where predictions are requested
#[derive(Clone, Debug)]
pub enum Query<'a, F: Float> {
    /// Sample indices into the full precomputed kernel
    Indices(&'a [usize]),
    /// Precomputed base kernel blocks: `cross` is `K[train][:, query]` (n_train, m)
    /// and `query` is `K[query][:, query]` (m, m)
    Blocks {
        /// Train/query block
        cross: ArrayView2<'a, F>,
        /// Query/query block
        query: ArrayView2<'a, F>,
    },
    /// Raw feature rows (m, n_features)
    Features(ArrayView2<'a, F>),
}

/// A trait for the kernel blocks used in GP regression
pub trait CovarianceModel<F: Float> {
    /// Number of lengthscales of the model
    fn n_lengthscales(&self) -> usize;

    /// Number of training samples
    fn n_train(&self) -> usize;

    /// Train/train kernel block, noise excluded
    fn train_block(&self, hyp: &Hyperparameters<F>) -> Array2<F>;

    /// Derivatives of the train/train block `k` (as returned by `train_block`)
    /// wrt each lengthscale then wrt the variance.
    fn train_block_derivatives(&self, hyp: &Hyperparameters<F>, k: &Array2<F>) -> Vec<Array2<F>>;

    /// Train/query kernel block (n_train, m) and query self-kernel values (m)
    fn cross_block(&self, hyp: &Hyperparameters<F>, query: &Query<F>) -> Result<(Array2<F>, Array1<F>)>;
}

/// Kernel given by a precomputed Gram matrix over all samples
#[derive(Clone, Debug)]
pub struct PrecomputedCov<F: Float> {
    full: Array2<F>,
    train: Vec<usize>,
    k_train: Array2<F>,
    diag_train: Array1<F>,
    /// Implicit squared distances between training samples, RBF only
    sq_dist: Option<Array2<F>>,
}

impl<F: Float> PrecomputedCov<F> {
    /// Constructor from the full base kernel and the training indices.
    /// `rbf` switches to the RBF kernel over the base one.
    pub fn new(full: Array2<F>, train: Vec<usize>, rbf: bool) -> Result<Self> {
        if full.nrows() != full.ncols() {
            return Err(GpError::DimensionError(format!(
                "precomputed kernel should be square, got ({}, {})",
                full.nrows(),
                full.ncols()
            )));
        }
        if train.is_empty() {
            return Err(GpError::DimensionError(
                "training set cannot be empty".to_string(),
            ));
        }
        let k_train = slice(&full, &train, &train)?;
        let diag_train = k_train.diag().to_owned();
        let sq_dist = rbf.then(|| implicit_sq_distances(&k_train, &diag_train, &diag_train));
        Ok(PrecomputedCov {
            full,
            train,
            k_train,
            diag_train,
            sq_dist,
        })
    }

    fn is_rbf(&self) -> bool {
        self.sq_dist.is_some()
    }

    /// Training sample indices
    pub fn train_indices(&self) -> &[usize] {
        &self.train
    }

    /// Covariance over all samples, `variance * K` or `variance * rbf(K)`
    pub fn full_covariance(&self, hyp: &Hyperparameters<F>) -> Result<Array2<F>> {
        let k = if self.is_rbf() {
            rbf_wrap(&self.full, hyp.lengthscale[0])?
        } else {
            self.full.to_owned()
        };
        Ok(k * hyp.variance)
    }

    fn scaled_cross(
        &self,
        hyp: &Hyperparameters<F>,
        cross: &ArrayBase<impl Data<Elem = F>, Ix2>,
        diag_query: Array1<F>,
    ) -> Result<(Array2<F>, Array1<F>)> {
        if self.is_rbf() {
            let k = rbf_wrap_cross(cross, &self.diag_train, &diag_query, hyp.lengthscale[0])?;
            Ok((k * hyp.variance, Array1::from_elem(diag_query.len(), hyp.variance)))
        } else {
            Ok((cross.to_owned() * hyp.variance, diag_query * hyp.variance))
        }
    }
}

impl<F: Float> CovarianceModel<F> for PrecomputedCov<F> {
    fn n_lengthscales(&self) -> usize {
        usize::from(self.is_rbf())
    }

    fn n_train(&self) -> usize {
        self.train.len()
    }

    fn train_block(&self, hyp: &Hyperparameters<F>) -> Array2<F> {
        match &self.sq_dist {
            Some(d) => {
                let scale = F::cast(2.) * hyp.lengthscale[0] * hyp.lengthscale[0];
                d.mapv(|v| hyp.variance * (-v / scale).exp())
            }
            None => &self.k_train * hyp.variance,
        }
    }

    fn train_block_derivatives(&self, hyp: &Hyperparameters<F>, k: &Array2<F>) -> Vec<Array2<F>> {
        match &self.sq_dist {
            Some(d) => {
                let l = hyp.lengthscale[0];
                // d/dl exp(-d / 2l^2) = exp(-d / 2l^2) * d / l^3
                let dl = k * d / (l * l * l);
                vec![dl, k / hyp.variance]
            }
            None => vec![self.k_train.to_owned()],
        }
    }

    fn cross_block(&self, hyp: &Hyperparameters<F>, query: &Query<F>) -> Result<(Array2<F>, Array1<F>)> {
        match query {
            Query::Indices(idx) => {
                let cross = slice(&self.full, &self.train, idx)?;
                let diag = self.full.diag().select(Axis(0), idx);
                self.scaled_cross(hyp, &cross, diag)
            }
            Query::Blocks { cross, query } => {
                if cross.nrows() != self.train.len() {
                    return Err(GpError::DimensionError(format!(
                        "cross kernel block has {} rows, expected {} training samples",
                        cross.nrows(),
                        self.train.len()
                    )));
                }
                if query.nrows() != cross.ncols() || query.ncols() != cross.ncols() {
                    return Err(GpError::DimensionError(format!(
                        "query kernel block should be ({m}, {m}), got ({}, {})",
                        query.nrows(),
                        query.ncols(),
                        m = cross.ncols()
                    )));
                }
                self.scaled_cross(hyp, cross, query.diag().to_owned())
            }
            Query::Features(_) => Err(GpError::InvalidValueError(
                "precomputed kernel expects sample indices or kernel blocks, not features"
                    .to_string(),
            )),
        }
    }
}

/// Automatic relevance determination kernel on raw features.
///
/// Column `j` is divided by the lengthscale of its group, the group being
/// `j % path_dims` ([`KernelMode::Ard`]) or `j` itself ([`KernelMode::ArdFull`]).
/// Without RBF the kernel is `variance * (1 + <z, z'>)`, with RBF it is
/// `variance * exp(-|z - z'|^2 / 2)` where `z` are the scaled features.
#[derive(Clone, Debug)]
pub struct ArdCov<F: Float> {
    x_train: Array2<F>,
    /// Group of each feature column
    groups: Vec<usize>,
    /// Feature columns of each group
    group_columns: Vec<Vec<usize>>,
    rbf: bool,
}

impl<F: Float> ArdCov<F> {
    /// Constructor from training features (n_train, n_features)
    pub fn new(x_train: Array2<F>, mode: KernelMode, rbf: bool) -> Result<Self> {
        let n_features = x_train.ncols();
        if x_train.nrows() == 0 || n_features == 0 {
            return Err(GpError::DimensionError(format!(
                "training features cannot be empty, got ({}, {})",
                x_train.nrows(),
                n_features
            )));
        }
        let groups: Vec<usize> = match mode {
            KernelMode::Ard { path_dims } => {
                if path_dims == 0 || n_features % path_dims != 0 {
                    return Err(GpError::DimensionError(format!(
                        "{n_features} features cannot be split into paths of dimension {path_dims}"
                    )));
                }
                (0..n_features).map(|j| j % path_dims).collect()
            }
            KernelMode::ArdFull => (0..n_features).collect(),
            _ => {
                return Err(GpError::InvalidValueError(format!(
                    "{mode} kernel does not work on raw features"
                )))
            }
        };
        let n_groups = mode.n_lengthscales(n_features);
        let mut group_columns = vec![Vec::new(); n_groups];
        groups
            .iter()
            .enumerate()
            .for_each(|(j, &g)| group_columns[g].push(j));
        Ok(ArdCov {
            x_train,
            groups,
            group_columns,
            rbf,
        })
    }

    /// Features divided column-wise by their group lengthscale
    fn scaled(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        hyp: &Hyperparameters<F>,
    ) -> Array2<F> {
        let ls = Array1::from_iter(self.groups.iter().map(|&g| hyp.lengthscale[g]));
        x / &ls
    }

    fn kernel(&self, z1: &Array2<F>, z2: &Array2<F>, variance: F) -> Array2<F> {
        if self.rbf {
            let half = F::cast(0.5);
            pairwise_sq_distances(z1, z2).mapv(|d| variance * (-half * d).exp())
        } else {
            z1.dot(&z2.t()).mapv(|v| variance * (F::one() + v))
        }
    }
}

impl<F: Float> CovarianceModel<F> for ArdCov<F> {
    fn n_lengthscales(&self) -> usize {
        self.group_columns.len()
    }

    fn n_train(&self) -> usize {
        self.x_train.nrows()
    }

    fn train_block(&self, hyp: &Hyperparameters<F>) -> Array2<F> {
        let z = self.scaled(&self.x_train, hyp);
        self.kernel(&z, &z, hyp.variance)
    }

    fn train_block_derivatives(&self, hyp: &Hyperparameters<F>, k: &Array2<F>) -> Vec<Array2<F>> {
        let z = self.scaled(&self.x_train, hyp);
        let two = F::cast(2.);
        let mut derivatives: Vec<Array2<F>> = self
            .group_columns
            .iter()
            .enumerate()
            .map(|(g, cols)| {
                let l = hyp.lengthscale[g];
                let zg = z.select(Axis(1), cols);
                if self.rbf {
                    // d/dl exp(-s / 2l^2) = exp(-s / 2l^2) * s / l^3 with s / l^2 = |zg - zg'|^2
                    let mut dk = pairwise_sq_distances(&zg, &zg);
                    Zip::from(&mut dk)
                        .and(k)
                        .for_each(|d, &kij| *d = kij * *d / l);
                    dk
                } else {
                    // d/dl (x x' / l^2) = -2 x x' / l^3
                    zg.dot(&zg.t()) * (-two * hyp.variance / l)
                }
            })
            .collect();
        derivatives.push(k / hyp.variance);
        derivatives
    }

    fn cross_block(&self, hyp: &Hyperparameters<F>, query: &Query<F>) -> Result<(Array2<F>, Array1<F>)> {
        let x = match query {
            Query::Features(x) => x,
            _ => {
                return Err(GpError::InvalidValueError(
                    "ARD kernel expects feature rows as query".to_string(),
                ))
            }
        };
        if x.ncols() != self.x_train.ncols() {
            return Err(GpError::DimensionError(format!(
                "query has {} features, training data has {}",
                x.ncols(),
                self.x_train.ncols()
            )));
        }
        let z_train = self.scaled(&self.x_train, hyp);
        let z = self.scaled(x, hyp);
        let cross = self.kernel(&z_train, &z, hyp.variance);
        let diag = if self.rbf {
            Array1::from_elem(z.nrows(), hyp.variance)
        } else {
            z.map_axis(Axis(1), |r| hyp.variance * (F::one() + r.dot(&r)))
        };
        Ok((cross, diag))
    }
}

/// The covariance model of a GP, selected by its [`KernelMode`]
#[derive(Clone, Debug)]
pub enum Covariance<F: Float> {
    /// Precomputed base kernel, linear or RBF wrapped
    Precomputed(PrecomputedCov<F>),
    /// Kernel on raw features
    Ard(ArdCov<F>),
}

impl<F: Float> CovarianceModel<F> for Covariance<F> {
    fn n_lengthscales(&self) -> usize {
        match self {
            Covariance::Precomputed(c) => c.n_lengthscales(),
            Covariance::Ard(c) => c.n_lengthscales(),
        }
    }

    fn n_train(&self) -> usize {
        match self {
            Covariance::Precomputed(c) => c.n_train(),
            Covariance::Ard(c) => c.n_train(),
        }
    }

    fn train_block(&self, hyp: &Hyperparameters<F>) -> Array2<F> {
        match self {
            Covariance::Precomputed(c) => c.train_block(hyp),
            Covariance::Ard(c) => c.train_block(hyp),
        }
    }

    fn train_block_derivatives(&self, hyp: &Hyperparameters<F>, k: &Array2<F>) -> Vec<Array2<F>> {
        match self {
            Covariance::Precomputed(c) => c.train_block_derivatives(hyp, k),
            Covariance::Ard(c) => c.train_block_derivatives(hyp, k),
        }
    }

    fn cross_block(&self, hyp: &Hyperparameters<F>, query: &Query<F>) -> Result<(Array2<F>, Array1<F>)> {
        match self {
            Covariance::Precomputed(c) => c.cross_block(hyp, query),
            Covariance::Ard(c) => c.cross_block(hyp, query),
        }
    }
}
