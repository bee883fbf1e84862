//! Kernel matrix construction from feature rows or from a precomputed base kernel.
//!
//! The base kernel is the shifted linear kernel `k(x, x') = 1 + <x, x'>`, the one used
//! on (expected) signature features. A base kernel `K`, whatever its origin, defines an
//! implicit feature space in which `K[i][i] + K[j][j] - 2 K[i][j]` is a squared distance,
//! hence the RBF wrapping available here to get a non-linear kernel on top of it.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, Zip};

fn check_square<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    what: &str,
) -> Result<usize> {
    if k.nrows() != k.ncols() {
        return Err(GpError::DimensionError(format!(
            "{what} should be a square matrix, got ({}, {})",
            k.nrows(),
            k.ncols()
        )));
    }
    Ok(k.nrows())
}

fn check_indices(indices: &[usize], bound: usize) -> Result<()> {
    if let Some(i) = indices.iter().find(|&&i| i >= bound) {
        return Err(GpError::DimensionError(format!(
            "index {i} out of range for a kernel of size {bound}"
        )));
    }
    Ok(())
}

/// Compute the Gram matrix `K[i][j] = 1 + <x_i, x_j>` of the rows of `x` (n, d).
///
/// Each pair is computed once and mirrored so the result is exactly symmetric.
pub fn linear_gram<F: Float>(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
    let n = x.nrows();
    let mut k = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let v = F::one() + x.row(i).dot(&x.row(j));
            k[[i, j]] = v;
            k[[j, i]] = v;
        }
    }
    k
}

/// Same as [`linear_gram`] for feature vectors given separately,
/// fails with `DimensionError` when their lengths differ.
pub fn linear_gram_rows<F: Float>(rows: &[Array1<F>]) -> Result<Array2<F>> {
    let dim = rows.first().map_or(0, |r| r.len());
    if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
        return Err(GpError::DimensionError(format!(
            "feature vector {i} has length {}, expected {dim}",
            r.len()
        )));
    }
    let mut x = Array2::zeros((rows.len(), dim));
    Zip::from(x.rows_mut())
        .and(rows)
        .for_each(|mut row, r| row.assign(r));
    Ok(linear_gram(&x))
}

/// Compute the rectangular kernel `K[i][j] = 1 + <x1_i, x2_j>` between rows of `x1` (n1, d)
/// and rows of `x2` (n2, d).
pub fn linear_cross<F: Float>(
    x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
    x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    if x1.ncols() != x2.ncols() {
        return Err(GpError::DimensionError(format!(
            "feature dimensions differ: {} vs {}",
            x1.ncols(),
            x2.ncols()
        )));
    }
    Ok(x1.dot(&x2.t()).mapv(|v| F::one() + v))
}

/// Grow the Gram matrix `k` of `x_train` rows with one new point `x_test`.
///
/// The returned (n+1, n+1) matrix keeps `k` untouched in its top-left block.
pub fn augment<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    x_train: &ArrayBase<impl Data<Elem = F>, Ix2>,
    x_test: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<Array2<F>> {
    let n = check_square(k, "kernel to augment")?;
    if n != x_train.nrows() {
        return Err(GpError::DimensionError(format!(
            "kernel size {n} does not match the number of training points {}",
            x_train.nrows()
        )));
    }
    if x_test.len() != x_train.ncols() {
        return Err(GpError::DimensionError(format!(
            "test point has {} components, training points have {}",
            x_test.len(),
            x_train.ncols()
        )));
    }
    let mut k_aug = Array2::zeros((n + 1, n + 1));
    k_aug.slice_mut(ndarray::s![..n, ..n]).assign(k);
    for (i, xi) in x_train.rows().into_iter().enumerate() {
        let v = F::one() + xi.dot(x_test);
        k_aug[[n, i]] = v;
        k_aug[[i, n]] = v;
    }
    k_aug[[n, n]] = F::one() + x_test.dot(x_test);
    Ok(k_aug)
}

/// Extract the `K[rows][:, cols]` block of a kernel matrix
pub fn slice<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    rows: &[usize],
    cols: &[usize],
) -> Result<Array2<F>> {
    check_indices(rows, k.nrows())?;
    check_indices(cols, k.ncols())?;
    Ok(k.select(Axis(0), rows).select(Axis(1), cols))
}

/// Extract the `K[idx][:, idx]` block of a kernel matrix
pub fn slice_square<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    idx: &[usize],
) -> Result<Array2<F>> {
    slice(k, idx, idx)
}

/// Squared distances in the feature space implied by a kernel block:
/// `diag_rows[i] + diag_cols[j] - 2 K[i][j]`, floored at 0 against round-off.
pub(crate) fn implicit_sq_distances<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag_rows: &ArrayBase<impl Data<Elem = F>, Ix1>,
    diag_cols: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Array2<F> {
    let two = F::cast(2.);
    let mut d = Array2::zeros(k.raw_dim());
    Zip::indexed(&mut d).and(k).for_each(|(i, j), d, &kij| {
        *d = (diag_rows[i] + diag_cols[j] - two * kij).max(F::zero());
    });
    d
}

/// Squared euclidean distances between rows of `a` (n, d) and rows of `b` (m, d)
pub(crate) fn pairwise_sq_distances<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    let norms_a = a.map_axis(Axis(1), |r| r.dot(&r));
    let norms_b = b.map_axis(Axis(1), |r| r.dot(&r));
    implicit_sq_distances(&a.dot(&b.t()), &norms_a, &norms_b)
}

fn check_lengthscale<F: Float>(lengthscale: F) -> Result<()> {
    if lengthscale <= F::zero() || !lengthscale.is_finite() {
        return Err(GpError::InvalidValueError(format!(
            "RBF lengthscale should be strictly positive, got {lengthscale}"
        )));
    }
    Ok(())
}

/// RBF kernel in the feature space of the square kernel `k`:
/// `exp(-(K[i][i] + K[j][j] - 2 K[i][j]) / (2 l^2))`
pub fn rbf_wrap<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    lengthscale: F,
) -> Result<Array2<F>> {
    check_square(k, "kernel to wrap")?;
    let diag = k.diag();
    rbf_wrap_cross(k, &diag, &diag, lengthscale)
}

/// RBF wrapping of a rectangular block `K[rows][:, cols]` given the self-kernel values
/// of the rows (`diag_rows`) and of the columns (`diag_cols`).
pub fn rbf_wrap_cross<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag_rows: &ArrayBase<impl Data<Elem = F>, Ix1>,
    diag_cols: &ArrayBase<impl Data<Elem = F>, Ix1>,
    lengthscale: F,
) -> Result<Array2<F>> {
    check_lengthscale(lengthscale)?;
    if diag_rows.len() != k.nrows() || diag_cols.len() != k.ncols() {
        return Err(GpError::DimensionError(format!(
            "diagonals ({}, {}) do not match kernel block ({}, {})",
            diag_rows.len(),
            diag_cols.len(),
            k.nrows(),
            k.ncols()
        )));
    }
    let scale = F::cast(2.) * lengthscale * lengthscale;
    Ok(implicit_sq_distances(k, diag_rows, diag_cols).mapv(|d| (-d / scale).exp()))
}

/// Flatten bags given as (length, dim) arrays into a (n_bags, length * dim) feature matrix.
///
/// Layout is time-major: component `c` at time step `t` lands in column `t * dim + c`,
/// so `column % dim` gives back the path dimension.
pub fn flatten_bags<F: Float>(bags: &[Array2<F>]) -> Result<Array2<F>> {
    let shape = match bags.first() {
        Some(b) => b.dim(),
        None => return Ok(Array2::zeros((0, 0))),
    };
    if let Some((i, b)) = bags.iter().enumerate().find(|(_, b)| b.dim() != shape) {
        return Err(GpError::DimensionError(format!(
            "bag {i} has shape {:?}, expected {shape:?}",
            b.dim()
        )));
    }
    let mut x = Array2::zeros((bags.len(), shape.0 * shape.1));
    Zip::from(x.rows_mut()).and(bags).for_each(|mut row, bag| {
        row.iter_mut()
            .zip(bag.iter())
            .for_each(|(r, &v)| *r = v);
    });
    Ok(x)
}
