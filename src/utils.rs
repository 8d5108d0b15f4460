use crate::errors::{GpError, Result};
use crate::priors::Prior;
use linfa::Float;
use linfa_linalg::triangular::*;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};

/// Prior mean `[m, dm_1, ..., dm_D]` computed at a probe of ones and repeated
/// for each of the `n_samples` observations, resulting in a (n_samples * (1 + D),) vector
pub(crate) fn tiled_prior_mean<F: Float, P: Prior<F>>(
    prior: &P,
    n_samples: usize,
    n_derivatives: usize,
) -> Result<Array1<F>> {
    let mean = prior.prior(&Array1::<F>::ones(n_derivatives));
    if mean.len() != n_derivatives + 1 {
        return Err(GpError::ShapeError(format!(
            "prior {} returns {} components, expected {}",
            prior,
            mean.len(),
            n_derivatives + 1
        )));
    }
    Ok((0..n_samples).flat_map(|_| mean.iter().copied()).collect())
}

/// Per row regularization: `noise * noisefactor` for the value row
/// and `noise` for each of the `n_derivatives` derivative rows of every sample
pub(crate) fn regularization<F: Float>(
    noise: F,
    noisefactor: F,
    n_samples: usize,
    n_derivatives: usize,
) -> Array1<F> {
    (0..n_samples)
        .flat_map(|_| {
            std::iter::once(noise * noisefactor)
                .chain(std::iter::repeat(noise).take(n_derivatives))
        })
        .collect()
}

/// Targets flattened row by row: `[y_1, dy_1, ..., y_n, dy_n]`
pub(crate) fn flatten<F: Float>(y: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
    y.iter().copied().collect()
}

/// Solve `L.L^T.x = b` given the lower cholesky factor `L`
pub(crate) fn cho_solve<F: Float>(l: &Array2<F>, b: &Array1<F>) -> Result<Array1<F>> {
    let b = b.to_owned().insert_axis(Axis(1));
    let z = l.solve_triangular_into(b, UPLO::Lower)?;
    let x = l.t().solve_triangular_into(z, UPLO::Upper)?;
    Ok(x.index_axis_move(Axis(1), 0))
}

#[inline(always)]
pub(crate) fn into_f64<F: Float>(v: &F) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}
