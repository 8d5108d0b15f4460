use crate::parameters::HyperOptAlgorithm;
use finitediff::FiniteDiff;
use std::cell::Cell;

/// Bound used in place of an infinite one when a hyperparameter is not bounded
pub(crate) const UNBOUNDED: f64 = 1e8;

/// Settings of one hyperparameters minimization
pub(crate) struct OptimParams {
    pub algorithm: HyperOptAlgorithm,
    pub ftol_rel: f64,
    pub ftol_abs: f64,
    pub maxeval: usize,
}

/// Outcome of a minimization
#[derive(Debug)]
pub(crate) struct OptimResult {
    pub fmin: f64,
    pub x_opt: Vec<f64>,
    pub converged: bool,
}

/// Central finite differences gradient of `objfn` at `x`.
/// Non finite components, due to rejected trial points, are zeroed.
pub(crate) fn gradient<ObjF>(objfn: &ObjF, x: &[f64]) -> Vec<f64>
where
    ObjF: Fn(&[f64]) -> f64,
{
    let f = |x: &Vec<f64>| objfn(x);
    x.to_vec()
        .central_diff(&f)
        .into_iter()
        .map(|g| if g.is_finite() { g } else { 0. })
        .collect()
}

/// Gradient components cancelled when pointing outside `bounds` at an active bound
pub(crate) fn projected_gradient(grad: &[f64], x: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    grad.iter()
        .zip(x)
        .zip(bounds)
        .map(|((g, v), (lo, up))| {
            if (*v <= *lo && *g > 0.) || (*v >= *up && *g < 0.) {
                0.
            } else {
                *g
            }
        })
        .collect()
}

/// Minimize `objfn` within `bounds` starting from `param0`.
///
/// The search is reported as converged when the minimizer stops with a finite minimum
/// before exhausting its evaluations budget, either on a tolerance criterion or
/// because round-off errors prevent any further progress.
pub(crate) fn optimize_params<ObjF>(
    objfn: ObjF,
    param0: &[f64],
    bounds: &[(f64, f64)],
    params: OptimParams,
) -> OptimResult
where
    ObjF: Fn(&[f64]) -> f64,
{
    let n_eval = Cell::new(0usize);
    let counted = |x: &[f64]| {
        n_eval.set(n_eval.get() + 1);
        objfn(x)
    };

    let res = match params.algorithm {
        HyperOptAlgorithm::Slsqp => {
            let cons: Vec<fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64> = vec![];
            slsqp::minimize(
                |x: &[f64], grad: Option<&mut [f64]>, _u: &mut ()| {
                    if let Some(grad) = grad {
                        grad.copy_from_slice(&gradient(&objfn, x));
                    }
                    counted(x)
                },
                param0,
                bounds,
                &cons,
                (),
                params.maxeval,
                Some(slsqp::StopTols {
                    ftol_rel: params.ftol_rel,
                    ftol_abs: params.ftol_abs,
                    ..slsqp::StopTols::default()
                }),
            )
            .map(|(_, x_opt, fmin)| (x_opt, fmin))
            .or_else(|(status, x_opt, fmin)| {
                log::warn!("Slsqp optimizer stopped with status={status:?}");
                match status {
                    slsqp::FailStatus::RoundoffLimited => Ok((x_opt, fmin)),
                    _ => Err(x_opt),
                }
            })
        }
        HyperOptAlgorithm::Cobyla => {
            let cons: Vec<fn(&[f64], &mut ()) -> f64> = vec![];
            cobyla::minimize(
                |x: &[f64], _u: &mut ()| counted(x),
                param0,
                bounds,
                &cons,
                (),
                params.maxeval,
                cobyla::RhoBeg::All(0.5),
                Some(cobyla::StopTols {
                    ftol_rel: params.ftol_rel,
                    ftol_abs: params.ftol_abs,
                    ..cobyla::StopTols::default()
                }),
            )
            .map(|(_, x_opt, fmin)| (x_opt, fmin))
            .or_else(|(status, x_opt, fmin)| {
                log::warn!("Cobyla optimizer stopped with status={status:?}");
                match status {
                    cobyla::FailStatus::RoundoffLimited => Ok((x_opt, fmin)),
                    _ => Err(x_opt),
                }
            })
        }
    };

    let exhausted = n_eval.get() >= params.maxeval;
    match res {
        Ok((x_opt, fmin)) => {
            let fmin = if f64::is_nan(fmin) { f64::INFINITY } else { fmin };
            OptimResult {
                converged: !exhausted && fmin.is_finite(),
                fmin,
                x_opt,
            }
        }
        Err(x_opt) => OptimResult {
            fmin: f64::INFINITY,
            x_opt,
            converged: false,
        },
    }
}
