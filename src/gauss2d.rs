//! Levenberg-Marquardt fit of an elliptical 2D Gaussian to scattered points.
//!
//! The model is `a * exp(-((x - x0) / sx)^2 - ((y - y0) / sy)^2)` with
//! independent widths per axis and no rotation term. This is the shape used
//! for primary-beam work in [`crate::beam`], but it stands on its own for any
//! peaked surface.

use ndarray::{Array1, Array2};

use crate::error::UvclipError;
use crate::model::solve_linear_system;

/// Free parameters of the Gaussian: `[a, x0, sx, y0, sy]`.
pub const NUM_PARAMS: usize = 5;

/// Iteration cap for the solver.
pub const MAX_ITERATIONS: usize = 50;

/// Per-component step tolerance, absolute and relative.
const STEP_TOL: f64 = 1e-9;

/// Evaluate the Gaussian with parameters `[a, x0, sx, y0, sy]` at `(x, y)`.
pub fn gauss2d(params: &[f64; NUM_PARAMS], x: f64, y: f64) -> f64 {
    let [a, x0, sx, y0, sy] = *params;
    let u = (x - x0) / sx;
    let v = (y - y0) / sy;
    a * (-u * u - v * v).exp()
}

fn jacobian_row(params: &[f64; NUM_PARAMS], x: f64, y: f64) -> [f64; NUM_PARAMS] {
    let [a, x0, sx, y0, sy] = *params;
    let u = (x - x0) / sx;
    let v = (y - y0) / sy;
    let e = (-u * u - v * v).exp();
    [
        e,
        a * e * 2.0 * u / sx,
        a * e * 2.0 * u * u / sx,
        a * e * 2.0 * v / sy,
        a * e * 2.0 * v * v / sy,
    ]
}

fn sum_squared_residuals(params: &[f64; NUM_PARAMS], points: &[(f64, f64)], values: &[f64]) -> f64 {
    points
        .iter()
        .zip(values.iter())
        .map(|(&(x, y), &v)| {
            let r = v - gauss2d(params, x, y);
            r * r
        })
        .sum()
}

/// The result of a Gaussian fit.
#[derive(Debug, Clone)]
pub struct Gauss2dFit {
    /// Fitted parameters `[a, x0, sx, y0, sy]`.
    pub params: [f64; NUM_PARAMS],
    /// Parameter covariance, scaled by the residual variance when there are
    /// spare degrees of freedom.
    pub covariance: Array2<f64>,
    /// Euclidean norm of the final residual vector.
    pub residual_norm: f64,
    /// Number of accepted solver steps.
    pub iterations: usize,
    /// Whether the step tolerance was met before the iteration cap.
    pub converged: bool,
}

/// Fit the Gaussian to `values` sampled at `points`.
///
/// When `init` is `None` the starting guess takes the first value as the
/// amplitude, the origin as the centre, and the mean distance of the
/// off-centre points as both widths.
///
/// # Errors
///
/// [`UvclipError::BadArrayShape`] when `points` and `values` disagree in
/// length, [`UvclipError::DegenerateFit`] when there are fewer points than
/// parameters.
pub fn fit(
    points: &[(f64, f64)],
    values: &[f64],
    init: Option<[f64; NUM_PARAMS]>,
) -> Result<Gauss2dFit, UvclipError> {
    if points.len() != values.len() {
        return Err(UvclipError::BadArrayShape {
            argument: "values",
            function: "gauss2d::fit",
            expected: format!("{}", points.len()),
            received: format!("{}", values.len()),
        });
    }
    let n = points.len();
    if n < NUM_PARAMS {
        return Err(UvclipError::DegenerateFit {
            num_included: n,
            num_params: NUM_PARAMS,
        });
    }

    let mut params = match init {
        Some(p) => p,
        None => initial_guess(points, values),
    };
    let mut ssr = sum_squared_residuals(&params, points, values);
    let mut lambda = 1e-3;
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..MAX_ITERATIONS {
        // build J^T J and J^T r at the current parameters
        let mut jtj = Array2::<f64>::zeros((NUM_PARAMS, NUM_PARAMS));
        let mut jtr = Array1::<f64>::zeros(NUM_PARAMS);
        for (&(x, y), &v) in points.iter().zip(values.iter()) {
            let row = jacobian_row(&params, x, y);
            let r = v - gauss2d(&params, x, y);
            for j in 0..NUM_PARAMS {
                jtr[j] += row[j] * r;
                for l in 0..NUM_PARAMS {
                    jtj[[j, l]] += row[j] * row[l];
                }
            }
        }

        // damped trial steps until one reduces the residual
        let mut accepted = false;
        for _ in 0..8 {
            let mut damped = jtj.clone();
            for j in 0..NUM_PARAMS {
                damped[[j, j]] += lambda * jtj[[j, j]];
            }
            let mut rhs = jtr.clone();
            let delta = match solve_linear_system(&mut damped, &mut rhs) {
                Some(d) => d,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };
            let mut trial = params;
            for j in 0..NUM_PARAMS {
                trial[j] += delta[j];
            }
            let trial_ssr = sum_squared_residuals(&trial, points, values);
            if trial_ssr < ssr {
                params = trial;
                ssr = trial_ssr;
                lambda /= 10.0;
                iterations += 1;
                accepted = true;
                // per-component step test
                converged = delta
                    .iter()
                    .zip(params.iter())
                    .all(|(&d, &p)| d.abs() < STEP_TOL + STEP_TOL * p.abs());
                break;
            }
            lambda *= 10.0;
        }
        if !accepted || converged {
            break;
        }
    }

    let covariance = covariance(&params, points, n, ssr);
    Ok(Gauss2dFit {
        params,
        covariance,
        residual_norm: ssr.sqrt(),
        iterations,
        converged,
    })
}

fn initial_guess(points: &[(f64, f64)], values: &[f64]) -> [f64; NUM_PARAMS] {
    let a = values[0];
    let mut sum = 0.0;
    let mut count = 0;
    for &(x, y) in points {
        let norm = (x * x + y * y).sqrt();
        if norm > 0.0 {
            sum += norm;
            count += 1;
        }
    }
    let width = if count > 0 { sum / count as f64 } else { 1.0 };
    [a, 0.0, width, 0.0, width]
}

/// `(J^T J)^-1`, scaled by `ssr / (n - 5)` when `n > 5`. Falls back to the
/// identity when the final system is singular.
fn covariance(
    params: &[f64; NUM_PARAMS],
    points: &[(f64, f64)],
    n: usize,
    ssr: f64,
) -> Array2<f64> {
    let mut jtj = Array2::<f64>::zeros((NUM_PARAMS, NUM_PARAMS));
    for &(x, y) in points {
        let row = jacobian_row(params, x, y);
        for j in 0..NUM_PARAMS {
            for l in 0..NUM_PARAMS {
                jtj[[j, l]] += row[j] * row[l];
            }
        }
    }
    let mut inverse = Array2::<f64>::zeros((NUM_PARAMS, NUM_PARAMS));
    for col in 0..NUM_PARAMS {
        let mut a = jtj.clone();
        let mut b = Array1::<f64>::zeros(NUM_PARAMS);
        b[col] = 1.0;
        match solve_linear_system(&mut a, &mut b) {
            Some(x) => {
                for (row, &v) in x.iter().enumerate() {
                    inverse[[row, col]] = v;
                }
            }
            None => return Array2::eye(NUM_PARAMS),
        }
    }
    if n > NUM_PARAMS {
        let scale = ssr / (n - NUM_PARAMS) as f64;
        inverse.mapv_inplace(|v| v * scale);
    }
    inverse
}
