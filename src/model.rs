//! Fit models for the sigma-clipping filter.
//!
//! A model smooths the currently-included subset of a spectrum and predicts a
//! value for every channel, included or not. The clip loop in [`crate::clip`]
//! only ever talks to the [`FitModel`] trait, so anything from a running mean
//! to a B-spline regression can drive the residual test.

use ndarray::{Array1, Array2};

use crate::error::UvclipError;

/// B-spline order used by the bandpass smoother (order 4 = cubic).
pub const SPLINE_ORDER: usize = 4;

/// The result of fitting a model to the included subset of a spectrum.
#[derive(Debug, Clone)]
pub struct ModelFit {
    /// Model prediction for every channel, masked or not.
    pub predictions: Vec<f64>,
    /// Number of free parameters, for degrees-of-freedom accounting.
    pub num_params: usize,
}

/// A smoother that can be fitted to the included subset of a spectrum.
pub trait FitModel {
    /// Fit the model to `values` where `mask` is true, predicting every
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`UvclipError::DegenerateFit`] when the masked subset cannot
    /// constrain the model (too few points, or a rank-deficient system), and
    /// [`UvclipError::BadArrayShape`] when `mask` and `values` disagree in
    /// length.
    fn fit(&mut self, values: &[f64], mask: &[bool]) -> Result<ModelFit, UvclipError>;
}

fn check_mask_len(
    function: &'static str,
    values: &[f64],
    mask: &[bool],
) -> Result<(), UvclipError> {
    if values.len() != mask.len() {
        return Err(UvclipError::BadArrayShape {
            argument: "mask",
            function,
            expected: format!("{}", values.len()),
            received: format!("{}", mask.len()),
        });
    }
    Ok(())
}

/// The simplest smoother: the mean of the included values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanModel;

impl FitModel for MeanModel {
    fn fit(&mut self, values: &[f64], mask: &[bool]) -> Result<ModelFit, UvclipError> {
        check_mask_len("MeanModel::fit", values, mask)?;
        let num_included = mask.iter().filter(|&&m| m).count();
        if num_included < 1 {
            return Err(UvclipError::DegenerateFit {
                num_included,
                num_params: 1,
            });
        }
        let sum: f64 = values
            .iter()
            .zip(mask.iter())
            .filter(|(_, &m)| m)
            .map(|(&v, _)| v)
            .sum();
        let mean = sum / num_included as f64;
        Ok(ModelFit {
            predictions: vec![mean; values.len()],
            num_params: 1,
        })
    }
}

/// Least-squares polynomial in channel index.
#[derive(Debug, Clone, Copy)]
pub struct PolynomialModel {
    /// Polynomial degree; parameter count is `degree + 1`.
    pub degree: usize,
}

impl FitModel for PolynomialModel {
    fn fit(&mut self, values: &[f64], mask: &[bool]) -> Result<ModelFit, UvclipError> {
        check_mask_len("PolynomialModel::fit", values, mask)?;
        let nchan = values.len();
        let num_params = self.degree + 1;
        // channel index scaled to [0, 1] so the normal equations stay
        // well-conditioned for wide spectra
        let scale = if nchan > 1 { (nchan - 1) as f64 } else { 1.0 };
        let mut design = Array2::<f64>::zeros((nchan, num_params));
        for i in 0..nchan {
            let x = i as f64 / scale;
            let mut pow = 1.0;
            for j in 0..num_params {
                design[[i, j]] = pow;
                pow *= x;
            }
        }
        wlinear(&design, values, mask)
    }
}

/// Cubic B-spline regression over channel index, the bandpass smoother.
///
/// The coefficient count defaults to one spline per 32 channels
/// (`(nchan + 31) / 32`), clamped so there are always at least two
/// breakpoints. The design matrix only depends on the channel count, so it is
/// cached and reused across records of the same shape.
#[derive(Debug, Clone, Default)]
pub struct BSplineModel {
    num_coeffs: Option<usize>,
    cache: Option<(usize, usize, Array2<f64>)>,
}

impl BSplineModel {
    /// Create a model with the default coefficient count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a model with an explicit coefficient count (the `nbs` keyword
    /// of the original task). Values too small for a cubic basis are clamped
    /// up to the minimum.
    pub fn with_num_coeffs(num_coeffs: usize) -> Self {
        Self {
            num_coeffs: Some(num_coeffs),
            cache: None,
        }
    }

    /// The coefficient count that a spectrum of `nchan` channels gets.
    pub fn num_coeffs_for(&self, nchan: usize) -> usize {
        let ncoeff = match self.num_coeffs {
            Some(n) if n > 0 => n,
            _ => (nchan + 31) / 32,
        };
        let nbreak = (ncoeff + 2).saturating_sub(SPLINE_ORDER);
        if nbreak < 2 {
            // at least two breakpoints; ncoeff = nbreak + k - 2
            2 + SPLINE_ORDER - 2
        } else {
            ncoeff
        }
    }

    fn ensure_design(&mut self, nchan: usize) {
        let ncoeff = self.num_coeffs_for(nchan);
        let stale = match &self.cache {
            Some((n, c, _)) => *n != nchan || *c != ncoeff,
            None => true,
        };
        if stale {
            let nbreak = ncoeff + 2 - SPLINE_ORDER;
            let knots = uniform_knots(SPLINE_ORDER, nbreak, 0.0, (nchan - 1) as f64);
            let mut design = Array2::<f64>::zeros((nchan, ncoeff));
            for i in 0..nchan {
                let x = i as f64;
                for j in 0..ncoeff {
                    design[[i, j]] = bspline_basis(j, SPLINE_ORDER, x, &knots);
                }
            }
            self.cache = Some((nchan, ncoeff, design));
        }
    }
}

impl FitModel for BSplineModel {
    fn fit(&mut self, values: &[f64], mask: &[bool]) -> Result<ModelFit, UvclipError> {
        check_mask_len("BSplineModel::fit", values, mask)?;
        if values.is_empty() {
            return Err(UvclipError::DegenerateFit {
                num_included: 0,
                num_params: self.num_coeffs_for(1),
            });
        }
        self.ensure_design(values.len());
        match &self.cache {
            Some((_, _, design)) => wlinear(design, values, mask),
            None => unreachable!("design cache was just built"),
        }
    }
}

/// GSL-style uniform knot vector: `k - 1` repeated end knots on each side of
/// `nbreak` evenly spaced breakpoints.
fn uniform_knots(k: usize, nbreak: usize, a: f64, b: f64) -> Vec<f64> {
    let mut knots = Vec::with_capacity(nbreak + 2 * (k - 1));
    for _ in 0..k - 1 {
        knots.push(a);
    }
    for m in 0..nbreak {
        knots.push(a + (b - a) * m as f64 / (nbreak - 1) as f64);
    }
    for _ in 0..k - 1 {
        knots.push(b);
    }
    knots
}

/// Cox-de Boor recursion for the value of basis spline `i` of order `k` at
/// `x`, over knot vector `t`. The rightmost non-empty interval is closed so
/// the final channel is covered.
fn bspline_basis(i: usize, k: usize, x: f64, t: &[f64]) -> f64 {
    if k == 1 {
        let last = t[t.len() - 1];
        let within = t[i] <= x && x < t[i + 1];
        let at_edge = x == t[i + 1] && t[i] < t[i + 1] && t[i + 1] == last;
        return if within || at_edge { 1.0 } else { 0.0 };
    }
    let mut value = 0.0;
    let left_span = t[i + k - 1] - t[i];
    if left_span > 0.0 {
        value += (x - t[i]) / left_span * bspline_basis(i, k - 1, x, t);
    }
    let right_span = t[i + k] - t[i + 1];
    if right_span > 0.0 {
        value += (t[i + k] - x) / right_span * bspline_basis(i + 1, k - 1, x, t);
    }
    value
}

/// Weighted (0/1-mask) linear least squares via the normal equations.
///
/// Small parameter counts only; the normal matrix is dense-solved in place.
fn wlinear(design: &Array2<f64>, values: &[f64], mask: &[bool]) -> Result<ModelFit, UvclipError> {
    let (nrows, num_params) = design.dim();
    debug_assert_eq!(nrows, values.len());
    let num_included = mask.iter().filter(|&&m| m).count();
    if num_included < num_params {
        return Err(UvclipError::DegenerateFit {
            num_included,
            num_params,
        });
    }

    let mut normal = Array2::<f64>::zeros((num_params, num_params));
    let mut rhs = Array1::<f64>::zeros(num_params);
    for (row, (&value, &included)) in design.outer_iter().zip(values.iter().zip(mask.iter())) {
        if !included {
            continue;
        }
        for j in 0..num_params {
            rhs[j] += row[j] * value;
            for l in 0..num_params {
                normal[[j, l]] += row[j] * row[l];
            }
        }
    }

    let coeffs = solve_linear_system(&mut normal, &mut rhs).ok_or(UvclipError::DegenerateFit {
        num_included,
        num_params,
    })?;

    let predictions = design
        .outer_iter()
        .map(|row| row.iter().zip(coeffs.iter()).map(|(&d, &c)| d * c).sum())
        .collect();
    Ok(ModelFit {
        predictions,
        num_params,
    })
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting,
/// destructively. Returns `None` when the system is singular.
pub(crate) fn solve_linear_system(a: &mut Array2<f64>, b: &mut Array1<f64>) -> Option<Vec<f64>> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    debug_assert_eq!(n, b.len());

    for col in 0..n {
        // pivot
        let mut pivot_row = col;
        let mut pivot_val = a[[col, col]].abs();
        for row in col + 1..n {
            let v = a[[row, col]].abs();
            if v > pivot_val {
                pivot_row = row;
                pivot_val = v;
            }
        }
        if pivot_val < 1e-12 {
            return None;
        }
        if pivot_row != col {
            for j in 0..n {
                let tmp = a[[col, j]];
                a[[col, j]] = a[[pivot_row, j]];
                a[[pivot_row, j]] = tmp;
            }
            b.swap(col, pivot_row);
        }
        // eliminate below
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                a[[row, j]] -= factor * a[[col, j]];
            }
            b[row] -= factor * b[col];
        }
    }

    // back-substitute
    let mut x = vec![0.0; n];
    for col in (0..n).rev() {
        let mut sum = b[col];
        for j in col + 1..n {
            sum -= a[[col, j]] * x[j];
        }
        x[col] = sum / a[[col, col]];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    #[test]
    fn test_mean_model_uses_included_values_only() {
        let values = [1.0, 2.0, 3.0, 1000.0];
        let mask = [true, true, true, false];
        let fit = MeanModel.fit(&values, &mask).unwrap();
        assert_eq!(fit.num_params, 1);
        for &p in &fit.predictions {
            assert_abs_diff_eq!(p, 2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mean_model_empty_mask_is_degenerate() {
        let values = [1.0, 2.0];
        let mask = [false, false];
        let result = MeanModel.fit(&values, &mask);
        assert!(matches!(
            result,
            Err(UvclipError::DegenerateFit {
                num_included: 0,
                num_params: 1
            })
        ));
    }

    #[test]
    fn test_mean_model_mask_length_mismatch() {
        let result = MeanModel.fit(&[1.0, 2.0], &[true]);
        assert!(matches!(result, Err(UvclipError::BadArrayShape { .. })));
    }

    #[test]
    fn test_polynomial_model_fits_line_exactly() {
        let values: Vec<f64> = (0..6).map(|i| 1.0 + 2.0 * i as f64).collect();
        let mask = vec![true; 6];
        let fit = PolynomialModel { degree: 1 }
            .fit(&values, &mask)
            .unwrap();
        assert_eq!(fit.num_params, 2);
        for (p, v) in fit.predictions.iter().zip(values.iter()) {
            assert_abs_diff_eq!(p, v, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_polynomial_model_masked_point_has_no_influence() {
        let mut values: Vec<f64> = (0..8).map(|i| 5.0 - 0.5 * i as f64).collect();
        values[3] = 1e6;
        let mut mask = vec![true; 8];
        mask[3] = false;
        let fit = PolynomialModel { degree: 1 }
            .fit(&values, &mask)
            .unwrap();
        // prediction for the corrupted channel still comes from the line
        assert_abs_diff_eq!(fit.predictions[3], 5.0 - 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_bspline_default_coeff_counts() {
        let model = BSplineModel::new();
        // small spectra clamp up to the minimum cubic basis
        assert_eq!(model.num_coeffs_for(64), 4);
        // (256 + 31) / 32 = 8
        assert_eq!(model.num_coeffs_for(256), 8);
    }

    #[test]
    fn test_bspline_basis_partition_of_unity() {
        let nbreak = 6;
        let ncoeff = nbreak + SPLINE_ORDER - 2;
        let knots = uniform_knots(SPLINE_ORDER, nbreak, 0.0, 255.0);
        for i in 0..256 {
            let x = i as f64;
            let sum: f64 = (0..ncoeff)
                .map(|j| bspline_basis(j, SPLINE_ORDER, x, &knots))
                .sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_bspline_fits_cubic_exactly() {
        // a 4-coefficient cubic basis over 64 channels is a single cubic
        // segment, so cubic data is reproduced to rounding
        let values: Vec<f64> = (0..64)
            .map(|i| {
                let x = i as f64 / 63.0;
                1.0 + x - 0.5 * x * x + 2.0 * x * x * x
            })
            .collect();
        let mask = vec![true; 64];
        let mut model = BSplineModel::new();
        let fit = model.fit(&values, &mask).unwrap();
        assert_eq!(fit.num_params, 4);
        for (p, v) in fit.predictions.iter().zip(values.iter()) {
            assert_abs_diff_eq!(p, v, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_bspline_cache_reused_across_records() {
        let mut model = BSplineModel::new();
        let values = vec![1.0; 128];
        let mask = vec![true; 128];
        model.fit(&values, &mask).unwrap();
        let built = model.cache.as_ref().map(|(n, c, _)| (*n, *c));
        model.fit(&values, &mask).unwrap();
        assert_eq!(built, model.cache.as_ref().map(|(n, c, _)| (*n, *c)));
    }

    #[test]
    fn test_bspline_clustered_mask_is_degenerate() {
        // ten adjacent unmasked channels span too few knot intervals to
        // constrain an 8-coefficient basis over 256 channels
        let values = vec![1.0; 256];
        let mut mask = vec![false; 256];
        for m in mask.iter_mut().take(110).skip(100) {
            *m = true;
        }
        let mut model = BSplineModel::new();
        let result = model.fit(&values, &mask);
        assert!(matches!(result, Err(UvclipError::DegenerateFit { .. })));
    }

    #[test]
    fn test_solve_linear_system_simple() {
        let mut a = array![[2.0, 1.0], [1.0, 3.0]];
        let mut b = array![5.0, 10.0];
        let x = solve_linear_system(&mut a, &mut b).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_linear_system_singular() {
        let mut a = array![[1.0, 2.0], [2.0, 4.0]];
        let mut b = array![1.0, 2.0];
        assert!(solve_linear_system(&mut a, &mut b).is_none());
    }
}
