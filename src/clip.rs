//! Iterative sigma-clipping against a fitted model.
//!
//! Each round fits the model to the currently-included channels, derives a
//! residual variance from the included residuals, and re-tests every channel
//! against `nsigma` standard deviations. The loop stops when the mask is
//! stable, everything is clipped, or the iteration cap is hit.

use derive_builder::Builder;
use itertools::izip;

use crate::error::UvclipError;
use crate::model::FitModel;

/// How the mask for the next round is derived from the residual test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// A channel clipped in any round stays clipped; the next mask is the
    /// current mask ANDed with the residual test.
    MonotonicShrink,
    /// The residual test alone decides the next mask, so a channel clipped
    /// early can return once the fit tightens.
    FullRecompute,
}

/// Parameters controlling a clip run.
#[derive(Builder, Debug, Clone)]
pub struct ClipParams {
    /// Residual threshold in standard deviations.
    #[builder(default = "3.0")]
    pub nsigma: f64,
    /// Iteration cap.
    #[builder(default = "10")]
    pub max_iters: usize,
    /// Mask update policy.
    #[builder(default = "MaskPolicy::FullRecompute")]
    pub policy: MaskPolicy,
}

impl Default for ClipParams {
    fn default() -> Self {
        ClipParamsBuilder::default()
            .build()
            .expect("all fields have defaults")
    }
}

impl ClipParams {
    /// Check that the parameters describe a runnable clip.
    pub fn validate(&self) -> Result<(), UvclipError> {
        if !self.nsigma.is_finite() || self.nsigma <= 0.0 {
            return Err(UvclipError::BadNSigma {
                nsigma: self.nsigma,
            });
        }
        if self.max_iters < 1 {
            return Err(UvclipError::BadMaxIters {
                max_iters: self.max_iters,
            });
        }
        Ok(())
    }
}

/// The result of a real-valued clip run.
#[derive(Debug, Clone)]
pub struct ClipOutcome {
    /// Final inclusion mask (true = included).
    pub mask: Vec<bool>,
    /// Model prediction per channel from the final fit.
    pub model: Vec<f64>,
    /// Residual variance from the final fit.
    pub variance: f64,
    /// Number of fit rounds performed.
    pub iterations: usize,
    /// Whether the mask stabilised before the iteration cap.
    pub converged: bool,
}

/// The result of a complex-valued clip run; real and imaginary parts are
/// fitted separately but share one mask and one variance.
#[derive(Debug, Clone)]
pub struct ComplexClipOutcome {
    /// Final inclusion mask (true = included).
    pub mask: Vec<bool>,
    /// Real-part model prediction per channel from the final fit.
    pub model_re: Vec<f64>,
    /// Imaginary-part model prediction per channel from the final fit.
    pub model_im: Vec<f64>,
    /// Combined residual variance from the final fit.
    pub variance: f64,
    /// Number of fit rounds performed.
    pub iterations: usize,
    /// Whether the mask stabilised before the iteration cap.
    pub converged: bool,
}

fn check_lengths(
    function: &'static str,
    expected: usize,
    argument: &'static str,
    received: usize,
) -> Result<(), UvclipError> {
    if expected != received {
        return Err(UvclipError::BadArrayShape {
            argument,
            function,
            expected: format!("{expected}"),
            received: format!("{received}"),
        });
    }
    Ok(())
}

/// Sigma-clip a real-valued spectrum against `model`.
///
/// The initial mask marks which channels are eligible at all (`None` means
/// every channel); with [`MaskPolicy::FullRecompute`] an initially-excluded
/// channel can be re-included once the fit settles.
///
/// # Errors
///
/// [`UvclipError::BadNSigma`] and [`UvclipError::BadMaxIters`] for bad
/// parameters, [`UvclipError::BadArrayShape`] for a mask/values length
/// mismatch, and [`UvclipError::DegenerateFit`] when the model cannot be
/// fitted to the included subset.
pub fn clip_real(
    values: &[f64],
    initial_mask: Option<&[bool]>,
    model: &mut dyn FitModel,
    params: &ClipParams,
) -> Result<ClipOutcome, UvclipError> {
    params.validate()?;

    let mut mask = match initial_mask {
        Some(initial_mask) => {
            check_lengths("clip_real", values.len(), "initial_mask", initial_mask.len())?;
            initial_mask.to_vec()
        }
        None => vec![true; values.len()],
    };
    for iteration in 1..=params.max_iters {
        let fit = model.fit(values, &mask)?;
        let num_included = mask.iter().filter(|&&m| m).count();

        let chisq: f64 = izip!(values, &fit.predictions, &mask)
            .filter(|(_, _, &m)| m)
            .map(|(&v, &p, _)| (v - p) * (v - p))
            .sum();
        let dof = num_included.saturating_sub(fit.num_params);
        if dof == 0 {
            // the model interpolates the included points exactly; a zero
            // threshold would clip on rounding noise alone
            return Ok(ClipOutcome {
                mask,
                model: fit.predictions,
                variance: 0.0,
                iterations: iteration,
                converged: true,
            });
        }
        let variance = chisq / dof as f64;
        let threshold = params.nsigma * variance.sqrt();

        let new_mask: Vec<bool> = izip!(values, &fit.predictions, &mask)
            .map(|(&v, &p, &m)| {
                let pass = (v - p).abs() <= threshold;
                match params.policy {
                    MaskPolicy::MonotonicShrink => m && pass,
                    MaskPolicy::FullRecompute => pass,
                }
            })
            .collect();

        let stable = new_mask == mask;
        let all_clipped = new_mask.iter().all(|&m| !m);
        if stable || all_clipped || iteration == params.max_iters {
            return Ok(ClipOutcome {
                mask: new_mask,
                model: fit.predictions,
                variance,
                iterations: iteration,
                converged: stable || all_clipped,
            });
        }
        mask = new_mask;
    }
    unreachable!("loop always returns by the iteration cap")
}

/// Sigma-clip a complex-valued spectrum.
///
/// Real and imaginary parts are fitted independently on the shared mask each
/// round. The residual test is on the combined squared residual
/// `rr² + ii² ≤ nsigma · σ²`, with the variance taken over all channels as
/// `(χ²_re + χ²_im) / (nchan − 1)`.
///
/// # Errors
///
/// As [`clip_real`], plus [`UvclipError::DegenerateFit`] for spectra of fewer
/// than two channels.
pub fn clip_complex(
    values_re: &[f64],
    values_im: &[f64],
    initial_mask: Option<&[bool]>,
    model_re: &mut dyn FitModel,
    model_im: &mut dyn FitModel,
    params: &ClipParams,
) -> Result<ComplexClipOutcome, UvclipError> {
    params.validate()?;
    let nchan = values_re.len();
    check_lengths("clip_complex", nchan, "values_im", values_im.len())?;
    let mut mask = match initial_mask {
        Some(initial_mask) => {
            check_lengths("clip_complex", nchan, "initial_mask", initial_mask.len())?;
            initial_mask.to_vec()
        }
        None => vec![true; nchan],
    };
    if nchan < 2 {
        return Err(UvclipError::DegenerateFit {
            num_included: nchan,
            num_params: 2,
        });
    }
    for iteration in 1..=params.max_iters {
        let fit_re = model_re.fit(values_re, &mask)?;
        let fit_im = model_im.fit(values_im, &mask)?;

        let chisq: f64 = mask
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(i, _)| {
                let rr = values_re[i] - fit_re.predictions[i];
                let ii = values_im[i] - fit_im.predictions[i];
                rr * rr + ii * ii
            })
            .sum();
        let variance = chisq / (nchan - 1) as f64;
        let threshold = params.nsigma * variance;

        let new_mask: Vec<bool> = (0..nchan)
            .map(|i| {
                let rr = values_re[i] - fit_re.predictions[i];
                let ii = values_im[i] - fit_im.predictions[i];
                let pass = rr * rr + ii * ii <= threshold;
                match params.policy {
                    MaskPolicy::MonotonicShrink => mask[i] && pass,
                    MaskPolicy::FullRecompute => pass,
                }
            })
            .collect();

        let stable = new_mask == mask;
        let all_clipped = new_mask.iter().all(|&m| !m);
        if stable || all_clipped || iteration == params.max_iters {
            return Ok(ComplexClipOutcome {
                mask: new_mask,
                model_re: fit_re.predictions,
                model_im: fit_im.predictions,
                variance,
                iterations: iteration,
                converged: stable || all_clipped,
            });
        }
        mask = new_mask;
    }
    unreachable!("loop always returns by the iteration cap")
}
