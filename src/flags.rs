//! Flagging operations over visibility cubes.
//!
//! Both operations walk a `[timestep][channel][baseline]` cube of complex
//! visibilities and a matching cube of flags (true = flagged), clipping each
//! baseline-timestep spectrum along the channel axis:
//!
//! - [`flag_birdies`] clips narrowband interference against the spectrum
//!   mean. Flags only ever accumulate: a channel that was flagged on input
//!   stays flagged.
//! - [`flag_bandpass`] clips against a cubic B-spline bandpass model and
//!   rewrites the flags outright, so an input flag on a channel the model
//!   finds consistent is released.

use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, trace, warn};
use ndarray::{ArrayView3, ArrayViewMut3, Axis};
use num_complex::Complex;
use rayon::prelude::*;

use crate::clip::{clip_complex, ClipParams, ClipParamsBuilder, MaskPolicy};
use crate::error::UvclipError;
use crate::model::{BSplineModel, MeanModel};

/// Parameters for the array-level flagging operations.
#[derive(Builder, Debug, Clone)]
pub struct FlagParams {
    /// Residual threshold in standard deviations.
    #[builder(default = "3.0")]
    pub nsigma: f64,
    /// Iteration cap per spectrum.
    #[builder(default = "50")]
    pub max_iters: usize,
    /// Bandpass spline coefficient count; `None` picks one coefficient per
    /// 32 channels. Ignored by [`flag_birdies`].
    #[builder(default)]
    pub num_coeffs: Option<usize>,
    /// Whether to draw a progress bar on stderr.
    #[builder(default = "true")]
    pub draw_progress: bool,
}

impl FlagParams {
    /// Defaults for birdie flagging: 3 sigma, up to 50 rounds.
    pub fn birdie() -> Self {
        FlagParamsBuilder::default()
            .build()
            .expect("all fields have defaults")
    }

    /// Defaults for bandpass flagging: 5 sigma, up to 10 rounds.
    pub fn bandpass() -> Self {
        FlagParamsBuilder::default()
            .nsigma(5.0)
            .max_iters(10)
            .build()
            .expect("all fields have defaults")
    }

    fn clip_params(&self, policy: MaskPolicy) -> Result<ClipParams, UvclipError> {
        let params = ClipParamsBuilder::default()
            .nsigma(self.nsigma)
            .max_iters(self.max_iters)
            .policy(policy)
            .build()
            .expect("all fields set");
        params.validate()?;
        Ok(params)
    }
}

/// Counters from one flagging pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSummary {
    /// Channels flagged that were not flagged on input.
    pub num_flagged: usize,
    /// The largest number of clip rounds any spectrum needed.
    pub max_iterations: usize,
    /// Spectra skipped because they were fully flagged or degenerate.
    pub num_skipped: usize,
}

fn check_cube_shapes(
    function: &'static str,
    vis: &ArrayView3<Complex<f32>>,
    flags: &ArrayViewMut3<bool>,
) -> Result<(), UvclipError> {
    if vis.dim() != flags.dim() {
        return Err(UvclipError::BadArrayShape {
            argument: "flags",
            function,
            expected: format!("{:?}", vis.dim()),
            received: format!("{:?}", flags.dim()),
        });
    }
    Ok(())
}

fn flag_progress(message: &'static str, len: usize, draw: bool) -> ProgressBar {
    let draw_target = if draw {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    ProgressBar::with_draw_target(Some(len as u64), draw_target)
        .with_style(
            ProgressStyle::default_bar()
                .template(
                    "{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:4}/{len:4}",
                )
                .unwrap()
                .progress_chars("=> "),
        )
        .with_message(message)
}

/// Flag narrowband interference in every baseline-timestep spectrum.
///
/// Each spectrum is clipped against its complex mean with a shrinking mask,
/// then every channel is re-tested once against the final statistics. Input
/// flags are preserved: the re-test can recover a channel the clip dropped
/// mid-run, never one that arrived flagged.
///
/// # Errors
///
/// [`UvclipError::BadArrayShape`] when the cubes disagree in shape, and
/// parameter errors from [`ClipParams::validate`]. Degenerate spectra are
/// skipped with a warning, not an error.
pub fn flag_birdies(
    vis: ArrayView3<Complex<f32>>,
    mut flags: ArrayViewMut3<bool>,
    params: &FlagParams,
) -> Result<FlagSummary, UvclipError> {
    check_cube_shapes("flag_birdies", &vis, &flags)?;
    let clip_params = params.clip_params(MaskPolicy::MonotonicShrink)?;
    let (num_timesteps, num_channels, num_baselines) = vis.dim();
    info!(
        "flagging birdies in {num_timesteps}x{num_channels}x{num_baselines} vis, nsigma={}, max {} rounds",
        params.nsigma, params.max_iters
    );
    let progress = flag_progress("flag birdies", num_baselines, params.draw_progress);

    let summary = flags
        .axis_iter_mut(Axis(2))
        .into_par_iter()
        .zip(vis.axis_iter(Axis(2)).into_par_iter())
        .enumerate()
        .map(|(baseline, (mut bl_flags, bl_vis))| {
            let mut summary = FlagSummary::default();
            let mut values_re = vec![0.0; num_channels];
            let mut values_im = vec![0.0; num_channels];
            for (timestep, (mut spec_flags, spec_vis)) in bl_flags
                .outer_iter_mut()
                .zip(bl_vis.outer_iter())
                .enumerate()
            {
                let initial_mask: Vec<bool> = spec_flags.iter().map(|&f| !f).collect();
                if initial_mask.iter().all(|&m| !m) {
                    trace!("baseline {baseline} timestep {timestep}: fully flagged, skipping");
                    summary.num_skipped += 1;
                    continue;
                }
                for (ch, v) in spec_vis.iter().enumerate() {
                    values_re[ch] = v.re as f64;
                    values_im[ch] = v.im as f64;
                }
                let outcome = match clip_complex(
                    &values_re,
                    &values_im,
                    Some(&initial_mask),
                    &mut MeanModel,
                    &mut MeanModel,
                    &clip_params,
                ) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("baseline {baseline} timestep {timestep}: {e}, skipping");
                        summary.num_skipped += 1;
                        continue;
                    }
                };
                summary.max_iterations = summary.max_iterations.max(outcome.iterations);
                // re-test everything against the final statistics, but an
                // input flag is never released
                let threshold = params.nsigma * outcome.variance;
                for ch in 0..num_channels {
                    let rr = values_re[ch] - outcome.model_re[ch];
                    let ii = values_im[ch] - outcome.model_im[ch];
                    let keep = initial_mask[ch] && rr * rr + ii * ii <= threshold;
                    if !keep && initial_mask[ch] {
                        summary.num_flagged += 1;
                    }
                    spec_flags[ch] = !keep;
                }
            }
            progress.inc(1);
            summary
        })
        .reduce(FlagSummary::default, merge_summaries);

    progress.finish();
    info!(
        "birdie flagging done: {} new flags, {} spectra skipped, deepest clip took {} rounds",
        summary.num_flagged, summary.num_skipped, summary.max_iterations
    );
    Ok(summary)
}

/// Flag bandpass outliers in every baseline-timestep spectrum.
///
/// Each spectrum is clipped against a cubic B-spline bandpass model with the
/// mask recomputed from scratch each round, and the final mask replaces the
/// input flags for that spectrum. Input flags seed the first fit and can be
/// released when the channel turns out consistent with the bandpass.
///
/// # Errors
///
/// As [`flag_birdies`].
pub fn flag_bandpass(
    vis: ArrayView3<Complex<f32>>,
    mut flags: ArrayViewMut3<bool>,
    params: &FlagParams,
) -> Result<FlagSummary, UvclipError> {
    check_cube_shapes("flag_bandpass", &vis, &flags)?;
    let clip_params = params.clip_params(MaskPolicy::FullRecompute)?;
    let (num_timesteps, num_channels, num_baselines) = vis.dim();
    info!(
        "flagging bandpass in {num_timesteps}x{num_channels}x{num_baselines} vis, nsigma={}, max {} rounds",
        params.nsigma, params.max_iters
    );
    let progress = flag_progress("flag bandpass", num_baselines, params.draw_progress);

    let num_coeffs = params.num_coeffs;
    let summary = flags
        .axis_iter_mut(Axis(2))
        .into_par_iter()
        .zip(vis.axis_iter(Axis(2)).into_par_iter())
        .enumerate()
        .map(|(baseline, (mut bl_flags, bl_vis))| {
            let mut summary = FlagSummary::default();
            // the spline design only depends on the channel count, so these
            // are shared across the baseline's timesteps
            let mut model_re = match num_coeffs {
                Some(n) => BSplineModel::with_num_coeffs(n),
                None => BSplineModel::new(),
            };
            let mut model_im = model_re.clone();
            let mut values_re = vec![0.0; num_channels];
            let mut values_im = vec![0.0; num_channels];
            for (timestep, (mut spec_flags, spec_vis)) in bl_flags
                .outer_iter_mut()
                .zip(bl_vis.outer_iter())
                .enumerate()
            {
                let initial_mask: Vec<bool> = spec_flags.iter().map(|&f| !f).collect();
                if initial_mask.iter().all(|&m| !m) {
                    trace!("baseline {baseline} timestep {timestep}: fully flagged, skipping");
                    summary.num_skipped += 1;
                    continue;
                }
                for (ch, v) in spec_vis.iter().enumerate() {
                    values_re[ch] = v.re as f64;
                    values_im[ch] = v.im as f64;
                }
                let outcome = match clip_complex(
                    &values_re,
                    &values_im,
                    Some(&initial_mask),
                    &mut model_re,
                    &mut model_im,
                    &clip_params,
                ) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("baseline {baseline} timestep {timestep}: {e}, skipping");
                        summary.num_skipped += 1;
                        continue;
                    }
                };
                summary.max_iterations = summary.max_iterations.max(outcome.iterations);
                for ch in 0..num_channels {
                    if !outcome.mask[ch] && initial_mask[ch] {
                        summary.num_flagged += 1;
                    }
                    spec_flags[ch] = !outcome.mask[ch];
                }
            }
            progress.inc(1);
            summary
        })
        .reduce(FlagSummary::default, merge_summaries);

    progress.finish();
    info!(
        "bandpass flagging done: {} new flags, {} spectra skipped, deepest clip took {} rounds",
        summary.num_flagged, summary.num_skipped, summary.max_iterations
    );
    Ok(summary)
}

fn merge_summaries(a: FlagSummary, b: FlagSummary) -> FlagSummary {
    FlagSummary {
        num_flagged: a.num_flagged + b.num_flagged,
        max_iterations: a.max_iterations.max(b.max_iterations),
        num_skipped: a.num_skipped + b.num_skipped,
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    fn quiet(mut params: FlagParams) -> FlagParams {
        params.draw_progress = false;
        params
    }

    /// A flat cube with a tiny per-channel wiggle so the clip statistics are
    /// never exactly zero.
    fn flat_cube(
        num_timesteps: usize,
        num_channels: usize,
        num_baselines: usize,
    ) -> Array3<Complex<f32>> {
        Array3::from_shape_fn((num_timesteps, num_channels, num_baselines), |(t, c, b)| {
            let wiggle = 0.01 * ((t + 3 * c + 7 * b) % 5) as f32;
            Complex::new(10.0 + wiggle, -2.0 + wiggle)
        })
    }

    #[test]
    fn test_birdies_shape_mismatch() {
        let vis = flat_cube(2, 32, 3);
        let mut flags = Array3::from_elem((2, 32, 2), false);
        let result = flag_birdies(vis.view(), flags.view_mut(), &quiet(FlagParams::birdie()));
        assert!(matches!(result, Err(UvclipError::BadArrayShape { .. })));
    }

    #[test]
    fn test_birdies_flags_injected_tone() {
        let mut vis = flat_cube(3, 64, 4);
        // a strong narrowband tone in channel 20 of baseline 1
        for t in 0..3 {
            vis[[t, 20, 1]] = Complex::new(500.0, 300.0);
        }
        let mut flags = Array3::from_elem(vis.dim(), false);
        let summary =
            flag_birdies(vis.view(), flags.view_mut(), &quiet(FlagParams::birdie())).unwrap();
        for t in 0..3 {
            assert!(flags[[t, 20, 1]]);
        }
        // nothing else gets caught
        assert_eq!(summary.num_flagged, 3);
        assert!(!flags[[0, 20, 0]]);
        assert_eq!(summary.num_skipped, 0);
    }

    #[test]
    fn test_birdies_preserve_input_flags() {
        let vis = flat_cube(2, 32, 2);
        let mut flags = Array3::from_elem(vis.dim(), false);
        // channel 5 arrives flagged even though its data is consistent
        flags[[0, 5, 0]] = true;
        let summary =
            flag_birdies(vis.view(), flags.view_mut(), &quiet(FlagParams::birdie())).unwrap();
        assert!(flags[[0, 5, 0]]);
        assert_eq!(summary.num_flagged, 0);
    }

    #[test]
    fn test_birdies_skip_fully_flagged_spectrum() {
        let vis = flat_cube(2, 32, 2);
        let mut flags = Array3::from_elem(vis.dim(), false);
        for ch in 0..32 {
            flags[[1, ch, 0]] = true;
        }
        let summary =
            flag_birdies(vis.view(), flags.view_mut(), &quiet(FlagParams::birdie())).unwrap();
        assert_eq!(summary.num_skipped, 1);
        for ch in 0..32 {
            assert!(flags[[1, ch, 0]]);
        }
    }

    /// A smooth cubic bandpass across the channel axis with a small
    /// deterministic jitter standing in for thermal noise.
    fn bandpass_cube(
        num_timesteps: usize,
        num_channels: usize,
        num_baselines: usize,
    ) -> Array3<Complex<f32>> {
        Array3::from_shape_fn((num_timesteps, num_channels, num_baselines), |(t, c, b)| {
            let x = c as f32 / (num_channels - 1) as f32;
            let amp = 8.0 + 2.0 * x - 1.5 * x * x + x * x * x;
            let noise = 0.001 * (((3 * c + 5 * t + 7 * b) % 7) as f32 - 3.0);
            Complex::new(amp + noise, 0.3 * amp + noise)
        })
    }

    #[test]
    fn test_bandpass_flags_spike() {
        let mut vis = bandpass_cube(2, 128, 3);
        vis[[0, 40, 2]] += Complex::new(200.0, -150.0);
        let mut flags = Array3::from_elem(vis.dim(), false);
        let summary =
            flag_bandpass(vis.view(), flags.view_mut(), &quiet(FlagParams::bandpass())).unwrap();
        assert!(flags[[0, 40, 2]]);
        assert!(!flags[[1, 40, 2]]);
        assert_eq!(summary.num_flagged, 1);
    }

    #[test]
    fn test_bandpass_releases_consistent_input_flag() {
        let vis = bandpass_cube(2, 128, 2);
        let mut flags = Array3::from_elem(vis.dim(), false);
        // channel 64 arrives flagged but sits right on the bandpass
        flags[[0, 64, 0]] = true;
        flag_bandpass(vis.view(), flags.view_mut(), &quiet(FlagParams::bandpass())).unwrap();
        assert!(!flags[[0, 64, 0]]);
    }

    #[test]
    fn test_default_parameter_sets() {
        let birdie = FlagParams::birdie();
        assert_eq!(birdie.max_iters, 50);
        assert_eq!(birdie.num_coeffs, None);
        let bandpass = FlagParams::bandpass();
        assert_eq!(bandpass.max_iters, 10);
        assert!((bandpass.nsigma - 5.0).abs() < f64::EPSILON);
    }
}
