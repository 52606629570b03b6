//! Primary beam characterisation from gain solutions across a mosaic of
//! pointing offsets.
//!
//! An antenna's gain amplitude solution scales inversely with the beam
//! response at each pointing, so the beam shape is recovered by fitting an
//! elliptical Gaussian to the reciprocal gain amplitudes. Comparing the
//! fitted X and Y feed beam centres gives the beam squint.

use log::warn;
use ndarray::ArrayView2;
use num_complex::Complex;

use crate::error::UvclipError;
use crate::gauss2d;

/// Conversion from Gaussian width parameter to full width at half maximum,
/// `2 * sqrt(-ln(0.5) / 2)`.
pub const SIGMA2FWHM: f64 = 1.177_410_022_515_474_7;

/// Fewer pointings than this cannot usefully constrain the five-parameter
/// beam shape.
pub const MIN_POINTINGS: usize = 7;

/// A fitted beam for one antenna feed.
#[derive(Debug, Clone)]
pub struct BeamFit {
    /// Peak response amplitude.
    pub amplitude: f64,
    /// Beam centre offset along x, in the units of the pointing offsets.
    pub x_offset: f64,
    /// Beam centre offset along y.
    pub y_offset: f64,
    /// Full width at half maximum along x.
    pub x_fwhm: f64,
    /// Full width at half maximum along y.
    pub y_fwhm: f64,
    /// Euclidean norm of the fit residual.
    pub residual_norm: f64,
    /// Whether the underlying Gaussian fit converged.
    pub converged: bool,
}

/// The displacement of the Y feed beam centre relative to the X feed.
#[derive(Debug, Clone, Copy)]
pub struct Squint {
    /// Magnitude of the displacement, in the pointing offset units.
    pub magnitude: f64,
    /// Direction of the displacement in degrees, measured anticlockwise from
    /// the x axis.
    pub angle_deg: f64,
}

/// Fit a beam to one antenna feed's gain amplitudes over the mosaic.
///
/// `gain_amps` holds the gain solution amplitude per pointing; the beam
/// response is taken as its reciprocal.
///
/// # Errors
///
/// [`UvclipError::TooFewPointings`] below [`MIN_POINTINGS`],
/// [`UvclipError::BadArrayShape`] when `gain_amps` and `offsets` disagree in
/// length, and [`UvclipError::DegenerateFit`] from the underlying solver.
pub fn fit_primary_beam(
    offsets: &[(f64, f64)],
    gain_amps: &[f64],
) -> Result<BeamFit, UvclipError> {
    if gain_amps.len() != offsets.len() {
        return Err(UvclipError::BadArrayShape {
            argument: "gain_amps",
            function: "fit_primary_beam",
            expected: format!("{}", offsets.len()),
            received: format!("{}", gain_amps.len()),
        });
    }
    if offsets.len() < MIN_POINTINGS {
        return Err(UvclipError::TooFewPointings {
            num_pointings: offsets.len(),
        });
    }
    let responses: Vec<f64> = gain_amps.iter().map(|&g| 1.0 / g).collect();
    let fit = gauss2d::fit(offsets, &responses, None)?;
    let [a, x0, sx, y0, sy] = fit.params;
    Ok(BeamFit {
        amplitude: a,
        x_offset: x0,
        y_offset: y0,
        x_fwhm: sx.abs() * SIGMA2FWHM,
        y_fwhm: sy.abs() * SIGMA2FWHM,
        residual_norm: fit.residual_norm,
        converged: fit.converged,
    })
}

/// Fit beams for a whole gain table, one row per antenna feed and one column
/// per pointing.
///
/// Rows with a zero gain anywhere (the convention for a missing solution)
/// are skipped with a warning, as are rows the solver rejects as degenerate.
///
/// # Errors
///
/// [`UvclipError::BadArrayShape`] when the column count disagrees with
/// `offsets`, [`UvclipError::TooFewPointings`] below [`MIN_POINTINGS`].
pub fn fit_primary_beams(
    offsets: &[(f64, f64)],
    gains: ArrayView2<Complex<f64>>,
) -> Result<Vec<Option<BeamFit>>, UvclipError> {
    if gains.ncols() != offsets.len() {
        return Err(UvclipError::BadArrayShape {
            argument: "gains",
            function: "fit_primary_beams",
            expected: format!("(_, {})", offsets.len()),
            received: format!("{:?}", gains.dim()),
        });
    }
    if offsets.len() < MIN_POINTINGS {
        return Err(UvclipError::TooFewPointings {
            num_pointings: offsets.len(),
        });
    }
    let mut fits = Vec::with_capacity(gains.nrows());
    for (row_index, row) in gains.outer_iter().enumerate() {
        let amps: Vec<f64> = row.iter().map(|g| g.norm()).collect();
        if amps.iter().any(|&a| a == 0.0) {
            warn!("feed {row_index}: missing gain solution, skipping beam fit");
            fits.push(None);
            continue;
        }
        match fit_primary_beam(offsets, &amps) {
            Ok(fit) => fits.push(Some(fit)),
            Err(UvclipError::DegenerateFit {
                num_included,
                num_params,
            }) => {
                warn!("feed {row_index}: degenerate beam fit ({num_included} points for {num_params} parameters), skipping");
                fits.push(None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(fits)
}

/// The squint between a pair of fitted feed beams.
pub fn squint(x_beam: &BeamFit, y_beam: &BeamFit) -> Squint {
    let dx = y_beam.x_offset - x_beam.x_offset;
    let dy = y_beam.y_offset - x_beam.y_offset;
    Squint {
        magnitude: (dx * dx + dy * dy).sqrt(),
        angle_deg: dy.atan2(dx).to_degrees(),
    }
}

/// Squints for interleaved feed rows, X then Y per antenna. `None` where
/// either fit is missing or failed to converge.
pub fn squints(fits: &[Option<BeamFit>]) -> Vec<Option<Squint>> {
    fits.chunks(2)
        .map(|pair| match pair {
            [Some(x), Some(y)] if x.converged && y.converged => Some(squint(x, y)),
            _ => None,
        })
        .collect()
}
