//! Robust iterative sigma-clipping for radio interferometry spectra.
//!
//! The core of the crate is a clip loop ([`clip_real`], [`clip_complex`])
//! that repeatedly fits a model to the unflagged channels of a spectrum,
//! derives a residual variance, and re-tests every channel against an
//! `nsigma` threshold until the mask settles. Models implement [`FitModel`];
//! a running mean, polynomials, and a cubic B-spline bandpass are provided.
//!
//! On top of the clip loop sit array-level operations for visibility cubes
//! ([`flag_birdies`], [`flag_bandpass`]) and primary-beam characterisation
//! from mosaic gain solutions ([`fit_primary_beams`]) with an underlying
//! Levenberg-Marquardt 2D Gaussian solver ([`gauss2d::fit`]).
//!
//! # Example
//!
//! ```rust
//! use uvclip::{clip_real, ClipParams, MeanModel};
//!
//! let mut values = vec![10.0; 20];
//! values[4] = 1000.0;
//!
//! let outcome = clip_real(&values, None, &mut MeanModel, &ClipParams::default())?;
//! assert!(!outcome.mask[4]);
//! assert!(outcome.mask.iter().filter(|&&m| m).count() == 19);
//! assert!(outcome.converged);
//! assert_eq!(outcome.iterations, 2);
//! # Ok::<(), uvclip::UvclipError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

pub mod beam;
pub mod clip;
#[cfg(feature = "cli")]
pub mod cli;
pub mod error;
pub mod flags;
pub mod gauss2d;
pub mod model;

pub use beam::{
    fit_primary_beam, fit_primary_beams, squint, squints, BeamFit, Squint, SIGMA2FWHM,
};
pub use clip::{
    clip_complex, clip_real, ClipOutcome, ClipParams, ClipParamsBuilder, ComplexClipOutcome,
    MaskPolicy,
};
pub use error::UvclipError;
pub use flags::{flag_bandpass, flag_birdies, FlagParams, FlagParamsBuilder, FlagSummary};
pub use model::{BSplineModel, FitModel, MeanModel, ModelFit, PolynomialModel};

/// Compile-time build information.
#[allow(missing_docs)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
