//! Errors that can occur in uvclip

use thiserror::Error;

#[derive(Error, Debug)]
/// An enum of all the errors possible in uvclip
pub enum UvclipError {
    /// Too few included observations (or a rank-deficient system) to
    /// constrain the model.
    #[error("degenerate fit: {num_included} included observations cannot constrain {num_params} model parameters")]
    DegenerateFit {
        /// Number of observations left in the inclusion mask.
        num_included: usize,
        /// Number of free parameters in the model.
        num_params: usize,
    },

    /// The clip threshold multiple must be positive.
    #[error("invalid nsigma {nsigma}, must be > 0")]
    BadNSigma {
        /// The offending value.
        nsigma: f64,
    },

    /// The iteration cap must be positive.
    #[error("invalid max_iters {max_iters}, must be > 0")]
    BadMaxIters {
        /// The offending value.
        max_iters: usize,
    },

    /// Error for bad array shape in provided argument
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        /// The argument name within the function
        argument: &'static str,
        /// The function name
        function: &'static str,
        /// The expected shape
        expected: String,
        /// The shape that was received instead
        received: String,
    },

    /// Primary-beam fitting needs a full hex-7 pointing pattern.
    #[error("need at least 7 pointings to fit a primary beam, got {num_pointings}")]
    TooFewPointings {
        /// Number of pointings provided.
        num_pointings: usize,
    },

    #[cfg(feature = "cli")]
    /// A command line option that parsed but holds a nonsense value.
    #[error("invalid command line argument --{option}: {value}")]
    BadCliValue {
        /// The option name.
        option: &'static str,
        /// The value that was provided.
        value: String,
    },

    #[cfg(feature = "cli")]
    /// A spectra CSV cell that would not parse.
    #[error("bad CSV field {field} on record {record}: {value}")]
    BadCsvField {
        /// The column name.
        field: &'static str,
        /// One-based data record index.
        record: usize,
        /// The value that was provided.
        value: String,
    },

    #[cfg(feature = "cli")]
    /// Dry run: asked not to write anything.
    #[error("dry run")]
    DryRun {},

    #[cfg(feature = "cli")]
    /// Error parsing the command line.
    #[error(transparent)]
    ClapError(#[from] clap::Error),

    #[cfg(feature = "cli")]
    /// Error reading or writing a spectra CSV file.
    #[error(transparent)]
    CsvError(#[from] csv::Error),

    #[cfg(feature = "cli")]
    /// Generic IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}
