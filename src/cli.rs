//! Command Line Interface helpers for uvclip

use std::{
    ffi::OsString,
    fmt::{Debug, Display},
    path::{Path, PathBuf},
};

use clap::{arg, command, ValueHint::FilePath};
use clap::ErrorKind::{DisplayHelp, DisplayVersion};
use itertools::Itertools;
use log::{debug, info, trace, warn};
use ndarray::Array3;
use num_complex::Complex;
use prettytable::{format as prettyformat, row, table};

use crate::{
    built_info,
    error::UvclipError::{self, DryRun},
    flags::{flag_bandpass, flag_birdies, FlagParams, FlagSummary},
};

/// Which flagging operation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMode {
    /// Narrowband interference clipping against the spectrum mean.
    Birdie,
    /// Bandpass outlier clipping against a B-spline model.
    Bandpass,
}

impl Display for FlagMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagMode::Birdie => write!(f, "birdie"),
            FlagMode::Bandpass => write!(f, "bandpass"),
        }
    }
}

/// Args for flagging a cube of spectra.
pub struct UvclipContext {
    /// Input spectra CSV path.
    pub vis_path: PathBuf,
    /// Output CSV path, if any.
    pub out_path: Option<PathBuf>,
    /// Which flagging operation to run.
    pub mode: FlagMode,
    /// Flagging parameters.
    pub flag_params: FlagParams,
    /// Visibilities, `[timestep][channel][baseline]`.
    pub vis: Array3<Complex<f32>>,
    /// Flags, true = flagged, same shape as `vis`.
    pub flags: Array3<bool>,
}

/// Write many log lines of how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match built_info::GIT_HEAD_REF {
        Some(hr) => {
            let dirty = built_info::GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                built_info::GIT_COMMIT_HASH.unwrap(),
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {}", hr)?;
        }
        None => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {}", built_info::BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", built_info::RUSTC_VERSION)?;
    writeln!(f)?;
    Ok(())
}

impl Display for UvclipContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;

        fmt_build_info(f)?;

        let (num_timesteps, num_channels, num_baselines) = self.vis.dim();
        let num_input_flags = self.flags.iter().filter(|&&flag| flag).count();
        let mut summary_table = table!(
            [r => "input:", self.vis_path.display()],
            [r => "timesteps:", num_timesteps],
            [r => "channels:", num_channels],
            [r => "baselines:", num_baselines],
            [r => "input flags:", num_input_flags],
            [r => "mode:", self.mode],
            [r => "nsigma:", self.flag_params.nsigma],
            [r => "max rounds:", self.flag_params.max_iters]
        );
        if let Some(num_coeffs) = self.flag_params.num_coeffs {
            summary_table.add_row(row![r => "spline coeffs:", num_coeffs]);
        }
        summary_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        writeln!(f, "{summary_table}")?;
        Ok(())
    }
}

/// Parse one CSV cell, naming the field and record in the error.
fn parse_field<T: std::str::FromStr>(
    csv_record: &csv::StringRecord,
    index: usize,
    field: &'static str,
    record: usize,
) -> Result<T, UvclipError> {
    let raw = csv_record.get(index).ok_or(UvclipError::BadCsvField {
        field,
        record,
        value: "<missing>".into(),
    })?;
    raw.trim().parse().map_err(|_| UvclipError::BadCsvField {
        field,
        record,
        value: raw.into(),
    })
}

/// Column order of the spectra CSV schema.
const CSV_COLUMNS: [&str; 6] = ["timestep", "baseline", "channel", "re", "im", "flag"];

/// Read a spectra CSV into visibility and flag cubes.
///
/// Cube dimensions come from the largest indices seen; cells absent from the
/// file are left flagged.
///
/// # Errors
///
/// [`UvclipError::CsvError`] for unreadable input and
/// [`UvclipError::BadCsvField`] for a malformed header or cell.
pub fn read_spectra_csv(path: &Path) -> Result<(Array3<Complex<f32>>, Array3<bool>), UvclipError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    if !headers.iter().map(str::trim).eq(CSV_COLUMNS) {
        return Err(UvclipError::BadCsvField {
            field: "header",
            record: 0,
            value: headers.iter().join(","),
        });
    }

    let mut cells = Vec::new();
    let (mut num_timesteps, mut num_baselines, mut num_channels) = (0usize, 0usize, 0usize);
    for (index, result) in reader.records().enumerate() {
        let csv_record = result?;
        let record = index + 1;
        let timestep: usize = parse_field(&csv_record, 0, "timestep", record)?;
        let baseline: usize = parse_field(&csv_record, 1, "baseline", record)?;
        let channel: usize = parse_field(&csv_record, 2, "channel", record)?;
        let re: f32 = parse_field(&csv_record, 3, "re", record)?;
        let im: f32 = parse_field(&csv_record, 4, "im", record)?;
        let flag: u8 = parse_field(&csv_record, 5, "flag", record)?;
        num_timesteps = num_timesteps.max(timestep + 1);
        num_baselines = num_baselines.max(baseline + 1);
        num_channels = num_channels.max(channel + 1);
        cells.push((timestep, baseline, channel, re, im, flag != 0));
    }
    debug!(
        "read {} cells from {}: {num_timesteps} timesteps, {num_channels} channels, {num_baselines} baselines",
        cells.len(),
        path.display()
    );

    let shape = (num_timesteps, num_channels, num_baselines);
    let mut vis = Array3::from_elem(shape, Complex::new(0.0, 0.0));
    let mut flags = Array3::from_elem(shape, true);
    for (timestep, baseline, channel, re, im, flag) in cells {
        vis[[timestep, channel, baseline]] = Complex::new(re, im);
        flags[[timestep, channel, baseline]] = flag;
    }
    Ok((vis, flags))
}

/// Write visibility and flag cubes back out in the spectra CSV schema.
///
/// # Errors
///
/// [`UvclipError::CsvError`] and [`UvclipError::IOError`] for unwritable
/// output.
pub fn write_spectra_csv(
    path: &Path,
    vis: &Array3<Complex<f32>>,
    flags: &Array3<bool>,
) -> Result<(), UvclipError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(CSV_COLUMNS)?;
    let (num_timesteps, num_channels, num_baselines) = vis.dim();
    for timestep in 0..num_timesteps {
        for baseline in 0..num_baselines {
            for channel in 0..num_channels {
                let v = vis[[timestep, channel, baseline]];
                let flag = u8::from(flags[[timestep, channel, baseline]]);
                writer.write_record(&[
                    timestep.to_string(),
                    baseline.to_string(),
                    channel.to_string(),
                    v.re.to_string(),
                    v.im.to_string(),
                    flag.to_string(),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

impl UvclipContext {
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, UvclipError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let app = command!()
            .arg_required_else_help(true)
            .next_line_help(false)
            .about(
                "Flag radio interferometry spectra by iteratively sigma-clipping \
                 each baseline-timestep spectrum against a fitted model.",
            )
            .args(&[
                arg!(vis_path: <PATH> "Input spectra CSV (timestep,baseline,channel,re,im,flag)")
                    .value_hint(FilePath),
                arg!(-m --mode <MODE> "Flagging mode").possible_values(["birdie", "bandpass"]),
                arg!(-o --out <PATH> "Path for the flagged CSV output")
                    .required(false)
                    .value_hint(FilePath),
                arg!(--nsigma <SIGMA> "Residual threshold in standard deviations").required(false),
                arg!(--"max-iters" <COUNT> "Iteration cap per spectrum").required(false),
                arg!(--"num-coeffs" <COUNT> "Bandpass spline coefficient count").required(false),
                arg!(--"no-draw-progress" "do not show progress bars"),
                arg!(--"dry-run" "Just print the summary and exit"),
            ]);
        Ok(app.try_get_matches_from(args)?)
    }

    fn parse_flag_matches(
        matches: &clap::ArgMatches,
        mode: FlagMode,
    ) -> Result<FlagParams, UvclipError> {
        let mut params = match mode {
            FlagMode::Birdie => FlagParams::birdie(),
            FlagMode::Bandpass => FlagParams::bandpass(),
        };
        if let Some(value) = matches.value_of("nsigma") {
            params.nsigma = value.parse().map_err(|_| UvclipError::BadCliValue {
                option: "nsigma",
                value: value.into(),
            })?;
        }
        if let Some(value) = matches.value_of("max-iters") {
            params.max_iters = value.parse().map_err(|_| UvclipError::BadCliValue {
                option: "max-iters",
                value: value.into(),
            })?;
        }
        if let Some(value) = matches.value_of("num-coeffs") {
            if mode == FlagMode::Birdie {
                warn!("--num-coeffs has no effect in birdie mode");
            }
            params.num_coeffs = Some(value.parse().map_err(|_| UvclipError::BadCliValue {
                option: "num-coeffs",
                value: value.into(),
            })?);
        }
        params.draw_progress = !matches.is_present("no-draw-progress");
        Ok(params)
    }

    /// Parse an iterator of arguments, `args` into a `UvclipContext`, reading
    /// the input CSV along the way.
    ///
    /// # Errors
    ///
    /// Can raise:
    /// - `clap::Error` if clap cannot parse `args`
    /// - `UvclipError::BadCliValue` if an option value is nonsense
    /// - CSV errors if the input cannot be read
    /// - `UvclipError::DryRun` after printing the summary with `--dry-run`
    pub fn from_args<I, T>(args: I) -> Result<Self, UvclipError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        // mode has fixed possible values, so value_of is always Some
        let mode = match matches.value_of("mode") {
            Some("bandpass") => FlagMode::Bandpass,
            _ => FlagMode::Birdie,
        };
        let flag_params = Self::parse_flag_matches(&matches, mode)?;

        let vis_path = PathBuf::from(matches.value_of("vis_path").unwrap_or_default());
        let out_path = matches.value_of("out").map(PathBuf::from);
        let (vis, flags) = read_spectra_csv(&vis_path)?;

        let result = Self {
            vis_path,
            out_path,
            mode,
            flag_params,
            vis,
            flags,
        };

        info!("{}", &result);

        if matches.is_present("dry-run") {
            return Err(DryRun {});
        }

        Ok(result)
    }

    /// Run the selected flagging operation and write the output CSV, if one
    /// was asked for.
    ///
    /// # Errors
    ///
    /// Parameter and shape errors from the flagging operation, and CSV and IO
    /// errors from writing the output.
    pub fn run(self) -> Result<FlagSummary, UvclipError> {
        let UvclipContext {
            out_path,
            mode,
            flag_params,
            vis,
            mut flags,
            ..
        } = self;

        let summary = match mode {
            FlagMode::Birdie => flag_birdies(vis.view(), flags.view_mut(), &flag_params)?,
            FlagMode::Bandpass => flag_bandpass(vis.view(), flags.view_mut(), &flag_params)?,
        };

        if let Some(path) = out_path {
            write_spectra_csv(&path, &vis, &flags)?;
            info!("wrote flagged spectra to {}", path.display());
        }
        Ok(summary)
    }
}

/// Run the CLI end to end, returning a process exit code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let ctx = match UvclipContext::from_args(args) {
        Ok(ctx) => ctx,
        Err(DryRun {}) => {
            info!("Dry run. No files will be written.");
            return 0;
        }
        Err(UvclipError::ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    match ctx.run() {
        Ok(summary) => {
            info!(
                "done: {} new flags, {} spectra skipped, deepest clip took {} rounds",
                summary.num_flagged, summary.num_skipped, summary.max_iterations
            );
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
