/*
 Copyright (c) 2026 rerate contributors

 This file is part of rerate

 rerate is free software: you can redistribute it and/or modify it
 under the terms of the GNU General Public License as published by the
 Free Software Foundation, either version 3 of the License, or
 (at your option) any later version.

 rerate is distributed in the hope that it will be useful, but
 WITHOUT ANY WARRANTY; without even the implied warranty of
 MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 GNU General Public License for more details.
 You should have received a copy of the GNU General Public License
 along with rerate. If not, see <https://www.gnu.org/licenses/>.
*/

use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use rerate::config::{ConversionConfig, LpfMode};
use rerate::dither::DITHER_PROFILES;
use rerate::format;
use rerate::{convert, AppError, ColorLogger, TermResult};

#[derive(Parser)]
#[command(
    name = "rerate",
    version,
    about = "High-fidelity audio sample rate converter (PCM and DSD in, PCM out)"
)]
struct Cli {
    /// Input file (wav, rf64, aiff, dsf, dff)
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Output file (wav, rf64, aiff, flac). Defaults to
    /// <input>(converted).<ext>
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Output sample rate in Hz
    #[arg(short = 'r', long = "rate", default_value_t = 44100)]
    rate: u32,

    /// Output bit format (see --listsubformats)
    #[arg(short = 'b', long = "bitformat", value_name = "SUBFORMAT")]
    bit_format: Option<String>,

    /// Normalize the output peak to the given level in (0, 1]
    #[arg(short = 'n', long = "normalize", num_args = 0..=1, default_missing_value = "1.0", value_name = "LEVEL")]
    normalize: Option<f64>,

    /// Gain factor applied before conversion
    #[arg(long = "gain", default_value_t = 1.0)]
    gain: f64,

    /// Add noise-shaped TPDF dither of the given strength in bits
    #[arg(long = "dither", num_args = 0..=1, default_missing_value = "1.0", value_name = "BITS")]
    dither: Option<f64>,

    /// Mute dither during long silent passages
    #[arg(long = "autoblank")]
    autoblank: bool,

    /// Noise-shaping profile id (see --showDitherProfiles)
    #[arg(long = "ns", value_name = "ID")]
    ns: Option<usize>,

    /// Force flat TPDF dither (takes precedence over --ns)
    #[arg(long = "flat-tpdf")]
    flat_tpdf: bool,

    /// Seed the dither generators for reproducible output
    #[arg(long = "seed")]
    seed: Option<u32>,

    /// Keep the filter's leading group delay instead of trimming it
    #[arg(long = "noDelayTrim")]
    no_delay_trim: bool,

    /// Use a minimum-phase filter (no pre-ringing)
    #[arg(long = "minphase")]
    minphase: bool,

    /// FLAC compression level (0-8)
    #[arg(long = "flacCompression", value_name = "LEVEL")]
    flac_compression: Option<i32>,

    /// Vorbis quality (-1 to 10)
    #[arg(long = "vorbisQuality", value_name = "QUALITY")]
    vorbis_quality: Option<f64>,

    /// Let clipped peaks through instead of re-running with reduced gain
    #[arg(long = "noClippingProtection")]
    no_clipping_protection: bool,

    /// Relaxed LPF (later cutoff)
    #[arg(long = "relaxedLPF")]
    relaxed_lpf: bool,

    /// Steep LPF (later cutoff, doubled steepness)
    #[arg(long = "steepLPF")]
    steep_lpf: bool,

    /// Custom LPF cutoff as a percentage of the target Nyquist [1-99.9]
    #[arg(long = "lpf-cutoff", value_name = "PCT")]
    lpf_cutoff: Option<f64>,

    /// Custom LPF transition width as a percentage of the target Nyquist
    #[arg(long = "lpf-transition", value_name = "PCT")]
    lpf_transition: Option<f64>,

    /// Multi-threaded conversion (one worker per channel)
    #[arg(long = "mt")]
    mt: bool,

    /// Force the RF64 container for wav output
    #[arg(long = "rf64")]
    rf64: bool,

    /// Don't copy metadata to the output file
    #[arg(long = "noMetadata")]
    no_metadata: bool,

    /// Run the pipeline in 64-bit floating point
    #[arg(long = "doubleprecision")]
    doubleprecision: bool,

    /// Report the container I/O backend, then exit
    #[arg(long = "sndfile-version")]
    sndfile_version: bool,

    /// List valid subformats for a file extension, then exit
    #[arg(long = "listsubformats", value_name = "EXT")]
    listsubformats: Option<String>,

    /// List dither profiles, then exit
    #[arg(long = "showDitherProfiles")]
    show_dither_profiles: bool,

    /// Print diagnostic messages
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() -> TermResult {
    let cli = Cli::parse();
    ColorLogger::new(cli.verbose).init();

    // terminating queries
    if cli.sndfile_version {
        println!(
            "rerate {} internal container I/O (wav, rf64, aiff, dsf, dff in; wav, rf64, aiff, flac out)",
            env!("CARGO_PKG_VERSION")
        );
        return TermResult(Ok(()));
    }
    if let Some(ext) = &cli.listsubformats {
        format::list_subformats(ext);
        return TermResult(Ok(()));
    }
    if cli.show_dither_profiles {
        for profile in DITHER_PROFILES {
            println!("{} : {}", profile.id, profile.name);
        }
        return TermResult(Ok(()));
    }

    TermResult(run(cli))
}

/// Derive `<input>(converted).<ext>` when no output name was given.
fn default_output_name(input: &PathBuf) -> PathBuf {
    let s = input.to_string_lossy();
    match s.rfind('.') {
        Some(dot) => PathBuf::from(format!("{}(converted){}", &s[..dot], &s[dot..])),
        None => PathBuf::from(format!("{}(converted)", s)),
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let Some(input) = cli.input else {
        return Err(AppError::Config("Input filename not specified".into()));
    };
    let output = cli.output.unwrap_or_else(|| {
        let derived = default_output_name(&input);
        info!("Output filename not specified, defaulting to {}", derived.display());
        derived
    });

    info!("Input file: {}", input.display());
    info!("Output file: {}", output.display());

    let (normalize, mut limit) = match cli.normalize {
        Some(amount) => {
            let amount = if amount <= 0.0 { 1.0 } else { amount };
            (true, amount)
        }
        None => (false, 1.0),
    };
    if limit > 1.0 {
        warn!("Normalization level greater than 1.0 would clip; using 1.0");
        limit = 1.0;
    }

    let (dither, dither_bits) = match cli.dither {
        Some(bits) => (true, if bits <= 0.0 { 1.0 } else { bits }),
        None => (false, 1.0),
    };

    let dither_profile = if cli.flat_tpdf {
        Some(0)
    } else {
        match cli.ns {
            Some(id) if id < DITHER_PROFILES.len() => Some(id),
            Some(id) => {
                warn!("Unknown dither profile {}, using the rate default", id);
                None
            }
            None => None,
        }
    };

    let mut lpf_mode = LpfMode::Normal;
    if cli.relaxed_lpf {
        lpf_mode = LpfMode::Relaxed;
    }
    if cli.steep_lpf {
        lpf_mode = LpfMode::Steep;
    }
    let mut lpf_cutoff_pct = 90.909_091;
    if let Some(cutoff) = cli.lpf_cutoff {
        lpf_cutoff_pct = cutoff.clamp(1.0, 99.9);
        lpf_mode = LpfMode::Custom;
    }
    let lpf_transition_pct = cli
        .lpf_transition
        .map(|t| t.clamp(0.1, 99.9))
        .unwrap_or(0.0);

    let cfg = ConversionConfig {
        input_path: input,
        output_path: output,
        output_rate: cli.rate,
        use_double: cli.doubleprecision,
        gain: cli.gain,
        normalize,
        limit,
        dither,
        dither_bits,
        auto_blank: cli.autoblank,
        dither_profile,
        use_seed: cli.seed.is_some(),
        seed: cli.seed.unwrap_or(0),
        trim_group_delay: !cli.no_delay_trim,
        min_phase: cli.minphase,
        lpf_mode,
        lpf_cutoff_pct,
        lpf_transition_pct,
        multithread: cli.mt,
        disable_clipping_protection: cli.no_clipping_protection,
        force_rf64: cli.rf64,
        write_metadata: !cli.no_metadata,
        out_bit_format: cli.bit_format.unwrap_or_default(),
        flac_level: cli.flac_compression.map(|l| l.clamp(0, 8) as u8),
        vorbis_quality: cli.vorbis_quality.map(|q| q.clamp(-1.0, 10.0)),
    };
    cfg.validate().map_err(AppError::Config)?;

    if cfg.use_double {
        info!("Using double precision for calculations");
        convert::<f64>(&cfg)?;
    } else {
        convert::<f32>(&cfg)?;
    }
    Ok(())
}
