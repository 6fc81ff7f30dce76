use std::path::PathBuf;

// Build-time tuning. The /320 divisor applied to FILTERSIZE_HUGE in
// filter_design is part of the size policy and must not be re-tuned
// independently of these.
pub const FILTERSIZE_MEDIUM: u32 = 3072;
pub const FILTERSIZE_HUGE: u32 = 327_680;
pub const FILTERSIZE_LIMIT: u32 = 1_048_575;

/// Interleaved samples per block read, rounded down to a multiple of the
/// channel count before use.
pub const BUFFERSIZE: usize = 40_960;

pub const MAXCHANNELS: u32 = 16;

/// Safety factor applied when recovering from a detected peak > limit.
pub const CLIPPING_TRIM: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpfMode {
    Normal,
    Relaxed,
    Steep,
    Custom,
}

/// Immutable settings for one conversion.
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub output_rate: u32,

    pub use_double: bool,
    pub gain: f64,
    pub normalize: bool,
    /// Peak ceiling in (0, 1]; doubles as the normalization target.
    pub limit: f64,

    pub dither: bool,
    pub dither_bits: f64,
    pub auto_blank: bool,
    /// Index into the dither profile catalog; None means "pick from the
    /// output rate".
    pub dither_profile: Option<usize>,
    pub use_seed: bool,
    pub seed: u32,

    pub trim_group_delay: bool,
    pub min_phase: bool,

    pub lpf_mode: LpfMode,
    /// Custom cutoff as percent of target Nyquist, in [1, 99.9].
    pub lpf_cutoff_pct: f64,
    /// Custom transition width as percent of target Nyquist; 0 means auto.
    pub lpf_transition_pct: f64,

    pub multithread: bool,
    pub disable_clipping_protection: bool,
    pub force_rf64: bool,
    pub write_metadata: bool,

    /// Requested output subformat name (e.g. "24", "float"); empty keeps the
    /// input's subformat.
    pub out_bit_format: String,
    pub flac_level: Option<u8>,
    pub vorbis_quality: Option<f64>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::new(),
            output_path: PathBuf::new(),
            output_rate: 44100,
            use_double: false,
            gain: 1.0,
            normalize: false,
            limit: 1.0,
            dither: false,
            dither_bits: 1.0,
            auto_blank: false,
            dither_profile: None,
            use_seed: false,
            seed: 0,
            trim_group_delay: true,
            min_phase: false,
            lpf_mode: LpfMode::Normal,
            lpf_cutoff_pct: 90.909_091,
            lpf_transition_pct: 0.0,
            multithread: false,
            disable_clipping_protection: false,
            force_rf64: false,
            write_metadata: true,
            out_bit_format: String::new(),
            flac_level: None,
            vorbis_quality: None,
        }
    }
}

impl ConversionConfig {
    /// Reject configurations that cannot possibly convert, before any file is
    /// touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.output_rate == 0 {
            return Err("Target sample rate not specified".into());
        }
        if self.input_path.as_os_str().is_empty() {
            return Err("Input filename not specified".into());
        }
        if self.input_path == self.output_path {
            return Err("Input and output filenames cannot be the same".into());
        }
        if !(self.limit > 0.0 && self.limit <= 1.0) {
            return Err(format!("Limit must be in (0, 1], got {}", self.limit));
        }
        if self.gain <= 0.0 {
            return Err(format!("Gain must be positive, got {}", self.gain));
        }
        if self.lpf_mode == LpfMode::Custom && !(1.0..=99.9).contains(&self.lpf_cutoff_pct) {
            return Err(format!(
                "LPF cutoff must be in [1, 99.9] percent, got {}",
                self.lpf_cutoff_pct
            ));
        }
        Ok(())
    }
}
