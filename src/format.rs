// Output container/subformat resolution: validate the user's requested bit
// format against the target container, fall back to per-extension defaults,
// and predict when a WAV output must be promoted to RF64.

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Wav,
    Rf64,
    W64,
    Aiff,
    Flac,
    Ogg,
}

impl Container {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" | "wave" => Some(Self::Wav),
            "rf64" => Some(Self::Rf64),
            "w64" => Some(Self::W64),
            "aif" | "aiff" => Some(Self::Aiff),
            "flac" => Some(Self::Flac),
            "ogg" | "oga" => Some(Self::Ogg),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Rf64 => "rf64",
            Self::W64 => "w64",
            Self::Aiff => "aiff",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
        }
    }

    pub fn is_wav_family(&self) -> bool {
        matches!(self, Self::Wav | Self::Rf64 | Self::W64)
    }

    pub fn valid_subformats(&self) -> &'static [SubFormat] {
        use SubFormat::*;
        match self {
            Self::Wav | Self::Rf64 | Self::W64 => &[U8, Pcm16, Pcm24, Pcm32, Float, Double],
            Self::Aiff => &[S8, Pcm16, Pcm24, Pcm32, Float],
            Self::Flac => &[S8, Pcm16, Pcm24],
            Self::Ogg => &[Vorbis],
        }
    }

    pub fn default_subformat(&self) -> SubFormat {
        match self {
            Self::Ogg => SubFormat::Vorbis,
            _ => SubFormat::Pcm16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFormat {
    U8,
    S8,
    Pcm16,
    Pcm24,
    Pcm32,
    Float,
    Double,
    Vorbis,
}

impl SubFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S8 => "s8",
            Self::Pcm16 => "16",
            Self::Pcm24 => "24",
            Self::Pcm32 => "32",
            Self::Float => "float",
            Self::Double => "double",
            Self::Vorbis => "vorbis",
        }
    }

    /// Parse a user-supplied bit format name. "8" is handled by the resolver
    /// (its signedness depends on the container).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "u8" => Some(Self::U8),
            "s8" => Some(Self::S8),
            "16" => Some(Self::Pcm16),
            "24" => Some(Self::Pcm24),
            "32" => Some(Self::Pcm32),
            "float" | "32f" => Some(Self::Float),
            "double" | "64f" => Some(Self::Double),
            "vorbis" => Some(Self::Vorbis),
            _ => None,
        }
    }

    pub fn bytes_per_sample(&self) -> u32 {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::Pcm16 | Self::Vorbis => 2,
            Self::Pcm24 => 3,
            Self::Pcm32 | Self::Float => 4,
            Self::Double => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }
}

/// Resolved output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub container: Container,
    pub subformat: SubFormat,
}

/// Bit depth the ditherer should quantize for. Anything that is not 24-bit or
/// 8-bit PCM quantizes to the 16-bit grid.
pub fn dither_signal_bits(sub: SubFormat) -> i32 {
    match sub {
        SubFormat::Pcm24 => 24,
        SubFormat::U8 | SubFormat::S8 => 8,
        _ => 16,
    }
}

/// These container names store 8-bit audio unsigned; everything else signed.
fn eight_bit_subformat(ext: &str) -> SubFormat {
    match ext {
        "mat" | "rf64" | "voc" | "w64" | "wav" => SubFormat::U8,
        _ => SubFormat::S8,
    }
}

/// Decide the output container and subformat.
///
/// `requested` is the user's `-b` value (may be empty); `input_subformat` is
/// the subformat of the source file, used when nothing was requested.
pub fn resolve(
    out_ext: &str,
    requested: &str,
    input_subformat: Option<SubFormat>,
) -> Result<OutputFormat, String> {
    let container = Container::from_extension(out_ext)
        .ok_or_else(|| format!("Unknown output file extension: {}", out_ext))?;

    let subformat = if requested.is_empty() {
        match input_subformat {
            Some(sub) if container.valid_subformats().contains(&sub) => sub,
            Some(sub) => {
                let fallback = container.default_subformat();
                warn!(
                    "Subformat {} not valid for {} output, defaulting to {}",
                    sub.name(),
                    container.name(),
                    fallback.name()
                );
                fallback
            }
            None => container.default_subformat(),
        }
    } else if requested == "8" {
        eight_bit_subformat(&out_ext.to_ascii_lowercase())
    } else {
        match SubFormat::from_name(requested) {
            Some(sub) if container.valid_subformats().contains(&sub) => sub,
            Some(sub) => {
                let fallback = container.default_subformat();
                warn!(
                    "Subformat {} not valid for {} output, defaulting to {}",
                    sub.name(),
                    container.name(),
                    fallback.name()
                );
                fallback
            }
            None => {
                let fallback = container.default_subformat();
                warn!(
                    "Bit format {} not recognised, defaulting to {}",
                    requested,
                    fallback.name()
                );
                fallback
            }
        }
    };

    Ok(OutputFormat {
        container,
        subformat,
    })
}

/// Predicted size of the output audio data in bytes.
pub fn predicted_output_bytes(
    input_samples: u64,
    bytes_per_sample: u64,
    numerator: u32,
    denominator: u32,
) -> u64 {
    input_samples * bytes_per_sample * numerator as u64 / denominator as u64
}

/// WAV cannot address 4 GiB or more of data; such outputs move to RF64.
pub fn exceeds_wav_limit(predicted_bytes: u64) -> bool {
    predicted_bytes >= 1u64 << 32
}

/// FLAC compression levels 0..=8 normalized to [0, 1].
pub fn flac_compression01(level: u8) -> f64 {
    f64::from(level.min(8)) / 8.0
}

/// Vorbis quality -1..=10 mapped to the encoder's internal level, (1 - q)/11.
pub fn vorbis_quality01(quality: f64) -> f64 {
    (1.0 - quality.clamp(-1.0, 10.0)) / 11.0
}

/// Print the valid subformat names for one extension (--listsubformats).
pub fn list_subformats(ext: &str) {
    match Container::from_extension(ext) {
        Some(container) => {
            for sub in container.valid_subformats() {
                println!("{}", sub.name());
            }
        }
        None => println!("File extension {} unknown", ext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_input_subformat_when_valid() {
        let f = resolve("wav", "", Some(SubFormat::Pcm24)).unwrap();
        assert_eq!(f.container, Container::Wav);
        assert_eq!(f.subformat, SubFormat::Pcm24);
    }

    #[test]
    fn falls_back_to_extension_default_on_invalid_combination() {
        // double PCM is not valid inside FLAC
        let f = resolve("flac", "double", None).unwrap();
        assert_eq!(f.subformat, SubFormat::Pcm16);
        // carrying an input double into FLAC falls back too
        let f = resolve("flac", "", Some(SubFormat::Double)).unwrap();
        assert_eq!(f.subformat, SubFormat::Pcm16);
    }

    #[test]
    fn eight_bit_signedness_follows_container() {
        assert_eq!(resolve("wav", "8", None).unwrap().subformat, SubFormat::U8);
        assert_eq!(resolve("rf64", "8", None).unwrap().subformat, SubFormat::U8);
        assert_eq!(resolve("w64", "8", None).unwrap().subformat, SubFormat::U8);
        assert_eq!(resolve("aiff", "8", None).unwrap().subformat, SubFormat::S8);
        assert_eq!(resolve("flac", "8", None).unwrap().subformat, SubFormat::S8);
    }

    #[test]
    fn unknown_extension_is_an_error() {
        assert!(resolve("xyz", "", None).is_err());
    }

    #[test]
    fn rf64_switch_threshold() {
        // 2 GiB of input upsampled 160:147 at 3 bytes/sample crosses 4 GiB
        let samples = 800_000_000u64;
        let bytes = predicted_output_bytes(samples, 3, 160, 147);
        assert!(exceeds_wav_limit(bytes));

        let small = predicted_output_bytes(1_000_000, 2, 160, 147);
        assert!(!exceeds_wav_limit(small));

        // boundary: exactly 2^32 switches
        assert!(exceeds_wav_limit(1u64 << 32));
        assert!(!exceeds_wav_limit((1u64 << 32) - 1));
    }

    #[test]
    fn compression_mappings() {
        assert_eq!(flac_compression01(0), 0.0);
        assert_eq!(flac_compression01(8), 1.0);
        assert!((flac_compression01(5) - 5.0 / 8.0).abs() < 1e-12);

        assert!((vorbis_quality01(-1.0) - 2.0 / 11.0).abs() < 1e-12);
        assert!((vorbis_quality01(10.0) - (-9.0 / 11.0)).abs() < 1e-12);
        assert!((vorbis_quality01(3.0) - (-2.0 / 11.0)).abs() < 1e-12);
    }

    #[test]
    fn dither_bits_from_subformat() {
        assert_eq!(dither_signal_bits(SubFormat::Pcm24), 24);
        assert_eq!(dither_signal_bits(SubFormat::U8), 8);
        assert_eq!(dither_signal_bits(SubFormat::S8), 8);
        assert_eq!(dither_signal_bits(SubFormat::Pcm16), 16);
        assert_eq!(dither_signal_bits(SubFormat::Float), 16);
        assert_eq!(dither_signal_bits(SubFormat::Pcm32), 16);
    }
}
