// Pipeline driver: classifies the conversion ratio, streams blocks through
// the per-channel workers, tracks the output peak, and restarts the whole
// pass with trimmed gain when clipping protection detects an overshoot.

use std::error::Error;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;

use crate::channel::{classify, ChannelWorker, RatioClass};
use crate::config::{ConversionConfig, BUFFERSIZE, CLIPPING_TRIM, MAXCHANNELS};
use crate::dither::{default_profile_id, headroom_factor, Ditherer, DITHER_PROFILES};
use crate::filter_design::design;
use crate::fir::FirFilter;
use crate::format::{self, Container, SubFormat};
use crate::fraction::{oversample_for_minphase, reduce};
use crate::input::InputFile;
use crate::output::{OutputFile, OutputSpec};
use crate::real::Real;

/// Hard stop for the clipping-recovery loop; each pass trims the gain by at
/// least CLIPPING_TRIM, so real inputs converge in one or two passes.
const MAX_CLIPPING_PASSES: u32 = 8;

#[derive(Debug)]
pub struct ConversionReport {
    pub frames_written: u64,
    pub peak: f64,
    pub passes: u32,
}

pub fn convert<F: Real>(cfg: &ConversionConfig) -> Result<ConversionReport, Box<dyn Error>> {
    cfg.validate().map_err(|e| -> Box<dyn Error> { e.into() })?;

    let mut infile = InputFile::open(&cfg.input_path)?;
    let channels = infile.channels() as usize;
    if channels == 0 || channels > MAXCHANNELS as usize {
        return Err(format!("Unsupported channel count: {}", channels).into());
    }
    let in_rate = infile.sample_rate();
    if in_rate == 0 {
        return Err("Input file reports a zero sample rate".into());
    }
    let input_samples = infile.frames() * channels as u64;

    info!("source file channels: {}", channels);
    info!(
        "input sample rate: {} Hz, output sample rate: {} Hz",
        in_rate, cfg.output_rate
    );

    let buffer_size = (BUFFERSIZE / channels) * channels;
    let mut in_buf = vec![F::ZERO; buffer_size];

    // Peak scan (PCM only; for DSD a full scan is skipped and 0.5 is a good
    // guess at the modulator's practical ceiling).
    let mut measured_peak: f64 = if infile.is_dsd() {
        if cfg.normalize {
            0.5
        } else {
            1.0
        }
    } else {
        info!("Scanning input file for peaks ...");
        let mut peak = 0.0f64;
        loop {
            let n = infile.read(&mut in_buf)?;
            if n == 0 {
                break;
            }
            for x in &in_buf[..n] {
                peak = peak.max(x.to_f64().abs());
            }
        }
        infile.seek_start()?;
        info!(
            "Peak input sample: {:.6} ({:.2} dBFS)",
            peak,
            20.0 * peak.max(1e-20).log10()
        );
        peak
    };
    if measured_peak == 0.0 {
        // silent input; avoid dividing by zero when normalizing
        measured_peak = 1.0;
    }

    if cfg.normalize {
        info!("Normalizing to {:.2}", cfg.limit);
    }

    let original = reduce(in_rate, cfg.output_rate);
    let (working, oversample) = oversample_for_minphase(original, cfg.min_phase);
    info!(
        "Conversion ratio: {:.6} ({}:{})",
        cfg.output_rate as f64 / in_rate as f64,
        original.numerator,
        original.denominator
    );

    let spec = design(in_rate, cfg.output_rate, working, original, oversample, cfg);
    let target_nyquist = in_rate.min(cfg.output_rate) as f64 / 2.0;
    info!(
        "LPF transition frequency: {:.2} Hz ({:.2} %)",
        spec.transition_hz,
        100.0 * spec.transition_hz / target_nyquist
    );
    if cfg.min_phase {
        info!("Using minimum-phase LPF");
    }

    // Resolve the output container and subformat, promoting WAV to RF64 when
    // the predicted data size cannot fit a 32-bit chunk.
    let out_ext = cfg
        .output_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();
    let mut out_format = format::resolve(&out_ext, &cfg.out_bit_format, infile.subformat())?;
    if out_format.container == Container::Wav {
        let predicted = format::predicted_output_bytes(
            input_samples,
            u64::from(out_format.subformat.bytes_per_sample()),
            original.numerator,
            original.denominator,
        );
        let too_big = format::exceeds_wav_limit(predicted);
        if too_big {
            warn!(
                "Output file ({} bytes of data) will exceed the 4 GiB WAV limit",
                predicted
            );
        }
        if too_big || cfg.force_rf64 {
            info!("Switching to rf64 format");
            out_format.container = Container::Rf64;
        }
    }

    let signal_bits = format::dither_signal_bits(out_format.subformat);
    let profile_id = cfg
        .dither_profile
        .unwrap_or_else(|| default_profile_id(cfg.output_rate))
        .min(DITHER_PROFILES.len() - 1);
    if cfg.dither {
        info!(
            "Generating {:.2} bits of {} dither for {}-bit output format{}",
            cfg.dither_bits,
            DITHER_PROFILES[profile_id].name,
            signal_bits,
            if cfg.auto_blank {
                ", with auto-blanking"
            } else {
                ""
            }
        );
    }

    // Initial gain: interpolation attenuates by L, so the numerator rides
    // along; normalization folds the measured peak in.
    let mut gain = cfg.gain
        * f64::from(working.numerator)
        * if cfg.normalize {
            cfg.limit / measured_peak
        } else {
            cfg.limit
        };
    if cfg.dither {
        gain *= headroom_factor(signal_bits, cfg.dither_bits);
    }

    let taps = FirFilter::<F>::shared_taps(&spec.taps);
    let base_seed: u64 = if cfg.use_seed {
        u64::from(cfg.seed)
    } else {
        u64::from(rand::random::<u32>())
    };
    let mut workers: Vec<ChannelWorker<F>> = (0..channels)
        .map(|ch| {
            let ditherer = cfg.dither.then(|| {
                Ditherer::new(
                    signal_bits,
                    cfg.dither_bits,
                    cfg.auto_blank,
                    base_seed + ch as u64,
                    profile_id,
                )
            });
            ChannelWorker::new(ch, taps.clone(), working, ditherer)
        })
        .collect();

    let out_spec = OutputSpec {
        format: out_format,
        channels: channels as u32,
        rate: cfg.output_rate,
    };

    let mut stagings: Vec<Vec<F>> = vec![Vec::new(); channels];
    let mut out_buf: Vec<F> = Vec::new();
    let progress_inc = (input_samples / 10).max(1);

    let wall_start = Instant::now();
    let mut passes = 0u32;
    let mut peak_out: f64;
    let mut frames_written: u64;

    loop {
        passes += 1;

        // worker pool lives for one pass; rebuilt after a clipping restart
        let pool = if cfg.multithread {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(channels)
                    .build()?,
            )
        } else {
            None
        };

        let mut outfile = OutputFile::create(&cfg.output_path, out_spec)?;
        if cfg.write_metadata && !infile.metadata().is_empty() {
            info!("Writing metadata");
            outfile.set_metadata(infile.metadata());
        }
        if out_format.container == Container::Flac {
            if let Some(level) = cfg.flac_level {
                info!("Setting flac compression level to {}", level);
                outfile.set_compression(format::flac_compression01(level));
            }
        }
        if out_format.subformat == SubFormat::Vorbis {
            if let Some(q) = cfg.vorbis_quality {
                info!("Setting vorbis quality level to {}", q);
                outfile.set_compression(format::vorbis_quality01(q));
            }
        }

        let progress = ProgressBar::new(100).with_style(
            ProgressStyle::with_template("{prefix} {bar:20.cyan/blue} {percent}%")?,
        );
        progress.set_prefix("[Converting]");

        peak_out = 0.0;
        frames_written = 0;
        let mut samples_read = 0u64;
        let mut next_threshold = progress_inc;
        // 1:1 passthrough never goes through the filter, so there is no
        // delay to trim
        let mut skip = if classify(working) == RatioClass::Copy {
            0
        } else {
            spec.group_delay * channels
        };
        let gain_f = F::from_f64(gain);

        loop {
            let count = infile.read(&mut in_buf)?;
            if count == 0 {
                break;
            }
            samples_read += count as u64;
            let input = &in_buf[..count];

            let results: Vec<(usize, F)> = match pool.as_ref() {
                Some(p) => p.install(|| {
                    workers
                        .par_iter_mut()
                        .zip(stagings.par_iter_mut())
                        .map(|(w, s)| w.process_block(input, channels, gain_f, s))
                        .collect()
                }),
                None => workers
                    .iter_mut()
                    .zip(stagings.iter_mut())
                    .map(|(w, s)| w.process_block(input, channels, gain_f, s))
                    .collect(),
            };

            let produced = results[0].0;
            debug_assert!(results.iter().all(|r| r.0 == produced));
            for &(_, p) in &results {
                peak_out = peak_out.max(p.to_f64());
            }

            if produced > 0 {
                out_buf.resize(produced * channels, F::ZERO);
                for (ch, staging) in stagings.iter().enumerate() {
                    for (i, &v) in staging.iter().enumerate() {
                        out_buf[i * channels + ch] = v;
                    }
                }
                // group-delay skip applies to the first non-empty write only
                let start = skip.min(out_buf.len());
                skip = 0;
                if start < out_buf.len() {
                    outfile.write(&out_buf[start..])?;
                    frames_written += ((out_buf.len() - start) / channels) as u64;
                }
            }

            if samples_read > next_threshold {
                let pct = (100 * samples_read / input_samples.max(1)).min(99);
                progress.set_position(pct);
                next_threshold += progress_inc;
            }
        }

        outfile.finalize()?;
        progress.finish_and_clear();

        info!(
            "Peak output sample: {:.6} ({:.2} dBFS)",
            peak_out,
            20.0 * peak_out.max(1e-20).log10()
        );

        if peak_out > cfg.limit {
            if cfg.disable_clipping_protection {
                warn!("Clipping detected (protection disabled)");
                break;
            }
            if passes >= MAX_CLIPPING_PASSES {
                warn!(
                    "Clipping recovery did not converge after {} passes",
                    passes
                );
                break;
            }
            let adjustment = CLIPPING_TRIM * cfg.limit / peak_out;
            gain *= adjustment;
            warn!(
                "Clipping detected! Re-doing with {:.2} dB gain adjustment",
                20.0 * adjustment.log10()
            );
            infile.seek_start()?;
            for w in workers.iter_mut() {
                w.adjust_dither_gain(adjustment);
                w.reset();
            }
            continue;
        }
        break;
    }

    let elapsed = wall_start.elapsed();
    let audio_seconds = infile.frames() as f64 / f64::from(in_rate);
    let total_secs = elapsed.as_secs();
    info!(
        "Conversion time: {:02}:{:02}:{:02} (speed: {:.2}x realtime)",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        audio_seconds / elapsed.as_secs_f64().max(1e-9)
    );

    Ok(ConversionReport {
        frames_written,
        peak: peak_out,
        passes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::WavWriter;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("rerate-conv-{}-{}", std::process::id(), name));
        p
    }

    fn write_wav(path: &PathBuf, requested: &str, channels: u32, rate: u32, samples: &[f64]) {
        let spec = OutputSpec {
            format: format::resolve("wav", requested, None).unwrap(),
            channels,
            rate,
        };
        let mut w = WavWriter::create(path, spec).unwrap();
        w.metadata = None;
        let mut file = OutputFile::Wav(w);
        file.write(samples).unwrap();
        file.finalize().unwrap();
    }

    fn base_cfg(input: &PathBuf, output: &PathBuf, rate: u32) -> ConversionConfig {
        ConversionConfig {
            input_path: input.clone(),
            output_path: output.clone(),
            output_rate: rate,
            ..Default::default()
        }
    }

    #[test]
    fn identity_conversion_is_bit_exact() {
        let input = temp_path("ident-in.wav");
        let output = temp_path("ident-out.wav");
        // stereo samples sitting exactly on the 16-bit grid
        let samples: Vec<f64> = (0..200).map(|i| f64::from(i - 100) * 128.0 / 32768.0).collect();
        write_wav(&input, "16", 2, 44100, &samples);

        let cfg = base_cfg(&input, &output, 44100);
        let report = convert::<f64>(&cfg).unwrap();
        assert_eq!(report.passes, 1);
        assert_eq!(report.frames_written, 100);

        let mut reader = InputFile::open(&output).unwrap();
        assert_eq!(reader.sample_rate(), 44100);
        assert_eq!(reader.channels(), 2);
        let mut buf = vec![0f64; samples.len()];
        assert_eq!(reader.read(&mut buf).unwrap(), samples.len());
        assert_eq!(buf, samples);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn output_length_matches_ratio_minus_group_delay() {
        let input = temp_path("len-in.wav");
        let output = temp_path("len-out.wav");
        let in_frames = 4410usize;
        let samples: Vec<f64> = (0..in_frames)
            .map(|i| 0.25 * (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / 44100.0).sin())
            .collect();
        write_wav(&input, "16", 1, 44100, &samples);

        let cfg = base_cfg(&input, &output, 48000);
        let report = convert::<f64>(&cfg).unwrap();

        // expected emissions: one per 147 pushes out of in_frames * 160
        let original = reduce(44100, 48000);
        let (working, os) = oversample_for_minphase(original, false);
        let spec = design(44100, 48000, working, original, os, &cfg);
        let total = (in_frames as u64 * 160).div_ceil(147);
        let expected = total - spec.group_delay as u64;
        assert!(
            report.frames_written >= expected - 1 && report.frames_written <= expected + 1,
            "frames {} vs expected {}",
            report.frames_written,
            expected
        );

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn normalization_brings_peak_into_band() {
        let input = temp_path("norm-in.wav");
        let output = temp_path("norm-out.wav");
        let mut samples = vec![0.0f64; 100];
        samples[50] = 0.5;
        write_wav(&input, "16", 1, 44100, &samples);

        let mut cfg = base_cfg(&input, &output, 44100);
        cfg.normalize = true;
        cfg.limit = 1.0;
        let report = convert::<f64>(&cfg).unwrap();
        assert!(
            report.peak >= 0.9 * cfg.limit && report.peak <= cfg.limit,
            "peak {}",
            report.peak
        );

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn clipping_recovery_converges_and_caps_peak() {
        let input = temp_path("clip-in.wav");
        let output = temp_path("clip-out.wav");
        let samples: Vec<f64> = (0..256)
            .map(|i| 0.5 * (2.0 * std::f64::consts::PI * i as f64 / 64.0).sin())
            .collect();
        write_wav(&input, "16", 1, 44100, &samples);

        let mut cfg = base_cfg(&input, &output, 44100);
        cfg.gain = 4.0;
        let report = convert::<f64>(&cfg).unwrap();
        assert!(report.passes >= 2, "expected at least one recovery pass");
        assert!(report.passes <= 5, "recovery should converge quickly");
        assert!(report.peak <= cfg.limit + 1e-12, "peak {}", report.peak);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn disabled_protection_leaves_clipped_output_after_one_pass() {
        let input = temp_path("noclip-in.wav");
        let output = temp_path("noclip-out.wav");
        let samples = vec![0.5f64; 64];
        write_wav(&input, "16", 1, 44100, &samples);

        let mut cfg = base_cfg(&input, &output, 44100);
        cfg.gain = 4.0;
        cfg.disable_clipping_protection = true;
        let report = convert::<f64>(&cfg).unwrap();
        assert_eq!(report.passes, 1);
        assert!(report.peak > 1.0);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn multithreaded_matches_single_threaded() {
        let input = temp_path("mt-in.wav");
        let out_st = temp_path("mt-out-st.wav");
        let out_mt = temp_path("mt-out-mt.wav");
        let samples: Vec<f64> = (0..2000)
            .map(|i| 0.4 * (2.0 * std::f64::consts::PI * 440.0 * (i / 2) as f64 / 44100.0).sin())
            .collect();
        write_wav(&input, "24", 2, 44100, &samples);

        let cfg_st = base_cfg(&input, &out_st, 88200);
        let report_st = convert::<f64>(&cfg_st).unwrap();

        let mut cfg_mt = base_cfg(&input, &out_mt, 88200);
        cfg_mt.multithread = true;
        let report_mt = convert::<f64>(&cfg_mt).unwrap();

        assert_eq!(report_st.frames_written, report_mt.frames_written);
        let bytes_st = std::fs::read(&out_st).unwrap();
        let bytes_mt = std::fs::read(&out_mt).unwrap();
        assert_eq!(bytes_st, bytes_mt);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&out_st).ok();
        std::fs::remove_file(&out_mt).ok();
    }
}
