// Prototype low-pass design for the polyphase resampler: a Kaiser-windowed
// sinc at the oversampled rate in_rate * L, optionally converted to minimum
// phase via the complex cepstrum.

use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;

use crate::config::{
    ConversionConfig, LpfMode, FILTERSIZE_HUGE, FILTERSIZE_LIMIT, FILTERSIZE_MEDIUM,
};
use crate::fraction::{is_simple_ratio, Fraction};

/// Floor applied to |H| before the cepstrum logarithm; the log of a true
/// spectral zero would otherwise poison the whole cepstrum.
const MINPHASE_EPSILON: f64 = 1e-9;

/// A designed prototype filter, shared read-only by every channel.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    /// Unit-DC-gain taps at the oversampled rate. Length is always odd.
    pub taps: Vec<f64>,
    pub min_phase: bool,
    /// Output samples to drop at the start of the conversion; 0 for
    /// minimum-phase filters and when delay trimming is off.
    pub group_delay: usize,
    /// Transition frequency in Hz, kept for reporting.
    pub transition_hz: f64,
}

impl FilterSpec {
    pub fn size(&self) -> usize {
        self.taps.len()
    }
}

/// Cutoff and steepness for the selected LPF mode.
/// `target_nyquist` = min(in_rate, out_rate) / 2.
fn cutoff_and_steepness(cfg: &ConversionConfig, target_nyquist: f64) -> (f64, f64) {
    match cfg.lpf_mode {
        LpfMode::Relaxed => (21.0 * target_nyquist / 22.0, 1.0),
        LpfMode::Steep => (21.0 * target_nyquist / 22.0, 2.0),
        LpfMode::Custom => {
            let ft = (cfg.lpf_cutoff_pct / 100.0) * target_nyquist;
            let steepness = if cfg.lpf_transition_pct == 0.0 {
                0.090909091 / (1.0 - cfg.lpf_cutoff_pct / 100.0)
            } else {
                0.090909091 / (cfg.lpf_transition_pct / 100.0)
            };
            (ft, steepness)
        }
        LpfMode::Normal => (10.0 * target_nyquist / 11.0, 1.0),
    }
}

/// Filter length policy. `original` is the pre-oversampling reduced ratio.
fn filter_size(original: Fraction, oversample: u32, steepness: f64) -> usize {
    let larger = original.numerator.max(original.denominator) as u64;
    let base = if is_simple_ratio(original) {
        FILTERSIZE_MEDIUM as u64 * larger / 2
    } else {
        FILTERSIZE_HUGE as u64 * larger / 320
    };
    let scaled = (oversample as f64 * base as f64 * steepness).min(FILTERSIZE_LIMIT as f64) as u64;
    (scaled | 1) as usize
}

fn kaiser_beta(sidelobe_atten_db: f64) -> f64 {
    let a = sidelobe_atten_db;
    if a > 50.0 {
        0.1102 * (a - 8.7)
    } else if a >= 21.0 {
        0.5842 * (a - 21.0).powf(0.4) + 0.07886 * (a - 21.0)
    } else {
        0.0
    }
}

/// Zeroth-order modified Bessel function of the first kind, by power series.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x = x / 2.0;
    let mut k = 1.0;
    loop {
        term *= (half_x / k) * (half_x / k);
        sum += term;
        if term < sum * 1e-16 {
            return sum;
        }
        k += 1.0;
    }
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Ideal low-pass impulse response, cutoff `ft` Hz at sample rate `fs` Hz.
fn make_lpf(n: usize, ft: f64, fs: f64) -> Vec<f64> {
    let fc = ft / fs;
    let mid = (n - 1) as f64 / 2.0;
    (0..n)
        .map(|i| 2.0 * fc * sinc(2.0 * fc * (i as f64 - mid)))
        .collect()
}

fn apply_kaiser_window(taps: &mut [f64], beta: f64) {
    let n = taps.len();
    let denom = bessel_i0(beta);
    let mid = (n - 1) as f64 / 2.0;
    for (i, t) in taps.iter_mut().enumerate() {
        let r = (i as f64 - mid) / mid;
        *t *= bessel_i0(beta * (1.0 - r * r).sqrt()) / denom;
    }
}

/// Scale so the DC gain at the decimated rate is exactly 1.
fn normalize_dc(taps: &mut [f64]) {
    let sum: f64 = taps.iter().sum();
    if sum != 0.0 {
        for t in taps.iter_mut() {
            *t /= sum;
        }
    }
}

/// Minimum-phase conversion via the complex cepstrum: FFT -> ln|H| -> IFFT ->
/// causal fold -> FFT -> exp -> IFFT, keeping the first N real taps.
fn make_min_phase(taps: &mut Vec<f64>) {
    let n = taps.len();
    let fft_len = (8 * n).next_power_of_two();
    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(fft_len);
    let inverse = planner.plan_fft_inverse(fft_len);

    let mut buf: Vec<Complex64> = taps
        .iter()
        .map(|&t| Complex64::new(t, 0.0))
        .chain(std::iter::repeat(Complex64::new(0.0, 0.0)))
        .take(fft_len)
        .collect();

    forward.process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex64::new(c.norm().max(MINPHASE_EPSILON).ln(), 0.0);
    }
    inverse.process(&mut buf);
    let scale = 1.0 / fft_len as f64;
    for c in buf.iter_mut() {
        *c *= scale;
    }

    // Fold the anti-causal half of the cepstrum onto the causal half:
    // weights 1, 2, ..., 2, 1, 0, ..., 0.
    for c in buf.iter_mut().take(fft_len / 2).skip(1) {
        *c *= 2.0;
    }
    for c in buf.iter_mut().skip(fft_len / 2 + 1) {
        *c = Complex64::new(0.0, 0.0);
    }

    forward.process(&mut buf);
    for c in buf.iter_mut() {
        *c = c.exp();
    }
    inverse.process(&mut buf);

    for (t, c) in taps.iter_mut().zip(buf.iter()) {
        *t = c.re * scale;
    }
    normalize_dc(taps);
}

/// Design the prototype for a conversion.
///
/// `working` is the (possibly oversampled) fraction actually driven through
/// the polyphase path; `original` is the pre-oversampling reduction, which
/// governs filter size, sidelobe attenuation and group delay.
pub fn design(
    in_rate: u32,
    out_rate: u32,
    working: Fraction,
    original: Fraction,
    oversample: u32,
    cfg: &ConversionConfig,
) -> FilterSpec {
    let target_nyquist = in_rate.min(out_rate) as f64 / 2.0;
    let (ft, steepness) = cutoff_and_steepness(cfg, target_nyquist);
    let n = filter_size(original, oversample, steepness);

    let sidelobe_atten = if original.numerator == 1 || original.denominator == 1 {
        195.0
    } else {
        160.0
    };

    let oversampled_rate = in_rate as f64 * working.numerator as f64;
    let mut taps = make_lpf(n, ft, oversampled_rate);
    apply_kaiser_window(&mut taps, kaiser_beta(sidelobe_atten));
    normalize_dc(&mut taps);

    if cfg.min_phase {
        make_min_phase(&mut taps);
    }

    let group_delay = if cfg.min_phase || !cfg.trim_group_delay {
        0
    } else {
        (n - 1) / 2 / original.denominator as usize
    };

    FilterSpec {
        taps,
        min_phase: cfg.min_phase,
        group_delay,
        transition_hz: ft,
    }
}
