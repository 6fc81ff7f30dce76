// One worker per audio channel: drives the channel's FIR and ditherer over an
// interleaved input block and stages the channel's output contiguously. The
// driver interleaves staged output after joining all workers.

use std::sync::Arc;

use crate::dither::Ditherer;
use crate::fir::FirFilter;
use crate::fraction::Fraction;
use crate::real::Real;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioClass {
    /// L = M = 1: format conversion only, no filtering.
    Copy,
    /// M = 1: interpolate by L.
    Interpolate,
    /// L = 1: decimate by M.
    Decimate,
    /// L, M > 1: interpolate then decimate.
    Both,
}

pub fn classify(f: Fraction) -> RatioClass {
    match (f.numerator, f.denominator) {
        (1, 1) => RatioClass::Copy,
        (_, 1) => RatioClass::Interpolate,
        (1, _) => RatioClass::Decimate,
        _ => RatioClass::Both,
    }
}

pub struct ChannelWorker<F: Real> {
    channel: usize,
    class: RatioClass,
    l: u32,
    m: u32,
    filter: FirFilter<F>,
    ditherer: Option<Ditherer>,
    decim_phase: u32,
}

impl<F: Real> ChannelWorker<F> {
    pub fn new(
        channel: usize,
        taps: Arc<Vec<F>>,
        ratio: Fraction,
        ditherer: Option<Ditherer>,
    ) -> Self {
        Self {
            channel,
            class: classify(ratio),
            l: ratio.numerator,
            m: ratio.denominator,
            filter: FirFilter::new(taps),
            ditherer,
            decim_phase: 0,
        }
    }

    /// Clear all streaming state for a clipping-recovery restart.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.decim_phase = 0;
        if let Some(d) = self.ditherer.as_mut() {
            d.reset();
        }
    }

    pub fn adjust_dither_gain(&mut self, factor: f64) {
        if let Some(d) = self.ditherer.as_mut() {
            d.adjust_gain(factor);
        }
    }

    #[inline]
    fn emit(&mut self, value: F, staging: &mut Vec<F>, peak: &mut F) {
        let out = match self.ditherer.as_mut() {
            Some(d) => F::from_f64(d.process(value.to_f64())),
            None => value,
        };
        *peak = peak.max(out.abs());
        staging.push(out);
    }

    /// Run this channel over one interleaved block. Returns the number of
    /// staged output samples and the local peak.
    pub fn process_block(
        &mut self,
        input: &[F],
        channels: usize,
        gain: F,
        staging: &mut Vec<F>,
    ) -> (usize, F) {
        staging.clear();
        let mut peak = F::ZERO;
        let mut s = self.channel;

        match self.class {
            RatioClass::Copy => {
                while s < input.len() {
                    let y = gain * input[s];
                    self.emit(y, staging, &mut peak);
                    s += channels;
                }
            }
            RatioClass::Interpolate => {
                let l = self.l as usize;
                while s < input.len() {
                    for ii in 0..l {
                        if ii == 0 {
                            self.filter.push(input[s]);
                        } else {
                            self.filter.push_zero();
                        }
                        let y = gain * self.filter.lazy_get(l);
                        self.emit(y, staging, &mut peak);
                    }
                    s += channels;
                }
            }
            RatioClass::Decimate => {
                while s < input.len() {
                    self.filter.push(input[s]);
                    if self.decim_phase == 0 {
                        let y = gain * self.filter.get();
                        self.emit(y, staging, &mut peak);
                    }
                    self.decim_phase += 1;
                    if self.decim_phase == self.m {
                        self.decim_phase = 0;
                    }
                    s += channels;
                }
            }
            RatioClass::Both => {
                let l = self.l as usize;
                while s < input.len() {
                    for ii in 0..l {
                        if ii == 0 {
                            self.filter.push(input[s]);
                        } else {
                            self.filter.push_zero();
                        }
                        if self.decim_phase == 0 {
                            let y = gain * self.filter.lazy_get(l);
                            self.emit(y, staging, &mut peak);
                        }
                        self.decim_phase += 1;
                        if self.decim_phase == self.m {
                            self.decim_phase = 0;
                        }
                    }
                    s += channels;
                }
            }
        }

        (staging.len(), peak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fraction::reduce;

    fn unity_taps() -> Arc<Vec<f64>> {
        FirFilter::<f64>::shared_taps(&[1.0])
    }

    #[test]
    fn classification() {
        assert_eq!(classify(reduce(44100, 44100)), RatioClass::Copy);
        assert_eq!(classify(reduce(48000, 96000)), RatioClass::Interpolate);
        assert_eq!(classify(reduce(96000, 48000)), RatioClass::Decimate);
        assert_eq!(classify(reduce(44100, 48000)), RatioClass::Both);
    }

    #[test]
    fn copy_mode_passes_through_one_channel_of_interleaved_input() {
        let mut w = ChannelWorker::new(1, unity_taps(), reduce(44100, 44100), None);
        let input: Vec<f64> = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let mut staging = Vec::new();
        let (n, peak) = w.process_block(&input, 2, 1.0, &mut staging);
        assert_eq!(n, 3);
        assert_eq!(staging, vec![0.2, 0.4, 0.6]);
        assert_eq!(peak, 0.6);
    }

    #[test]
    fn interpolation_produces_l_outputs_per_input() {
        let mut w = ChannelWorker::new(0, unity_taps(), reduce(48000, 96000), None);
        let input = vec![1.0f64; 8]; // mono
        let mut staging = Vec::new();
        let (n, _) = w.process_block(&input, 1, 1.0, &mut staging);
        assert_eq!(n, 16);
    }

    #[test]
    fn decimation_phase_carries_across_blocks() {
        // M = 3, unity filter: output is every 3rd input sample
        let mut w = ChannelWorker::new(0, unity_taps(), reduce(96000, 32000), None);
        let mut staging = Vec::new();
        let (n1, _) = w.process_block(&[1.0f64, 2.0, 3.0, 4.0], 1, 1.0, &mut staging);
        assert_eq!(n1, 2);
        assert_eq!(staging, vec![1.0, 4.0]);
        let (n2, _) = w.process_block(&[5.0f64, 6.0, 7.0], 1, 1.0, &mut staging);
        assert_eq!(n2, 1);
        assert_eq!(staging, vec![7.0]);
    }

    #[test]
    fn both_mode_total_output_follows_l_over_m() {
        // 2:3 ratio (e.g. 144k -> 96k): 300 inputs -> 200 outputs
        let ratio = reduce(144_000, 96_000);
        assert_eq!((ratio.numerator, ratio.denominator), (2, 3));
        let mut w = ChannelWorker::new(0, unity_taps(), ratio, None);
        let mut staging = Vec::new();
        let mut total = 0;
        for _ in 0..3 {
            let (n, _) = w.process_block(&vec![0.5f64; 100], 1, 1.0, &mut staging);
            total += n;
        }
        assert_eq!(total, 200);
    }

    #[test]
    fn gain_scales_output() {
        let mut w = ChannelWorker::new(0, unity_taps(), reduce(44100, 44100), None);
        let mut staging = Vec::new();
        let (_, peak) = w.process_block(&[0.25f64], 1, 2.0, &mut staging);
        assert_eq!(staging, vec![0.5]);
        assert_eq!(peak, 0.5);
    }

    #[test]
    fn reset_clears_decimation_phase_and_filter() {
        let mut w = ChannelWorker::new(0, unity_taps(), reduce(96000, 48000), None);
        let mut staging = Vec::new();
        let (n, _) = w.process_block(&[1.0f64, 2.0, 3.0], 1, 1.0, &mut staging);
        assert_eq!(n, 2); // samples 1 and 3
        w.reset();
        let (n, _) = w.process_block(&[1.0f64, 2.0, 3.0], 1, 1.0, &mut staging);
        assert_eq!(n, 2);
        assert_eq!(staging, vec![1.0, 3.0]);
    }
}
