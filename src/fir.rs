// Streaming FIR over a power-of-two ring with mask indexing, plus a
// polyphase `lazy_get` that skips the known zeros of the zero-stuffed
// interpolation path.

use std::sync::Arc;

use crate::real::Real;

pub struct FirFilter<F: Real> {
    taps: Arc<Vec<F>>,
    ring: Vec<F>,
    mask: usize,
    /// Next write position.
    head: usize,
    /// Pushes since the last non-zero (real) sample; selects the polyphase
    /// subfilter in `lazy_get`.
    phase: usize,
}

impl<F: Real> FirFilter<F> {
    pub fn new(taps: Arc<Vec<F>>) -> Self {
        assert!(!taps.is_empty());
        let cap = taps.len().next_power_of_two();
        Self {
            taps,
            ring: vec![F::ZERO; cap],
            mask: cap - 1,
            head: 0,
            phase: 0,
        }
    }

    /// Convert a designed f64 prototype into the pipeline scalar once; every
    /// channel then shares the converted taps.
    pub fn shared_taps(taps: &[f64]) -> Arc<Vec<F>> {
        Arc::new(taps.iter().map(|&t| F::from_f64(t)).collect())
    }

    #[inline]
    pub fn push(&mut self, x: F) {
        self.ring[self.head] = x;
        self.head = (self.head + 1) & self.mask;
        self.phase = 0;
    }

    #[inline]
    pub fn push_zero(&mut self) {
        self.ring[self.head] = F::ZERO;
        self.head = (self.head + 1) & self.mask;
        self.phase += 1;
    }

    /// Full convolution over all N taps. The ring is walked as at most two
    /// contiguous slices so the inner loops stay branch-free.
    pub fn get(&self) -> F {
        let n = self.taps.len();
        let cap = self.ring.len();
        let newest = (self.head + cap - 1) & self.mask;
        let first = (newest + 1).min(n);

        let mut acc = F::ZERO;
        for (&t, &x) in self.taps[..first]
            .iter()
            .zip(self.ring[newest + 1 - first..=newest].iter().rev())
        {
            acc += t * x;
        }
        if n > first {
            let rem = n - first;
            for (&t, &x) in self.taps[first..]
                .iter()
                .zip(self.ring[cap - rem..].iter().rev())
            {
                acc += t * x;
            }
        }
        acc
    }

    /// Polyphase shortcut for the interpolation path: with L-1 of every L
    /// pushes being zeros, only taps congruent to the current zero-insertion
    /// phase (mod L) can contribute. Equivalent to `get()` at any point of the
    /// push(x) / push_zero x (L-1) cycle.
    pub fn lazy_get(&self, l: usize) -> F {
        let n = self.taps.len();
        let cap = self.ring.len();
        let p = self.phase % l;
        if p >= n {
            return F::ZERO;
        }
        let mut acc = F::ZERO;
        let mut i = p;
        let mut idx = (self.head + cap - 1 - p) & self.mask;
        while i < n {
            acc += self.taps[i] * self.ring[idx];
            idx = (idx + cap - l) & self.mask;
            i += l;
        }
        acc
    }

    /// Zero the delay line (used on clipping restart).
    pub fn reset(&mut self) {
        self.ring.fill(F::ZERO);
        self.head = 0;
        self.phase = 0;
    }
}
