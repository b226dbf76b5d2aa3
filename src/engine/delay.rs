//! Block delay estimation on binary spectra.
//!
//! Each block's magnitude spectrum is reduced to one bit per band (above or
//! below an adaptive threshold). The capture bits are compared against the
//! history of render bits; the delay whose smoothed mismatch count is lowest
//! becomes a candidate, and a candidate only replaces the current estimate once
//! it is both deep enough in the cost function and backed by a histogram of
//! past candidates.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::BLOCK_SIZE;

/// Longest delay that can be estimated, in blocks.
pub const MAX_DELAY: usize = 100;

/// Unique bins of a two-block FFT.
pub const SPECTRUM_LEN: usize = BLOCK_SIZE + 1;

const WINDOW_LEN: usize = 2 * BLOCK_SIZE;

// Bands used for the binary spectrum; at most 32 so they fit a u32.
const BAND_FIRST: usize = 12;
const BAND_LAST: usize = 43;

const THRESHOLD_SHIFTS: i32 = 6;
const MAX_BIT_COUNT: f32 = 32.0;
const INITIAL_MEAN_BIT_COUNT: f32 = 20.0;
const SHIFTS_AT_ZERO: i32 = 13;
const SHIFTS_LINEAR_SLOPE: i32 = 3;

const PROBABILITY_OFFSET: f32 = 2.0;
const PROBABILITY_LOWER_LIMIT: f32 = 17.0;
const PROBABILITY_MIN_SPREAD: f32 = 5.5;
const PROBABILITY_STEP: f32 = 1.0 / 512.0;

const HISTOGRAM_SCALE: f32 = 1.0 / 32.0;
const HISTOGRAM_MAX: f32 = 3000.0;
const LAST_HISTOGRAM_MAX: f32 = 250.0;
const MIN_HISTOGRAM_THRESHOLD: f32 = 1.5;
const MIN_REQUIRED_HITS: u32 = 10;
const MAX_HITS_WHEN_POSSIBLY_NON_CAUSAL: u32 = 10;
const MAX_HITS_WHEN_POSSIBLY_CAUSAL: u32 = 1000;
const FRACTION_SLOPE: f32 = 0.05;
const MIN_FRACTION_WHEN_POSSIBLY_CAUSAL: f32 = 0.5;
const MIN_FRACTION_WHEN_POSSIBLY_NON_CAUSAL: f32 = 0.25;

const NO_DELAY: i32 = -2;

/// Magnitude spectrum of a sqrt-Hann windowed two-block window.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: [f32; WINDOW_LEN],
    buffer: [Complex<f32>; WINDOW_LEN],
}

impl SpectrumAnalyzer {
    pub fn new(planner: &mut FftPlanner<f32>) -> Self {
        Self {
            fft: planner.plan_fft_forward(WINDOW_LEN),
            window: sqrt_hann(),
            buffer: [Complex::new(0.0, 0.0); WINDOW_LEN],
        }
    }

    pub fn magnitude(
        &mut self,
        previous: &[f32; BLOCK_SIZE],
        current: &[f32; BLOCK_SIZE],
    ) -> [f32; SPECTRUM_LEN] {
        for (i, sample) in previous.iter().chain(current.iter()).enumerate() {
            self.buffer[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let mut out = [0.0; SPECTRUM_LEN];
        for (out, bin) in out.iter_mut().zip(self.buffer.iter()) {
            *out = bin.norm();
        }
        out
    }
}

/// `sqrt(hann(n))` for a periodic Hann window of `WINDOW_LEN` samples. The
/// squared halves of the window sum to one, so analysis and synthesis with it
/// reconstruct the input exactly under 50% overlap.
pub(crate) fn sqrt_hann() -> [f32; WINDOW_LEN] {
    std::array::from_fn(|n| (PI * n as f32 / WINDOW_LEN as f32).sin())
}

/// Reduces a spectrum to one bit per band against a slowly tracking threshold.
#[derive(Debug, Clone)]
struct BinarySpectrum {
    threshold: [f32; SPECTRUM_LEN],
    initialized: bool,
}

impl BinarySpectrum {
    fn new() -> Self {
        Self {
            threshold: [0.0; SPECTRUM_LEN],
            initialized: false,
        }
    }

    fn binarize(&mut self, spectrum: &[f32; SPECTRUM_LEN]) -> u32 {
        if !self.initialized {
            // Start from half the first non-silent spectrum to converge faster.
            for i in BAND_FIRST..=BAND_LAST {
                if spectrum[i] > 0.0 {
                    self.threshold[i] = spectrum[i] / 2.0;
                    self.initialized = true;
                }
            }
        }

        let mut bits = 0u32;
        for i in BAND_FIRST..=BAND_LAST {
            mean_estimator(spectrum[i], THRESHOLD_SHIFTS, &mut self.threshold[i]);
            if spectrum[i] > self.threshold[i] {
                bits |= 1 << (i - BAND_FIRST);
            }
        }
        bits
    }
}

/// Estimates the render-to-capture delay in blocks.
#[derive(Debug, Clone)]
pub struct DelayEstimator {
    far_binary: BinarySpectrum,
    near_binary: BinarySpectrum,
    // Index 0 holds the most recent render block.
    far_history: [u32; MAX_DELAY],
    far_bit_counts: [u32; MAX_DELAY],
    bit_counts: [u32; MAX_DELAY],
    mean_bit_counts: [f32; MAX_DELAY + 1],
    minimum_probability: f32,
    last_delay_probability: f32,
    last_delay: i32,
    last_candidate_delay: i32,
    compare_delay: usize,
    candidate_hits: u32,
    histogram: [f32; MAX_DELAY + 1],
    last_delay_histogram: f32,
    allowed_offset: i32,
}

impl Default for DelayEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayEstimator {
    pub fn new() -> Self {
        Self {
            far_binary: BinarySpectrum::new(),
            near_binary: BinarySpectrum::new(),
            far_history: [0; MAX_DELAY],
            far_bit_counts: [0; MAX_DELAY],
            bit_counts: [0; MAX_DELAY],
            mean_bit_counts: [INITIAL_MEAN_BIT_COUNT; MAX_DELAY + 1],
            minimum_probability: MAX_BIT_COUNT,
            last_delay_probability: MAX_BIT_COUNT,
            last_delay: NO_DELAY,
            last_candidate_delay: NO_DELAY,
            compare_delay: MAX_DELAY,
            candidate_hits: 0,
            histogram: [0.0; MAX_DELAY + 1],
            last_delay_histogram: 0.0,
            allowed_offset: 0,
        }
    }

    /// The current estimate, `None` until a candidate has been validated.
    pub fn delay(&self) -> Option<usize> {
        usize::try_from(self.last_delay).ok()
    }

    /// Pushes the render spectrum of the current block into the history.
    pub fn add_far_spectrum(&mut self, spectrum: &[f32; SPECTRUM_LEN]) {
        let bits = self.far_binary.binarize(spectrum);
        self.far_history.copy_within(0..MAX_DELAY - 1, 1);
        self.far_history[0] = bits;
        self.far_bit_counts.copy_within(0..MAX_DELAY - 1, 1);
        self.far_bit_counts[0] = bits.count_ones();
    }

    /// Matches the capture spectrum of the current block against the render
    /// history and returns the updated estimate.
    pub fn process_near_spectrum(&mut self, spectrum: &[f32; SPECTRUM_LEN]) -> Option<usize> {
        let near = self.near_binary.binarize(spectrum);

        for (count, far) in self.bit_counts.iter_mut().zip(self.far_history.iter()) {
            *count = (near ^ far).count_ones();
        }

        // Only smooth where the render had content; silence says nothing about the delay.
        for i in 0..MAX_DELAY {
            let far_bits = self.far_bit_counts[i];
            if far_bits > 0 {
                let shifts = SHIFTS_AT_ZERO - ((SHIFTS_LINEAR_SLOPE * far_bits as i32) >> 4);
                mean_estimator(
                    self.bit_counts[i] as f32,
                    shifts,
                    &mut self.mean_bit_counts[i],
                );
            }
        }

        let mut candidate = 0usize;
        let mut best = MAX_BIT_COUNT;
        let mut worst = 0.0f32;
        for (i, &mean) in self.mean_bit_counts[..MAX_DELAY].iter().enumerate() {
            if mean < best {
                best = mean;
                candidate = i;
            }
            if mean > worst {
                worst = mean;
            }
        }
        let valley_depth = worst - best;

        if self.minimum_probability > PROBABILITY_LOWER_LIMIT && valley_depth > PROBABILITY_MIN_SPREAD
        {
            let threshold = (best + PROBABILITY_OFFSET).max(PROBABILITY_LOWER_LIMIT);
            if self.minimum_probability > threshold {
                self.minimum_probability = threshold;
            }
        }
        self.last_delay_probability += PROBABILITY_STEP;

        let instantaneous_valid = valley_depth > PROBABILITY_OFFSET
            && (best < self.minimum_probability || best < self.last_delay_probability);

        // A stationary render freezes the estimate.
        let non_stationary_far = self.far_bit_counts.iter().any(|&bits| bits > 0);
        if non_stationary_far {
            self.update_histogram(candidate, valley_depth, best);
        }

        let histogram_valid = self.histogram_valid(candidate);
        let valid = self.robust_valid(candidate, instantaneous_valid, histogram_valid);

        if non_stationary_far && valid {
            if candidate as i32 != self.last_delay {
                self.last_delay_histogram = self.histogram[candidate].min(LAST_HISTOGRAM_MAX);
                if self.histogram[candidate] < self.histogram[self.compare_delay] {
                    self.histogram[self.compare_delay] = self.histogram[candidate];
                }
            }
            self.last_delay = candidate as i32;
            if best < self.last_delay_probability {
                self.last_delay_probability = best;
            }
            self.compare_delay = candidate;
        }

        self.delay()
    }

    fn update_histogram(&mut self, candidate: usize, valley_depth: f32, valley_level: f32) {
        let candidate_i = candidate as i32;
        let depth = valley_depth * HISTOGRAM_SCALE;
        let max_hits_for_slow_change = if candidate_i < self.last_delay {
            MAX_HITS_WHEN_POSSIBLY_NON_CAUSAL
        } else {
            MAX_HITS_WHEN_POSSIBLY_CAUSAL
        };

        if candidate_i != self.last_candidate_delay {
            self.candidate_hits = 0;
            self.last_candidate_delay = candidate_i;
        }
        self.candidate_hits += 1;

        self.histogram[candidate] = (self.histogram[candidate] + depth).min(HISTOGRAM_MAX);

        let decrease_in_last_set = if self.candidate_hits < max_hits_for_slow_change {
            (self.mean_bit_counts[self.compare_delay] - valley_level) * HISTOGRAM_SCALE
        } else {
            depth
        };

        for i in 0..MAX_DELAY {
            let i_i = i as i32;
            let in_last_set = i_i >= self.last_delay - 2
                && i_i <= self.last_delay + 1
                && i != candidate;
            let in_candidate_set = i_i >= candidate_i - 2 && i_i <= candidate_i + 1;
            let decrease = if in_last_set {
                decrease_in_last_set
            } else if !in_candidate_set {
                depth
            } else {
                0.0
            };
            self.histogram[i] = (self.histogram[i] - decrease).max(0.0);
        }
    }

    fn histogram_valid(&self, candidate: usize) -> bool {
        let delay_difference = candidate as i32 - self.last_delay;
        let fraction = if delay_difference > self.allowed_offset {
            (1.0 - FRACTION_SLOPE * (delay_difference - self.allowed_offset) as f32)
                .max(MIN_FRACTION_WHEN_POSSIBLY_CAUSAL)
        } else if delay_difference < 0 {
            (MIN_FRACTION_WHEN_POSSIBLY_NON_CAUSAL - FRACTION_SLOPE * delay_difference as f32)
                .min(1.0)
        } else {
            1.0
        };
        let threshold =
            (self.histogram[self.compare_delay] * fraction).max(MIN_HISTOGRAM_THRESHOLD);

        self.histogram[candidate] >= threshold && self.candidate_hits > MIN_REQUIRED_HITS
    }

    fn robust_valid(&self, candidate: usize, instantaneous: bool, histogram: bool) -> bool {
        // Before the first estimate either check is enough; afterwards both must agree.
        let mut robust = self.last_delay < 0 && (instantaneous || histogram);
        robust |= instantaneous && histogram;
        robust |= histogram && self.histogram[candidate] > self.last_delay_histogram;
        robust
    }
}

/// `mean += (value - mean) * 2^-shifts`
fn mean_estimator(value: f32, shifts: i32, mean: &mut f32) {
    *mean += (value - *mean) / (1u32 << shifts.clamp(0, 31)) as f32;
}
