//! Spectral suppression of the echo left over by the linear filter.
//!
//! A Wiener-style gain `1 - |echo| / |capture|` is computed per bin from
//! smoothed magnitudes, sharpened, and applied to the linear stage's output.
//! Synthesis is overlap-add with the same sqrt-Hann window as the analysis, so
//! the stage delays its input by one block.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use super::delay::{sqrt_hann, SPECTRUM_LEN};
use crate::BLOCK_SIZE;

const WINDOW_LEN: usize = 2 * BLOCK_SIZE;

// Smoothing steps for the echo and capture magnitudes.
const ECHO_SMOOTHING: f32 = 50.0 / 256.0;
const CAPTURE_SMOOTHING: f32 = 1.0 / 16.0;

// The average gain of these bands caps every band above them.
const MIN_PREF_BAND: usize = 4;
const MAX_PREF_BAND: usize = 24;

const GAIN_FLOOR: f32 = 0.2;
const MIN_PASSING_BINS: usize = 3;

pub struct ResidualEchoSuppressor {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    window: [f32; WINDOW_LEN],
    output_window: [f32; WINDOW_LEN],
    echo_window: [f32; WINDOW_LEN],
    capture_window: [f32; WINDOW_LEN],
    echo_smooth: [f32; SPECTRUM_LEN],
    capture_smooth: [f32; SPECTRUM_LEN],
    overlap: [f32; BLOCK_SIZE],
    output_f: [Complex<f32>; WINDOW_LEN],
    echo_f: [Complex<f32>; WINDOW_LEN],
    capture_f: [Complex<f32>; WINDOW_LEN],
}

impl ResidualEchoSuppressor {
    pub fn new(planner: &mut FftPlanner<f32>) -> Self {
        Self {
            fft: planner.plan_fft_forward(WINDOW_LEN),
            ifft: planner.plan_fft_inverse(WINDOW_LEN),
            window: sqrt_hann(),
            output_window: [0.0; WINDOW_LEN],
            echo_window: [0.0; WINDOW_LEN],
            capture_window: [0.0; WINDOW_LEN],
            echo_smooth: [0.0; SPECTRUM_LEN],
            capture_smooth: [0.0; SPECTRUM_LEN],
            overlap: [0.0; BLOCK_SIZE],
            output_f: [Complex::new(0.0, 0.0); WINDOW_LEN],
            echo_f: [Complex::new(0.0, 0.0); WINDOW_LEN],
            capture_f: [Complex::new(0.0, 0.0); WINDOW_LEN],
        }
    }

    pub fn reset(&mut self) {
        self.output_window = [0.0; WINDOW_LEN];
        self.echo_window = [0.0; WINDOW_LEN];
        self.capture_window = [0.0; WINDOW_LEN];
        self.echo_smooth = [0.0; SPECTRUM_LEN];
        self.capture_smooth = [0.0; SPECTRUM_LEN];
        self.overlap = [0.0; BLOCK_SIZE];
    }

    /// Suppresses residual echo in `linear_out` using the linear stage's echo
    /// estimate and the raw capture, writing one block of output.
    pub fn process(
        &mut self,
        output: &mut [f32; BLOCK_SIZE],
        linear_out: &[f32; BLOCK_SIZE],
        echo: &[f32; BLOCK_SIZE],
        capture: &[f32; BLOCK_SIZE],
    ) {
        push_block(&mut self.output_window, linear_out);
        push_block(&mut self.echo_window, echo);
        push_block(&mut self.capture_window, capture);

        analyze(&*self.fft, &self.window, &self.output_window, &mut self.output_f);
        analyze(&*self.fft, &self.window, &self.echo_window, &mut self.echo_f);
        analyze(&*self.fft, &self.window, &self.capture_window, &mut self.capture_f);

        let gains = self.gains();

        self.output_f[0] *= gains[0];
        for k in 1..SPECTRUM_LEN {
            self.output_f[k] *= gains[k];
            if k < WINDOW_LEN - k {
                self.output_f[WINDOW_LEN - k] *= gains[k];
            }
        }
        self.ifft.process(&mut self.output_f);

        let scale = 1.0 / WINDOW_LEN as f32;
        for i in 0..BLOCK_SIZE {
            let current = self.output_f[i].re * scale * self.window[i];
            output[i] = current + self.overlap[i];
            self.overlap[i] =
                self.output_f[BLOCK_SIZE + i].re * scale * self.window[BLOCK_SIZE + i];
        }
    }

    fn gains(&mut self) -> [f32; SPECTRUM_LEN] {
        let mut gains = [1.0f32; SPECTRUM_LEN];
        let mut passing = 0;

        for k in 0..SPECTRUM_LEN {
            let echo_mag = self.echo_f[k].norm();
            let capture_mag = self.capture_f[k].norm();
            self.echo_smooth[k] += (echo_mag - self.echo_smooth[k]) * ECHO_SMOOTHING;
            self.capture_smooth[k] += (capture_mag - self.capture_smooth[k]) * CAPTURE_SMOOTHING;

            gains[k] = if self.echo_smooth[k] <= 0.0 {
                1.0
            } else if self.capture_smooth[k] <= 0.0 {
                0.0
            } else {
                (1.0 - self.echo_smooth[k] / self.capture_smooth[k]).clamp(0.0, 1.0)
            };
            if gains[k] > 0.0 {
                passing += 1;
            }
        }

        for gain in gains.iter_mut() {
            *gain *= *gain;
        }

        let preferred = &gains[MIN_PREF_BAND..=MAX_PREF_BAND];
        let average = preferred.iter().sum::<f32>() / preferred.len() as f32;
        for gain in gains[MAX_PREF_BAND..].iter_mut() {
            *gain = gain.min(average);
        }

        let mute = passing < MIN_PASSING_BINS;
        for gain in gains.iter_mut() {
            if mute || *gain < GAIN_FLOOR {
                *gain = 0.0;
            }
        }
        gains
    }
}

fn push_block(window: &mut [f32; WINDOW_LEN], block: &[f32; BLOCK_SIZE]) {
    window.copy_within(BLOCK_SIZE.., 0);
    window[BLOCK_SIZE..].copy_from_slice(block);
}

fn analyze(
    fft: &dyn Fft<f32>,
    window: &[f32; WINDOW_LEN],
    input: &[f32; WINDOW_LEN],
    out: &mut [Complex<f32>; WINDOW_LEN],
) {
    for ((out, &x), &w) in out.iter_mut().zip(input.iter()).zip(window.iter()) {
        *out = Complex::new(x * w, 0.0);
    }
    fft.process(out);
}
