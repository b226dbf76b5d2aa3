use nalgebra::{DVector, DVectorView};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use super::delay::{DelayEstimator, SpectrumAnalyzer, MAX_DELAY};
use super::suppressor::ResidualEchoSuppressor;
use super::{EchoCanceller, Stage, StageConfig};
use crate::error::EngineError;
use crate::{Block, BLOCK_SIZE};

/// FFT length used by every stage of [`FdafEchoCanceller`]: two blocks.
pub const FFT_SIZE: usize = 2 * BLOCK_SIZE;

const SAMPLE_SCALE: f32 = 32768.0;

/// Implements a Frequency Domain Adaptive Filter (FDAF) using the Overlap-Save
/// method.
///
/// This struct holds the state of the linear echo path model and processes
/// audio in frames of `FFT_SIZE / 2` samples.
pub struct AdaptiveFilter<const FFT_SIZE: usize> {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    weights: DVector<Complex<f32>>,
    far_end_buffer: DVector<f32>,
    x_t_buffer: [Complex<f32>; FFT_SIZE],
    e_t_buffer: [Complex<f32>; FFT_SIZE],
    y_t: DVector<f32>,
    psd: DVector<f32>,
    mu: f32,
    smoothing_factor: f32,
    regularization: f32,
}

impl<const FFT_SIZE: usize> AdaptiveFilter<FFT_SIZE> {
    pub const FRAME_SIZE: usize = FFT_SIZE / 2;

    /// Creates a new `AdaptiveFilter`.
    ///
    /// # Arguments
    ///
    /// * `planner`: FFT planner shared with the other stages.
    /// * `step_size`: The learning rate (mu) of the NLMS update. A larger value
    ///   converges faster but is less stable.
    /// * `smoothing_factor`: Forgetting factor of the far-end power spectral
    ///   density used to normalise the update.
    /// * `regularization`: Added to the power spectral density so that a near
    ///   silent far end does not blow up the update.
    pub fn new(
        planner: &mut FftPlanner<f32>,
        step_size: f32,
        smoothing_factor: f32,
        regularization: f32,
    ) -> Self {
        assert!(
            Self::FRAME_SIZE > 0 && Self::FRAME_SIZE.is_power_of_two(),
            "FRAME_SIZE must be a power of two."
        );

        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
            ifft: planner.plan_fft_inverse(FFT_SIZE),
            weights: DVector::from_element(FFT_SIZE, Complex::new(0.0, 0.0)),
            far_end_buffer: DVector::zeros(FFT_SIZE),
            x_t_buffer: [Complex::new(0.0, 0.0); FFT_SIZE],
            e_t_buffer: [Complex::new(0.0, 0.0); FFT_SIZE],
            psd: DVector::from_element(FFT_SIZE, 1.0),
            y_t: DVector::zeros(FFT_SIZE),
            mu: step_size,
            smoothing_factor,
            regularization,
        }
    }

    /// Filters one frame: estimates the echo of `far_end_frame` in `mic_frame`,
    /// writes the estimate and the residual `mic - estimate`, and adapts the
    /// weights on the residual.
    pub fn process<const FRAME_SIZE: usize>(
        &mut self,
        echo_estimate: &mut [f32; FRAME_SIZE],
        error_signal: &mut [f32; FRAME_SIZE],
        far_end_frame: &[f32; FRAME_SIZE],
        mic_frame: &[f32; FRAME_SIZE],
    ) {
        assert_eq!(FRAME_SIZE, FFT_SIZE / 2);

        // Rolling window of the last FFT_SIZE far-end samples.
        self.far_end_buffer
            .as_mut_slice()
            .copy_within(FRAME_SIZE.., 0);
        self.far_end_buffer
            .rows_mut(FRAME_SIZE, FRAME_SIZE)
            .copy_from_slice(far_end_frame);

        for (idx, x) in self.far_end_buffer.iter().enumerate() {
            self.x_t_buffer[idx] = Complex::new(*x, 0.0);
        }
        self.fft.process(&mut self.x_t_buffer);
        let x_f = DVectorView::from_slice(&self.x_t_buffer, FFT_SIZE);

        for i in 0..FFT_SIZE {
            let power = x_f[i].norm_sqr();
            self.psd[i] =
                self.smoothing_factor * self.psd[i] + (1.0 - self.smoothing_factor) * power;
        }

        let mut y_f = self.weights.component_mul(&x_f);
        self.ifft.process(y_f.as_mut_slice());

        let fft_size_f32 = FFT_SIZE as f32;
        for (idx, c) in y_f.iter().enumerate() {
            self.y_t[idx] = c.re / fft_size_f32;
        }

        // Only the second half is free of circular wrap-around.
        let valid = self.y_t.rows(FRAME_SIZE, FRAME_SIZE);
        for (idx, ((mic, echo), out)) in mic_frame
            .iter()
            .zip(valid.iter())
            .zip(echo_estimate.iter_mut())
            .enumerate()
        {
            *out = *echo;
            error_signal[idx] = mic - echo;
        }

        // Zero-pad the error in front so the gradient lines up with the far-end window.
        self.e_t_buffer = [Complex::new(0.0, 0.0); FFT_SIZE];
        for (i, &sample) in error_signal.iter().enumerate() {
            self.e_t_buffer[i + FRAME_SIZE] = Complex::new(sample, 0.0);
        }
        self.fft.process(&mut self.e_t_buffer);
        let e_f = DVectorView::from_slice(&self.e_t_buffer, FFT_SIZE);

        let mut gradient = x_f.map(|c| c.conj()).component_mul(&e_f);
        for i in 0..FFT_SIZE {
            gradient[i] /= self.psd[i] + self.regularization;
        }
        self.weights += &gradient * Complex::new(self.mu, 0.0);
    }

    /// False once any weight has become NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.weights.iter().all(|w| w.re.is_finite() && w.im.is_finite())
    }

    /// Forgets the learned echo path.
    pub fn reset(&mut self) {
        self.weights.fill(Complex::new(0.0, 0.0));
        self.far_end_buffer.fill(0.0);
        self.psd.fill(1.0);
    }
}

/// Tuning of [`FdafEchoCanceller`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FdafConfig {
    /// NLMS step size of the linear filter.
    pub step_size: f32,
    /// Forgetting factor of the far-end power spectrum.
    pub smoothing_factor: f32,
    /// Regularisation added to the far-end power spectrum.
    pub regularization: f32,
}

impl Default for FdafConfig {
    fn default() -> Self {
        Self {
            step_size: 0.5,
            smoothing_factor: 0.9,
            regularization: 1e-2,
        }
    }
}

/// Reference echo canceller for 16 kHz, 64-sample blocks.
///
/// The render signal is aligned to the capture with a binary-spectrum delay
/// estimator, an [`AdaptiveFilter`] models the remaining echo path (linear
/// stage) and a [`ResidualEchoSuppressor`] attenuates what is left (nonlinear
/// stage). Disabling both stages makes the engine an exact pass-through.
pub struct FdafEchoCanceller {
    stages: StageConfig,
    filter: AdaptiveFilter<FFT_SIZE>,
    analyzer: SpectrumAnalyzer,
    delay_estimator: DelayEstimator,
    suppressor: ResidualEchoSuppressor,
    render_history: VecDeque<[f32; BLOCK_SIZE]>,
    previous_render: [f32; BLOCK_SIZE],
    previous_capture: [f32; BLOCK_SIZE],
    blocks_processed: u64,
}

impl FdafEchoCanceller {
    pub fn new(config: FdafConfig) -> Self {
        let mut planner = FftPlanner::new();
        debug!(?config, "creating echo canceller");
        Self {
            stages: StageConfig::default(),
            filter: AdaptiveFilter::new(
                &mut planner,
                config.step_size,
                config.smoothing_factor,
                config.regularization,
            ),
            analyzer: SpectrumAnalyzer::new(&mut planner),
            delay_estimator: DelayEstimator::new(),
            suppressor: ResidualEchoSuppressor::new(&mut planner),
            render_history: VecDeque::with_capacity(MAX_DELAY),
            previous_render: [0.0; BLOCK_SIZE],
            previous_capture: [0.0; BLOCK_SIZE],
            blocks_processed: 0,
        }
    }

    pub fn stages(&self) -> StageConfig {
        self.stages
    }

    pub fn blocks_processed(&self) -> u64 {
        self.blocks_processed
    }

    fn aligned_render(&self, delay: usize) -> [f32; BLOCK_SIZE] {
        self.render_history
            .get(delay)
            .copied()
            .unwrap_or([0.0; BLOCK_SIZE])
    }
}

impl Default for FdafEchoCanceller {
    fn default() -> Self {
        Self::new(FdafConfig::default())
    }
}

impl EchoCanceller for FdafEchoCanceller {
    fn set_stage_enabled(&mut self, stage: Stage, enabled: bool) -> Result<(), EngineError> {
        if self.blocks_processed > 0 {
            return Err(EngineError::ConfigurationLocked);
        }
        match stage {
            Stage::Linear => self.stages.linear = enabled,
            Stage::Nonlinear => self.stages.nonlinear = enabled,
        }
        debug!(?stage, enabled, "stage configured");
        Ok(())
    }

    fn process_block(&mut self, render: &Block, capture: &Block) -> Result<Block, EngineError> {
        let block = self.blocks_processed;
        self.blocks_processed += 1;

        let render = to_float(render);
        let capture = to_float(capture);

        let render_spectrum = self.analyzer.magnitude(&self.previous_render, &render);
        let capture_spectrum = self.analyzer.magnitude(&self.previous_capture, &capture);
        self.previous_render = render;
        self.previous_capture = capture;

        self.delay_estimator.add_far_spectrum(&render_spectrum);
        let delay = self
            .delay_estimator
            .process_near_spectrum(&capture_spectrum)
            .unwrap_or(0);

        if self.render_history.len() == MAX_DELAY {
            self.render_history.pop_back();
        }
        self.render_history.push_front(render);
        let aligned = self.aligned_render(delay);

        let mut echo = [0.0; BLOCK_SIZE];
        let mut error = [0.0; BLOCK_SIZE];
        self.filter.process(&mut echo, &mut error, &aligned, &capture);

        if !self.filter.is_finite() || error.iter().any(|e| !e.is_finite()) {
            warn!(block, "adaptive filter diverged, resetting");
            self.filter.reset();
            self.suppressor.reset();
            return Err(EngineError::Diverged { block });
        }

        let linear_out = if self.stages.linear { error } else { capture };
        if !self.stages.nonlinear {
            return Ok(to_pcm(&linear_out));
        }

        let mut output = [0.0; BLOCK_SIZE];
        self.suppressor
            .process(&mut output, &linear_out, &echo, &capture);
        Ok(to_pcm(&output))
    }

    fn estimated_delay_blocks(&self) -> Option<usize> {
        self.delay_estimator.delay()
    }
}

impl Drop for FdafEchoCanceller {
    fn drop(&mut self) {
        debug!(blocks = self.blocks_processed, "releasing echo canceller");
    }
}

fn to_float(block: &Block) -> [f32; BLOCK_SIZE] {
    let mut out = [0.0; BLOCK_SIZE];
    for (out, &sample) in out.iter_mut().zip(block.iter()) {
        *out = f32::from(sample) / SAMPLE_SCALE;
    }
    out
}

fn to_pcm(frame: &[f32; BLOCK_SIZE]) -> Block {
    let mut out = [0i16; BLOCK_SIZE];
    for (out, &sample) in out.iter_mut().zip(frame.iter()) {
        *out = (sample * SAMPLE_SCALE)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
    out
}
