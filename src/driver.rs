//! The block-streaming comparator loop.
//!
//! Two decoded signals are cut into time-aligned 64-sample blocks and pushed
//! through an [`EchoCanceller`] one block at a time. A block the engine fails
//! on is replaced by its capture block and the run carries on.

use tracing::{debug, info, warn};

use crate::engine::{EchoCanceller, StageConfig};
use crate::error::{Error, Result};
use crate::metrics::{BlockMetrics, BlockStatus, MetricsSink, RunSummary};
use crate::wav::PcmSignal;
use crate::{Block, BLOCK_SIZE};

/// What the driver did with one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The engine processed the block.
    Success(Block),
    /// The engine failed; the capture block passes through unchanged.
    Fallback(Block),
}

impl ProcessingOutcome {
    pub fn block(&self) -> &Block {
        match self {
            ProcessingOutcome::Success(block) | ProcessingOutcome::Fallback(block) => block,
        }
    }

    pub fn status(&self) -> BlockStatus {
        match self {
            ProcessingOutcome::Success(_) => BlockStatus::Ok,
            ProcessingOutcome::Fallback(_) => BlockStatus::Fallback,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub output: PcmSignal,
    pub metrics: Vec<BlockMetrics>,
    pub summary: RunSummary,
}

/// Number of whole blocks both signals cover.
pub fn common_block_count(render: &PcmSignal, capture: &PcmSignal) -> usize {
    render.len().min(capture.len()) / BLOCK_SIZE
}

/// Drives a single engine over a single pair of signals.
pub struct Comparator<E: EchoCanceller> {
    engine: E,
}

impl<E: EchoCanceller> Comparator<E> {
    /// Takes ownership of `engine` and applies the stage configuration before
    /// any block is processed.
    pub fn new(mut engine: E, stages: &StageConfig) -> Result<Self> {
        stages.apply(&mut engine)?;
        debug!(?stages, "comparator ready");
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Runs every common block through the engine in time order, emitting
    /// each block's metrics to `sink` as soon as the block is done.
    ///
    /// Consumes the comparator, so the engine is released when the run ends,
    /// whether it completes or fails.
    pub fn run<S: MetricsSink>(
        mut self,
        render: &PcmSignal,
        capture: &PcmSignal,
        mut sink: S,
    ) -> Result<RunOutput> {
        let block_count = common_block_count(render, capture);
        debug!(
            render_samples = render.len(),
            capture_samples = capture.len(),
            block_count,
            "starting run"
        );

        let mut output = PcmSignal::with_block_capacity(block_count);
        let mut metrics = Vec::with_capacity(block_count);
        let mut summary = RunSummary::default();

        for (index, (render_block, capture_block)) in
            render.blocks().zip(capture.blocks()).enumerate()
        {
            let outcome = self.process(index, render_block, capture_block);
            let block_metrics = BlockMetrics::new(
                index,
                capture_block,
                outcome.block(),
                self.engine.estimated_delay_blocks(),
                outcome.status(),
            );

            sink.emit(&block_metrics).map_err(Error::Report)?;
            summary.record(&block_metrics);
            metrics.push(block_metrics);
            output.push_block(outcome.block());
        }

        info!(
            blocks = summary.blocks,
            fallback_blocks = summary.fallback_blocks,
            energy_ratio = summary.energy_ratio(),
            "run complete"
        );
        Ok(RunOutput {
            output,
            metrics,
            summary,
        })
    }

    fn process(&mut self, index: usize, render: &Block, capture: &Block) -> ProcessingOutcome {
        match self.engine.process_block(render, capture) {
            Ok(block) => ProcessingOutcome::Success(block),
            Err(err) => {
                warn!(block = index, error = %err, "engine failed, passing capture through");
                ProcessingOutcome::Fallback(*capture)
            }
        }
    }
}
