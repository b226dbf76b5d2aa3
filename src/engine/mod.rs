//! The contract between the block driver and an echo canceller, plus the
//! reference FDAF-based implementation.

pub mod delay;
pub mod fdaf;
pub mod suppressor;

pub use fdaf::{FdafConfig, FdafEchoCanceller};

use crate::error::EngineError;
use crate::Block;

/// A processing stage that can be switched off independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Subtraction of the adaptive filter's echo estimate.
    Linear,
    /// Spectral suppression of the residual echo.
    Nonlinear,
}

/// Which stages of the engine run. Both are enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageConfig {
    pub linear: bool,
    pub nonlinear: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            linear: true,
            nonlinear: true,
        }
    }
}

impl StageConfig {
    pub fn is_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Linear => self.linear,
            Stage::Nonlinear => self.nonlinear,
        }
    }

    /// Applies every stage setting to `engine`.
    pub fn apply<E: EchoCanceller + ?Sized>(&self, engine: &mut E) -> Result<(), EngineError> {
        engine.set_stage_enabled(Stage::Linear, self.linear)?;
        engine.set_stage_enabled(Stage::Nonlinear, self.nonlinear)
    }
}

/// A stateful block-based echo canceller.
///
/// Construction allocates all adaptive state and dropping the value releases
/// it, so an engine owned by a single run is released on every exit path.
///
/// The engine carries adaptive state across blocks: for a given instance,
/// [`process_block`](Self::process_block) must be called with blocks in
/// strictly increasing time order, each block exactly once.
pub trait EchoCanceller {
    /// Enables or disables a stage. Only valid before the first call to
    /// [`process_block`](Self::process_block).
    fn set_stage_enabled(&mut self, stage: Stage, enabled: bool) -> Result<(), EngineError>;

    /// Processes one render block and the time-aligned capture block,
    /// returning the echo-cancelled capture block.
    ///
    /// An `Err` means this block's output must not be used; the engine stays
    /// usable for the next block.
    fn process_block(&mut self, render: &Block, capture: &Block) -> Result<Block, EngineError>;

    /// The current render-to-capture delay estimate in blocks, `None` while the
    /// engine has no estimate. Valid before any block has been processed.
    fn estimated_delay_blocks(&self) -> Option<usize>;
}

impl<E: EchoCanceller + ?Sized> EchoCanceller for Box<E> {
    fn set_stage_enabled(&mut self, stage: Stage, enabled: bool) -> Result<(), EngineError> {
        (**self).set_stage_enabled(stage, enabled)
    }

    fn process_block(&mut self, render: &Block, capture: &Block) -> Result<Block, EngineError> {
        (**self).process_block(render, capture)
    }

    fn estimated_delay_blocks(&self) -> Option<usize> {
        (**self).estimated_delay_blocks()
    }
}
