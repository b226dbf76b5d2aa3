//! Offline block-streaming comparator for acoustic echo cancellers.
//!
//! A loudspeaker (render) recording and a microphone (capture) recording,
//! both mono 16 kHz PCM16 WAV, are cut into 64-sample blocks and fed through
//! an [`EchoCanceller`] in time order. The processed capture is collected and
//! written back as WAV, and every block produces a line of [`BlockMetrics`].
//!
//! ```no_run
//! use aec_comparator::{run_files, FdafEchoCanceller, LineReporter, RunConfig, StageConfig};
//!
//! let config = RunConfig {
//!     render: "render.wav".into(),
//!     capture: "capture.wav".into(),
//!     output: "processed.wav".into(),
//!     stages: StageConfig::default(),
//! };
//! let summary = run_files(&config, FdafEchoCanceller::default(), LineReporter::new(std::io::stdout()))?;
//! println!("{summary}");
//! # Ok::<(), aec_comparator::Error>(())
//! ```

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod wav;

pub use config::{Args, RunConfig};
pub use driver::{common_block_count, Comparator, ProcessingOutcome, RunOutput};
pub use engine::{EchoCanceller, FdafConfig, FdafEchoCanceller, Stage, StageConfig};
pub use error::{EngineError, Error, Result, WavError};
pub use metrics::{BlockMetrics, BlockStatus, LineReporter, MetricsSink, RunSummary};
pub use wav::PcmSignal;

use std::path::Path;

/// Samples per block; the engine's frame size and the driver's step.
pub const BLOCK_SIZE: usize = 64;

/// The only sample rate the comparator accepts, in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// One block of samples.
pub type Block = [i16; BLOCK_SIZE];

/// Decodes both inputs, runs them through `engine` and writes the processed
/// capture to `config.output`.
///
/// `engine` is owned for the duration of the call and dropped on every path,
/// including decode failures. Nothing is written unless every block was
/// processed.
pub fn run_files<E, S>(config: &RunConfig, engine: E, sink: S) -> Result<RunSummary>
where
    E: EchoCanceller,
    S: MetricsSink,
{
    let render = decode_input(&config.render)?;
    let capture = decode_input(&config.capture)?;

    let comparator = Comparator::new(engine, &config.stages)?;
    let run = comparator.run(&render, &capture, sink)?;

    wav::encode(&config.output, &run.output)?;
    Ok(run.summary)
}

fn decode_input(path: &Path) -> Result<PcmSignal> {
    wav::decode(path).map_err(|source| Error::Decode {
        path: path.to_path_buf(),
        source,
    })
}
