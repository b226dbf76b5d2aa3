//! Per-block evaluation metrics and their streaming report.

use std::fmt;
use std::io::{self, Write};

use crate::{Block, BLOCK_SIZE, SAMPLE_RATE};

/// Duration of one block in milliseconds (4 ms for 64 samples at 16 kHz).
pub const BLOCK_DURATION_MS: f64 = 1000.0 * BLOCK_SIZE as f64 / SAMPLE_RATE as f64;

/// Printed in place of a delay the engine has not estimated yet.
pub const UNKNOWN_DELAY: i64 = -1;

/// Whether the engine's output was used for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    Fallback,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStatus::Ok => f.write_str("ok"),
            BlockStatus::Fallback => f.write_str("fallback"),
        }
    }
}

/// Metrics of one processed block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMetrics {
    pub index: usize,
    /// Sum of squared capture samples.
    pub captured_energy: u64,
    /// Sum of squared samples of the block that went to the output.
    pub output_energy: u64,
    pub delay_blocks: Option<usize>,
    pub status: BlockStatus,
}

impl BlockMetrics {
    pub fn new(
        index: usize,
        capture: &Block,
        output: &Block,
        delay_blocks: Option<usize>,
        status: BlockStatus,
    ) -> Self {
        Self {
            index,
            captured_energy: energy(capture),
            output_energy: energy(output),
            delay_blocks,
            status,
        }
    }

    /// `output / captured`, zero for a silent capture block.
    pub fn energy_ratio(&self) -> f64 {
        if self.captured_energy == 0 {
            0.0
        } else {
            self.output_energy as f64 / self.captured_energy as f64
        }
    }

    pub fn delay_ms(&self) -> Option<f64> {
        self.delay_blocks.map(delay_blocks_to_ms)
    }
}

impl fmt::Display for BlockMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block={} y2={} e2={} e2_over_y2={:.6} ",
            self.index,
            self.captured_energy,
            self.output_energy,
            self.energy_ratio()
        )?;
        match (self.delay_blocks, self.delay_ms()) {
            (Some(blocks), Some(ms)) => write!(f, "est_delay_blocks={blocks} est_delay_ms={ms}")?,
            _ => write!(
                f,
                "est_delay_blocks={UNKNOWN_DELAY} est_delay_ms={UNKNOWN_DELAY}"
            )?,
        }
        write!(f, " status={}", self.status)
    }
}

pub fn delay_blocks_to_ms(blocks: usize) -> f64 {
    blocks as f64 * BLOCK_DURATION_MS
}

/// Sum of squared samples.
pub fn energy(block: &[i16]) -> u64 {
    block
        .iter()
        .map(|&s| {
            let s = i64::from(s);
            (s * s) as u64
        })
        .sum()
}

/// Receives each block's metrics as soon as the block has been processed.
pub trait MetricsSink {
    fn emit(&mut self, metrics: &BlockMetrics) -> io::Result<()>;
}

impl MetricsSink for Vec<BlockMetrics> {
    fn emit(&mut self, metrics: &BlockMetrics) -> io::Result<()> {
        self.push(*metrics);
        Ok(())
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn emit(&mut self, metrics: &BlockMetrics) -> io::Result<()> {
        (**self).emit(metrics)
    }
}

/// Writes one report line per block.
pub struct LineReporter<W: Write> {
    writer: W,
}

impl<W: Write> LineReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        writeln!(self.writer, "{summary}")?;
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MetricsSink for LineReporter<W> {
    fn emit(&mut self, metrics: &BlockMetrics) -> io::Result<()> {
        writeln!(self.writer, "{metrics}")
    }
}

/// Totals over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    pub blocks: usize,
    pub fallback_blocks: usize,
    pub captured_energy: u64,
    pub output_energy: u64,
    pub final_delay_blocks: Option<usize>,
}

impl RunSummary {
    pub fn record(&mut self, metrics: &BlockMetrics) {
        self.blocks += 1;
        if metrics.status == BlockStatus::Fallback {
            self.fallback_blocks += 1;
        }
        self.captured_energy += metrics.captured_energy;
        self.output_energy += metrics.output_energy;
        self.final_delay_blocks = metrics.delay_blocks;
    }

    pub fn energy_ratio(&self) -> f64 {
        if self.captured_energy == 0 {
            0.0
        } else {
            self.output_energy as f64 / self.captured_energy as f64
        }
    }

    /// Echo return loss enhancement over the run, in dB.
    pub fn erle_db(&self) -> Option<f64> {
        if self.captured_energy == 0 || self.output_energy == 0 {
            return None;
        }
        Some(10.0 * (self.captured_energy as f64 / self.output_energy as f64).log10())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "summary blocks={} fallback_blocks={} y2={} e2={} e2_over_y2={:.6}",
            self.blocks,
            self.fallback_blocks,
            self.captured_energy,
            self.output_energy,
            self.energy_ratio()
        )?;
        match self.erle_db() {
            Some(erle) => write!(f, " erle_db={erle:.2}")?,
            None => write!(f, " erle_db=n/a")?,
        }
        match self.final_delay_blocks {
            Some(blocks) => write!(f, " est_delay_blocks={blocks}"),
            None => write!(f, " est_delay_blocks={UNKNOWN_DELAY}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_capture_has_zero_ratio() {
        let metrics = BlockMetrics::new(0, &[0; 64], &[1000; 64], None, BlockStatus::Ok);
        assert_eq!(metrics.captured_energy, 0);
        assert!(metrics.output_energy > 0);
        assert_eq!(metrics.energy_ratio(), 0.0);
    }

    #[test]
    fn ratio_of_halved_block_is_a_quarter() {
        let metrics = BlockMetrics::new(3, &[200; 64], &[100; 64], Some(2), BlockStatus::Ok);
        assert_eq!(metrics.captured_energy, 64 * 40_000);
        assert_eq!(metrics.output_energy, 64 * 10_000);
        assert_eq!(metrics.energy_ratio(), 0.25);
    }

    #[test]
    fn energy_of_full_scale_block_does_not_overflow() {
        assert_eq!(energy(&[i16::MIN; 64]), 64 * 32768 * 32768);
    }

    #[test]
    fn delay_converts_at_four_ms_per_block() {
        assert_eq!(BLOCK_DURATION_MS, 4.0);
        for blocks in [0usize, 1, 7, 100] {
            assert_eq!(delay_blocks_to_ms(blocks), blocks as f64 * 4.0);
        }
        let metrics = BlockMetrics::new(0, &[1; 64], &[1; 64], Some(12), BlockStatus::Ok);
        assert_eq!(metrics.delay_ms(), Some(48.0));
    }

    #[test]
    fn unknown_delay_is_reported_as_marker() {
        let metrics = BlockMetrics::new(5, &[2; 64], &[2; 64], None, BlockStatus::Fallback);
        assert_eq!(metrics.delay_ms(), None);
        assert_eq!(
            metrics.to_string(),
            "block=5 y2=256 e2=256 e2_over_y2=1.000000 est_delay_blocks=-1 est_delay_ms=-1 status=fallback"
        );
    }

    #[test]
    fn report_line_with_known_delay() {
        let metrics = BlockMetrics::new(9, &[2; 64], &[1; 64], Some(3), BlockStatus::Ok);
        assert_eq!(
            metrics.to_string(),
            "block=9 y2=256 e2=64 e2_over_y2=0.250000 est_delay_blocks=3 est_delay_ms=12 status=ok"
        );
    }

    #[test]
    fn line_reporter_writes_one_line_per_block() {
        let mut reporter = LineReporter::new(Vec::new());
        for index in 0..3 {
            let metrics = BlockMetrics::new(index, &[1; 64], &[1; 64], None, BlockStatus::Ok);
            reporter.emit(&metrics).unwrap();
        }
        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("block=0 "));
        assert!(lines[2].starts_with("block=2 "));
    }

    #[test]
    fn summary_accumulates_blocks() {
        let mut summary = RunSummary::default();
        summary.record(&BlockMetrics::new(0, &[10; 64], &[1; 64], None, BlockStatus::Ok));
        summary.record(&BlockMetrics::new(1, &[10; 64], &[10; 64], Some(4), BlockStatus::Fallback));

        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.fallback_blocks, 1);
        assert_eq!(summary.captured_energy, 2 * 64 * 100);
        assert_eq!(summary.output_energy, 64 * 101);
        assert_eq!(summary.final_delay_blocks, Some(4));
        let erle = summary.erle_db().unwrap();
        assert!((erle - 10.0 * (200.0f64 / 101.0).log10()).abs() < 1e-9);
    }

    #[test]
    fn summary_without_output_energy_has_no_erle() {
        let mut summary = RunSummary::default();
        summary.record(&BlockMetrics::new(0, &[10; 64], &[0; 64], None, BlockStatus::Ok));
        assert_eq!(summary.erle_db(), None);
        assert!(summary.to_string().contains("erle_db=n/a"));
    }
}
