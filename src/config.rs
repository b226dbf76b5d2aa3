//! Command line surface and the run configuration derived from it.

use std::path::PathBuf;

use clap::Parser;

use crate::engine::StageConfig;

/// Output file written when `--output` is not given.
pub const DEFAULT_OUTPUT: &str = "processed.wav";

/// Feeds a render and a capture WAV through the echo canceller block by block,
/// prints per-block metrics and writes the processed capture.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the render (loudspeaker) signal, mono 16 kHz PCM16 WAV.
    #[clap(value_parser)]
    pub render: PathBuf,

    /// Path to the capture (microphone) signal, mono 16 kHz PCM16 WAV.
    #[clap(value_parser)]
    pub capture: PathBuf,

    /// Disable the linear echo subtraction stage.
    #[clap(long)]
    pub no_linear: bool,

    /// Disable the nonlinear residual echo suppression stage.
    #[clap(long)]
    pub no_nonlinear: bool,

    /// Where to write the processed signal.
    #[clap(long, short, value_parser, default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,
}

/// Everything a run needs, independent of how it was specified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub render: PathBuf,
    pub capture: PathBuf,
    pub output: PathBuf,
    pub stages: StageConfig,
}

impl From<Args> for RunConfig {
    fn from(args: Args) -> Self {
        Self {
            render: args.render,
            capture: args.capture,
            output: args.output,
            stages: StageConfig {
                linear: !args.no_linear,
                nonlinear: !args.no_nonlinear,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<RunConfig, clap::Error> {
        Args::try_parse_from(args).map(RunConfig::from)
    }

    #[test]
    fn both_stages_enabled_by_default() {
        let config = parse(&["aec-comparator", "render.wav", "capture.wav"]).unwrap();
        assert_eq!(config.render, PathBuf::from("render.wav"));
        assert_eq!(config.capture, PathBuf::from("capture.wav"));
        assert_eq!(config.output, PathBuf::from(DEFAULT_OUTPUT));
        assert_eq!(config.stages, StageConfig::default());
    }

    #[test]
    fn flags_disable_stages_independently() {
        let config = parse(&["aec-comparator", "r.wav", "c.wav", "--no-linear"]).unwrap();
        assert!(!config.stages.linear);
        assert!(config.stages.nonlinear);

        let config = parse(&["aec-comparator", "r.wav", "c.wav", "--no-nonlinear"]).unwrap();
        assert!(config.stages.linear);
        assert!(!config.stages.nonlinear);

        let config = parse(&[
            "aec-comparator",
            "--no-nonlinear",
            "r.wav",
            "--no-linear",
            "c.wav",
            "--output",
            "out.wav",
        ])
        .unwrap();
        assert_eq!(
            config.stages,
            StageConfig {
                linear: false,
                nonlinear: false
            }
        );
        assert_eq!(config.output, PathBuf::from("out.wav"));
    }

    #[test]
    fn fewer_than_two_paths_is_a_usage_error() {
        let err = parse(&["aec-comparator", "render.wav"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

        let err = parse(&["aec-comparator"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn args_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
