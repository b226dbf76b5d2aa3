use std::io::{self, Write};
use std::process::ExitCode;

use aec_comparator::{run_files, Args, FdafEchoCanceller, LineReporter, RunConfig};
use clap::Parser;
use tracing::info;

fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();

    let config = RunConfig::from(Args::parse());
    info!(
        render = %config.render.display(),
        capture = %config.capture.display(),
        output = %config.output.display(),
        linear = config.stages.linear,
        nonlinear = config.stages.nonlinear,
        "running comparator"
    );

    let stdout = io::stdout();
    let mut reporter = LineReporter::new(stdout.lock());
    let result = run_files(&config, FdafEchoCanceller::default(), &mut reporter)
        .and_then(|summary| {
            reporter
                .write_summary(&summary)
                .map_err(aec_comparator::Error::Report)?;
            Ok(summary)
        });

    match result {
        Ok(summary) => {
            info!(%summary, output = %config.output.display(), "done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            let _ = reporter.into_inner().flush();
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
