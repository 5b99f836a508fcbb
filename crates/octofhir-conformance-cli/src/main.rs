mod cli;
mod observability;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use octofhir_conformance::{ConformanceRunner, ResultSink, TestResult, load_config};

use cli::Cli;
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Failed to load .env: {e}");
    }

    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            print_error(&format!("{e:#}"));
            std::process::exit(1);
        }
    }
}

/// Returns whether every executed case passed.
async fn run() -> Result<bool> {
    let cli = Cli::parse();
    observability::init_tracing(cli.log_level.as_deref().unwrap_or("warn"));

    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    observability::apply_logging_level(&config.logging.level);

    let runner = ConformanceRunner::new(config);
    if cli.list {
        let discovery = runner.discover().context("Failed to discover test cases")?;
        output::print_listing(&discovery);
        return Ok(true);
    }

    let sink = ResultSink::with_observer(|result: &TestResult| output::print_result(result));
    let report = runner.run(sink).await.context("Conformance run failed")?;
    output::print_summary(&report);
    if let Some(path) = &runner.config().report.path {
        output::print_success(&format!("Report written to {}", path.display()));
    }
    Ok(!report.summary.has_failures())
}
