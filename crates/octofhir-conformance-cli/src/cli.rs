use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use octofhir_conformance::{ResourceFormat, RunConfig};

#[derive(Parser)]
#[command(name = "octofhir-conformance")]
#[command(about = "Run conformance test suites against a FHIR server")]
#[command(version)]
pub struct Cli {
    /// Test code prefixes to run, e.g. `RD` or `HI01,TA` (all when omitted)
    pub filter: Vec<String>,

    /// FHIR base URL of the server under test
    #[arg(short, long, env = "OCTOFHIR_CONFORMANCE_SERVER")]
    pub server: Option<String>,

    /// Config file (defaults to ./octofhir-conformance.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Initial preferred resource format
    #[arg(short, long)]
    pub format: Option<FormatArg>,

    /// Request timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Directory holding named JSON fixtures
    #[arg(long)]
    pub fixtures_dir: Option<PathBuf>,

    /// Zip archive holding named JSON fixtures
    #[arg(long)]
    pub fixtures_archive: Option<PathBuf>,

    /// Resource types for the AllResources suite (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub resource_types: Vec<String>,

    /// Write a JSON report to this path
    #[arg(short, long)]
    pub report: Option<PathBuf>,

    /// Report cases of modules whose initialization failed as skipped
    #[arg(long)]
    pub emit_suppressed: bool,

    /// List discovered test cases without running them
    #[arg(long)]
    pub list: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Json,
    Xml,
}

impl From<FormatArg> for ResourceFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => ResourceFormat::Json,
            FormatArg::Xml => ResourceFormat::Xml,
        }
    }
}

impl Cli {
    /// Layer command-line flags over the loaded configuration.
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(server) = &self.server {
            config.server.base_url = Some(server.clone());
        }
        if let Some(format) = self.format {
            config.server.format = format.into();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.server.timeout_ms = timeout_ms;
        }
        if let Some(dir) = &self.fixtures_dir {
            config.fixtures.dir = Some(dir.clone());
        }
        if let Some(archive) = &self.fixtures_archive {
            config.fixtures.archive = Some(archive.clone());
        }
        if !self.resource_types.is_empty() {
            config.run.resource_types = self.resource_types.clone();
        }
        if !self.filter.is_empty() {
            config.run.filter = self.filter.clone();
        }
        if self.emit_suppressed {
            config.run.emit_suppressed = true;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(report) = &self.report {
            config.report.path = Some(report.clone());
        }
    }
}
