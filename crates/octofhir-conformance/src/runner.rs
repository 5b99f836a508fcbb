//! One conformance run, from configuration to report.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;

use crate::client::FhirClient;
use crate::config::RunConfig;
use crate::discovery::{CodeFilter, Discovery, SuiteSource, discover};
use crate::error::Result;
use crate::executor::{ExecutionOptions, Executor};
use crate::fixtures::FixtureLoader;
use crate::module::DiscoveryContext;
use crate::result::{ResultSink, RunReport};
use crate::suites::BuiltinSuites;

pub struct ConformanceRunner {
    config: RunConfig,
    sources: Vec<Box<dyn SuiteSource>>,
}

impl ConformanceRunner {
    /// Runner over the built-in suites.
    pub fn new(config: RunConfig) -> Self {
        Self::empty(config).with_source(BuiltinSuites)
    }

    /// Runner without any suite source.
    pub fn empty(config: RunConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl SuiteSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn discovery_context(&self) -> DiscoveryContext {
        DiscoveryContext {
            resource_types: self.config.resource_types(),
        }
    }

    pub fn filter(&self) -> CodeFilter {
        CodeFilter::new(&self.config.run.filter)
    }

    pub fn discover(&self) -> Result<Discovery> {
        let sources: Vec<&dyn SuiteSource> = self.sources.iter().map(|s| s.as_ref()).collect();
        discover(&sources, &self.discovery_context(), &self.filter())
    }

    /// Validate the configuration, discover, execute and build the report.
    ///
    /// The report is also written to `report.path` when one is configured.
    pub async fn run(&self, sink: ResultSink) -> Result<RunReport> {
        self.config.validate()?;
        let started_at = OffsetDateTime::now_utc();
        let discovery = self.discover()?;

        let client = FhirClient::from_config(&self.config)?.shared();
        let loader = Arc::new(FixtureLoader::from_config(&self.config.fixtures));
        info!(
            server = client.base_url(),
            modules = discovery.modules().len(),
            cases = discovery.case_count(),
            "Starting conformance run"
        );

        let mut executor = Executor::new(client.clone(), loader)
            .with_sink(sink)
            .with_options(ExecutionOptions {
                emit_suppressed: self.config.run.emit_suppressed,
            });
        executor.run(&discovery).await?;

        let results = executor.into_sink().into_results();
        let report = RunReport::new(client.base_url(), started_at, results);
        info!(
            success = report.summary.totals.success,
            fail = report.summary.totals.fail,
            skipped = report.summary.totals.skipped,
            "Conformance run finished"
        );

        if let Some(path) = &self.config.report.path {
            report.write_json(path)?;
            info!(path = %path.display(), "Report written");
        }
        Ok(report)
    }
}

impl std::fmt::Debug for ConformanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConformanceRunner")
            .field("config", &self.config)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
