pub mod assertions;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod fhir;
pub mod fixtures;
pub mod instance;
pub mod module;
pub mod prerequisite;
pub mod result;
pub mod runner;
pub mod suites;

pub use client::{FhirClient, LastResponse, Scope, SharedClient};
pub use config::loader::load_config;
pub use config::{AuthConfig, RunConfig};
pub use descriptor::{CaseDescriptor, ModuleDescriptor};
pub use discovery::{CodeFilter, Discovery, ModuleEntry, SuiteCatalog, SuiteSource, discover};
pub use error::{CaseError, CaseResult, ClientError, ConfigError, EngineError, FixtureError, Result};
pub use executor::{ExecutionOptions, Executor, ModulePhase};
pub use fhir::{ResourceFormat, ResourceLocation, ResourceType};
pub use fixtures::{FixtureLoader, FixtureSource};
pub use instance::InstanceRegistry;
pub use module::{DiscoveryContext, ModuleContext, TestCase, TestModule};
pub use prerequisite::{PrerequisiteHandler, PrerequisiteSpec};
pub use result::{Outcome, ResultObserver, ResultSink, RunReport, RunSummary, TestResult};
pub use runner::ConformanceRunner;
pub use suites::BuiltinSuites;
