//! Built-in conformance suites.
//!
//! Modules run in the order they are registered here.

mod all_resources;
mod binary;
mod conformance;
mod content_type;
mod history;
mod read;
mod tags;
mod validation;

pub use all_resources::AllResourcesSuite;
pub use binary::BinarySuite;
pub use conformance::ConformanceSuite;
pub use content_type::ContentTypeSuite;
pub use history::HistorySuite;
pub use read::ReadSuite;
pub use tags::TagsSuite;
pub use validation::ValidationSuite;

use crate::discovery::{SuiteCatalog, SuiteSource};
use crate::error::EngineError;

/// Source registering every built-in module.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSuites;

impl SuiteSource for BuiltinSuites {
    fn name(&self) -> &str {
        "builtin"
    }

    fn load(&self, catalog: &mut SuiteCatalog) -> Result<(), EngineError> {
        catalog
            .register::<ConformanceSuite>()?
            .register::<ReadSuite>()?
            .register::<HistorySuite>()?
            .register::<TagsSuite>()?
            .register::<ContentTypeSuite>()?
            .register::<BinarySuite>()?
            .register::<ValidationSuite>()?
            .register::<AllResourcesSuite>()?;
        Ok(())
    }
}
