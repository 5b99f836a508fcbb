//! Test discovery.
//!
//! Suite sources register module types into a [`SuiteCatalog`]. Discovery
//! loads every source, expands each registered module into its case list
//! (running generators for dynamic modules), applies the code filter and
//! returns the modules in registration order. That order is the execution
//! order.

use std::any::TypeId;
use std::collections::HashSet;
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::descriptor::{CaseDescriptor, ModuleDescriptor};
use crate::error::EngineError;
use crate::executor::{Executor, ModulePhase};
use crate::module::{DiscoveryContext, TestCase, TestModule};

/// Case-insensitive code prefix filter. An empty filter selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeFilter {
    prefixes: Vec<String>,
}

impl CodeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from prefixes; entries may themselves be comma-separated.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = prefixes
            .into_iter()
            .flat_map(|p| {
                p.as_ref()
                    .split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .collect();
        Self { prefixes }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn matches(&self, code: &str) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        let code = code.to_ascii_lowercase();
        self.prefixes.iter().any(|p| code.starts_with(p.as_str()))
    }
}

/// A discovered module, ready to be driven by the executor.
#[async_trait]
pub trait ModuleEntry: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    /// Selected cases in execution order.
    fn cases(&self) -> Vec<&CaseDescriptor>;

    fn has_initializer(&self) -> bool;

    async fn execute(&self, executor: &mut Executor) -> Result<ModulePhase, EngineError>;
}

/// Selected cases of one module type.
pub struct ModulePlan<M> {
    pub(crate) descriptor: ModuleDescriptor,
    pub(crate) initializer: Option<TestCase<M>>,
    pub(crate) cases: Vec<TestCase<M>>,
}

#[async_trait]
impl<M: TestModule> ModuleEntry for ModulePlan<M> {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn cases(&self) -> Vec<&CaseDescriptor> {
        self.cases.iter().map(|c| &c.descriptor).collect()
    }

    fn has_initializer(&self) -> bool {
        self.initializer.is_some()
    }

    async fn execute(&self, executor: &mut Executor) -> Result<ModulePhase, EngineError> {
        executor.run_module(self).await
    }
}

/// Type-erased registration of a module type.
trait ModuleFactory: Send + Sync {
    fn descriptor(&self) -> ModuleDescriptor;

    fn plan(&self, ctx: &DiscoveryContext, filter: &CodeFilter) -> Option<Box<dyn ModuleEntry>>;
}

struct Registration<M>(PhantomData<fn() -> M>);

impl<M: TestModule> ModuleFactory for Registration<M> {
    fn descriptor(&self) -> ModuleDescriptor {
        M::descriptor()
    }

    fn plan(&self, ctx: &DiscoveryContext, filter: &CodeFilter) -> Option<Box<dyn ModuleEntry>> {
        let descriptor = M::descriptor();
        let declared: Box<dyn Iterator<Item = TestCase<M>>> = if descriptor.is_dynamic {
            M::generate(ctx)
        } else {
            Box::new(M::cases().into_iter())
        };
        let cases: Vec<TestCase<M>> = declared
            .filter(|case| filter.matches(&case.descriptor.resolved_code()))
            .collect();
        if cases.is_empty() {
            debug!(module = %descriptor.name, "No cases selected, skipping module");
            return None;
        }
        Some(Box::new(ModulePlan {
            descriptor,
            initializer: M::initializer(),
            cases,
        }))
    }
}

/// Registered module types, in registration order.
#[derive(Default)]
pub struct SuiteCatalog {
    factories: Vec<Box<dyn ModuleFactory>>,
    seen: HashSet<TypeId>,
}

impl SuiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module type. Each type may be registered once.
    pub fn register<M: TestModule>(&mut self) -> Result<&mut Self, EngineError> {
        if !self.seen.insert(TypeId::of::<M>()) {
            return Err(EngineError::DuplicateModule(M::descriptor().name));
        }
        self.factories.push(Box::new(Registration::<M>(PhantomData)));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.factories.iter().map(|f| f.descriptor()).collect()
    }
}

/// A container of module registrations, such as the built-in suites.
pub trait SuiteSource: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, catalog: &mut SuiteCatalog) -> Result<(), EngineError>;
}

/// Ordered result of discovery.
#[derive(Default)]
pub struct Discovery {
    modules: Vec<Box<dyn ModuleEntry>>,
}

impl Discovery {
    pub fn modules(&self) -> &[Box<dyn ModuleEntry>] {
        &self.modules
    }

    /// `(module, cases)` pairs in execution order.
    pub fn listing(&self) -> Vec<(&ModuleDescriptor, Vec<&CaseDescriptor>)> {
        self.modules
            .iter()
            .map(|m| (m.descriptor(), m.cases()))
            .collect()
    }

    pub fn case_count(&self) -> usize {
        self.modules.iter().map(|m| m.cases().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|m| &m.descriptor().name))
            .finish()
    }
}

/// Discover modules from every source.
///
/// A source that fails to load aborts discovery; no partial list is returned.
pub fn discover(
    sources: &[&dyn SuiteSource],
    ctx: &DiscoveryContext,
    filter: &CodeFilter,
) -> Result<Discovery, EngineError> {
    let mut catalog = SuiteCatalog::new();
    for source in sources {
        source.load(&mut catalog).map_err(|e| match e {
            EngineError::Discovery { .. } => e,
            other => EngineError::discovery(source.name(), other.to_string()),
        })?;
        debug!(source = source.name(), modules = catalog.len(), "Loaded suite source");
    }

    let modules: Vec<Box<dyn ModuleEntry>> = catalog
        .factories
        .iter()
        .filter_map(|factory| factory.plan(ctx, filter))
        .collect();

    let discovery = Discovery { modules };
    info!(
        modules = discovery.modules.len(),
        cases = discovery.case_count(),
        "Discovery complete"
    );
    Ok(discovery)
}
