//! Test module capability and case declarations.
//!
//! A module is a `Default`-constructible type holding state shared by its
//! cases. It declares its cases as data: a [`CaseDescriptor`] paired with a
//! procedure taking the module instance. The executor binds the shared client
//! into the module's [`ModuleContext`] before any case runs.
//!
//! ```ignore
//! #[derive(Default)]
//! struct ReadSuite {
//!     ctx: ModuleContext,
//! }
//!
//! impl TestModule for ReadSuite {
//!     fn descriptor() -> ModuleDescriptor {
//!         ModuleDescriptor::new("Read")
//!     }
//!
//!     fn context(&self) -> &ModuleContext {
//!         &self.ctx
//!     }
//!
//!     fn cases() -> Vec<TestCase<Self>> {
//!         vec![TestCase::new("RD01", "Read a created patient", Self::read_created)]
//!     }
//! }
//! ```

use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::client::SharedClient;
use crate::descriptor::{CaseDescriptor, ModuleDescriptor};
use crate::error::{CaseError, CaseResult};
use crate::fhir::ResourceType;
use crate::prerequisite::PrerequisiteSpec;

/// Procedure bound to a module instance.
pub type CaseFn<M> = Arc<dyn Fn(Arc<M>) -> BoxFuture<'static, CaseResult> + Send + Sync>;

/// Inputs available to generators of dynamic modules.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    /// Concrete resource types generic cases are instantiated over.
    pub resource_types: Vec<ResourceType>,
}

impl Default for DiscoveryContext {
    fn default() -> Self {
        Self {
            resource_types: ResourceType::defaults(),
        }
    }
}

/// A group of related test cases sharing one instance per run.
pub trait TestModule: Default + Send + Sync + 'static {
    fn descriptor() -> ModuleDescriptor;

    fn context(&self) -> &ModuleContext;

    /// Statically declared cases, in execution order.
    fn cases() -> Vec<TestCase<Self>> {
        Vec::new()
    }

    /// Case generator for dynamic modules. Consumed once during discovery.
    fn generate(_ctx: &DiscoveryContext) -> Box<dyn Iterator<Item = TestCase<Self>>> {
        Box::new(std::iter::empty())
    }

    /// One-time setup run before the first case. If it does not succeed,
    /// none of the module's cases run.
    fn initializer() -> Option<TestCase<Self>> {
        None
    }
}

/// One declared test case: descriptor, prerequisites and procedure.
pub struct TestCase<M> {
    pub descriptor: CaseDescriptor,
    pub prerequisites: Vec<PrerequisiteSpec>,
    run: CaseFn<M>,
}

impl<M: Send + Sync + 'static> TestCase<M> {
    pub fn new<F, Fut>(code: impl Into<String>, title: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CaseResult> + Send + 'static,
    {
        Self::from_descriptor(CaseDescriptor::new(code, title), f)
    }

    pub fn from_descriptor<F, Fut>(descriptor: CaseDescriptor, f: F) -> Self
    where
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CaseResult> + Send + 'static,
    {
        Self {
            descriptor,
            prerequisites: Vec::new(),
            run: Arc::new(move |module: Arc<M>| -> BoxFuture<'static, CaseResult> {
                Box::pin(f(module))
            }),
        }
    }

    pub fn with_prerequisite(mut self, spec: PrerequisiteSpec) -> Self {
        self.prerequisites.push(spec);
        self
    }

    pub(crate) fn procedure(&self) -> &CaseFn<M> {
        &self.run
    }
}

impl<M> std::fmt::Debug for TestCase<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("descriptor", &self.descriptor)
            .field("prerequisites", &self.prerequisites)
            .finish_non_exhaustive()
    }
}

/// Per-module binding to the run: shared client plus the fixtures created
/// for the case currently executing.
#[derive(Default)]
pub struct ModuleContext {
    client: RwLock<Option<SharedClient>>,
    fixtures: RwLock<Vec<Value>>,
}

impl ModuleContext {
    pub fn bind(&self, client: SharedClient) {
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);
    }

    pub fn is_bound(&self) -> bool {
        self.client.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// The shared client; fails the case if the module was never bound.
    pub fn client(&self) -> Result<SharedClient, CaseError> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CaseError::fail("module is not bound to a client"))
    }

    /// Fixtures created for the current case, in declaration order.
    pub fn fixtures(&self) -> Vec<Value> {
        self.fixtures.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// First fixture of the given resource type.
    pub fn fixture(&self, resource_type: &str) -> Option<Value> {
        self.fixtures
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.get("resourceType").and_then(|t| t.as_str()) == Some(resource_type))
            .cloned()
    }

    pub(crate) fn set_fixtures(&self, fixtures: Vec<Value>) {
        *self.fixtures.write().unwrap_or_else(|e| e.into_inner()) = fixtures;
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("bound", &self.is_bound())
            .finish_non_exhaustive()
    }
}
