//! Sequential execution of discovered modules.
//!
//! Each module moves through
//! `NotStarted -> Initializing -> {InitFailed | Ready} -> Executing(i) -> Done`.
//! Cases run strictly one after another in discovery order. Every per-case
//! fault (failed check, server error, panic) is converted into a
//! [`TestResult`]; only run-level errors such as a broken instance registry
//! abort the run.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tracing::{debug, info, trace, warn};

use crate::client::SharedClient;
use crate::discovery::{Discovery, ModulePlan};
use crate::error::{CaseError, CaseResult, EngineError};
use crate::fixtures::FixtureLoader;
use crate::instance::InstanceRegistry;
use crate::module::{CaseFn, TestCase, TestModule};
use crate::prerequisite::PrerequisiteHandler;
use crate::result::{
    FailureDetail, INITIALIZATION_CATEGORY, Outcome, ResultSink, TestResult, classify,
};

/// Reason attached to cases suppressed by a failed initialization.
pub const SUPPRESSED_REASON: &str = "module initialization failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulePhase {
    NotStarted,
    Initializing,
    InitFailed,
    Ready,
    Executing(usize),
    Done,
}

impl fmt::Display for ModulePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModulePhase::NotStarted => write!(f, "not_started"),
            ModulePhase::Initializing => write!(f, "initializing"),
            ModulePhase::InitFailed => write!(f, "init_failed"),
            ModulePhase::Ready => write!(f, "ready"),
            ModulePhase::Executing(i) => write!(f, "executing({i})"),
            ModulePhase::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Emit a skipped result for every case of a module whose
    /// initialization failed, instead of omitting them.
    pub emit_suppressed: bool,
}

pub struct Executor {
    client: SharedClient,
    instances: InstanceRegistry,
    sink: ResultSink,
    prerequisites: PrerequisiteHandler,
    options: ExecutionOptions,
}

impl Executor {
    pub fn new(client: SharedClient, loader: Arc<FixtureLoader>) -> Self {
        Self {
            prerequisites: PrerequisiteHandler::new(client.clone(), loader),
            client,
            instances: InstanceRegistry::new(),
            sink: ResultSink::new(),
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_sink(mut self, sink: ResultSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    pub fn results(&self) -> &[TestResult] {
        self.sink.results()
    }

    pub fn instances(&mut self) -> &mut InstanceRegistry {
        &mut self.instances
    }

    /// Forget module state so the next run starts from fresh instances.
    pub fn clear_instances(&mut self) {
        self.instances.clear();
    }

    pub fn into_sink(self) -> ResultSink {
        self.sink
    }

    /// Run every discovered module in order.
    pub async fn run(&mut self, discovery: &Discovery) -> Result<(), EngineError> {
        for module in discovery.modules() {
            module.execute(self).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_module<M: TestModule>(
        &mut self,
        plan: &ModulePlan<M>,
    ) -> Result<ModulePhase, EngineError> {
        let name = plan.descriptor.name.as_str();
        let mut phase = ModulePhase::NotStarted;
        info!(module = name, cases = plan.cases.len(), "Running module");

        advance(name, &mut phase, ModulePhase::Initializing);
        let instance = self.instances.get_or_create::<M>()?;
        instance.context().bind(self.client.clone());

        if let Some(init) = &plan.initializer {
            let result = self
                .execute_case(&instance, init, INITIALIZATION_CATEGORY)
                .await;
            if result.outcome != Outcome::Success {
                warn!(
                    module = name,
                    code = %result.code,
                    error = result.message().unwrap_or(""),
                    "Module initialization failed, skipping its cases"
                );
                self.sink.push(result);
                if self.options.emit_suppressed {
                    for case in &plan.cases {
                        self.sink.push(TestResult {
                            category: name.to_string(),
                            code: case.descriptor.resolved_code(),
                            title: case.descriptor.resolved_title(),
                            outcome: Outcome::Skipped,
                            error: Some(FailureDetail::new(SUPPRESSED_REASON)),
                        });
                    }
                }
                advance(name, &mut phase, ModulePhase::InitFailed);
                return Ok(phase);
            }
        }
        advance(name, &mut phase, ModulePhase::Ready);

        for (index, case) in plan.cases.iter().enumerate() {
            advance(name, &mut phase, ModulePhase::Executing(index));
            let result = self.execute_case(&instance, case, name).await;
            self.sink.push(result);
        }

        advance(name, &mut phase, ModulePhase::Done);
        info!(module = name, "Module finished");
        Ok(phase)
    }

    /// Create prerequisites, invoke the case, release prerequisites and
    /// classify the outcome.
    async fn execute_case<M: TestModule>(
        &mut self,
        instance: &Arc<M>,
        case: &TestCase<M>,
        category: &str,
    ) -> TestResult {
        let code = case.descriptor.resolved_code();
        debug!(category, code = %code, "Running test case");

        let mut fixtures = Vec::new();
        let mut prerequisite_error = None;
        {
            let mut created = self.prerequisites.handle(&case.prerequisites);
            while let Some(item) = created.next().await {
                match item {
                    Ok(resource) => fixtures.push(resource),
                    Err(e) => {
                        prerequisite_error = Some(e);
                        break;
                    }
                }
            }
        }

        let result = match prerequisite_error {
            Some(e) => {
                warn!(code = %code, error = %e, "Prerequisite could not be created");
                Err(e)
            }
            None => {
                instance.context().set_fixtures(fixtures);
                let result = invoke(case.procedure(), instance.clone()).await;
                instance.context().set_fixtures(Vec::new());
                result
            }
        };

        if !self.prerequisites.retained().is_empty() {
            let failed = self
                .prerequisites
                .cleanup()
                .await
                .iter()
                .filter(|c| c.error.is_some())
                .count();
            if failed > 0 {
                debug!(code = %code, failed, "Prerequisite cleanup incomplete");
            }
        }

        let (outcome, error) = classify(result);
        debug!(code = %code, %outcome, "Test case finished");
        TestResult {
            category: category.to_string(),
            code,
            title: case.descriptor.resolved_title(),
            outcome,
            error,
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("client", &self.client)
            .field("instances", &self.instances)
            .field("sink", &self.sink)
            .field("options", &self.options)
            .finish()
    }
}

fn advance(module: &str, phase: &mut ModulePhase, next: ModulePhase) {
    trace!(module, from = %phase, to = %next, "Module phase change");
    *phase = next;
}

/// Call the procedure, converting panics (while building or polling the
/// future) into failures carrying the panic payload.
async fn invoke<M>(procedure: &CaseFn<M>, instance: Arc<M>) -> CaseResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| procedure(instance))) {
        Ok(future) => future,
        Err(panic) => return Err(CaseError::Panicked(panic_message(panic))),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(CaseError::Panicked(panic_message(panic))),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{CaseDescriptor, ModuleDescriptor};
    use crate::discovery::{CodeFilter, SuiteCatalog, SuiteSource, discover};
    use crate::client::FhirClient;
    use crate::module::{DiscoveryContext, ModuleContext};
    use std::sync::Mutex;

    fn executor() -> Executor {
        let client = FhirClient::new("http://127.0.0.1:9/fhir").unwrap().shared();
        Executor::new(client, Arc::new(FixtureLoader::default()))
    }

    /// Records the order cases ran in and shares state between them.
    #[derive(Default)]
    struct Journal {
        ctx: ModuleContext,
        visited: Mutex<Vec<String>>,
        remembered: Mutex<Option<String>>,
    }

    impl Journal {
        fn visit(&self, code: &str) {
            self.visited.lock().unwrap().push(code.to_string());
        }

        async fn remember(self: Arc<Self>) -> CaseResult {
            self.visit("RD01");
            *self.remembered.lock().unwrap() = Some("Patient/42".into());
            Ok(())
        }

        async fn fail_check(self: Arc<Self>) -> CaseResult {
            self.visit("RD02");
            Err(CaseError::fail("status was 500, expected 200"))
        }

        async fn recall(self: Arc<Self>) -> CaseResult {
            self.visit("RD03");
            match self.remembered.lock().unwrap().as_deref() {
                Some("Patient/42") => Ok(()),
                other => Err(CaseError::fail(format!("remembered {other:?}"))),
            }
        }

        async fn skip(self: Arc<Self>) -> CaseResult {
            self.visit("RD04");
            Err(CaseError::skip("no data"))
        }

        async fn explode(self: Arc<Self>) -> CaseResult {
            self.visit("RD05");
            panic!("index out of range");
        }

        async fn after_panic(self: Arc<Self>) -> CaseResult {
            self.visit("RD06");
            if self.ctx.is_bound() {
                Ok(())
            } else {
                Err(CaseError::fail("client not bound"))
            }
        }
    }

    impl TestModule for Journal {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new("Read")
        }

        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        fn cases() -> Vec<TestCase<Self>> {
            vec![
                TestCase::new("RD01", "remember", Self::remember),
                TestCase::new("RD02", "fail", Self::fail_check),
                TestCase::new("RD03", "recall", Self::recall),
                TestCase::new("RD04", "skip", Self::skip),
                TestCase::new("RD05", "panic", Self::explode),
                TestCase::new("RD06", "after panic", Self::after_panic),
            ]
        }
    }

    #[derive(Default)]
    struct BrokenSetup {
        ctx: ModuleContext,
    }

    impl TestModule for BrokenSetup {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new("History")
        }

        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        fn initializer() -> Option<TestCase<Self>> {
            Some(TestCase::new("HI00", "setup", |_m: Arc<Self>| async {
                Err(CaseError::fail("server unreachable"))
            }))
        }

        fn cases() -> Vec<TestCase<Self>> {
            vec![
                TestCase::new("HI01", "one", |_m: Arc<Self>| async { Ok(()) }),
                TestCase::new("HI02", "two", |_m: Arc<Self>| async { Ok(()) }),
            ]
        }
    }

    #[derive(Default)]
    struct GoodSetup {
        ctx: ModuleContext,
        ready: Mutex<bool>,
    }

    impl TestModule for GoodSetup {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new("Tags")
        }

        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        fn initializer() -> Option<TestCase<Self>> {
            Some(TestCase::new("TA00", "setup", |m: Arc<Self>| async move {
                *m.ready.lock().unwrap() = true;
                Ok(())
            }))
        }

        fn cases() -> Vec<TestCase<Self>> {
            vec![TestCase::new("TA01", "uses setup", |m: Arc<Self>| async move {
                if *m.ready.lock().unwrap() {
                    Ok(())
                } else {
                    Err(CaseError::fail("initializer did not run"))
                }
            })]
        }
    }

    #[derive(Default)]
    struct Generic {
        ctx: ModuleContext,
    }

    impl TestModule for Generic {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::dynamic("AllResources")
        }

        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        fn generate(ctx: &DiscoveryContext) -> Box<dyn Iterator<Item = TestCase<Self>>> {
            let types = ctx.resource_types.clone();
            Box::new(types.into_iter().map(|rt| {
                TestCase::from_descriptor(
                    CaseDescriptor::generic("ADR{0}", "Create and read a {0}", [rt.to_string()]),
                    |_m: Arc<Self>| async { Ok(()) },
                )
            }))
        }
    }

    struct Source<F>(F);

    impl<F> SuiteSource for Source<F>
    where
        F: Fn(&mut SuiteCatalog) -> Result<(), EngineError> + Send + Sync,
    {
        fn name(&self) -> &str {
            "test"
        }

        fn load(&self, catalog: &mut SuiteCatalog) -> Result<(), EngineError> {
            (self.0)(catalog)
        }
    }

    async fn run_with<F>(register: F, options: ExecutionOptions) -> (Executor, usize)
    where
        F: Fn(&mut SuiteCatalog) -> Result<(), EngineError> + Send + Sync,
    {
        let discovery = discover(&[&Source(register)], &DiscoveryContext::default(), &CodeFilter::all()).unwrap();
        let mut executor = executor().with_options(options);
        executor.run(&discovery).await.unwrap();
        (executor, discovery.case_count())
    }

    fn outcomes(executor: &Executor) -> Vec<(String, Outcome)> {
        executor
            .results()
            .iter()
            .map(|r| (r.code.clone(), r.outcome))
            .collect()
    }

    #[tokio::test]
    async fn test_cases_isolated_and_ordered() {
        let (executor, selected) = run_with(
            |c| c.register::<Journal>().map(|_| ()),
            ExecutionOptions::default(),
        )
        .await;

        assert_eq!(executor.results().len(), selected);
        assert_eq!(
            outcomes(&executor),
            vec![
                ("RD01".to_string(), Outcome::Success),
                ("RD02".to_string(), Outcome::Fail),
                ("RD03".to_string(), Outcome::Success),
                ("RD04".to_string(), Outcome::Skipped),
                ("RD05".to_string(), Outcome::Fail),
                ("RD06".to_string(), Outcome::Success),
            ]
        );
        assert!(executor.results().iter().all(|r| r.category == "Read"));
    }

    #[tokio::test]
    async fn test_failure_details() {
        let (executor, _) = run_with(
            |c| c.register::<Journal>().map(|_| ()),
            ExecutionOptions::default(),
        )
        .await;
        let results = executor.results();
        assert_eq!(results[1].message(), Some("status was 500, expected 200"));
        assert_eq!(results[3].message(), Some("no data"));
        assert_eq!(results[4].message(), Some("index out of range"));
    }

    #[tokio::test]
    async fn test_instance_reused_across_cases_and_runs() {
        let discovery = discover(
            &[&Source(|c: &mut SuiteCatalog| c.register::<Journal>().map(|_| ()))],
            &DiscoveryContext::default(),
            &CodeFilter::new(["RD01", "RD03"]),
        )
        .unwrap();
        let mut executor = executor();
        executor.run(&discovery).await.unwrap();
        let journal = executor.instances().get_or_create::<Journal>().unwrap();
        assert_eq!(*journal.visited.lock().unwrap(), vec!["RD01", "RD03"]);

        executor.run(&discovery).await.unwrap();
        assert_eq!(journal.visited.lock().unwrap().len(), 4);

        executor.clear_instances();
        let fresh = executor.instances().get_or_create::<Journal>().unwrap();
        assert!(fresh.visited.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_failure_short_circuits_module() {
        let (executor, _) = run_with(
            |c| {
                c.register::<BrokenSetup>()?.register::<GoodSetup>()?;
                Ok(())
            },
            ExecutionOptions::default(),
        )
        .await;
        let results = executor.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].category, INITIALIZATION_CATEGORY);
        assert_eq!(results[0].code, "HI00");
        assert_eq!(results[0].outcome, Outcome::Fail);
        assert_eq!(results[0].message(), Some("server unreachable"));
        // Later modules still run, and a successful initializer emits nothing.
        assert_eq!(results[1].code, "TA01");
        assert_eq!(results[1].outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_init_failure_can_emit_suppressed_cases() {
        let (executor, _) = run_with(
            |c| c.register::<BrokenSetup>().map(|_| ()),
            ExecutionOptions {
                emit_suppressed: true,
            },
        )
        .await;
        let results = executor.results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].code, "HI01");
        assert_eq!(results[1].category, "History");
        assert_eq!(results[1].outcome, Outcome::Skipped);
        assert_eq!(results[1].message(), Some(SUPPRESSED_REASON));
    }

    #[tokio::test]
    async fn test_generic_cases_report_substituted_codes() {
        let (executor, _) = run_with(
            |c| c.register::<Generic>().map(|_| ()),
            ExecutionOptions::default(),
        )
        .await;
        let first = &executor.results()[0];
        assert_eq!(first.code, "ADRPatient");
        assert_eq!(first.title, "Create and read a Patient");
        assert_eq!(first.category, "AllResources");
    }

    #[tokio::test]
    async fn test_module_phases() {
        let discovery = discover(
            &[&Source(|c: &mut SuiteCatalog| -> Result<(), EngineError> {
                c.register::<BrokenSetup>()?.register::<GoodSetup>()?;
                Ok(())
            })],
            &DiscoveryContext::default(),
            &CodeFilter::all(),
        )
        .unwrap();
        let mut executor = executor();
        let phases = {
            let mut phases = Vec::new();
            for module in discovery.modules() {
                phases.push(module.execute(&mut executor).await.unwrap());
            }
            phases
        };
        assert_eq!(phases, vec![ModulePhase::InitFailed, ModulePhase::Done]);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42_u8)), "Unknown panic");
    }
}
