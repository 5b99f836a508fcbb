use std::sync::Arc;

use crate::assertions::{ensure, expect_content_type, expect_resource_type, expect_status, last_response};
use crate::descriptor::ModuleDescriptor;
use crate::error::CaseResult;
use crate::module::{ModuleContext, TestCase, TestModule};

/// Capability statement checks.
#[derive(Default)]
pub struct ConformanceSuite {
    ctx: ModuleContext,
}

impl ConformanceSuite {
    async fn capability_statement(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let statement = client.capabilities().await?;
        expect_status(&last_response(&client)?, &[200])?;
        expect_resource_type(&statement, "CapabilityStatement")
    }

    async fn fhir_version(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let statement = client.capabilities().await?;
        let version = statement.get("fhirVersion").and_then(|v| v.as_str());
        ensure(version.is_some_and(|v| !v.is_empty()), || {
            "CapabilityStatement has no fhirVersion".to_string()
        })
    }

    async fn rest_resources(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let statement = client.capabilities().await?;
        let declared = statement
            .get("rest")
            .and_then(|r| r.as_array())
            .into_iter()
            .flatten()
            .filter_map(|rest| rest.get("resource").and_then(|r| r.as_array()))
            .map(Vec::len)
            .sum::<usize>();
        ensure(declared > 0, || {
            "CapabilityStatement declares no REST resources".to_string()
        })
    }

    async fn requested_format(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        client.capabilities().await?;
        expect_content_type(&last_response(&client)?, client.format())
    }
}

impl TestModule for ConformanceSuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("Conformance")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn cases() -> Vec<TestCase<Self>> {
        vec![
            TestCase::new("C01", "Server returns a CapabilityStatement", Self::capability_statement),
            TestCase::new("C02", "CapabilityStatement declares its FHIR version", Self::fhir_version),
            TestCase::new("C03", "CapabilityStatement lists REST resources", Self::rest_resources),
            TestCase::new("C04", "CapabilityStatement is served in the requested format", Self::requested_format),
        ]
    }
}
