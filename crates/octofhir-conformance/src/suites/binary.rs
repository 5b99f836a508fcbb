use std::sync::Arc;

use tracing::warn;

use crate::assertions::{ensure, expect_header, expect_resource_type, expect_status, last_response, resource_id};
use crate::descriptor::ModuleDescriptor;
use crate::error::{CaseError, CaseResult};
use crate::fhir::{ResourceLocation, ResourceType};
use crate::fixtures::synthesize;
use crate::module::{ModuleContext, TestCase, TestModule};
use crate::prerequisite::PrerequisiteSpec;

#[derive(Default)]
pub struct BinarySuite {
    ctx: ModuleContext,
}

impl BinarySuite {
    async fn create_reports_location(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let created = client.create(&synthesize(&ResourceType::Binary)).await?;
        let resp = last_response(&client)?;
        let id = resource_id(&created)?;
        let checked = expect_status(&resp, &[201]).and_then(|_| {
            let location = expect_header(&resp.location, "Location")?;
            let parsed = ResourceLocation::parse(location)
                .ok_or_else(|| CaseError::fail(format!("Location {location} is not a resource URL")))?;
            ensure(parsed.resource_type == "Binary" && parsed.id == id, || {
                format!("Location {location} does not point at Binary/{id}")
            })
        });
        if let Err(e) = client.delete("Binary", &id).await {
            warn!(id = %id, error = %e, "Failed to delete binary");
        }
        checked
    }

    async fn read_back(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let fixture = self
            .ctx
            .fixture("Binary")
            .ok_or_else(|| CaseError::fail("Binary prerequisite is missing"))?;
        let id = resource_id(&fixture)?;
        let read = client.read("Binary", &id).await?;
        expect_resource_type(&read, "Binary")?;
        for field in ["contentType", "data"] {
            ensure(read.get(field) == fixture.get(field), || {
                format!("Binary/{id} {field} differs from what was stored")
            })?;
        }
        Ok(())
    }
}

impl TestModule for BinarySuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("Binary")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn cases() -> Vec<TestCase<Self>> {
        vec![
            TestCase::new("BI01", "Create a Binary and get its Location", Self::create_reports_location),
            TestCase::new("BI02", "Read a Binary back as a resource", Self::read_back)
                .with_prerequisite(PrerequisiteSpec::synthesized(ResourceType::Binary)),
        ]
    }
}
