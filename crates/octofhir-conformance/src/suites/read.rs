use std::sync::Arc;

use uuid::Uuid;

use crate::assertions::{
    ensure, expect_header, expect_rejection, expect_status, last_response, resource_id, version_id,
};
use crate::descriptor::ModuleDescriptor;
use crate::error::{CaseError, CaseResult};
use crate::fhir::ResourceType;
use crate::module::{ModuleContext, TestCase, TestModule};
use crate::prerequisite::PrerequisiteSpec;

/// Read and vread interactions.
#[derive(Default)]
pub struct ReadSuite {
    ctx: ModuleContext,
}

impl ReadSuite {
    fn patient(&self) -> Result<serde_json::Value, CaseError> {
        self.ctx
            .fixture("Patient")
            .ok_or_else(|| CaseError::fail("Patient prerequisite is missing"))
    }

    async fn read_created(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let id = resource_id(&self.patient()?)?;
        let read = client.read("Patient", &id).await?;
        expect_status(&last_response(&client)?, &[200])?;
        let read_id = resource_id(&read)?;
        ensure(read_id == id, || format!("read returned Patient/{read_id}, expected Patient/{id}"))
    }

    async fn read_missing(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let id = Uuid::new_v4().to_string();
        expect_rejection(client.read("Patient", &id).await, &[404, 410])?;
        Ok(())
    }

    async fn vread_created(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let patient = self.patient()?;
        let id = resource_id(&patient)?;
        let version = match version_id(&patient) {
            Ok(version) => version,
            Err(_) => version_id(&client.read("Patient", &id).await?)
                .map_err(|_| CaseError::skip("server does not report meta.versionId"))?,
        };
        let read = client.vread("Patient", &id, &version).await?;
        expect_status(&last_response(&client)?, &[200])?;
        let read_version = version_id(&read)?;
        ensure(read_version == version, || {
            format!("vread returned version {read_version}, expected {version}")
        })
    }

    async fn read_etag(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let id = resource_id(&self.patient()?)?;
        client.read("Patient", &id).await?;
        let resp = last_response(&client)?;
        let etag = expect_header(&resp.etag, "ETag")?;
        ensure(etag.starts_with("W/\""), || format!("ETag {etag} is not a weak validator"))
    }
}

impl TestModule for ReadSuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("Read")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn cases() -> Vec<TestCase<Self>> {
        vec![
            TestCase::new("RD01", "Read a created patient", Self::read_created)
                .with_prerequisite(PrerequisiteSpec::synthesized(ResourceType::Patient)),
            TestCase::new("RD02", "Read of an unknown id is rejected", Self::read_missing),
            TestCase::new("RD03", "Vread returns the requested version", Self::vread_created)
                .with_prerequisite(PrerequisiteSpec::synthesized(ResourceType::Patient)),
            TestCase::new("RD04", "Read response carries a weak ETag", Self::read_etag)
                .with_prerequisite(PrerequisiteSpec::synthesized(ResourceType::Patient)),
        ]
    }
}
