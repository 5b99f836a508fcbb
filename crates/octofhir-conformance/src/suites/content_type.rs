//! Content negotiation through the Accept header and `_format`.
//!
//! These cases change the client's preferred format. The change is visible
//! to every case that runs afterwards, so the last case puts JSON back.

use std::sync::Arc;

use reqwest::Method;

use crate::assertions::{expect_content_type, expect_status, last_response};
use crate::descriptor::ModuleDescriptor;
use crate::error::CaseResult;
use crate::fhir::ResourceFormat;
use crate::module::{ModuleContext, TestCase, TestModule};

#[derive(Default)]
pub struct ContentTypeSuite {
    ctx: ModuleContext,
}

impl ContentTypeSuite {
    async fn accept_json(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        client.set_format(ResourceFormat::Json);
        client.capabilities().await?;
        expect_content_type(&last_response(&client)?, ResourceFormat::Json)
    }

    async fn format_param_json(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let path = format!("metadata?_format={}", ResourceFormat::Json.format_param());
        let resp = client.raw(Method::GET, &path, &[], None).await?;
        expect_status(&resp, &[200])?;
        expect_content_type(&resp, ResourceFormat::Json)
    }

    async fn accept_xml(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        client.set_format(ResourceFormat::Xml);
        client.capabilities().await?;
        expect_content_type(&last_response(&client)?, ResourceFormat::Xml)
    }

    /// Runs with whatever format the previous cases left behind.
    async fn format_param_overrides_accept(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let requested = match client.format() {
            ResourceFormat::Json => ResourceFormat::Xml,
            ResourceFormat::Xml => ResourceFormat::Json,
        };
        let path = format!("metadata?_format={}", requested.format_param());
        let resp = client.raw(Method::GET, &path, &[], None).await?;
        expect_status(&resp, &[200])?;
        expect_content_type(&resp, requested)
    }

    async fn reset_json(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        client.set_format(ResourceFormat::Json);
        client.capabilities().await?;
        expect_content_type(&last_response(&client)?, ResourceFormat::Json)
    }
}

impl TestModule for ContentTypeSuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("ContentType")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn cases() -> Vec<TestCase<Self>> {
        vec![
            TestCase::new("CT01", "Accept: application/fhir+json yields JSON", Self::accept_json),
            TestCase::new("CT02", "_format=json yields JSON", Self::format_param_json),
            TestCase::new("CT03", "Accept: application/fhir+xml yields XML", Self::accept_xml),
            TestCase::new("CT04", "_format overrides the Accept header", Self::format_param_overrides_accept),
            TestCase::new("CT05", "Switching back to JSON", Self::reset_json),
        ]
    }
}
