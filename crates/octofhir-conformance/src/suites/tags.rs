use std::sync::Arc;

use serde_json::{Value, json};
use tracing::warn;

use crate::assertions::{ensure, resource_id};
use crate::descriptor::ModuleDescriptor;
use crate::error::{CaseError, CaseResult};
use crate::fhir::{ResourceLocation, ResourceType};
use crate::fixtures::synthesize;
use crate::module::{ModuleContext, TestCase, TestModule};
use crate::prerequisite::PrerequisiteSpec;

const TAG_SYSTEM: &str = "urn:octofhir:conformance:tags";

fn tag(code: &str) -> Value {
    json!({ "system": TAG_SYSTEM, "code": code })
}

fn has_tag(tags: &[Value], code: &str) -> bool {
    tags.iter().any(|t| {
        t.get("system").and_then(|v| v.as_str()) == Some(TAG_SYSTEM)
            && t.get("code").and_then(|v| v.as_str()) == Some(code)
    })
}

fn resource_tags(resource: &Value) -> Vec<Value> {
    resource
        .get("meta")
        .and_then(|m| m.get("tag"))
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Tag operations through `meta.tag` and the `$meta` family.
#[derive(Default)]
pub struct TagsSuite {
    ctx: ModuleContext,
}

impl TagsSuite {
    fn fixture_location(&self) -> Result<ResourceLocation, CaseError> {
        let patient = self
            .ctx
            .fixture("Patient")
            .ok_or_else(|| CaseError::fail("Patient prerequisite is missing"))?;
        Ok(ResourceLocation::new("Patient", resource_id(&patient)?))
    }

    async fn create_tagged(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let mut patient = synthesize(&ResourceType::Patient);
        patient["meta"] = json!({ "tag": [tag("created")] });

        let created = client.create(&patient).await?;
        let id = resource_id(&created)?;
        let read = client.read("Patient", &id).await;
        if let Err(e) = client.delete("Patient", &id).await {
            warn!(id = %id, error = %e, "Failed to delete tagged patient");
        }
        let read = read?;
        ensure(has_tag(&resource_tags(&read), "created"), || {
            format!("Patient/{id} lost the tag it was created with")
        })
    }

    async fn meta_add(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let location = self.fixture_location()?;
        let tags = client.add_tags(&location, &[tag("added")]).await?;
        ensure(has_tag(&tags, "added"), || {
            "$meta-add result does not contain the added tag".to_string()
        })
    }

    async fn meta_read(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let location = self.fixture_location()?;
        client.add_tags(&location, &[tag("listed")]).await?;
        let tags = client.tags(&location).await?;
        ensure(has_tag(&tags, "listed"), || {
            format!("$meta on {location} does not list the added tag")
        })
    }

    async fn meta_delete(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let location = self.fixture_location()?;
        client.add_tags(&location, &[tag("removed")]).await?;
        let tags = client.remove_tags(&location, &[tag("removed")]).await?;
        ensure(!has_tag(&tags, "removed"), || {
            "$meta-delete result still contains the removed tag".to_string()
        })
    }
}

impl TestModule for TagsSuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("Tags")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn cases() -> Vec<TestCase<Self>> {
        let patient = || PrerequisiteSpec::synthesized(ResourceType::Patient);
        vec![
            TestCase::new("TA01", "Create a resource carrying a tag", Self::create_tagged),
            TestCase::new("TA02", "$meta-add adds a tag", Self::meta_add).with_prerequisite(patient()),
            TestCase::new("TA03", "$meta lists tags of a resource", Self::meta_read).with_prerequisite(patient()),
            TestCase::new("TA04", "$meta-delete removes a tag", Self::meta_delete).with_prerequisite(patient()),
        ]
    }
}
