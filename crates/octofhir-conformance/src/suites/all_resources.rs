use std::sync::Arc;

use tracing::warn;

use crate::assertions::{ensure, expect_resource_type, resource_id};
use crate::descriptor::{CaseDescriptor, ModuleDescriptor};
use crate::error::CaseResult;
use crate::fhir::ResourceType;
use crate::fixtures::synthesize;
use crate::module::{DiscoveryContext, ModuleContext, TestCase, TestModule};

/// One create-and-read case per configured resource type.
#[derive(Default)]
pub struct AllResourcesSuite {
    ctx: ModuleContext,
}

impl AllResourcesSuite {
    async fn create_and_read(self: Arc<Self>, resource_type: ResourceType) -> CaseResult {
        let client = self.ctx.client()?;
        let name = resource_type.as_str();
        let created = client.create(&synthesize(&resource_type)).await?;
        let id = resource_id(&created)?;

        let read = client.read(name, &id).await;
        if let Err(e) = client.delete(name, &id).await {
            warn!(resource_type = name, id = %id, error = %e, "Failed to delete created resource");
        }
        let read = read?;
        expect_resource_type(&read, name)?;
        let read_id = resource_id(&read)?;
        ensure(read_id == id, || format!("read returned {name}/{read_id}, expected {name}/{id}"))
    }
}

impl TestModule for AllResourcesSuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::dynamic("AllResources")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn generate(ctx: &DiscoveryContext) -> Box<dyn Iterator<Item = TestCase<Self>>> {
        let types = ctx.resource_types.clone();
        Box::new(types.into_iter().map(|resource_type| {
            let descriptor = CaseDescriptor::generic(
                "ADR{0}",
                "Create and read back a {0}",
                [resource_type.to_string()],
            );
            TestCase::from_descriptor(descriptor, move |suite: Arc<Self>| {
                suite.create_and_read(resource_type.clone())
            })
        }))
    }
}
