//! Fixture lifecycle around a single test case.
//!
//! Prerequisites are created on the server right before the case runs and
//! deleted after it completes. Deletion is best effort: failures are reported
//! back as [`CleanupOutcome`]s for logging and never reach the case outcome.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::SharedClient;
use crate::error::{CaseError, ClientError};
use crate::fhir::{ResourceLocation, ResourceType};
use crate::fixtures::{FixtureLoader, FixtureSource};

/// A fixture a test case needs on the server before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteSpec {
    pub source: FixtureSource,
}

impl PrerequisiteSpec {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            source: FixtureSource::File(name.into()),
        }
    }

    pub fn synthesized(resource_type: ResourceType) -> Self {
        Self {
            source: FixtureSource::Synthesized(resource_type),
        }
    }
}

/// Result of deleting one retained fixture.
#[derive(Debug)]
pub struct CleanupOutcome {
    pub location: ResourceLocation,
    pub error: Option<ClientError>,
}

pub struct PrerequisiteHandler {
    client: SharedClient,
    loader: Arc<FixtureLoader>,
    created: Vec<ResourceLocation>,
}

impl PrerequisiteHandler {
    pub fn new(client: SharedClient, loader: Arc<FixtureLoader>) -> Self {
        Self {
            client,
            loader,
            created: Vec::new(),
        }
    }

    /// Create each prerequisite in declaration order, one per poll.
    ///
    /// The stream is consumed once. Every resource created before a failure
    /// is still retained for [`PrerequisiteHandler::cleanup`].
    pub fn handle<'a>(
        &'a mut self,
        specs: &'a [PrerequisiteSpec],
    ) -> BoxStream<'a, Result<Value, CaseError>> {
        stream::unfold((self, specs.iter()), |(handler, mut specs)| async move {
            let spec = specs.next()?;
            let created = handler.create(spec).await;
            Some((created, (handler, specs)))
        })
        .boxed()
    }

    async fn create(&mut self, spec: &PrerequisiteSpec) -> Result<Value, CaseError> {
        let resource = self.loader.load(&spec.source)?;
        let created = self.client.create(&resource).await?;
        let reported = ResourceLocation::from_resource(&created)
            .or_else(|| self.client.last_response().and_then(|r| r.resource_location()));
        let location = match reported {
            Some(location) => location,
            None => self.locate_by_identifier(&resource).await.ok_or_else(|| {
                warn!("Created prerequisite could not be located; it will not be deleted");
                CaseError::fail("server did not report the id of a created prerequisite")
            })?,
        };
        debug!(location = %location, "Created prerequisite");
        self.created.push(location);
        Ok(created)
    }

    /// Search for a resource the server accepted without reporting its id,
    /// using the first identifier it was created with.
    async fn locate_by_identifier(&self, resource: &Value) -> Option<ResourceLocation> {
        let resource_type = resource.get("resourceType")?.as_str()?;
        let identifier = resource.get("identifier")?.get(0)?;
        let value = identifier.get("value")?.as_str()?;
        let token = match identifier.get("system").and_then(Value::as_str) {
            Some(system) => format!("{system}|{value}"),
            None => value.to_string(),
        };
        let bundle = match self
            .client
            .search(resource_type, &[("identifier".to_string(), token)])
            .await
        {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(resource_type, error = %e, "Identifier search for created prerequisite failed");
                return None;
            }
        };
        let matches: Vec<_> = bundle
            .get("entry")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(|entry| entry.get("resource"))
            .filter_map(ResourceLocation::from_resource)
            .collect();
        match matches.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }

    /// Locations created since the last cleanup.
    pub fn retained(&self) -> &[ResourceLocation] {
        &self.created
    }

    /// Delete every retained fixture, swallowing failures.
    pub async fn cleanup(&mut self) -> Vec<CleanupOutcome> {
        let mut outcomes = Vec::with_capacity(self.created.len());
        for location in self.created.drain(..) {
            let error = self.client.delete_location(&location).await.err();
            if let Some(e) = &error {
                warn!(location = %location, error = %e, "Failed to delete prerequisite");
            }
            outcomes.push(CleanupOutcome { location, error });
        }
        outcomes
    }
}

impl std::fmt::Debug for PrerequisiteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrerequisiteHandler")
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}
