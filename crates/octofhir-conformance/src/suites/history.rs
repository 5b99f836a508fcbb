use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::assertions::{ensure, expect_rejection, expect_resource_type, resource_id, version_id};
use crate::client::{FhirClient, Scope, bundle_entries};
use crate::descriptor::ModuleDescriptor;
use crate::error::{CaseError, CaseResult};
use crate::fhir::ResourceType;
use crate::fixtures::synthesize;
use crate::module::{ModuleContext, TestCase, TestModule};

/// Resource whose lifecycle the initializer walked through.
#[derive(Debug, Clone)]
struct Timeline {
    id: String,
    /// Version ids of the create and both updates, oldest first.
    versions: Vec<String>,
    started_at: OffsetDateTime,
}

/// History interactions at instance, type and system level.
#[derive(Default)]
pub struct HistorySuite {
    ctx: ModuleContext,
    timeline: Mutex<Option<Timeline>>,
}

impl HistorySuite {
    fn timeline(&self) -> Result<Timeline, CaseError> {
        self.timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CaseError::fail("history timeline was not recorded"))
    }

    /// Create a patient, update it twice and delete it.
    async fn initialize(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let started_at = OffsetDateTime::now_utc();

        let patient = client.create(&synthesize(&ResourceType::Patient)).await?;
        let id = resource_id(&patient)?;
        let versions = match record_versions(&client, patient).await {
            Ok(versions) => versions,
            Err(e) => {
                if let Err(cleanup) = client.delete("Patient", &id).await {
                    warn!(id = %id, error = %cleanup, "Failed to delete history patient");
                }
                return Err(e);
            }
        };
        client.delete("Patient", &id).await?;
        debug!(id = %id, versions = ?versions, "Recorded patient history");

        *self.timeline.lock().unwrap_or_else(|e| e.into_inner()) = Some(Timeline {
            id,
            versions,
            started_at,
        });
        Ok(())
    }

    async fn instance_history(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let timeline = self.timeline()?;
        let bundle = client
            .history(&Scope::instance("Patient", timeline.id.clone()), None)
            .await?;
        expect_resource_type(&bundle, "Bundle")?;
        let entries = bundle_entries(&bundle).len();
        ensure(entries >= timeline.versions.len(), || {
            format!(
                "instance history has {entries} entries, expected at least {}",
                timeline.versions.len()
            )
        })
    }

    async fn history_since(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let timeline = self.timeline()?;
        // Allow for clock skew between the harness and the server.
        let since = timeline.started_at - Duration::minutes(1);
        let bundle = client
            .history(&Scope::instance("Patient", timeline.id.clone()), Some(since))
            .await?;
        ensure(!bundle_entries(&bundle).is_empty(), || {
            "_since history returned no entries".to_string()
        })?;

        let future = OffsetDateTime::now_utc() + Duration::days(1);
        let bundle = client
            .history(&Scope::instance("Patient", timeline.id), Some(future))
            .await?;
        let entries = bundle_entries(&bundle).len();
        ensure(entries == 0, || {
            format!("_since in the future returned {entries} entries")
        })
    }

    async fn type_history(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let timeline = self.timeline()?;
        let bundle = client
            .history(&Scope::Type("Patient".into()), None)
            .await?;
        let found = bundle_entries(&bundle).iter().any(|entry| mentions(entry, &timeline.id));
        ensure(found, || {
            format!("type history does not contain Patient/{}", timeline.id)
        })
    }

    async fn system_history(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let bundle = client.history(&Scope::System, None).await?;
        expect_resource_type(&bundle, "Bundle")?;
        ensure(!bundle_entries(&bundle).is_empty(), || {
            "system history is empty".to_string()
        })
    }

    async fn vread_old_version(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let timeline = self.timeline()?;
        let first = timeline
            .versions
            .first()
            .ok_or_else(|| CaseError::fail("no versions recorded"))?;
        let resource = client.vread("Patient", &timeline.id, first).await?;
        let version = version_id(&resource)?;
        ensure(&version == first, || {
            format!("vread returned version {version}, expected {first}")
        })
    }

    async fn read_deleted(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let timeline = self.timeline()?;
        expect_rejection(client.read("Patient", &timeline.id).await, &[410])?;
        Ok(())
    }
}

/// Update the patient twice, returning every version id oldest first.
async fn record_versions(client: &FhirClient, mut patient: Value) -> Result<Vec<String>, CaseError> {
    let mut versions = vec![version_id(&patient)?];
    for family in ["History", "Historical"] {
        patient["name"] = json!([{ "family": family, "given": ["Test"] }]);
        patient = client.update(&patient).await?;
        versions.push(version_id(&patient)?);
    }
    Ok(versions)
}

/// Whether a history entry refers to the resource with `id`.
fn mentions(entry: &Value, id: &str) -> bool {
    let by_resource = entry
        .get("resource")
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        == Some(id);
    let by_url = entry
        .get("fullUrl")
        .or_else(|| entry.get("request").and_then(|r| r.get("url")))
        .and_then(|v| v.as_str())
        .is_some_and(|url| url.split('/').any(|segment| segment == id));
    by_resource || by_url
}

impl TestModule for HistorySuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("History")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn initializer() -> Option<TestCase<Self>> {
        Some(TestCase::new(
            "HI00",
            "Create, update twice and delete a patient",
            Self::initialize,
        ))
    }

    fn cases() -> Vec<TestCase<Self>> {
        vec![
            TestCase::new("HI01", "Instance history lists every version", Self::instance_history),
            TestCase::new("HI02", "Instance history honours _since", Self::history_since),
            TestCase::new("HI03", "Type history contains the resource", Self::type_history),
            TestCase::new("HI04", "System history is not empty", Self::system_history),
            TestCase::new("HI05", "Vread returns an earlier version", Self::vread_old_version),
            TestCase::new("HI06", "Read of a deleted resource returns 410", Self::read_deleted),
        ]
    }
}
