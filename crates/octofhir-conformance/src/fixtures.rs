//! Fixture resources for prerequisites and suites.
//!
//! Named fixtures are JSON resources looked up in a directory first and then
//! in a zip archive. Type-driven fixtures are synthesized in memory.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::FixturesConfig;
use crate::error::FixtureError;
use crate::fhir::ResourceType;

/// Where a fixture resource comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureSource {
    /// A JSON file name, resolved against the fixture directory or archive.
    File(String),
    /// A minimal resource built for the given type.
    Synthesized(ResourceType),
}

#[derive(Debug, Clone, Default)]
pub struct FixtureLoader {
    dir: Option<PathBuf>,
    archive: Option<PathBuf>,
}

impl FixtureLoader {
    pub fn new(dir: Option<PathBuf>, archive: Option<PathBuf>) -> Self {
        Self { dir, archive }
    }

    pub fn from_config(config: &FixturesConfig) -> Self {
        Self::new(config.dir.clone(), config.archive.clone())
    }

    pub fn load(&self, source: &FixtureSource) -> Result<Value, FixtureError> {
        match source {
            FixtureSource::File(name) => self.load_file(name),
            FixtureSource::Synthesized(resource_type) => Ok(synthesize(resource_type)),
        }
    }

    /// Load a named JSON fixture, directory first, then archive.
    pub fn load_file(&self, name: &str) -> Result<Value, FixtureError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(name);
            if path.is_file() {
                debug!(path = %path.display(), "Loading fixture from directory");
                let content = fs::read_to_string(&path).map_err(|source| FixtureError::Io {
                    name: name.to_string(),
                    source,
                })?;
                return parse_fixture(name, &content);
            }
        }
        if let Some(archive) = &self.archive
            && let Some(content) = read_archive_entry(archive, name)?
        {
            debug!(archive = %archive.display(), name, "Loading fixture from archive");
            return parse_fixture(name, &content);
        }
        Err(FixtureError::NotFound(name.to_string()))
    }
}

fn read_archive_entry(archive: &Path, name: &str) -> Result<Option<String>, FixtureError> {
    let file = fs::File::open(archive).map_err(|source| FixtureError::Io {
        name: archive.display().to_string(),
        source,
    })?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|source| FixtureError::Io {
            name: name.to_string(),
            source,
        })?;
    Ok(Some(content))
}

fn parse_fixture(name: &str, content: &str) -> Result<Value, FixtureError> {
    let value: Value = serde_json::from_str(content).map_err(|source| FixtureError::Json {
        name: name.to_string(),
        source,
    })?;
    if value.get("resourceType").and_then(|v| v.as_str()).is_none() {
        return Err(FixtureError::InvalidResourceType(format!(
            "{name} has no resourceType"
        )));
    }
    Ok(value)
}

/// Build a minimal valid resource of the given type.
///
/// Each call carries a fresh identifier so repeated creates stay distinguishable.
pub fn synthesize(resource_type: &ResourceType) -> Value {
    let marker = uuid::Uuid::new_v4().to_string();
    match resource_type {
        ResourceType::Patient => json!({
            "resourceType": "Patient",
            "identifier": [{ "system": "urn:octofhir:conformance", "value": marker }],
            "active": true,
            "name": [{ "family": "Conformance", "given": ["Test"] }],
            "gender": "unknown",
            "birthDate": "1970-01-01"
        }),
        ResourceType::Practitioner => json!({
            "resourceType": "Practitioner",
            "identifier": [{ "system": "urn:octofhir:conformance", "value": marker }],
            "name": [{ "family": "Conformance", "prefix": ["Dr."] }]
        }),
        ResourceType::Organization => json!({
            "resourceType": "Organization",
            "identifier": [{ "system": "urn:octofhir:conformance", "value": marker }],
            "active": true,
            "name": "Conformance Test Organization"
        }),
        ResourceType::Observation => json!({
            "resourceType": "Observation",
            "identifier": [{ "system": "urn:octofhir:conformance", "value": marker }],
            "status": "final",
            "code": {
                "coding": [{ "system": "http://loinc.org", "code": "29463-7", "display": "Body weight" }]
            },
            "valueQuantity": {
                "value": 70,
                "unit": "kg",
                "system": "http://unitsofmeasure.org",
                "code": "kg"
            }
        }),
        ResourceType::Binary => json!({
            "resourceType": "Binary",
            "contentType": "text/plain",
            // "Hello, FHIR!"
            "data": "SGVsbG8sIEZISVIh"
        }),
        other => json!({
            "resourceType": other.as_str(),
            "text": {
                "status": "generated",
                "div": format!("<div xmlns=\"http://www.w3.org/1999/xhtml\">{other} {marker}</div>")
            }
        }),
    }
}
