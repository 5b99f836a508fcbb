use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FixtureError;

/// Wire format preferred by the client when talking to the server under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFormat {
    #[default]
    Json,
    Xml,
}

impl ResourceFormat {
    /// FHIR mime type used in Accept and Content-Type headers.
    pub fn mime_type(self) -> &'static str {
        match self {
            ResourceFormat::Json => "application/fhir+json",
            ResourceFormat::Xml => "application/fhir+xml",
        }
    }

    /// Value of the `_format` query parameter.
    pub fn format_param(self) -> &'static str {
        match self {
            ResourceFormat::Json => "json",
            ResourceFormat::Xml => "xml",
        }
    }

    /// Whether a Content-Type header value denotes this format.
    ///
    /// Accepts both the FHIR-specific and the generic mime types, with or
    /// without parameters such as `charset`.
    pub fn matches_content_type(self, content_type: &str) -> bool {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match self {
            ResourceFormat::Json => {
                matches!(mime.as_str(), "application/fhir+json" | "application/json" | "application/json+fhir")
            }
            ResourceFormat::Xml => {
                matches!(mime.as_str(), "application/fhir+xml" | "application/xml" | "application/xml+fhir" | "text/xml")
            }
        }
    }
}

impl fmt::Display for ResourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.format_param())
    }
}

impl FromStr for ResourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "application/fhir+json" => Ok(ResourceFormat::Json),
            "xml" | "application/fhir+xml" => Ok(ResourceFormat::Xml),
            other => Err(format!("Unknown resource format: {other}")),
        }
    }
}

/// FHIR resource types the suites know how to synthesize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Practitioner,
    Organization,
    Observation,
    Binary,
    Bundle,
    CapabilityStatement,
    OperationOutcome,
    Parameters,
    #[serde(untagged)]
    Custom(String),
}

impl ResourceType {
    /// Types exercised by the all-resources suite when none are configured.
    pub fn defaults() -> Vec<ResourceType> {
        vec![
            ResourceType::Patient,
            ResourceType::Practitioner,
            ResourceType::Organization,
            ResourceType::Observation,
        ]
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Practitioner => "Practitioner",
            ResourceType::Organization => "Organization",
            ResourceType::Observation => "Observation",
            ResourceType::Binary => "Binary",
            ResourceType::Bundle => "Bundle",
            ResourceType::CapabilityStatement => "CapabilityStatement",
            ResourceType::OperationOutcome => "OperationOutcome",
            ResourceType::Parameters => "Parameters",
            ResourceType::Custom(name) => name,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Patient" => Ok(ResourceType::Patient),
            "Practitioner" => Ok(ResourceType::Practitioner),
            "Organization" => Ok(ResourceType::Organization),
            "Observation" => Ok(ResourceType::Observation),
            "Binary" => Ok(ResourceType::Binary),
            "Bundle" => Ok(ResourceType::Bundle),
            "CapabilityStatement" => Ok(ResourceType::CapabilityStatement),
            "OperationOutcome" => Ok(ResourceType::OperationOutcome),
            "Parameters" => Ok(ResourceType::Parameters),
            name if is_valid_resource_type_name(name) => Ok(ResourceType::Custom(name.to_string())),
            name => Err(FixtureError::InvalidResourceType(name.to_string())),
        }
    }
}

/// FHIR resource type names start with an uppercase letter and contain only letters.
pub fn is_valid_resource_type_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && name.chars().all(|c| c.is_ascii_alphabetic())
}

/// Parsed form of a resource location such as `Patient/123/_history/2`.
///
/// Absolute URLs are accepted; everything before the resource type is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocation {
    pub resource_type: String,
    pub id: String,
    pub version: Option<String>,
}

impl ResourceLocation {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    pub fn parse(location: &str) -> Option<Self> {
        let path = location.split(['?', '#']).next().unwrap_or("");
        let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();

        // Walk from the end so base URLs with their own path segments are skipped.
        let (type_idx, version) = match segments.as_slice() {
            [.., _, _, "_history", version] => (segments.len() - 4, Some(version.to_string())),
            [.., _, _] => (segments.len() - 2, None),
            _ => return None,
        };
        let resource_type = segments[type_idx];
        let id = segments[type_idx + 1];
        if !is_valid_resource_type_name(resource_type) || id.is_empty() {
            return None;
        }
        Some(Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version,
        })
    }

    /// Location of the resource from a response body (`resourceType`, `id`, `meta.versionId`).
    pub fn from_resource(resource: &serde_json::Value) -> Option<Self> {
        let resource_type = resource.get("resourceType")?.as_str()?;
        let id = resource.get("id")?.as_str()?;
        let version = resource
            .get("meta")
            .and_then(|m| m.get("versionId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Some(Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version,
        })
    }

    /// Relative path without the version part.
    pub fn path(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}/{}/_history/{}", self.resource_type, self.id, v),
            None => write!(f, "{}/{}", self.resource_type, self.id),
        }
    }
}
