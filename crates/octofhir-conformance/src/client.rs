//! FHIR REST client shared by every test case in a run.
//!
//! The client is interior-mutable: the preferred format and the snapshot of
//! the most recent response are shared by all modules. A format switch made
//! by one test case stays in effect for the cases that follow until it is
//! reset explicitly.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use tracing::debug;

use crate::config::{AuthConfig, RunConfig};
use crate::error::ClientError;
use crate::fhir::{ResourceFormat, ResourceLocation};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client handle shared across modules for the lifetime of a run.
pub type SharedClient = Arc<FhirClient>;

/// Scope of a history or operation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    System,
    Type(String),
    Instance { resource_type: String, id: String },
}

impl Scope {
    pub fn instance(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Scope::Instance {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    fn path(&self) -> String {
        match self {
            Scope::System => String::new(),
            Scope::Type(rt) => format!("{rt}/"),
            Scope::Instance { resource_type, id } => format!("{resource_type}/{id}/"),
        }
    }
}

impl From<&ResourceLocation> for Scope {
    fn from(loc: &ResourceLocation) -> Self {
        Scope::instance(loc.resource_type.clone(), loc.id.clone())
    }
}

/// Snapshot of the most recent HTTP interaction.
#[derive(Debug, Clone, Default)]
pub struct LastResponse {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub content_location: Option<String>,
    pub location: Option<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub body: String,
}

impl LastResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Last-Modified parsed as an HTTP date.
    pub fn last_modified_time(&self) -> Option<OffsetDateTime> {
        self.last_modified
            .as_deref()
            .and_then(|v| {
                // HTTP dates use the obsolete "GMT" zone name.
                let v = v.trim();
                let normalized = match v.strip_suffix("GMT") {
                    Some(head) => format!("{head}+0000"),
                    None => v.to_string(),
                };
                OffsetDateTime::parse(&normalized, &Rfc2822).ok()
            })
    }

    /// Location (or Content-Location) parsed into type/id/version.
    pub fn resource_location(&self) -> Option<ResourceLocation> {
        self.location
            .as_deref()
            .or(self.content_location.as_deref())
            .and_then(ResourceLocation::parse)
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<AuthConfig>,
    format: RwLock<ResourceFormat>,
    last: Mutex<Option<LastResponse>>,
}

impl FhirClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::build(base_url, None, ResourceFormat::default(), Duration::from_secs(30))
    }

    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let base_url = config
            .server
            .base_url
            .as_deref()
            .ok_or_else(|| ClientError::invalid_request("server.base_url is not set"))?;
        Self::build(
            base_url,
            config.server.auth.clone(),
            config.server.format,
            config.timeout(),
        )
    }

    fn build(
        base_url: &str,
        auth: Option<AuthConfig>,
        format: ResourceFormat,
        timeout: Duration,
    ) -> Result<Self> {
        url::Url::parse(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ClientError::Transport {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            format: RwLock::new(format),
            last: Mutex::new(None),
        })
    }

    pub fn shared(self) -> SharedClient {
        Arc::new(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn format(&self) -> ResourceFormat {
        *self.format.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the preferred format for every subsequent request of the run.
    pub fn set_format(&self, format: ResourceFormat) {
        *self.format.write().unwrap_or_else(|e| e.into_inner()) = format;
    }

    pub fn last_response(&self) -> Option<LastResponse> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        match &self.auth {
            Some(AuthConfig::Basic { username, password }) => {
                req = req.basic_auth(username, Some(password));
            }
            Some(AuthConfig::Bearer { token }) => {
                req = req.bearer_auth(token);
            }
            None => {}
        }
        req.header(ACCEPT, self.format().mime_type())
    }

    async fn send(&self, method: Method, url: String, req: reqwest::RequestBuilder) -> Result<LastResponse> {
        debug!(%method, %url, "Sending FHIR request");
        let resp = req.send().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;
        let snapshot = LastResponse {
            method: method.to_string(),
            url,
            status,
            content_type: LastResponse::header(&headers, "content-type"),
            content_location: LastResponse::header(&headers, "content-location"),
            location: LastResponse::header(&headers, "location"),
            last_modified: LastResponse::header(&headers, "last-modified"),
            etag: LastResponse::header(&headers, "etag"),
            body,
        };
        debug!(status, "Received FHIR response");
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = self.url(path);
        let mut req = self.request(method.clone(), &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req
                .header(CONTENT_TYPE, ResourceFormat::Json.mime_type())
                .body(serde_json::to_vec(body)?);
        }
        let resp = self.send(method, url, req).await?;
        handle_response(&resp)
    }

    /// Send a request without status handling. Used to inspect headers and
    /// content negotiation where non-2xx answers are part of the check.
    pub async fn raw(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<String>,
    ) -> Result<LastResponse> {
        let url = self.url(path);
        let mut req = self.request(method.clone(), &url);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        self.send(method, url, req).await
    }

    pub async fn capabilities(&self) -> Result<Value> {
        self.execute(Method::GET, "metadata", &[], None).await
    }

    /// POST the resource to its type endpoint.
    ///
    /// Servers that answer without a body get the created id filled in
    /// from the Location header.
    pub async fn create(&self, resource: &Value) -> Result<Value> {
        let resource_type = resource_type_of(resource)?;
        let created = self.execute(Method::POST, resource_type, &[], Some(resource)).await?;
        if !created.is_null() {
            return Ok(created);
        }
        let location = self
            .last_response()
            .and_then(|r| r.resource_location())
            .ok_or_else(|| ClientError::invalid_request("create returned neither body nor Location"))?;
        let mut echoed = resource.clone();
        echoed["id"] = json!(location.id);
        if let Some(version) = location.version {
            echoed["meta"]["versionId"] = json!(version);
        }
        Ok(echoed)
    }

    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Value> {
        self.execute(Method::GET, &format!("{resource_type}/{id}"), &[], None)
            .await
    }

    pub async fn vread(&self, resource_type: &str, id: &str, version: &str) -> Result<Value> {
        self.execute(
            Method::GET,
            &format!("{resource_type}/{id}/_history/{version}"),
            &[],
            None,
        )
        .await
    }

    /// PUT the resource to `{type}/{id}`; the resource must carry an id.
    pub async fn update(&self, resource: &Value) -> Result<Value> {
        let resource_type = resource_type_of(resource)?;
        let id = resource
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::invalid_request("update requires a resource id"))?;
        self.execute(Method::PUT, &format!("{resource_type}/{id}"), &[], Some(resource))
            .await
    }

    pub async fn delete(&self, resource_type: &str, id: &str) -> Result<()> {
        self.execute(Method::DELETE, &format!("{resource_type}/{id}"), &[], None)
            .await?;
        Ok(())
    }

    /// Delete by location; version parts are ignored.
    pub async fn delete_location(&self, location: &ResourceLocation) -> Result<()> {
        self.delete(&location.resource_type, &location.id).await
    }

    pub async fn search(&self, resource_type: &str, params: &[(String, String)]) -> Result<Value> {
        self.execute(Method::GET, resource_type, params, None).await
    }

    pub async fn history(&self, scope: &Scope, since: Option<OffsetDateTime>) -> Result<Value> {
        let mut params = Vec::new();
        if let Some(since) = since {
            let formatted = since
                .format(&Rfc3339)
                .map_err(|e| ClientError::invalid_request(format!("invalid _since: {e}")))?;
            params.push(("_since".to_string(), formatted));
        }
        let path = format!("{}_history", scope.path());
        self.execute(Method::GET, &path, &params, None).await
    }

    /// Invoke `$name` at the given scope. Without parameters the operation is
    /// invoked with GET, otherwise the Parameters resource is POSTed.
    pub async fn operation(&self, scope: &Scope, name: &str, parameters: Option<&Value>) -> Result<Value> {
        let path = format!("{}${}", scope.path(), name.trim_start_matches('$'));
        match parameters {
            Some(params) => self.execute(Method::POST, &path, &[], Some(params)).await,
            None => self.execute(Method::GET, &path, &[], None).await,
        }
    }

    /// Tags currently on a resource, via `$meta`.
    pub async fn tags(&self, location: &ResourceLocation) -> Result<Vec<Value>> {
        let params = self.operation(&Scope::from(location), "meta", None).await?;
        Ok(meta_tags(&params))
    }

    pub async fn add_tags(&self, location: &ResourceLocation, tags: &[Value]) -> Result<Vec<Value>> {
        let params = self
            .operation(&Scope::from(location), "meta-add", Some(&meta_parameters(tags)))
            .await?;
        Ok(meta_tags(&params))
    }

    pub async fn remove_tags(&self, location: &ResourceLocation, tags: &[Value]) -> Result<Vec<Value>> {
        let params = self
            .operation(&Scope::from(location), "meta-delete", Some(&meta_parameters(tags)))
            .await?;
        Ok(meta_tags(&params))
    }
}

impl std::fmt::Debug for FhirClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirClient")
            .field("base_url", &self.base_url)
            .field("format", &self.format())
            .finish_non_exhaustive()
    }
}

fn resource_type_of(resource: &Value) -> Result<&str> {
    resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClientError::invalid_request("resource has no resourceType"))
}

fn meta_parameters(tags: &[Value]) -> Value {
    json!({
        "resourceType": "Parameters",
        "parameter": [{ "name": "meta", "valueMeta": { "tag": tags } }]
    })
}

fn meta_tags(params: &Value) -> Vec<Value> {
    params
        .get("parameter")
        .and_then(|p| p.as_array())
        .into_iter()
        .flatten()
        .filter(|p| p.get("name").and_then(|n| n.as_str()) == Some("return"))
        .filter_map(|p| p.get("valueMeta"))
        .filter_map(|meta| meta.get("tag").and_then(|t| t.as_array()))
        .flatten()
        .cloned()
        .collect()
}

/// Turn a response into a JSON value or a status error.
///
/// XML bodies are not parsed; they come back as a JSON string so callers can
/// still inspect them.
fn handle_response(resp: &LastResponse) -> Result<Value> {
    if !resp.is_success() {
        let outcome = serde_json::from_str::<Value>(&resp.body)
            .ok()
            .filter(|json| json.get("resourceType").and_then(|v| v.as_str()) == Some("OperationOutcome"));
        let message = outcome
            .as_ref()
            .map(outcome_diagnostics)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                if resp.body.is_empty() {
                    "no response body".to_string()
                } else {
                    resp.body.chars().take(200).collect()
                }
            });
        return Err(ClientError::Status {
            status: resp.status,
            message,
            outcome,
        });
    }

    if resp.body.trim().is_empty() {
        return Ok(Value::Null);
    }

    let is_json = resp
        .content_type
        .as_deref()
        .is_none_or(|ct| ResourceFormat::Json.matches_content_type(ct))
        || resp.body.trim_start().starts_with('{');
    if is_json {
        Ok(serde_json::from_str(&resp.body)?)
    } else {
        Ok(Value::String(resp.body.clone()))
    }
}

/// Join the diagnostics (or details text) of every issue in an OperationOutcome.
pub fn outcome_diagnostics(outcome: &Value) -> String {
    outcome
        .get("issue")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|issue| {
            issue
                .get("diagnostics")
                .and_then(|d| d.as_str())
                .or_else(|| issue.get("details").and_then(|d| d.get("text")).and_then(|t| t.as_str()))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Entries of a Bundle, or an empty slice for anything else.
pub fn bundle_entries(bundle: &Value) -> &[Value] {
    bundle
        .get("entry")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
