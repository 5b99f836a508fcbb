//! Small checks over client responses used by the suites.

use serde_json::Value;

use crate::client::{FhirClient, LastResponse};
use crate::error::{CaseError, CaseResult, ClientError};
use crate::fhir::ResourceFormat;

/// Fail with `message` unless `condition` holds.
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> CaseResult {
    if condition {
        Ok(())
    } else {
        Err(CaseError::fail(message()))
    }
}

/// Snapshot of the last response, failing if no request was made yet.
pub fn last_response(client: &FhirClient) -> Result<LastResponse, CaseError> {
    client
        .last_response()
        .ok_or_else(|| CaseError::fail("no response recorded"))
}

pub fn expect_status(resp: &LastResponse, expected: &[u16]) -> CaseResult {
    ensure(expected.contains(&resp.status), || {
        format!(
            "{} {} returned HTTP {}, expected one of {:?}",
            resp.method, resp.url, resp.status, expected
        )
    })
}

pub fn expect_content_type(resp: &LastResponse, format: ResourceFormat) -> CaseResult {
    match resp.content_type.as_deref() {
        Some(ct) if format.matches_content_type(ct) => Ok(()),
        Some(ct) => Err(CaseError::fail(format!(
            "Content-Type {ct} does not match requested format {format}"
        ))),
        None => Err(CaseError::fail("response has no Content-Type header")),
    }
}

pub fn expect_header<'a>(value: &'a Option<String>, header: &str) -> Result<&'a str, CaseError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CaseError::fail(format!("response has no {header} header")))
}

pub fn expect_resource_type(resource: &Value, expected: &str) -> CaseResult {
    let actual = resource.get("resourceType").and_then(|v| v.as_str());
    ensure(actual == Some(expected), || {
        format!("expected a {expected}, got {}", actual.unwrap_or("no resourceType"))
    })
}

/// The `id` of a resource, failing if it has none.
pub fn resource_id(resource: &Value) -> Result<String, CaseError> {
    resource
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CaseError::fail("resource has no id"))
}

/// `meta.versionId` of a resource, failing if it has none.
pub fn version_id(resource: &Value) -> Result<String, CaseError> {
    resource
        .get("meta")
        .and_then(|m| m.get("versionId"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CaseError::fail("resource has no meta.versionId"))
}

/// Expect the server to reject a request with one of `statuses`.
///
/// A rejection with a matching status is the success path; success or any
/// other error fails the case.
pub fn expect_rejection<T>(result: Result<T, ClientError>, statuses: &[u16]) -> Result<ClientError, CaseError> {
    match result {
        Ok(_) => Err(CaseError::fail(format!(
            "request succeeded, expected HTTP {statuses:?}"
        ))),
        Err(err) if err.status().is_some_and(|s| statuses.contains(&s)) => Ok(err),
        Err(err) => Err(CaseError::fail_with(
            format!("expected HTTP {statuses:?}, got: {err}"),
            err,
        )),
    }
}

/// OperationOutcome issues with severity `error` or `fatal`.
pub fn error_issues(outcome: &Value) -> Vec<&Value> {
    outcome
        .get("issue")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter(|i| {
            matches!(
                i.get("severity").and_then(|s| s.as_str()),
                Some("error" | "fatal")
            )
        })
        .collect()
}
