//! Result model, sink and run report.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{CaseError, ClientError};

/// Category recorded for module initialization results.
pub const INITIALIZATION_CATEGORY: &str = "Initialization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Fail,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Fail => write!(f, "fail"),
            Outcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a case failed or was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    /// HTTP status when the failure came from the server under test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// OperationOutcome returned by the server, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Value>,
}

impl FailureDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            diagnostics: None,
        }
    }
}

/// Classify the value returned by a case procedure.
///
/// Wrapper layers are unwrapped first, so a failure surfaces with its
/// underlying cause.
pub fn classify(result: Result<(), CaseError>) -> (Outcome, Option<FailureDetail>) {
    let err = match result {
        Ok(()) => return (Outcome::Success, None),
        Err(err) => err.into_root(),
    };
    match err {
        CaseError::Skipped { reason } => (Outcome::Skipped, reason.map(FailureDetail::new)),
        CaseError::Client(client) => {
            let detail = FailureDetail {
                message: client.to_string(),
                status: client.status(),
                diagnostics: client.outcome().cloned(),
            };
            (Outcome::Fail, Some(detail))
        }
        CaseError::Assertion { message, cause } => {
            let client = cause.as_deref().and_then(|c| client_cause(c));
            let detail = FailureDetail {
                message,
                status: client.and_then(ClientError::status),
                diagnostics: client.and_then(|c| c.outcome().cloned()),
            };
            (Outcome::Fail, Some(detail))
        }
        CaseError::Other(err) => (Outcome::Fail, Some(FailureDetail::new(format!("{err:#}")))),
        other => (Outcome::Fail, Some(FailureDetail::new(other.to_string()))),
    }
}

/// First `ClientError` in an error's source chain.
fn client_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a ClientError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(client) = e.downcast_ref::<ClientError>() {
            return Some(client);
        }
        current = e.source();
    }
    None
}

/// Outcome of one case or initialization invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub category: String,
    pub code: String,
    pub title: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureDetail>,
}

impl TestResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

/// Receives each result as soon as it is recorded.
pub trait ResultObserver: Send {
    fn on_result(&mut self, result: &TestResult);
}

impl<F> ResultObserver for F
where
    F: FnMut(&TestResult) + Send,
{
    fn on_result(&mut self, result: &TestResult) {
        self(result)
    }
}

/// Append-only, ordered collection of results with optional live streaming.
#[derive(Default)]
pub struct ResultSink {
    results: Vec<TestResult>,
    observer: Option<Box<dyn ResultObserver>>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: impl ResultObserver + 'static) -> Self {
        Self {
            results: Vec::new(),
            observer: Some(Box::new(observer)),
        }
    }

    /// Record a result, forwarding it to the observer first.
    pub fn push(&mut self, result: TestResult) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_result(&result);
        }
        self.results.push(result);
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_results(&self.results)
    }

    pub fn into_results(self) -> Vec<TestResult> {
        self.results
    }
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("results", &self.results.len())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub fail: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Fail => self.fail += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.fail + self.skipped
    }
}

/// Outcome counts overall and per category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub totals: OutcomeCounts,
    pub categories: BTreeMap<String, OutcomeCounts>,
}

impl RunSummary {
    pub fn from_results(results: &[TestResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.totals.add(result.outcome);
            summary
                .categories
                .entry(result.category.clone())
                .or_default()
                .add(result.outcome);
        }
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.totals.fail > 0
    }
}

/// Everything a run produced, ready to be persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub server: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub summary: RunSummary,
    pub results: Vec<TestResult>,
}

impl RunReport {
    pub fn new(
        server: impl Into<String>,
        started_at: OffsetDateTime,
        results: Vec<TestResult>,
    ) -> Self {
        Self {
            server: server.into(),
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            summary: RunSummary::from_results(&results),
            results,
        }
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, content)
    }
}
