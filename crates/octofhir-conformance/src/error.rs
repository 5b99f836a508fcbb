use serde_json::Value;
use thiserror::Error;

/// Errors reported by the FHIR wire client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// OperationOutcome returned by the server, if the body carried one.
        outcome: Option<Value>,
    },

    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status code for server-side failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Structured diagnostics (OperationOutcome) for server-side failures.
    pub fn outcome(&self) -> Option<&Value> {
        match self {
            Self::Status { outcome, .. } => outcome.as_ref(),
            _ => None,
        }
    }

    /// `true` for 404 Not Found and 410 Gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self.status(), Some(404 | 410))
    }

    /// Copy of a status failure. Transport errors cannot be cloned.
    fn clone_status(&self) -> Option<Self> {
        match self {
            Self::Status {
                status,
                message,
                outcome,
            } => Some(Self::Status {
                status: *status,
                message: message.clone(),
                outcome: outcome.clone(),
            }),
            _ => None,
        }
    }
}

/// Errors raised while loading or synthesizing fixture resources.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Fixture not found: {0}")]
    NotFound(String),

    #[error("Failed to read fixture {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read fixture archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Fixture {name} is not valid JSON: {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid FHIR resource type: {0}")]
    InvalidResourceType(String),
}

/// Errors raised while loading and validating run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config build error: {0}")]
    Build(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Signal raised by a test case procedure.
///
/// The executor classifies these into outcomes: `Skipped` becomes a skipped
/// result, everything else is a failure.
#[derive(Debug, Error)]
pub enum CaseError {
    /// A check did not hold.
    #[error("{message}")]
    Assertion {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The case decided its precondition is unmet.
    #[error("Skipped: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Skipped { reason: Option<String> },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Fixture(#[from] FixtureError),

    /// The case panicked; carries the panic payload.
    #[error("{0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaseError {
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Assertion {
            message: message.into(),
            cause: None,
        }
    }

    pub fn fail_with(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Assertion {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: Some(reason.into()),
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Strip wrapper layers so the underlying cause is what gets classified.
    ///
    /// An `anyhow` error that carries a `CaseError` or `ClientError` (directly,
    /// as context, or as its root cause) is unwrapped to that error.
    pub fn into_root(self) -> Self {
        match self {
            Self::Other(err) => match err.downcast::<CaseError>() {
                Ok(inner) => inner.into_root(),
                Err(err) => match err.downcast::<ClientError>() {
                    Ok(client) => Self::Client(client),
                    Err(err) => {
                        let root = err
                            .root_cause()
                            .downcast_ref::<ClientError>()
                            .and_then(ClientError::clone_status);
                        match root {
                            Some(client) => Self::Client(client),
                            None => Self::Other(err),
                        }
                    }
                },
            },
            other => other,
        }
    }
}

/// Result of a single test case procedure.
pub type CaseResult = std::result::Result<(), CaseError>;

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to load suite source {source_name}: {message}")]
    Discovery {
        source_name: String,
        message: String,
    },

    #[error("Module {0} is registered more than once")]
    DuplicateModule(String),

    #[error("Cached instance for module {0} has an unexpected type")]
    InstanceType(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build FHIR client: {0}")]
    Client(#[from] ClientError),

    #[error("Failed to write report: {0}")]
    Report(#[from] std::io::Error),
}

impl EngineError {
    pub fn discovery(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Discovery {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// Convenience result type for run-level operations
pub type Result<T> = std::result::Result<T, EngineError>;
