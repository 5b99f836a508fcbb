use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::fhir::{ResourceFormat, ResourceType};

/// Configuration for one conformance run.
///
/// Threaded explicitly into discovery and execution; nothing in the engine
/// reads process-wide state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fixtures: FixturesConfig,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl RunConfig {
    /// Config pointing at `base_url` with everything else defaulted.
    pub fn for_server(base_url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.server.base_url = Some(base_url.into());
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self
            .server
            .base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigError::invalid("server.base_url is required"))?;
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ConfigError::invalid(format!("server.base_url is not a valid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::invalid("server.base_url must use http or https"));
        }
        if self.server.timeout_ms == 0 {
            return Err(ConfigError::invalid("server.timeout_ms must be > 0"));
        }
        if let Some(auth) = &self.server.auth {
            auth.validate()?;
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::invalid(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        for name in &self.run.resource_types {
            name.parse::<ResourceType>()
                .map_err(|e| ConfigError::invalid(format!("run.resource_types: {e}")))?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.server.timeout_ms)
    }

    /// Resource types for the all-resources suite, falling back to the defaults.
    pub fn resource_types(&self) -> Vec<ResourceType> {
        let configured: Vec<ResourceType> = self
            .run
            .resource_types
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        if configured.is_empty() {
            ResourceType::defaults()
        } else {
            configured
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// FHIR base URL of the server under test, e.g. `http://localhost:8080/fhir`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Initial preferred format. Test cases may switch it during the run.
    #[serde(default)]
    pub format: ResourceFormat,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_timeout_ms(),
            format: ResourceFormat::default(),
            auth: None,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Credentials sent with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl AuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            AuthConfig::Basic { username, .. } if username.is_empty() => {
                Err(ConfigError::invalid("server.auth.username must not be empty"))
            }
            AuthConfig::Bearer { token } if token.is_empty() => {
                Err(ConfigError::invalid("server.auth.token must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Where prerequisite fixtures are loaded from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FixturesConfig {
    /// Directory searched first for named fixtures.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Zip archive searched when the directory has no match.
    #[serde(default)]
    pub archive: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunSettings {
    /// Test code prefixes to run (case-insensitive). Empty runs everything.
    #[serde(default)]
    pub filter: Vec<String>,
    /// Record cases of a module whose initialization failed as skipped
    /// instead of omitting them.
    #[serde(default)]
    pub emit_suppressed: bool,
    /// Resource type names for the all-resources suite.
    #[serde(default)]
    pub resource_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportConfig {
    /// Path of the JSON report written after the run.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

pub mod loader {
    use super::RunConfig;
    use crate::error::ConfigError;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_FILE: &str = "octofhir-conformance.toml";
    pub const ENV_PREFIX: &str = "OCTOFHIR_CONFORMANCE";

    /// Load configuration from an optional TOML file plus environment overrides.
    ///
    /// The result is not validated; callers apply CLI overrides first and
    /// then call [`RunConfig::validate`].
    pub fn load_config(path: Option<&Path>) -> Result<RunConfig, ConfigError> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::invalid(format!(
                        "config file {} does not exist",
                        p.display()
                    )));
                }
                builder = builder.add_source(File::from(p.to_path_buf()));
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g. OCTOFHIR_CONFORMANCE__SERVER__BASE_URL.
        // List keys take comma-separated values: OCTOFHIR_CONFORMANCE__RUN__FILTER=RD,HI
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("run.filter")
                .with_list_parse_key("run.resource_types"),
        );
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }
}
