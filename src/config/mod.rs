//! YAML configuration model.
//!
//! The core is invoked as a library; the surrounding CLI hands it one
//! `Config` loaded from YAML. Unknown keys are rejected at parse time and
//! cross-field rules are checked by [`Config::validate`] before any stage
//! runs. Secrets are referenced by environment-variable name, never inlined.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SEVERITIES: &[&str] = &["info", "warning", "error", "critical"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config read error at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config at {path}: {message}")]
    Invalid { path: String, message: String },
    #[error("missing required secret: environment variable {0} is not set")]
    MissingSecret(String),
}

impl ConfigError {
    fn invalid(path: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub sources: IndexMap<String, SourceConfig>,
    #[serde(default)]
    pub io: IoSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub determinism: DeterminismSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub materialization: MaterializationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    /// Pipeline name, also the entity id (activity, assay, document, ...).
    pub name: String,
    /// Semver pipeline version stamped into every row and meta.yaml.
    pub version: String,
    /// Optional CLI override for the upstream release tag. When absent the
    /// ChEMBL `/status` handshake supplies it.
    #[serde(default)]
    pub release_tag: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSection {
    #[serde(default)]
    pub default: HttpProfile,
    #[serde(default)]
    pub profiles: HashMap<String, HttpProfile>,
}

impl HttpSection {
    /// Resolve a named profile, falling back to the default profile.
    pub fn profile(&self, name: Option<&str>) -> &HttpProfile {
        match name {
            Some(name) => self.profiles.get(name).unwrap_or(&self.default),
            None => &self.default,
        }
    }
}

/// Per-client HTTP behaviour: throttling, retries, breaker, cache, fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpProfile {
    /// Token bucket size per period.
    pub max_calls: u32,
    /// Token bucket refill period in seconds.
    pub period_seconds: f64,
    /// Optional jitter fraction applied to rate-limit waits (0.0 - 1.0).
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: f64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: f64,
    /// Fallback strategies matched in order: cache, network, timeout, 5xx,
    /// partial.
    #[serde(default)]
    pub fallback_strategies: Vec<String>,
    #[serde(default = "default_partial_retry_max")]
    pub partial_retry_max: u32,
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_read_timeout() -> f64 {
    30.0
}

fn default_partial_retry_max() -> u32 {
    3
}

impl Default for HttpProfile {
    fn default() -> Self {
        Self {
            max_calls: 5,
            period_seconds: 1.0,
            jitter: 0.0,
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            cache: CacheSettings::default(),
            connect_timeout_seconds: default_connect_timeout(),
            read_timeout_seconds: default_read_timeout(),
            fallback_strategies: Vec::new(),
            partial_retry_max: default_partial_retry_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub total: u32,
    pub backoff_factor: f64,
    pub backoff_max: f64,
    #[serde(default = "default_retry_statuses")]
    pub statuses: Vec<u16>,
}

fn default_retry_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            total: 3,
            backoff_factor: 2.0,
            backoff_max: 30.0,
            statuses: default_retry_statuses(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub timeout_seconds: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_seconds: f64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 300.0,
            max_entries: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of an `http.profiles` entry; the default profile otherwise.
    #[serde(default)]
    pub http_profile: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_url_length: Option<usize>,
    /// Environment variable holding this source's API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Environment variable holding the polite-pool contact address.
    #[serde(default)]
    pub contact_env: Option<String>,
    /// Local dictionary path (IUPHAR CSV lookup mode).
    #[serde(default)]
    pub dictionary: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            http_profile: None,
            batch_size: None,
            max_url_length: None,
            api_key_env: None,
            contact_env: None,
            dictionary: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoSection {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// CSV with at least the entity id column; extras pass through.
    pub path: PathBuf,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/input/activity.csv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub root: PathBuf,
    /// Date tag used in artifact file names; defaults to the run date.
    #[serde(default)]
    pub date_tag: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/output"),
            date_tag: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    /// Bounded in-flight requests per adapter.
    pub workers: usize,
    pub batch_size: usize,
    pub max_url_length: usize,
    #[serde(default)]
    pub dry_run: bool,
    /// Hard wall-clock cap on a WebEnv history walk.
    pub webenv_timeout_seconds: u64,
    /// Interval between id-mapping job polls.
    pub poll_interval_seconds: f64,
    /// Iteration cap on the id-mapping poll loop.
    pub poll_max_iterations: u32,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            max_url_length: 2000,
            dry_run: false,
            webenv_timeout_seconds: 300,
            poll_interval_seconds: 2.0,
            poll_max_iterations: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeterminismSection {
    #[serde(default)]
    pub sort_by: Vec<String>,
    #[serde(default)]
    pub ascending: Vec<bool>,
    pub float_precision: usize,
    pub datetime_format: String,
    pub na_representation: String,
    pub line_terminator: String,
}

impl Default for DeterminismSection {
    fn default() -> Self {
        Self {
            sort_by: Vec::new(),
            ascending: Vec::new(),
            float_precision: 6,
            datetime_format: "%Y-%m-%dT%H:%M:%SZ".to_string(),
            na_representation: String::new(),
            line_terminator: "\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationSection {
    /// Minimum issue severity that fails the validate stage.
    pub severity_threshold: String,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            severity_threshold: "error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaterializationSection {
    pub format: String,
    #[serde(default)]
    pub correlation: bool,
    #[serde(default)]
    pub summary: bool,
}

impl Default for MaterializationSection {
    fn default() -> Self {
        Self {
            format: "csv".to_string(),
            correlation: false,
            summary: false,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Cross-field checks the serde layer cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.name.trim().is_empty() {
            return Err(ConfigError::invalid("pipeline.name", "must not be empty"));
        }
        if semver::Version::parse(&self.pipeline.version).is_err() {
            return Err(ConfigError::invalid(
                "pipeline.version",
                format!("not a semver version: {}", self.pipeline.version),
            ));
        }
        if self.runtime.workers == 0 {
            return Err(ConfigError::invalid("runtime.workers", "must be >= 1"));
        }
        if self.runtime.batch_size == 0 {
            return Err(ConfigError::invalid("runtime.batch_size", "must be >= 1"));
        }
        if self.determinism.float_precision > 17 {
            return Err(ConfigError::invalid(
                "determinism.float_precision",
                "must be <= 17",
            ));
        }
        if !self.determinism.ascending.is_empty()
            && self.determinism.ascending.len() != self.determinism.sort_by.len()
        {
            return Err(ConfigError::invalid(
                "determinism.ascending",
                "length must match determinism.sort_by",
            ));
        }
        if !SEVERITIES.contains(&self.validation.severity_threshold.as_str()) {
            return Err(ConfigError::invalid(
                "validation.severity_threshold",
                format!(
                    "must be one of {:?}, got {}",
                    SEVERITIES, self.validation.severity_threshold
                ),
            ));
        }
        if self.materialization.format != "csv" {
            return Err(ConfigError::invalid(
                "materialization.format",
                format!("only csv is supported, got {}", self.materialization.format),
            ));
        }
        for (name, profile) in std::iter::once(("default", &self.http.default))
            .chain(self.http.profiles.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if profile.max_calls == 0 {
                return Err(ConfigError::invalid(
                    &format!("http.{name}.max_calls"),
                    "must be >= 1",
                ));
            }
            if profile.period_seconds <= 0.0 {
                return Err(ConfigError::invalid(
                    &format!("http.{name}.period_seconds"),
                    "must be > 0",
                ));
            }
            for strategy in &profile.fallback_strategies {
                if !matches!(
                    strategy.as_str(),
                    "cache" | "network" | "timeout" | "5xx" | "partial"
                ) {
                    return Err(ConfigError::invalid(
                        &format!("http.{name}.fallback_strategies"),
                        format!("unknown strategy {strategy}"),
                    ));
                }
            }
        }
        for (name, source) in &self.sources {
            if let Some(profile) = &source.http_profile {
                if !self.http.profiles.contains_key(profile) {
                    return Err(ConfigError::invalid(
                        &format!("sources.{name}.http_profile"),
                        format!("unknown profile {profile}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Resolve a secret by environment-variable name. A configured but unset
/// variable is a hard configuration error.
pub fn required_secret(var: &str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingSecret(var.to_string()))
}

/// Resolve an optional secret; unset means the feature stays off.
pub fn optional_secret(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
pipeline:
  name: activity
  version: 1.0.0
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.pipeline.name, "activity");
        assert_eq!(config.runtime.workers, 4);
        assert_eq!(config.determinism.float_precision, 6);
        assert_eq!(config.validation.severity_threshold, "error");
        assert_eq!(config.materialization.format, "csv");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let text = format!("{MINIMAL}\nsurprise: true\n");
        assert!(matches!(
            Config::from_yaml(&text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_bad_severity_rejected() {
        let text = format!("{MINIMAL}\nvalidation:\n  severity_threshold: fatal\n");
        let err = Config::from_yaml(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref path, .. } if path == "validation.severity_threshold"));
    }

    #[test]
    fn test_non_csv_format_rejected() {
        let text = format!("{MINIMAL}\nmaterialization:\n  format: parquet\n");
        assert!(Config::from_yaml(&text).is_err());
    }

    #[test]
    fn test_unknown_http_profile_reference_rejected() {
        let text = format!("{MINIMAL}\nsources:\n  pubmed:\n    http_profile: slow\n");
        assert!(Config::from_yaml(&text).is_err());
    }

    #[test]
    fn test_shipped_examples_parse() {
        let activity = include_str!("../../configs/activity.yaml");
        let config = Config::from_yaml(activity).unwrap();
        assert_eq!(config.pipeline.name, "activity");
        assert_eq!(
            config.http.profile(Some("chembl_bulk")).retry.total,
            5
        );
        assert!(config.materialization.correlation);

        let document = include_str!("../../configs/document.yaml");
        let config = Config::from_yaml(document).unwrap();
        assert_eq!(config.pipeline.name, "document");
        assert_eq!(
            config.sources.get("pubmed").and_then(|s| s.batch_size),
            Some(200)
        );
        assert_eq!(
            config.http.default.fallback_strategies,
            vec!["cache", "network", "timeout", "5xx"]
        );
    }

    #[test]
    fn test_profile_lookup_falls_back_to_default() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let profile = config.http.profile(Some("missing"));
        assert_eq!(profile.max_calls, config.http.default.max_calls);
    }
}
