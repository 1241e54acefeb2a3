//! Metrics configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML or JSON
//! file, then `PROMETRICS_*` environment variables.
//!
//! ```toml
//! health_interval_secs = 5
//! cpu_sampling = false
//! size_buckets = [64.0, 512.0, 4096.0]
//! ```

use crate::{ConfigError, DEFAULT_LATENCY_BUCKETS, DEFAULT_SIZE_BUCKETS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Prefix of environment variables read by [`MetricsConfig::from_env`]
pub const ENV_PREFIX: &str = "PROMETRICS";

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration shared by the HTTP metrics, operation tracker and health sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between health samples
    pub health_interval_secs: u64,
    /// Whether the health sampler computes CPU usage
    pub cpu_sampling: bool,
    /// Route label used when a request carries no matched route
    pub unknown_route_label: String,
    /// Route label used by `HttpMetrics::instrument_default`
    pub default_route_label: String,
    /// Route labels longer than this are truncated
    pub max_route_label_len: usize,
    pub duration_buckets: Vec<f64>,
    pub size_buckets: Vec<f64>,
    pub operation_buckets: Vec<f64>,
    /// Register prometheus' process collector alongside the instruments
    pub process_collector: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 10,
            cpu_sampling: true,
            unknown_route_label: "unknown".to_string(),
            default_route_label: "default".to_string(),
            max_route_label_len: 100,
            duration_buckets: DEFAULT_LATENCY_BUCKETS.to_vec(),
            size_buckets: DEFAULT_SIZE_BUCKETS.to_vec(),
            operation_buckets: DEFAULT_LATENCY_BUCKETS.to_vec(),
            process_collector: false,
        }
    }
}

impl MetricsConfig {
    /// Read a config file, choosing the format from its extension
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path)?;
        let content = fs::read_to_string(path)?;
        Self::parse(&content, format)
    }

    /// Parse config text in the given format
    pub fn parse(content: &str, format: FileFormat) -> ConfigResult<Self> {
        match format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("JSON parse error: {}", e))),
            FileFormat::Toml => toml::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e))),
        }
    }

    /// Defaults overridden by `PROMETRICS_*` environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env_vars(&EnvLoader::new(ENV_PREFIX).load())?;
        Ok(config)
    }

    /// Full load: `.env` file if present, defaults, optional config file, then
    /// the environment. The result is validated.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        if let Ok(dotenv_path) = dotenvy::dotenv() {
            debug!(path = %dotenv_path.display(), "Loaded .env file");
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_vars(&EnvLoader::new(ENV_PREFIX).load())?;
        config.validate()?;

        Ok(config)
    }

    /// Apply overrides keyed by lowercase field name, as produced by [`EnvLoader`].
    ///
    /// Unknown keys are ignored.
    pub fn apply_env_vars(&mut self, vars: &HashMap<String, String>) -> ConfigResult<()> {
        for (key, value) in vars {
            let value = value.trim();
            match key.as_str() {
                "health_interval_secs" => self.health_interval_secs = parse_number(key, value)?,
                "cpu_sampling" => self.cpu_sampling = parse_bool(key, value)?,
                "unknown_route_label" => self.unknown_route_label = value.to_string(),
                "default_route_label" => self.default_route_label = value.to_string(),
                "max_route_label_len" => self.max_route_label_len = parse_number(key, value)?,
                "duration_buckets" => self.duration_buckets = parse_buckets(key, value)?,
                "size_buckets" => self.size_buckets = parse_buckets(key, value)?,
                "operation_buckets" => self.operation_buckets = parse_buckets(key, value)?,
                "process_collector" => self.process_collector = parse_bool(key, value)?,
                _ => debug!(key = %key, "Ignoring unknown metrics setting"),
            }
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Trait for validating configuration
pub trait Validate {
    fn validate(&self) -> ConfigResult<()>;
}

impl Validate for MetricsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.health_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "health_interval_secs must be greater than zero".to_string(),
            ));
        }
        not_empty(&self.unknown_route_label, "unknown_route_label")?;
        not_empty(&self.default_route_label, "default_route_label")?;
        if self.max_route_label_len < 8 {
            return Err(ConfigError::ValidationError(format!(
                "max_route_label_len must be at least 8, got {}",
                self.max_route_label_len
            )));
        }
        ascending(&self.duration_buckets, "duration_buckets")?;
        ascending(&self.size_buckets, "size_buckets")?;
        ascending(&self.operation_buckets, "operation_buckets")?;
        Ok(())
    }
}

fn not_empty(value: &str, field: &str) -> ConfigResult<()> {
    if value.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    Ok(())
}

fn ascending(buckets: &[f64], field: &str) -> ConfigResult<()> {
    if buckets.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    if buckets.iter().any(|b| b.is_nan()) || buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConfigError::ValidationError(format!(
            "{} must be strictly ascending",
            field
        )));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("{} expects a number, got `{}`", key, value)))
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::ParseError(format!(
            "{} expects a boolean, got `{}`",
            key, value
        ))),
    }
}

fn parse_buckets(key: &str, value: &str) -> ConfigResult<Vec<f64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_number(key, s))
        .collect()
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            _ => None,
        }
    }

    fn from_path(path: &Path) -> ConfigResult<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::LoadError("No file extension found".to_string()))?;

        Self::from_extension(ext)
            .ok_or_else(|| ConfigError::LoadError(format!("Unsupported format: {}", ext)))
    }
}

/// Environment variable loader
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Variables starting with the prefix, keyed by the lowercase remainder
    pub fn load(&self) -> HashMap<String, String> {
        self.filter(env::vars())
    }

    fn filter(&self, vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
        let prefix = format!("{}_", self.prefix);
        vars.filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|rest| (rest.to_lowercase(), value))
        })
        .collect()
    }
}
