// Error types for instrument registration, mutation and configuration

use crate::registry::InstrumentKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metric `{name}` is already a {existing}, cannot create it as a {requested}")]
    KindConflict {
        name: String,
        existing: InstrumentKind,
        requested: InstrumentKind,
    },

    #[error("metric `{name}` is declared with labels {declared:?}, requested with {requested:?}")]
    LabelConflict {
        name: String,
        declared: Vec<String>,
        requested: Vec<String>,
    },

    #[error("histogram `{name}` has invalid buckets: {reason}")]
    InvalidBuckets { name: String, reason: String },

    #[error("counters only go up, got delta {0}")]
    NegativeDelta(f64),

    #[error("sampling interval must be at least one second, got {0}")]
    InvalidInterval(u64),

    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
