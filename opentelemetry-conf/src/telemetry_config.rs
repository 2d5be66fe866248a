//! # Telemetry Configuration module
//!
//! This module defines the root of the configuration document and the entry
//! points that read it from YAML or JSON text. Environment variable
//! references are substituted before the document is decoded.

use std::path::Path;

use serde::Serialize;
use serde_yaml::Value;

use crate::{
    common::AttributeLimits,
    decode::{Fields, FromNode},
    env_provider::replace_env_vars,
    error::{ConfigError, ErrorJoiner},
    logs::LoggerProvider,
    metrics::MeterProvider,
    propagation::Propagator,
    resource::Resource,
    traces::TracerProvider,
};

const OWNER: &str = "OpenTelemetryConfiguration";
const DEFAULT_LOG_LEVEL: &str = "info";

/// The root of a configuration document.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OpenTelemetryConfiguration {
    pub file_format: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    pub log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagator: Option<Propagator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_limits: Option<AttributeLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracer_provider: Option<TracerProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_provider: Option<MeterProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger_provider: Option<LoggerProvider>,
    /// Settings for instrumentation libraries, passed through untouched.
    #[serde(
        rename = "instrumentation/development",
        skip_serializing_if = "Option::is_none"
    )]
    pub instrumentation_development: Option<Value>,
}

impl OpenTelemetryConfiguration {
    pub fn new(file_format: impl Into<String>) -> Self {
        OpenTelemetryConfiguration {
            file_format: file_format.into(),
            disabled: false,
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
            resource: None,
            propagator: None,
            attribute_limits: None,
            tracer_provider: None,
            meter_provider: None,
            logger_provider: None,
            instrumentation_development: None,
        }
    }

    /// Decodes a YAML document after substituting environment variables.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let substituted = replace_env_vars(yaml.as_bytes())?;
        let node: Value = serde_yaml::from_slice(&substituted)
            .map_err(|err| ConfigError::unmarshal(OWNER, err.to_string()))?;
        Self::from_node(&node)
    }

    /// Reads and decodes a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::invalid_with(format!("reading {}", path.display()), err)
        })?;
        Self::from_yaml(&yaml)
    }

    /// Decodes a JSON document. The JSON tree is converted to YAML so that
    /// both formats go through the same substitution and decoding.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let tree: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| ConfigError::unmarshal(OWNER, err.to_string()))?;
        let yaml = serde_yaml::to_string(&tree)
            .map_err(|err| ConfigError::unmarshal(OWNER, err.to_string()))?;
        Self::from_yaml(&yaml)
    }

    /// Serializes the model back into a YAML document.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self)
            .map_err(|err| ConfigError::invalid_with("could not serialize configuration", err))
    }

    /// The `tracing` level closest to `log_level`, or `None` when the value
    /// is not a known severity.
    pub fn level(&self) -> Option<tracing::Level> {
        severity(&self.log_level)
    }
}

/// Accepts the severity names of the log data model, optionally followed by
/// the digits 2 to 4 (`info2`, `warn4`).
fn severity(value: &str) -> Option<tracing::Level> {
    let lower = value.to_ascii_lowercase();
    let base = lower.trim_end_matches(['2', '3', '4']);
    let suffix = &lower[base.len()..];
    if suffix.len() > 1 {
        return None;
    }
    match base {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" => Some(tracing::Level::WARN),
        "error" | "fatal" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

impl FromNode for OpenTelemetryConfiguration {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of(OWNER, node)?;
        let mut errors = ErrorJoiner::default();
        let log_level = errors
            .or_default(fields.scalar::<String>("log_level"))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned());
        if severity(&log_level).is_none() {
            errors.push(ConfigError::invalid("log_level: invalid value"));
        }
        let config = OpenTelemetryConfiguration {
            file_format: errors.or_default(fields.required_scalar("file_format")),
            disabled: errors.or_default(fields.scalar("disabled")).unwrap_or(false),
            log_level,
            resource: errors.or_default(fields.node("resource")),
            propagator: errors.or_default(fields.node("propagator")),
            attribute_limits: errors.or_default(fields.node("attribute_limits")),
            tracer_provider: errors.or_default(fields.node("tracer_provider")),
            meter_provider: errors.or_default(fields.node("meter_provider")),
            logger_provider: errors.or_default(fields.node("logger_provider")),
            instrumentation_development: fields.value("instrumentation/development").cloned(),
        };
        errors.finish()?;
        Ok(config)
    }
}
