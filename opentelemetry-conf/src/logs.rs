//! # Logs Configuration module
//!
//! This module defines the configuration structures for the logger provider
//! and wires the configured processors into an [`SdkLoggerProvider`].

pub mod exporters;

use opentelemetry_sdk::{
    logs::{LoggerProviderBuilder, SdkLoggerProvider},
    Resource,
};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    common::AttributeLimits,
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    logs::exporters::LogRecordExporter,
    processor_config::Processor,
};

pub type LogRecordProcessor = Processor<LogRecordExporter>;

/// Limits applied to log records. The SDK does not enforce them yet.
pub type LogRecordLimits = AttributeLimits;

/// The `logger_provider` node.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoggerProvider {
    pub processors: Vec<LogRecordProcessor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LogRecordLimits>,
}

impl FromNode for LoggerProvider {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("LoggerProvider", node)?;
        let mut errors = ErrorJoiner::default();
        let value = LoggerProvider {
            processors: errors.or_default(fields.list("processors")),
            limits: errors.or_default(fields.node("limits")),
        };
        errors.finish()?;
        Ok(value)
    }
}

fn register_processor(
    builder: LoggerProviderBuilder,
    processor: &LogRecordProcessor,
) -> Result<LoggerProviderBuilder, ConfigError> {
    match (&processor.batch, &processor.simple) {
        (Some(_), Some(_)) => Err(ConfigError::invalid(
            "must not specify multiple log processor type",
        )),
        (Some(batch), None) => {
            let settings = batch.settings()?;
            batch.exporter.register(builder, Some(settings))
        }
        (None, Some(simple)) => simple.exporter.register(builder, None),
        (None, None) => Err(ConfigError::invalid(
            "unsupported log processor type, must be one of simple or batch",
        )),
    }
}

/// Builds the logger provider on top of `builder`, which already carries
/// the programmatic options.
pub(crate) fn build(
    config: &LoggerProvider,
    resource: Resource,
    mut builder: LoggerProviderBuilder,
) -> Result<SdkLoggerProvider, ConfigError> {
    let mut errors = ErrorJoiner::default();
    for processor in &config.processors {
        builder = match register_processor(builder, processor) {
            Ok(next) => next,
            Err(err) => {
                errors.push(err);
                SdkLoggerProvider::builder()
            }
        };
    }
    errors.finish()?;

    if config.limits.is_some() {
        tracing::debug!(
            name: "Configurator.LoggerProvider.LimitsIgnored",
            message = "log record limits are not enforced by the SDK",
        );
    }
    let provider = builder.with_resource(resource).build();
    tracing::debug!(
        name: "Configurator.LoggerProvider.Built",
        processors = config.processors.len(),
    );
    Ok(provider)
}
