//! # Traces Configuration module
//!
//! This module defines the configuration structures for the tracer provider
//! and wires the configured processors, sampler and limits into an
//! [`SdkTracerProvider`].

pub mod exporters;
pub mod sampler;

use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    common::AttributeLimits,
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    processor_config::Processor,
    traces::{exporters::SpanExporter, sampler::Sampler},
};

pub type SpanProcessor = Processor<SpanExporter>;

/// The `tracer_provider` node.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TracerProvider {
    pub processors: Vec<SpanProcessor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<SpanLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<Sampler>,
}

impl FromNode for TracerProvider {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("TracerProvider", node)?;
        let mut errors = ErrorJoiner::default();
        let value = TracerProvider {
            processors: errors.or_default(fields.list("processors")),
            limits: errors.or_default(fields.node("limits")),
            sampler: errors.or_default(fields.node("sampler")),
        };
        errors.finish()?;
        Ok(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_value_length_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_count_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_count_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_count_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_attribute_count_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_attribute_count_limit: Option<i64>,
}

impl FromNode for SpanLimits {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("SpanLimits", node)?;
        let mut errors = ErrorJoiner::default();
        let value = SpanLimits {
            attribute_value_length_limit: errors
                .or_default(fields.non_negative("attribute_value_length_limit")),
            attribute_count_limit: errors.or_default(fields.non_negative("attribute_count_limit")),
            event_count_limit: errors.or_default(fields.non_negative("event_count_limit")),
            link_count_limit: errors.or_default(fields.non_negative("link_count_limit")),
            event_attribute_count_limit: errors
                .or_default(fields.non_negative("event_attribute_count_limit")),
            link_attribute_count_limit: errors
                .or_default(fields.non_negative("link_attribute_count_limit")),
        };
        errors.finish()?;
        Ok(value)
    }
}

fn limit(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn apply_limits(
    mut builder: TracerProviderBuilder,
    limits: Option<&SpanLimits>,
    attribute_limits: Option<&AttributeLimits>,
) -> TracerProviderBuilder {
    let attribute_count = limits
        .and_then(|limits| limits.attribute_count_limit)
        .or_else(|| attribute_limits.and_then(|limits| limits.attribute_count_limit));
    if let Some(value) = attribute_count {
        builder = builder.with_max_attributes_per_span(limit(value));
    }
    let Some(limits) = limits else {
        return builder;
    };
    if let Some(value) = limits.event_count_limit {
        builder = builder.with_max_events_per_span(limit(value));
    }
    if let Some(value) = limits.link_count_limit {
        builder = builder.with_max_links_per_span(limit(value));
    }
    if let Some(value) = limits.event_attribute_count_limit {
        builder = builder.with_max_attributes_per_event(limit(value));
    }
    if let Some(value) = limits.link_attribute_count_limit {
        builder = builder.with_max_attributes_per_link(limit(value));
    }
    if limits.attribute_value_length_limit.is_some() {
        tracing::debug!(
            name: "Configurator.TracerProvider.AttributeValueLengthLimitIgnored",
            message = "the SDK does not truncate span attribute values",
        );
    }
    builder
}

fn register_processor(
    builder: TracerProviderBuilder,
    processor: &SpanProcessor,
) -> Result<TracerProviderBuilder, ConfigError> {
    match (&processor.batch, &processor.simple) {
        (Some(_), Some(_)) => Err(ConfigError::invalid(
            "must not specify multiple span processor type",
        )),
        (Some(batch), None) => {
            let settings = batch.settings()?;
            batch.exporter.register(builder, Some(settings))
        }
        (None, Some(simple)) => simple.exporter.register(builder, None),
        (None, None) => Err(ConfigError::invalid(
            "unsupported span processor type, must be one of simple or batch",
        )),
    }
}

/// Builds the tracer provider on top of `builder`, which already carries
/// the programmatic options. Processors are registered in declaration order
/// and every failing processor is reported.
pub(crate) fn build(
    config: &TracerProvider,
    attribute_limits: Option<&AttributeLimits>,
    resource: Resource,
    mut builder: TracerProviderBuilder,
) -> Result<SdkTracerProvider, ConfigError> {
    let mut errors = ErrorJoiner::default();
    for processor in &config.processors {
        builder = match register_processor(builder, processor) {
            Ok(next) => next,
            Err(err) => {
                // The failed registration consumed the builder; the remaining
                // processors are only checked for errors.
                errors.push(err);
                SdkTracerProvider::builder()
            }
        };
    }
    if let Some(sampler) = errors.collect(sampler::build(config.sampler.as_ref())) {
        builder = builder.with_sampler(sampler);
    }
    errors.finish()?;

    let provider = apply_limits(builder, config.limits.as_ref(), attribute_limits)
        .with_resource(resource)
        .build();
    tracing::debug!(
        name: "Configurator.TracerProvider.Built",
        processors = config.processors.len(),
    );
    Ok(provider)
}
