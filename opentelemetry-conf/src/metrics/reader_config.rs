//! # Metrics Reader Configuration module
//!
//! This module defines the configuration structures for metric readers.
//! Readers collect metrics from the meter provider and hand them to an
//! exporter, either on a schedule or when scraped.

use opentelemetry_sdk::metrics::MeterProviderBuilder;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::{
    common::EmptyConfig,
    decode::{millis, Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    metrics::{
        exporters::{PrometheusReader, PullMetricExporter, PushMetricExporter},
        CardinalityLimits,
    },
};

/// A metric reader selecting exactly one of `periodic` or `pull`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricReader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic: Option<PeriodicMetricReader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullMetricReader>,
}

impl FromNode for MetricReader {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("MetricReader", node)?;
        let mut errors = ErrorJoiner::default();
        let value = MetricReader {
            periodic: errors.or_default(fields.variant("periodic")),
            pull: errors.or_default(fields.variant("pull")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Pushes metrics to an exporter every `interval` milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeriodicMetricReader {
    pub exporter: PushMetricExporter,
    /// Milliseconds; `0` keeps the SDK default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    /// Milliseconds; `0` keeps the SDK default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub producers: Vec<MetricProducer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality_limits: Option<CardinalityLimits>,
}

impl PeriodicMetricReader {
    pub fn new(exporter: PushMetricExporter) -> Self {
        PeriodicMetricReader {
            exporter,
            interval: None,
            timeout: None,
            producers: Vec::new(),
            cardinality_limits: None,
        }
    }
}

impl FromNode for PeriodicMetricReader {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("PeriodicMetricReader", node)?;
        let mut errors = ErrorJoiner::default();
        let value = PeriodicMetricReader {
            exporter: errors.or_default(fields.required_node("exporter")),
            interval: errors.or_default(fields.non_negative("interval")),
            timeout: errors.or_default(fields.non_negative("timeout")),
            producers: errors.or_default(fields.list("producers")),
            cardinality_limits: errors.or_default(fields.node("cardinality_limits")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Exposes metrics for scraping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PullMetricReader {
    pub exporter: PullMetricExporter,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub producers: Vec<MetricProducer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality_limits: Option<CardinalityLimits>,
}

impl FromNode for PullMetricReader {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("PullMetricReader", node)?;
        let mut errors = ErrorJoiner::default();
        let value = PullMetricReader {
            exporter: errors.or_default(fields.required_node("exporter")),
            producers: errors.or_default(fields.list("producers")),
            cardinality_limits: errors.or_default(fields.node("cardinality_limits")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// A bridge feeding metrics from another instrumentation library. Producers
/// other than `opencensus` are kept as raw nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricProducer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opencensus: Option<EmptyConfig>,
    #[serde(flatten)]
    pub additional_properties: Mapping,
}

impl FromNode for MetricProducer {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("MetricProducer", node)?;
        Ok(MetricProducer {
            opencensus: fields.variant("opencensus")?,
            additional_properties: fields.remaining(&["opencensus"]),
        })
    }
}

fn ignore_producers(producers: &[MetricProducer]) {
    if !producers.is_empty() {
        tracing::debug!(
            name: "Configurator.MetricReader.ProducersIgnored",
            producers = producers.len(),
            message = "metric producers are not supported by the SDK",
        );
    }
}

impl MetricReader {
    /// The cardinality limits configured on the selected variant.
    pub(crate) fn cardinality_limits(&self) -> Option<&CardinalityLimits> {
        match (&self.periodic, &self.pull) {
            (Some(periodic), None) => periodic.cardinality_limits.as_ref(),
            (None, Some(pull)) => pull.cardinality_limits.as_ref(),
            _ => None,
        }
    }

    /// Registers the reader with `builder`. A pull reader also returns its
    /// Prometheus handle.
    pub(crate) fn register(
        &self,
        builder: MeterProviderBuilder,
    ) -> Result<(MeterProviderBuilder, Option<PrometheusReader>), ConfigError> {
        match (&self.periodic, &self.pull) {
            (Some(_), Some(_)) => Err(ConfigError::invalid(
                "must not specify multiple metric reader type",
            )),
            (Some(periodic), None) => {
                let interval = millis("interval", periodic.interval)?;
                if let Some(timeout) = millis("timeout", periodic.timeout)? {
                    tracing::debug!(
                        name: "Configurator.MetricReader.TimeoutIgnored",
                        timeout_ms = timeout.as_millis() as u64,
                        message = "the periodic reader uses its own export timeout",
                    );
                }
                ignore_producers(&periodic.producers);
                let builder = periodic.exporter.register_periodic(builder, interval)?;
                Ok((builder, None))
            }
            (None, Some(pull)) => {
                ignore_producers(&pull.producers);
                let (builder, reader) = pull.exporter.register(builder)?;
                Ok((builder, Some(reader)))
            }
            (None, None) => Err(ConfigError::invalid("no valid metric reader")),
        }
    }
}


#[cfg(test)]
mod tests {
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    use super::*;

    fn decode(text: &str) -> Result<MetricReader, ConfigError> {
        MetricReader::from_node(&serde_yaml::from_str(text).unwrap())
    }

    fn register(reader: &MetricReader) -> Result<Option<PrometheusReader>, ConfigError> {
        reader
            .register(SdkMeterProvider::builder())
            .map(|(_, prometheus)| prometheus)
    }

    #[test]
    fn test_reader_variants() {
        let err = register(&MetricReader::default()).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("no valid metric reader")));

        let reader = decode(
            r#"
            periodic:
              exporter:
                console:
            pull:
              exporter:
                prometheus/development:
                  host: localhost
                  port: 0
            "#,
        )
        .unwrap();
        let err = register(&reader).unwrap_err();
        assert!(err.contains(&ConfigError::invalid(
            "must not specify multiple metric reader type"
        )));
    }

    #[test]
    fn test_periodic_bounds() {
        let err = decode("periodic:\n  interval: -1\n  exporter:\n    console:").unwrap_err();
        assert!(err.contains(&ConfigError::greater_or_equal_zero("interval")));

        let err = decode("periodic:\n  timeout: -1\n  exporter:\n    console:").unwrap_err();
        assert!(err.contains(&ConfigError::greater_or_equal_zero("timeout")));

        let err = decode("periodic:\n  interval: 1000").unwrap_err();
        assert!(err.contains(&ConfigError::required("PeriodicMetricReader", "exporter")));
    }

    #[test]
    fn test_periodic_console_reader() {
        let reader = decode(
            r#"
            periodic:
              interval: 0
              timeout: 5000
              exporter:
                console:
              producers:
                - opencensus:
                - prometheus: {}
              cardinality_limits:
                default: 2000
            "#,
        )
        .unwrap();
        let periodic = reader.periodic.as_ref().unwrap();
        assert_eq!(periodic.producers.len(), 2);
        assert!(periodic.producers[0].opencensus.is_some());
        assert!(periodic.producers[1]
            .additional_properties
            .contains_key("prometheus"));
        assert_eq!(
            reader.cardinality_limits().and_then(|limits| limits.default),
            Some(2000)
        );
        assert!(register(&reader).unwrap().is_none());
    }

    #[test]
    fn test_pull_reader_returns_handle() {
        let reader = decode(
            r#"
            pull:
              exporter:
                prometheus/development:
                  host: 127.0.0.1
                  port: 0
            "#,
        )
        .unwrap();
        let (builder, prometheus) = reader.register(SdkMeterProvider::builder()).unwrap();
        let prometheus = prometheus.unwrap();
        assert!(prometheus.local_addr().ip().is_loopback());

        let provider = builder.build();
        assert!(provider.shutdown().is_ok());
    }

    #[test]
    fn test_pull_reader_requires_host() {
        let reader = decode("pull:\n  exporter:\n    prometheus/development:\n      port: 9464")
            .unwrap();
        let err = register(&reader).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("host must be specified")));
    }
}
