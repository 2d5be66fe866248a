//! # Metrics Configuration module
//!
//! This module defines the configuration structures for the meter provider
//! and wires the configured readers and views into an [`SdkMeterProvider`].

pub mod exporters;
pub mod reader_config;
pub mod views;

use opentelemetry_sdk::{
    metrics::{
        reader::MetricReader as _, InstrumentKind, MeterProviderBuilder, SdkMeterProvider,
    },
    Resource,
};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    metrics::{exporters::PrometheusReader, reader_config::MetricReader, views::View},
};

/// The `meter_provider` node.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MeterProvider {
    pub readers: Vec<MetricReader>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub views: Vec<View>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exemplar_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality_limits: Option<CardinalityLimits>,
}

impl FromNode for MeterProvider {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("MeterProvider", node)?;
        let mut errors = ErrorJoiner::default();
        let value = MeterProvider {
            readers: errors.or_default(fields.list("readers")),
            views: errors.or_default(fields.list("views")),
            exemplar_filter: errors.or_default(fields.scalar("exemplar_filter")),
            cardinality_limits: errors.or_default(fields.node("cardinality_limits")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Per instrument kind caps on the number of attribute sets aggregated by a
/// stream. `default` applies to kinds without their own value.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CardinalityLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gauge: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observable_counter: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observable_gauge: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observable_up_down_counter: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_down_counter: Option<i64>,
}

impl FromNode for CardinalityLimits {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("CardinalityLimits", node)?;
        let mut errors = ErrorJoiner::default();
        let value = CardinalityLimits {
            default: errors.or_default(fields.positive("default")),
            counter: errors.or_default(fields.positive("counter")),
            gauge: errors.or_default(fields.positive("gauge")),
            histogram: errors.or_default(fields.positive("histogram")),
            observable_counter: errors.or_default(fields.positive("observable_counter")),
            observable_gauge: errors.or_default(fields.positive("observable_gauge")),
            observable_up_down_counter: errors
                .or_default(fields.positive("observable_up_down_counter")),
            up_down_counter: errors.or_default(fields.positive("up_down_counter")),
        };
        errors.finish()?;
        Ok(value)
    }
}

impl CardinalityLimits {
    pub fn for_kind(&self, kind: InstrumentKind) -> Option<i64> {
        let specific = match kind {
            InstrumentKind::Counter => self.counter,
            InstrumentKind::Gauge => self.gauge,
            InstrumentKind::Histogram => self.histogram,
            InstrumentKind::ObservableCounter => self.observable_counter,
            InstrumentKind::ObservableGauge => self.observable_gauge,
            InstrumentKind::ObservableUpDownCounter => self.observable_up_down_counter,
            InstrumentKind::UpDownCounter => self.up_down_counter,
        };
        specific.or(self.default)
    }
}

fn check_exemplar_filter(filter: Option<&str>) -> Result<(), ConfigError> {
    match filter {
        None => Ok(()),
        Some(filter @ ("always_on" | "always_off" | "trace_based")) => {
            tracing::debug!(
                name: "Configurator.MeterProvider.ExemplarFilterIgnored",
                exemplar_filter = filter,
                message = "exemplar filters are not configurable on the SDK",
            );
            Ok(())
        }
        Some(other) => Err(ConfigError::invalid(format!(
            "unsupported exemplar filter {other:?}"
        ))),
    }
}

/// Builds the meter provider on top of `builder`, which already carries the
/// programmatic options. Returns the Prometheus readers alongside it so that
/// callers can find their listen addresses.
pub(crate) fn build(
    config: &MeterProvider,
    resource: Resource,
    mut builder: MeterProviderBuilder,
) -> Result<(SdkMeterProvider, Vec<PrometheusReader>), ConfigError> {
    let mut errors = ErrorJoiner::default();
    let mut prometheus = Vec::new();
    for reader in &config.readers {
        builder = match reader.register(builder) {
            Ok((next, pull)) => {
                prometheus.extend(pull);
                next
            }
            Err(err) => {
                errors.push(err);
                SdkMeterProvider::builder()
            }
        };
    }
    errors.collect(check_exemplar_filter(config.exemplar_filter.as_deref()));

    let limits: Vec<&CardinalityLimits> = config
        .cardinality_limits
        .iter()
        .chain(config.readers.iter().filter_map(MetricReader::cardinality_limits))
        .collect();
    let compiled = errors.collect(views::compile_all(&config.views));
    if let Err(err) = errors.finish() {
        for reader in &prometheus {
            if let Err(shutdown_err) = reader.shutdown() {
                tracing::debug!(
                    name: "Configurator.MeterProvider.PullReaderShutdownFailed",
                    error = %shutdown_err,
                );
            }
        }
        return Err(err);
    }

    let provider = views::register(builder, compiled.unwrap_or_default(), &limits)
        .with_resource(resource)
        .build();
    tracing::debug!(
        name: "Configurator.MeterProvider.Built",
        readers = config.readers.len(),
        views = config.views.len(),
    );
    Ok((provider, prometheus))
}

#[cfg(test)]
mod tests {
    use opentelemetry::{metrics::MeterProvider as _, KeyValue};
    use opentelemetry_sdk::metrics::InMemoryMetricExporter;

    use super::*;

    fn decode(text: &str) -> Result<MeterProvider, ConfigError> {
        MeterProvider::from_node(&serde_yaml::from_str(text).unwrap())
    }

    fn build_default(
        config: &MeterProvider,
    ) -> Result<(SdkMeterProvider, Vec<PrometheusReader>), ConfigError> {
        build(
            config,
            Resource::builder_empty().build(),
            SdkMeterProvider::builder(),
        )
    }

    #[test]
    fn test_cardinality_limit_bounds() {
        let err = decode("cardinality_limits:\n  counter: 0").unwrap_err();
        assert!(err.contains(&ConfigError::greater_than_zero("counter")));
    }

    #[test]
    fn test_for_kind_falls_back_to_default() {
        let limits = CardinalityLimits {
            default: Some(2000),
            histogram: Some(100),
            ..Default::default()
        };
        assert_eq!(limits.for_kind(InstrumentKind::Histogram), Some(100));
        assert_eq!(limits.for_kind(InstrumentKind::Gauge), Some(2000));
        assert_eq!(CardinalityLimits::default().for_kind(InstrumentKind::Gauge), None);
    }

    #[test]
    fn test_reader_and_view_errors_are_joined() {
        let config = decode(
            r#"
            readers:
              - {}
              - periodic:
                  exporter:
                    console:
                pull:
                  exporter:
                    prometheus/development:
            exemplar_filter: sometimes
            "#,
        )
        .unwrap();
        let err = build_default(&config).unwrap_err();
        assert_eq!(err.leaves().count(), 3);
        assert!(err.contains(&ConfigError::invalid("no valid metric reader")));
        assert!(err.contains(&ConfigError::invalid(
            "must not specify multiple metric reader type"
        )));
        assert!(err.contains(&ConfigError::invalid("unsupported exemplar filter \"sometimes\"")));
    }

    #[test]
    fn test_view_error() {
        let config = decode("views:\n  - stream:\n      name: renamed").unwrap();
        let err = build_default(&config).unwrap_err();
        assert!(err.contains(&ConfigError::invalid(
            "view_selector: empty selector not supporter"
        )));
    }

    #[test]
    fn test_failed_build_releases_pull_reader_port() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = decode(&format!(
            r#"
            readers:
              - pull:
                  exporter:
                    prometheus/development:
                      host: 127.0.0.1
                      port: {port}
            views:
              - stream:
                  name: renamed
            "#
        ))
        .unwrap();
        let err = build_default(&config).unwrap_err();
        assert!(err.contains(&ConfigError::invalid(
            "view_selector: empty selector not supporter"
        )));
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_exemplar_filter_values() {
        for filter in ["always_on", "always_off", "trace_based"] {
            assert!(check_exemplar_filter(Some(filter)).is_ok());
        }
        assert!(check_exemplar_filter(None).is_ok());
    }

    #[test]
    fn test_cardinality_limit_applied() {
        let exporter = InMemoryMetricExporter::default();
        let config = decode("cardinality_limits:\n  counter: 2").unwrap();
        let (provider, prometheus) = build(
            &config,
            Resource::builder_empty().build(),
            SdkMeterProvider::builder().with_periodic_exporter(exporter.clone()),
        )
        .unwrap();
        assert!(prometheus.is_empty());

        let counter = provider.meter("test").u64_counter("requests").build();
        for value in 0..10 {
            counter.add(1, &[KeyValue::new("id", value)]);
        }
        provider.force_flush().unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        let points = exported
            .iter()
            .flat_map(|rm| rm.scope_metrics())
            .flat_map(|sm| sm.metrics())
            .filter(|metric| metric.name() == "requests")
            .map(|metric| match metric.data() {
                opentelemetry_sdk::metrics::data::AggregatedMetrics::U64(
                    opentelemetry_sdk::metrics::data::MetricData::Sum(sum),
                ) => sum.data_points().count(),
                _ => 0,
            })
            .max()
            .unwrap_or_default();
        // one overflow point plus at most limit - 1 regular points
        assert!(points <= 2, "{points}");
        provider.shutdown().unwrap();
    }

    #[test]
    fn test_prometheus_reader_returned() {
        let config = decode(
            r#"
            readers:
              - pull:
                  exporter:
                    prometheus/development:
                      host: localhost
                      port: 0
            "#,
        )
        .unwrap();
        let (provider, prometheus) = build_default(&config).unwrap();
        assert_eq!(prometheus.len(), 1);
        provider.shutdown().unwrap();
    }
}
