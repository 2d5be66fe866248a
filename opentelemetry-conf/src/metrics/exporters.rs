//! # Metrics Exporters module.
//!
//! Push exporters are wrapped in a periodic reader; the only pull exporter is
//! the Prometheus HTTP endpoint, which acts as its own reader.

pub mod prometheus_pull_exporter;

use std::time::Duration;

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{
    exporter::PushMetricExporter as SdkPushMetricExporter, MeterProviderBuilder, PeriodicReader,
};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    common::IncludeExclude,
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    exporters::{
        build_error,
        otlp::{configure_grpc, configure_http, Signal},
        select_one, ConsoleExporter, MetricExporterConfig, OtlpFileExporter, OtlpGrpcExporter,
        OtlpHttpExporter,
    },
};

pub use prometheus_pull_exporter::{PrometheusReader, TranslationStrategy};

/// The exporter of a periodic metric reader; exactly one variant is expected.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PushMetricExporter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<MetricExporterConfig<ConsoleExporter>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_http: Option<MetricExporterConfig<OtlpHttpExporter>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_grpc: Option<MetricExporterConfig<OtlpGrpcExporter>>,
    #[serde(rename = "otlp_file/development", skip_serializing_if = "Option::is_none")]
    pub otlp_file_development: Option<MetricExporterConfig<OtlpFileExporter>>,
}

impl FromNode for PushMetricExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("PushMetricExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = PushMetricExporter {
            console: errors.or_default(fields.variant("console")),
            otlp_http: errors.or_default(fields.variant("otlp_http")),
            otlp_grpc: errors.or_default(fields.variant("otlp_grpc")),
            otlp_file_development: errors.or_default(fields.variant("otlp_file/development")),
        };
        errors.finish()?;
        Ok(value)
    }
}

enum Selected<'a> {
    Console(&'a MetricExporterConfig<ConsoleExporter>),
    OtlpHttp(&'a MetricExporterConfig<OtlpHttpExporter>),
    OtlpGrpc(&'a MetricExporterConfig<OtlpGrpcExporter>),
}

impl PushMetricExporter {
    fn selected(&self) -> Result<Selected<'_>, ConfigError> {
        select_one(
            self.otlp_file_development.is_some(),
            [
                self.console.as_ref().map(Selected::Console),
                self.otlp_http.as_ref().map(Selected::OtlpHttp),
                self.otlp_grpc.as_ref().map(Selected::OtlpGrpc),
            ],
            "no valid metric exporter",
        )
    }

    /// Builds the exporter and registers it behind a periodic reader.
    pub(crate) fn register_periodic(
        &self,
        builder: MeterProviderBuilder,
        interval: Option<Duration>,
    ) -> Result<MeterProviderBuilder, ConfigError> {
        let builder = match self.selected()? {
            Selected::Console(config) => {
                let temporality = config.temporality()?;
                config.check_default_histogram_aggregation()?;
                let exporter = opentelemetry_stdout::MetricExporter::builder()
                    .with_temporality(temporality)
                    .build();
                register(builder, exporter, interval)
            }
            Selected::OtlpHttp(config) => {
                let temporality = config.temporality()?;
                config.check_default_histogram_aggregation()?;
                let exporter = configure_http(
                    opentelemetry_otlp::MetricExporter::builder()
                        .with_http()
                        .with_temporality(temporality),
                    &config.exporter,
                    Signal::Metrics,
                )?
                .build()
                .map_err(|err| build_error("otlp_http", err))?;
                register(builder, exporter, interval)
            }
            Selected::OtlpGrpc(config) => {
                let temporality = config.temporality()?;
                config.check_default_histogram_aggregation()?;
                let exporter = configure_grpc(
                    opentelemetry_otlp::MetricExporter::builder()
                        .with_tonic()
                        .with_temporality(temporality),
                    &config.exporter,
                )?
                .build()
                .map_err(|err| build_error("otlp_grpc", err))?;
                register(builder, exporter, interval)
            }
        };
        Ok(builder)
    }
}

fn register<E>(
    builder: MeterProviderBuilder,
    exporter: E,
    interval: Option<Duration>,
) -> MeterProviderBuilder
where
    E: SdkPushMetricExporter,
{
    let mut reader = PeriodicReader::builder(exporter);
    if let Some(interval) = interval {
        reader = reader.with_interval(interval);
    }
    builder.with_reader(reader.build())
}

/// The exporter of a pull metric reader.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PullMetricExporter {
    #[serde(rename = "prometheus/development", skip_serializing_if = "Option::is_none")]
    pub prometheus_development: Option<PrometheusExporter>,
}

impl FromNode for PullMetricExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("PullMetricExporter", node)?;
        Ok(PullMetricExporter {
            prometheus_development: fields.variant("prometheus/development")?,
        })
    }
}

impl PullMetricExporter {
    /// Starts the Prometheus endpoint and registers it as a reader. The
    /// returned handle shares the reader registered with `builder`.
    pub(crate) fn register(
        &self,
        builder: MeterProviderBuilder,
    ) -> Result<(MeterProviderBuilder, PrometheusReader), ConfigError> {
        let config = self
            .prometheus_development
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("no valid metric exporter"))?;
        let reader = PrometheusReader::start(config)?;
        Ok((builder.with_reader(reader.clone()), reader))
    }
}

/// Serves metrics to Prometheus scrapers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PrometheusExporter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub without_scope_info: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub without_target_info: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_resource_constant_labels: Option<IncludeExclude>,
}

impl FromNode for PrometheusExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("PrometheusMetricExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = PrometheusExporter {
            host: errors.or_default(fields.scalar("host")),
            port: errors.or_default(fields.scalar("port")),
            without_scope_info: errors.or_default(fields.scalar("without_scope_info")),
            without_target_info: errors.or_default(fields.scalar("without_target_info")),
            translation_strategy: errors.or_default(fields.scalar("translation_strategy")),
            with_resource_constant_labels: errors
                .or_default(fields.node("with_resource_constant_labels")),
        };
        errors.finish()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    use super::*;

    fn push(text: &str) -> PushMetricExporter {
        PushMetricExporter::from_node(&serde_yaml::from_str(text).unwrap()).unwrap()
    }

    fn register_push(text: &str) -> Result<SdkMeterProvider, ConfigError> {
        push(text)
            .register_periodic(SdkMeterProvider::builder(), Some(Duration::from_secs(60)))
            .map(MeterProviderBuilder::build)
    }

    #[test]
    fn test_push_exporter_selection() {
        let err = register_push("{}").unwrap_err();
        assert!(err.contains(&ConfigError::invalid("no valid metric exporter")));

        let err = register_push("console:\notlp_http:\n  endpoint: http://localhost:4318")
            .unwrap_err();
        assert!(err.contains(&ConfigError::invalid("must not specify multiple exporters")));

        let err = register_push("otlp_file/development:\n  output_stream: stdout").unwrap_err();
        assert!(err.contains(&ConfigError::invalid("otlp_file/development")));
    }

    #[test]
    fn test_console_temporality() {
        let provider = register_push("console:\n  temporality_preference: delta").unwrap();
        assert!(provider.shutdown().is_ok());

        let err = register_push("console:\n  temporality_preference: sometimes").unwrap_err();
        assert!(err.contains(&ConfigError::invalid(
            "unsupported temporality preference \"sometimes\""
        )));
    }

    #[test]
    fn test_invalid_default_histogram_aggregation() {
        let err = register_push(
            "otlp_http:\n  endpoint: http://localhost:4318\n  default_histogram_aggregation: median",
        )
        .unwrap_err();
        assert!(err.contains(&ConfigError::invalid(
            "unsupported default histogram aggregation \"median\""
        )));
    }

    #[test]
    fn test_otlp_http_metric_exporter() {
        let provider = register_push(
            r#"
            otlp_http:
              endpoint: http://localhost:4318
              compression: gzip
              temporality_preference: low_memory
              default_histogram_aggregation: base2_exponential_bucket_histogram
            "#,
        )
        .unwrap();
        drop(provider);
    }

    #[tokio::test]
    async fn test_otlp_grpc_metric_exporter() {
        let provider = register_push("otlp_grpc:\n  endpoint: http://localhost:4317").unwrap();
        drop(provider);

        let err = register_push("otlp_grpc:\n  endpoint: localhost:4317\n  compression: zstd")
            .unwrap_err();
        assert!(err.contains(&ConfigError::invalid("unsupported compression \"zstd\"")));
    }

    #[test]
    fn test_pull_exporter_requires_prometheus() {
        let exporter =
            PullMetricExporter::from_node(&serde_yaml::from_str("{}").unwrap()).unwrap();
        let err = exporter.register(SdkMeterProvider::builder()).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("no valid metric exporter")));
    }

    #[test]
    fn test_prometheus_decode() {
        let exporter = PullMetricExporter::from_node(
            &serde_yaml::from_str(
                r#"
                prometheus/development:
                  host: localhost
                  port: 9464
                  without_target_info: true
                  translation_strategy: NoTranslation
                  with_resource_constant_labels:
                    included: [service.name]
                "#,
            )
            .unwrap(),
        )
        .unwrap();
        let prometheus = exporter.prometheus_development.unwrap();
        assert_eq!(prometheus.port, Some(9464));
        assert_eq!(prometheus.without_target_info, Some(true));
        assert_eq!(
            prometheus.with_resource_constant_labels.unwrap().included,
            vec!["service.name".to_owned()]
        );
    }
}
