//! # Exporter configuration module
//!
//! Configuration nodes for the exporters shared by the tracer, meter and
//! logger providers. The signal-specific exporter unions live next to each
//! provider; transport settings for OTLP are resolved in [`otlp`].

pub(crate) mod otlp;

use opentelemetry_sdk::metrics::Temporality;
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    common::NameStringValuePair,
    decode::{Fields, FromNode},
    error::{BoxError, ConfigError, ErrorJoiner},
};

/// Writes telemetry to standard output.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConsoleExporter {}

impl FromNode for ConsoleExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        Fields::of("ConsoleExporter", node)?;
        Ok(ConsoleExporter {})
    }
}

/// OTLP JSON lines written to a file or stream. Recognized so that it can be
/// reported as unsupported.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OtlpFileExporter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_stream: Option<String>,
}

impl FromNode for OtlpFileExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("ExperimentalOTLPFileExporter", node)?;
        Ok(OtlpFileExporter {
            output_stream: fields.scalar("output_stream")?,
        })
    }
}

/// TLS material used by OTLP exporters. Paths point at PEM files.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TlsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Plaintext for gRPC endpoints given without a scheme.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
}

impl TlsConfig {
    pub fn has_material(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some() || self.key_file.is_some()
    }
}

impl FromNode for TlsConfig {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("TlsConfig", node)?;
        let mut errors = ErrorJoiner::default();
        let value = TlsConfig {
            ca_file: errors.or_default(fields.scalar("ca_file")),
            cert_file: errors.or_default(fields.scalar("cert_file")),
            key_file: errors.or_default(fields.scalar("key_file")),
            insecure: errors.or_default(fields.scalar("insecure")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// OTLP over HTTP.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OtlpHttpExporter {
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<NameStringValuePair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_list: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// `protobuf` or `json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl FromNode for OtlpHttpExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("OTLPHttpExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = OtlpHttpExporter {
            endpoint: Some(errors.or_default(fields.required_scalar("endpoint"))),
            tls: errors.or_default(fields.node("tls")),
            headers: errors.or_default(fields.list("headers")),
            headers_list: errors.or_default(fields.scalar("headers_list")),
            compression: errors.or_default(fields.scalar("compression")),
            timeout: errors.or_default(fields.non_negative("timeout")),
            encoding: errors.or_default(fields.scalar("encoding")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// OTLP over gRPC.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OtlpGrpcExporter {
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<NameStringValuePair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_list: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

impl FromNode for OtlpGrpcExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("OTLPGrpcExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = OtlpGrpcExporter {
            endpoint: Some(errors.or_default(fields.required_scalar("endpoint"))),
            tls: errors.or_default(fields.node("tls")),
            headers: errors.or_default(fields.list("headers")),
            headers_list: errors.or_default(fields.scalar("headers_list")),
            compression: errors.or_default(fields.scalar("compression")),
            timeout: errors.or_default(fields.non_negative("timeout")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// A push metric exporter together with its metric-only options.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricExporterConfig<E> {
    #[serde(flatten)]
    pub exporter: E,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporality_preference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_histogram_aggregation: Option<String>,
}

impl<E: FromNode> FromNode for MetricExporterConfig<E> {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let exporter = E::from_node(node)?;
        let fields = Fields::of("PushMetricExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = MetricExporterConfig {
            exporter,
            temporality_preference: errors.or_default(fields.scalar("temporality_preference")),
            default_histogram_aggregation: errors
                .or_default(fields.scalar("default_histogram_aggregation")),
        };
        errors.finish()?;
        Ok(value)
    }
}

impl<E> MetricExporterConfig<E> {
    pub fn new(exporter: E) -> Self {
        MetricExporterConfig {
            exporter,
            temporality_preference: None,
            default_histogram_aggregation: None,
        }
    }

    pub(crate) fn temporality(&self) -> Result<Temporality, ConfigError> {
        match self.temporality_preference.as_deref() {
            None | Some("cumulative") => Ok(Temporality::Cumulative),
            Some("delta") => Ok(Temporality::Delta),
            Some("low_memory") => Ok(Temporality::LowMemory),
            Some(other) => Err(ConfigError::invalid(format!(
                "unsupported temporality preference {other:?}"
            ))),
        }
    }

    /// The SDK picks histogram aggregations per view rather than per
    /// exporter, so the value is only validated.
    pub(crate) fn check_default_histogram_aggregation(&self) -> Result<(), ConfigError> {
        match self.default_histogram_aggregation.as_deref() {
            None | Some("explicit_bucket_histogram") => Ok(()),
            Some("base2_exponential_bucket_histogram") => {
                tracing::debug!(
                    name: "Configurator.MetricExporter.DefaultHistogramAggregationIgnored",
                    aggregation = "base2_exponential_bucket_histogram",
                );
                Ok(())
            }
            Some(other) => Err(ConfigError::invalid(format!(
                "unsupported default histogram aggregation {other:?}"
            ))),
        }
    }
}

/// Zipkin JSON over HTTP.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ZipkinSpanExporter {
    pub endpoint: String,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

impl FromNode for ZipkinSpanExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("ZipkinSpanExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = ZipkinSpanExporter {
            endpoint: errors.or_default(fields.required_scalar("endpoint")),
            timeout: errors.or_default(fields.non_negative("timeout")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Maps an exporter build failure.
pub(crate) fn build_error(exporter: &str, err: impl Into<BoxError>) -> ConfigError {
    ConfigError::invalid_with(format!("could not build {exporter} exporter"), err)
}

/// Builds a blocking HTTP client on a scratch thread. The client owns a
/// runtime, which cannot be created from a thread already driving one.
pub(crate) fn blocking_client(
    builder: reqwest::blocking::ClientBuilder,
) -> Result<reqwest::blocking::Client, BoxError> {
    std::thread::spawn(move || builder.build())
        .join()
        .map_err(|_| BoxError::from("http client construction panicked"))?
        .map_err(Into::into)
}

/// Picks the single configured exporter variant.
///
/// `otlp_file/development` is rejected before anything else is checked.
pub(crate) fn select_one<T>(
    otlp_file: bool,
    candidates: impl IntoIterator<Item = Option<T>>,
    missing: &'static str,
) -> Result<T, ConfigError> {
    if otlp_file {
        return Err(ConfigError::invalid("otlp_file/development"));
    }
    let mut selected = candidates.into_iter().flatten();
    match (selected.next(), selected.next()) {
        (Some(exporter), None) => Ok(exporter),
        (Some(_), Some(_)) => Err(ConfigError::invalid("must not specify multiple exporters")),
        (None, _) => Err(ConfigError::invalid(missing)),
    }
}
