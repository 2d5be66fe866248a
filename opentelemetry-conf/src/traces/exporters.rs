//! # Span exporter module
//!
//! Span exporters are not object safe, so each configured exporter is built
//! and handed to the provider builder in the same step.

use std::time::Duration;

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SpanExporter as SdkSpanExporter, TracerProviderBuilder,
};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    exporters::{
        blocking_client, build_error,
        otlp::{configure_grpc, configure_http, Signal},
        select_one, ConsoleExporter, OtlpFileExporter, OtlpGrpcExporter, OtlpHttpExporter,
        ZipkinSpanExporter,
    },
    processor_config::{BatchSettings, ProcessorOwner},
};

/// The exporter of a span processor; exactly one variant is expected.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanExporter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleExporter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_http: Option<OtlpHttpExporter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_grpc: Option<OtlpGrpcExporter>,
    #[serde(rename = "otlp_file/development", skip_serializing_if = "Option::is_none")]
    pub otlp_file_development: Option<OtlpFileExporter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zipkin: Option<ZipkinSpanExporter>,
}

impl FromNode for SpanExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("SpanExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = SpanExporter {
            console: errors.or_default(fields.variant("console")),
            otlp_http: errors.or_default(fields.variant("otlp_http")),
            otlp_grpc: errors.or_default(fields.variant("otlp_grpc")),
            otlp_file_development: errors.or_default(fields.variant("otlp_file/development")),
            zipkin: errors.or_default(fields.variant("zipkin")),
        };
        errors.finish()?;
        Ok(value)
    }
}

impl ProcessorOwner for SpanExporter {
    const BATCH: &'static str = "BatchSpanProcessor";
    const SIMPLE: &'static str = "SimpleSpanProcessor";
    const PROCESSOR: &'static str = "SpanProcessor";
}

enum Selected<'a> {
    Console,
    OtlpHttp(&'a OtlpHttpExporter),
    OtlpGrpc(&'a OtlpGrpcExporter),
    Zipkin(&'a ZipkinSpanExporter),
}

impl SpanExporter {
    fn selected(&self) -> Result<Selected<'_>, ConfigError> {
        select_one(
            self.otlp_file_development.is_some(),
            [
                self.console.as_ref().map(|_| Selected::Console),
                self.otlp_http.as_ref().map(Selected::OtlpHttp),
                self.otlp_grpc.as_ref().map(Selected::OtlpGrpc),
                self.zipkin.as_ref().map(Selected::Zipkin),
            ],
            "no valid span exporter",
        )
    }

    /// Builds the exporter and registers it with `builder`, batched when
    /// `batch` holds settings.
    pub(crate) fn register(
        &self,
        builder: TracerProviderBuilder,
        batch: Option<BatchSettings>,
    ) -> Result<TracerProviderBuilder, ConfigError> {
        let builder = match self.selected()? {
            Selected::Console => register(
                builder,
                opentelemetry_stdout::SpanExporter::default(),
                batch,
            ),
            Selected::OtlpHttp(config) => {
                let exporter = configure_http(
                    opentelemetry_otlp::SpanExporter::builder().with_http(),
                    config,
                    Signal::Traces,
                )?
                .build()
                .map_err(|err| build_error("otlp_http", err))?;
                register(builder, exporter, batch)
            }
            Selected::OtlpGrpc(config) => {
                let exporter =
                    configure_grpc(opentelemetry_otlp::SpanExporter::builder().with_tonic(), config)?
                        .build()
                        .map_err(|err| build_error("otlp_grpc", err))?;
                register(builder, exporter, batch)
            }
            Selected::Zipkin(config) => register(builder, zipkin_exporter(config)?, batch),
        };
        Ok(builder)
    }
}

fn zipkin_exporter(
    config: &ZipkinSpanExporter,
) -> Result<opentelemetry_zipkin::ZipkinExporter, ConfigError> {
    url::Url::parse(&config.endpoint)
        .map_err(|err| ConfigError::invalid_with("endpoint parsing failed", err))?;

    let mut client = reqwest::blocking::Client::builder();
    if let Some(timeout) = config.timeout.filter(|timeout| *timeout > 0) {
        client = client.timeout(Duration::from_millis(timeout as u64));
    }
    let client = blocking_client(client).map_err(|err| build_error("zipkin", err))?;

    opentelemetry_zipkin::ZipkinExporter::builder()
        .with_collector_endpoint(config.endpoint.clone())
        .with_http_client(client)
        .build()
        .map_err(|err| build_error("zipkin", err))
}

fn register<E>(
    builder: TracerProviderBuilder,
    exporter: E,
    batch: Option<BatchSettings>,
) -> TracerProviderBuilder
where
    E: SdkSpanExporter + 'static,
{
    let Some(settings) = batch else {
        return builder.with_simple_exporter(exporter);
    };
    let mut config = BatchConfigBuilder::default();
    if let Some(max_queue_size) = settings.max_queue_size {
        config = config.with_max_queue_size(max_queue_size);
    }
    if let Some(max_export_batch_size) = settings.max_export_batch_size {
        config = config.with_max_export_batch_size(max_export_batch_size);
    }
    if let Some(scheduled_delay) = settings.scheduled_delay {
        config = config.with_scheduled_delay(scheduled_delay);
    }
    if let Some(max_export_timeout) = settings.max_export_timeout {
        config = config.with_max_export_timeout(max_export_timeout);
    }
    builder.with_span_processor(
        BatchSpanProcessor::builder(exporter)
            .with_batch_config(config.build())
            .build(),
    )
}
