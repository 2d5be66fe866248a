//! # Log exporter module
//!
//! Builds the configured log record exporter and registers it with the
//! logger provider builder.

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::{
    BatchConfigBuilder, BatchLogProcessor, LogExporter as SdkLogExporter, LoggerProviderBuilder,
};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    exporters::{
        build_error,
        otlp::{configure_grpc, configure_http, Signal},
        select_one, ConsoleExporter, OtlpFileExporter, OtlpGrpcExporter, OtlpHttpExporter,
    },
    processor_config::{BatchSettings, ProcessorOwner},
};

/// The exporter of a log record processor; exactly one variant is expected.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LogRecordExporter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleExporter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_http: Option<OtlpHttpExporter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_grpc: Option<OtlpGrpcExporter>,
    #[serde(rename = "otlp_file/development", skip_serializing_if = "Option::is_none")]
    pub otlp_file_development: Option<OtlpFileExporter>,
}

impl FromNode for LogRecordExporter {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("LogRecordExporter", node)?;
        let mut errors = ErrorJoiner::default();
        let value = LogRecordExporter {
            console: errors.or_default(fields.variant("console")),
            otlp_http: errors.or_default(fields.variant("otlp_http")),
            otlp_grpc: errors.or_default(fields.variant("otlp_grpc")),
            otlp_file_development: errors.or_default(fields.variant("otlp_file/development")),
        };
        errors.finish()?;
        Ok(value)
    }
}

impl ProcessorOwner for LogRecordExporter {
    const BATCH: &'static str = "BatchLogRecordProcessor";
    const SIMPLE: &'static str = "SimpleLogRecordProcessor";
    const PROCESSOR: &'static str = "LogRecordProcessor";
}

enum Selected<'a> {
    Console,
    OtlpHttp(&'a OtlpHttpExporter),
    OtlpGrpc(&'a OtlpGrpcExporter),
}

impl LogRecordExporter {
    fn selected(&self) -> Result<Selected<'_>, ConfigError> {
        select_one(
            self.otlp_file_development.is_some(),
            [
                self.console.as_ref().map(|_| Selected::Console),
                self.otlp_http.as_ref().map(Selected::OtlpHttp),
                self.otlp_grpc.as_ref().map(Selected::OtlpGrpc),
            ],
            "no valid log exporter",
        )
    }

    pub(crate) fn register(
        &self,
        builder: LoggerProviderBuilder,
        batch: Option<BatchSettings>,
    ) -> Result<LoggerProviderBuilder, ConfigError> {
        let builder = match self.selected()? {
            Selected::Console => register(
                builder,
                opentelemetry_stdout::LogExporter::default(),
                batch,
            ),
            Selected::OtlpHttp(config) => {
                let exporter = configure_http(
                    opentelemetry_otlp::LogExporter::builder().with_http(),
                    config,
                    Signal::Logs,
                )?
                .build()
                .map_err(|err| build_error("otlp_http", err))?;
                register(builder, exporter, batch)
            }
            Selected::OtlpGrpc(config) => {
                let exporter =
                    configure_grpc(opentelemetry_otlp::LogExporter::builder().with_tonic(), config)?
                        .build()
                        .map_err(|err| build_error("otlp_grpc", err))?;
                register(builder, exporter, batch)
            }
        };
        Ok(builder)
    }
}

fn register<E>(
    builder: LoggerProviderBuilder,
    exporter: E,
    batch: Option<BatchSettings>,
) -> LoggerProviderBuilder
where
    E: SdkLogExporter + 'static,
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
    builder.with_log_processor(
        BatchLogProcessor::builder(exporter)
            .with_batch_config(config.build())
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use opentelemetry_sdk::logs::SdkLoggerProvider;

    use super::*;

    fn register_one(text: &str) -> Result<SdkLoggerProvider, ConfigError> {
        LogRecordExporter::from_node(&serde_yaml::from_str(text).unwrap())
            .unwrap()
            .register(SdkLoggerProvider::builder(), None)
            .map(LoggerProviderBuilder::build)
    }

    #[test]
    fn test_exporter_selection() {
        let err = register_one("console:\notlp_grpc:\n  endpoint: http://localhost:4317")
            .unwrap_err();
        assert!(err.contains(&ConfigError::invalid("must not specify multiple exporters")));

        let err = register_one("{}").unwrap_err();
        assert!(err.contains(&ConfigError::invalid("no valid log exporter")));

        let err = register_one("otlp_file/development:").unwrap_err();
        assert!(err.contains(&ConfigError::invalid("otlp_file/development")));
    }

    #[test]
    fn test_otlp_http_endpoint_error() {
        let err = register_one("otlp_http:\n  endpoint: \" \"").unwrap_err();
        assert!(err.contains(&ConfigError::invalid("endpoint parsing failed")));
    }

    #[test]
    fn test_otlp_http_json_exporter() {
        let provider =
            register_one("otlp_http:\n  endpoint: http://localhost:4318\n  encoding: json")
                .unwrap();
        drop(provider);
    }

    #[test]
    fn test_console_exporter() {
        let provider = register_one("console: {}").unwrap();
        assert!(provider.shutdown().is_ok());
    }
}
