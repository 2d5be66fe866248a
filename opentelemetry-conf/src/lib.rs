//! # OpenTelemetry declarative configuration
//!
//! This crate builds tracer, meter and logger providers from a configuration
//! document following the OpenTelemetry configuration data model.
//!
//! ```no_run
//! use opentelemetry_conf::configure_telemetry_from_yaml;
//!
//! let providers = configure_telemetry_from_yaml(
//!     r#"
//!     file_format: "1.0"
//!     tracer_provider:
//!       processors:
//!         - batch:
//!             exporter:
//!               otlp_http:
//!                 endpoint: ${OTLP_ENDPOINT:-http://localhost:4318}
//!     "#,
//! )?;
//! providers.install_global();
//! // ...
//! providers.shutdown()?;
//! # Ok::<(), opentelemetry_conf::error::ConfigError>(())
//! ```
//!
//! Environment variable references (`${NAME}` and `${NAME:-default}`) are
//! substituted before decoding. Every validation error of a document is
//! reported at once through [`error::ConfigError::Joined`].

pub mod common;
pub mod decode;
pub mod env_provider;
pub mod error;
pub mod exporters;
pub mod logs;
pub mod metrics;
pub mod processor_config;
pub mod propagation;
pub mod resource;
pub mod telemetry_config;
pub mod traces;

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use opentelemetry::{
    global,
    propagation::{
        text_map_propagator::FieldIter, Extractor, Injector, TextMapCompositePropagator,
        TextMapPropagator,
    },
    Context,
};
use opentelemetry_sdk::{
    error::OTelSdkResult,
    logs::{LoggerProviderBuilder, SdkLoggerProvider},
    metrics::{MeterProviderBuilder, SdkMeterProvider},
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};

use crate::{
    error::{ConfigError, ErrorJoiner},
    metrics::exporters::PrometheusReader,
    telemetry_config::OpenTelemetryConfiguration,
};

/// Names a YAML configuration file that supersedes any configuration given
/// programmatically.
pub const CONFIG_FILE_ENV: &str = "OTEL_EXPERIMENTAL_CONFIG_FILE";

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type TracerOptions = Box<dyn FnOnce(TracerProviderBuilder) -> TracerProviderBuilder + Send>;
type MeterOptions = Box<dyn FnOnce(MeterProviderBuilder) -> MeterProviderBuilder + Send>;
type LoggerOptions = Box<dyn FnOnce(LoggerProviderBuilder) -> LoggerProviderBuilder + Send>;

/// Builds [`TelemetryProviders`] from a configuration.
///
/// Programmatic provider options are applied to each builder before the
/// configured processors, readers and resource, so the document wins where
/// both set the same thing.
#[derive(Default)]
pub struct Configurator {
    configuration: Option<OpenTelemetryConfiguration>,
    tracer_options: Vec<TracerOptions>,
    meter_options: Vec<MeterOptions>,
    logger_options: Vec<LoggerOptions>,
}

impl Configurator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configuration(mut self, configuration: OpenTelemetryConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Adds options applied to the tracer provider builder, for example an
    /// extra span processor.
    pub fn with_tracer_provider_options<F>(mut self, options: F) -> Self
    where
        F: FnOnce(TracerProviderBuilder) -> TracerProviderBuilder + Send + 'static,
    {
        self.tracer_options.push(Box::new(options));
        self
    }

    pub fn with_meter_provider_options<F>(mut self, options: F) -> Self
    where
        F: FnOnce(MeterProviderBuilder) -> MeterProviderBuilder + Send + 'static,
    {
        self.meter_options.push(Box::new(options));
        self
    }

    pub fn with_logger_provider_options<F>(mut self, options: F) -> Self
    where
        F: FnOnce(LoggerProviderBuilder) -> LoggerProviderBuilder + Send + 'static,
    {
        self.logger_options.push(Box::new(options));
        self
    }

    /// Builds the providers.
    ///
    /// When [`CONFIG_FILE_ENV`] is set, the file it names is used instead of
    /// the configuration given with [`Configurator::with_configuration`].
    /// Without any configuration, or when the document is disabled, the
    /// no-op providers are returned.
    ///
    /// # Errors
    ///
    /// Every decode and build failure is joined into one [`ConfigError`].
    /// Providers that were already built are shut down before the error is
    /// returned, so no partial pipeline is left running. Callers that want
    /// to keep going can fall back to [`TelemetryProviders::noop`].
    pub fn configure(mut self) -> Result<TelemetryProviders, ConfigError> {
        let configuration = match std::env::var_os(CONFIG_FILE_ENV) {
            Some(path) => {
                let yaml = std::fs::read_to_string(&path)
                    .map_err(|err| ConfigError::invalid_with(CONFIG_FILE_ENV, err))?;
                tracing::debug!(
                    name: "Configurator.ConfigFileLoaded",
                    path = %Path::new(&path).display(),
                );
                Some(OpenTelemetryConfiguration::from_yaml(&yaml)?)
            }
            None => self.configuration.take(),
        };
        match configuration {
            Some(configuration) => self.build(&configuration),
            None => Ok(TelemetryProviders::noop()),
        }
    }

    fn build(self, config: &OpenTelemetryConfiguration) -> Result<TelemetryProviders, ConfigError> {
        if config.disabled {
            tracing::debug!(
                name: "Configurator.Disabled",
                message = "configuration disabled, returning no-op providers",
            );
            return Ok(TelemetryProviders::noop());
        }

        let mut errors = ErrorJoiner::default();
        // Keep building with an empty resource so that the errors of every
        // provider are reported together.
        let resource = errors
            .collect(resource::build(config.resource.as_ref()))
            .unwrap_or_else(|| Resource::builder_empty().build());
        let propagator = errors.collect(propagation::build(config.propagator.as_ref()));

        let mut providers = TelemetryProviders::noop();
        if let Some(tracer_provider) = &config.tracer_provider {
            let builder = self
                .tracer_options
                .into_iter()
                .fold(SdkTracerProvider::builder(), |builder, options| options(builder));
            providers.tracer_provider = errors.collect(traces::build(
                tracer_provider,
                config.attribute_limits.as_ref(),
                resource.clone(),
                builder,
            ));
        }
        if let Some(meter_provider) = &config.meter_provider {
            let builder = self
                .meter_options
                .into_iter()
                .fold(SdkMeterProvider::builder(), |builder, options| options(builder));
            if let Some((provider, readers)) =
                errors.collect(metrics::build(meter_provider, resource.clone(), builder))
            {
                providers.meter_provider = Some(provider);
                providers.prometheus_readers = readers;
            }
        }
        if let Some(logger_provider) = &config.logger_provider {
            let builder = self
                .logger_options
                .into_iter()
                .fold(SdkLoggerProvider::builder(), |builder, options| options(builder));
            providers.logger_provider =
                errors.collect(logs::build(logger_provider, resource, builder));
        }

        if let Err(err) = errors.finish() {
            if let Err(shutdown_err) = providers.shutdown() {
                tracing::debug!(
                    name: "Configurator.CompensatingShutdownFailed",
                    error = %shutdown_err,
                );
            }
            return Err(err);
        }
        if let Some(propagator) = propagator {
            providers.propagator = Arc::new(propagator);
        }
        tracing::debug!(
            name: "Configurator.Configured",
            tracer_provider = providers.tracer_provider.is_some(),
            meter_provider = providers.meter_provider.is_some(),
            logger_provider = providers.logger_provider.is_some(),
        );
        Ok(providers)
    }
}

/// Decodes a YAML document and builds its providers.
pub fn configure_telemetry_from_yaml(yaml: &str) -> Result<TelemetryProviders, ConfigError> {
    Configurator::new()
        .with_configuration(OpenTelemetryConfiguration::from_yaml(yaml)?)
        .configure()
}

pub fn configure_telemetry_from_yaml_file(
    path: impl AsRef<Path>,
) -> Result<TelemetryProviders, ConfigError> {
    Configurator::new()
        .with_configuration(OpenTelemetryConfiguration::from_yaml_file(path)?)
        .configure()
}

pub fn configure_telemetry_from_json(json: &str) -> Result<TelemetryProviders, ConfigError> {
    Configurator::new()
        .with_configuration(OpenTelemetryConfiguration::from_json(json)?)
        .configure()
}

/// Builds the providers from [`CONFIG_FILE_ENV`] and installs them and the
/// propagator as the global ones.
pub fn init_from_env() -> Result<TelemetryProviders, ConfigError> {
    let providers = Configurator::new().configure()?;
    providers.install_global();
    Ok(providers)
}

/// Holds the configured telemetry providers.
///
/// An absent provider means the signal is not configured. Shutting down is
/// idempotent; only the first call reaches the providers.
pub struct TelemetryProviders {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
    propagator: Arc<TextMapCompositePropagator>,
    prometheus_readers: Vec<PrometheusReader>,
    is_shutdown: AtomicBool,
}

impl std::fmt::Debug for TelemetryProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryProviders")
            .field("tracer_provider", &self.tracer_provider.is_some())
            .field("meter_provider", &self.meter_provider.is_some())
            .field("logger_provider", &self.logger_provider.is_some())
            .field("prometheus_readers", &self.prometheus_readers)
            .finish()
    }
}

impl Default for TelemetryProviders {
    fn default() -> Self {
        Self::noop()
    }
}

impl TelemetryProviders {
    /// No providers and a propagator that propagates nothing.
    pub fn noop() -> Self {
        TelemetryProviders {
            tracer_provider: None,
            meter_provider: None,
            logger_provider: None,
            propagator: Arc::new(TextMapCompositePropagator::new(Vec::new())),
            prometheus_readers: Vec::new(),
            is_shutdown: AtomicBool::new(false),
        }
    }

    pub fn tracer_provider(&self) -> Option<&SdkTracerProvider> {
        self.tracer_provider.as_ref()
    }

    pub fn meter_provider(&self) -> Option<&SdkMeterProvider> {
        self.meter_provider.as_ref()
    }

    pub fn logger_provider(&self) -> Option<&SdkLoggerProvider> {
        self.logger_provider.as_ref()
    }

    pub fn propagator(&self) -> &TextMapCompositePropagator {
        &self.propagator
    }

    /// Handles to the Prometheus endpoints of the meter provider, in
    /// declaration order.
    pub fn prometheus_readers(&self) -> &[PrometheusReader] {
        &self.prometheus_readers
    }

    /// Installs the tracer provider, the meter provider and the propagator as
    /// the global ones. The API has no global logger provider; it is meant to
    /// be handed to a log appender.
    pub fn install_global(&self) {
        if let Some(tracer_provider) = &self.tracer_provider {
            global::set_tracer_provider(tracer_provider.clone());
        }
        if let Some(meter_provider) = &self.meter_provider {
            global::set_meter_provider(meter_provider.clone());
        }
        global::set_text_map_propagator(SharedPropagator(Arc::clone(&self.propagator)));
    }

    pub fn shutdown(&self) -> Result<(), ConfigError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Shuts every provider down concurrently and joins their errors.
    pub fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), ConfigError> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let results: Vec<(&'static str, OTelSdkResult)> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(3);
            if let Some(provider) = &self.tracer_provider {
                handles.push((
                    "tracer provider shutdown",
                    scope.spawn(move || provider.shutdown_with_timeout(timeout)),
                ));
            }
            if let Some(provider) = &self.meter_provider {
                handles.push((
                    "meter provider shutdown",
                    scope.spawn(move || provider.shutdown_with_timeout(timeout)),
                ));
            }
            if let Some(provider) = &self.logger_provider {
                handles.push((
                    "logger provider shutdown",
                    scope.spawn(move || provider.shutdown_with_timeout(timeout)),
                ));
            }
            handles
                .into_iter()
                .map(|(identifier, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(opentelemetry_sdk::error::OTelSdkError::InternalFailure(
                            "shutdown panicked".into(),
                        ))
                    });
                    (identifier, result)
                })
                .collect()
        });

        let mut errors = ErrorJoiner::default();
        for (identifier, result) in results {
            if let Err(err) = result {
                errors.push(ConfigError::invalid_with(identifier, err));
            }
        }
        errors.finish()
    }
}

/// Lets the global propagator share the composite owned by
/// [`TelemetryProviders`].
#[derive(Debug)]
struct SharedPropagator(Arc<TextMapCompositePropagator>);

impl TextMapPropagator for SharedPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        self.0.inject_context(cx, injector)
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.0.extract_with_context(cx, extractor)
    }

    fn fields(&self) -> FieldIter<'_> {
        self.0.fields()
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::{metrics::MeterProvider as _, Key};
    use opentelemetry_sdk::metrics::InMemoryMetricExporter;

    use super::*;

    #[test]
    fn test_no_configuration_is_noop() {
        temp_env::with_var_unset(CONFIG_FILE_ENV, || {
            let providers = Configurator::new().configure().unwrap();
            assert!(providers.tracer_provider().is_none());
            assert!(providers.meter_provider().is_none());
            assert!(providers.logger_provider().is_none());
            assert_eq!(providers.propagator().fields().count(), 0);
            assert!(providers.shutdown().is_ok());
        });
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut config = OpenTelemetryConfiguration::new("1.0");
        config.disabled = true;
        config.tracer_provider = Some(traces::TracerProvider::default());
        let providers = Configurator::new()
            .with_configuration(config)
            .build_for_test()
            .unwrap();
        assert!(providers.tracer_provider().is_none());
        assert!(providers.shutdown().is_ok());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let config = OpenTelemetryConfiguration::from_yaml(
            "file_format: \"1.0\"\ntracer_provider:\n  processors: []",
        )
        .unwrap();
        let providers = Configurator::new()
            .with_configuration(config)
            .build_for_test()
            .unwrap();
        assert!(providers.tracer_provider().is_some());
        assert!(providers.shutdown().is_ok());
        assert!(providers.shutdown().is_ok());
    }

    #[test]
    fn test_programmatic_options_applied_first() {
        let exporter = InMemoryMetricExporter::default();
        let config = OpenTelemetryConfiguration::from_yaml(
            r#"
            file_format: "1.0"
            resource:
              attributes:
                - name: service.name
                  value: from-config
            meter_provider:
              readers:
                - periodic:
                    exporter:
                      console:
            "#,
        )
        .unwrap();
        let in_memory = exporter.clone();
        let providers = Configurator::new()
            .with_configuration(config)
            .with_meter_provider_options(move |builder| {
                builder.with_periodic_exporter(in_memory).with_resource(
                    Resource::builder_empty()
                        .with_service_name("from-options")
                        .build(),
                )
            })
            .build_for_test()
            .unwrap();

        let meter_provider = providers.meter_provider().unwrap();
        meter_provider
            .meter("test")
            .u64_counter("requests")
            .build()
            .add(1, &[]);
        meter_provider.force_flush().unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        let service_name = exported
            .last()
            .and_then(|rm| rm.resource().get(&Key::from_static_str("service.name")))
            .map(|value| value.to_string());
        assert_eq!(service_name.as_deref(), Some("from-config"));
        providers.shutdown().unwrap();
    }

    #[test]
    fn test_errors_from_every_provider_are_joined() {
        let config = OpenTelemetryConfiguration::from_yaml(
            r#"
            file_format: "1.0"
            propagator:
              composite_list: tracecontext,unknown
            tracer_provider:
              processors:
                - {}
            meter_provider:
              readers:
                - {}
            logger_provider:
              processors:
                - simple:
                    exporter: {}
            "#,
        )
        .unwrap();
        let err = Configurator::new()
            .with_configuration(config)
            .build_for_test()
            .unwrap_err();
        assert_eq!(err.leaves().count(), 4);
        assert!(err.contains(&ConfigError::invalid("unknown propagator")));
        assert!(err.contains(&ConfigError::invalid("no valid metric reader")));
        assert!(err.contains(&ConfigError::invalid("no valid log exporter")));
    }

    impl Configurator {
        /// Builds from the programmatic configuration regardless of the
        /// environment.
        fn build_for_test(mut self) -> Result<TelemetryProviders, ConfigError> {
            let config = self.configuration.take().unwrap();
            self.build(&config)
        }
    }
}
