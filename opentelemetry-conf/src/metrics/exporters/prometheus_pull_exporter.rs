//! # Prometheus metrics pull exporter module.
//!
//! [`PrometheusReader`] wraps a [`ManualReader`] and serves the collected
//! metrics in the Prometheus text format on `/metrics`. The HTTP server runs
//! on a dedicated thread driving a current-thread Tokio runtime and stops
//! when the reader is shut down or the last handle is dropped.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    convert::Infallible,
    fmt,
    net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs},
    sync::{Arc, Mutex, Weak},
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use http::{header::CONTENT_TYPE, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use opentelemetry::{KeyValue, Value as OtelValue};
use opentelemetry_sdk::{
    error::{OTelSdkError, OTelSdkResult},
    metrics::{
        data::{AggregatedMetrics, Gauge, Histogram, Metric, MetricData, ResourceMetrics, Sum},
        reader::MetricReader,
        InstrumentKind, ManualReader, Pipeline, Temporality,
    },
    Resource,
};
use prometheus::{
    proto::{LabelPair, MetricFamily, MetricType},
    Encoder, TextEncoder,
};
use tokio::sync::oneshot;

use crate::{
    common::AttributeFilter,
    error::ConfigError,
    metrics::exporters::PrometheusExporter,
};

const TARGET_INFO_NAME: &str = "target_info";
const TARGET_INFO_DESCRIPTION: &str = "Target metadata";
const SCOPE_NAME_LABEL: &str = "otel_scope_name";
const SCOPE_VERSION_LABEL: &str = "otel_scope_version";
const COUNTER_SUFFIX: &str = "_total";

/// How metric and label names are translated into Prometheus names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TranslationStrategy {
    #[default]
    UnderscoreEscapingWithSuffixes,
    UnderscoreEscapingWithoutSuffixes,
    NoUtf8EscapingWithSuffixes,
    NoTranslation,
}

impl TranslationStrategy {
    pub(crate) fn parse(value: Option<&str>) -> Result<Self, ConfigError> {
        match value {
            None | Some("UnderscoreEscapingWithSuffixes") => {
                Ok(TranslationStrategy::UnderscoreEscapingWithSuffixes)
            }
            Some("UnderscoreEscapingWithoutSuffixes") => {
                Ok(TranslationStrategy::UnderscoreEscapingWithoutSuffixes)
            }
            Some("NoUTF8EscapingWithSuffixes") => Ok(TranslationStrategy::NoUtf8EscapingWithSuffixes),
            Some("NoTranslation") => Ok(TranslationStrategy::NoTranslation),
            Some(_) => Err(ConfigError::invalid("translation strategy invalid")),
        }
    }

    fn escapes(self) -> bool {
        matches!(
            self,
            TranslationStrategy::UnderscoreEscapingWithSuffixes
                | TranslationStrategy::UnderscoreEscapingWithoutSuffixes
        )
    }

    fn suffixes(self) -> bool {
        matches!(
            self,
            TranslationStrategy::UnderscoreEscapingWithSuffixes
                | TranslationStrategy::NoUtf8EscapingWithSuffixes
        )
    }
}

#[derive(Debug)]
struct EncoderOptions {
    strategy: TranslationStrategy,
    without_scope_info: bool,
    without_target_info: bool,
    resource_labels: Option<AttributeFilter>,
}

#[derive(Default)]
struct Server {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(
                    name: "Configurator.Prometheus.ServerPanicked",
                    message = "the metrics server thread panicked",
                );
            }
        }
    }
}

struct Inner {
    reader: ManualReader,
    options: EncoderOptions,
    local_addr: SocketAddr,
    server: Mutex<Server>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(server) = self.server.get_mut() {
            if let Some(stop) = server.stop.take() {
                let _ = stop.send(());
            }
        }
    }
}

/// A pull metric reader exposing its metrics over HTTP for Prometheus.
///
/// Cloning yields another handle to the same reader; one handle is owned by
/// the meter provider and the others can be used to find the bound address.
#[derive(Clone)]
pub struct PrometheusReader {
    inner: Arc<Inner>,
}

impl fmt::Debug for PrometheusReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusReader")
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}

impl PrometheusReader {
    /// Binds the listener and starts the HTTP server.
    pub(crate) fn start(config: &PrometheusExporter) -> Result<Self, ConfigError> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| ConfigError::invalid("host must be specified"))?;
        let port = config
            .port
            .ok_or_else(|| ConfigError::invalid("port must be specified"))?;
        let port = u16::try_from(port)
            .map_err(|err| ConfigError::invalid_with("port out of range", err))?;
        let strategy = TranslationStrategy::parse(config.translation_strategy.as_deref())?;
        let resource_labels = config
            .with_resource_constant_labels
            .as_ref()
            .map(|labels| labels.filter())
            .transpose()?;

        let address = listen_address(host, port);
        let listener = address
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs
                    .next()
                    .ok_or_else(|| std::io::Error::other("no address resolved"))
            })
            .and_then(StdTcpListener::bind)
            .map_err(|err| {
                ConfigError::invalid_with(format!("binding prometheus listener {address}"), err)
            })?;
        let local_addr = listener
            .local_addr()
            .and_then(|addr| listener.set_nonblocking(true).map(|_| addr))
            .map_err(|err| ConfigError::invalid_with("binding prometheus listener", err))?;

        let inner = Arc::new(Inner {
            reader: ManualReader::builder().build(),
            options: EncoderOptions {
                strategy,
                without_scope_info: config.without_scope_info.unwrap_or(false),
                without_target_info: config.without_target_info.unwrap_or(false),
                resource_labels,
            },
            local_addr,
            server: Mutex::new(Server::default()),
        });

        let (stop, stopped) = oneshot::channel();
        let weak = Arc::downgrade(&inner);
        let thread = std::thread::Builder::new()
            .name("otel-prometheus".to_owned())
            .spawn(move || serve(listener, weak, stopped))
            .map_err(|err| ConfigError::invalid_with("starting prometheus server", err))?;
        if let Ok(mut server) = inner.server.lock() {
            server.stop = Some(stop);
            server.thread = Some(thread);
        }
        tracing::debug!(
            name: "Configurator.Prometheus.Listening",
            address = %local_addr,
        );
        Ok(PrometheusReader { inner })
    }

    /// The address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Collects the current metrics and encodes them in the text format.
    pub fn render(&self) -> Result<String, OTelSdkError> {
        render(&self.inner)
    }
}

/// IPv6 hosts are bracketed unless they already are.
fn listen_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn serve(listener: StdTcpListener, reader: Weak<Inner>, mut stopped: oneshot::Receiver<()>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(
                name: "Configurator.Prometheus.RuntimeFailed",
                error = %err,
            );
            return;
        }
    };
    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(
                    name: "Configurator.Prometheus.ListenFailed",
                    error = %err,
                );
                return;
            }
        };
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            tracing::debug!(
                                name: "Configurator.Prometheus.AcceptFailed",
                                error = %err,
                            );
                            continue;
                        }
                    };
                    let reader = reader.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |request| {
                            let reader = reader.clone();
                            async move { Ok::<_, Infallible>(respond(&reader, &request)) }
                        });
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            tracing::debug!(
                                name: "Configurator.Prometheus.ConnectionFailed",
                                error = %err,
                            );
                        }
                    });
                }
            }
        }
    });
}

fn respond(reader: &Weak<Inner>, request: &Request<Incoming>) -> Response<Full<Bytes>> {
    if request.method() != Method::GET || request.uri().path() != "/metrics" {
        return status(StatusCode::NOT_FOUND, "not found");
    }
    let Some(inner) = reader.upgrade() else {
        return status(StatusCode::SERVICE_UNAVAILABLE, "reader shut down");
    };
    match render(&inner) {
        Ok(body) => Response::builder()
            .header(CONTENT_TYPE, TextEncoder::new().format_type())
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| status(StatusCode::INTERNAL_SERVER_ERROR, "")),
        Err(err) => {
            tracing::warn!(
                name: "Configurator.Prometheus.ScrapeFailed",
                error = %err,
            );
            status(StatusCode::INTERNAL_SERVER_ERROR, "collection failed")
        }
    }
}

fn status(code: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = code;
    response
}

fn render(inner: &Inner) -> Result<String, OTelSdkError> {
    let mut metrics = ResourceMetrics::default();
    inner.reader.collect(&mut metrics)?;

    let options = &inner.options;
    let mut families = Families::default();
    let resource = metrics.resource();
    if !options.without_target_info && !resource.is_empty() {
        let attributes = resource.iter().map(|(key, value)| (key.as_str(), value));
        if let Some(family) =
            families.family(TARGET_INFO_NAME, TARGET_INFO_DESCRIPTION, MetricType::GAUGE)
        {
            family.push(gauge_metric(labels(options, attributes, &[]), 1.0));
        }
    }
    let constant_labels = resource_labels(options, resource);

    for scope_metrics in metrics.scope_metrics() {
        let mut extra = constant_labels.clone();
        if !options.without_scope_info {
            let scope = scope_metrics.scope();
            extra.push(label_pair(SCOPE_NAME_LABEL, scope.name()));
            if let Some(version) = scope.version() {
                extra.push(label_pair(SCOPE_VERSION_LABEL, version));
            }
        }
        for metric in scope_metrics.metrics() {
            match metric.data() {
                AggregatedMetrics::F64(data) => {
                    add_metric(&mut families, options, metric, data, &extra)
                }
                AggregatedMetrics::U64(data) => {
                    add_metric(&mut families, options, metric, data, &extra)
                }
                AggregatedMetrics::I64(data) => {
                    add_metric(&mut families, options, metric, data, &extra)
                }
            }
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families.into_proto(), &mut buffer)
        .map_err(|err| OTelSdkError::InternalFailure(err.to_string()))?;
    String::from_utf8(buffer).map_err(|err| OTelSdkError::InternalFailure(err.to_string()))
}

#[derive(Debug)]
struct Family {
    help: String,
    metric_type: MetricType,
    metrics: Vec<prometheus::proto::Metric>,
}

impl Family {
    fn push(&mut self, metric: prometheus::proto::Metric) {
        self.metrics.push(metric);
    }
}

/// Metric families keyed by name, so that points of instruments sharing a
/// name end up under a single header.
#[derive(Debug, Default)]
struct Families {
    by_name: BTreeMap<String, Family>,
}

impl Families {
    /// The family `name`, or `None` when it already exists with another
    /// type; the points of the conflicting instrument are dropped.
    fn family(&mut self, name: &str, help: &str, metric_type: MetricType) -> Option<&mut Family> {
        let family = self
            .by_name
            .entry(name.to_owned())
            .or_insert_with(|| Family {
                help: help.to_owned(),
                metric_type,
                metrics: Vec::new(),
            });
        if family.metric_type != metric_type {
            tracing::warn!(
                name: "Configurator.Prometheus.FamilyConflict",
                metric = name,
                message = "instrument type conflict, keeping the first definition",
            );
            return None;
        }
        Some(family)
    }

    /// Families without any point are left out; the encoder rejects them.
    fn into_proto(self) -> Vec<MetricFamily> {
        self.by_name
            .into_iter()
            .filter(|(_, family)| !family.metrics.is_empty())
            .map(|(name, family)| {
                let mut mf = MetricFamily::default();
                mf.set_name(name);
                mf.set_help(family.help);
                mf.set_field_type(family.metric_type);
                mf.set_metric(family.metrics);
                mf
            })
            .collect()
    }
}

trait Numeric: Copy {
    // lossy for large integers; the text format only carries floats
    fn as_f64(self) -> f64;
}

impl Numeric for f64 {
    fn as_f64(self) -> f64 {
        self
    }
}

impl Numeric for u64 {
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Numeric for i64 {
    fn as_f64(self) -> f64 {
        self as f64
    }
}

fn add_metric<T: Numeric>(
    families: &mut Families,
    options: &EncoderOptions,
    metric: &Metric,
    data: &MetricData<T>,
    extra: &[LabelPair],
) {
    let base = metric_name(options.strategy, metric.name(), metric.unit());
    match data {
        MetricData::Gauge(gauge) => add_gauge(families, options, &base, metric, gauge, extra),
        MetricData::Sum(sum) => add_sum(families, options, base, metric, sum, extra),
        MetricData::Histogram(histogram) => {
            add_histogram(families, options, &base, metric, histogram, extra)
        }
        MetricData::ExponentialHistogram(_) => {
            tracing::debug!(
                name: "Configurator.Prometheus.ExponentialHistogramSkipped",
                metric = metric.name(),
            );
        }
    }
}

fn add_gauge<T: Numeric>(
    families: &mut Families,
    options: &EncoderOptions,
    name: &str,
    metric: &Metric,
    gauge: &Gauge<T>,
    extra: &[LabelPair],
) {
    let Some(family) = families.family(name, metric.description(), MetricType::GAUGE) else {
        return;
    };
    for point in gauge.data_points() {
        let labels = labels(options, point.attributes().map(kv), extra);
        family.push(gauge_metric(labels, point.value().as_f64()));
    }
}

fn add_sum<T: Numeric>(
    families: &mut Families,
    options: &EncoderOptions,
    mut name: String,
    metric: &Metric,
    sum: &Sum<T>,
    extra: &[LabelPair],
) {
    let metric_type = if sum.is_monotonic() {
        if options.strategy.suffixes() && !name.ends_with(COUNTER_SUFFIX) {
            name.push_str(COUNTER_SUFFIX);
        }
        MetricType::COUNTER
    } else {
        MetricType::GAUGE
    };
    let Some(family) = families.family(&name, metric.description(), metric_type) else {
        return;
    };
    for point in sum.data_points() {
        let labels = labels(options, point.attributes().map(kv), extra);
        let value = point.value().as_f64();
        if sum.is_monotonic() {
            let mut counter = prometheus::proto::Counter::default();
            counter.set_value(value);
            let mut pm = prometheus::proto::Metric::default();
            pm.set_label(labels);
            pm.set_counter(counter);
            family.push(pm);
        } else {
            family.push(gauge_metric(labels, value));
        }
    }
}

fn add_histogram<T: Numeric>(
    families: &mut Families,
    options: &EncoderOptions,
    name: &str,
    metric: &Metric,
    histogram: &Histogram<T>,
    extra: &[LabelPair],
) {
    let Some(family) = families.family(name, metric.description(), MetricType::HISTOGRAM)
    else {
        return;
    };
    for point in histogram.data_points() {
        // The encoder adds the `+Inf` bucket from the sample count.
        let mut cumulative = 0;
        let buckets = point
            .bounds()
            .zip(point.bucket_counts())
            .map(|(bound, count)| {
                cumulative += count;
                let mut bucket = prometheus::proto::Bucket::default();
                bucket.set_upper_bound(bound);
                bucket.set_cumulative_count(cumulative);
                bucket
            })
            .collect();

        let mut proto = prometheus::proto::Histogram::default();
        proto.set_sample_sum(point.sum().as_f64());
        proto.set_sample_count(point.count());
        proto.set_bucket(buckets);
        let mut pm = prometheus::proto::Metric::default();
        pm.set_label(labels(options, point.attributes().map(kv), extra));
        pm.set_histogram(proto);
        family.push(pm);
    }
}

fn gauge_metric(labels: Vec<LabelPair>, value: f64) -> prometheus::proto::Metric {
    let mut gauge = prometheus::proto::Gauge::default();
    gauge.set_value(value);
    let mut pm = prometheus::proto::Metric::default();
    pm.set_label(labels);
    pm.set_gauge(gauge);
    pm
}

fn label_pair(name: impl Into<String>, value: impl Into<String>) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.into());
    pair.set_value(value.into());
    pair
}

fn kv(kv: &KeyValue) -> (&str, &OtelValue) {
    (kv.key.as_str(), &kv.value)
}

/// Label pairs sorted by key, followed by `extra`. Keys colliding after
/// escaping have their values joined with `;`.
fn labels<'a>(
    options: &EncoderOptions,
    attributes: impl Iterator<Item = (&'a str, &'a OtelValue)>,
    extra: &[LabelPair],
) -> Vec<LabelPair> {
    let mut merged = BTreeMap::<String, Vec<String>>::new();
    for (key, value) in attributes {
        merged
            .entry(label_name(options.strategy, key).into_owned())
            .or_default()
            .push(value.to_string());
    }
    let mut labels: Vec<LabelPair> = merged
        .into_iter()
        .map(|(key, mut values)| {
            values.sort_unstable();
            label_pair(key, values.join(";"))
        })
        .collect();
    labels.extend(extra.iter().cloned());
    labels
}

fn resource_labels(options: &EncoderOptions, resource: &Resource) -> Vec<LabelPair> {
    let Some(filter) = &options.resource_labels else {
        return Vec::new();
    };
    let selected = resource
        .iter()
        .filter(|(key, _)| filter.allows(key.as_str()))
        .map(|(key, value)| (key.as_str(), value));
    labels(options, selected, &[])
}

fn metric_name(strategy: TranslationStrategy, name: &str, unit: &str) -> String {
    let mut translated = if strategy.escapes() {
        escape_name(name, true)
    } else {
        name.to_owned()
    };
    if strategy.suffixes() {
        if let Some(suffix) = unit_suffix(unit) {
            if !translated.ends_with(suffix.as_ref()) {
                translated.push('_');
                translated.push_str(&suffix);
            }
        }
    }
    translated
}

fn label_name(strategy: TranslationStrategy, key: &str) -> Cow<'_, str> {
    if strategy.escapes() {
        Cow::Owned(escape_name(key, false))
    } else {
        Cow::Borrowed(key)
    }
}

/// Replaces characters outside `[a-zA-Z0-9_]` (plus `:` in metric names)
/// with `_`, prefixing names that start with a digit.
fn escape_name(raw: &str, allow_colon: bool) -> String {
    let mut escaped = String::with_capacity(raw.len() + 1);
    if raw.starts_with(|c: char| c.is_ascii_digit()) {
        escaped.push('_');
    }
    escaped.extend(raw.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
            c
        } else {
            '_'
        }
    }));
    escaped
}

fn unit_suffix(unit: &str) -> Option<Cow<'static, str>> {
    if unit.is_empty() {
        return None;
    }
    if let Some(suffix) = unit_name(unit) {
        return Some(Cow::Borrowed(suffix));
    }
    let (first, second) = unit.split_once('/')?;
    let per = per_unit_name(second)?;
    match unit_name(first) {
        Some(first) if first != "ratio" => Some(Cow::Owned(format!("{first}_per_{per}"))),
        _ => Some(Cow::Owned(format!("per_{per}"))),
    }
}

fn unit_name(unit: &str) -> Option<&'static str> {
    Some(match unit {
        "d" => "days",
        "h" => "hours",
        "min" => "minutes",
        "s" => "seconds",
        "ms" => "milliseconds",
        "us" => "microseconds",
        "ns" => "nanoseconds",
        "By" => "bytes",
        "KiBy" => "kibibytes",
        "MiBy" => "mebibytes",
        "GiBy" => "gibibytes",
        "TiBy" => "tibibytes",
        "KBy" => "kilobytes",
        "MBy" => "megabytes",
        "GBy" => "gigabytes",
        "TBy" => "terabytes",
        "m" => "meters",
        "V" => "volts",
        "A" => "amperes",
        "J" => "joules",
        "W" => "watts",
        "g" => "grams",
        "Cel" => "celsius",
        "Hz" => "hertz",
        "1" => "ratio",
        "%" => "percent",
        _ => return None,
    })
}

fn per_unit_name(unit: &str) -> Option<&'static str> {
    Some(match unit {
        "s" => "second",
        "m" => "minute",
        "h" => "hour",
        "d" => "day",
        "w" => "week",
        "mo" => "month",
        "y" => "year",
        _ => return None,
    })
}

impl MetricReader for PrometheusReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.inner.reader.register_pipeline(pipeline)
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.inner.reader.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.reader.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        let result = self.inner.reader.shutdown_with_timeout(timeout);
        match self.inner.server.lock() {
            Ok(mut server) => server.stop(),
            Err(_) => {
                return Err(OTelSdkError::InternalFailure(
                    "prometheus server lock poisoned".into(),
                ))
            }
        }
        result
    }

    /// Prometheus only understands cumulative temporality.
    fn temporality(&self, _kind: InstrumentKind) -> Temporality {
        Temporality::Cumulative
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use rstest::rstest;

    use super::*;
    use crate::common::IncludeExclude;

    fn config(text: &str) -> PrometheusExporter {
        use crate::decode::FromNode;
        PrometheusExporter::from_node(&serde_yaml::from_str(text).unwrap()).unwrap()
    }

    #[test]
    fn test_host_and_port_required() {
        let err = PrometheusReader::start(&config("{}")).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("host must be specified")));

        let err = PrometheusReader::start(&config("host: localhost")).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("port must be specified")));
    }

    #[test]
    fn test_invalid_translation_strategy() {
        let err = PrometheusReader::start(&config(
            "host: localhost\nport: 0\ntranslation_strategy: invalid-strategy",
        ))
        .unwrap_err();
        assert!(err.contains(&ConfigError::invalid("translation strategy invalid")));
    }

    #[rstest]
    #[case("localhost", 9464, "localhost:9464")]
    #[case("::1", 9464, "[::1]:9464")]
    #[case("[::1]", 9464, "[::1]:9464")]
    #[case("0.0.0.0", 0, "0.0.0.0:0")]
    fn test_listen_address(#[case] host: &str, #[case] port: u16, #[case] expected: &str) {
        assert_eq!(listen_address(host, port), expected);
    }

    #[rstest]
    #[case(TranslationStrategy::UnderscoreEscapingWithSuffixes, "http.server.duration", "ms", "http_server_duration_milliseconds")]
    #[case(TranslationStrategy::UnderscoreEscapingWithoutSuffixes, "http.server.duration", "ms", "http_server_duration")]
    #[case(TranslationStrategy::NoUtf8EscapingWithSuffixes, "http.server.duration", "ms", "http.server.duration_milliseconds")]
    #[case(TranslationStrategy::NoTranslation, "http.server.duration", "ms", "http.server.duration")]
    #[case(TranslationStrategy::UnderscoreEscapingWithSuffixes, "1st", "m/s", "_1st_meters_per_second")]
    #[case(TranslationStrategy::UnderscoreEscapingWithSuffixes, "load", "1/y", "load_per_year")]
    #[case(TranslationStrategy::UnderscoreEscapingWithSuffixes, "requests", "{request}", "requests")]
    fn test_metric_name(
        #[case] strategy: TranslationStrategy,
        #[case] name: &str,
        #[case] unit: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(metric_name(strategy, name, unit), expected);
    }

    fn options(resource_labels: Option<IncludeExclude>) -> EncoderOptions {
        EncoderOptions {
            strategy: TranslationStrategy::default(),
            without_scope_info: true,
            without_target_info: true,
            resource_labels: resource_labels.map(|labels| labels.filter().unwrap()),
        }
    }

    fn names(labels: &[LabelPair]) -> Vec<&str> {
        labels.iter().map(LabelPair::name).collect()
    }

    #[rstest]
    #[case(&["service.name"], &[], &["service_name"])]
    #[case(&[], &["host.name"], &["service_name"])]
    #[case(&[], &[], &["host_name", "service_name"])]
    fn test_resource_labels(
        #[case] included: &[&str],
        #[case] excluded: &[&str],
        #[case] expected: &[&str],
    ) {
        let resource = Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", "demo"),
                KeyValue::new("host.name", "box"),
            ])
            .build();
        let filtered = options(Some(IncludeExclude {
            included: included.iter().map(|key| key.to_string()).collect(),
            excluded: excluded.iter().map(|key| key.to_string()).collect(),
        }));
        assert_eq!(names(&resource_labels(&filtered, &resource)), expected);
        assert!(resource_labels(&options(None), &resource).is_empty());
    }

    #[test]
    fn test_families_keep_first_type() {
        let mut families = Families::default();
        families
            .family("jobs", "Jobs", MetricType::COUNTER)
            .unwrap()
            .push(gauge_metric(Vec::new(), 1.0));
        assert!(families.family("jobs", "", MetricType::GAUGE).is_none());
        assert!(families.family("idle", "", MetricType::GAUGE).is_some());

        let encoded = families.into_proto();
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0].name(), "jobs");
    }

    #[test]
    fn test_render_histogram() {
        let reader = PrometheusReader::start(&config(
            "host: 127.0.0.1\nport: 0\nwithout_scope_info: true\nwithout_target_info: true",
        ))
        .unwrap();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader.clone())
            .build();
        let histogram = provider
            .meter("test")
            .f64_histogram("latency")
            .with_unit("s")
            .with_boundaries(vec![1.0])
            .build();
        histogram.record(0.5, &[]);
        histogram.record(2.0, &[]);

        let text = reader.render().unwrap();
        assert!(text.contains("# TYPE latency_seconds histogram"), "{text}");
        assert!(text.contains("latency_seconds_bucket{le=\"1\"} 1"), "{text}");
        assert!(text.contains("latency_seconds_bucket{le=\"+Inf\"} 2"), "{text}");
        assert!(text.contains("latency_seconds_sum 2.5"), "{text}");
        assert!(text.contains("latency_seconds_count 2"), "{text}");
        provider.shutdown().unwrap();
    }

    #[test]
    fn test_render_and_serve() {
        let mut exporter = config("host: localhost\nport: 0\nwithout_scope_info: true");
        exporter.with_resource_constant_labels = Some(IncludeExclude {
            included: vec!["service.name".into()],
            excluded: vec![],
        });
        let reader = PrometheusReader::start(&exporter).unwrap();
        let provider = SdkMeterProvider::builder()
            .with_resource(
                Resource::builder_empty()
                    .with_attribute(KeyValue::new("service.name", "demo"))
                    .build(),
            )
            .with_reader(reader.clone())
            .build();

        let counter = provider.meter("test").u64_counter("requests").build();
        counter.add(2, &[KeyValue::new("http.method", "GET")]);

        let text = reader.render().unwrap();
        assert!(text.contains("# TYPE requests_total counter"), "{text}");
        assert!(
            text.contains("requests_total{http_method=\"GET\",service_name=\"demo\"} 2"),
            "{text}"
        );
        assert!(text.contains("target_info{service_name=\"demo\"} 1"), "{text}");
        assert!(!text.contains(SCOPE_NAME_LABEL), "{text}");

        let address = reader.local_addr();
        assert_ne!(address.port(), 0);
        provider.shutdown().unwrap();
        assert!(std::net::TcpStream::connect(address).is_err());
    }
}
