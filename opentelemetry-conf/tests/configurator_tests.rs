use std::{error::Error, net::SocketAddr, path::PathBuf};

use http_body_util::{BodyExt, Empty};
use hyper::{body::Bytes, StatusCode};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use opentelemetry::{
    global,
    metrics::MeterProvider as _,
    propagation::TextMapPropagator as _,
    trace::{Tracer as _, TracerProvider as _},
    KeyValue,
};
use opentelemetry_conf::{
    configure_telemetry_from_json, configure_telemetry_from_yaml,
    configure_telemetry_from_yaml_file,
    error::{ConfigError, ErrorKind},
    telemetry_config::OpenTelemetryConfiguration,
    Configurator,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

async fn scrape(addr: SocketAddr, path: &str) -> Result<(StatusCode, String), Box<dyn Error>> {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let uri: hyper::Uri = format!("http://{addr}{path}").parse()?;
    let response = client.get(uri).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8(body.to_vec())?))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_configuration() -> Result<(), Box<dyn Error>> {
    let providers = configure_telemetry_from_yaml_file(fixture("full.yaml"))?;

    let tracer = providers
        .tracer_provider()
        .ok_or("tracer provider missing")?
        .tracer("configurator-tests");
    tracer.in_span("checkout", |_cx| {});
    assert!(providers.logger_provider().is_some());

    let fields: Vec<&str> = providers.propagator().fields().collect();
    assert!(fields.contains(&"traceparent"));
    assert!(fields.contains(&"baggage"));
    assert!(fields.contains(&"x-b3-traceid"));

    let meter_provider = providers.meter_provider().ok_or("meter provider missing")?;
    meter_provider
        .meter("configurator-tests")
        .u64_counter("requests")
        .build()
        .add(3, &[KeyValue::new("route", "/cart")]);

    let readers = providers.prometheus_readers();
    assert_eq!(readers.len(), 1);
    let (status, body) = scrape(readers[0].local_addr(), "/metrics").await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("requests_total{"), "{body}");
    assert!(body.contains(r#"route="/cart""#), "{body}");
    assert!(body.contains(r#"service_name="checkout""#), "{body}");
    assert!(body.contains("target_info{"), "{body}");
    assert!(body.contains(r#"team="payments core""#), "{body}");

    let (status, _) = scrape(readers[0].local_addr(), "/other").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    providers.shutdown()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prometheus_on_ipv6_loopback() -> Result<(), Box<dyn Error>> {
    if std::net::TcpListener::bind("[::1]:0").is_err() {
        // no IPv6 loopback in this environment
        return Ok(());
    }
    let providers = configure_telemetry_from_yaml(
        r#"
        file_format: "1.0"
        meter_provider:
          readers:
            - pull:
                exporter:
                  prometheus/development:
                    host: "::1"
                    port: 0
        "#,
    )?;
    let addr = providers.prometheus_readers()[0].local_addr();
    assert!(addr.is_ipv6());
    assert!(addr.port() > 0);
    assert!(addr.to_string().starts_with("[::1]:"));

    let (status, _) = scrape(addr, "/metrics").await?;
    assert_eq!(status, StatusCode::OK);

    providers.shutdown()?;
    assert!(std::net::TcpStream::connect(addr).is_err());
    Ok(())
}

#[test]
fn test_prometheus_readers_in_declaration_order() -> Result<(), Box<dyn Error>> {
    let providers = configure_telemetry_from_yaml(
        r#"
        file_format: "1.0"
        meter_provider:
          readers:
            - pull:
                exporter:
                  prometheus/development:
                    host: 127.0.0.1
                    port: 0
                    without_target_info: true
            - periodic:
                exporter:
                  console:
            - pull:
                exporter:
                  prometheus/development:
                    host: 127.0.0.1
                    port: 0
                    translation_strategy: NoTranslation
        "#,
    )?;
    let readers = providers.prometheus_readers();
    assert_eq!(readers.len(), 2);
    assert_ne!(readers[0].local_addr(), readers[1].local_addr());

    providers
        .meter_provider()
        .ok_or("meter provider missing")?
        .meter("configurator-tests")
        .u64_counter("jobs.done")
        .build()
        .add(1, &[]);
    let first = readers[0].render()?;
    let second = readers[1].render()?;
    assert!(!first.contains("target_info"), "{first}");
    assert!(first.contains("jobs_done_total"), "{first}");
    assert!(second.contains("jobs.done"), "{second}");

    providers.shutdown()?;
    Ok(())
}

#[test]
fn test_errors_are_aggregated() {
    let err = configure_telemetry_from_yaml_file(fixture("invalid.yaml")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Joined);
    assert_eq!(err.leaves().count(), 5, "{err}");
    assert!(err.contains(&ConfigError::invalid("must not specify multiple exporters")));
    assert!(err.contains(&ConfigError::invalid("unsupported compression \"brotli\"")));
    assert!(err.contains(&ConfigError::invalid(
        "must not specify multiple metric reader type"
    )));
    assert!(err.contains(&ConfigError::invalid(
        "view_selector: empty selector not supporter"
    )));
    assert!(err.contains(&ConfigError::invalid("otlp_file/development")));
}

#[test]
fn test_batch_size_bound() {
    let err = configure_telemetry_from_yaml_file(fixture("bounds.yaml")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Bound);
    assert!(err.contains(&ConfigError::greater_than_zero("max_export_batch_size")));
}

#[test]
fn test_multiple_exporters_rejected() {
    let err = configure_telemetry_from_yaml(
        r#"
        file_format: "1.0"
        tracer_provider:
          processors:
            - simple:
                exporter:
                  console:
                  zipkin:
                    endpoint: http://localhost:9411/api/v2/spans
        "#,
    )
    .unwrap_err();
    assert!(err.contains(&ConfigError::invalid("must not specify multiple exporters")));
}

#[test]
fn test_composite_list_propagator() -> Result<(), Box<dyn Error>> {
    let providers = configure_telemetry_from_yaml(
        r#"
        file_format: "1.0"
        propagator:
          composite_list: tracecontext,baggage,b3
        "#,
    )?;
    let mut fields: Vec<&str> = providers.propagator().fields().collect();
    fields.sort_unstable();
    assert_eq!(
        fields,
        [
            "baggage",
            "traceparent",
            "tracestate",
            "x-b3-flags",
            "x-b3-sampled",
            "x-b3-spanid",
            "x-b3-traceid",
        ]
    );
    assert!(providers.tracer_provider().is_none());
    assert!(providers.meter_provider().is_none());

    providers.install_global();
    let global_fields = global::get_text_map_propagator(|propagator| propagator.fields().count());
    assert_eq!(global_fields, 7);
    providers.shutdown()?;
    Ok(())
}

#[test]
fn test_json_configuration() -> Result<(), Box<dyn Error>> {
    let json = std::fs::read_to_string(fixture("full.json"))?;
    let providers = configure_telemetry_from_json(&json)?;
    assert!(providers.tracer_provider().is_none());
    assert!(providers.meter_provider().is_some());
    assert!(providers.logger_provider().is_some());
    assert_eq!(providers.propagator().fields().count(), 7);
    providers.shutdown()?;
    Ok(())
}

#[test]
fn test_programmatic_span_processor() -> Result<(), Box<dyn Error>> {
    let exporter = opentelemetry_sdk::trace::InMemorySpanExporter::default();
    let config = OpenTelemetryConfiguration::from_yaml(
        r#"
        file_format: "1.0"
        tracer_provider:
          sampler:
            always_on:
          processors:
            - simple:
                exporter:
                  console:
        "#,
    )?;
    let in_memory = exporter.clone();
    let providers = Configurator::new()
        .with_configuration(config)
        .with_tracer_provider_options(move |builder| builder.with_simple_exporter(in_memory))
        .configure()?;

    providers
        .tracer_provider()
        .ok_or("tracer provider missing")?
        .tracer("configurator-tests")
        .in_span("work", |_cx| {});
    let spans = exporter.get_finished_spans()?;
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "work");

    providers.shutdown()?;
    providers.shutdown()?;
    Ok(())
}

#[test]
fn test_unknown_propagator_builds_nothing() {
    let err = configure_telemetry_from_yaml(
        r#"
        file_format: "1.0"
        propagator:
          composite:
            - tracecontext:
            - w3c:
        meter_provider:
          readers:
            - pull:
                exporter:
                  prometheus/development:
                    host: 127.0.0.1
                    port: 0
        "#,
    )
    .unwrap_err();
    assert!(err.contains(&ConfigError::invalid("unknown propagator")));
}

#[test]
fn test_round_trip_fixture() -> Result<(), Box<dyn Error>> {
    let original = OpenTelemetryConfiguration::from_yaml_file(fixture("full.yaml"))?;
    let decoded = OpenTelemetryConfiguration::from_yaml(&original.to_yaml()?)?;
    assert_eq!(decoded, original);
    Ok(())
}
