//! Transport settings shared by the OTLP exporters of every signal.

use std::{collections::HashMap, fs, time::Duration};

use opentelemetry_otlp::{
    tonic_types::{
        metadata::MetadataMap,
        transport::{Certificate, ClientTlsConfig, Identity},
    },
    Compression, Protocol, WithExportConfig, WithHttpConfig, WithTonicConfig,
};
use percent_encoding::percent_decode_str;
use url::Url;

use crate::{
    common::NameStringValuePair,
    error::{BoxError, ConfigError},
    exporters::{blocking_client, OtlpGrpcExporter, OtlpHttpExporter, TlsConfig},
};

const CERTIFICATE_MARKER: &str = "-----BEGIN CERTIFICATE-----";
const PRIVATE_KEY_MARKER: &str = "PRIVATE KEY-----";

/// The telemetry signal an exporter sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    /// Path appended to OTLP/HTTP endpoints that do not carry one.
    pub(crate) fn path(self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
        }
    }
}

pub(crate) fn compression(value: Option<&str>) -> Result<Option<Compression>, ConfigError> {
    match value {
        None | Some("none") => Ok(None),
        Some("gzip") => Ok(Some(Compression::Gzip)),
        Some(other) => Err(ConfigError::invalid(format!(
            "unsupported compression {other:?}"
        ))),
    }
}

fn protocol(encoding: Option<&str>) -> Result<Protocol, ConfigError> {
    match encoding {
        None | Some("protobuf") => Ok(Protocol::HttpBinary),
        Some("json") => Ok(Protocol::HttpJson),
        Some(other) => Err(ConfigError::invalid(format!(
            "unsupported encoding {other:?}"
        ))),
    }
}

fn timeout(millis: Option<i64>) -> Option<Duration> {
    millis
        .filter(|millis| *millis > 0)
        .map(|millis| Duration::from_millis(millis as u64))
}

/// Merges `headers_list` and `headers`; explicit `headers` win on a
/// duplicate name.
pub(crate) fn headers(
    headers: &[NameStringValuePair],
    headers_list: Option<&str>,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut merged = HashMap::new();
    if let Some(list) = headers_list {
        merged.extend(parse_headers_list(list)?);
    }
    for header in headers {
        merged.insert(
            header.name.clone(),
            header.value.clone().unwrap_or_default(),
        );
    }
    Ok(merged)
}

/// Parses a W3C baggage formatted list such as `api-key=1234,tenant=a%20b`.
/// Member properties are dropped.
fn parse_headers_list(list: &str) -> Result<Vec<(String, String)>, ConfigError> {
    if list.trim().is_empty() {
        return Ok(Vec::new());
    }
    list.split(',')
        .map(|member| {
            let pair = member.split(';').next().unwrap_or_default();
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid_headers(format!("missing '=' in member {member:?}")))?;
            let key = key.trim();
            if key.is_empty() || !key.bytes().all(is_token_byte) {
                return Err(invalid_headers(format!("invalid key {key:?}")));
            }
            let value = percent_decode_str(value.trim())
                .decode_utf8()
                .map_err(|err| ConfigError::invalid_with("invalid headers_list", err))?;
            Ok((key.to_string(), value.into_owned()))
        })
        .collect()
}

fn invalid_headers(reason: String) -> ConfigError {
    ConfigError::invalid_with("invalid headers_list", reason)
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

/// Parses an endpoint, supplying `default_scheme` when it has none. Returns
/// the URL and whether the scheme was given explicitly.
fn parse_endpoint(raw: &str, default_scheme: &str) -> Result<(Url, bool), ConfigError> {
    let parsed = match Url::parse(raw) {
        Ok(url) if url.has_host() => Ok((url, true)),
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("{default_scheme}://{raw}")).map(|url| (url, false))
        }
        Err(err) => Err(err),
    };
    parsed.map_err(|err| ConfigError::invalid_with("endpoint parsing failed", err))
}

fn insecure(tls: Option<&TlsConfig>) -> bool {
    tls.and_then(|tls| tls.insecure).unwrap_or(false)
}

/// The full OTLP/HTTP URL for `signal`.
pub(crate) fn http_endpoint(
    raw: &str,
    tls: Option<&TlsConfig>,
    signal: Signal,
) -> Result<String, ConfigError> {
    let default_scheme = if insecure(tls) { "http" } else { "https" };
    let (mut url, _) = parse_endpoint(raw, default_scheme)?;
    if url.scheme() == "http" && tls.is_some_and(TlsConfig::has_material) {
        return Err(tls_error("tls configuration requires an https endpoint"));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(signal.path());
    }
    Ok(url.to_string())
}

/// A resolved gRPC target.
#[derive(Debug, PartialEq)]
pub(crate) struct GrpcTarget {
    pub(crate) endpoint: String,
    pub(crate) secure: bool,
}

/// Resolves the gRPC target. An `http` scheme, or `insecure` on an endpoint
/// without a scheme, selects plaintext. Paths are dropped.
pub(crate) fn grpc_target(raw: &str, tls: Option<&TlsConfig>) -> Result<GrpcTarget, ConfigError> {
    if raw.starts_with("unix:") {
        return Ok(GrpcTarget {
            endpoint: raw.to_string(),
            secure: false,
        });
    }
    let (url, explicit) = parse_endpoint(raw, "https")?;
    let plaintext = match url.scheme() {
        "http" => true,
        "https" => !explicit && insecure(tls),
        other => {
            return Err(ConfigError::invalid_with(
                "endpoint parsing failed",
                format!("unsupported scheme {other:?}"),
            ))
        }
    };
    let secure = !plaintext || tls.is_some_and(TlsConfig::has_material);
    let host = url.host_str().unwrap_or_default();
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let scheme = if secure { "https" } else { "http" };
    Ok(GrpcTarget {
        endpoint: format!("{scheme}://{authority}"),
        secure,
    })
}

fn tls_error(err: impl Into<BoxError>) -> ConfigError {
    ConfigError::invalid_with("tls configuration", err)
}

/// Reads a PEM file and checks that it holds a block ending in `marker`.
fn read_pem(path: &str, marker: &str) -> Result<Vec<u8>, ConfigError> {
    let pem = fs::read(path).map_err(|err| tls_error(format!("could not read {path}: {err}")))?;
    if !String::from_utf8_lossy(&pem).contains(marker) {
        return Err(tls_error(format!("{path} does not contain a PEM block")));
    }
    Ok(pem)
}

/// The client certificate and key paths, which must be given together.
fn client_pair(tls: &TlsConfig) -> Result<Option<(&str, &str)>, ConfigError> {
    match (tls.cert_file.as_deref(), tls.key_file.as_deref()) {
        (Some(cert), Some(key)) => Ok(Some((cert, key))),
        (None, None) => Ok(None),
        _ => Err(tls_error(
            "client certificate and key must be configured together",
        )),
    }
}

fn grpc_tls_config(tls: Option<&TlsConfig>) -> Result<ClientTlsConfig, ConfigError> {
    let Some(tls) = tls.filter(|tls| tls.has_material()) else {
        return Ok(ClientTlsConfig::new().with_native_roots());
    };
    let mut config = ClientTlsConfig::new();
    if let Some(ca) = tls.ca_file.as_deref() {
        config = config.ca_certificate(Certificate::from_pem(read_pem(ca, CERTIFICATE_MARKER)?));
    } else {
        config = config.with_native_roots();
    }
    if let Some((cert, key)) = client_pair(tls)? {
        config = config.identity(Identity::from_pem(
            read_pem(cert, CERTIFICATE_MARKER)?,
            read_pem(key, PRIVATE_KEY_MARKER)?,
        ));
    }
    Ok(config)
}

fn http_client(
    tls: &TlsConfig,
    timeout: Option<Duration>,
) -> Result<reqwest::blocking::Client, ConfigError> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(ca) = tls.ca_file.as_deref() {
        let certificate =
            reqwest::Certificate::from_pem(&read_pem(ca, CERTIFICATE_MARKER)?).map_err(tls_error)?;
        builder = builder.add_root_certificate(certificate);
    }
    if let Some((cert, key)) = client_pair(tls)? {
        let mut pem = read_pem(cert, CERTIFICATE_MARKER)?;
        pem.push(b'\n');
        pem.extend(read_pem(key, PRIVATE_KEY_MARKER)?);
        builder = builder.identity(reqwest::Identity::from_pem(&pem).map_err(tls_error)?);
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    blocking_client(builder).map_err(tls_error)
}

/// Applies an OTLP/HTTP exporter configuration to an exporter builder.
pub(crate) fn configure_http<B>(
    mut builder: B,
    config: &OtlpHttpExporter,
    signal: Signal,
) -> Result<B, ConfigError>
where
    B: WithExportConfig + WithHttpConfig,
{
    let tls = config.tls.as_ref();
    if let Some(endpoint) = config.endpoint.as_deref() {
        builder = builder.with_endpoint(http_endpoint(endpoint, tls, signal)?);
    }
    builder = builder.with_protocol(protocol(config.encoding.as_deref())?);

    let headers = headers(&config.headers, config.headers_list.as_deref())?;
    if !headers.is_empty() {
        builder = builder.with_headers(headers);
    }
    let timeout = timeout(config.timeout);
    if let Some(timeout) = timeout {
        builder = builder.with_timeout(timeout);
    }
    if let Some(compression) = compression(config.compression.as_deref())? {
        builder = builder.with_compression(compression);
    }
    if let Some(tls) = tls.filter(|tls| tls.has_material()) {
        builder = builder.with_http_client(http_client(tls, timeout)?);
    }
    Ok(builder)
}

/// Applies an OTLP/gRPC exporter configuration to an exporter builder.
pub(crate) fn configure_grpc<B>(mut builder: B, config: &OtlpGrpcExporter) -> Result<B, ConfigError>
where
    B: WithExportConfig + WithTonicConfig,
{
    let tls = config.tls.as_ref();
    if let Some(endpoint) = config.endpoint.as_deref() {
        let target = grpc_target(endpoint, tls)?;
        if target.secure {
            builder = builder.with_tls_config(grpc_tls_config(tls)?);
        }
        builder = builder.with_endpoint(target.endpoint);
    }

    let headers = headers(&config.headers, config.headers_list.as_deref())?;
    if !headers.is_empty() {
        builder = builder.with_metadata(metadata(headers)?);
    }
    if let Some(timeout) = timeout(config.timeout) {
        builder = builder.with_timeout(timeout);
    }
    if let Some(compression) = compression(config.compression.as_deref())? {
        builder = builder.with_compression(compression);
    }
    Ok(builder)
}

fn metadata(headers: HashMap<String, String>) -> Result<MetadataMap, ConfigError> {
    let mut map = http::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ConfigError::invalid_with("invalid headers", err))?;
        let value = http::HeaderValue::from_str(&value)
            .map_err(|err| ConfigError::invalid_with("invalid headers", err))?;
        map.insert(name, value);
    }
    Ok(MetadataMap::from_headers(map))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    const CERT_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn tls(ca: Option<&str>, insecure: Option<bool>) -> TlsConfig {
        TlsConfig {
            ca_file: ca.map(str::to_string),
            insecure,
            ..Default::default()
        }
    }

    #[rstest]
    #[case("http://localhost:4318", "http://localhost:4318/v1/traces")]
    #[case("http://localhost:4318/", "http://localhost:4318/v1/traces")]
    #[case("https://collector:4318/custom/path", "https://collector:4318/custom/path")]
    #[case("localhost:4318", "https://localhost:4318/v1/traces")]
    fn test_http_endpoint(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(http_endpoint(raw, None, Signal::Traces).unwrap(), expected);
    }

    #[test]
    fn test_http_endpoint_signal_paths() {
        let endpoint = "http://localhost:4318";
        assert!(http_endpoint(endpoint, None, Signal::Metrics)
            .unwrap()
            .ends_with("/v1/metrics"));
        assert!(http_endpoint(endpoint, None, Signal::Logs)
            .unwrap()
            .ends_with("/v1/logs"));
    }

    #[test]
    fn test_http_endpoint_insecure_without_scheme() {
        let tls = tls(None, Some(true));
        assert_eq!(
            http_endpoint("localhost:4318", Some(&tls), Signal::Logs).unwrap(),
            "http://localhost:4318/v1/logs"
        );
    }

    #[test]
    fn test_http_endpoint_rejects_tls_material_on_http() {
        let tls = tls(Some("ca.pem"), None);
        let err = http_endpoint("http://localhost:4318", Some(&tls), Signal::Traces).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("tls configuration")));
    }

    #[test]
    fn test_endpoint_parsing_failure() {
        let err = http_endpoint(" ", None, Signal::Traces).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("endpoint parsing failed")));
        let err = grpc_target(" ", None).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("endpoint parsing failed")));
    }

    #[rstest]
    #[case("http://localhost:4317", None, "http://localhost:4317", false)]
    #[case("https://localhost:4317/with/path", None, "https://localhost:4317", true)]
    #[case("localhost:4317", None, "https://localhost:4317", true)]
    #[case("localhost:4317", Some(true), "http://localhost:4317", false)]
    #[case("unix:collector.sock", None, "unix:collector.sock", false)]
    #[case("http://[::1]:4317", None, "http://[::1]:4317", false)]
    fn test_grpc_target(
        #[case] raw: &str,
        #[case] insecure: Option<bool>,
        #[case] endpoint: &str,
        #[case] secure: bool,
    ) {
        let tls = tls(None, insecure);
        assert_eq!(
            grpc_target(raw, Some(&tls)).unwrap(),
            GrpcTarget {
                endpoint: endpoint.to_string(),
                secure,
            }
        );
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some("none"), None)]
    #[case(Some("gzip"), Some(Compression::Gzip))]
    fn test_compression(#[case] value: Option<&str>, #[case] expected: Option<Compression>) {
        assert_eq!(compression(value).unwrap(), expected);
    }

    #[test]
    fn test_unsupported_compression() {
        let err = compression(Some("invalid")).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("unsupported compression \"invalid\"")));
    }

    #[test]
    fn test_headers_merge() {
        let merged = headers(
            &[NameStringValuePair::new("api-key", "explicit")],
            Some("api-key=from-list, tenant = a%20b;prop=1"),
        )
        .unwrap();
        assert_eq!(merged.get("api-key").map(String::as_str), Some("explicit"));
        assert_eq!(merged.get("tenant").map(String::as_str), Some("a b"));
    }

    #[rstest]
    #[case("===")]
    #[case("novalue")]
    #[case("a=b,")]
    #[case("bad key=1")]
    fn test_invalid_headers_list(#[case] list: &str) {
        let err = headers(&[], Some(list)).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("invalid headers_list")));
    }

    #[test]
    fn test_empty_headers_list() {
        assert!(headers(&[], Some("")).unwrap().is_empty());
    }

    #[test]
    fn test_read_pem() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(CERT_PEM.as_bytes()).unwrap();
        let path = cert.path().to_str().unwrap();
        assert!(read_pem(path, CERTIFICATE_MARKER).is_ok());

        let err = read_pem(path, PRIVATE_KEY_MARKER).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("tls configuration")));

        let err = read_pem("/does/not/exist.pem", CERTIFICATE_MARKER).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("tls configuration")));
    }

    #[test]
    fn test_client_pair_requires_both() {
        let tls = TlsConfig {
            cert_file: Some("cert.pem".into()),
            ..Default::default()
        };
        let err = client_pair(&tls).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("tls configuration")));
    }

    #[test]
    fn test_grpc_tls_missing_ca_file() {
        let tls = tls(Some("/does/not/exist.pem"), None);
        let err = grpc_tls_config(Some(&tls)).unwrap_err();
        assert!(err.contains(&ConfigError::invalid("tls configuration")));
    }
}
