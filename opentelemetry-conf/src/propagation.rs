//! # Propagator configuration module
//!
//! Composes the text-map propagator declared by the `propagator` node.

mod ottrace;

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use serde::Serialize;
use serde_yaml::{Mapping, Value};

pub use ottrace::OtTracePropagator;

use crate::{
    common::EmptyConfig,
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
};

/// The `propagator` node.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Propagator {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub composite: Vec<TextMapPropagatorConfig>,
    /// Comma separated propagator names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_list: Option<String>,
}

impl FromNode for Propagator {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("Propagator", node)?;
        let mut errors = ErrorJoiner::default();
        let value = Propagator {
            composite: errors.or_default(fields.list("composite")),
            composite_list: errors.or_default(fields.scalar("composite_list")),
        };
        errors.finish()?;
        Ok(value)
    }
}

const KNOWN_ENTRIES: [&str; 6] = ["tracecontext", "baggage", "b3", "b3multi", "jaeger", "ottrace"];

/// One entry of a `composite` propagator list. Keys other than the known
/// propagators are kept in `additional_properties` and resolved by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TextMapPropagatorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracecontext: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baggage: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b3: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b3multi: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jaeger: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ottrace: Option<EmptyConfig>,
    #[serde(flatten)]
    pub additional_properties: Mapping,
}

impl FromNode for TextMapPropagatorConfig {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("TextMapPropagator", node)?;
        let mut errors = ErrorJoiner::default();
        let value = TextMapPropagatorConfig {
            tracecontext: errors.or_default(fields.variant("tracecontext")),
            baggage: errors.or_default(fields.variant("baggage")),
            b3: errors.or_default(fields.variant("b3")),
            b3multi: errors.or_default(fields.variant("b3multi")),
            jaeger: errors.or_default(fields.variant("jaeger")),
            ottrace: errors.or_default(fields.variant("ottrace")),
            additional_properties: fields.remaining(&KNOWN_ENTRIES),
        };
        errors.finish()?;
        Ok(value)
    }
}

impl TextMapPropagatorConfig {
    /// Names of the selected propagators, known entries first.
    fn names(&self) -> Vec<String> {
        let known = [
            ("tracecontext", self.tracecontext.is_some()),
            ("baggage", self.baggage.is_some()),
            ("b3", self.b3.is_some()),
            ("b3multi", self.b3multi.is_some()),
            ("jaeger", self.jaeger.is_some()),
            ("ottrace", self.ottrace.is_some()),
        ];
        known
            .into_iter()
            .filter(|(_, selected)| *selected)
            .map(|(name, _)| name.to_string())
            .chain(
                self.additional_properties
                    .keys()
                    .map(|key| key.as_str().map(str::to_string).unwrap_or_default()),
            )
            .collect()
    }
}

type BoxedPropagator = Box<dyn TextMapPropagator + Send + Sync>;

fn by_name(name: &str) -> Result<Option<BoxedPropagator>, ConfigError> {
    let propagator: BoxedPropagator = match name {
        "tracecontext" => Box::new(TraceContextPropagator::new()),
        "baggage" => Box::new(BaggagePropagator::new()),
        "b3" => Box::new(opentelemetry_zipkin::Propagator::new()),
        "b3multi" => Box::new(opentelemetry_zipkin::Propagator::with_encoding(
            opentelemetry_zipkin::B3Encoding::MultipleHeader,
        )),
        "jaeger" => Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
        "ottrace" => Box::new(OtTracePropagator::new()),
        "xray" => Box::<opentelemetry_aws::trace::XrayPropagator>::default(),
        "none" => return Ok(None),
        other => {
            return Err(ConfigError::invalid_with(
                "unknown propagator",
                format!("{other:?}"),
            ))
        }
    };
    Ok(Some(propagator))
}

/// Resolves the ordered propagator names of `config`.
///
/// A `composite_list` naming at least one propagator wins over `composite`;
/// blank entries are skipped. An empty selection falls back to
/// `tracecontext` and `baggage`.
fn names(config: &Propagator) -> Vec<String> {
    let mut names: Vec<String> = config
        .composite_list
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        names = config
            .composite
            .iter()
            .flat_map(TextMapPropagatorConfig::names)
            .collect();
    }
    if names.is_empty() {
        names = vec!["tracecontext".to_string(), "baggage".to_string()];
    }
    let mut seen = std::collections::HashSet::new();
    names.retain(|name| seen.insert(name.clone()));
    names
}

/// Builds the composite propagator. Without a `propagator` node the
/// composite is empty and propagates nothing.
pub(crate) fn build(config: Option<&Propagator>) -> Result<TextMapCompositePropagator, ConfigError> {
    let Some(config) = config else {
        return Ok(TextMapCompositePropagator::new(Vec::new()));
    };

    let names = names(config);
    let mut errors = ErrorJoiner::default();
    let propagators: Vec<BoxedPropagator> = names
        .iter()
        .filter_map(|name| errors.collect(by_name(name)).flatten())
        .collect();
    errors.finish()?;

    tracing::debug!(
        name: "Configurator.Propagator.Built",
        propagators = names.join(","),
    );
    Ok(TextMapCompositePropagator::new(propagators))
}
