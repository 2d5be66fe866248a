//! # Metric views
//!
//! A configured view selects instruments by exact match on any selector field
//! that is present and rewrites the resulting stream.

use std::sync::Arc;

use opentelemetry::{InstrumentationScope, Key};
use opentelemetry_sdk::metrics::{
    Aggregation as SdkAggregation, Instrument, InstrumentKind, MeterProviderBuilder, Stream,
};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    common::{EmptyConfig, IncludeExclude},
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
    metrics::CardinalityLimits,
};

const INVALID_INSTRUMENT_TYPE: &str = "view_selector: instrument_type: invalid value";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct View {
    pub selector: ViewSelector,
    pub stream: ViewStream,
}

impl FromNode for View {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("View", node)?;
        let mut errors = ErrorJoiner::default();
        let value = View {
            selector: errors.or_default(fields.node("selector")).unwrap_or_default(),
            stream: errors.or_default(fields.node("stream")).unwrap_or_default(),
        };
        errors.finish()?;
        Ok(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ViewSelector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_schema_url: Option<String>,
}

impl FromNode for ViewSelector {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("ViewSelector", node)?;
        let mut errors = ErrorJoiner::default();
        let instrument_type: Option<String> = errors.or_default(fields.scalar("instrument_type"));
        if let Some(instrument_type) = &instrument_type {
            errors.collect(instrument_kind(instrument_type));
        }
        let value = ViewSelector {
            instrument_name: errors.or_default(fields.scalar("instrument_name")),
            instrument_type,
            unit: errors.or_default(fields.scalar("unit")),
            meter_name: errors.or_default(fields.scalar("meter_name")),
            meter_version: errors.or_default(fields.scalar("meter_version")),
            meter_schema_url: errors.or_default(fields.scalar("meter_schema_url")),
        };
        errors.finish()?;
        Ok(value)
    }
}

impl ViewSelector {
    fn is_empty(&self) -> bool {
        self.instrument_name.is_none()
            && self.instrument_type.is_none()
            && self.unit.is_none()
            && self.meter_name.is_none()
            && self.meter_version.is_none()
            && self.meter_schema_url.is_none()
    }
}

/// Maps a configured instrument type onto the SDK's instrument kind.
pub fn instrument_kind(instrument_type: &str) -> Result<InstrumentKind, ConfigError> {
    Ok(match instrument_type {
        "counter" => InstrumentKind::Counter,
        "up_down_counter" => InstrumentKind::UpDownCounter,
        "histogram" => InstrumentKind::Histogram,
        "observable_counter" => InstrumentKind::ObservableCounter,
        "observable_up_down_counter" => InstrumentKind::ObservableUpDownCounter,
        "observable_gauge" => InstrumentKind::ObservableGauge,
        "gauge" => InstrumentKind::Gauge,
        _ => return Err(ConfigError::invalid(INVALID_INSTRUMENT_TYPE)),
    })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ViewStream {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_keys: Option<IncludeExclude>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_cardinality_limit: Option<i64>,
}

impl FromNode for ViewStream {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("ViewStream", node)?;
        let mut errors = ErrorJoiner::default();
        let value = ViewStream {
            name: errors.or_default(fields.scalar("name")),
            description: errors.or_default(fields.scalar("description")),
            attribute_keys: errors.or_default(fields.node("attribute_keys")),
            aggregation: errors.or_default(fields.node("aggregation")),
            aggregation_cardinality_limit: errors
                .or_default(fields.positive("aggregation_cardinality_limit")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// The stream aggregation. When several variants are present the first one
/// in declaration order is used.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Aggregation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_value: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit_bucket_histogram: Option<ExplicitBucketHistogramAggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base2_exponential_bucket_histogram: Option<Base2ExponentialBucketHistogramAggregation>,
}

impl FromNode for Aggregation {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("Aggregation", node)?;
        let mut errors = ErrorJoiner::default();
        let value = Aggregation {
            default: errors.or_default(fields.variant("default")),
            drop: errors.or_default(fields.variant("drop")),
            last_value: errors.or_default(fields.variant("last_value")),
            sum: errors.or_default(fields.variant("sum")),
            explicit_bucket_histogram: errors
                .or_default(fields.variant("explicit_bucket_histogram")),
            base2_exponential_bucket_histogram: errors
                .or_default(fields.variant("base2_exponential_bucket_histogram")),
        };
        errors.finish()?;
        Ok(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExplicitBucketHistogramAggregation {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub boundaries: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_min_max: Option<bool>,
}

impl FromNode for ExplicitBucketHistogramAggregation {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("ExplicitBucketHistogramAggregation", node)?;
        let mut errors = ErrorJoiner::default();
        let value = ExplicitBucketHistogramAggregation {
            boundaries: errors.or_default(fields.scalar("boundaries")).unwrap_or_default(),
            record_min_max: errors.or_default(fields.scalar("record_min_max")),
        };
        errors.finish()?;
        Ok(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Base2ExponentialBucketHistogramAggregation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_scale: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_min_max: Option<bool>,
}

impl FromNode for Base2ExponentialBucketHistogramAggregation {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("Base2ExponentialBucketHistogramAggregation", node)?;
        let mut errors = ErrorJoiner::default();
        let value = Base2ExponentialBucketHistogramAggregation {
            max_size: errors.or_default(fields.positive("max_size")),
            max_scale: errors.or_default(fields.scalar("max_scale")),
            record_min_max: errors.or_default(fields.scalar("record_min_max")),
        };
        errors.finish()?;
        Ok(value)
    }
}

const DEFAULT_MAX_SIZE: u32 = 160;
const DEFAULT_MAX_SCALE: i8 = 20;
const MIN_SCALE: i64 = -10;

impl Aggregation {
    /// `None` keeps the aggregation the reader picks for the instrument kind.
    fn to_sdk(&self) -> Result<Option<SdkAggregation>, ConfigError> {
        if self.default.is_some() {
            return Ok(None);
        }
        if self.drop.is_some() {
            return Ok(Some(SdkAggregation::Drop));
        }
        if self.last_value.is_some() {
            return Ok(Some(SdkAggregation::LastValue));
        }
        if self.sum.is_some() {
            return Ok(Some(SdkAggregation::Sum));
        }
        if let Some(histogram) = &self.explicit_bucket_histogram {
            return Ok(Some(SdkAggregation::ExplicitBucketHistogram {
                boundaries: histogram.boundaries.clone(),
                record_min_max: histogram.record_min_max.unwrap_or(false),
            }));
        }
        if let Some(histogram) = &self.base2_exponential_bucket_histogram {
            let max_size = match histogram.max_size {
                Some(value) if value <= 0 => {
                    return Err(ConfigError::greater_than_zero("max_size"))
                }
                Some(value) => u32::try_from(value).unwrap_or(u32::MAX),
                None => DEFAULT_MAX_SIZE,
            };
            let max_scale = match histogram.max_scale {
                Some(value) if !(MIN_SCALE..=i64::from(DEFAULT_MAX_SCALE)).contains(&value) => {
                    return Err(ConfigError::invalid(format!(
                        "base2_exponential_bucket_histogram: max_scale {value} out of range"
                    )))
                }
                Some(value) => value as i8,
                None => DEFAULT_MAX_SCALE,
            };
            return Ok(Some(SdkAggregation::Base2ExponentialHistogram {
                max_size,
                max_scale,
                record_min_max: histogram.record_min_max.unwrap_or(false),
            }));
        }
        Ok(None)
    }
}

/// A view resolved against the SDK types.
#[derive(Debug)]
pub(crate) struct CompiledView {
    instrument_name: Option<String>,
    kind: Option<InstrumentKind>,
    unit: Option<String>,
    meter_name: Option<String>,
    meter_version: Option<String>,
    meter_schema_url: Option<String>,
    name: Option<String>,
    description: Option<String>,
    allowed_keys: Option<Vec<Key>>,
    aggregation: Option<SdkAggregation>,
    cardinality_limit: Option<usize>,
}

impl View {
    pub(crate) fn compile(&self) -> Result<CompiledView, ConfigError> {
        let selector = &self.selector;
        if selector.is_empty() {
            return Err(ConfigError::invalid(
                "view_selector: empty selector not supporter",
            ));
        }
        let kind = selector
            .instrument_type
            .as_deref()
            .map(instrument_kind)
            .transpose()?;

        let stream = &self.stream;
        let allowed_keys = match &stream.attribute_keys {
            Some(keys) => {
                let filter = keys.filter()?;
                if filter.has_includes() {
                    Some(filter.included().map(|key| Key::new(key.to_owned())).collect())
                } else {
                    if filter.has_excludes() {
                        tracing::warn!(
                            name: "Configurator.View.ExcludedKeysIgnored",
                            message = "attribute_keys.excluded requires an included list and is ignored",
                        );
                    }
                    None
                }
            }
            None => None,
        };
        let cardinality_limit = match stream.aggregation_cardinality_limit {
            Some(value) if value <= 0 => {
                return Err(ConfigError::greater_than_zero("aggregation_cardinality_limit"))
            }
            Some(value) => Some(value as usize),
            None => None,
        };
        let aggregation = stream
            .aggregation
            .as_ref()
            .map(Aggregation::to_sdk)
            .transpose()?
            .flatten();

        let view = CompiledView {
            instrument_name: selector.instrument_name.clone(),
            kind,
            unit: selector.unit.clone(),
            meter_name: selector.meter_name.clone(),
            meter_version: selector.meter_version.clone(),
            meter_schema_url: selector.meter_schema_url.clone(),
            name: stream.name.clone(),
            description: stream.description.clone(),
            allowed_keys,
            aggregation,
            cardinality_limit,
        };
        // Surface stream validation failures while building instead of
        // silently skipping the view at instrument creation.
        view.stream(None)
            .map_err(|err| ConfigError::invalid_with("view stream", err.to_string()))?;
        Ok(view)
    }
}

impl CompiledView {
    pub(crate) fn matches(
        &self,
        name: &str,
        kind: InstrumentKind,
        unit: &str,
        scope: &InstrumentationScope,
    ) -> bool {
        selects(self.instrument_name.as_deref(), Some(name))
            && selects(self.kind, Some(kind))
            && selects(self.unit.as_deref(), Some(unit))
            && selects(self.meter_name.as_deref(), Some(scope.name()))
            && selects(self.meter_version.as_deref(), scope.version())
            && selects(self.meter_schema_url.as_deref(), scope.schema_url())
    }

    fn matches_instrument(&self, instrument: &Instrument) -> bool {
        self.matches(
            instrument.name(),
            instrument.kind(),
            instrument.unit(),
            instrument.scope(),
        )
    }

    fn stream(&self, fallback_limit: Option<usize>) -> Result<Stream, Box<dyn std::error::Error>> {
        let mut builder = Stream::builder();
        if let Some(name) = &self.name {
            builder = builder.with_name(name.clone());
        }
        if let Some(description) = &self.description {
            builder = builder.with_description(description.clone());
        }
        if let Some(keys) = &self.allowed_keys {
            builder = builder.with_allowed_attribute_keys(keys.iter().cloned());
        }
        if let Some(aggregation) = &self.aggregation {
            builder = builder.with_aggregation(aggregation.clone());
        }
        if let Some(limit) = self.cardinality_limit.or(fallback_limit) {
            builder = builder.with_cardinality_limit(limit);
        }
        builder.build()
    }
}

/// An absent selector field matches anything.
fn selects<T: PartialEq>(want: Option<T>, got: Option<T>) -> bool {
    want.map_or(true, |want| Some(want) == got)
}

/// Compiles every view, reporting all failures together.
pub(crate) fn compile_all(views: &[View]) -> Result<Vec<CompiledView>, ConfigError> {
    let mut errors = ErrorJoiner::default();
    let compiled: Vec<CompiledView> = views
        .iter()
        .filter_map(|view| errors.collect(view.compile()))
        .collect();
    errors.finish()?;
    Ok(compiled)
}

/// Registers the compiled views and, when cardinality limits are set, a
/// fallback view applying them to instruments no configured view selects.
pub(crate) fn register(
    mut builder: MeterProviderBuilder,
    compiled: Vec<CompiledView>,
    limits: &[&CardinalityLimits],
) -> MeterProviderBuilder {
    let compiled: Arc<[CompiledView]> = compiled.into();
    let limits: Arc<[CardinalityLimits]> = limits.iter().map(|limits| (*limits).clone()).collect();

    for index in 0..compiled.len() {
        let views = Arc::clone(&compiled);
        let limits = Arc::clone(&limits);
        builder = builder.with_view(move |instrument: &Instrument| {
            let view = &views[index];
            if !view.matches_instrument(instrument) {
                return None;
            }
            view.stream(effective_limit(&limits, instrument.kind())).ok()
        });
    }

    if !limits.is_empty() {
        builder = builder.with_view(move |instrument: &Instrument| {
            if compiled.iter().any(|view| view.matches_instrument(instrument)) {
                return None;
            }
            let limit = effective_limit(&limits, instrument.kind())?;
            Stream::builder().with_cardinality_limit(limit).build().ok()
        });
    }
    builder
}

/// The smallest limit configured for `kind` across provider and readers.
pub(crate) fn effective_limit(limits: &[CardinalityLimits], kind: InstrumentKind) -> Option<usize> {
    limits
        .iter()
        .filter_map(|limits| limits.for_kind(kind))
        .filter(|limit| *limit > 0)
        .min()
        .map(|limit| limit as usize)
}
