//! # Sampler configuration module
//!
//! The SDK's parent-based sampler only lets the root sampler be chosen, while
//! the configuration model allows a sampler per parent state. The
//! [`ParentBasedSampler`] here delegates to one of five samplers instead.

use opentelemetry::{
    trace::{Link, SamplingResult, SpanKind, TraceContextExt, TraceId},
    Context, KeyValue,
};
use opentelemetry_sdk::trace::{Sampler as SdkSampler, ShouldSample};
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    common::EmptyConfig,
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
};

/// The `sampler` node: exactly one variant is expected.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Sampler {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub always_on: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub always_off: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id_ratio_based: Option<TraceIdRatioBasedSampler>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_based: Option<ParentBasedSamplerConfig>,
}

impl FromNode for Sampler {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("Sampler", node)?;
        let mut errors = ErrorJoiner::default();
        let value = Sampler {
            always_on: errors.or_default(fields.variant("always_on")),
            always_off: errors.or_default(fields.variant("always_off")),
            trace_id_ratio_based: errors.or_default(fields.variant("trace_id_ratio_based")),
            parent_based: errors.or_default(fields.variant("parent_based")),
        };
        errors.finish()?;
        Ok(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TraceIdRatioBasedSampler {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
}

impl FromNode for TraceIdRatioBasedSampler {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("TraceIDRatioBasedSampler", node)?;
        Ok(TraceIdRatioBasedSampler {
            ratio: fields.scalar("ratio")?,
        })
    }
}

/// Samplers for a root span and for each parent state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParentBasedSamplerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Box<Sampler>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_parent_sampled: Option<Box<Sampler>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_parent_not_sampled: Option<Box<Sampler>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_parent_sampled: Option<Box<Sampler>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_parent_not_sampled: Option<Box<Sampler>>,
}

impl FromNode for Box<Sampler> {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        Sampler::from_node(node).map(Box::new)
    }
}

impl FromNode for ParentBasedSamplerConfig {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("ParentBasedSampler", node)?;
        let mut errors = ErrorJoiner::default();
        let value = ParentBasedSamplerConfig {
            root: errors.or_default(fields.node("root")),
            remote_parent_sampled: errors.or_default(fields.node("remote_parent_sampled")),
            remote_parent_not_sampled: errors.or_default(fields.node("remote_parent_not_sampled")),
            local_parent_sampled: errors.or_default(fields.node("local_parent_sampled")),
            local_parent_not_sampled: errors.or_default(fields.node("local_parent_not_sampled")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// A sampler built from configuration.
#[derive(Clone, Debug)]
pub enum ConfiguredSampler {
    Sdk(SdkSampler),
    ParentBased(Box<ParentBasedSampler>),
}

impl ShouldSample for ConfiguredSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        match self {
            ConfiguredSampler::Sdk(sampler) => {
                sampler.should_sample(parent_context, trace_id, name, span_kind, attributes, links)
            }
            ConfiguredSampler::ParentBased(sampler) => {
                sampler.should_sample(parent_context, trace_id, name, span_kind, attributes, links)
            }
        }
    }
}

/// Delegates to `root` for spans without a parent, otherwise to the sampler
/// matching whether the parent is remote and sampled.
#[derive(Clone, Debug)]
pub struct ParentBasedSampler {
    root: ConfiguredSampler,
    remote_parent_sampled: ConfiguredSampler,
    remote_parent_not_sampled: ConfiguredSampler,
    local_parent_sampled: ConfiguredSampler,
    local_parent_not_sampled: ConfiguredSampler,
}

impl ParentBasedSampler {
    pub fn new(root: ConfiguredSampler) -> Self {
        ParentBasedSampler {
            root,
            remote_parent_sampled: ConfiguredSampler::Sdk(SdkSampler::AlwaysOn),
            remote_parent_not_sampled: ConfiguredSampler::Sdk(SdkSampler::AlwaysOff),
            local_parent_sampled: ConfiguredSampler::Sdk(SdkSampler::AlwaysOn),
            local_parent_not_sampled: ConfiguredSampler::Sdk(SdkSampler::AlwaysOff),
        }
    }

    fn delegate(&self, parent_context: Option<&Context>) -> &ConfiguredSampler {
        let Some(cx) = parent_context.filter(|cx| cx.has_active_span()) else {
            return &self.root;
        };
        let span = cx.span();
        let parent = span.span_context();
        match (parent.is_remote(), parent.is_sampled()) {
            (true, true) => &self.remote_parent_sampled,
            (true, false) => &self.remote_parent_not_sampled,
            (false, true) => &self.local_parent_sampled,
            (false, false) => &self.local_parent_not_sampled,
        }
    }
}

impl ShouldSample for ParentBasedSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        self.delegate(parent_context).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}

/// Builds the sampler of a tracer provider. An absent sampler is parent
/// based with an `always_on` root.
pub(crate) fn build(sampler: Option<&Sampler>) -> Result<ConfiguredSampler, ConfigError> {
    match sampler {
        None => Ok(ConfiguredSampler::ParentBased(Box::new(ParentBasedSampler::new(
            ConfiguredSampler::Sdk(SdkSampler::AlwaysOn),
        )))),
        Some(sampler) => build_node(sampler),
    }
}

fn build_node(sampler: &Sampler) -> Result<ConfiguredSampler, ConfigError> {
    if let Some(parent_based) = &sampler.parent_based {
        return build_parent_based(parent_based);
    }
    if sampler.always_off.is_some() {
        return Ok(ConfiguredSampler::Sdk(SdkSampler::AlwaysOff));
    }
    if sampler.always_on.is_some() {
        return Ok(ConfiguredSampler::Sdk(SdkSampler::AlwaysOn));
    }
    if let Some(ratio_based) = &sampler.trace_id_ratio_based {
        return Ok(ConfiguredSampler::Sdk(SdkSampler::TraceIdRatioBased(
            ratio_based.ratio.unwrap_or(1.0),
        )));
    }
    Err(ConfigError::invalid("sampler configuration"))
}

fn build_parent_based(config: &ParentBasedSamplerConfig) -> Result<ConfiguredSampler, ConfigError> {
    let mut errors = ErrorJoiner::default();
    let mut branch = |node: &Option<Box<Sampler>>| -> Option<ConfiguredSampler> {
        node.as_deref()
            .and_then(|node| errors.collect(build_node(node)))
    };

    let mut sampler = ParentBasedSampler::new(
        branch(&config.root).unwrap_or(ConfiguredSampler::Sdk(SdkSampler::AlwaysOn)),
    );
    if let Some(remote_parent_sampled) = branch(&config.remote_parent_sampled) {
        sampler.remote_parent_sampled = remote_parent_sampled;
    }
    if let Some(remote_parent_not_sampled) = branch(&config.remote_parent_not_sampled) {
        sampler.remote_parent_not_sampled = remote_parent_not_sampled;
    }
    if let Some(local_parent_sampled) = branch(&config.local_parent_sampled) {
        sampler.local_parent_sampled = local_parent_sampled;
    }
    if let Some(local_parent_not_sampled) = branch(&config.local_parent_not_sampled) {
        sampler.local_parent_not_sampled = local_parent_not_sampled;
    }
    errors.finish()?;
    Ok(ConfiguredSampler::ParentBased(Box::new(sampler)))
}
