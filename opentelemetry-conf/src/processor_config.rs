//! Span and log record processor configuration.
//!
//! Both signals share the same processor shapes; only the exporter union
//! differs.

use std::time::Duration;

use serde::Serialize;
use serde_yaml::Value;

use crate::{
    decode::{millis, Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
};

/// Names the decoder reports for a processor node of a given signal.
pub trait ProcessorOwner {
    const BATCH: &'static str;
    const SIMPLE: &'static str;
    const PROCESSOR: &'static str;
}

/// A processor selecting exactly one of `batch` or `simple`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Processor<E> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchProcessor<E>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simple: Option<SimpleProcessor<E>>,
}

impl<E> Default for Processor<E> {
    fn default() -> Self {
        Processor {
            batch: None,
            simple: None,
        }
    }
}

impl<E> Processor<E> {
    pub fn batch(processor: BatchProcessor<E>) -> Self {
        Processor {
            batch: Some(processor),
            simple: None,
        }
    }

    pub fn simple(exporter: E) -> Self {
        Processor {
            batch: None,
            simple: Some(SimpleProcessor { exporter }),
        }
    }
}

impl<E: FromNode + ProcessorOwner + Default> FromNode for Processor<E> {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of(E::PROCESSOR, node)?;
        let mut errors = ErrorJoiner::default();
        let value = Processor {
            batch: errors.or_default(fields.variant("batch")),
            simple: errors.or_default(fields.variant("simple")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Exports batches from a bounded queue on a schedule.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchProcessor<E> {
    pub exporter: E,
    /// Milliseconds; `0` keeps the SDK default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_export_batch_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<i64>,
    /// Milliseconds; `0` keeps the SDK default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_delay: Option<i64>,
}

impl<E> BatchProcessor<E> {
    pub fn new(exporter: E) -> Self {
        BatchProcessor {
            exporter,
            export_timeout: None,
            max_export_batch_size: None,
            max_queue_size: None,
            schedule_delay: None,
        }
    }
}

impl<E: FromNode + ProcessorOwner + Default> FromNode for BatchProcessor<E> {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of(E::BATCH, node)?;
        let mut errors = ErrorJoiner::default();
        let value = BatchProcessor {
            exporter: errors.or_default(fields.required_node("exporter")),
            export_timeout: errors.or_default(fields.non_negative("export_timeout")),
            max_export_batch_size: errors.or_default(fields.positive("max_export_batch_size")),
            max_queue_size: errors.or_default(fields.positive("max_queue_size")),
            schedule_delay: errors.or_default(fields.non_negative("schedule_delay")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Batch tuning resolved from a [`BatchProcessor`]; `None` keeps the SDK
/// default.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct BatchSettings {
    pub(crate) max_queue_size: Option<usize>,
    pub(crate) max_export_batch_size: Option<usize>,
    pub(crate) scheduled_delay: Option<Duration>,
    pub(crate) max_export_timeout: Option<Duration>,
}

impl<E> BatchProcessor<E> {
    /// Checks the bounds again, since the model can be built without the
    /// decoder.
    pub(crate) fn settings(&self) -> Result<BatchSettings, ConfigError> {
        Ok(BatchSettings {
            max_queue_size: positive_size("max_queue_size", self.max_queue_size)?,
            max_export_batch_size: positive_size(
                "max_export_batch_size",
                self.max_export_batch_size,
            )?,
            scheduled_delay: millis("schedule_delay", self.schedule_delay)?,
            max_export_timeout: millis("export_timeout", self.export_timeout)?,
        })
    }
}

fn positive_size(field: &'static str, value: Option<i64>) -> Result<Option<usize>, ConfigError> {
    match value {
        Some(value) if value <= 0 => Err(ConfigError::greater_than_zero(field)),
        Some(value) => Ok(Some(value as usize)),
        None => Ok(None),
    }
}

/// Exports every record synchronously as it ends.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimpleProcessor<E> {
    pub exporter: E,
}

impl<E: FromNode + ProcessorOwner> FromNode for SimpleProcessor<E> {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of(E::SIMPLE, node)?;
        Ok(SimpleProcessor {
            exporter: fields.required_node("exporter")?,
        })
    }
}
