//! # Resource configuration module
//!
//! Declared resource attributes and their conversion into an SDK
//! [`Resource`](opentelemetry_sdk::Resource).

use opentelemetry::{Array, KeyValue, StringValue};
use opentelemetry_sdk::Resource as SdkResource;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_yaml::Value;

use crate::{
    decode::{describe, Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
};

/// The `resource` node.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Resource {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeNameValue>,
    /// `key=value` pairs separated by commas, values percent-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes_list: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_url: Option<String>,
}

impl FromNode for Resource {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("Resource", node)?;
        let mut errors = ErrorJoiner::default();
        let value = Resource {
            attributes: errors.or_default(fields.list("attributes")),
            attributes_list: errors.or_default(fields.scalar("attributes_list")),
            schema_url: errors.or_default(fields.scalar("schema_url")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// The declared type of an attribute value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Bool,
    Int,
    Double,
    StringArray,
    BoolArray,
    IntArray,
    DoubleArray,
}

impl AttributeType {
    fn from_name(name: &str) -> Result<Self, ConfigError> {
        Ok(match name {
            "string" => AttributeType::String,
            "bool" => AttributeType::Bool,
            "int" => AttributeType::Int,
            "double" => AttributeType::Double,
            "string_array" => AttributeType::StringArray,
            "bool_array" => AttributeType::BoolArray,
            "int_array" => AttributeType::IntArray,
            "double_array" => AttributeType::DoubleArray,
            other => {
                return Err(ConfigError::invalid_with(
                    "attribute type: invalid value",
                    format!("{other:?}"),
                ))
            }
        })
    }
}

/// A typed attribute value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    StringArray(Vec<String>),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
}

impl From<AttributeValue> for opentelemetry::Value {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::String(v) => v.into(),
            AttributeValue::Bool(v) => v.into(),
            AttributeValue::Int(v) => v.into(),
            AttributeValue::Double(v) => v.into(),
            AttributeValue::StringArray(v) => opentelemetry::Value::Array(Array::String(
                v.into_iter().map(StringValue::from).collect(),
            )),
            AttributeValue::BoolArray(v) => opentelemetry::Value::Array(Array::Bool(v)),
            AttributeValue::IntArray(v) => opentelemetry::Value::Array(Array::I64(v)),
            AttributeValue::DoubleArray(v) => opentelemetry::Value::Array(Array::F64(v)),
        }
    }
}

/// A resource attribute.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttributeNameValue {
    pub name: String,
    pub value: AttributeValue,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<AttributeType>,
}

impl AttributeNameValue {
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        AttributeNameValue {
            name: name.into(),
            value,
            r#type: None,
        }
    }

    pub fn key_value(&self) -> KeyValue {
        KeyValue::new(self.name.clone(), self.value.clone())
    }
}

const OWNER: &str = "AttributeNameValue";

impl FromNode for AttributeNameValue {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of(OWNER, node)?;
        let name: String = fields.required_scalar("name")?;
        let Some(raw) = fields.value("value") else {
            return Err(ConfigError::required(OWNER, "value"));
        };
        let r#type = fields
            .scalar::<String>("type")?
            .map(|name| AttributeType::from_name(&name))
            .transpose()?;
        let value = typed_value(raw, r#type).map_err(|reason| {
            ConfigError::unmarshal(OWNER, format!("{name}: {reason}"))
        })?;
        Ok(AttributeNameValue {
            name,
            value,
            r#type,
        })
    }
}

/// Converts a decoded value according to the declared type. Without a type
/// the scalar is read as a string.
fn typed_value(raw: &Value, r#type: Option<AttributeType>) -> Result<AttributeValue, String> {
    let value = match r#type.unwrap_or(AttributeType::String) {
        AttributeType::String => AttributeValue::String(string(raw)?),
        AttributeType::Bool => AttributeValue::Bool(boolean(raw)?),
        AttributeType::Int => AttributeValue::Int(int(raw)?),
        AttributeType::Double => AttributeValue::Double(double(raw)?),
        AttributeType::StringArray => {
            AttributeValue::StringArray(array(raw)?.iter().map(string).collect::<Result<_, _>>()?)
        }
        AttributeType::BoolArray => {
            AttributeValue::BoolArray(array(raw)?.iter().map(boolean).collect::<Result<_, _>>()?)
        }
        AttributeType::IntArray => {
            AttributeValue::IntArray(array(raw)?.iter().map(int).collect::<Result<_, _>>()?)
        }
        AttributeType::DoubleArray => {
            AttributeValue::DoubleArray(array(raw)?.iter().map(double).collect::<Result<_, _>>()?)
        }
    };
    Ok(value)
}

fn mismatch(expected: &str, found: &Value) -> String {
    format!("expected {expected}, found {}", describe(found))
}

fn string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(v) => Ok(v.clone()),
        Value::Bool(v) => Ok(v.to_string()),
        Value::Number(v) => Ok(v.to_string()),
        other => Err(mismatch("a string", other)),
    }
}

fn boolean(value: &Value) -> Result<bool, String> {
    value.as_bool().ok_or_else(|| mismatch("a boolean", value))
}

fn int(value: &Value) -> Result<i64, String> {
    if let Some(v) = value.as_i64() {
        return Ok(v);
    }
    match value.as_f64() {
        Some(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 => Ok(v as i64),
        _ => Err(mismatch("an integer", value)),
    }
}

fn double(value: &Value) -> Result<f64, String> {
    value.as_f64().ok_or_else(|| mismatch("a number", value))
}

fn array(value: &Value) -> Result<&Vec<Value>, String> {
    value.as_sequence().ok_or_else(|| mismatch("a sequence", value))
}

/// Parses `attributes_list` into string attributes.
fn parse_attributes_list(list: &str) -> Result<Vec<KeyValue>, ConfigError> {
    list.split(',')
        .filter(|member| !member.trim().is_empty())
        .map(|member| {
            let (key, value) = member.split_once('=').ok_or_else(|| {
                ConfigError::invalid_with(
                    "invalid attributes_list",
                    format!("missing '=' in {member:?}"),
                )
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::invalid_with(
                    "invalid attributes_list",
                    format!("empty key in {member:?}"),
                ));
            }
            let value = percent_decode_str(value.trim())
                .decode_utf8()
                .map_err(|err| ConfigError::invalid_with("invalid attributes_list", err))?;
            Ok(KeyValue::new(key.to_string(), value.into_owned()))
        })
        .collect()
}

/// Builds the resource shared by every provider.
///
/// Without a `resource` node the SDK default resource, including its
/// environment detectors, is returned.
pub(crate) fn build(resource: Option<&Resource>) -> Result<SdkResource, ConfigError> {
    let Some(resource) = resource else {
        return Ok(SdkResource::builder().build());
    };

    let mut attributes = match resource.attributes_list.as_deref() {
        Some(list) => parse_attributes_list(list)?,
        None => Vec::new(),
    };
    attributes.extend(resource.attributes.iter().map(AttributeNameValue::key_value));

    let builder = SdkResource::builder_empty();
    let built = match resource.schema_url.clone() {
        Some(schema_url) => builder.with_schema_url(attributes, schema_url),
        None => builder.with_attributes(attributes),
    }
    .build();

    tracing::debug!(
        name: "Configurator.Resource.Built",
        attributes = built.len(),
        schema_url = built.schema_url().unwrap_or_default(),
    );
    Ok(built)
}
