//! Configuration nodes shared by several providers.

use std::collections::HashSet;

use serde::Serialize;
use serde_yaml::Value;

use crate::{
    decode::{Fields, FromNode},
    error::{ConfigError, ErrorJoiner},
};

/// A node whose presence alone carries meaning, such as `always_on:` or
/// `tracecontext: {}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EmptyConfig {}

impl FromNode for EmptyConfig {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        Fields::of("EmptyConfig", node)?;
        Ok(EmptyConfig {})
    }
}

/// A `name`/`value` pair such as an exporter header.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NameStringValuePair {
    pub name: String,
    pub value: Option<String>,
}

impl NameStringValuePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        NameStringValuePair {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

impl FromNode for NameStringValuePair {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("NameStringValuePair", node)?;
        let mut errors = ErrorJoiner::default();
        if !fields.contains("value") {
            errors.push(ConfigError::required(fields.owner(), "value"));
        }
        let value = NameStringValuePair {
            name: errors.or_default(fields.required_scalar("name")),
            value: errors.or_default(fields.scalar("value")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Attribute limits shared by every signal, also used for log records.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AttributeLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_value_length_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_count_limit: Option<i64>,
}

impl FromNode for AttributeLimits {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("AttributeLimits", node)?;
        let mut errors = ErrorJoiner::default();
        let value = AttributeLimits {
            attribute_value_length_limit: errors
                .or_default(fields.non_negative("attribute_value_length_limit")),
            attribute_count_limit: errors.or_default(fields.non_negative("attribute_count_limit")),
        };
        errors.finish()?;
        Ok(value)
    }
}

/// Lists of keys to include or exclude.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IncludeExclude {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
}

impl FromNode for IncludeExclude {
    fn from_node(node: &Value) -> Result<Self, ConfigError> {
        let fields = Fields::of("IncludeExclude", node)?;
        let mut errors = ErrorJoiner::default();
        let value = IncludeExclude {
            included: errors.or_default(fields.scalar("included")).unwrap_or_default(),
            excluded: errors.or_default(fields.scalar("excluded")).unwrap_or_default(),
        };
        errors.finish()?;
        Ok(value)
    }
}

impl IncludeExclude {
    /// Compiles the lists into a key filter.
    ///
    /// A key listed in both lists is rejected.
    pub fn filter(&self) -> Result<AttributeFilter, ConfigError> {
        let included: HashSet<String> = self.included.iter().cloned().collect();
        let mut excluded = HashSet::with_capacity(self.excluded.len());
        for key in &self.excluded {
            if included.contains(key) {
                return Err(ConfigError::invalid(format!(
                    "attribute cannot be in both include and exclude list: {key}"
                )));
            }
            excluded.insert(key.clone());
        }
        Ok(AttributeFilter { included, excluded })
    }
}

/// Decides which attribute keys are kept.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeFilter {
    included: HashSet<String>,
    excluded: HashSet<String>,
}

impl AttributeFilter {
    /// Excluded keys are dropped; when an include list exists only its keys
    /// are kept.
    pub fn allows(&self, key: &str) -> bool {
        if self.excluded.contains(key) {
            return false;
        }
        self.included.is_empty() || self.included.contains(key)
    }

    pub fn included(&self) -> impl Iterator<Item = &str> {
        self.included.iter().map(String::as_str)
    }

    pub fn has_includes(&self) -> bool {
        !self.included.is_empty()
    }

    pub fn has_excludes(&self) -> bool {
        !self.excluded.is_empty()
    }
}
