//! Raw-node decoding helpers.
//!
//! Documents are decoded into a [`serde_yaml::Value`] tree first and then
//! projected into the typed model one node at a time. Keeping the raw mapping
//! around lets a node tell "key present with a null value" (a union variant
//! selected with its defaults) apart from "key absent".

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::{ConfigError, ErrorJoiner};

/// A model node that validates itself while decoding from a raw value.
pub trait FromNode: Sized {
    fn from_node(node: &Value) -> Result<Self, ConfigError>;
}

/// Read access to the fields of a mapping node owned by `owner`.
pub(crate) struct Fields<'a> {
    owner: &'static str,
    map: Option<&'a Mapping>,
}

impl<'a> Fields<'a> {
    /// A null node is read as an empty mapping.
    pub(crate) fn of(owner: &'static str, node: &'a Value) -> Result<Self, ConfigError> {
        match node {
            Value::Mapping(map) => Ok(Fields {
                owner,
                map: Some(map),
            }),
            Value::Null => Ok(Fields { owner, map: None }),
            Value::Tagged(tagged) => Self::of(owner, &tagged.value),
            other => Err(ConfigError::unmarshal(
                owner,
                format!("expected a mapping, found {}", describe(other)),
            )),
        }
    }

    pub(crate) fn owner(&self) -> &'static str {
        self.owner
    }

    /// Whether `key` is present, null values included.
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.map.is_some_and(|map| map.contains_key(key))
    }

    /// The value of `key` when present and not null.
    pub(crate) fn value(&self, key: &str) -> Option<&'a Value> {
        self.map
            .and_then(|map| map.get(key))
            .filter(|value| !value.is_null())
    }

    pub(crate) fn scalar<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.value(key) {
            None => Ok(None),
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(|err| ConfigError::unmarshal(self.owner, format!("{key}: {err}"))),
        }
    }

    pub(crate) fn required_scalar<T: DeserializeOwned>(
        &self,
        key: &'static str,
    ) -> Result<T, ConfigError> {
        self.scalar(key)?
            .ok_or_else(|| ConfigError::required(self.owner, key))
    }

    /// An optional nested node; absent and null both decode to `None`.
    pub(crate) fn node<T: FromNode>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.value(key).map(T::from_node).transpose()
    }

    /// A required nested node; a null value is handed to the node decoder.
    pub(crate) fn required_node<T: FromNode>(&self, key: &'static str) -> Result<T, ConfigError> {
        match self.map.and_then(|map| map.get(key)) {
            Some(value) => T::from_node(value),
            None => Err(ConfigError::required(self.owner, key)),
        }
    }

    /// A union variant: present (even when null) selects the variant.
    pub(crate) fn variant<T: FromNode>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.map.and_then(|map| map.get(key)) {
            Some(value) => T::from_node(value).map(Some),
            None => Ok(None),
        }
    }

    /// A sequence of nodes. Every element is decoded and all failures are
    /// reported together.
    pub(crate) fn list<T: FromNode>(&self, key: &str) -> Result<Vec<T>, ConfigError> {
        let Some(value) = self.value(key) else {
            return Ok(Vec::new());
        };
        let Value::Sequence(items) = value else {
            return Err(ConfigError::unmarshal(
                self.owner,
                format!("{key}: expected a sequence, found {}", describe(value)),
            ));
        };

        let mut errors = ErrorJoiner::default();
        let decoded: Vec<T> = items
            .iter()
            .filter_map(|item| errors.collect(T::from_node(item)))
            .collect();
        errors.finish()?;
        Ok(decoded)
    }

    /// An integer field that must be strictly positive.
    pub(crate) fn positive(&self, key: &'static str) -> Result<Option<i64>, ConfigError> {
        match self.scalar::<i64>(key)? {
            Some(value) if value <= 0 => Err(ConfigError::greater_than_zero(key)),
            other => Ok(other),
        }
    }

    /// An integer field that must not be negative.
    pub(crate) fn non_negative(&self, key: &'static str) -> Result<Option<i64>, ConfigError> {
        match self.scalar::<i64>(key)? {
            Some(value) if value < 0 => Err(ConfigError::greater_or_equal_zero(key)),
            other => Ok(other),
        }
    }

    /// Every entry whose key is not listed in `known`.
    pub(crate) fn remaining(&self, known: &[&str]) -> Mapping {
        self.map
            .map(|map| {
                map.iter()
                    .filter(|(key, _)| !key.as_str().is_some_and(|key| known.contains(&key)))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Converts a millisecond field; zero and absent both mean "use the default".
pub(crate) fn millis(
    field: &'static str,
    value: Option<i64>,
) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(value) if value < 0 => Err(ConfigError::greater_or_equal_zero(field)),
        Some(value) if value > 0 => Ok(Some(Duration::from_millis(value as u64))),
        _ => Ok(None),
    }
}

pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
