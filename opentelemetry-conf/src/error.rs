//! # Configuration error module
//!
//! Every failure produced while decoding or assembling a configuration is a
//! [`ConfigError`]. Errors from sibling nodes are aggregated into
//! [`ConfigError::Joined`] instead of stopping at the first failure, and
//! callers match on the aggregated tree with [`ConfigError::contains`].

use std::{error::Error as StdError, fmt};

use thiserror::Error;

/// Boxed error used as the underlying cause of an [`ConfigError::Invalid`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Comparison used by a numeric bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundOp {
    GreaterThan,
    GreaterOrEqual,
}

impl fmt::Display for BoundOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundOp::GreaterThan => f.write_str(">"),
            BoundOp::GreaterOrEqual => f.write_str(">="),
        }
    }
}

/// The kind of a [`ConfigError`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Bound,
    Required,
    Unmarshal,
    Invalid,
    Joined,
}

/// Errors returned while decoding a configuration document or building the
/// providers it describes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field violated its bound.
    #[error("field {field}: must be {op} {bound}")]
    Bound {
        field: &'static str,
        op: BoundOp,
        bound: i64,
    },

    /// A required field was absent.
    #[error("field {field} in {owner}: required")]
    Required {
        owner: &'static str,
        field: &'static str,
    },

    /// The encoded node does not have the shape of its target type.
    #[error("unmarshal error in {owner}: {reason}")]
    Unmarshal { owner: &'static str, reason: String },

    /// Any other validation or build failure.
    #[error("{identifier}{}", display_cause(.source))]
    Invalid {
        identifier: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Several independent failures.
    #[error("{}", display_joined(.0))]
    Joined(Vec<ConfigError>),
}

fn display_cause(source: &Option<BoxError>) -> String {
    source
        .as_ref()
        .map(|cause| format!(": {cause}"))
        .unwrap_or_default()
}

fn display_joined(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ConfigError {
    pub fn greater_than_zero(field: &'static str) -> Self {
        ConfigError::Bound {
            field,
            op: BoundOp::GreaterThan,
            bound: 0,
        }
    }

    pub fn greater_or_equal_zero(field: &'static str) -> Self {
        ConfigError::Bound {
            field,
            op: BoundOp::GreaterOrEqual,
            bound: 0,
        }
    }

    pub fn required(owner: &'static str, field: &'static str) -> Self {
        ConfigError::Required { owner, field }
    }

    pub fn unmarshal(owner: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Unmarshal {
            owner,
            reason: reason.into(),
        }
    }

    pub fn invalid(identifier: impl Into<String>) -> Self {
        ConfigError::Invalid {
            identifier: identifier.into(),
            source: None,
        }
    }

    pub fn invalid_with(identifier: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ConfigError::Invalid {
            identifier: identifier.into(),
            source: Some(source.into()),
        }
    }

    /// Joins `errors` into a single error. Nested joins are flattened; an
    /// empty input yields `None` and a single error is returned unchanged.
    pub fn join(errors: impl IntoIterator<Item = ConfigError>) -> Option<ConfigError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                ConfigError::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(ConfigError::Joined(flat)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Bound { .. } => ErrorKind::Bound,
            ConfigError::Required { .. } => ErrorKind::Required,
            ConfigError::Unmarshal { .. } => ErrorKind::Unmarshal,
            ConfigError::Invalid { .. } => ErrorKind::Invalid,
            ConfigError::Joined(_) => ErrorKind::Joined,
        }
    }

    /// Iterates over the non-joined errors contained in this error.
    pub fn leaves(&self) -> Box<dyn Iterator<Item = &ConfigError> + '_> {
        match self {
            ConfigError::Joined(errors) => Box::new(errors.iter().flat_map(|e| e.leaves())),
            other => Box::new(std::iter::once(other)),
        }
    }

    /// Reports whether `self` is, or joins, an error identified like `target`.
    ///
    /// Identity ignores causes: bounds compare field, op and bound; required
    /// errors compare owner and field; unmarshal errors compare the owner;
    /// invalid errors compare the identifier.
    pub fn contains(&self, target: &ConfigError) -> bool {
        self.leaves().any(|leaf| leaf.same_identity(target))
    }

    fn same_identity(&self, other: &ConfigError) -> bool {
        match (self, other) {
            (
                ConfigError::Bound { field, op, bound },
                ConfigError::Bound {
                    field: other_field,
                    op: other_op,
                    bound: other_bound,
                },
            ) => field == other_field && op == other_op && bound == other_bound,
            (
                ConfigError::Required { owner, field },
                ConfigError::Required {
                    owner: other_owner,
                    field: other_field,
                },
            ) => owner == other_owner && field == other_field,
            (
                ConfigError::Unmarshal { owner, .. },
                ConfigError::Unmarshal {
                    owner: other_owner, ..
                },
            ) => owner == other_owner,
            (
                ConfigError::Invalid { identifier, .. },
                ConfigError::Invalid {
                    identifier: other_identifier,
                    ..
                },
            ) => identifier == other_identifier,
            _ => false,
        }
    }
}

/// Accumulates sibling errors so that every independent failure of a node is
/// reported together.
#[derive(Debug, Default)]
pub(crate) struct ErrorJoiner {
    errors: Vec<ConfigError>,
}

impl ErrorJoiner {
    /// Records the error of `result`, if any, and passes the value through.
    pub(crate) fn collect<T>(&mut self, result: Result<T, ConfigError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    /// Records the error of `result`, if any, and yields the default in its
    /// place so that sibling fields are still decoded.
    pub(crate) fn or_default<T: Default>(&mut self, result: Result<T, ConfigError>) -> T {
        self.collect(result).unwrap_or_default()
    }

    pub(crate) fn push(&mut self, err: ConfigError) {
        self.errors.push(err);
    }

    pub(crate) fn finish(self) -> Result<(), ConfigError> {
        match ConfigError::join(self.errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
