//! # Environment variable substitution module
//!
//! Replaces `${NAME}` and `${NAME:-default}` references found in the scalar
//! values of a YAML document with the value of the named environment
//! variable. The document is parsed, substituted node by node and then
//! serialized again, so a substituted value can never introduce new keys.
//!
//! Escaping follows the dollar count in front of a reference: an odd count
//! substitutes and keeps half of the preceding dollars, an even count keeps
//! half of the dollars and leaves the reference untouched.

use std::{collections::HashMap, env, sync::OnceLock};

use regex::Regex;
use serde_yaml::{Mapping, Value};
use yaml_rust2::{
    parser::{Event, EventReceiver, Parser, Tag},
    scanner::TScalarStyle,
    Yaml,
};

use crate::error::ConfigError;

const OWNER: &str = "OpenTelemetryConfiguration";
const CORE_SCHEMA_TAG_PREFIX: &str = "tag:yaml.org,2002:";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid regex"))
}

fn double_dollar_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\$([^{$])").expect("valid regex"))
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"([$]+)\{([a-zA-Z_][a-zA-Z0-9_]*-?[^}]*)\}").expect("valid regex")
    })
}

/// Substitutes environment variable references in every scalar value of the
/// YAML (or JSON) document `input` and returns the re-serialized document.
///
/// Mapping keys are never substituted. Plain scalars are re-typed after
/// substitution, so `enabled: ${FLAG}` with `FLAG=true` decodes as a boolean
/// while `enabled: "${FLAG}"` stays a string.
pub fn replace_env_vars(input: &[u8]) -> Result<Vec<u8>, ConfigError> {
    let text = std::str::from_utf8(input)
        .map_err(|err| ConfigError::invalid_with("configuration is not valid UTF-8", err))?;

    let mut builder = TreeBuilder::default();
    Parser::new_from_str(text)
        .load(&mut builder, false)
        .map_err(|err| ConfigError::unmarshal(OWNER, err.to_string()))?;

    let Some(root) = builder.documents.into_iter().next() else {
        return Ok(Vec::new());
    };

    let value = convert(root, true).map_err(|err| {
        ConfigError::invalid_with("could not substitute environment variables", err)
    })?;

    let serialized = serde_yaml::to_string(&value)
        .map_err(|err| ConfigError::invalid_with("could not reserialize YAML tree", err))?;
    Ok(serialized.trim_end_matches('\n').as_bytes().to_vec())
}

/// Substitutes the references contained in a single scalar value.
pub fn replace_value_env_vars(input: &str) -> Result<String, ConfigError> {
    let collapsed = double_dollar_pattern().replace_all(input, |caps: &regex::Captures<'_>| {
        format!("${}", &caps[1])
    });

    let mut out = String::with_capacity(collapsed.len());
    let mut last = 0;
    for caps in reference_pattern().captures_iter(&collapsed) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&collapsed[last..whole.start()]);

        let dollars = caps.get(1).map_or(0, |m| m.len());
        let body = caps.get(2).map_or("", |m| m.as_str());
        out.push_str(&"$".repeat(dollars / 2));

        if dollars % 2 == 1 {
            out.push_str(&replace_env_var(body)?);
        } else {
            match parse_env_var(body).1 {
                // `$${A:-${A}}` keeps the escaped reference but expands its default
                Some(default) if default.contains('$') => {
                    let expanded = replace_value_env_vars(&format!("{body}}}"))?;
                    out.push('{');
                    out.push_str(&expanded);
                }
                _ => {
                    out.push('{');
                    out.push_str(body);
                    out.push('}');
                }
            }
        }
        last = whole.end();
    }
    out.push_str(&collapsed[last..]);
    Ok(out)
}

fn replace_env_var(body: &str) -> Result<String, ConfigError> {
    let (name, default) = parse_env_var(body);
    if name.contains(':') || !name_pattern().is_match(name) {
        return Err(ConfigError::invalid(format!(
            "invalid environment variable name: {name}"
        )));
    }

    let value = env::var(name).unwrap_or_default();
    match default {
        Some(default) if value.is_empty() => Ok(default.replace("$$", "$")),
        _ => Ok(value),
    }
}

fn parse_env_var(body: &str) -> (&str, Option<&str>) {
    let body = body.strip_prefix("env:").unwrap_or(body);
    match body.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (body, None),
    }
}

#[derive(Clone, Debug)]
enum Node {
    Scalar {
        value: String,
        style: TScalarStyle,
        tag: Option<Tag>,
    },
    Sequence(Vec<Node>),
    /// Keys and values alternate.
    Mapping(Vec<Node>),
}

#[derive(Default)]
struct TreeBuilder {
    stack: Vec<(Node, usize)>,
    anchors: HashMap<usize, Node>,
    documents: Vec<Node>,
}

impl TreeBuilder {
    fn insert(&mut self, node: Node, anchor: usize) {
        if anchor > 0 {
            self.anchors.insert(anchor, node.clone());
        }
        match self.stack.last_mut() {
            Some((Node::Sequence(items), _)) | Some((Node::Mapping(items), _)) => items.push(node),
            _ => self.documents.push(node),
        }
    }
}

impl EventReceiver for TreeBuilder {
    fn on_event(&mut self, ev: Event) {
        match ev {
            Event::Scalar(value, style, anchor, tag) => {
                self.insert(Node::Scalar { value, style, tag }, anchor)
            }
            Event::SequenceStart(anchor, ..) => self.stack.push((Node::Sequence(Vec::new()), anchor)),
            Event::MappingStart(anchor, ..) => self.stack.push((Node::Mapping(Vec::new()), anchor)),
            Event::SequenceEnd | Event::MappingEnd => {
                if let Some((node, anchor)) = self.stack.pop() {
                    self.insert(node, anchor);
                }
            }
            Event::Alias(anchor) => {
                let node = self.anchors.get(&anchor).cloned().unwrap_or(Node::Scalar {
                    value: String::new(),
                    style: TScalarStyle::Plain,
                    tag: None,
                });
                self.insert(node, 0);
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct EventCollector(Vec<Event>);

impl EventReceiver for EventCollector {
    fn on_event(&mut self, ev: Event) {
        self.0.push(ev);
    }
}

fn convert(node: Node, substitute: bool) -> Result<Value, ConfigError> {
    match node {
        Node::Scalar { value, style, tag } => {
            if !substitute {
                return scalar_value(value, style, tag.as_ref());
            }
            let replaced = replace_value_env_vars(&value)?;
            if matches!(
                style,
                TScalarStyle::SingleQuoted | TScalarStyle::DoubleQuoted | TScalarStyle::Folded
            ) {
                return Ok(Value::String(replaced));
            }
            if replaced == value || tag.is_some() {
                return scalar_value(replaced, style, tag.as_ref());
            }
            retype(replaced)
        }
        Node::Sequence(items) => items
            .into_iter()
            .map(|item| convert(item, substitute))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        Node::Mapping(items) => {
            let mut mapping = Mapping::new();
            let mut items = items.into_iter();
            while let Some(key) = items.next() {
                let value = match items.next() {
                    Some(value) => convert(value, substitute)?,
                    None => Value::Null,
                };
                mapping.insert(convert(key, false)?, value);
            }
            Ok(Value::Mapping(mapping))
        }
    }
}

/// Infers the type of a substituted plain scalar by parsing it as the value
/// of a one-entry mapping.
fn retype(value: String) -> Result<Value, ConfigError> {
    if value.is_empty() {
        return Ok(Value::Null);
    }
    if value.contains(": ") || value.contains('\n') {
        return Ok(Value::String(value));
    }

    let document = format!("key: {value}");
    let mut events = EventCollector::default();
    Parser::new_from_str(&document)
        .load(&mut events, false)
        .map_err(|err| ConfigError::invalid_with("could not retype node", err))?;

    let parsed = events
        .0
        .iter()
        .position(|ev| matches!(ev, Event::MappingStart(..)))
        .and_then(|start| events.0.get(start + 2));

    match parsed {
        Some(Event::Scalar(parsed, style, _, tag)) => {
            let typed = scalar_value(parsed.clone(), *style, tag.as_ref())?;
            if *parsed != value {
                // comments, tags or quotes changed the interpretation
                Ok(Value::String(value))
            } else {
                Ok(typed)
            }
        }
        _ => Ok(Value::String(value)),
    }
}

fn scalar_value(value: String, style: TScalarStyle, tag: Option<&Tag>) -> Result<Value, ConfigError> {
    if let Some(tag) = tag {
        return tagged_value(value, tag);
    }
    if style != TScalarStyle::Plain {
        return Ok(Value::String(value));
    }
    Ok(plain_value(value))
}

fn plain_value(value: String) -> Value {
    if value.is_empty() {
        return Value::Null;
    }
    match Yaml::from_str(&value) {
        Yaml::Integer(i) => Value::Number(i.into()),
        real @ Yaml::Real(_) => match real.as_f64() {
            Some(f) => Value::Number(f.into()),
            None => Value::String(value),
        },
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Null => Value::Null,
        _ => Value::String(value),
    }
}

fn tagged_value(value: String, tag: &Tag) -> Result<Value, ConfigError> {
    let suffix = if tag.handle == "!!" || tag.handle == CORE_SCHEMA_TAG_PREFIX {
        tag.suffix.as_str()
    } else {
        return Ok(Value::String(value));
    };

    let typed = match (suffix, plain_value(value.clone())) {
        ("str", _) => Value::String(value),
        ("null", _) => Value::Null,
        ("int", typed @ Value::Number(_)) if typed.is_i64() || typed.is_u64() => typed,
        ("float", Value::Number(n)) => match n.as_f64() {
            Some(f) => Value::Number(f.into()),
            None => return Err(tag_mismatch(suffix, &value)),
        },
        ("bool", typed @ Value::Bool(_)) => typed,
        ("int" | "float" | "bool", _) => return Err(tag_mismatch(suffix, &value)),
        _ => Value::String(value),
    };
    Ok(typed)
}

fn tag_mismatch(suffix: &str, value: &str) -> ConfigError {
    ConfigError::invalid(format!("cannot decode `{value}` as a !!{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn substitute(input: &str, vars: &[(&str, &str)]) -> Result<String, ConfigError> {
        let vars: Vec<(&str, Option<&str>)> = vars.iter().map(|(k, v)| (*k, Some(*v))).collect();
        temp_env::with_vars(vars, || {
            replace_env_vars(input.as_bytes()).map(|out| String::from_utf8(out).unwrap())
        })
    }

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[rstest]
    #[case::no_references("key: value\nother: data", &[], "key: value\nother: data")]
    #[case::simple("key: ${TEST_VAR}", &[("TEST_VAR", "test_value")], "key: test_value")]
    #[case::undefined("key: ${UNDEFINED_VAR}", &[], "key:")]
    #[case::default_used("key: ${UNDEFINED_VAR:-default_value}", &[], "key: default_value")]
    #[case::default_ignored(
        "key: ${DEFINED_VAR:-default_value}",
        &[("DEFINED_VAR", "actual_value")],
        "key: actual_value"
    )]
    #[case::single_escape("key: $${NOT_REPLACED}", &[], "key: \"${NOT_REPLACED}\"")]
    #[case::odd_escape("key: $$${NOT_REPLACED}", &[], "key: $")]
    #[case::double_escape("key: $$$${NOT_REPLACED}", &[], "key: $${NOT_REPLACED}")]
    #[case::mixed(
        "key1: ${REPLACE_ME}\nkey2: $${NOT_REPLACED}",
        &[("REPLACE_ME", "replaced")],
        "key1: replaced\nkey2: ${NOT_REPLACED}"
    )]
    #[case::keys_untouched("${KEY_VAR}: value", &[("KEY_VAR", "replaced")], "${KEY_VAR}: value")]
    #[case::same_line(
        "key: ${VAR1} and ${VAR2}",
        &[("VAR1", "value1"), ("VAR2", "value2")],
        "key: value1 and value2"
    )]
    #[case::default_with_spaces(
        "key: ${UNDEFINED:-default with spaces}",
        &[],
        "key: default with spaces"
    )]
    #[case::nested_default_literal(
        "key: ${UNDEFINED:-${FALLBACK_VAR}}",
        &[("FALLBACK_VAR", "fallback_value")],
        "key: ${FALLBACK_VAR}"
    )]
    #[case::boolean("enabled: ${BOOL_VAR}", &[("BOOL_VAR", "true")], "enabled: true")]
    #[case::number("count: ${NUM_VAR}", &[("NUM_VAR", "42")], "count: 42")]
    #[case::hex("value: ${HEX_VAR}", &[("HEX_VAR", "0xFF")], "value: 255")]
    #[case::env_prefix("key: ${env:TEST_VAR}", &[("TEST_VAR", "env_value")], "key: env_value")]
    #[case::quoted("key: \"${QUOTED_VAR}\"", &[("QUOTED_VAR", "true")], "key: \"true\"")]
    #[case::backslashes(
        "key: ${SPECIAL_VAR}",
        &[("SPECIAL_VAR", "value\\nwith\\tescape")],
        "key: value\\nwith\\tescape"
    )]
    #[case::double_dollar_text("key: a $$ b", &[], "key: a $ b")]
    #[case::single_dollar_text("key: a $ b", &[], "key: a $ b")]
    #[case::pipes(
        "key: ${PIPE_VAR}",
        &[("PIPE_VAR", "value|with$|pipes")],
        "key: value|with$|pipes"
    )]
    #[case::escaped_reference_with_expanded_default(
        "key: $${STRING_VALUE:-${STRING_VALUE}}",
        &[("STRING_VALUE", "value")],
        "key: ${STRING_VALUE:-value}"
    )]
    #[case::escaped_reference_as_default(
        "key: ${UNDEFINED_KEY:-$${UNDEFINED_KEY}}",
        &[],
        "key: ${UNDEFINED_KEY}"
    )]
    #[case::injection_stays_a_value(
        "key: ${MALICIOUS_VAR}",
        &[("MALICIOUS_VAR", "value\nkey2: injected")],
        "key: \"value\\nkey2: injected\""
    )]
    fn test_replace_env_vars(
        #[case] input: &str,
        #[case] vars: &[(&str, &str)],
        #[case] expected: &str,
    ) {
        let output = substitute(input, vars).unwrap();
        assert_eq!(yaml(&output), yaml(expected), "output was {output:?}");
    }

    #[test]
    fn test_complex_document() {
        let input = r#"
service:
  name: ${SERVICE_NAME:-default-service}
  version: ${SERVICE_VERSION}
config:
  endpoint: ${ENDPOINT}
  escaped: $${NOT_REPLACED}
"#;
        let output = substitute(
            input,
            &[
                ("SERVICE_VERSION", "1.0.0"),
                ("ENDPOINT", "http://localhost:8080"),
            ],
        )
        .unwrap();
        let expected = r#"
service:
  name: default-service
  version: 1.0.0
config:
  endpoint: http://localhost:8080
  escaped: ${NOT_REPLACED}
"#;
        assert_eq!(yaml(&output), yaml(expected));
    }

    #[test]
    fn test_substituted_boolean_is_typed() {
        let output = substitute("key: ${FOO}", &[("FOO", "true")]).unwrap();
        assert_eq!(output, "key: true");
        assert_eq!(yaml(&output)["key"], Value::Bool(true));
    }

    #[test]
    fn test_escaped_reference_is_string() {
        let output = substitute("key: $${FOO}", &[]).unwrap();
        assert_eq!(yaml(&output)["key"], Value::String("${FOO}".into()));
    }

    #[test]
    fn test_dollar_count_halves() {
        for n in 1..=6usize {
            let input = format!("key: \"{}{{FOO}}\"", "$".repeat(n));
            let output = substitute(&input, &[("FOO", "bar")]).unwrap();
            let expected = if n % 2 == 1 {
                format!("{}bar", "$".repeat(n / 2))
            } else {
                format!("{}{{FOO}}", "$".repeat(n / 2))
            };
            assert_eq!(yaml(&output)["key"], Value::String(expected), "n = {n}");
        }
    }

    #[test]
    fn test_invalid_yaml_type_is_rejected() {
        let err = substitute("key: ${INVALID_TYPE_VAR}", &[("INVALID_TYPE_VAR", "!!int NaN")])
            .unwrap_err();
        assert!(err.contains(&ConfigError::invalid(
            "could not substitute environment variables"
        )));
    }

    #[test]
    fn test_unsupported_operator_is_rejected() {
        let err = substitute(
            "key: ${ERR_INVALID_SUFFIX:?error}",
            &[("ERR_INVALID_SUFFIX", "something")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid environment variable name"));
    }

    #[test]
    fn test_invalid_name() {
        let err = replace_env_var("$%&(*&)").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid environment variable name: $%&(*&)"
        );
    }

    #[test]
    fn test_sequences_and_anchors() {
        let input = "base: &base ${ITEM}\nlist:\n  - ${ITEM}\n  - plain\ncopy: *base";
        let output = substitute(input, &[("ITEM", "7")]).unwrap();
        let value = yaml(&output);
        assert_eq!(value["base"], Value::Number(7.into()));
        assert_eq!(value["list"][0], Value::Number(7.into()));
        assert_eq!(value["list"][1], Value::String("plain".into()));
        assert_eq!(value["copy"], Value::Number(7.into()));
    }

    #[test]
    fn test_empty_document() {
        assert!(replace_env_vars(b"").unwrap().is_empty());
    }
}
