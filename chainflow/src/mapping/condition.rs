//! Rule conditions evaluated against the source record.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::mapper::MappingError;
use crate::context::lookup_path;

/// Comparison performed by a condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Field equals value.
    #[default]
    Equals,
    /// Field differs from value.
    NotEquals,
    /// Field (string, array or object keys) contains value.
    Contains,
    /// Negation of `contains`; a missing field counts as not containing.
    NotContains,
    /// Field is greater than value.
    GreaterThan,
    /// Field is less than value.
    LessThan,
    /// Field is present and not null.
    Exists,
    /// Field is missing or null.
    NotExists,
    /// Field is a string matching the pattern from its start.
    Regex,
    /// Unrecognized type; always passes.
    #[serde(other)]
    Unknown,
}

/// Condition as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    /// Comparison type, `equals` when omitted.
    #[serde(rename = "type", default)]
    pub kind: ConditionKind,
    /// Dotted path into the source record. A condition without a field passes.
    #[serde(default)]
    pub field: Option<String>,
    /// Operand.
    #[serde(default)]
    pub value: Value,
}

/// A compiled condition.
#[derive(Debug, Clone)]
pub struct Condition {
    kind: ConditionKind,
    field: Option<String>,
    value: Value,
    pattern: Option<Regex>,
}

impl Condition {
    /// Compiles a condition, precompiling regex patterns.
    pub fn compile(spec: ConditionSpec) -> Result<Self, MappingError> {
        let pattern = match (spec.kind, &spec.value) {
            (ConditionKind::Regex, Value::String(p)) => Some(
                Regex::new(&format!("^(?:{p})")).map_err(|e| MappingError::InvalidPattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })?,
            ),
            _ => None,
        };
        Ok(Self {
            kind: spec.kind,
            field: spec.field,
            value: spec.value,
            pattern,
        })
    }

    /// Evaluates the condition against a record.
    #[must_use]
    pub fn evaluate(&self, record: &Map<String, Value>) -> bool {
        let Some(field) = &self.field else {
            return true;
        };
        let actual = lookup_path(record, field);

        match self.kind {
            ConditionKind::Equals => loose_eq(actual.unwrap_or(&Value::Null), &self.value),
            ConditionKind::NotEquals => !loose_eq(actual.unwrap_or(&Value::Null), &self.value),
            ConditionKind::Contains => actual.is_some_and(|v| contains(v, &self.value)),
            ConditionKind::NotContains => !actual.is_some_and(|v| contains(v, &self.value)),
            ConditionKind::GreaterThan => {
                actual.and_then(|v| compare(v, &self.value)) == Some(Ordering::Greater)
            }
            ConditionKind::LessThan => {
                actual.and_then(|v| compare(v, &self.value)) == Some(Ordering::Less)
            }
            ConditionKind::Exists => actual.is_some(),
            ConditionKind::NotExists => actual.is_none(),
            ConditionKind::Regex => match (actual, &self.pattern) {
                (Some(Value::String(s)), Some(re)) => re.is_match(s),
                _ => false,
            },
            ConditionKind::Unknown => true,
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(value: Value) -> Condition {
        Condition::compile(serde_json::from_value(value).unwrap()).unwrap()
    }

    fn record() -> Map<String, Value> {
        json!({
            "event_name": "Transfer",
            "args": {"value": 150, "tags": ["a", "b"]},
            "to": "0xdead"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_equals_is_default_and_numeric_loose() {
        assert!(condition(json!({"field": "event_name", "value": "Transfer"})).evaluate(&record()));
        assert!(condition(json!({"field": "args.value", "value": 150.0})).evaluate(&record()));
        assert!(!condition(json!({"type": "not_equals", "field": "args.value", "value": 150}))
            .evaluate(&record()));
    }

    #[test]
    fn test_contains_variants() {
        let r = record();
        assert!(condition(json!({"type": "contains", "field": "to", "value": "dead"})).evaluate(&r));
        assert!(condition(json!({"type": "contains", "field": "args.tags", "value": "b"})).evaluate(&r));
        assert!(condition(json!({"type": "contains", "field": "args", "value": "value"})).evaluate(&r));
        assert!(!condition(json!({"type": "contains", "field": "missing", "value": "x"})).evaluate(&r));
        assert!(condition(json!({"type": "not_contains", "field": "missing", "value": "x"})).evaluate(&r));
    }

    #[test]
    fn test_ordering_comparisons() {
        let r = record();
        assert!(condition(json!({"type": "greater_than", "field": "args.value", "value": 100})).evaluate(&r));
        assert!(!condition(json!({"type": "less_than", "field": "args.value", "value": 100})).evaluate(&r));
        assert!(!condition(json!({"type": "greater_than", "field": "to", "value": 1})).evaluate(&r));
        assert!(!condition(json!({"type": "less_than", "field": "missing", "value": 1})).evaluate(&r));
    }

    #[test]
    fn test_existence() {
        let r = record();
        assert!(condition(json!({"type": "exists", "field": "to"})).evaluate(&r));
        assert!(condition(json!({"type": "not_exists", "field": "from"})).evaluate(&r));
    }

    #[test]
    fn test_regex_anchors_at_start() {
        let r = record();
        assert!(condition(json!({"type": "regex", "field": "to", "value": "0x[a-f]+"})).evaluate(&r));
        assert!(!condition(json!({"type": "regex", "field": "to", "value": "dead"})).evaluate(&r));
        assert!(!condition(json!({"type": "regex", "field": "args.value", "value": "1"})).evaluate(&r));
    }

    #[test]
    fn test_invalid_regex_fails_compile() {
        let spec: ConditionSpec =
            serde_json::from_value(json!({"type": "regex", "field": "to", "value": "("})).unwrap();
        assert!(matches!(
            Condition::compile(spec),
            Err(MappingError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_missing_field_or_unknown_type_passes() {
        let r = record();
        assert!(condition(json!({"value": 1})).evaluate(&r));
        assert!(condition(json!({"type": "custom", "field": "to", "value": 1})).evaluate(&r));
    }
}
