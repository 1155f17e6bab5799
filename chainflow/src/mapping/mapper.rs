//! Rule sets and the field mapper.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use super::condition::{Condition, ConditionSpec};
use super::transform::Transformer;
use super::validate::Validator;
use crate::context::{event_key_of, lookup_path, EventKey};

/// Errors from compiling or applying mapping rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// A regex condition did not compile.
    #[error("invalid condition pattern '{pattern}': {message}")]
    InvalidPattern {
        /// The pattern.
        pattern: String,
        /// Compiler message.
        message: String,
    },

    /// A required source field was missing and had no default.
    #[error("required field '{source_key}' is missing")]
    MissingRequired {
        /// Dotted source path.
        source_key: String,
    },

    /// A value failed its validator.
    #[error("field '{source_key}' failed {validator}")]
    ValidationFailed {
        /// Dotted source path.
        source_key: String,
        /// The validator that rejected it.
        validator: Validator,
    },
}

/// A mapping rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRuleSpec {
    /// Dotted path read from the source record.
    pub source_key: String,
    /// Output field written.
    pub target_key: String,
    /// Transformer name.
    #[serde(default)]
    pub transformer: Option<String>,
    /// Validator name.
    #[serde(default)]
    pub validator: Option<String>,
    /// Written when the source is missing or the condition is false.
    #[serde(default)]
    pub default_value: Option<Value>,
    /// Missing source with no default fails the rule set.
    #[serde(default)]
    pub required: bool,
    /// Gate evaluated against the source record.
    #[serde(default)]
    pub condition: Option<ConditionSpec>,
}

/// A rule set as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetSpec {
    /// Event the set is scoped to; `None` applies to every event.
    #[serde(default)]
    pub event_name: Option<String>,
    /// Rules in application order.
    #[serde(default)]
    pub mapping_rules: Vec<MappingRuleSpec>,
}

/// Field mapper configuration: `dict_mappers`, or a legacy flat `mapping_rules`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapperConfig {
    /// Event-scoped rule sets.
    #[serde(default)]
    pub dict_mappers: Vec<RuleSetSpec>,
    /// Legacy rules, treated as one universal set when `dict_mappers` is empty.
    #[serde(default)]
    pub mapping_rules: Vec<MappingRuleSpec>,
    /// Write mapped fields over the incoming payload instead of replacing it.
    #[serde(default)]
    pub keep_source_fields: bool,
}

/// A compiled mapping rule.
#[derive(Debug, Clone)]
pub struct MappingRule {
    source_key: String,
    target_key: String,
    transformer: Option<Transformer>,
    validator: Option<Validator>,
    default_value: Option<Value>,
    required: bool,
    condition: Option<Condition>,
}

impl MappingRule {
    /// A plain copy rule.
    #[must_use]
    pub fn new(source_key: impl Into<String>, target_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            target_key: target_key.into(),
            transformer: None,
            validator: None,
            default_value: None,
            required: false,
            condition: None,
        }
    }

    /// Sets the transformer.
    #[must_use]
    pub const fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Sets the validator.
    #[must_use]
    pub const fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Marks the source field as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Compiles a rule. Unknown transformer or validator names are logged and ignored.
    pub fn compile(spec: MappingRuleSpec) -> Result<Self, MappingError> {
        let transformer = spec.transformer.as_deref().and_then(|name| {
            name.parse::<Transformer>()
                .map_err(|e| warn!(target_key = %spec.target_key, "{e}, value passes through"))
                .ok()
        });
        let validator = spec.validator.as_deref().and_then(|name| {
            name.parse::<Validator>()
                .map_err(|e| warn!(target_key = %spec.target_key, "{e}, check skipped"))
                .ok()
        });
        let condition = spec.condition.map(Condition::compile).transpose()?;
        Ok(Self {
            source_key: spec.source_key,
            target_key: spec.target_key,
            transformer,
            validator,
            default_value: spec.default_value.filter(|v| !v.is_null()),
            required: spec.required,
            condition,
        })
    }

    /// Output field name.
    #[must_use]
    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    /// Computes the rule's value for a source record; `None` writes nothing.
    pub fn apply(&self, source: &Map<String, Value>) -> Result<Option<Value>, MappingError> {
        let Some(raw) = lookup_path(source, &self.source_key) else {
            if self.default_value.is_some() {
                return Ok(self.default_value.clone());
            }
            if self.required {
                return Err(MappingError::MissingRequired {
                    source_key: self.source_key.clone(),
                });
            }
            return Ok(None);
        };

        let value = self
            .transformer
            .map_or_else(|| raw.clone(), |t| t.apply(raw));

        if let Some(validator) = self.validator {
            if !validator.check(&value) {
                return Err(MappingError::ValidationFailed {
                    source_key: self.source_key.clone(),
                    validator,
                });
            }
        }

        if let Some(condition) = &self.condition {
            if !condition.evaluate(source) {
                return Ok(self.default_value.clone());
            }
        }

        Ok(Some(value))
    }
}

/// An ordered list of rules, optionally scoped to one event name.
#[derive(Debug, Clone)]
pub struct RuleSet {
    event_filter: Option<String>,
    rules: Vec<MappingRule>,
}

impl RuleSet {
    /// Creates a rule set. `event_filter = None` makes it universal.
    #[must_use]
    pub fn new(event_filter: Option<&str>, rules: Vec<MappingRule>) -> Self {
        Self {
            event_filter: event_filter.map(ToString::to_string),
            rules,
        }
    }

    /// Compiles a rule set.
    pub fn compile(spec: RuleSetSpec) -> Result<Self, MappingError> {
        Ok(Self {
            event_filter: spec.event_name,
            rules: spec
                .mapping_rules
                .into_iter()
                .map(MappingRule::compile)
                .collect::<Result<_, _>>()?,
        })
    }

    /// The event this set is scoped to.
    #[must_use]
    pub fn event_filter(&self) -> Option<&str> {
        self.event_filter.as_deref()
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the set has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the set applies to a record with this event key.
    ///
    /// Universal sets always apply, and every set applies to a record that
    /// carries no event name. A non-string event matches no filter.
    #[must_use]
    pub fn applies_to(&self, event: EventKey<'_>) -> bool {
        match (&self.event_filter, event) {
            (None, _) | (_, EventKey::Missing) => true,
            (Some(filter), EventKey::Named(name)) => filter == name,
            (Some(_), EventKey::Opaque) => false,
        }
    }

    /// Applies every rule to the source record.
    pub fn map(&self, source: &Map<String, Value>) -> Result<Map<String, Value>, MappingError> {
        let mut out = Map::new();
        for rule in &self.rules {
            if let Some(value) = rule.apply(source)? {
                out.insert(rule.target_key.clone(), value);
            }
        }
        Ok(out)
    }
}

/// A rule set that failed on one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSetFailure {
    /// Filter of the failed set.
    pub event_filter: Option<String>,
    /// What went wrong.
    pub error: MappingError,
}

/// Result of mapping one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingOutcome {
    /// The mapped payload.
    pub output: Map<String, Value>,
    /// Number of sets that applied successfully.
    pub applied_sets: usize,
    /// Sets that applied but failed; their writes are discarded.
    pub failures: Vec<RuleSetFailure>,
}

/// Applies event-scoped rule sets to records.
///
/// Sets apply in declared order and every rule reads the incoming record,
/// so a later write to the same target wins.
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    sets: Vec<RuleSet>,
    keep_source_fields: bool,
}

impl FieldMapper {
    /// Creates a mapper from compiled sets.
    #[must_use]
    pub fn new(sets: Vec<RuleSet>) -> Self {
        Self {
            sets,
            keep_source_fields: false,
        }
    }

    /// Compiles a mapper from configuration.
    pub fn from_config(config: FieldMapperConfig) -> Result<Self, MappingError> {
        let specs = if config.dict_mappers.is_empty() && !config.mapping_rules.is_empty() {
            vec![RuleSetSpec {
                event_name: None,
                mapping_rules: config.mapping_rules,
            }]
        } else {
            config.dict_mappers
        };
        let sets = specs
            .into_iter()
            .map(RuleSet::compile)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            sets,
            keep_source_fields: config.keep_source_fields,
        })
    }

    /// Keeps unmapped source fields in the output.
    #[must_use]
    pub const fn keep_source_fields(mut self, keep: bool) -> Self {
        self.keep_source_fields = keep;
        self
    }

    /// The compiled sets.
    #[must_use]
    pub fn sets(&self) -> &[RuleSet] {
        &self.sets
    }

    /// Maps one record.
    #[must_use]
    pub fn map(&self, source: &Map<String, Value>) -> MappingOutcome {
        let event = event_key_of(source);
        let mut outcome = MappingOutcome {
            output: if self.keep_source_fields {
                source.clone()
            } else {
                Map::new()
            },
            ..MappingOutcome::default()
        };

        for set in self.sets.iter().filter(|s| s.applies_to(event)) {
            match set.map(source) {
                Ok(mapped) => {
                    outcome.output.extend(mapped);
                    outcome.applied_sets += 1;
                }
                Err(error) => outcome.failures.push(RuleSetFailure {
                    event_filter: set.event_filter.clone(),
                    error,
                }),
            }
        }
        outcome
    }
}
