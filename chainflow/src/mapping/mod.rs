//! Multi-rule field mapping.
//!
//! A [`FieldMapper`] holds an ordered list of rule sets. Each set may be
//! scoped to one event name; sets without a filter apply to every record.
//! Records without an event name get every set.

mod condition;
mod mapper;
mod transform;
mod validate;

pub use condition::{Condition, ConditionKind, ConditionSpec};
pub use mapper::{
    FieldMapper, FieldMapperConfig, MappingError, MappingOutcome, MappingRule, MappingRuleSpec, RuleSet,
    RuleSetFailure, RuleSetSpec,
};
pub use transform::Transformer;
pub use validate::Validator;
