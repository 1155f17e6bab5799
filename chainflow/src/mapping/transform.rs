//! Built-in value transformers.
//!
//! Transformers never fail: values that cannot be converted fall back to a
//! neutral value (`0`, `0.0`, `""`) or are passed through as text.

use alloy_primitives::U256;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Number, Value};
use std::fmt;
use std::str::FromStr;

/// Token amounts are scaled by this many decimals in `format_amount`.
const AMOUNT_DECIMALS: i32 = 18;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A named value conversion applied by a mapping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformer {
    /// Render as text.
    ToString,
    /// Truncate to an integer.
    ToInt,
    /// Convert to a float.
    ToFloat,
    /// Interpret as a boolean.
    ToBool,
    /// Upper-case text.
    ToUppercase,
    /// Lower-case text.
    ToLowercase,
    /// Strip surrounding whitespace.
    Trim,
    /// Lower-case `0x` addresses.
    FormatAddress,
    /// Scale a raw 18-decimal amount, six fractional digits.
    FormatAmount,
    /// Render epoch seconds or ISO-8601 text as `YYYY-MM-DD HH:MM:SS` (UTC).
    FormatTimestamp,
}

impl Transformer {
    /// The configuration name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ToString => "to_string",
            Self::ToInt => "to_int",
            Self::ToFloat => "to_float",
            Self::ToBool => "to_bool",
            Self::ToUppercase => "to_uppercase",
            Self::ToLowercase => "to_lowercase",
            Self::Trim => "trim",
            Self::FormatAddress => "format_address",
            Self::FormatAmount => "format_amount",
            Self::FormatTimestamp => "format_timestamp",
        }
    }

    /// Applies the conversion.
    #[must_use]
    pub fn apply(self, value: &Value) -> Value {
        match self {
            Self::ToString => Value::String(text(value)),
            Self::ToInt => to_int(value),
            Self::ToFloat => {
                Value::Number(Number::from_f64(as_f64(value).unwrap_or(0.0)).unwrap_or_else(|| 0.into()))
            }
            Self::ToBool => Value::Bool(to_bool(value)),
            Self::ToUppercase => Value::String(text(value).to_uppercase()),
            Self::ToLowercase => Value::String(text(value).to_lowercase()),
            Self::Trim => Value::String(text(value).trim().to_string()),
            Self::FormatAddress => Value::String(format_address(value)),
            Self::FormatAmount => Value::String(format_amount(value)),
            Self::FormatTimestamp => Value::String(format_timestamp(value)),
        }
    }
}

impl fmt::Display for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transformer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "to_string" => Self::ToString,
            "to_int" => Self::ToInt,
            "to_float" => Self::ToFloat,
            "to_bool" => Self::ToBool,
            "to_uppercase" => Self::ToUppercase,
            "to_lowercase" => Self::ToLowercase,
            "trim" => Self::Trim,
            "format_address" => Self::FormatAddress,
            "format_amount" => Self::FormatAmount,
            "format_timestamp" => Self::FormatTimestamp,
            other => return Err(format!("unknown transformer: {other}")),
        })
    }
}

/// Text form of a value; strings are not quoted.
pub(crate) fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numeric reading of numbers, numeric strings and booleans.
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_int(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => value.clone(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Value::from(i);
            }
            if let Ok(u) = s.parse::<u64>() {
                return Value::from(u);
            }
            // Integers wider than 64 bits stay as exact decimal text.
            if let Ok(big) = U256::from_str_radix(s, 10) {
                return Value::String(big.to_string());
            }
            as_f64(value).map_or_else(|| Value::from(0), |f| Value::from(f.trunc() as i64))
        }
        _ => as_f64(value).map_or_else(|| Value::from(0), |f| Value::from(f.trunc() as i64)),
    }
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

fn format_address(value: &Value) -> String {
    let raw = text(value);
    let addr = raw.trim();
    if addr.starts_with("0x") {
        addr.to_lowercase()
    } else {
        addr.to_string()
    }
}

fn format_amount(value: &Value) -> String {
    as_f64(value).map_or_else(
        || text(value),
        |raw| format!("{:.6}", raw / 10f64.powi(AMOUNT_DECIMALS)),
    )
}

#[allow(clippy::cast_possible_truncation)]
fn format_timestamp(value: &Value) -> String {
    let parsed = match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs.trunc() as i64, 0)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                ["%Y-%m-%dT%H:%M:%S", TIMESTAMP_FORMAT]
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    };
    parsed.map_or_else(
        || text(value),
        |dt| dt.format(TIMESTAMP_FORMAT).to_string(),
    )
}
