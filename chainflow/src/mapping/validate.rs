//! Built-in value validators.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::transform::as_f64;

/// A named check applied to a rule's (transformed) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    /// Not null, not blank text, not an empty collection.
    IsNotEmpty,
    /// Plausible e-mail address.
    IsValidEmail,
    /// `0x` followed by 40 hex digits.
    IsValidAddress,
    /// `0x` followed by 64 hex digits.
    IsValidHash,
    /// Numeric and greater than zero.
    IsPositiveNumber,
}

impl Validator {
    /// The configuration name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IsNotEmpty => "is_not_empty",
            Self::IsValidEmail => "is_valid_email",
            Self::IsValidAddress => "is_valid_address",
            Self::IsValidHash => "is_valid_hash",
            Self::IsPositiveNumber => "is_positive_number",
        }
    }

    /// Returns true if the value passes.
    #[must_use]
    pub fn check(self, value: &Value) -> bool {
        match self {
            Self::IsNotEmpty => match value {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            },
            Self::IsValidEmail => value.as_str().is_some_and(is_email),
            Self::IsValidAddress => value.as_str().is_some_and(|s| is_prefixed_hex(s, 40)),
            Self::IsValidHash => value.as_str().is_some_and(|s| is_prefixed_hex(s, 64)),
            Self::IsPositiveNumber => as_f64(value).is_some_and(|n| n > 0.0),
        }
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Validator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "is_not_empty" => Self::IsNotEmpty,
            "is_valid_email" => Self::IsValidEmail,
            "is_valid_address" => Self::IsValidAddress,
            "is_valid_hash" => Self::IsValidHash,
            "is_positive_number" => Self::IsPositiveNumber,
            other => return Err(format!("unknown validator: {other}")),
        })
    }
}

fn is_prefixed_hex(s: &str, digits: usize) -> bool {
    s.strip_prefix("0x")
        .is_some_and(|hex| hex.len() == digits && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ".-".contains(c));
    local_ok && host_ok && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_not_empty() {
        assert!(!Validator::IsNotEmpty.check(&json!("   ")));
        assert!(!Validator::IsNotEmpty.check(&json!([])));
        assert!(Validator::IsNotEmpty.check(&json!(0)));
        assert!(Validator::IsNotEmpty.check(&json!({"a": 1})));
    }

    #[test]
    fn test_address_and_hash() {
        let addr = format!("0x{}", "a".repeat(40));
        let hash = format!("0x{}", "F".repeat(64));
        assert!(Validator::IsValidAddress.check(&json!(addr)));
        assert!(!Validator::IsValidAddress.check(&json!(hash)));
        assert!(Validator::IsValidHash.check(&json!(hash)));
        assert!(!Validator::IsValidHash.check(&json!("0xzz")));
        assert!(!Validator::IsValidAddress.check(&json!(42)));
    }

    #[test]
    fn test_positive_number() {
        assert!(Validator::IsPositiveNumber.check(&json!("0.5")));
        assert!(!Validator::IsPositiveNumber.check(&json!(-1)));
        assert!(!Validator::IsPositiveNumber.check(&json!("many")));
    }

    #[test]
    fn test_email() {
        assert!(Validator::IsValidEmail.check(&json!("ops@example.io")));
        assert!(!Validator::IsValidEmail.check(&json!("ops@example")));
        assert!(!Validator::IsValidEmail.check(&json!("@example.io")));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("is_valid_hash".parse(), Ok(Validator::IsValidHash));
        assert!("is_prime".parse::<Validator>().is_err());
    }
}
