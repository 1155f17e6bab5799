//! Event and function signatures.
//!
//! Signatures come either from human-readable strings such as
//! `Transfer(address indexed from, address indexed to, uint256 value)` and
//! `balanceOf(address owner) returns (uint256)`, or from a JSON ABI file.
//! Decoded values are rendered as JSON: addresses checksummed, bytes as
//! `0x` hex, integers as numbers when they fit in an `i64` and as decimal
//! strings otherwise.

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{hex, keccak256, Bytes, B256};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

/// Errors from parsing signatures or coding ABI data.
#[derive(Debug, Error)]
pub enum AbiError {
    /// A signature string is malformed.
    #[error("invalid signature '{0}'")]
    InvalidSignature(String),

    /// A parameter type is not a valid Solidity type.
    #[error("invalid type '{ty}': {message}")]
    InvalidType {
        /// The type string.
        ty: String,
        /// Parser message.
        message: String,
    },

    /// Call arguments do not match the inputs.
    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount {
        /// Declared inputs.
        expected: usize,
        /// Supplied arguments.
        got: usize,
    },

    /// A JSON argument could not be converted to its Solidity type.
    #[error("cannot encode {value} as {ty}: {message}")]
    Encode {
        /// Target type.
        ty: String,
        /// Offending value.
        value: Value,
        /// Reason.
        message: String,
    },

    /// Log or return data could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// An ABI file could not be read.
    #[error("cannot read ABI file: {0}")]
    Io(#[from] std::io::Error),

    /// An ABI file is not valid JSON ABI.
    #[error("invalid ABI JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One parameter of an event or function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiParam {
    /// Parameter name; `param_{i}` when unnamed.
    pub name: String,
    /// Resolved type.
    pub ty: DynSolType,
    /// Whether the parameter is carried in a topic.
    pub indexed: bool,
}

impl AbiParam {
    fn new(name: &str, ty: &str, indexed: bool, position: usize) -> Result<Self, AbiError> {
        let ty = DynSolType::parse(ty).map_err(|e| AbiError::InvalidType {
            ty: ty.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            name: if name.is_empty() {
                format!("param_{position}")
            } else {
                name.to_string()
            },
            ty,
            indexed,
        })
    }

    /// Indexed values of these types are stored as their keccak hash.
    const fn is_hashed_in_topic(&self) -> bool {
        matches!(
            self.ty,
            DynSolType::String
                | DynSolType::Bytes
                | DynSolType::Array(_)
                | DynSolType::FixedArray(..)
                | DynSolType::Tuple(_)
        )
    }
}

/// A parsed event definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSignature {
    /// Event name.
    pub name: String,
    /// Canonical `Name(type,...)` form.
    pub canonical: String,
    /// Hash of the canonical form, carried in `topic0`.
    pub topic0: B256,
    /// Parameters in declaration order.
    pub params: Vec<AbiParam>,
}

impl EventSignature {
    /// Parses `Name(type [indexed] [name], ...)`, with an optional `event ` prefix.
    pub fn parse(signature: &str) -> Result<Self, AbiError> {
        let signature = signature.trim();
        let signature = signature.strip_prefix("event ").unwrap_or(signature).trim();
        let (name, params, _) = split_signature(signature)?;
        let params = params
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let p = parse_param(raw);
                AbiParam::new(p.name, p.ty, p.indexed, i)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_params(name, params))
    }

    fn from_params(name: &str, params: Vec<AbiParam>) -> Self {
        let canonical = canonical(name, &params);
        Self {
            name: name.to_string(),
            topic0: keccak256(canonical.as_bytes()),
            canonical,
            params,
        }
    }

    /// Decodes a log's topics and data into named JSON arguments.
    pub fn decode_log(&self, topics: &[B256], data: &[u8]) -> Result<Map<String, Value>, AbiError> {
        let indexed: Vec<_> = self.params.iter().filter(|p| p.indexed).collect();
        if topics.len() < indexed.len() + 1 {
            return Err(AbiError::Decode(format!(
                "{} expects {} topics, log has {}",
                self.name,
                indexed.len() + 1,
                topics.len()
            )));
        }

        let data_types: Vec<_> = self
            .params
            .iter()
            .filter(|p| !p.indexed)
            .map(|p| p.ty.clone())
            .collect();
        let mut data_values = if data_types.is_empty() {
            Vec::new()
        } else {
            match DynSolType::Tuple(data_types)
                .abi_decode_params(data)
                .map_err(|e| AbiError::Decode(e.to_string()))?
            {
                DynSolValue::Tuple(values) => values,
                other => vec![other],
            }
        }
        .into_iter();

        let mut topic_values = topics[1..].iter();
        let mut args = Map::new();
        for param in &self.params {
            let value = if param.indexed {
                let topic = topic_values
                    .next()
                    .ok_or_else(|| AbiError::Decode("topic missing".to_string()))?;
                if param.is_hashed_in_topic() {
                    Value::String(topic.to_string())
                } else {
                    let decoded = param
                        .ty
                        .abi_decode(topic.as_slice())
                        .map_err(|e| AbiError::Decode(e.to_string()))?;
                    to_json(&decoded)
                }
            } else {
                let decoded = data_values
                    .next()
                    .ok_or_else(|| AbiError::Decode("data value missing".to_string()))?;
                to_json(&decoded)
            };
            args.insert(param.name.clone(), value);
        }
        Ok(args)
    }
}

/// A parsed function definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    /// Function name.
    pub name: String,
    /// Canonical `name(type,...)` form.
    pub canonical: String,
    /// First four bytes of the canonical form's hash.
    pub selector: [u8; 4],
    /// Inputs.
    pub inputs: Vec<AbiParam>,
    /// Outputs; empty when unknown.
    pub outputs: Vec<AbiParam>,
}

impl FunctionSignature {
    /// Parses `name(type [name], ...) [modifiers] [returns (type, ...)]`.
    pub fn parse(signature: &str) -> Result<Self, AbiError> {
        let signature = signature.trim();
        let signature = signature.strip_prefix("function ").unwrap_or(signature).trim();
        let (name, inputs, rest) = split_signature(signature)?;
        let inputs = params_from_raw(&inputs)?;
        let outputs = match rest.find("returns") {
            Some(pos) => {
                let returns = format!("r{}", rest[pos + "returns".len()..].trim());
                let (_, outputs, _) = split_signature(&returns)?;
                params_from_raw(&outputs)?
            }
            None => Vec::new(),
        };
        Ok(Self::from_params(name, inputs, outputs))
    }

    fn from_params(name: &str, inputs: Vec<AbiParam>, outputs: Vec<AbiParam>) -> Self {
        let canonical = canonical(name, &inputs);
        let hash = keccak256(canonical.as_bytes());
        Self {
            name: name.to_string(),
            selector: [hash[0], hash[1], hash[2], hash[3]],
            canonical,
            inputs,
            outputs,
        }
    }

    /// Replaces the outputs with the given type list.
    pub fn with_output_types(mut self, types: &[String]) -> Result<Self, AbiError> {
        self.outputs = types
            .iter()
            .enumerate()
            .map(|(i, ty)| AbiParam::new("", ty, false, i))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    /// Builds call data from JSON arguments.
    pub fn encode_call(&self, args: &[Value]) -> Result<Bytes, AbiError> {
        if args.len() != self.inputs.len() {
            return Err(AbiError::ArgumentCount {
                expected: self.inputs.len(),
                got: args.len(),
            });
        }
        let values = self
            .inputs
            .iter()
            .zip(args)
            .map(|(param, arg)| coerce(&param.ty, arg))
            .collect::<Result<Vec<_>, _>>()?;
        let mut data = self.selector.to_vec();
        data.extend(DynSolValue::Tuple(values).abi_encode_params());
        Ok(Bytes::from(data))
    }

    /// Decodes return data: one output as a value, several as an array.
    ///
    /// Without declared outputs the raw data is returned as hex.
    pub fn decode_output(&self, data: &[u8]) -> Result<Value, AbiError> {
        if self.outputs.is_empty() {
            return Ok(Value::String(hex::encode_prefixed(data)));
        }
        let types = self.outputs.iter().map(|p| p.ty.clone()).collect();
        let decoded = DynSolType::Tuple(types)
            .abi_decode_params(data)
            .map_err(|e| AbiError::Decode(e.to_string()))?;
        let mut values = match decoded {
            DynSolValue::Tuple(values) => values,
            other => vec![other],
        };
        Ok(if values.len() == 1 {
            to_json(&values.remove(0))
        } else {
            Value::Array(values.iter().map(to_json).collect())
        })
    }
}

/// Events and functions loaded from a JSON ABI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Abi {
    /// Events in file order.
    pub events: Vec<EventSignature>,
    /// Functions in file order.
    pub functions: Vec<FunctionSignature>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AbiDocument {
    Entries(Vec<AbiEntry>),
    Artifact { abi: Vec<AbiEntry> },
}

#[derive(Debug, Deserialize)]
struct AbiEntry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<JsonParam>,
    #[serde(default)]
    outputs: Vec<JsonParam>,
    #[serde(default)]
    anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct JsonParam {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    indexed: bool,
    #[serde(default)]
    components: Vec<JsonParam>,
}

impl JsonParam {
    /// Solidity type string, expanding `tuple` into its components.
    fn type_string(&self) -> String {
        match self.ty.strip_prefix("tuple") {
            Some(suffix) => {
                let inner: Vec<_> = self.components.iter().map(Self::type_string).collect();
                format!("({}){suffix}", inner.join(","))
            }
            None => self.ty.clone(),
        }
    }

    fn into_param(self, position: usize) -> Result<AbiParam, AbiError> {
        AbiParam::new(&self.name, &self.type_string(), self.indexed, position)
    }
}

impl Abi {
    /// Parses a JSON ABI: either a bare entry array or an object with an `abi` field.
    pub fn from_json(json: &str) -> Result<Self, AbiError> {
        let entries = match serde_json::from_str::<AbiDocument>(json)? {
            AbiDocument::Entries(entries) | AbiDocument::Artifact { abi: entries } => entries,
        };
        let mut abi = Self::default();
        for entry in entries {
            match entry.kind.as_str() {
                "event" if !entry.anonymous => {
                    let params = json_params(entry.inputs)?;
                    abi.events.push(EventSignature::from_params(&entry.name, params));
                }
                "function" => {
                    let inputs = json_params(entry.inputs)?;
                    let outputs = json_params(entry.outputs)?;
                    abi.functions
                        .push(FunctionSignature::from_params(&entry.name, inputs, outputs));
                }
                _ => {}
            }
        }
        Ok(abi)
    }

    /// Reads and parses an ABI file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AbiError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Looks up an event by name.
    #[must_use]
    pub fn event(&self, name: &str) -> Option<&EventSignature> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Looks up a function by name (first overload).
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.iter().find(|f| f.name == name)
    }
}

fn json_params(params: Vec<JsonParam>) -> Result<Vec<AbiParam>, AbiError> {
    params
        .into_iter()
        .enumerate()
        .map(|(i, p)| p.into_param(i))
        .collect()
}

/// Converts a decoded ABI value to JSON.
#[must_use]
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => integer(i.to_string()),
        DynSolValue::Uint(u, _) => integer(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(hex::encode_prefixed(&word[..(*size).min(32)]))
        }
        DynSolValue::Address(a) => Value::String(a.to_checksum(None)),
        DynSolValue::Function(f) => Value::String(f.to_string()),
        DynSolValue::Bytes(b) => Value::String(hex::encode_prefixed(b)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}

/// Integers that fit an `i64` become JSON numbers, wider ones decimal strings.
fn integer(decimal: String) -> Value {
    decimal
        .parse::<i64>()
        .map_or_else(|_| Value::String(decimal), Value::from)
}

/// Converts a JSON argument to an ABI value of type `ty`.
fn coerce(ty: &DynSolType, value: &Value) -> Result<DynSolValue, AbiError> {
    let fail = |message: String| AbiError::Encode {
        ty: ty.sol_type_name().into_owned(),
        value: value.clone(),
        message,
    };
    match (ty, value) {
        (DynSolType::Array(inner), Value::Array(items)) => Ok(DynSolValue::Array(
            items.iter().map(|v| coerce(inner, v)).collect::<Result<_, _>>()?,
        )),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) => {
            if items.len() != *len {
                return Err(fail(format!("expected {len} items")));
            }
            Ok(DynSolValue::FixedArray(
                items.iter().map(|v| coerce(inner, v)).collect::<Result<_, _>>()?,
            ))
        }
        (DynSolType::Tuple(types), Value::Array(items)) => {
            if items.len() != types.len() {
                return Err(fail(format!("expected {} items", types.len())));
            }
            Ok(DynSolValue::Tuple(
                types
                    .iter()
                    .zip(items)
                    .map(|(t, v)| coerce(t, v))
                    .collect::<Result<_, _>>()?,
            ))
        }
        (_, Value::String(s)) => ty.coerce_str(s).map_err(|e| fail(e.to_string())),
        (_, Value::Number(n)) => ty.coerce_str(&n.to_string()).map_err(|e| fail(e.to_string())),
        (_, Value::Bool(b)) => ty.coerce_str(&b.to_string()).map_err(|e| fail(e.to_string())),
        _ => Err(fail("unsupported JSON value".to_string())),
    }
}

struct RawParam<'a> {
    ty: &'a str,
    name: &'a str,
    indexed: bool,
}

/// Splits a parameter such as `address indexed from` into its parts.
fn parse_param(raw: &str) -> RawParam<'_> {
    let raw = raw.trim();
    let type_end = if raw.starts_with('(') {
        matching_close(raw, 0).map_or(raw.len(), |close| {
            raw[close..]
                .find(char::is_whitespace)
                .map_or(raw.len(), |ws| close + ws)
        })
    } else {
        raw.find(char::is_whitespace).unwrap_or(raw.len())
    };
    let (ty, rest) = raw.split_at(type_end);
    let mut indexed = false;
    let mut name = "";
    for word in rest.split_whitespace() {
        match word {
            "indexed" => indexed = true,
            "memory" | "calldata" | "storage" => {}
            other => name = other,
        }
    }
    RawParam { ty, name, indexed }
}

fn params_from_raw(raw: &[&str]) -> Result<Vec<AbiParam>, AbiError> {
    raw.iter()
        .enumerate()
        .map(|(i, r)| {
            let p = parse_param(r);
            AbiParam::new(p.name, p.ty, p.indexed, i)
        })
        .collect()
}

/// Splits `name(a, b) rest` into the name, the top-level parameter strings and the rest.
fn split_signature(signature: &str) -> Result<(&str, Vec<&str>, &str), AbiError> {
    let invalid = || AbiError::InvalidSignature(signature.to_string());
    let open = signature.find('(').ok_or_else(invalid)?;
    let name = signature[..open].trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(invalid());
    }
    let close = matching_close(signature, open).ok_or_else(invalid)?;
    let inner = &signature[open + 1..close];

    let mut params = Vec::new();
    let mut depth = 0_i32;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                params.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = inner[start..].trim();
    if !last.is_empty() {
        params.push(last);
    }
    if params.iter().any(|p| p.is_empty()) {
        return Err(invalid());
    }
    Ok((name, params, signature[close + 1..].trim()))
}

fn matching_close(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0_i32;
    for (i, c) in s[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn canonical(name: &str, params: &[AbiParam]) -> String {
    let types: Vec<_> = params.iter().map(|p| p.ty.sol_type_name()).collect();
    format!("{name}({})", types.join(","))
}
