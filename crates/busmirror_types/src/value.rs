//! Typed property value carried by the object bus and stored in the cache
//!
//! `Value` is a closed union over every property shape the cache understands:
//! scalars, the three scalar lists, association triples, an explicit null and
//! the "not available" marker used for fields that never resolved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Text rendered for a field that could not be resolved
pub const NOT_AVAILABLE: &str = "N/A";

/// Property name to value, as returned by a "get all properties" call
pub type PropertyMap = BTreeMap<String, Value>;

/// Interface name to its properties
pub type InterfaceMap = BTreeMap<String, PropertyMap>;

// ─────────────────────────────────────────────────────────────────────────────
// Association
// ─────────────────────────────────────────────────────────────────────────────

/// One association triple published by a bus object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Association {
    /// Forward relation name, as seen from the publishing object
    pub source: String,
    /// Reverse relation name, as seen from the endpoint
    pub destination: String,
    /// Object path on the other side of the association
    pub endpoint: String,
}

impl Association {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            endpoint: endpoint.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// Value of a bus property or of a cached member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Explicit empty value
    Null,
    /// Field exists in the schema but was never resolved
    NotAvailable,
    Bool(bool),
    Int(i64),
    #[serde(rename = "uint")]
    UInt(u64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
    FloatList(Vec<f64>),
    IntList(Vec<i64>),
    Associations(Vec<Association>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

/// How field resolution treats a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// Written straight into a member
    Scalar,
    /// Exploded into one child row per element
    List,
    /// Exploded into one child row per association triple
    Associations,
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Accessors
// ─────────────────────────────────────────────────────────────────────────────

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_not_available(&self) -> bool {
        matches!(self, Value::NotAvailable)
    }

    /// Classify the value for field resolution
    pub fn shape(&self) -> ValueShape {
        match self {
            Value::StringList(_) | Value::FloatList(_) | Value::IntList(_) => ValueShape::List,
            Value::Associations(_) => ValueShape::Associations,
            _ => ValueShape::Scalar,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 (unsigned values convert when they fit)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Get as u64 (signed values convert when non-negative)
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Get as f64 (also converts from integers)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Value::StringList(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_associations(&self) -> Option<&[Association]> {
        match self {
            Value::Associations(list) => Some(list),
            _ => None,
        }
    }

    /// Split a list value into one scalar value per element
    pub fn list_elements(&self) -> Option<Vec<Value>> {
        match self {
            Value::StringList(list) => Some(list.iter().cloned().map(Value::String).collect()),
            Value::FloatList(list) => Some(list.iter().copied().map(Value::Float).collect()),
            Value::IntList(list) => Some(list.iter().copied().map(Value::Int).collect()),
            _ => None,
        }
    }

    /// Whether both values hold the same alternative
    pub fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::NotAvailable => "not-available",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::StringList(_) => "string-list",
            Value::FloatList(_) => "float-list",
            Value::IntList(_) => "int-list",
            Value::Associations(_) => "associations",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::NotAvailable => write!(f, "{}", NOT_AVAILABLE),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::StringList(list) => write!(f, "[{}]", list.join(", ")),
            Value::FloatList(list) => {
                let items: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::IntList(list) => {
                let items: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Associations(list) => {
                let items: Vec<String> = list
                    .iter()
                    .map(|a| format!("({}, {}, {})", a.source, a.destination, a.endpoint))
                    .collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// From Implementations
// ─────────────────────────────────────────────────────────────────────────────

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringList(v)
    }
}

impl From<Vec<&str>> for Value {
    fn from(v: Vec<&str>) -> Self {
        Value::StringList(v.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::FloatList(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::IntList(v)
    }
}

impl From<Vec<Association>> for Value {
    fn from(v: Vec<Association>) -> Self {
        Value::Associations(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serde_json::Value Interop
// ─────────────────────────────────────────────────────────────────────────────

/// Plain JSON rendering, used when the cache is dumped for consumers
impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::NotAvailable => serde_json::Value::String(NOT_AVAILABLE.to_string()),
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::UInt(u) => serde_json::Value::Number(u.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::StringList(list) => {
                serde_json::Value::Array(list.into_iter().map(serde_json::Value::String).collect())
            }
            Value::FloatList(list) => serde_json::Value::Array(
                list.into_iter()
                    .map(|f| serde_json::Value::from(Value::Float(f)))
                    .collect(),
            ),
            Value::IntList(list) => serde_json::Value::Array(
                list.into_iter()
                    .map(|i| serde_json::Value::Number(i.into()))
                    .collect(),
            ),
            Value::Associations(list) => serde_json::Value::Array(
                list.into_iter()
                    .map(|a| {
                        serde_json::json!({
                            "source": a.source,
                            "destination": a.destination,
                            "endpoint": a.endpoint,
                        })
                    })
                    .collect(),
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TryFrom Implementations
// ─────────────────────────────────────────────────────────────────────────────

/// Error when converting from Value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueConversionError {
    #[error("Expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Integer overflow")]
    IntegerOverflow,
}

impl TryFrom<Value> for bool {
    type Error = ValueConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        v.as_bool().ok_or(ValueConversionError::TypeMismatch {
            expected: "bool",
            actual: v.type_name(),
        })
    }
}

impl TryFrom<Value> for i64 {
    type Error = ValueConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::Int(i) => Ok(i),
            Value::UInt(u) => i64::try_from(u).map_err(|_| ValueConversionError::IntegerOverflow),
            _ => Err(ValueConversionError::TypeMismatch {
                expected: "int",
                actual: v.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for u64 {
    type Error = ValueConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::UInt(u) => Ok(u),
            Value::Int(i) => u64::try_from(i).map_err(|_| ValueConversionError::IntegerOverflow),
            _ => Err(ValueConversionError::TypeMismatch {
                expected: "uint",
                actual: v.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = ValueConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        v.as_f64().ok_or(ValueConversionError::TypeMismatch {
            expected: "float",
            actual: v.type_name(),
        })
    }
}

impl TryFrom<Value> for String {
    type Error = ValueConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::String(s) => Ok(s),
            _ => Err(ValueConversionError::TypeMismatch {
                expected: "string",
                actual: v.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for Vec<String> {
    type Error = ValueConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::StringList(list) => Ok(list),
            _ => Err(ValueConversionError::TypeMismatch {
                expected: "string-list",
                actual: v.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for Vec<Association> {
    type Error = ValueConversionError;
    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::Associations(list) => Ok(list),
            _ => Err(ValueConversionError::TypeMismatch {
                expected: "associations",
                actual: v.type_name(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
