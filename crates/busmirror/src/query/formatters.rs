//! Built-in property formatters

use std::collections::BTreeMap;
use std::sync::Arc;

use busmirror_types::{Value, last_segment_name};

use super::Formatter;

/// Last `.` segment of a fully qualified bus enum string
/// (`xyz.openbmc_project.State.Host.HostState.Running` -> `Running`)
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumSuffix;

impl Formatter for EnumSuffix {
    fn format(&self, property: &str, value: Value) -> Value {
        let suffix = value
            .as_str()
            .and_then(|text| text.rsplit_once('.'))
            .map(|(_, suffix)| suffix.to_string());
        match suffix {
            Some(suffix) => Value::String(suffix),
            None => {
                tracing::error!(property = %property, value = %value, "Malformed bus enum value");
                Value::NotAvailable
            }
        }
    }
}

/// String to string lookup table
#[derive(Debug, Clone, Default)]
pub struct StringDict {
    entries: BTreeMap<String, String>,
}

impl StringDict {
    pub fn new<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Formatter for StringDict {
    fn format(&self, property: &str, value: Value) -> Value {
        match value.as_str().and_then(|text| self.entries.get(text)) {
            Some(mapped) => Value::String(mapped.clone()),
            None => {
                tracing::warn!(property = %property, value = %value, "Value missing from lookup table");
                Value::NotAvailable
            }
        }
    }
}

/// String to integer enumeration, with a fallback for unknown input
#[derive(Debug, Clone)]
pub struct EnumDict {
    entries: BTreeMap<String, i64>,
    fallback: i64,
}

impl EnumDict {
    pub fn new<K>(entries: impl IntoIterator<Item = (K, i64)>, fallback: i64) -> Self
    where
        K: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            fallback,
        }
    }
}

impl Formatter for EnumDict {
    fn format(&self, _property: &str, value: Value) -> Value {
        let mapped = value
            .as_str()
            .and_then(|text| self.entries.get(text))
            .copied()
            .unwrap_or(self.fallback);
        Value::Int(mapped)
    }
}

/// Last object path segment, underscores turned into spaces
#[derive(Debug, Clone, Copy, Default)]
pub struct LastSegmentName;

impl Formatter for LastSegmentName {
    fn format(&self, _property: &str, value: Value) -> Value {
        match value.as_str() {
            Some(path) => Value::String(last_segment_name(path, true)),
            None => value,
        }
    }
}

/// Integer milliseconds to floating point seconds
#[derive(Debug, Clone, Copy, Default)]
pub struct MillisToSeconds;

impl Formatter for MillisToSeconds {
    fn format(&self, _property: &str, value: Value) -> Value {
        match value.as_i64().or_else(|| value.as_f64().map(|f| f as i64)) {
            Some(millis) => Value::Float(millis as f64 / 1000.0),
            None => value,
        }
    }
}

/// Built-in formatter registered under `name`
pub fn formatter_by_name(name: &str) -> Option<Arc<dyn Formatter>> {
    match name {
        "enum_suffix" => Some(Arc::new(EnumSuffix)),
        "last_segment_name" => Some(Arc::new(LastSegmentName)),
        "millis_to_secs" => Some(Arc::new(MillisToSeconds)),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_suffix() {
        let value = Value::from("xyz.openbmc_project.State.Host.HostState.Running");
        assert_eq!(EnumSuffix.format("CurrentHostState", value), Value::from("Running"));
        assert_eq!(EnumSuffix.format("CurrentHostState", Value::from("Running")), Value::NotAvailable);
        assert_eq!(EnumSuffix.format("CurrentHostState", Value::Int(3)), Value::NotAvailable);
    }

    #[test]
    fn test_string_dict() {
        let dict = StringDict::new([("priv-admin", "Administrator"), ("priv-user", "ReadOnly")]);
        assert_eq!(dict.format("UserPrivilege", Value::from("priv-admin")), Value::from("Administrator"));
        assert_eq!(dict.format("UserPrivilege", Value::from("priv-none")), Value::NotAvailable);
    }

    #[test]
    fn test_enum_dict_fallback() {
        let dict = EnumDict::new([("Enabled", 1), ("Disabled", 2)], 0);
        assert_eq!(dict.format("State", Value::from("Disabled")), Value::Int(2));
        assert_eq!(dict.format("State", Value::from("Unknown")), Value::Int(0));
    }

    #[test]
    fn test_last_segment_and_millis() {
        assert_eq!(
            LastSegmentName.format("Path", Value::from("/xyz/openbmc_project/sensors/cpu_temp")),
            Value::from("cpu temp")
        );
        assert_eq!(MillisToSeconds.format("Interval", Value::UInt(1500)), Value::Float(1.5));
    }

    #[test]
    fn test_lookup_by_name() {
        assert!(formatter_by_name("enum_suffix").is_some());
        assert!(formatter_by_name("millis_to_secs").is_some());
        assert!(formatter_by_name("nope").is_none());
    }
}
