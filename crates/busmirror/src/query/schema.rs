//! Field mapping tables
//!
//! A [`FieldSchema`] tells an instance which bus properties feed which
//! members, how the raw values are formatted and validated on the way in, how
//! derived fields are computed afterwards and which fields get defaults on
//! every read.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use busmirror_types::Value;

use crate::instance::Instance;

/// Pure transformation of one raw property value
pub trait Formatter: Send + Sync {
    fn format(&self, property: &str, value: Value) -> Value;
}

impl<F> Formatter for F
where
    F: Fn(&str, Value) -> Value + Send + Sync,
{
    fn format(&self, property: &str, value: Value) -> Value {
        self(property, value)
    }
}

/// Predicate on a formatted value; a `false` drops the write
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Derives fields that are not a 1:1 property mapping
pub type StaticFieldsHook = Arc<dyn Fn(&Instance) + Send + Sync>;

/// Produces the value a default field is reset to on every read
pub type DefaultValueFn = Arc<dyn Fn(&Instance) -> Value + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Field Mapping
// ─────────────────────────────────────────────────────────────────────────────

/// One `property -> member` row of a mapping table
#[derive(Clone)]
pub struct FieldMapping {
    pub property: String,
    pub member: String,
    formatters: Vec<Arc<dyn Formatter>>,
    validators: Vec<Validator>,
}

impl std::fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMapping")
            .field("property", &self.property)
            .field("member", &self.member)
            .field("formatters", &self.formatters.len())
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl FieldMapping {
    pub fn new(property: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            member: member.into(),
            formatters: Vec::new(),
            validators: Vec::new(),
        }
    }

    /// Property and member share a name
    pub fn same(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), name)
    }

    pub fn with_formatter(mut self, formatter: impl Formatter + 'static) -> Self {
        self.formatters.push(Arc::new(formatter));
        self
    }

    pub fn with_shared_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.formatters.push(formatter);
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Run the formatter chain in order, then every validator.
    ///
    /// Returns `None` when a validator rejects the formatted value.
    pub fn apply(&self, value: Value) -> Option<Value> {
        let formatted = self
            .formatters
            .iter()
            .fold(value, |value, formatter| formatter.format(&self.property, value));
        if self.validators.iter().all(|validate| validate(&formatted)) {
            Some(formatted)
        } else {
            tracing::warn!(
                property = %self.property,
                member = %self.member,
                value = %formatted,
                "Property value rejected by validator"
            );
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field Schema
// ─────────────────────────────────────────────────────────────────────────────

/// Mapping table of one query
#[derive(Clone, Default)]
pub struct FieldSchema {
    interfaces: BTreeMap<String, Vec<FieldMapping>>,
    static_fields: Option<StaticFieldsHook>,
    defaults: Vec<(String, DefaultValueFn)>,
}

impl std::fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSchema")
            .field("interfaces", &self.interfaces)
            .field("static_fields", &self.static_fields.is_some())
            .field("defaults", &self.defaults.len())
            .finish()
    }
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an interface with its mappings.
    ///
    /// A member name may itself be declared as an interface: list elements and
    /// association rows produced by that member are then resolved through it.
    pub fn with_interface(
        mut self,
        interface: impl Into<String>,
        mappings: impl IntoIterator<Item = FieldMapping>,
    ) -> Self {
        self.interfaces
            .entry(interface.into())
            .or_default()
            .extend(mappings);
        self
    }

    pub fn with_field(self, interface: impl Into<String>, mapping: FieldMapping) -> Self {
        self.with_interface(interface, [mapping])
    }

    pub fn with_static_fields<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Instance) + Send + Sync + 'static,
    {
        self.static_fields = Some(Arc::new(hook));
        self
    }

    pub fn with_default<F>(mut self, member: impl Into<String>, producer: F) -> Self
    where
        F: Fn(&Instance) -> Value + Send + Sync + 'static,
    {
        self.defaults.push((member.into(), Arc::new(producer)));
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn declares(&self, interface: &str) -> bool {
        self.interfaces.contains_key(interface)
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.keys().cloned().collect()
    }

    pub fn interface_set(&self) -> BTreeSet<String> {
        self.interfaces.keys().cloned().collect()
    }

    pub fn mappings(&self, interface: &str) -> &[FieldMapping] {
        self.interfaces
            .get(interface)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Declared output members in declaration order, defaults included
    pub fn fields(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut fields = Vec::new();
        let members = self
            .interfaces
            .values()
            .flatten()
            .map(|mapping| mapping.member.as_str())
            .chain(self.defaults.iter().map(|(member, _)| member.as_str()));
        for member in members {
            if seen.insert(member.to_string()) {
                fields.push(member.to_string());
            }
        }
        fields
    }

    pub fn defaults(&self) -> &[(String, DefaultValueFn)] {
        &self.defaults
    }

    /// Run the derived-fields hook, if any
    pub fn run_static_fields(&self, instance: &Instance) {
        if let Some(hook) = &self.static_fields {
            hook(instance);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
