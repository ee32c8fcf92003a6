//! Instance model
//!
//! An [`Instance`] is the cached snapshot of one bus object: a bag of typed
//! members filled from property maps through the owning query's
//! [`FieldSchema`]. List and association properties are exploded into complex
//! child instances, each addressable by its own identity hash.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use busmirror_bus::{Connection, MatchRule, Signal, Watcher, well_known};
use busmirror_types::{Association, PropertyMap, Value, ValueShape};
use parking_lot::{Mutex, RwLock};

use crate::definitions::{META_OBJECT_PATH, META_OBJECT_SERVICE, is_meta_field, relations};
use crate::error::{CoreError, CoreResult};
use crate::query::FieldSchema;

/// Identity hash of an instance
pub type InstanceHash = u64;

/// Shared handle to an instance
pub type InstancePtr = Arc<Instance>;

/// Identity hash of the object `path` published by `service`
pub fn instance_hash(service: &str, path: &str) -> InstanceHash {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    let path_hash = hasher.finish();

    let mut hasher = DefaultHasher::new();
    service.hash(&mut hasher);
    let service_hash = hasher.finish();

    path_hash ^ (service_hash << 1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Member Instance
// ─────────────────────────────────────────────────────────────────────────────

/// Value of one member read from an instance
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInstance {
    name: String,
    value: Value,
}

impl MemberInstance {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn string_value(&self) -> CoreResult<String> {
        Ok(String::try_from(self.value.clone())?)
    }

    pub fn int_value(&self) -> CoreResult<i64> {
        Ok(i64::try_from(self.value.clone())?)
    }

    pub fn float_value(&self) -> CoreResult<f64> {
        Ok(f64::try_from(self.value.clone())?)
    }

    pub fn bool_value(&self) -> CoreResult<bool> {
        Ok(bool::try_from(self.value.clone())?)
    }

    /// True for explicit nulls and for fields that never resolved
    pub fn is_null(&self) -> bool {
        self.value.is_null() || self.value.is_not_available()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct InstanceState {
    fields: BTreeMap<String, Value>,
    complex: BTreeMap<InstanceHash, InstancePtr>,
    interfaces: BTreeSet<String>,
}

/// Cached snapshot of one bus object
pub struct Instance {
    service: String,
    path: String,
    hash: InstanceHash,
    schema: Arc<FieldSchema>,
    child: bool,
    state: RwLock<InstanceState>,
    watchers: Mutex<Vec<Watcher>>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Instance")
            .field("service", &self.service)
            .field("path", &self.path)
            .field("hash", &self.hash)
            .field("fields", &state.fields)
            .field("complex", &state.complex.len())
            .finish()
    }
}

impl Instance {
    /// Instance for an object carrying `interfaces`; metadata members are set
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        interfaces: impl IntoIterator<Item = String>,
        schema: Arc<FieldSchema>,
    ) -> Self {
        Self::build(service.into(), path.into(), interfaces.into_iter().collect(), schema, false)
    }

    fn build(
        service: String,
        path: String,
        interfaces: BTreeSet<String>,
        schema: Arc<FieldSchema>,
        child: bool,
    ) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(META_OBJECT_PATH.to_string(), Value::String(path.clone()));
        fields.insert(META_OBJECT_SERVICE.to_string(), Value::String(service.clone()));
        Self {
            hash: instance_hash(&service, &path),
            service,
            path,
            schema,
            child,
            state: RwLock::new(InstanceState {
                fields,
                complex: BTreeMap::new(),
                interfaces,
            }),
            watchers: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn new_child(&self, path: String) -> Self {
        let interfaces = self.state.read().interfaces.clone();
        Self::build(self.service.clone(), path, interfaces, Arc::clone(&self.schema), true)
    }

    pub fn into_shared(self) -> InstancePtr {
        Arc::new(self)
    }

    pub fn hash(&self) -> InstanceHash {
        self.hash
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    /// Whether this row was produced by list or association expansion
    pub fn is_child(&self) -> bool {
        self.child
    }

    /// Interfaces this instance holds data for
    pub fn interfaces(&self) -> Vec<String> {
        self.state.read().interfaces.iter().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Field access
    // ─────────────────────────────────────────────────────────────────────────

    /// Lenient read: absent members read back as not available
    pub fn field(&self, member: &str) -> MemberInstance {
        let value = self
            .state
            .read()
            .fields
            .get(member)
            .cloned()
            .unwrap_or(Value::NotAvailable);
        MemberInstance::new(member, value)
    }

    /// Strict read
    pub fn try_field(&self, member: &str) -> CoreResult<MemberInstance> {
        self.state
            .read()
            .fields
            .get(member)
            .map(|value| MemberInstance::new(member, value.clone()))
            .ok_or_else(|| CoreError::MemberNotFound(member.to_string()))
    }

    pub fn has_field(&self, member: &str) -> bool {
        self.state.read().fields.contains_key(member)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.state.read().fields.keys().cloned().collect()
    }

    /// Add a member that must not exist yet
    pub fn supplement(&self, member: &str, value: impl Into<Value>) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.fields.contains_key(member) {
            return Err(CoreError::MemberExists(member.to_string()));
        }
        state.fields.insert(member.to_string(), value.into());
        Ok(())
    }

    pub fn supplement_or_update(&self, member: &str, value: impl Into<Value>) {
        self.state.write().fields.insert(member.to_string(), value.into());
    }

    /// Copy every non-metadata member of `other` into this instance
    pub fn supplement_or_update_from(&self, other: &Instance) {
        let fields: Vec<(String, Value)> = other
            .state
            .read()
            .fields
            .iter()
            .filter(|(member, _)| !is_meta_field(member))
            .map(|(member, value)| (member.clone(), value.clone()))
            .collect();
        let mut state = self.state.write();
        for (member, value) in fields {
            state.fields.insert(member, value);
        }
    }

    /// Union the interface lists of both instances into this one
    pub fn merge_internal_metadata(&self, other: &Instance) {
        let interfaces = other.state.read().interfaces.clone();
        self.state.write().interfaces.extend(interfaces);
    }

    pub fn complex_instances(&self) -> Vec<InstancePtr> {
        self.state.read().complex.values().cloned().collect()
    }

    pub fn complex_instance(&self, hash: InstanceHash) -> Option<InstancePtr> {
        self.state.read().complex.get(&hash).cloned()
    }

    /// True when the complex map is empty
    pub fn is_complex(&self) -> bool {
        self.state.read().complex.is_empty()
    }

    /// Plain JSON object of every member
    pub fn to_json(&self) -> serde_json::Value {
        let fields = self
            .state
            .read()
            .fields
            .iter()
            .map(|(member, value)| (member.clone(), serde_json::Value::from(value.clone())))
            .collect();
        serde_json::Value::Object(fields)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Field resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve the properties of `interface` through the schema.
    ///
    /// Returns `false` when the schema declares no mappings for `interface`.
    pub fn fill_members(&self, interface: &str, properties: &PropertyMap) -> CoreResult<bool> {
        let mappings = self.schema.mappings(interface);
        if mappings.is_empty() {
            return Ok(false);
        }
        for mapping in mappings {
            let Some(raw) = properties.get(&mapping.property) else {
                continue;
            };
            let Some(value) = mapping.apply(raw.clone()) else {
                continue;
            };
            self.resolve_value(&mapping.member, value)?;
        }
        Ok(true)
    }

    fn resolve_value(&self, member: &str, value: Value) -> CoreResult<()> {
        match value.shape() {
            ValueShape::Scalar => {
                self.supplement_or_update(member, value);
                Ok(())
            }
            _ if self.child => Err(CoreError::UnsupportedValue {
                member: member.to_string(),
                kind: value.type_name(),
            }),
            ValueShape::List => {
                let elements = value.list_elements().unwrap_or_default();
                self.expand_list(member, elements)
            }
            ValueShape::Associations => {
                let associations = value.as_associations().map(<[Association]>::to_vec);
                self.expand_associations(member, associations.unwrap_or_default())
            }
        }
    }

    fn expand_list(&self, member: &str, elements: Vec<Value>) -> CoreResult<()> {
        tracing::trace!(path = %self.path, member = %member, count = elements.len(), "Expanding list member");
        let prefix = format!("{}__meta/{}/", self.path, member);
        let mut children = Vec::with_capacity(elements.len());
        for (index, element) in elements.into_iter().enumerate() {
            let mut properties = PropertyMap::new();
            properties.insert(member.to_string(), element);
            let child = self.new_child(format!("{}{}", prefix, index));
            child.fill_child(member, &properties)?;
            self.schema.run_static_fields(&child);
            children.push(Arc::new(child));
        }
        let mut state = self.state.write();
        // rows of the previous value of this member
        state.complex.retain(|_, child| !child.path.starts_with(&prefix));
        for child in children {
            state.complex.insert(child.hash(), child);
        }
        Ok(())
    }

    fn expand_associations(&self, member: &str, associations: Vec<Association>) -> CoreResult<()> {
        tracing::debug!(path = %self.path, member = %member, count = associations.len(), "Expanding associations");
        self.state.write().complex.clear();

        let mut children = Vec::with_capacity(associations.len());
        for association in associations {
            let path = format!(
                "{}__meta/{}/{}",
                association.endpoint, association.destination, association.source
            );
            let mut properties = PropertyMap::new();
            properties.insert(relations::FIELD_SOURCE.to_string(), association.source.into());
            properties.insert(relations::FIELD_DESTINATION.to_string(), association.destination.into());
            properties.insert(relations::FIELD_ENDPOINT.to_string(), association.endpoint.into());

            let child = self.new_child(path);
            child.fill_child(member, &properties)?;
            self.schema.run_static_fields(&child);
            children.push(Arc::new(child));
        }
        let mut state = self.state.write();
        for child in children {
            state.complex.insert(child.hash(), child);
        }
        Ok(())
    }

    /// Fill a child row, routing through the interface named after the
    /// expanded member when the schema declares one
    fn fill_child(&self, member: &str, properties: &PropertyMap) -> CoreResult<()> {
        if self.fill_members(member, properties)? {
            return Ok(());
        }
        for (name, value) in properties {
            self.resolve_value(name, value.clone())?;
        }
        Ok(())
    }

    /// Reset every default field of the schema
    pub fn apply_default_fields(&self) {
        for (member, producer) in self.schema.defaults() {
            let value = producer(self);
            self.supplement_or_update(member, value);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bus state
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_uninitialized(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Fetch and resolve every interface.
    ///
    /// Failed fetches leave their fields unresolved and the instance
    /// uninitialized; the remaining interfaces are still processed.
    pub fn initialize(&self, connection: &Connection) {
        self.mark_uninitialized();
        let mut complete = true;
        for interface in self.interfaces() {
            let properties: PropertyMap = match connection.call(
                &self.service,
                &self.path,
                well_known::PROPERTIES_INTERFACE,
                well_known::GET_ALL,
                &(interface.as_str(),),
            ) {
                Ok(properties) => properties,
                Err(e) => {
                    tracing::debug!(
                        service = %self.service,
                        path = %self.path,
                        interface = %interface,
                        error = %e,
                        "Failed to fetch properties"
                    );
                    complete = false;
                    continue;
                }
            };
            if let Err(e) = self.fill_members(&interface, &properties) {
                tracing::warn!(path = %self.path, interface = %interface, error = %e, "Failed to resolve properties");
                complete = false;
            }
        }
        self.schema.run_static_fields(self);
        if complete {
            self.initialized.store(true, Ordering::Release);
        }
    }

    /// Re-initialize when a previous initialization was incomplete
    pub fn verify_state(&self, connection: &Connection) {
        if !self.is_initialized() {
            self.initialize(connection);
        }
    }

    /// Subscribe to property changes of every held interface.
    ///
    /// Previously bound watchers are released first.
    pub fn bind_listeners(self: &Arc<Self>, connection: &Connection) -> CoreResult<()> {
        self.release_listeners();
        let mut watchers = Vec::new();
        for interface in self.interfaces() {
            let weak = Arc::downgrade(self);
            let rule = MatchRule::properties_changed(self.path.clone(), interface.clone());
            let watcher = connection.add_watcher(rule, move |signal| {
                let Some(instance) = weak.upgrade() else {
                    return;
                };
                if let Signal::PropertiesChanged {
                    interface, changed, ..
                } = signal
                {
                    instance.apply_change(interface, changed);
                }
            })?;
            tracing::trace!(path = %self.path, interface = %interface, "Property watcher registered");
            watchers.push(watcher);
        }
        *self.watchers.lock() = watchers;
        Ok(())
    }

    fn apply_change(&self, interface: &str, changed: &PropertyMap) {
        if let Err(e) = self.fill_members(interface, changed) {
            tracing::warn!(path = %self.path, interface = %interface, error = %e, "Failed to apply property change");
        }
        self.schema.run_static_fields(self);
    }

    /// Drop every property watcher, returning how many were held
    pub fn release_listeners(&self) -> usize {
        let watchers = std::mem::take(&mut *self.watchers.lock());
        watchers.len()
    }

    pub fn listener_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
