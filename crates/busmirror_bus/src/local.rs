//! In-process object bus
//!
//! `LocalBus` keeps services, objects, interfaces and properties in memory and
//! answers the calls the cache issues: name listing, the object mapper,
//! properties and object-manager calls, plus custom method handlers. Mutations
//! emit the matching signals to every connected [`LocalTransport`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use busmirror_types::{
    InterfaceMap, PropertyMap, Value, count_extra_segments, is_unique_name, is_under_namespace,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BusError, BusResult};
use crate::message::{MatchRule, MethodCall, Signal, SubscriptionId, well_known};
use crate::transport::Transport;

/// Handler for a custom method: `(object path, encoded arguments) -> encoded reply`
pub type MethodHandler =
    Arc<dyn Fn(&str, &serde_json::Value) -> BusResult<serde_json::Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    service: String,
    interface: String,
    method: String,
}

impl MethodKey {
    fn new(service: &str, interface: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
        }
    }
}

#[derive(Default)]
struct BusState {
    /// well-known name -> unique owner
    owners: BTreeMap<String, String>,
    /// well-known service -> object path -> interfaces
    objects: BTreeMap<String, BTreeMap<String, InterfaceMap>>,
    methods: HashMap<MethodKey, MethodHandler>,
    failures: HashMap<MethodKey, BusError>,
    call_counts: HashMap<MethodKey, usize>,
    corrupted: Option<BusError>,
}

struct Endpoint {
    unique_name: String,
    rules: Mutex<BTreeMap<SubscriptionId, MatchRule>>,
    queue: Mutex<VecDeque<(SubscriptionId, Signal)>>,
    ready: Condvar,
}

impl Endpoint {
    fn deliver(&self, signal: &Signal) {
        let matched: Vec<SubscriptionId> = self
            .rules
            .lock()
            .iter()
            .filter(|(_, rule)| rule.matches(signal))
            .map(|(id, _)| *id)
            .collect();
        if matched.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        for id in matched {
            queue.push_back((id, signal.clone()));
        }
        self.ready.notify_all();
    }
}

struct LocalBusInner {
    state: Mutex<BusState>,
    endpoints: Mutex<Vec<Weak<Endpoint>>>,
    next_unique: AtomicU64,
    next_subscription: AtomicU64,
}

/// In-memory bus shared by every transport connected to it
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LocalBusInner {
                state: Mutex::new(BusState::default()),
                endpoints: Mutex::new(Vec::new()),
                next_unique: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    fn allocate_unique_name(&self) -> String {
        format!(":1.{}", self.inner.next_unique.fetch_add(1, Ordering::Relaxed))
    }

    /// Open a new handle on this bus
    pub fn connect(&self) -> Arc<LocalTransport> {
        let endpoint = Arc::new(Endpoint {
            unique_name: self.allocate_unique_name(),
            rules: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        });
        self.inner.endpoints.lock().push(Arc::downgrade(&endpoint));
        tracing::debug!(unique_name = %endpoint.unique_name, "Local bus connection opened");
        Arc::new(LocalTransport {
            bus: self.clone(),
            endpoint,
        })
    }

    fn emit(&self, signal: Signal) {
        let endpoints: Vec<Arc<Endpoint>> = {
            let mut endpoints = self.inner.endpoints.lock();
            endpoints.retain(|e| e.strong_count() > 0);
            endpoints.iter().filter_map(Weak::upgrade).collect()
        };
        for endpoint in endpoints {
            endpoint.deliver(&signal);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Name ownership
    // ─────────────────────────────────────────────────────────────────────────

    /// Own `name` and return the owner's unique name (existing owner is kept)
    pub fn own_name(&self, name: &str) -> String {
        let (owner, created) = {
            let mut state = self.inner.state.lock();
            match state.owners.get(name) {
                Some(owner) => (owner.clone(), false),
                None => {
                    let owner = self.allocate_unique_name();
                    state.owners.insert(name.to_string(), owner.clone());
                    (owner, true)
                }
            }
        };
        if created {
            self.emit(Signal::NameOwnerChanged {
                name: name.to_string(),
                old_owner: String::new(),
                new_owner: owner.clone(),
            });
        }
        owner
    }

    /// Drop ownership of `name` together with its objects
    pub fn release_name(&self, name: &str) {
        let owner = {
            let mut state = self.inner.state.lock();
            state.objects.remove(name);
            state.owners.remove(name)
        };
        if let Some(old_owner) = owner {
            self.emit(Signal::NameOwnerChanged {
                name: name.to_string(),
                old_owner,
                new_owner: String::new(),
            });
        }
    }

    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.inner.state.lock().owners.get(name).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Objects
    // ─────────────────────────────────────────────────────────────────────────

    /// Add interfaces to an object, emitting interfaces-added
    pub fn add_object(&self, service: &str, path: &str, interfaces: InterfaceMap) {
        let owner = self.own_name(service);
        {
            let mut state = self.inner.state.lock();
            let object = state
                .objects
                .entry(service.to_string())
                .or_default()
                .entry(path.to_string())
                .or_default();
            for (interface, properties) in &interfaces {
                object
                    .entry(interface.clone())
                    .or_default()
                    .extend(properties.clone());
            }
        }
        self.emit(Signal::InterfacesAdded {
            sender: owner,
            path: path.to_string(),
            interfaces,
        });
    }

    /// Remove interfaces from an object, emitting interfaces-removed
    pub fn remove_interfaces(&self, service: &str, path: &str, interfaces: &[&str]) {
        let owner = {
            let mut state = self.inner.state.lock();
            if let Some(objects) = state.objects.get_mut(service) {
                if let Some(object) = objects.get_mut(path) {
                    for interface in interfaces {
                        object.remove(*interface);
                    }
                    if object.is_empty() {
                        objects.remove(path);
                    }
                }
            }
            state.owners.get(service).cloned()
        };
        if let Some(sender) = owner {
            self.emit(Signal::InterfacesRemoved {
                sender,
                path: path.to_string(),
                interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            });
        }
    }

    /// Remove an object with all of its interfaces
    pub fn remove_object(&self, service: &str, path: &str) {
        let interfaces: Vec<String> = self
            .object(service, path)
            .map(|object| object.keys().cloned().collect())
            .unwrap_or_default();
        let refs: Vec<&str> = interfaces.iter().map(String::as_str).collect();
        self.remove_interfaces(service, path, &refs);
    }

    /// Update one property, emitting properties-changed
    pub fn set_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
        value: impl Into<Value>,
    ) {
        let value = value.into();
        let owner = {
            let mut state = self.inner.state.lock();
            let object = state
                .objects
                .entry(service.to_string())
                .or_default()
                .entry(path.to_string())
                .or_default();
            object
                .entry(interface.to_string())
                .or_default()
                .insert(property.to_string(), value.clone());
            state.owners.get(service).cloned()
        };
        let sender = owner.unwrap_or_else(|| self.own_name(service));
        let mut changed = PropertyMap::new();
        changed.insert(property.to_string(), value);
        self.emit(Signal::PropertiesChanged {
            sender,
            path: path.to_string(),
            interface: interface.to_string(),
            changed,
            invalidated: Vec::new(),
        });
    }

    pub fn object(&self, service: &str, path: &str) -> Option<InterfaceMap> {
        self.inner
            .state
            .lock()
            .objects
            .get(service)
            .and_then(|objects| objects.get(path))
            .cloned()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Methods & fault injection
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a custom method on a service
    pub fn register_method<F>(&self, service: &str, interface: &str, method: &str, handler: F)
    where
        F: Fn(&str, &serde_json::Value) -> BusResult<serde_json::Value> + Send + Sync + 'static,
    {
        self.own_name(service);
        self.inner
            .state
            .lock()
            .methods
            .insert(MethodKey::new(service, interface, method), Arc::new(handler));
    }

    /// Make every call of a method fail with `error`
    pub fn fail_method(&self, service: &str, interface: &str, method: &str, error: BusError) {
        self.inner
            .state
            .lock()
            .failures
            .insert(MethodKey::new(service, interface, method), error);
    }

    pub fn clear_failure(&self, service: &str, interface: &str, method: &str) {
        self.inner
            .state
            .lock()
            .failures
            .remove(&MethodKey::new(service, interface, method));
    }

    /// Make the bus unusable; every transport operation fails with `error`
    pub fn corrupt(&self, error: BusError) {
        self.inner.state.lock().corrupted = Some(error);
        for endpoint in self.inner.endpoints.lock().iter().filter_map(Weak::upgrade) {
            endpoint.ready.notify_all();
        }
    }

    /// How often a method was called, regardless of outcome
    pub fn call_count(&self, service: &str, interface: &str, method: &str) -> usize {
        self.inner
            .state
            .lock()
            .call_counts
            .get(&MethodKey::new(service, interface, method))
            .copied()
            .unwrap_or(0)
    }

    fn check_corrupted(&self) -> BusResult<()> {
        match &self.inner.state.lock().corrupted {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Resolve a unique or well-known service name to the well-known one
    fn resolve_service(state: &BusState, service: &str) -> Option<String> {
        if !is_unique_name(service) {
            return Some(service.to_string());
        }
        state
            .owners
            .iter()
            .find(|(_, owner)| owner.as_str() == service)
            .map(|(name, _)| name.clone())
    }

    fn dispatch(&self, call: &MethodCall) -> BusResult<serde_json::Value> {
        self.check_corrupted()?;
        let key = MethodKey::new(&call.service, &call.interface, &call.method);

        let handler = {
            let mut state = self.inner.state.lock();
            *state.call_counts.entry(key.clone()).or_insert(0) += 1;
            if let Some(error) = state.failures.get(&key) {
                return Err(error.clone());
            }
            state.methods.get(&key).cloned()
        };
        if let Some(handler) = handler {
            return handler(&call.path, &call.body);
        }

        match (call.service.as_str(), call.interface.as_str(), call.method.as_str()) {
            (well_known::DBUS_SERVICE, well_known::DBUS_INTERFACE, well_known::LIST_NAMES) => {
                self.list_names()
            }
            (well_known::DBUS_SERVICE, well_known::DBUS_INTERFACE, well_known::GET_NAME_OWNER) => {
                let (name,): (String,) = decode_args(call)?;
                self.owner_of(&name)
                    .map(serde_json::Value::String)
                    .ok_or(BusError::ServiceUnknown(name))
            }
            (well_known::MAPPER_SERVICE, well_known::MAPPER_INTERFACE, well_known::GET_SUB_TREE) => {
                let (path, depth, interfaces): (String, i32, Vec<String>) = decode_args(call)?;
                encode_reply(&self.sub_tree(&path, depth, &interfaces))
            }
            (well_known::MAPPER_SERVICE, well_known::MAPPER_INTERFACE, well_known::GET_OBJECT) => {
                let (path, interfaces): (String, Vec<String>) = decode_args(call)?;
                let services = self.object_services(&path, &interfaces);
                if services.is_empty() {
                    return Err(BusError::UnknownObject {
                        service: call.service.clone(),
                        path,
                    });
                }
                encode_reply(&services)
            }
            (_, well_known::PROPERTIES_INTERFACE, well_known::GET_ALL) => {
                let (interface,): (String,) = decode_args(call)?;
                encode_reply(&self.get_all(&call.service, &call.path, &interface)?)
            }
            (_, well_known::PROPERTIES_INTERFACE, well_known::GET) => {
                let (interface, property): (String, String) = decode_args(call)?;
                let properties = self.get_all(&call.service, &call.path, &interface)?;
                match properties.get(&property) {
                    Some(value) => encode_reply(value),
                    None => Err(BusError::call_failed(
                        &call.service,
                        &call.path,
                        &call.interface,
                        &call.method,
                        format!("unknown property {}", property),
                    )),
                }
            }
            (_, well_known::OBJECT_MANAGER_INTERFACE, well_known::GET_MANAGED_OBJECTS) => {
                encode_reply(&self.managed_objects(&call.service)?)
            }
            _ => Err(BusError::UnknownMethod {
                interface: call.interface.clone(),
                method: call.method.clone(),
            }),
        }
    }

    fn list_names(&self) -> BusResult<serde_json::Value> {
        let mut names = vec![well_known::DBUS_SERVICE.to_string()];
        {
            let state = self.inner.state.lock();
            for (name, owner) in &state.owners {
                names.push(name.clone());
                names.push(owner.clone());
            }
        }
        for endpoint in self.inner.endpoints.lock().iter().filter_map(Weak::upgrade) {
            names.push(endpoint.unique_name.clone());
        }
        names.sort();
        names.dedup();
        encode_reply(&names)
    }

    /// Mapper subtree: path -> service -> interfaces
    fn sub_tree(
        &self,
        namespace: &str,
        depth: i32,
        interfaces: &[String],
    ) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
        let state = self.inner.state.lock();
        let mut tree: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for (service, objects) in &state.objects {
            for (path, object) in objects {
                if !is_under_namespace(namespace, path) {
                    continue;
                }
                if depth > 0 && count_extra_segments(namespace, path) > depth as usize {
                    continue;
                }
                if !implements_any(object, interfaces) {
                    continue;
                }
                tree.entry(path.clone())
                    .or_default()
                    .insert(service.clone(), object.keys().cloned().collect());
            }
        }
        tree
    }

    /// Mapper object lookup: service -> interfaces
    fn object_services(&self, path: &str, interfaces: &[String]) -> BTreeMap<String, Vec<String>> {
        let state = self.inner.state.lock();
        state
            .objects
            .iter()
            .filter_map(|(service, objects)| {
                let object = objects.get(path)?;
                if !implements_any(object, interfaces) {
                    return None;
                }
                Some((service.clone(), object.keys().cloned().collect()))
            })
            .collect()
    }

    fn get_all(&self, service: &str, path: &str, interface: &str) -> BusResult<PropertyMap> {
        let state = self.inner.state.lock();
        let service_name = Self::resolve_service(&state, service)
            .ok_or_else(|| BusError::ServiceUnknown(service.to_string()))?;
        let object = state
            .objects
            .get(&service_name)
            .and_then(|objects| objects.get(path))
            .ok_or_else(|| BusError::UnknownObject {
                service: service_name.clone(),
                path: path.to_string(),
            })?;
        object
            .get(interface)
            .cloned()
            .ok_or_else(|| BusError::UnknownInterface {
                path: path.to_string(),
                interface: interface.to_string(),
            })
    }

    fn managed_objects(&self, service: &str) -> BusResult<BTreeMap<String, InterfaceMap>> {
        let state = self.inner.state.lock();
        let service_name = Self::resolve_service(&state, service)
            .ok_or_else(|| BusError::ServiceUnknown(service.to_string()))?;
        if !state.owners.contains_key(&service_name) {
            return Err(BusError::ServiceUnknown(service_name));
        }
        Ok(state.objects.get(&service_name).cloned().unwrap_or_default())
    }
}

fn implements_any(object: &InterfaceMap, interfaces: &[String]) -> bool {
    interfaces.is_empty() || interfaces.iter().any(|i| object.contains_key(i))
}

fn decode_args<T: DeserializeOwned>(call: &MethodCall) -> BusResult<T> {
    serde_json::from_value(call.body.clone()).map_err(|e| {
        BusError::BadMessage(format!("{}.{} arguments: {}", call.interface, call.method, e))
    })
}

fn encode_reply<T: Serialize>(reply: &T) -> BusResult<serde_json::Value> {
    serde_json::to_value(reply).map_err(|e| BusError::Encode(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// One connection to a [`LocalBus`]
pub struct LocalTransport {
    bus: LocalBus,
    endpoint: Arc<Endpoint>,
}

impl LocalTransport {
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    /// Number of match rules currently registered
    pub fn match_count(&self) -> usize {
        self.endpoint.rules.lock().len()
    }
}

impl Transport for LocalTransport {
    fn unique_name(&self) -> String {
        self.endpoint.unique_name.clone()
    }

    fn call(&self, call: &MethodCall) -> BusResult<serde_json::Value> {
        self.bus.dispatch(call)
    }

    fn send(&self, call: &MethodCall) -> BusResult<()> {
        self.bus.dispatch(call).map(|_| ())
    }

    fn add_match(&self, rule: &MatchRule) -> BusResult<SubscriptionId> {
        self.bus.check_corrupted()?;
        let id = SubscriptionId(self.bus.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.endpoint.rules.lock().insert(id, rule.clone());
        Ok(id)
    }

    fn remove_match(&self, id: SubscriptionId) {
        self.endpoint.rules.lock().remove(&id);
        self.endpoint.queue.lock().retain(|(queued, _)| *queued != id);
    }

    fn wait(&self, timeout: Duration) -> BusResult<bool> {
        self.bus.check_corrupted()?;
        let mut queue = self.endpoint.queue.lock();
        if queue.is_empty() && !timeout.is_zero() {
            self.endpoint.ready.wait_for(&mut queue, timeout);
        }
        let ready = !queue.is_empty();
        drop(queue);
        self.bus.check_corrupted()?;
        Ok(ready)
    }

    fn drain(&self) -> BusResult<Vec<(SubscriptionId, Signal)>> {
        self.bus.check_corrupted()?;
        Ok(self.endpoint.queue.lock().drain(..).collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SVC: &str = "xyz.openbmc_project.Hwmon";
    const VALUE_IFACE: &str = "xyz.openbmc_project.Sensor.Value";

    fn sensor(value: f64) -> InterfaceMap {
        let mut props = PropertyMap::new();
        props.insert("Value".to_string(), Value::Float(value));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(VALUE_IFACE.to_string(), props);
        interfaces
    }

    fn call(bus: &LocalBus, call: MethodCall) -> BusResult<serde_json::Value> {
        bus.connect().call(&call)
    }

    #[test]
    fn test_sub_tree_depth_and_interfaces() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/temp/cpu0", sensor(40.0));
        bus.add_object(SVC, "/s/temp/deep/cpu1", sensor(41.0));

        let reply = call(
            &bus,
            MethodCall::new(
                well_known::MAPPER_SERVICE,
                well_known::MAPPER_PATH,
                well_known::MAPPER_INTERFACE,
                well_known::GET_SUB_TREE,
            )
            .with_body(serde_json::json!(["/s/temp", 1, [VALUE_IFACE]])),
        )
        .unwrap();
        let tree: BTreeMap<String, BTreeMap<String, Vec<String>>> =
            serde_json::from_value(reply).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.contains_key("/s/temp/cpu0"));

        let reply = call(
            &bus,
            MethodCall::new(
                well_known::MAPPER_SERVICE,
                well_known::MAPPER_PATH,
                well_known::MAPPER_INTERFACE,
                well_known::GET_SUB_TREE,
            )
            .with_body(serde_json::json!(["/s/temp", 0, ["other.Iface"]])),
        )
        .unwrap();
        let tree: BTreeMap<String, BTreeMap<String, Vec<String>>> =
            serde_json::from_value(reply).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_get_all_and_failures() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/temp/cpu0", sensor(40.0));
        let get_all = MethodCall::new(SVC, "/s/temp/cpu0", well_known::PROPERTIES_INTERFACE, well_known::GET_ALL)
            .with_body(serde_json::json!([VALUE_IFACE]));

        let props: PropertyMap = serde_json::from_value(call(&bus, get_all.clone()).unwrap()).unwrap();
        assert_eq!(props.get("Value"), Some(&Value::Float(40.0)));

        bus.fail_method(SVC, well_known::PROPERTIES_INTERFACE, well_known::GET_ALL, BusError::Disconnected);
        assert_eq!(call(&bus, get_all.clone()), Err(BusError::Disconnected));
        assert_eq!(bus.call_count(SVC, well_known::PROPERTIES_INTERFACE, well_known::GET_ALL), 2);
    }

    #[test]
    fn test_signals_reach_matching_rules() {
        let bus = LocalBus::new();
        let transport = bus.connect();
        let added = transport.add_match(&MatchRule::interfaces_added()).unwrap();
        let changed = transport
            .add_match(&MatchRule::properties_changed("/s/temp/cpu0", VALUE_IFACE))
            .unwrap();

        bus.add_object(SVC, "/s/temp/cpu0", sensor(40.0));
        bus.set_property(SVC, "/s/temp/cpu0", VALUE_IFACE, "Value", 42.0);

        assert!(transport.wait(Duration::from_millis(10)).unwrap());
        let signals = transport.drain().unwrap();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].0, added);
        assert_eq!(signals[1].0, changed);
        assert_eq!(signals[0].1.sender(), bus.owner_of(SVC).unwrap());
    }

    #[test]
    fn test_corruption_fails_wait() {
        let bus = LocalBus::new();
        let transport = bus.connect();
        bus.corrupt(BusError::Io("socket reset".into()));
        let err = transport.wait(Duration::from_millis(1)).unwrap_err();
        assert!(err.is_fatal());
    }
}
