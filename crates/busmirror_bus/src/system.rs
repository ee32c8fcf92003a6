//! Transport over the host's system bus
//!
//! Calls go straight through a blocking zbus connection. Match rules are
//! registered with the bus daemon and mirrored locally; a receiver thread
//! decodes every incoming signal, routes it to the matching subscriptions and
//! queues it for [`Transport::drain`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use busmirror_types::{Association, InterfaceMap, PropertyMap, Value};
use parking_lot::{Condvar, Mutex};
use zbus::blocking::{Connection as BusConnection, MessageIterator};
use zbus::message::{Flags, Type as MessageType};
use zbus::zvariant::{self, OwnedObjectPath, OwnedValue, Structure, StructureBuilder};
use zbus::Message;

use crate::error::{BusError, BusResult};
use crate::message::{MatchRule, MethodCall, Signal, SubscriptionId, well_known};
use crate::transport::Transport;

const ADD_MATCH: &str = "AddMatch";
const REMOVE_MATCH: &str = "RemoveMatch";

#[derive(Default)]
struct Inbox {
    rules: Mutex<BTreeMap<SubscriptionId, MatchRule>>,
    queue: Mutex<VecDeque<(SubscriptionId, Signal)>>,
    ready: Condvar,
    failure: Mutex<Option<BusError>>,
    closed: AtomicBool,
}

impl Inbox {
    fn deliver(&self, signal: Signal) {
        let matched: Vec<SubscriptionId> = self
            .rules
            .lock()
            .iter()
            .filter(|(_, rule)| rule.matches(&signal))
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

    fn fail(&self, error: BusError) {
        *self.failure.lock() = Some(error);
        let _queue = self.queue.lock();
        self.ready.notify_all();
    }

    fn check_failure(&self) -> BusResult<()> {
        match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// One connection to the system bus
pub struct SystemBusTransport {
    connection: BusConnection,
    inbox: Arc<Inbox>,
    next_subscription: AtomicU64,
}

impl SystemBusTransport {
    /// Connect to the system bus and start the signal receiver
    pub fn connect() -> BusResult<Self> {
        let connection = BusConnection::system().map_err(|e| BusError::Io(e.to_string()))?;
        Self::with_connection(connection)
    }

    /// Wrap an established connection
    pub fn with_connection(connection: BusConnection) -> BusResult<Self> {
        let inbox = Arc::new(Inbox::default());
        let receiver = {
            let inbox = Arc::clone(&inbox);
            let messages = MessageIterator::from(&connection);
            move || receive(messages, &inbox)
        };
        let unique_name = unique_name(&connection);
        thread::Builder::new()
            .name(format!("bus-rx{}", unique_name))
            .spawn(receiver)
            .map_err(|e| BusError::Io(format!("failed to spawn receiver thread: {}", e)))?;
        tracing::info!(unique_name = %unique_name, "Connected to system bus");
        Ok(Self {
            connection,
            inbox,
            next_subscription: AtomicU64::new(1),
        })
    }

    fn daemon_call(&self, method: &str, rule: &str) -> BusResult<()> {
        self.connection
            .call_method(
                Some(well_known::DBUS_SERVICE),
                well_known::DBUS_PATH,
                Some(well_known::DBUS_INTERFACE),
                method,
                &(rule,),
            )
            .map(|_| ())
            .map_err(|e| {
                call_error(well_known::DBUS_SERVICE, well_known::DBUS_PATH, well_known::DBUS_INTERFACE, method, e)
            })
    }
}

impl Drop for SystemBusTransport {
    fn drop(&mut self) {
        self.inbox.closed.store(true, Ordering::Release);
    }
}

fn unique_name(connection: &BusConnection) -> String {
    connection
        .unique_name()
        .map(|name| name.to_string())
        .unwrap_or_default()
}

fn receive(messages: MessageIterator, inbox: &Inbox) {
    for message in messages {
        if inbox.closed.load(Ordering::Acquire) {
            break;
        }
        match message {
            Ok(message) => match decode_signal(&message) {
                Ok(Some(signal)) => inbox.deliver(signal),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Dropping undecodable signal"),
            },
            Err(e) => {
                tracing::error!(error = %e, "System bus receive failed");
                inbox.fail(BusError::Io(e.to_string()));
                break;
            }
        }
    }
    tracing::debug!("System bus receiver stopped");
}

impl Transport for SystemBusTransport {
    fn unique_name(&self) -> String {
        unique_name(&self.connection)
    }

    fn call(&self, call: &MethodCall) -> BusResult<serde_json::Value> {
        let reply = match encode_args(&call.body)? {
            Some(args) => self.connection.call_method(
                Some(call.service.as_str()),
                call.path.as_str(),
                Some(call.interface.as_str()),
                call.method.as_str(),
                &args,
            ),
            None => self.connection.call_method(
                Some(call.service.as_str()),
                call.path.as_str(),
                Some(call.interface.as_str()),
                call.method.as_str(),
                &(),
            ),
        }
        .map_err(|e| call_error(&call.service, &call.path, &call.interface, &call.method, e))?;
        decode_reply(&reply)
    }

    fn send(&self, call: &MethodCall) -> BusResult<()> {
        let failed = |e: zbus::Error| call_error(&call.service, &call.path, &call.interface, &call.method, e);
        let builder = Message::method(call.path.as_str(), call.method.as_str())
            .and_then(|b| b.destination(call.service.as_str()))
            .and_then(|b| b.interface(call.interface.as_str()))
            .and_then(|b| b.with_flags(Flags::NoReplyExpected))
            .map_err(failed)?;
        let message = match encode_args(&call.body)? {
            Some(args) => builder.build(&args),
            None => builder.build(&()),
        }
        .map_err(failed)?;
        self.connection.send(&message).map_err(failed)
    }

    fn add_match(&self, rule: &MatchRule) -> BusResult<SubscriptionId> {
        self.inbox.check_failure()?;
        self.daemon_call(ADD_MATCH, &rule.to_rule_string())?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inbox.rules.lock().insert(id, rule.clone());
        Ok(id)
    }

    fn remove_match(&self, id: SubscriptionId) {
        let Some(rule) = self.inbox.rules.lock().remove(&id) else {
            return;
        };
        self.inbox.queue.lock().retain(|(queued, _)| *queued != id);
        if let Err(e) = self.daemon_call(REMOVE_MATCH, &rule.to_rule_string()) {
            tracing::debug!(subscription = %id, error = %e, "Failed to remove match rule");
        }
    }

    fn wait(&self, timeout: Duration) -> BusResult<bool> {
        self.inbox.check_failure()?;
        let mut queue = self.inbox.queue.lock();
        if queue.is_empty() && !timeout.is_zero() {
            self.inbox.ready.wait_for(&mut queue, timeout);
        }
        let ready = !queue.is_empty();
        drop(queue);
        self.inbox.check_failure()?;
        Ok(ready)
    }

    fn drain(&self) -> BusResult<Vec<(SubscriptionId, Signal)>> {
        self.inbox.check_failure()?;
        Ok(self.inbox.queue.lock().drain(..).collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

fn call_error(service: &str, path: &str, interface: &str, method: &str, error: zbus::Error) -> BusError {
    match error {
        zbus::Error::MethodError(name, detail, _) => {
            let detail = detail.unwrap_or_default();
            match name.as_str() {
                "org.freedesktop.DBus.Error.ServiceUnknown" | "org.freedesktop.DBus.Error.NameHasNoOwner" => {
                    BusError::ServiceUnknown(service.to_string())
                }
                "org.freedesktop.DBus.Error.UnknownObject" => BusError::UnknownObject {
                    service: service.to_string(),
                    path: path.to_string(),
                },
                "org.freedesktop.DBus.Error.UnknownInterface" => BusError::UnknownInterface {
                    path: path.to_string(),
                    interface: interface.to_string(),
                },
                "org.freedesktop.DBus.Error.UnknownMethod" => BusError::UnknownMethod {
                    interface: interface.to_string(),
                    method: method.to_string(),
                },
                other => BusError::call_failed(service, path, interface, method, format!("{}: {}", other, detail)),
            }
        }
        zbus::Error::InputOutput(e) => BusError::Io(e.to_string()),
        zbus::Error::Variant(e) => BusError::Decode(e.to_string()),
        other => BusError::call_failed(service, path, interface, method, other.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Call arguments as one structure, `None` for a call without arguments.
///
/// Integers that fit encode as `i`, wider ones as `x`/`t`; empty arrays encode
/// as `as`.
fn encode_args(body: &serde_json::Value) -> BusResult<Option<Structure<'static>>> {
    let args: Vec<&serde_json::Value> = match body {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    if args.is_empty() {
        return Ok(None);
    }
    let mut builder = StructureBuilder::new();
    for arg in args {
        builder = builder.append_field(encode_value(arg)?);
    }
    Ok(Some(builder.build()))
}

fn encode_value(value: &serde_json::Value) -> BusResult<zvariant::Value<'static>> {
    Ok(match value {
        serde_json::Value::Null => return Err(BusError::Encode("null argument".to_string())),
        serde_json::Value::Bool(b) => zvariant::Value::Bool(*b),
        serde_json::Value::Number(n) => encode_number(n)?,
        serde_json::Value::String(s) => zvariant::Value::from(s.clone()),
        serde_json::Value::Array(items) => encode_array(items)?,
        serde_json::Value::Object(entries) => {
            let mut dict: HashMap<String, zvariant::Value<'static>> = HashMap::new();
            for (key, value) in entries {
                dict.insert(key.clone(), encode_value(value)?);
            }
            zvariant::Value::from(dict)
        }
    })
}

fn encode_number(n: &serde_json::Number) -> BusResult<zvariant::Value<'static>> {
    if let Some(i) = n.as_i64() {
        return Ok(match i32::try_from(i) {
            Ok(small) => zvariant::Value::I32(small),
            Err(_) => zvariant::Value::I64(i),
        });
    }
    if let Some(u) = n.as_u64() {
        return Ok(zvariant::Value::U64(u));
    }
    n.as_f64()
        .map(zvariant::Value::F64)
        .ok_or_else(|| BusError::Encode(format!("unrepresentable number {}", n)))
}

fn encode_array(items: &[serde_json::Value]) -> BusResult<zvariant::Value<'static>> {
    if items.iter().all(serde_json::Value::is_string) {
        let strings: Vec<String> = items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        return Ok(zvariant::Value::from(strings));
    }
    if items.iter().all(|v| v.as_i64().is_some_and(|i| i32::try_from(i).is_ok())) {
        let ints: Vec<i32> = items
            .iter()
            .filter_map(|v| v.as_i64().and_then(|i| i32::try_from(i).ok()))
            .collect();
        return Ok(zvariant::Value::from(ints));
    }
    if items.iter().all(serde_json::Value::is_number) {
        let floats: Vec<f64> = items.iter().filter_map(serde_json::Value::as_f64).collect();
        return Ok(zvariant::Value::from(floats));
    }
    Err(BusError::Encode("mixed array argument".to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Reply body as JSON: `null` without arguments, the value itself for one
/// argument, an array otherwise
fn decode_reply(reply: &Message) -> BusResult<serde_json::Value> {
    let header = reply.header();
    if header.signature().is_none_or(|signature| signature.as_str().is_empty()) {
        return Ok(serde_json::Value::Null);
    }
    let body = reply.body();
    let fields: Structure<'_> = body.deserialize().map_err(|e| BusError::Decode(e.to_string()))?;
    let mut values: Vec<serde_json::Value> = fields.fields().iter().map(to_json).collect();
    Ok(match values.len() {
        1 => values.remove(0),
        _ => serde_json::Value::Array(values),
    })
}

/// Plain JSON, except variants which become tagged property values
fn to_json(value: &zvariant::Value<'_>) -> serde_json::Value {
    match value {
        zvariant::Value::Value(inner) => {
            serde_json::to_value(property_value(inner)).unwrap_or(serde_json::Value::Null)
        }
        zvariant::Value::Bool(b) => serde_json::Value::Bool(*b),
        zvariant::Value::U8(n) => serde_json::Value::from(*n),
        zvariant::Value::I16(n) => serde_json::Value::from(*n),
        zvariant::Value::U16(n) => serde_json::Value::from(*n),
        zvariant::Value::I32(n) => serde_json::Value::from(*n),
        zvariant::Value::U32(n) => serde_json::Value::from(*n),
        zvariant::Value::I64(n) => serde_json::Value::from(*n),
        zvariant::Value::U64(n) => serde_json::Value::from(*n),
        zvariant::Value::F64(n) => serde_json::Value::from(*n),
        zvariant::Value::Str(s) => serde_json::Value::from(s.as_str()),
        zvariant::Value::ObjectPath(p) => serde_json::Value::from(p.as_str()),
        zvariant::Value::Signature(s) => serde_json::Value::from(s.as_str()),
        zvariant::Value::Array(array) => serde_json::Value::Array(array.iter().map(to_json).collect()),
        zvariant::Value::Dict(dict) => {
            let entries = dict
                .iter()
                .map(|(key, value)| (json_key(key), to_json(value)))
                .collect();
            serde_json::Value::Object(entries)
        }
        zvariant::Value::Structure(structure) => {
            serde_json::Value::Array(structure.fields().iter().map(to_json).collect())
        }
        _ => serde_json::Value::Null,
    }
}

fn json_key(key: &zvariant::Value<'_>) -> String {
    match to_json(key) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Property value of the cache for a bus variant's content
fn property_value(value: &zvariant::Value<'_>) -> Value {
    match value {
        zvariant::Value::Value(inner) => property_value(inner),
        zvariant::Value::Bool(b) => Value::Bool(*b),
        zvariant::Value::U8(n) => Value::Int(i64::from(*n)),
        zvariant::Value::I16(n) => Value::Int(i64::from(*n)),
        zvariant::Value::U16(n) => Value::Int(i64::from(*n)),
        zvariant::Value::I32(n) => Value::Int(i64::from(*n)),
        zvariant::Value::U32(n) => Value::Int(i64::from(*n)),
        zvariant::Value::I64(n) => Value::Int(*n),
        zvariant::Value::U64(n) => Value::UInt(*n),
        zvariant::Value::F64(n) => Value::Float(*n),
        zvariant::Value::Str(s) => Value::String(s.as_str().to_string()),
        zvariant::Value::ObjectPath(p) => Value::String(p.as_str().to_string()),
        zvariant::Value::Array(array) => list_value(array.iter().map(property_value).collect()),
        zvariant::Value::Structure(structure) => match association(structure) {
            Some(association) => Value::Associations(vec![association]),
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

fn association(structure: &Structure<'_>) -> Option<Association> {
    match structure.fields() {
        [source, destination, endpoint] => match (
            property_value(source),
            property_value(destination),
            property_value(endpoint),
        ) {
            (Value::String(source), Value::String(destination), Value::String(endpoint)) => {
                Some(Association::new(source, destination, endpoint))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Collapse decoded elements into the list shape they share
fn list_value(elements: Vec<Value>) -> Value {
    if elements.is_empty() {
        return Value::StringList(Vec::new());
    }
    let mut strings = Vec::new();
    let mut floats = Vec::new();
    let mut ints = Vec::new();
    let mut associations = Vec::new();
    for element in &elements {
        match element {
            Value::String(s) => strings.push(s.clone()),
            Value::Float(f) => floats.push(*f),
            Value::Int(i) => ints.push(*i),
            Value::Associations(list) => associations.extend(list.iter().cloned()),
            _ => {}
        }
    }
    match elements.len() {
        n if strings.len() == n => Value::StringList(strings),
        n if floats.len() == n => Value::FloatList(floats),
        n if ints.len() == n => Value::IntList(ints),
        n if associations.len() == n => Value::Associations(associations),
        _ => Value::Null,
    }
}

fn property_map(properties: HashMap<String, OwnedValue>) -> PropertyMap {
    properties
        .into_iter()
        .map(|(name, value)| (name, property_value(&value)))
        .collect()
}

/// Signal this crate subscribes to, `None` for any other message
fn decode_signal(message: &Message) -> BusResult<Option<Signal>> {
    let header = message.header();
    if header.message_type() != MessageType::Signal {
        return Ok(None);
    }
    let (Some(interface), Some(member)) = (header.interface(), header.member()) else {
        return Ok(None);
    };
    let sender = header.sender().map(|name| name.to_string()).unwrap_or_default();
    let path = header.path().map(|path| path.as_str().to_string()).unwrap_or_default();
    let body = message.body();
    let decode = |e: zbus::Error| BusError::BadMessage(format!("{}.{}: {}", interface, member, e));

    let signal = match (interface.as_str(), member.as_str()) {
        (well_known::PROPERTIES_INTERFACE, "PropertiesChanged") => {
            let (interface, changed, invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
                body.deserialize().map_err(decode)?;
            Signal::PropertiesChanged {
                sender,
                path,
                interface,
                changed: property_map(changed),
                invalidated,
            }
        }
        (well_known::OBJECT_MANAGER_INTERFACE, "InterfacesAdded") => {
            let (object, interfaces): (OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>) =
                body.deserialize().map_err(decode)?;
            let interfaces: InterfaceMap = interfaces
                .into_iter()
                .map(|(name, properties)| (name, property_map(properties)))
                .collect();
            Signal::InterfacesAdded {
                sender,
                path: object.as_str().to_string(),
                interfaces,
            }
        }
        (well_known::OBJECT_MANAGER_INTERFACE, "InterfacesRemoved") => {
            let (object, interfaces): (OwnedObjectPath, Vec<String>) = body.deserialize().map_err(decode)?;
            Signal::InterfacesRemoved {
                sender,
                path: object.as_str().to_string(),
                interfaces,
            }
        }
        (well_known::DBUS_INTERFACE, "NameOwnerChanged") => {
            let (name, old_owner, new_owner): (String, String, String) = body.deserialize().map_err(decode)?;
            Signal::NameOwnerChanged {
                name,
                old_owner,
                new_owner,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(signal))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_args() {
        assert!(encode_args(&serde_json::Value::Null).unwrap().is_none());
        assert!(encode_args(&serde_json::json!([])).unwrap().is_none());

        let args = encode_args(&serde_json::json!(["/xyz", 0, ["a.B"]])).unwrap().unwrap();
        let fields = args.fields();
        assert_eq!(fields.len(), 3);
        assert!(matches!(&fields[0], zvariant::Value::Str(s) if s.as_str() == "/xyz"));
        assert!(matches!(fields[1], zvariant::Value::I32(0)));
        assert!(matches!(&fields[2], zvariant::Value::Array(_)));

        assert!(matches!(
            encode_args(&serde_json::json!([[1, "a"]])),
            Err(BusError::Encode(_))
        ));
        assert!(matches!(encode_value(&serde_json::json!(5_000_000_000i64)), Ok(zvariant::Value::I64(_))));
    }

    #[test]
    fn test_property_values() {
        assert_eq!(property_value(&zvariant::Value::F64(40.5)), Value::Float(40.5));
        assert_eq!(property_value(&zvariant::Value::U32(7)), Value::Int(7));
        assert_eq!(property_value(&zvariant::Value::from("on")), Value::String("on".to_string()));
        assert_eq!(
            property_value(&zvariant::Value::from(vec!["a".to_string(), "b".to_string()])),
            Value::StringList(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            property_value(&zvariant::Value::Value(Box::new(zvariant::Value::I64(-3)))),
            Value::Int(-3)
        );
    }

    #[test]
    fn test_list_shapes() {
        assert_eq!(list_value(Vec::new()), Value::StringList(Vec::new()));
        assert_eq!(list_value(vec![Value::Int(1), Value::Int(2)]), Value::IntList(vec![1, 2]));
        assert_eq!(list_value(vec![Value::Int(1), Value::String("x".into())]), Value::Null);
        let triple = Association::new("chassis", "all_sensors", "/chassis/a");
        assert_eq!(
            list_value(vec![Value::Associations(vec![triple.clone()])]),
            Value::Associations(vec![triple])
        );
    }

    #[test]
    fn test_variant_to_tagged_json() {
        let json = to_json(&zvariant::Value::Value(Box::new(zvariant::Value::F64(1.5))));
        assert_eq!(json, serde_json::json!({"kind": "float", "value": 1.5}));
        let props: PropertyMap =
            serde_json::from_value(serde_json::json!({ "Value": json })).unwrap();
        assert_eq!(props["Value"], Value::Float(1.5));
    }
}
