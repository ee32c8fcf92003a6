//! Thread-safe wrapper around one bus handle
//!
//! A `Connection` serializes every use of its [`Transport`] behind a
//! [`PriorityGuard`], dispatches incoming signals to registered watchers,
//! resolves unique sender names to well-known service names and can run a
//! dedicated pump thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use busmirror_types::is_unique_name;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BusError, BusResult};
use crate::guard::{PriorityGuard, priority};
use crate::message::{MatchRule, MethodCall, Signal, SubscriptionId, well_known};
use crate::names::ServiceNames;
use crate::transport::Transport;

/// Callback invoked for every signal matching a watcher's rule
pub type SignalHandler = Arc<dyn Fn(&Signal) + Send + Sync>;

/// Timing knobs of a connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Pause between pump iterations
    pub pump_sleep: Duration,
    /// Well-known name lookups give up after this many refreshes
    pub name_lookup_attempts: u32,
    /// Pause between well-known name refreshes
    pub name_lookup_interval: Duration,
    /// Backoff unit of the priority guard
    pub guard_unit: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pump_sleep: Duration::from_millis(20),
            name_lookup_attempts: 15,
            name_lookup_interval: Duration::from_secs(1),
            guard_unit: Duration::from_millis(1),
        }
    }
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    guard: PriorityGuard,
    names: Arc<ServiceNames>,
    handlers: DashMap<SubscriptionId, SignalHandler>,
    pending_cleanup: Mutex<Vec<SubscriptionId>>,
    alive: AtomicBool,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Cloneable handle to one bus connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("watchers", &self.inner.handlers.len())
            .finish()
    }
}

impl Connection {
    /// Wrap a transport with its own name cache
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self::with_service_names(transport, config, Arc::new(ServiceNames::new()))
    }

    /// Wrap a transport sharing an existing name cache
    pub fn with_service_names(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        names: Arc<ServiceNames>,
    ) -> Self {
        let guard = PriorityGuard::new(config.guard_unit);
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                config,
                guard,
                names,
                handlers: DashMap::new(),
                pending_cleanup: Mutex::new(Vec::new()),
                alive: AtomicBool::new(true),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn unique_name(&self) -> String {
        self.inner.transport.unique_name()
    }

    pub fn service_names(&self) -> &Arc<ServiceNames> {
        &self.inner.names
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Handle that does not keep the connection open
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────────

    fn encode<A: Serialize + ?Sized>(args: &A) -> BusResult<serde_json::Value> {
        serde_json::to_value(args).map_err(|e| BusError::Encode(e.to_string()))
    }

    /// Typed synchronous method call; `args` encodes as a tuple or sequence
    pub fn call<R, A>(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: &A,
    ) -> BusResult<R>
    where
        R: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let call = MethodCall::new(service, path, interface, method).with_body(Self::encode(args)?);
        let reply = {
            let _scope = self.inner.guard.acquire(priority::CALL);
            self.inner.transport.call(&call)?
        };
        serde_json::from_value(reply).map_err(|e| {
            BusError::Decode(format!("{}.{} reply: {}", interface, method, e))
        })
    }

    /// Method call without waiting for the reply
    pub fn call_no_reply<A>(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: &A,
    ) -> BusResult<()>
    where
        A: Serialize + ?Sized,
    {
        let call = MethodCall::new(service, path, interface, method).with_body(Self::encode(args)?);
        let _scope = self.inner.guard.acquire(priority::CALL);
        self.inner.transport.send(&call)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Watchers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register `handler` for signals matching `rule`.
    ///
    /// The subscription lives as long as the returned [`Watcher`].
    pub fn add_watcher<F>(&self, rule: MatchRule, handler: F) -> BusResult<Watcher>
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        let id = {
            let _scope = self.inner.guard.acquire(priority::CALL);
            self.inner.transport.add_match(&rule)?
        };
        self.inner.handlers.insert(id, Arc::new(handler));
        tracing::trace!(subscription = %id, kind = ?rule.kind, path = ?rule.path, "Watcher registered");
        Ok(Watcher {
            id,
            connection: Arc::downgrade(&self.inner),
        })
    }

    /// Number of live subscriptions, including ones awaiting cleanup
    pub fn watcher_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Number of dropped watchers not yet unregistered
    pub fn pending_cleanup_count(&self) -> usize {
        self.inner.pending_cleanup.lock().len()
    }

    /// Unregister every watcher dropped since the last purge
    pub fn purge_pending_cleanup(&self) -> usize {
        let pending: Vec<SubscriptionId> = std::mem::take(&mut *self.inner.pending_cleanup.lock());
        if pending.is_empty() {
            return 0;
        }
        let _scope = self.inner.guard.acquire(priority::CALL);
        for id in &pending {
            self.inner.handlers.remove(id);
            self.inner.transport.remove_match(*id);
        }
        tracing::trace!(count = pending.len(), "Purged dropped watchers");
        pending.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Signal processing
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatch every queued signal to its watcher, returning how many ran
    pub fn dispatch_pending(&self) -> BusResult<usize> {
        let _scope = self.inner.guard.acquire(priority::PUMP);
        let signals = self.inner.transport.drain()?;
        let mut dispatched = 0;
        for (id, signal) in signals {
            let handler = self.inner.handlers.get(&id).map(|h| Arc::clone(h.value()));
            if let Some(handler) = handler {
                handler(&signal);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// One processing step: purge dropped watchers, wait up to `timeout` for
    /// traffic, then dispatch whatever arrived.
    ///
    /// Only the dispatch holds the guard; calls from other threads go through
    /// while this one waits.
    pub fn process_once(&self, timeout: Duration) -> BusResult<usize> {
        self.purge_pending_cleanup();
        if !self.inner.transport.wait(timeout)? {
            return Ok(0);
        }
        self.dispatch_pending()
    }

    /// Start the pump thread
    pub fn start(&self) -> BusResult<()> {
        let mut pump = self.inner.pump.lock();
        if pump.is_some() {
            return Ok(());
        }
        self.inner.alive.store(true, Ordering::Release);
        let connection = self.clone();
        let handle = thread::Builder::new()
            .name(format!("bus-pump{}", self.unique_name()))
            .spawn(move || connection.run_pump())
            .map_err(|e| BusError::Io(format!("failed to spawn pump thread: {}", e)))?;
        *pump = Some(handle);
        Ok(())
    }

    fn run_pump(&self) {
        tracing::debug!(unique_name = %self.unique_name(), "Bus pump started");
        while self.is_alive() {
            if let Err(e) = self.process_once(Duration::ZERO) {
                exit_on_fatal(&e);
                tracing::warn!(error = %e, "Bus pump iteration failed");
            }
            thread::sleep(self.inner.config.pump_sleep);
        }
        tracing::debug!(unique_name = %self.unique_name(), "Bus pump stopped");
    }

    /// Stop and join the pump thread
    pub fn stop(&self) {
        self.inner.alive.store(false, Ordering::Release);
        let handle = self.inner.pump.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Bus pump thread panicked");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Service names
    // ─────────────────────────────────────────────────────────────────────────

    /// Rebuild the name cache from the bus daemon's name listing
    pub fn refresh_service_names(&self) -> BusResult<()> {
        let names: Vec<String> = self.call(
            well_known::DBUS_SERVICE,
            well_known::DBUS_PATH,
            well_known::DBUS_INTERFACE,
            well_known::LIST_NAMES,
            &(),
        )?;

        let mut resolved = HashMap::new();
        for name in names.into_iter().filter(|n| !is_unique_name(n)) {
            let owner: BusResult<String> = self.call(
                well_known::DBUS_SERVICE,
                well_known::DBUS_PATH,
                well_known::DBUS_INTERFACE,
                well_known::GET_NAME_OWNER,
                &(name.as_str(),),
            );
            match owner {
                Ok(owner) => {
                    resolved.insert(owner, name);
                }
                Err(e) => tracing::debug!(name = %name, error = %e, "Name owner lookup failed"),
            }
        }
        tracing::debug!(count = resolved.len(), "Service name cache refreshed");
        self.inner.names.replace_all(resolved);
        Ok(())
    }

    /// Keep the name cache current from name-owner-changed signals
    pub fn watch_name_owner_changes(&self) -> BusResult<Watcher> {
        let names = Arc::clone(&self.inner.names);
        self.add_watcher(MatchRule::name_owner_changed(), move |signal| {
            if let Signal::NameOwnerChanged {
                name,
                old_owner,
                new_owner,
            } = signal
            {
                names.apply_owner_change(name, old_owner, new_owner);
            }
        })
    }

    /// Resolve a sender's unique name to the well-known name it owns.
    ///
    /// Misses force a cache refresh; lookups pause between attempts and fail
    /// with [`BusError::NameNotResolved`] once the attempt budget is spent.
    pub fn well_known_name(&self, sender: &str) -> BusResult<String> {
        if !is_unique_name(sender) {
            return Ok(sender.to_string());
        }
        let mut attempts = 0;
        loop {
            if let Some(name) = self.inner.names.get(sender) {
                return Ok(name);
            }
            attempts += 1;
            if attempts > self.inner.config.name_lookup_attempts {
                tracing::error!(sender = %sender, attempts, "Well-known name not resolved");
                return Err(BusError::NameNotResolved(sender.to_string()));
            }
            if attempts > 1 {
                thread::sleep(self.inner.config.name_lookup_interval);
            }
            if let Err(e) = self.refresh_service_names() {
                tracing::warn!(error = %e, "Service name refresh failed");
            }
        }
    }
}

/// Terminate the process on errors that leave the connection unusable
pub fn exit_on_fatal(error: &BusError) {
    if error.is_fatal() {
        tracing::error!(error = %error, "Bus connection is corrupted, terminating");
        std::process::exit(1);
    }
}

/// Non-owning [`Connection`] handle for callbacks the connection itself stores
#[derive(Clone, Debug, Default)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watcher
// ─────────────────────────────────────────────────────────────────────────────

/// Active signal subscription.
///
/// Dropping it schedules the unregistration; the owning connection purges it
/// on its next processing step.
#[derive(Debug)]
pub struct Watcher {
    id: SubscriptionId,
    connection: Weak<ConnectionInner>,
}

impl Watcher {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(inner) = self.connection.upgrade() {
            inner.pending_cleanup.lock().push(self.id);
        }
    }
}

impl std::fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBus;
    use busmirror_types::{InterfaceMap, PropertyMap, Value};
    use std::sync::atomic::AtomicUsize;

    const SVC: &str = "xyz.openbmc_project.Hwmon";
    const IFACE: &str = "xyz.openbmc_project.Sensor.Value";

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            pump_sleep: Duration::from_millis(1),
            name_lookup_attempts: 2,
            name_lookup_interval: Duration::from_millis(1),
            guard_unit: Duration::from_micros(100),
        }
    }

    fn connect(bus: &LocalBus) -> Connection {
        Connection::new(bus.connect(), fast_config())
    }

    fn sensor(value: f64) -> InterfaceMap {
        let mut props = PropertyMap::new();
        props.insert("Value".to_string(), Value::Float(value));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(IFACE.to_string(), props);
        interfaces
    }

    #[test]
    fn test_typed_call() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/cpu0", sensor(40.0));
        let conn = connect(&bus);

        let props: PropertyMap = conn
            .call(SVC, "/s/cpu0", well_known::PROPERTIES_INTERFACE, well_known::GET_ALL, &(IFACE,))
            .unwrap();
        assert_eq!(props["Value"], Value::Float(40.0));
    }

    #[test]
    fn test_decode_error() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/cpu0", sensor(40.0));
        let conn = connect(&bus);

        let result: BusResult<Vec<u32>> =
            conn.call(SVC, "/s/cpu0", well_known::PROPERTIES_INTERFACE, well_known::GET_ALL, &(IFACE,));
        assert!(matches!(result, Err(BusError::Decode(_))));
    }

    #[test]
    fn test_call_no_reply() {
        let bus = LocalBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.register_method("org.example.Led", "org.example.Led", "Blink", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        });
        let conn = connect(&bus);
        conn.call_no_reply("org.example.Led", "/led", "org.example.Led", "Blink", &(3u8,))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_with_slice_args() {
        let bus = LocalBus::new();
        let seen = Arc::new(Mutex::new(serde_json::Value::Null));
        let slot = Arc::clone(&seen);
        bus.register_method("org.example.Led", "org.example.Led", "Pattern", move |_, body| {
            *slot.lock() = body.clone();
            Ok(serde_json::Value::Null)
        });
        let conn = connect(&bus);
        let steps: Vec<u8> = vec![1, 0, 1];
        let _: () = conn
            .call("org.example.Led", "/led", "org.example.Led", "Pattern", steps.as_slice())
            .unwrap();
        conn.call_no_reply("org.example.Led", "/led", "org.example.Led", "Pattern", &steps[..2])
            .unwrap();
        assert_eq!(*seen.lock(), serde_json::json!([1, 0]));
    }

    #[test]
    fn test_call_while_waiting() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/cpu0", sensor(40.0));
        let conn = connect(&bus);

        let waiter = conn.clone();
        let handle = thread::spawn(move || waiter.process_once(Duration::from_millis(500)));
        thread::sleep(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let props: PropertyMap = conn
            .call(SVC, "/s/cpu0", well_known::PROPERTIES_INTERFACE, well_known::GET_ALL, &(IFACE,))
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(props["Value"], Value::Float(40.0));
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_weak_connection() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/cpu0", sensor(40.0));
        let conn = connect(&bus);
        let weak = conn.downgrade();

        let inner = weak.clone();
        let _watcher = conn
            .add_watcher(MatchRule::properties_changed("/s/cpu0", IFACE), move |_| {
                assert!(inner.upgrade().is_some());
            })
            .unwrap();
        bus.set_property(SVC, "/s/cpu0", IFACE, "Value", 41.0);
        assert_eq!(conn.process_once(Duration::from_millis(50)).unwrap(), 1);
        assert!(weak.upgrade().is_some());

        drop(conn);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_watcher_dispatch_and_cleanup() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/cpu0", sensor(40.0));
        let conn = connect(&bus);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let watcher = conn
            .add_watcher(MatchRule::properties_changed("/s/cpu0", IFACE), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        bus.set_property(SVC, "/s/cpu0", IFACE, "Value", 41.0);
        assert_eq!(conn.process_once(Duration::from_millis(50)).unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(watcher);
        assert_eq!(conn.pending_cleanup_count(), 1);
        assert_eq!(conn.watcher_count(), 1);

        bus.set_property(SVC, "/s/cpu0", IFACE, "Value", 42.0);
        conn.process_once(Duration::from_millis(10)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pending_cleanup_count(), 0);
        assert_eq!(conn.watcher_count(), 0);
    }

    #[test]
    fn test_reentrant_call_from_handler() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/cpu0", sensor(40.0));
        let conn = connect(&bus);

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let inner_conn = conn.clone();
        let _watcher = conn
            .add_watcher(MatchRule::properties_changed("/s/cpu0", IFACE), move |_| {
                let props: PropertyMap = inner_conn
                    .call(SVC, "/s/cpu0", well_known::PROPERTIES_INTERFACE, well_known::GET_ALL, &(IFACE,))
                    .unwrap();
                *slot.lock() = props.get("Value").cloned();
            })
            .unwrap();

        bus.set_property(SVC, "/s/cpu0", IFACE, "Value", 43.0);
        conn.process_once(Duration::from_millis(50)).unwrap();
        assert_eq!(*seen.lock(), Some(Value::Float(43.0)));
    }

    #[test]
    fn test_well_known_name_resolution() {
        let bus = LocalBus::new();
        let owner = bus.own_name(SVC);
        let conn = connect(&bus);

        assert_eq!(conn.well_known_name(&owner).unwrap(), SVC);
        assert_eq!(conn.well_known_name(SVC).unwrap(), SVC);
        assert_eq!(
            conn.well_known_name(":1.999"),
            Err(BusError::NameNotResolved(":1.999".to_string()))
        );
        // initial refresh plus one retry
        assert_eq!(
            bus.call_count(well_known::DBUS_SERVICE, well_known::DBUS_INTERFACE, well_known::LIST_NAMES),
            3
        );
    }

    #[test]
    fn test_name_owner_watch() {
        let bus = LocalBus::new();
        let conn = connect(&bus);
        let _watcher = conn.watch_name_owner_changes().unwrap();

        let owner = bus.own_name("org.example.Fan");
        conn.process_once(Duration::from_millis(50)).unwrap();
        assert_eq!(conn.service_names().get(&owner).as_deref(), Some("org.example.Fan"));
    }

    #[test]
    fn test_pump_thread() {
        let bus = LocalBus::new();
        bus.add_object(SVC, "/s/cpu0", sensor(40.0));
        let conn = connect(&bus);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _watcher = conn
            .add_watcher(MatchRule::properties_changed("/s/cpu0", IFACE), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        conn.start().unwrap();
        bus.set_property(SVC, "/s/cpu0", IFACE, "Value", 44.0);
        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        conn.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!conn.is_alive());
    }
}
