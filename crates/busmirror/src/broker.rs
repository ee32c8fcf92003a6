//! Query scheduling
//!
//! A [`Broker`] binds one bus query to one entity. It keeps at most one run of
//! its query in flight, enforces a minimum refresh interval and keeps the
//! entity current from interfaces-added/removed signals between runs.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use busmirror_bus::{Connection, MatchRule, Signal, Watcher, well_known};
use parking_lot::Mutex;

use crate::entity::Entity;
use crate::instance::instance_hash;
use crate::query::BusQuery;

/// Connections a broker runs with
#[derive(Clone)]
pub struct BrokerContext {
    /// Scans
    pub query: Connection,
    /// Property watchers of scanned instances
    pub watch: Connection,
    /// Object add/remove watchers and everything they trigger
    pub objects: Connection,
    pub deferred: Arc<DeferredTasks>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Deferred Tasks
// ─────────────────────────────────────────────────────────────────────────────

type Task = Box<dyn FnOnce() + Send>;

/// Debounced one-shot tasks keyed by signal origin and subscriber
pub struct DeferredTasks {
    delay: Duration,
    tasks: Mutex<BTreeMap<u64, (Instant, Task)>>,
}

impl DeferredTasks {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Schedule `task` after the delay unless one is already pending for
    /// `key`; returns whether it was scheduled
    pub fn schedule<F>(&self, key: u64, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&key) {
            return false;
        }
        tasks.insert(key, (Instant::now() + self.delay, Box::new(task)));
        true
    }

    /// Run every task whose time has come, returning how many ran
    pub fn run_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<Task> = {
            let mut tasks = self.tasks.lock();
            let keys: Vec<u64> = tasks
                .iter()
                .filter(|(_, (at, _))| *at <= now)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| tasks.remove(&key).map(|(_, task)| task))
                .collect()
        };
        let count = due.len();
        for task in due {
            task();
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// Debounce key of a signal from `sender` about `path`, per subscriber
fn signal_key(subscriber: usize, sender: &str, path: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    subscriber.hash(&mut hasher);
    sender.hash(&mut hasher);
    path.hash(&mut hasher);
    hasher.finish()
}

// ─────────────────────────────────────────────────────────────────────────────
// Broker
// ─────────────────────────────────────────────────────────────────────────────

pub struct Broker {
    query: Arc<dyn BusQuery>,
    entity: Arc<Entity>,
    watch: bool,
    interval: Duration,
    run_lock: Mutex<()>,
    last_run: Mutex<Option<Instant>>,
    object_watchers: Mutex<Vec<Watcher>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("entity", &self.entity.name())
            .field("watch", &self.watch)
            .field("interval", &self.interval)
            .field("last_run", &*self.last_run.lock())
            .finish()
    }
}

impl Broker {
    /// Single-shot broker that watches for changes
    pub fn new(query: Arc<dyn BusQuery>, entity: Arc<Entity>) -> Self {
        entity.register_fields(&query.fields());
        Self {
            query,
            entity,
            watch: true,
            interval: Duration::ZERO,
            run_lock: Mutex::new(()),
            last_run: Mutex::new(None),
            object_watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Minimum time between runs; zero runs the query once
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn is_watching(&self) -> bool {
        self.watch
    }

    pub fn is_single_shot(&self) -> bool {
        self.interval.is_zero()
    }

    pub fn is_due(&self) -> bool {
        match *self.last_run.lock() {
            None => true,
            Some(last) => !self.is_single_shot() && Instant::now() > last + self.interval,
        }
    }

    /// Not running and due
    pub fn is_ready(&self) -> bool {
        !self.run_lock.is_locked() && self.is_due()
    }

    /// Run the query when nobody else is and the timer allows.
    ///
    /// Returns whether the entity was refreshed.
    pub fn try_process(self: &Arc<Self>, ctx: &BrokerContext) -> bool {
        let Some(_running) = self.run_lock.try_lock() else {
            tracing::trace!(entity = %self.entity.name(), "Broker busy");
            return false;
        };
        if !self.is_due() {
            return false;
        }

        let started = Instant::now();
        let instances = match self.query.process_with(&ctx.query) {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!(entity = %self.entity.name(), error = %e, "Broker query failed");
                return false;
            }
        };

        if self.watch {
            for instance in &instances {
                if let Err(e) = instance.bind_listeners(&ctx.watch) {
                    tracing::warn!(path = %instance.path(), error = %e, "Failed to watch instance");
                }
            }
            self.bind(ctx);
        }

        let count = instances.len();
        self.entity.set_instances(instances);
        *self.last_run.lock() = Some(Instant::now());
        tracing::debug!(
            entity = %self.entity.name(),
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Broker refreshed entity"
        );
        true
    }

    /// Register the object add/remove watchers once
    pub fn bind(self: &Arc<Self>, ctx: &BrokerContext) {
        let mut watchers = self.object_watchers.lock();
        if !watchers.is_empty() {
            return;
        }

        let subscriber = Arc::as_ptr(self) as usize;
        let weak = Arc::downgrade(self);
        let objects = ctx.objects.downgrade();
        let deferred = Arc::clone(&ctx.deferred);
        let added = ctx.objects.add_watcher(MatchRule::interfaces_added(), move |signal| {
            if let Signal::InterfacesAdded {
                sender,
                path,
                interfaces,
            } = signal
            {
                let broker: Weak<Broker> = Weak::clone(&weak);
                let connection = objects.clone();
                let sender = sender.clone();
                let path = path.clone();
                let interfaces: Vec<String> = interfaces.keys().cloned().collect();
                let key = signal_key(subscriber, &sender, &path);
                deferred.schedule(key, move || {
                    if let (Some(broker), Some(connection)) = (broker.upgrade(), connection.upgrade()) {
                        broker.handle_added(&connection, &sender, &path, &interfaces);
                    }
                });
            }
        });

        let weak = Arc::downgrade(self);
        let objects = ctx.objects.downgrade();
        let removed = ctx.objects.add_watcher(MatchRule::interfaces_removed(), move |signal| {
            if let Signal::InterfacesRemoved {
                sender,
                path,
                interfaces,
            } = signal
            {
                if let (Some(broker), Some(objects)) = (weak.upgrade(), objects.upgrade()) {
                    broker.handle_removed(&objects, sender, path, interfaces);
                }
            }
        });

        match (added, removed) {
            (Ok(added), Ok(removed)) => {
                watchers.push(added);
                watchers.push(removed);
                tracing::debug!(entity = %self.entity.name(), "Object watchers registered");
            }
            (added, removed) => {
                for e in [added.err(), removed.err()].into_iter().flatten() {
                    tracing::error!(entity = %self.entity.name(), error = %e, "Failed to register object watcher");
                }
            }
        }
    }

    /// Interfaces-added flow for one object
    pub fn handle_added(&self, connection: &Connection, sender: &str, path: &str, interfaces: &[String]) {
        let service = match connection.well_known_name(sender) {
            Ok(service) => service,
            Err(e) => {
                tracing::debug!(sender = %sender, path = %path, error = %e, "Can't handle interfaces-added signal");
                return;
            }
        };
        if !self.query.check_path(path, Some(service.as_str())) {
            return;
        }

        let services: BTreeMap<String, Vec<String>> = match connection.call(
            well_known::MAPPER_SERVICE,
            well_known::MAPPER_PATH,
            well_known::MAPPER_INTERFACE,
            well_known::GET_OBJECT,
            &(path, interfaces),
        ) {
            Ok(services) => services,
            Err(e) => {
                tracing::debug!(service = %service, path = %path, error = %e, "Object lookup failed");
                return;
            }
        };
        let Some(object_interfaces) = services.get(&service) else {
            return;
        };
        if !self.query.check_criteria(path, object_interfaces, Some(service.as_str())) {
            return;
        }

        tracing::debug!(entity = %self.entity.name(), service = %service, path = %path, "Instance added by signal");
        let instance = self.query.create_instance(connection, &service, path, object_interfaces);
        match self.entity.get_instance(instance.hash()) {
            None => {
                if self.watch {
                    if let Err(e) = instance.bind_listeners(connection) {
                        tracing::warn!(path = %path, error = %e, "Failed to watch instance");
                    }
                }
                self.entity.merge_instance(instance);
            }
            Some(existing) => {
                existing.merge_internal_metadata(&instance);
                existing.mark_uninitialized();
                existing.verify_state(connection);
                if self.watch {
                    if let Err(e) = existing.bind_listeners(connection) {
                        tracing::warn!(path = %path, error = %e, "Failed to watch instance");
                    }
                }
            }
        }
    }

    /// Interfaces-removed flow for one object
    pub fn handle_removed(&self, connection: &Connection, sender: &str, path: &str, interfaces: &[String]) {
        let service = match connection.well_known_name(sender) {
            Ok(service) => service,
            Err(e) => {
                tracing::debug!(sender = %sender, path = %path, error = %e, "Can't handle interfaces-removed signal");
                return;
            }
        };
        if !self.query.check_criteria(path, interfaces, Some(service.as_str())) {
            return;
        }
        if let Some(instance) = self.entity.remove_instance(instance_hash(&service, path)) {
            instance.release_listeners();
            tracing::debug!(entity = %self.entity.name(), service = %service, path = %path, "Instance removed by signal");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use crate::query::{FieldMapping, FieldSchema, FindObjectQuery};
    use busmirror_bus::{BusError, ConnectionConfig, LocalBus};
    use busmirror_types::{InterfaceMap, PropertyMap, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const SENSOR: &str = "xyz.openbmc_project.Sensor.Value";
    const HWMON: &str = "xyz.openbmc_project.Hwmon";
    const NS: &str = "/xyz/openbmc_project/sensors";

    fn sensor(value: f64) -> InterfaceMap {
        let mut props = PropertyMap::new();
        props.insert("Value".to_string(), Value::Float(value));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(SENSOR.to_string(), props);
        interfaces
    }

    fn connect(bus: &LocalBus) -> Connection {
        let config = ConnectionConfig {
            name_lookup_attempts: 1,
            name_lookup_interval: Duration::from_millis(1),
            guard_unit: Duration::from_micros(100),
            ..ConnectionConfig::default()
        };
        Connection::new(bus.connect(), config)
    }

    fn context(bus: &LocalBus) -> BrokerContext {
        BrokerContext {
            query: connect(bus),
            watch: connect(bus),
            objects: connect(bus),
            deferred: Arc::new(DeferredTasks::new(Duration::ZERO)),
        }
    }

    fn broker(bus: &LocalBus) -> Arc<Broker> {
        let schema = FieldSchema::new()
            .with_interface(SENSOR, [FieldMapping::new("Value", "Reading")])
            .into_shared();
        let query = Arc::new(FindObjectQuery::new(connect(bus), NS, schema));
        let entity = Entity::new("Sensor", EntityKind::Collection).into_shared();
        Arc::new(Broker::new(query, entity))
    }

    #[test]
    fn test_deferred_tasks_keep_first() {
        let tasks = DeferredTasks::new(Duration::ZERO);
        let hits = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&hits);
        let second = Arc::clone(&hits);
        assert!(tasks.schedule(1, move || {
            first.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!tasks.schedule(1, move || {
            second.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(tasks.run_due(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tasks.pending(), 0);
    }

    #[test]
    fn test_deferred_tasks_wait_for_delay() {
        let tasks = DeferredTasks::new(Duration::from_secs(60));
        tasks.schedule(1, || {});
        assert_eq!(tasks.run_due(), 0);
        assert_eq!(tasks.pending(), 1);
    }

    #[test]
    fn test_single_shot_timer() {
        let bus = LocalBus::new();
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        let broker = broker(&bus);
        let ctx = context(&bus);

        assert!(broker.is_due());
        assert!(broker.try_process(&ctx));
        assert!(!broker.is_due());
        assert!(!broker.try_process(&ctx));
        assert_eq!(broker.entity().len(), 1);
        assert!(broker.entity().has_member("Reading"));
    }

    #[test]
    fn test_interval_timer() {
        let bus = LocalBus::new();
        let schema = FieldSchema::new().with_interface(SENSOR, Vec::<FieldMapping>::new()).into_shared();
        let query = Arc::new(FindObjectQuery::new(connect(&bus), NS, schema));
        let entity = Entity::new("Sensor", EntityKind::Collection).into_shared();
        let broker = Arc::new(
            Broker::new(query, entity)
                .with_interval(Duration::from_millis(20))
                .with_watch(false),
        );
        let ctx = context(&bus);

        assert!(broker.try_process(&ctx));
        assert!(!broker.is_due());
        thread::sleep(Duration::from_millis(30));
        assert!(broker.is_ready());
        assert!(broker.try_process(&ctx));
    }

    #[test]
    fn test_busy_broker_is_skipped() {
        let bus = LocalBus::new();
        let broker = broker(&bus);
        let ctx = context(&bus);

        let held = broker.run_lock.lock();
        assert!(!broker.is_ready());
        assert!(!broker.try_process(&ctx));
        drop(held);
        assert!(broker.try_process(&ctx));
    }

    /// Scan that counts its runs and takes a while
    struct SlowQuery {
        inner: FindObjectQuery,
        runs: Arc<AtomicUsize>,
    }

    impl crate::query::Query for SlowQuery {
        fn process(&self) -> crate::error::CoreResult<Vec<crate::instance::InstancePtr>> {
            self.process_with(self.inner.connection())
        }

        fn fields(&self) -> Vec<String> {
            self.inner.fields()
        }
    }

    impl BusQuery for SlowQuery {
        fn connection(&self) -> &Connection {
            self.inner.connection()
        }

        fn schema(&self) -> &Arc<FieldSchema> {
            self.inner.schema()
        }

        fn process_with(&self, connection: &Connection) -> crate::error::CoreResult<Vec<crate::instance::InstancePtr>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            self.inner.process_with(connection)
        }

        fn check_path(&self, path: &str, service: Option<&str>) -> bool {
            self.inner.check_path(path, service)
        }

        fn check_criteria(&self, path: &str, interfaces: &[String], service: Option<&str>) -> bool {
            self.inner.check_criteria(path, interfaces, service)
        }
    }

    #[test]
    fn test_concurrent_runs_execute_once() {
        let bus = LocalBus::new();
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        let schema = FieldSchema::new().with_interface(SENSOR, Vec::<FieldMapping>::new()).into_shared();
        let runs = Arc::new(AtomicUsize::new(0));
        let query = Arc::new(SlowQuery {
            inner: FindObjectQuery::new(connect(&bus), NS, schema),
            runs: Arc::clone(&runs),
        });
        let entity = Entity::new("Sensor", EntityKind::Collection).into_shared();
        let broker = Arc::new(Broker::new(query, entity).with_watch(false));

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let broker = Arc::clone(&broker);
                let barrier = Arc::clone(&barrier);
                let ctx = context(&bus);
                thread::spawn(move || {
                    barrier.wait();
                    broker.try_process(&ctx)
                })
            })
            .collect();
        let processed: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(processed.iter().filter(|p| **p).count(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(broker.entity().len(), 1);
    }

    #[test]
    fn test_bus_error_keeps_timer() {
        let bus = LocalBus::new();
        bus.fail_method(
            well_known::MAPPER_SERVICE,
            well_known::MAPPER_INTERFACE,
            well_known::GET_SUB_TREE,
            BusError::ServiceUnknown(well_known::MAPPER_SERVICE.to_string()),
        );
        let broker = broker(&bus);
        let ctx = context(&bus);

        assert!(!broker.try_process(&ctx));
        assert!(broker.is_due());

        bus.clear_failure(well_known::MAPPER_SERVICE, well_known::MAPPER_INTERFACE, well_known::GET_SUB_TREE);
        assert!(broker.try_process(&ctx));
    }

    #[test]
    fn test_watched_instances_follow_changes() {
        let bus = LocalBus::new();
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        let broker = broker(&bus);
        let ctx = context(&bus);
        broker.try_process(&ctx);

        bus.set_property(HWMON, "/xyz/openbmc_project/sensors/cpu0", SENSOR, "Value", 45.0);
        ctx.watch.process_once(Duration::from_millis(50)).unwrap();
        let rows = broker.entity().get_instances(&[]);
        assert_eq!(rows[0].field("Reading").float_value().unwrap(), 45.0);
    }

    #[test]
    fn test_added_and_removed_signals() {
        let bus = LocalBus::new();
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        let broker = broker(&bus);
        let ctx = context(&bus);
        broker.try_process(&ctx);
        assert_eq!(broker.entity().len(), 1);

        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu1", sensor(41.0));
        bus.add_object("other.Service", "/xyz/openbmc_project/inventory/board", sensor(1.0));
        ctx.objects.process_once(Duration::from_millis(50)).unwrap();
        assert_eq!(ctx.deferred.pending(), 2);
        ctx.deferred.run_due();
        assert_eq!(broker.entity().len(), 2);
        assert!(broker.entity().contains(instance_hash(HWMON, "/xyz/openbmc_project/sensors/cpu1")));

        bus.remove_object(HWMON, "/xyz/openbmc_project/sensors/cpu0");
        ctx.objects.process_once(Duration::from_millis(50)).unwrap();
        assert_eq!(broker.entity().len(), 1);
        assert!(!broker.entity().contains(instance_hash(HWMON, "/xyz/openbmc_project/sensors/cpu0")));
    }

    #[test]
    fn test_added_signal_reaches_every_broker() {
        let bus = LocalBus::new();
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        let sensors = broker(&bus);
        let schema = FieldSchema::new()
            .with_interface(SENSOR, [FieldMapping::new("Value", "Reading")])
            .into_shared();
        let query = Arc::new(FindObjectQuery::new(connect(&bus), "/xyz/openbmc_project/inventory", schema));
        let entity = Entity::new("Inventory", EntityKind::Collection).into_shared();
        let inventory = Arc::new(Broker::new(query, entity));

        let ctx = context(&bus);
        assert!(sensors.try_process(&ctx));
        assert!(inventory.try_process(&ctx));
        assert_eq!(inventory.entity().len(), 0);

        bus.add_object(HWMON, "/xyz/openbmc_project/inventory/board", sensor(1.0));
        ctx.objects.process_once(Duration::from_millis(50)).unwrap();
        assert_eq!(ctx.deferred.pending(), 2);
        assert_eq!(ctx.deferred.run_due(), 2);

        assert_eq!(sensors.entity().len(), 1);
        assert_eq!(inventory.entity().len(), 1);
        assert!(inventory.entity().contains(instance_hash(HWMON, "/xyz/openbmc_project/inventory/board")));
    }

    #[test]
    fn test_repeated_signal_is_debounced_per_broker() {
        let bus = LocalBus::new();
        let broker = broker(&bus);
        let ctx = context(&bus);
        broker.try_process(&ctx);

        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(41.0));
        ctx.objects.process_once(Duration::from_millis(50)).unwrap();
        assert_eq!(ctx.deferred.pending(), 1);
        ctx.deferred.run_due();
        assert_eq!(broker.entity().len(), 1);
    }

    #[test]
    fn test_object_watchers_release_connection() {
        let bus = LocalBus::new();
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        let broker = broker(&bus);
        let ctx = context(&bus);
        assert!(broker.try_process(&ctx));
        assert_eq!(ctx.objects.watcher_count(), 2);

        let objects = ctx.objects.downgrade();
        drop(ctx);
        assert!(objects.upgrade().is_none());
    }

    #[test]
    fn test_added_signal_for_known_instance_merges() {
        let bus = LocalBus::new();
        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(40.0));
        let broker = broker(&bus);
        let ctx = context(&bus);
        broker.try_process(&ctx);
        let original = broker.entity().raw_instances()[0].clone();

        bus.add_object(HWMON, "/xyz/openbmc_project/sensors/cpu0", sensor(50.0));
        ctx.objects.process_once(Duration::from_millis(50)).unwrap();
        ctx.deferred.run_due();

        let current = broker.entity().raw_instances()[0].clone();
        assert!(Arc::ptr_eq(&original, &current));
        assert_eq!(current.field("Reading").float_value().unwrap(), 50.0);
        assert!(current.is_initialized());
    }
}
