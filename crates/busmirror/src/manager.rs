//! Broker thread pool
//!
//! The manager owns every OS thread of the cache: a pool of workers sweeping
//! the brokers, one thread dispatching object add/remove signals (and running
//! the debounced add handlers) and one thread following service ownership
//! changes into the shared name cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use busmirror_bus::{BusResult, Connection, ConnectionConfig, ServiceNames, Transport, exit_on_fatal};
use parking_lot::{Mutex, RwLock};

use crate::broker::{Broker, BrokerContext, DeferredTasks};
use crate::error::{CoreError, CoreResult};

/// Opens one bus handle per call
pub type TransportFactory = Arc<dyn Fn() -> BusResult<Arc<dyn Transport>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BrokerManagerConfig {
    pub worker_threads: usize,
    /// Longest a worker blocks on its watch connection between sweeps
    pub watch_wait: Duration,
    /// Wait per loop of the ownership thread
    pub owner_wait: Duration,
    /// Debounce of interfaces-added handlers
    pub add_signal_delay: Duration,
    pub connection: ConnectionConfig,
}

impl Default for BrokerManagerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 10,
            watch_wait: Duration::from_millis(500),
            owner_wait: Duration::from_secs(1),
            add_signal_delay: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

pub struct BrokerManager {
    config: BrokerManagerConfig,
    factory: TransportFactory,
    names: Arc<ServiceNames>,
    brokers: Arc<RwLock<Vec<Arc<Broker>>>>,
    deferred: Arc<DeferredTasks>,
    active: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl BrokerManager {
    pub fn new(config: BrokerManagerConfig, factory: TransportFactory) -> Self {
        let deferred = Arc::new(DeferredTasks::new(config.add_signal_delay));
        Self {
            config,
            factory,
            names: Arc::new(ServiceNames::new()),
            brokers: Arc::new(RwLock::new(Vec::new())),
            deferred,
            active: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BrokerManagerConfig {
        &self.config
    }

    pub fn add_broker(&self, broker: Broker) -> Arc<Broker> {
        let broker = Arc::new(broker);
        self.brokers.write().push(Arc::clone(&broker));
        broker
    }

    pub fn brokers(&self) -> Vec<Arc<Broker>> {
        self.brokers.read().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// New connection sharing the manager's name cache
    pub fn connect(&self) -> CoreResult<Connection> {
        let transport = (self.factory)()?;
        Ok(Connection::with_service_names(
            transport,
            self.config.connection.clone(),
            Arc::clone(&self.names),
        ))
    }

    fn spawn<F>(&self, name: String, body: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| CoreError::Spawn(format!("{}: {}", name, e)))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Open the connections and spawn every thread
    pub fn start(&self) -> CoreResult<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.spawn_all() {
            self.terminate();
            return Err(e);
        }
        tracing::info!(
            workers = self.config.worker_threads,
            brokers = self.brokers.read().len(),
            "Broker manager started"
        );
        Ok(())
    }

    fn spawn_all(&self) -> CoreResult<()> {
        let owners = self.connect()?;
        if let Err(e) = owners.refresh_service_names() {
            tracing::warn!(error = %e, "Initial service name refresh failed");
        }
        let owner_watcher = owners.watch_name_owner_changes()?;
        let active = Arc::clone(&self.active);
        let wait = self.config.owner_wait;
        self.spawn("bus-owners".to_string(), move || {
            let _watcher = owner_watcher;
            while active.load(Ordering::Acquire) {
                if let Err(e) = owners.process_once(wait) {
                    exit_on_fatal(&e);
                    tracing::warn!(error = %e, "Ownership watch iteration failed");
                }
            }
            tracing::debug!("Ownership thread stopped");
        })?;

        let objects = self.connect()?;
        let active = Arc::clone(&self.active);
        let deferred = Arc::clone(&self.deferred);
        let wait = self.config.watch_wait;
        let dispatch = objects.clone();
        self.spawn("bus-objects".to_string(), move || {
            while active.load(Ordering::Acquire) {
                if let Err(e) = dispatch.process_once(wait) {
                    exit_on_fatal(&e);
                    tracing::warn!(error = %e, "Object watch iteration failed");
                }
                let ran = deferred.run_due();
                if ran > 0 {
                    tracing::trace!(count = ran, "Deferred object handlers ran");
                }
            }
            tracing::debug!("Object watch thread stopped");
        })?;

        for index in 0..self.config.worker_threads {
            let ctx = BrokerContext {
                query: self.connect()?,
                watch: self.connect()?,
                objects: objects.clone(),
                deferred: Arc::clone(&self.deferred),
            };
            let active = Arc::clone(&self.active);
            let brokers = Arc::clone(&self.brokers);
            let wait = self.config.watch_wait;
            self.spawn(format!("broker-worker-{}", index), move || {
                run_worker(index, &ctx, &brokers, &active, wait);
            })?;
        }
        Ok(())
    }

    /// Stop every loop and join the threads
    pub fn terminate(&self) {
        self.active.store(false, Ordering::Release);
        let threads = std::mem::take(&mut *self.threads.lock());
        let count = threads.len();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("Broker manager thread panicked");
            }
        }
        if count > 0 {
            tracing::info!(threads = count, "Broker manager stopped");
        }
    }
}

impl Drop for BrokerManager {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_worker(
    index: usize,
    ctx: &BrokerContext,
    brokers: &RwLock<Vec<Arc<Broker>>>,
    active: &AtomicBool,
    wait: Duration,
) {
    tracing::debug!(worker = index, "Broker worker started");
    while active.load(Ordering::Acquire) {
        let snapshot = brokers.read().clone();
        for broker in &snapshot {
            if !active.load(Ordering::Acquire) {
                break;
            }
            broker.try_process(ctx);
        }

        // wait at least once per sweep
        loop {
            if let Err(e) = ctx.watch.process_once(wait) {
                exit_on_fatal(&e);
                tracing::warn!(worker = index, error = %e, "Watch iteration failed");
            }
            if !active.load(Ordering::Acquire) || brokers.read().iter().any(|broker| broker.is_ready()) {
                break;
            }
        }
    }
    tracing::debug!(worker = index, "Broker worker stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
