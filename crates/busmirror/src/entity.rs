//! Entity container
//!
//! An [`Entity`] holds the instances of one kind of object together with its
//! member schema, the queries that fill it, supplement providers that enrich
//! its rows and relations to other entities.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use busmirror_bus::Connection;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, check_all};
use crate::definitions::{META_OBJECT_PATH, META_OBJECT_SERVICE};
use crate::error::CoreResult;
use crate::instance::{Instance, InstanceHash, InstancePtr};
use crate::query::Query;
use crate::relation::Relation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Single row
    Object,
    #[default]
    Collection,
}

/// When [`Entity::populate`] re-runs the queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourcePolicy {
    /// First call only
    #[default]
    Cached,
    /// Every call
    Lazy,
    /// Like `Cached`, expiring after the given time
    ShortTimeCached(Duration),
}

/// Decides whether and how a provider row enriches a target row
pub type LinkRule = Arc<dyn Fn(&Instance, &Instance) + Send + Sync>;

/// Copy every non-metadata member of the provider row into the target row
pub fn default_link_rule() -> LinkRule {
    Arc::new(|provider: &Instance, target: &Instance| target.supplement_or_update_from(provider))
}

/// Entity whose rows enrich another entity's rows
#[derive(Clone)]
pub struct SupplementProvider {
    pub provider: Arc<Entity>,
    pub rule: LinkRule,
}

/// Registration of a statically defined entity
pub trait EntityDefinition {
    const NAME: &'static str;

    fn define(connection: &Connection) -> Entity;
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity
// ─────────────────────────────────────────────────────────────────────────────

pub struct Entity {
    name: String,
    kind: EntityKind,
    policy: SourcePolicy,
    members: RwLock<Vec<String>>,
    queries: Vec<Arc<dyn Query>>,
    providers: Vec<SupplementProvider>,
    relations: RwLock<BTreeMap<String, Relation>>,
    instances: RwLock<BTreeMap<InstanceHash, InstancePtr>>,
    primed_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("members", &self.members.read().len())
            .field("queries", &self.queries.len())
            .field("providers", &self.providers.len())
            .field("instances", &self.instances.read().len())
            .finish()
    }
}

impl Entity {
    pub fn new(name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            policy: SourcePolicy::default(),
            members: RwLock::new(Vec::new()),
            queries: Vec::new(),
            providers: Vec::new(),
            relations: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(BTreeMap::new()),
            primed_at: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: SourcePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_query(mut self, query: Arc<dyn Query>) -> Self {
        self.queries.push(query);
        self
    }

    pub fn with_provider(mut self, provider: Arc<Entity>, rule: LinkRule) -> Self {
        self.providers.push(SupplementProvider { provider, rule });
        self
    }

    pub fn with_relation(self, relation: Relation) -> Self {
        self.add_relation(relation);
        self
    }

    pub fn with_member(self, member: impl Into<String>) -> Self {
        self.add_member(member);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn policy(&self) -> SourcePolicy {
        self.policy
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Members
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a member; duplicates warn and keep the first registration
    pub fn add_member(&self, member: impl Into<String>) -> bool {
        let member = member.into();
        let mut members = self.members.write();
        if members.contains(&member) {
            tracing::warn!(entity = %self.name, member = %member, "Member already registered");
            return false;
        }
        members.push(member);
        true
    }

    fn ensure_members(&self, names: impl IntoIterator<Item = String>) {
        let mut members = self.members.write();
        for name in names {
            if !members.contains(&name) {
                members.push(name);
            }
        }
    }

    /// Register the members produced by an external query
    pub fn register_fields(&self, fields: &[String]) {
        self.ensure_members(fields.iter().cloned());
    }

    pub fn has_member(&self, member: &str) -> bool {
        self.members.read().iter().any(|m| m == member)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.read().clone()
    }

    /// Register members declared by queries and providers
    pub fn initialize(&self) {
        self.ensure_members([META_OBJECT_PATH.to_string(), META_OBJECT_SERVICE.to_string()]);
        for query in &self.queries {
            self.ensure_members(query.fields());
        }
        for provider in &self.providers {
            provider.provider.initialize();
            self.ensure_members(provider.provider.member_names());
        }
        tracing::debug!(entity = %self.name, members = self.members.read().len(), "Entity initialized");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_relation(&self, relation: Relation) {
        tracing::debug!(entity = %self.name, destination = %relation.destination(), "Relation registered");
        self.relations
            .write()
            .insert(relation.destination().to_string(), relation);
    }

    /// Relation to the entity registered as `destination`
    pub fn relation(&self, destination: &str) -> Option<Relation> {
        self.relations.read().get(destination).cloned()
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.relations.read().keys().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Population
    // ─────────────────────────────────────────────────────────────────────────

    /// Refresh the cache when the policy says so.
    ///
    /// Entities without queries are fed externally and never reset here.
    /// Returns whether the queries ran.
    pub fn populate(&self) -> CoreResult<bool> {
        if self.queries.is_empty() {
            return Ok(false);
        }
        let mut primed_at = self.primed_at.lock();
        let due = match self.policy {
            SourcePolicy::Lazy => true,
            SourcePolicy::Cached => primed_at.is_none(),
            SourcePolicy::ShortTimeCached(ttl) => primed_at.is_none_or(|at| at.elapsed() > ttl),
        };
        if !due {
            return Ok(false);
        }
        self.reset_cache();
        self.process_queries()?;
        *primed_at = Some(Instant::now());
        Ok(true)
    }

    pub fn reset_cache(&self) {
        let dropped = std::mem::take(&mut *self.instances.write());
        tracing::trace!(entity = %self.name, count = dropped.len(), "Cache reset");
    }

    /// Run every query and merge its rows.
    ///
    /// Bus failures are logged and skip that query; other errors propagate.
    pub fn process_queries(&self) -> CoreResult<()> {
        for query in &self.queries {
            match query.process() {
                Ok(instances) => {
                    for instance in instances {
                        self.merge_instance(instance);
                    }
                }
                Err(e) if e.is_bus() => {
                    tracing::error!(entity = %self.name, error = %e, "Query failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Instances
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace every row
    pub fn set_instances(&self, instances: Vec<InstancePtr>) {
        let map = instances
            .into_iter()
            .map(|instance| (instance.hash(), instance))
            .collect();
        *self.instances.write() = map;
    }

    /// Insert a new row, or merge fields into the existing one and return it
    pub fn merge_instance(&self, instance: InstancePtr) -> InstancePtr {
        let mut instances = self.instances.write();
        match instances.get(&instance.hash()) {
            Some(existing) => {
                existing.supplement_or_update_from(&instance);
                Arc::clone(existing)
            }
            None => {
                instances.insert(instance.hash(), Arc::clone(&instance));
                instance
            }
        }
    }

    pub fn remove_instance(&self, hash: InstanceHash) -> Option<InstancePtr> {
        let removed = self.instances.write().remove(&hash);
        if removed.is_some() {
            tracing::debug!(entity = %self.name, hash, "Instance removed");
        }
        removed
    }

    /// Top-level row, or a complex child of one
    pub fn get_instance(&self, hash: InstanceHash) -> Option<InstancePtr> {
        let instances = self.instances.read();
        if let Some(instance) = instances.get(&hash) {
            return Some(Arc::clone(instance));
        }
        instances
            .values()
            .find_map(|instance| instance.complex_instance(hash))
    }

    pub fn contains(&self, hash: InstanceHash) -> bool {
        self.instances.read().contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Top-level rows without defaults, providers or expansion
    pub fn raw_instances(&self) -> Vec<InstancePtr> {
        self.instances.read().values().cloned().collect()
    }

    /// Every row, complex children included, enriched by the supplement
    /// providers and filtered by `conditions`
    pub fn get_instances(&self, conditions: &[Condition]) -> Vec<InstancePtr> {
        let supplements: Vec<(LinkRule, Vec<InstancePtr>)> = self
            .providers
            .iter()
            .map(|provider| {
                if let Err(e) = provider.provider.populate() {
                    tracing::error!(
                        entity = %self.name,
                        provider = %provider.provider.name(),
                        error = %e,
                        "Supplement provider failed"
                    );
                }
                (Arc::clone(&provider.rule), provider.provider.get_instances(&[]))
            })
            .collect();

        let mut result = Vec::new();
        for instance in self.raw_instances() {
            instance.apply_default_fields();
            let rows = std::iter::once(Arc::clone(&instance)).chain(instance.complex_instances());
            for row in rows {
                for (rule, provided) in &supplements {
                    for provider_row in provided {
                        rule(provider_row, &row);
                    }
                }
                if check_all(conditions, &row) {
                    result.push(row);
                }
            }
        }
        result
    }

    /// Rows rendered as JSON objects
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.get_instances(&[])
                .iter()
                .map(|instance| instance.to_json())
                .collect(),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::query::{FieldMapping, FieldSchema};
    use busmirror_bus::BusError;
    use busmirror_types::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Produces one fresh row per run and counts its runs
    struct CountingQuery {
        runs: Arc<AtomicUsize>,
        fail_with: Option<fn() -> CoreError>,
    }

    impl Query for CountingQuery {
        fn process(&self) -> CoreResult<Vec<InstancePtr>> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            let inst = Instance::new("svc", "/obj", Vec::<String>::new(), Arc::new(FieldSchema::new()));
            inst.supplement_or_update("Run", run as i64);
            Ok(vec![Arc::new(inst)])
        }

        fn fields(&self) -> Vec<String> {
            vec!["Run".to_string()]
        }
    }

    fn counting_entity(policy: SourcePolicy) -> (Entity, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let query = CountingQuery {
            runs: Arc::clone(&runs),
            fail_with: None,
        };
        let entity = Entity::new("Counter", EntityKind::Object)
            .with_policy(policy)
            .with_query(Arc::new(query));
        (entity, runs)
    }

    fn row(path: &str, fields: &[(&str, Value)]) -> InstancePtr {
        let inst = Instance::new("svc", path, Vec::<String>::new(), Arc::new(FieldSchema::new()));
        for (member, value) in fields {
            inst.supplement_or_update(member, value.clone());
        }
        Arc::new(inst)
    }

    #[test]
    fn test_cached_policy_runs_once() {
        let (entity, runs) = counting_entity(SourcePolicy::Cached);
        assert!(entity.populate().unwrap());
        assert!(!entity.populate().unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(entity.len(), 1);
    }

    #[test]
    fn test_lazy_policy_runs_every_time() {
        let (entity, runs) = counting_entity(SourcePolicy::Lazy);
        entity.populate().unwrap();
        entity.populate().unwrap();
        entity.populate().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let rows = entity.get_instances(&[]);
        assert_eq!(rows[0].field("Run").int_value().unwrap(), 3);
    }

    #[test]
    fn test_short_time_cached_expires() {
        let (entity, runs) = counting_entity(SourcePolicy::ShortTimeCached(Duration::from_millis(20)));
        entity.populate().unwrap();
        entity.populate().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        thread::sleep(Duration::from_millis(30));
        entity.populate().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bus_errors_are_swallowed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let entity = Entity::new("Broken", EntityKind::Collection).with_query(Arc::new(CountingQuery {
            runs: Arc::clone(&runs),
            fail_with: Some(|| CoreError::Bus(BusError::ServiceUnknown("svc".to_string()))),
        }));
        assert!(entity.populate().unwrap());
        assert!(entity.is_empty());

        let strict = Entity::new("Strict", EntityKind::Collection).with_query(Arc::new(CountingQuery {
            runs,
            fail_with: Some(|| CoreError::InvalidType("Value".to_string())),
        }));
        assert!(strict.populate().is_err());
    }

    #[test]
    fn test_entity_without_queries_keeps_rows() {
        let entity = Entity::new("Fed", EntityKind::Collection);
        entity.set_instances(vec![row("/a", &[])]);
        assert!(!entity.populate().unwrap());
        assert_eq!(entity.len(), 1);
    }

    #[test]
    fn test_duplicate_member_keeps_first() {
        let entity = Entity::new("E", EntityKind::Object);
        assert!(entity.add_member("Name"));
        assert!(!entity.add_member("Name"));
        assert_eq!(entity.member_names(), vec!["Name"]);
    }

    #[test]
    fn test_initialize_registers_query_fields() {
        let (entity, _) = counting_entity(SourcePolicy::Lazy);
        entity.initialize();
        assert!(entity.has_member("Run"));
        assert!(entity.has_member(META_OBJECT_PATH));
    }

    #[test]
    fn test_merge_and_remove() {
        let entity = Entity::new("E", EntityKind::Collection);
        let first = row("/a", &[("Name", "a".into())]);
        let merged = entity.merge_instance(Arc::clone(&first));
        assert!(Arc::ptr_eq(&first, &merged));

        let update = row("/a", &[("Name", "renamed".into()), ("Extra", 1i64.into())]);
        let merged = entity.merge_instance(update);
        assert!(Arc::ptr_eq(&first, &merged));
        assert_eq!(first.field("Name").string_value().unwrap(), "renamed");
        assert_eq!(first.field("Extra").int_value().unwrap(), 1);

        let removed = entity.remove_instance(first.hash()).unwrap();
        assert!(Arc::ptr_eq(&first, &removed));
        assert!(entity.remove_instance(first.hash()).is_none());
    }

    #[test]
    fn test_get_instances_expands_children_and_filters() {
        let schema = FieldSchema::new()
            .with_interface("net.Iface", [FieldMapping::new("Addresses", "Address")])
            .into_shared();
        let parent = Arc::new(Instance::new("svc", "/eth0", ["net.Iface".to_string()], schema));
        let mut props = busmirror_types::PropertyMap::new();
        props.insert("Addresses".to_string(), Value::from(vec!["10.0.0.1", "10.0.0.2"]));
        parent.fill_members("net.Iface", &props).unwrap();

        let entity = Entity::new("Address", EntityKind::Collection);
        entity.set_instances(vec![parent]);

        assert_eq!(entity.get_instances(&[]).len(), 3);
        let only = entity.get_instances(&[Condition::build_equal("Address", "10.0.0.2")]);
        assert_eq!(only.len(), 1);
        assert!(only[0].is_child());
    }

    #[test]
    fn test_defaults_and_providers_applied() {
        let status = Entity::new("Status", EntityKind::Object).into_shared();
        status.set_instances(vec![row("/status", &[("Health", "Warning".into())])]);

        let schema = FieldSchema::new()
            .with_default("State", |_| Value::from("Enabled"))
            .into_shared();
        let target = Arc::new(Instance::new("svc", "/board", Vec::<String>::new(), schema));

        let entity = Entity::new("Board", EntityKind::Object).with_provider(Arc::clone(&status), default_link_rule());
        entity.set_instances(vec![target]);

        let rows = entity.get_instances(&[]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field("State").string_value().unwrap(), "Enabled");
        assert_eq!(rows[0].field("Health").string_value().unwrap(), "Warning");
        assert_eq!(rows[0].field(META_OBJECT_PATH).string_value().unwrap(), "/board");
    }

    #[test]
    fn test_relation_lookup() {
        let entity = Entity::new("Chassis", EntityKind::Collection)
            .with_relation(Relation::new("Sensor"));
        assert!(entity.relation("Sensor").is_some());
        assert!(entity.relation("Fan").is_none());
    }
}
