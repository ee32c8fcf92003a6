//! Entity registry

use std::sync::Arc;

use busmirror_bus::Connection;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::condition::Condition;
use crate::entity::{Entity, EntityDefinition};
use crate::error::{CoreError, CoreResult};
use crate::instance::{InstanceHash, InstancePtr};

/// Entities addressed by name
pub struct EntityManager {
    entities: DashMap<String, Arc<Entity>>,
    connection: Connection,
}

impl EntityManager {
    pub fn new(connection: Connection) -> Self {
        Self {
            entities: DashMap::new(),
            connection,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn add_entity(&self, entity: Entity) -> CoreResult<Arc<Entity>> {
        self.add_shared(Arc::new(entity))
    }

    pub fn add_shared(&self, entity: Arc<Entity>) -> CoreResult<Arc<Entity>> {
        let name = entity.name().to_string();
        match self.entities.entry(name.clone()) {
            Entry::Occupied(_) => Err(CoreError::DuplicateEntity(name)),
            Entry::Vacant(slot) => {
                tracing::debug!(entity = %name, "Entity registered");
                slot.insert(Arc::clone(&entity));
                Ok(entity)
            }
        }
    }

    /// Register a statically defined entity under its `NAME`
    pub fn register<T: EntityDefinition>(&self) -> CoreResult<Arc<Entity>> {
        let entity = T::define(&self.connection);
        if entity.name() != T::NAME {
            tracing::warn!(expected = T::NAME, actual = %entity.name(), "Entity name differs from its definition");
        }
        self.add_entity(entity)
    }

    /// Registered entity without refreshing it
    pub fn get(&self, name: &str) -> Option<Arc<Entity>> {
        self.entities.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered entity, populated according to its policy
    pub fn entity(&self, name: &str) -> CoreResult<Arc<Entity>> {
        let entity = self
            .get(name)
            .ok_or_else(|| CoreError::EntityNotFound(name.to_string()))?;
        entity.populate()?;
        Ok(entity)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<Entity>> {
        self.entities.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Initialize every entity's member schema
    pub fn configure(&self) {
        for entity in self.all() {
            entity.initialize();
        }
    }

    /// Populate every entity
    pub fn update(&self) -> CoreResult<()> {
        for entity in self.all() {
            entity.populate()?;
            tracing::info!(entity = %entity.name(), "Entity cache initialized");
        }
        Ok(())
    }

    /// Rows of `destination` related to the row `hash` of `source`.
    ///
    /// The destination is populated first; `extra` conditions are ANDed with
    /// the relation's own.
    pub fn related_instances(
        &self,
        source: &str,
        destination: &str,
        hash: InstanceHash,
        extra: &[Condition],
    ) -> CoreResult<Vec<InstancePtr>> {
        let source_entity = self
            .get(source)
            .ok_or_else(|| CoreError::EntityNotFound(source.to_string()))?;
        let relation = source_entity
            .relation(destination)
            .ok_or_else(|| CoreError::RelationNotFound {
                source_entity: source.to_string(),
                destination: destination.to_string(),
            })?;
        let destination_entity = self.entity(relation.destination())?;

        let mut conditions = relation.conditions(&source_entity, hash);
        conditions.extend_from_slice(extra);
        Ok(destination_entity.get_instances(&conditions))
    }

    /// Every entity's rows keyed by entity name
    pub fn snapshot_json(&self) -> serde_json::Value {
        let mut snapshot = serde_json::Map::new();
        for name in self.names() {
            if let Some(entity) = self.get(&name) {
                snapshot.insert(name, entity.to_json());
            }
        }
        serde_json::Value::Object(snapshot)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
