//! Busmirror - Cache of objects published on a D-Bus style object bus
//!
//! Queries scan the bus into [`Instance`]s, [`Entity`] containers group them
//! and relate them to each other, and [`Broker`]s keep the entities current
//! from a pool of worker threads owned by the [`BrokerManager`].

pub mod broker;
pub mod catalog;
pub mod condition;
pub mod config;
pub mod definitions;
pub mod entity;
pub mod entity_manager;
pub mod error;
pub mod instance;
pub mod manager;
pub mod query;
pub mod relation;

pub use broker::{Broker, BrokerContext, DeferredTasks};
pub use catalog::{build_entities, build_schema, load_catalog};
pub use condition::{Comparison, Condition, ConditionRule, check_all};
pub use config::{ConfigError, ConfigResult, DaemonConfig};
pub use entity::{
    Entity, EntityDefinition, EntityKind, LinkRule, SourcePolicy, SupplementProvider,
    default_link_rule,
};
pub use entity_manager::EntityManager;
pub use error::{CoreError, CoreResult};
pub use instance::{Instance, InstanceHash, InstancePtr, MemberInstance, instance_hash};
pub use manager::{BrokerManager, BrokerManagerConfig, TransportFactory};
pub use query::{BusQuery, Query};
pub use relation::{Relation, RelationRule};
