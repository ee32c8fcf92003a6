//! Entities, queries and brokers built from the configuration catalog

use std::sync::Arc;

use busmirror_bus::Connection;

use crate::broker::Broker;
use crate::config::{ConfigError, DaemonConfig, EntityConfig, FieldConfig, QuerySource};
use crate::entity::Entity;
use crate::entity_manager::EntityManager;
use crate::error::{CoreError, CoreResult};
use crate::manager::BrokerManager;
use crate::query::{
    BusQuery, FieldMapping, FieldSchema, FindObjectQuery, GetObjectQuery, IntrospectServiceQuery,
    formatter_by_name,
};
use crate::relation::Relation;

/// Mapping table of a `[[entity.query.fields]]` list
pub fn build_schema(fields: &[FieldConfig]) -> Result<FieldSchema, ConfigError> {
    let mut schema = FieldSchema::new();
    for field in fields {
        let mut mapping = FieldMapping::new(&field.property, field.member_name());
        for name in &field.formatters {
            let formatter = formatter_by_name(name).ok_or_else(|| ConfigError::UnknownFormatter {
                member: field.member_name().to_string(),
                formatter: name.clone(),
            })?;
            mapping = mapping.with_shared_formatter(formatter);
        }
        schema = schema.with_field(&field.interface, mapping);
    }
    Ok(schema)
}

/// Register every configured entity and relation.
///
/// Scheduled entities get a broker on `manager`; the others carry their
/// query and refresh on demand.
pub fn load_catalog(
    config: &DaemonConfig,
    entities: &EntityManager,
    manager: &BrokerManager,
) -> CoreResult<()> {
    for entry in &config.entities {
        let connection = manager.connect()?;
        let schema = Arc::new(build_schema(&entry.query.fields)?);
        match &entry.query.source {
            QuerySource::FindObject {
                path,
                depth,
                service,
                interfaces,
            } => {
                let mut query = FindObjectQuery::new(connection, path, schema).with_depth(*depth);
                if let Some(service) = service {
                    query = query.with_service(service);
                }
                if !interfaces.is_empty() {
                    query = query.with_interfaces(interfaces.iter().cloned());
                }
                register(entry, query, entities, manager)?;
            }
            QuerySource::GetObject { service, path } => {
                register(entry, GetObjectQuery::new(connection, service, path, schema), entities, manager)?;
            }
            QuerySource::IntrospectService { service } => {
                register(entry, IntrospectServiceQuery::new(connection, service, schema), entities, manager)?;
            }
        }
    }

    for entry in &config.relations {
        let source = entities
            .get(&entry.source)
            .ok_or_else(|| CoreError::EntityNotFound(entry.source.clone()))?;
        if entities.get(&entry.destination).is_none() {
            tracing::warn!(source = %entry.source, destination = %entry.destination, "Relation to unknown entity");
        }
        source.add_relation(Relation::new(&entry.destination).with_rules(entry.rules.iter().cloned()));
    }

    entities.configure();
    tracing::info!(
        entities = config.entities.len(),
        relations = config.relations.len(),
        brokers = manager.brokers().len(),
        "Catalog loaded"
    );
    Ok(())
}

fn register<Q>(
    entry: &EntityConfig,
    query: Q,
    entities: &EntityManager,
    manager: &BrokerManager,
) -> CoreResult<()>
where
    Q: BusQuery + 'static,
{
    let entity = Entity::new(&entry.name, entry.kind).with_policy(entry.source_policy()?);
    let query = Arc::new(query);
    if entry.scheduled {
        let entity = entities.add_entity(entity)?;
        let broker = Broker::new(query, entity)
            .with_interval(entry.refresh_interval())
            .with_watch(entry.watch);
        manager.add_broker(broker);
        tracing::debug!(entity = %entry.name, "Entity scheduled");
    } else {
        entities.add_entity(entity.with_query(query))?;
        tracing::debug!(entity = %entry.name, "Entity refreshed on demand");
    }
    Ok(())
}

/// Entity manager over `connection` filled from `config`
pub fn build_entities(
    config: &DaemonConfig,
    connection: Connection,
    manager: &BrokerManager,
) -> CoreResult<EntityManager> {
    let entities = EntityManager::new(connection);
    load_catalog(config, &entities, manager)?;
    Ok(entities)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::instance_hash;
    use crate::manager::{BrokerManagerConfig, TransportFactory};
    use busmirror_bus::{BusResult, ConnectionConfig, LocalBus, Transport};
    use busmirror_types::{InterfaceMap, PropertyMap, Value};

    const SENSOR: &str = "xyz.openbmc_project.Sensor.Value";
    const BMC: &str = "xyz.openbmc_project.State.BMC";

    const CATALOG: &str = r#"
[[entity]]
name = "Sensor"

[entity.query]
type = "find_object"
path = "/xyz/openbmc_project/sensors"

[[entity.query.fields]]
interface = "xyz.openbmc_project.Sensor.Value"
property = "Value"
member = "Reading"

[[entity.query.fields]]
interface = "xyz.openbmc_project.Sensor.Value"
property = "Unit"
formatters = ["enum_suffix"]

[[entity]]
name = "Bmc"
kind = "object"
policy = "lazy"
scheduled = false

[entity.query]
type = "get_object"
service = "xyz.openbmc_project.State.BMC"
path = "/xyz/openbmc_project/state/bmc0"

[[entity.query.fields]]
interface = "xyz.openbmc_project.State.BMC"
property = "CurrentBMCState"
member = "State"
formatters = ["enum_suffix"]

[[relation]]
source = "Bmc"
destination = "Sensor"
rules = [{ source_member = "State", dest_member = "Unit", comparison = "non_equal" }]
"#;

    fn bus() -> LocalBus {
        let bus = LocalBus::new();
        let mut sensor = PropertyMap::new();
        sensor.insert("Value".to_string(), Value::Float(40.0));
        sensor.insert(
            "Unit".to_string(),
            Value::from("xyz.openbmc_project.Sensor.Value.Unit.DegreesC"),
        );
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(SENSOR.to_string(), sensor);
        bus.add_object("xyz.openbmc_project.Hwmon", "/xyz/openbmc_project/sensors/cpu0", interfaces);

        let mut state = PropertyMap::new();
        state.insert(
            "CurrentBMCState".to_string(),
            Value::from("xyz.openbmc_project.State.BMC.BMCState.Ready"),
        );
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(BMC.to_string(), state);
        bus.add_object(BMC, "/xyz/openbmc_project/state/bmc0", interfaces);
        bus
    }

    fn manager(bus: &LocalBus) -> BrokerManager {
        let bus = bus.clone();
        let factory: TransportFactory =
            Arc::new(move || -> BusResult<Arc<dyn Transport>> { Ok(bus.connect()) });
        BrokerManager::new(BrokerManagerConfig::default(), factory)
    }

    #[test]
    fn test_unknown_formatter() {
        let fields = vec![FieldConfig {
            interface: SENSOR.to_string(),
            property: "Value".to_string(),
            member: None,
            formatters: vec!["rot13".to_string()],
        }];
        assert!(matches!(
            build_schema(&fields),
            Err(ConfigError::UnknownFormatter { formatter, .. }) if formatter == "rot13"
        ));
    }

    #[test]
    fn test_build_schema_groups_interfaces() {
        let config = DaemonConfig::parse(CATALOG).unwrap();
        let schema = build_schema(&config.entities[0].query.fields).unwrap();
        assert_eq!(schema.interface_names(), vec![SENSOR.to_string()]);
        assert_eq!(schema.mappings(SENSOR).len(), 2);
    }

    #[test]
    fn test_catalog_wires_entities() {
        let bus = bus();
        let manager = manager(&bus);
        let config = DaemonConfig::parse(CATALOG).unwrap();
        let connection = Connection::new(bus.connect(), ConnectionConfig::default());
        let entities = build_entities(&config, connection, &manager).unwrap();

        assert_eq!(entities.names(), vec!["Bmc".to_string(), "Sensor".to_string()]);
        assert_eq!(manager.brokers().len(), 1);
        assert!(entities.get("Sensor").unwrap().has_member("Reading"));

        // on-demand entity populates through its own query
        let bmc = entities.entity("Bmc").unwrap();
        let rows = bmc.get_instances(&[]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field("State").string_value().unwrap(), "Ready");

        let hash = instance_hash(BMC, "/xyz/openbmc_project/state/bmc0");
        let sensor = entities.get("Sensor").unwrap();
        let broker = Arc::clone(&manager.brokers()[0]);
        let ctx = crate::broker::BrokerContext {
            query: manager.connect().unwrap(),
            watch: manager.connect().unwrap(),
            objects: manager.connect().unwrap(),
            deferred: Arc::new(crate::broker::DeferredTasks::new(std::time::Duration::ZERO)),
        };
        assert!(broker.try_process(&ctx));
        assert_eq!(sensor.len(), 1);

        let related = entities.related_instances("Bmc", "Sensor", hash, &[]).unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].field("Unit").string_value().unwrap(), "DegreesC");
    }

    #[test]
    fn test_relation_from_unknown_entity() {
        let bus = bus();
        let manager = manager(&bus);
        let config = DaemonConfig::parse(
            r#"
[[relation]]
source = "Ghost"
destination = "Sensor"
"#,
        )
        .unwrap();
        let connection = Connection::new(bus.connect(), ConnectionConfig::default());
        assert!(matches!(
            build_entities(&config, connection, &manager),
            Err(CoreError::EntityNotFound(name)) if name == "Ghost"
        ));
    }
}
