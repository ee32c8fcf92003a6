//! Whole-service introspection through the object manager

use std::collections::BTreeMap;
use std::sync::Arc;

use busmirror_bus::{Connection, well_known};
use busmirror_types::InterfaceMap;

use super::{BusQuery, FieldSchema, Query, interfaces_overlap};
use crate::error::CoreResult;
use crate::instance::{Instance, InstancePtr};

/// Every object a service manages, filled straight from one reply
pub struct IntrospectServiceQuery {
    connection: Connection,
    schema: Arc<FieldSchema>,
    service: String,
}

impl IntrospectServiceQuery {
    pub fn new(connection: Connection, service: impl Into<String>, schema: Arc<FieldSchema>) -> Self {
        Self {
            connection,
            schema,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Query for IntrospectServiceQuery {
    fn process(&self) -> CoreResult<Vec<InstancePtr>> {
        self.process_with(&self.connection)
    }

    fn fields(&self) -> Vec<String> {
        self.schema.fields()
    }
}

impl BusQuery for IntrospectServiceQuery {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    fn process_with(&self, connection: &Connection) -> CoreResult<Vec<InstancePtr>> {
        let objects: BTreeMap<String, InterfaceMap> = connection
            .call(
                &self.service,
                "/",
                well_known::OBJECT_MANAGER_INTERFACE,
                well_known::GET_MANAGED_OBJECTS,
                &(),
            )
            .inspect_err(|e| {
                tracing::debug!(service = %self.service, error = %e, "Service introspection failed");
            })?;

        let mut instances = Vec::with_capacity(objects.len());
        for (path, interfaces) in objects {
            let instance = Instance::new(
                self.service.as_str(),
                path.as_str(),
                interfaces.keys().cloned(),
                Arc::clone(&self.schema),
            );
            let mut complete = true;
            for (interface, properties) in &interfaces {
                if let Err(e) = instance.fill_members(interface, properties) {
                    tracing::warn!(path = %path, interface = %interface, error = %e, "Failed to resolve properties");
                    complete = false;
                }
            }
            self.supplement_by_static_fields(&instance);
            if complete {
                instance.mark_initialized();
            }
            instances.push(Arc::new(instance));
        }

        tracing::debug!(service = %self.service, count = instances.len(), "Service introspection complete");
        Ok(instances)
    }

    fn check_path(&self, _path: &str, service: Option<&str>) -> bool {
        service == Some(self.service.as_str())
    }

    fn check_criteria(&self, path: &str, interfaces: &[String], service: Option<&str>) -> bool {
        self.check_path(path, service)
            && interfaces_overlap(&self.schema.interface_names(), interfaces)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
