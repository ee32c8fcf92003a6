//! Single object fetch

use std::sync::Arc;

use busmirror_bus::Connection;

use super::{BusQuery, FieldSchema, Query, interfaces_overlap};
use crate::error::CoreResult;
use crate::instance::InstancePtr;

/// One known object of one known service
pub struct GetObjectQuery {
    connection: Connection,
    schema: Arc<FieldSchema>,
    service: String,
    path: String,
}

impl GetObjectQuery {
    pub fn new(
        connection: Connection,
        service: impl Into<String>,
        path: impl Into<String>,
        schema: Arc<FieldSchema>,
    ) -> Self {
        Self {
            connection,
            schema,
            service: service.into(),
            path: path.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Query for GetObjectQuery {
    fn process(&self) -> CoreResult<Vec<InstancePtr>> {
        self.process_with(&self.connection)
    }

    fn fields(&self) -> Vec<String> {
        self.schema.fields()
    }
}

impl BusQuery for GetObjectQuery {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    fn process_with(&self, connection: &Connection) -> CoreResult<Vec<InstancePtr>> {
        let interfaces = self.schema.interface_names();
        let instance = self.create_instance(connection, &self.service, &self.path, &interfaces);
        tracing::debug!(
            service = %self.service,
            path = %self.path,
            initialized = instance.is_initialized(),
            "Object fetched"
        );
        Ok(vec![instance])
    }

    fn check_path(&self, path: &str, service: Option<&str>) -> bool {
        service == Some(self.service.as_str()) && path == self.path
    }

    fn check_criteria(&self, path: &str, interfaces: &[String], service: Option<&str>) -> bool {
        self.check_path(path, service)
            && interfaces_overlap(&self.schema.interface_names(), interfaces)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
