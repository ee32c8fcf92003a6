//! Subtree scan through the object mapper

use std::collections::BTreeMap;
use std::sync::Arc;

use busmirror_bus::{Connection, well_known};
use busmirror_types::{count_extra_segments, is_under_namespace};

use super::{BusQuery, FieldSchema, Query, interfaces_overlap};
use crate::error::CoreResult;
use crate::instance::InstancePtr;

/// Mapper reply: object path -> service -> interfaces
type SubTree = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// What a [`FindObjectQuery`] searches for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCriteria {
    /// Path namespace; objects must lie under it
    pub path: String,
    pub interfaces: Vec<String>,
    /// 0 is unbounded, 1 keeps direct children only
    pub depth: u32,
    pub service: Option<String>,
}

/// Every object under a namespace implementing one of the criteria interfaces
pub struct FindObjectQuery {
    connection: Connection,
    schema: Arc<FieldSchema>,
    criteria: ObjectCriteria,
}

impl FindObjectQuery {
    /// Search below `path` for the interfaces declared by `schema`
    pub fn new(connection: Connection, path: impl Into<String>, schema: Arc<FieldSchema>) -> Self {
        let criteria = ObjectCriteria {
            path: path.into(),
            interfaces: schema.interface_names(),
            depth: 0,
            service: None,
        };
        Self {
            connection,
            schema,
            criteria,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.criteria.depth = depth;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.criteria.service = Some(service.into());
        self
    }

    pub fn with_interfaces(mut self, interfaces: impl IntoIterator<Item = String>) -> Self {
        self.criteria.interfaces = interfaces.into_iter().collect();
        self
    }

    pub fn criteria(&self) -> &ObjectCriteria {
        &self.criteria
    }
}

impl Query for FindObjectQuery {
    fn process(&self) -> CoreResult<Vec<InstancePtr>> {
        self.process_with(&self.connection)
    }

    fn fields(&self) -> Vec<String> {
        self.schema.fields()
    }
}

impl BusQuery for FindObjectQuery {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    fn process_with(&self, connection: &Connection) -> CoreResult<Vec<InstancePtr>> {
        let depth = i32::try_from(self.criteria.depth).unwrap_or(i32::MAX);
        let tree: SubTree = connection
            .call(
                well_known::MAPPER_SERVICE,
                well_known::MAPPER_PATH,
                well_known::MAPPER_INTERFACE,
                well_known::GET_SUB_TREE,
                &(self.criteria.path.as_str(), depth, &self.criteria.interfaces),
            )
            .inspect_err(|e| {
                tracing::debug!(
                    path = %self.criteria.path,
                    depth = self.criteria.depth,
                    interfaces = self.criteria.interfaces.len(),
                    error = %e,
                    "Subtree scan failed"
                );
            })?;

        let mut instances = Vec::new();
        for (path, services) in &tree {
            for (service, interfaces) in services {
                if self
                    .criteria
                    .service
                    .as_ref()
                    .is_some_and(|fixed| fixed != service)
                {
                    continue;
                }
                instances.push(self.create_instance(connection, service, path, interfaces));
            }
        }

        tracing::debug!(
            path = %self.criteria.path,
            depth = self.criteria.depth,
            count = instances.len(),
            "Subtree scan complete"
        );
        Ok(instances)
    }

    fn check_path(&self, path: &str, service: Option<&str>) -> bool {
        if let (Some(offered), Some(fixed)) = (service, &self.criteria.service) {
            if offered != fixed.as_str() {
                return false;
            }
        }
        is_under_namespace(&self.criteria.path, path)
    }

    fn check_criteria(&self, path: &str, interfaces: &[String], service: Option<&str>) -> bool {
        if !self.check_path(path, service) {
            return false;
        }
        if self.criteria.depth > 0
            && count_extra_segments(&self.criteria.path, path) > self.criteria.depth as usize
        {
            return false;
        }
        interfaces_overlap(&self.criteria.interfaces, interfaces)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
