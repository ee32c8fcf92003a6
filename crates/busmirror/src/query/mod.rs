//! Query hierarchy
//!
//! A query turns one bus round trip into a list of instances. Bus queries also
//! decide whether an object announced by an add/remove signal belongs to them,
//! using the same criteria they scan with.

mod find_object;
mod formatters;
mod get_object;
mod introspect;
mod method_call;
mod proxy;
mod schema;

pub use find_object::{FindObjectQuery, ObjectCriteria};
pub use formatters::{
    EnumDict, EnumSuffix, LastSegmentName, MillisToSeconds, StringDict, formatter_by_name,
};
pub use get_object::GetObjectQuery;
pub use introspect::IntrospectServiceQuery;
pub use method_call::{MethodCallContext, MethodCallQuery, MethodTarget};
pub use proxy::ProxyQuery;
pub use schema::{DefaultValueFn, FieldMapping, FieldSchema, Formatter, StaticFieldsHook, Validator};

use std::sync::Arc;

use busmirror_bus::Connection;

use crate::error::CoreResult;
use crate::instance::{Instance, InstancePtr};

/// Anything that can produce instances for an entity
pub trait Query: Send + Sync {
    /// Run the query once
    fn process(&self) -> CoreResult<Vec<InstancePtr>>;

    /// Members the produced instances carry
    fn fields(&self) -> Vec<String>;
}

/// Query backed by the object bus
pub trait BusQuery: Query {
    /// Connection used by [`Query::process`]
    fn connection(&self) -> &Connection;

    fn schema(&self) -> &Arc<FieldSchema>;

    /// Run the query over a specific connection
    fn process_with(&self, connection: &Connection) -> CoreResult<Vec<InstancePtr>>;

    /// Path and service part of the criteria
    fn check_path(&self, path: &str, service: Option<&str>) -> bool;

    /// Full criteria, used for scans and for add/remove signal filtering
    fn check_criteria(&self, path: &str, interfaces: &[String], service: Option<&str>) -> bool;

    /// Build and initialize an instance over the declared subset of
    /// `interfaces`
    fn create_instance(
        &self,
        connection: &Connection,
        service: &str,
        path: &str,
        interfaces: &[String],
    ) -> InstancePtr {
        let schema = self.schema();
        let declared: Vec<String> = interfaces
            .iter()
            .filter(|interface| {
                let declared = schema.declares(interface);
                if !declared {
                    tracing::trace!(interface = %interface, "Interface not declared by query");
                }
                declared
            })
            .cloned()
            .collect();
        let instance = Instance::new(service, path, declared, Arc::clone(schema));
        instance.initialize(connection);
        Arc::new(instance)
    }

    /// Run the derived-fields hook on `instance`
    fn supplement_by_static_fields(&self, instance: &Instance) {
        self.schema().run_static_fields(instance);
    }
}

/// Any-overlap policy: at least one configured interface appears in
/// `offered`. An empty configured set never matches.
pub fn interfaces_overlap(configured: &[String], offered: &[String]) -> bool {
    configured
        .iter()
        .any(|interface| offered.iter().any(|candidate| candidate == interface))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_any_overlap_policy() {
        let configured = list(&["a.Iface", "b.Iface"]);
        assert!(interfaces_overlap(&configured, &list(&["b.Iface"])));
        assert!(interfaces_overlap(&configured, &list(&["x.Iface", "a.Iface"])));
        assert!(!interfaces_overlap(&configured, &list(&["x.Iface"])));
        assert!(!interfaces_overlap(&configured, &[]));
    }

    #[test]
    fn test_empty_configured_set_denies() {
        assert!(!interfaces_overlap(&[], &list(&["a.Iface"])));
    }
}
