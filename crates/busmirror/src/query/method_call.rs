//! Arbitrary method call as a query
//!
//! The typed argument encoding and reply decoding are captured in a closure at
//! construction, so the query itself stays object safe.

use std::sync::Arc;

use busmirror_bus::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{BusQuery, FieldSchema, Query};
use crate::error::CoreResult;
use crate::instance::{Instance, InstancePtr};

/// Where the call goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTarget {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
}

impl MethodTarget {
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
            method: method.into(),
        }
    }
}

/// Handed to the populate closure together with the decoded reply
pub struct MethodCallContext<'a> {
    pub connection: &'a Connection,
    pub schema: &'a Arc<FieldSchema>,
    pub target: &'a MethodTarget,
}

impl MethodCallContext<'_> {
    /// Empty instance bound to the query's schema
    pub fn new_instance(&self, service: &str, path: &str) -> Instance {
        Instance::new(service, path, self.schema.interface_names(), Arc::clone(self.schema))
    }
}

type Invoke = dyn Fn(&MethodCallContext<'_>) -> CoreResult<Vec<InstancePtr>> + Send + Sync;

/// Query running one method and turning its reply into instances
pub struct MethodCallQuery {
    connection: Connection,
    schema: Arc<FieldSchema>,
    target: MethodTarget,
    invoke: Box<Invoke>,
}

impl MethodCallQuery {
    pub fn new<A, R, F>(
        connection: Connection,
        target: MethodTarget,
        schema: Arc<FieldSchema>,
        args: A,
        populate: F,
    ) -> Self
    where
        A: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + 'static,
        F: Fn(&MethodCallContext<'_>, R) -> CoreResult<Vec<InstancePtr>> + Send + Sync + 'static,
    {
        let invoke = move |ctx: &MethodCallContext<'_>| -> CoreResult<Vec<InstancePtr>> {
            let reply: R = ctx.connection.call(
                &ctx.target.service,
                &ctx.target.path,
                &ctx.target.interface,
                &ctx.target.method,
                &args,
            )?;
            populate(ctx, reply)
        };
        Self {
            connection,
            schema,
            target,
            invoke: Box::new(invoke),
        }
    }

    pub fn target(&self) -> &MethodTarget {
        &self.target
    }
}

impl Query for MethodCallQuery {
    fn process(&self) -> CoreResult<Vec<InstancePtr>> {
        self.process_with(&self.connection)
    }

    fn fields(&self) -> Vec<String> {
        self.schema.fields()
    }
}

impl BusQuery for MethodCallQuery {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    fn process_with(&self, connection: &Connection) -> CoreResult<Vec<InstancePtr>> {
        let ctx = MethodCallContext {
            connection,
            schema: &self.schema,
            target: &self.target,
        };
        let instances = (self.invoke)(&ctx)?;
        tracing::debug!(
            service = %self.target.service,
            method = %self.target.method,
            count = instances.len(),
            "Method call query complete"
        );
        Ok(instances)
    }

    /// Never signal driven
    fn check_path(&self, _path: &str, _service: Option<&str>) -> bool {
        false
    }

    fn check_criteria(&self, _path: &str, _interfaces: &[String], _service: Option<&str>) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FieldMapping;
    use busmirror_bus::{BusError, ConnectionConfig, LocalBus};
    use std::collections::BTreeMap;

    const NET: &str = "xyz.openbmc_project.Network";
    const IFACE: &str = "xyz.openbmc_project.Network.SystemConfiguration";

    fn query(bus: &LocalBus) -> MethodCallQuery {
        let conn = Connection::new(bus.connect(), ConnectionConfig::default());
        let schema = FieldSchema::new()
            .with_interface("Hosts", [FieldMapping::same("Address")])
            .into_shared();
        MethodCallQuery::new(
            conn,
            MethodTarget::new(NET, "/xyz/openbmc_project/network", IFACE, "ListHosts"),
            schema,
            ("eth0",),
            |ctx: &MethodCallContext<'_>, reply: BTreeMap<String, String>| {
                let mut instances = Vec::new();
                for (name, address) in reply {
                    let instance = ctx.new_instance(&ctx.target.service, &format!("{}/{}", ctx.target.path, name));
                    instance.supplement_or_update("Name", name);
                    instance.supplement_or_update("Address", address);
                    instances.push(Arc::new(instance));
                }
                Ok(instances)
            },
        )
    }

    #[test]
    fn test_reply_is_populated() {
        let bus = LocalBus::new();
        bus.register_method(NET, IFACE, "ListHosts", |_, args| {
            assert_eq!(args, &serde_json::json!(["eth0"]));
            Ok(serde_json::json!({ "bmc": "10.0.0.2", "host": "10.0.0.3" }))
        });

        let query = query(&bus);
        let instances = query.process().unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].field("Name").string_value().unwrap(), "bmc");
        assert_eq!(instances[1].field("Address").string_value().unwrap(), "10.0.0.3");
    }

    #[test]
    fn test_criteria_always_deny() {
        let bus = LocalBus::new();
        let query = query(&bus);
        assert!(!query.check_path("/xyz/openbmc_project/network", Some(NET)));
        assert!(!query.check_criteria("/xyz/openbmc_project/network", &[IFACE.to_string()], Some(NET)));
    }

    #[test]
    fn test_call_error_propagates() {
        let bus = LocalBus::new();
        bus.fail_method(NET, IFACE, "ListHosts", BusError::ServiceUnknown(NET.to_string()));
        assert!(query(&bus).process().unwrap_err().is_bus());
    }
}
