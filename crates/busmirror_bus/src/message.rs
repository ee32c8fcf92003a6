//! Method calls, signals and match rules

use busmirror_types::{InterfaceMap, PropertyMap};
use serde::{Deserialize, Serialize};

/// Names of the bus daemon, mapper and standard interfaces
pub mod well_known {
    pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
    pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
    pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
    pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
    pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

    pub const MAPPER_SERVICE: &str = "xyz.openbmc_project.ObjectMapper";
    pub const MAPPER_PATH: &str = "/xyz/openbmc_project/object_mapper";
    pub const MAPPER_INTERFACE: &str = "xyz.openbmc_project.ObjectMapper";

    pub const LIST_NAMES: &str = "ListNames";
    pub const GET_NAME_OWNER: &str = "GetNameOwner";
    pub const GET_ALL: &str = "GetAll";
    pub const GET: &str = "Get";
    pub const GET_MANAGED_OBJECTS: &str = "GetManagedObjects";
    pub const GET_SUB_TREE: &str = "GetSubTree";
    pub const GET_OBJECT: &str = "GetObject";
}

/// Handle of one registered match rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Method Call
// ─────────────────────────────────────────────────────────────────────────────

/// Encoded method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    /// Arguments encoded as one JSON array
    pub body: serde_json::Value,
}

impl MethodCall {
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
            body: serde_json::Value::Array(Vec::new()),
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signals
// ─────────────────────────────────────────────────────────────────────────────

/// Signal kinds this crate subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    PropertiesChanged,
    InterfacesAdded,
    InterfacesRemoved,
    NameOwnerChanged,
}

/// Decoded signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    PropertiesChanged {
        sender: String,
        path: String,
        interface: String,
        changed: PropertyMap,
        invalidated: Vec<String>,
    },
    InterfacesAdded {
        sender: String,
        path: String,
        interfaces: InterfaceMap,
    },
    InterfacesRemoved {
        sender: String,
        path: String,
        interfaces: Vec<String>,
    },
    NameOwnerChanged {
        name: String,
        old_owner: String,
        new_owner: String,
    },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::PropertiesChanged { .. } => SignalKind::PropertiesChanged,
            Signal::InterfacesAdded { .. } => SignalKind::InterfacesAdded,
            Signal::InterfacesRemoved { .. } => SignalKind::InterfacesRemoved,
            Signal::NameOwnerChanged { .. } => SignalKind::NameOwnerChanged,
        }
    }

    /// Unique name of the emitting connection
    pub fn sender(&self) -> &str {
        match self {
            Signal::PropertiesChanged { sender, .. }
            | Signal::InterfacesAdded { sender, .. }
            | Signal::InterfacesRemoved { sender, .. } => sender,
            Signal::NameOwnerChanged { .. } => super::well_known::DBUS_SERVICE,
        }
    }

    /// Object path the signal is about
    pub fn path(&self) -> &str {
        match self {
            Signal::PropertiesChanged { path, .. }
            | Signal::InterfacesAdded { path, .. }
            | Signal::InterfacesRemoved { path, .. } => path,
            Signal::NameOwnerChanged { .. } => super::well_known::DBUS_PATH,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Match Rules
// ─────────────────────────────────────────────────────────────────────────────

/// Filter deciding which signals reach a watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub kind: SignalKind,
    /// Exact object path
    pub path: Option<String>,
    /// Changed interface (properties-changed only)
    pub interface: Option<String>,
    /// Exact sender
    pub sender: Option<String>,
}

impl MatchRule {
    fn of_kind(kind: SignalKind) -> Self {
        Self {
            kind,
            path: None,
            interface: None,
            sender: None,
        }
    }

    /// Property changes of one interface on one object
    pub fn properties_changed(path: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            interface: Some(interface.into()),
            ..Self::of_kind(SignalKind::PropertiesChanged)
        }
    }

    pub fn interfaces_added() -> Self {
        Self::of_kind(SignalKind::InterfacesAdded)
    }

    pub fn interfaces_removed() -> Self {
        Self::of_kind(SignalKind::InterfacesRemoved)
    }

    pub fn name_owner_changed() -> Self {
        Self::of_kind(SignalKind::NameOwnerChanged)
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Bus daemon match expression selecting the same signals
    pub fn to_rule_string(&self) -> String {
        let (interface, member) = match self.kind {
            SignalKind::PropertiesChanged => (well_known::PROPERTIES_INTERFACE, "PropertiesChanged"),
            SignalKind::InterfacesAdded => (well_known::OBJECT_MANAGER_INTERFACE, "InterfacesAdded"),
            SignalKind::InterfacesRemoved => (well_known::OBJECT_MANAGER_INTERFACE, "InterfacesRemoved"),
            SignalKind::NameOwnerChanged => (well_known::DBUS_INTERFACE, "NameOwnerChanged"),
        };
        let mut parts = vec![
            "type='signal'".to_string(),
            format!("interface='{}'", interface),
            format!("member='{}'", member),
        ];
        let sender = match (&self.sender, self.kind) {
            (Some(sender), _) => Some(sender.as_str()),
            (None, SignalKind::NameOwnerChanged) => Some(well_known::DBUS_SERVICE),
            (None, _) => None,
        };
        if let Some(sender) = sender {
            parts.push(format!("sender='{}'", quote(sender)));
        }
        if let Some(path) = &self.path {
            parts.push(format!("path='{}'", quote(path)));
        }
        if let Some(changed) = &self.interface {
            parts.push(format!("arg0='{}'", quote(changed)));
        }
        parts.join(",")
    }

    pub fn matches(&self, signal: &Signal) -> bool {
        if signal.kind() != self.kind {
            return false;
        }
        if let Some(path) = &self.path {
            if signal.path() != path {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if signal.sender() != sender {
                return false;
            }
        }
        if let (Some(expected), Signal::PropertiesChanged { interface, .. }) = (&self.interface, signal) {
            if interface != expected {
                return false;
            }
        }
        true
    }
}

fn quote(value: &str) -> String {
    value.replace('\'', "'\\''")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
