//! TOML description of a bus population
//!
//! ```toml
//! [[service]]
//! name = "xyz.openbmc_project.Hwmon"
//!
//! [[service.object]]
//! path = "/xyz/openbmc_project/sensors/temperature/cpu0"
//!
//! [service.object.interfaces."xyz.openbmc_project.Sensor.Value"]
//! Value = { kind = "float", value = 42.0 }
//! ```

use std::path::{Path, PathBuf};

use busmirror_types::InterfaceMap;
use serde::{Deserialize, Serialize};

use crate::local::LocalBus;

/// Error type for fixture loading
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("Fixture not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read fixture: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse fixture: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusFixture {
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceFixture {
    pub name: String,
    #[serde(default, rename = "object")]
    pub objects: Vec<ObjectFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectFixture {
    pub path: String,
    #[serde(default)]
    pub interfaces: InterfaceMap,
}

impl BusFixture {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FixtureError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FixtureError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, FixtureError> {
        Ok(toml::from_str(content)?)
    }

    /// Publish every service and object on `bus`
    pub fn apply(&self, bus: &LocalBus) {
        for service in &self.services {
            bus.own_name(&service.name);
            for object in &service.objects {
                bus.add_object(&service.name, &object.path, object.interfaces.clone());
            }
            tracing::debug!(
                service = %service.name,
                objects = service.objects.len(),
                "Fixture service published"
            );
        }
    }

    /// Build a fresh bus holding this fixture
    pub fn into_bus(self) -> LocalBus {
        let bus = LocalBus::new();
        self.apply(&bus);
        bus
    }
}
