//! Busmirror Types - Value model shared by the bus layer and the entity cache
//!
//! Holds the closed `Value` union for bus properties and cached fields, the
//! association triple, and object path helpers.

mod path;
mod value;

pub use path::*;
pub use value::*;

/// Object path on the bus (`/xyz/openbmc_project/sensors/temp0`)
pub type ObjectPath = String;

/// Well-known or unique bus name
pub type ServiceName = String;

/// Interface name (`org.freedesktop.DBus.Properties`)
pub type InterfaceName = String;
