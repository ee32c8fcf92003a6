//! Error types for the entity cache

use busmirror_bus::BusError;
use busmirror_types::ValueConversionError;

use crate::config::ConfigError;

/// Errors raised by queries, instances, entities and the scheduler
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Member already exists: {0}")]
    MemberExists(String),

    #[error("Unsupported value for member {member}: {kind}")]
    UnsupportedValue { member: String, kind: &'static str },

    #[error("Invalid type for property {0}")]
    InvalidType(String),

    #[error("Entity already registered: {0}")]
    DuplicateEntity(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Relation not found: {source_entity} -> {destination}")]
    RelationNotFound {
        source_entity: String,
        destination: String,
    },

    #[error("Unknown status value: {0}")]
    UnknownStatus(String),

    #[error("Value conversion failed: {0}")]
    Conversion(#[from] ValueConversionError),

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Whether the error came from the bus rather than from the cache itself
    pub fn is_bus(&self) -> bool {
        matches!(self, CoreError::Bus(_))
    }
}

/// Result type for cache operations
pub type CoreResult<T> = Result<T, CoreError>;
