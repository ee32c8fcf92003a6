//! Bus error types

/// Errors raised by the bus layer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("Call {interface}.{method} on {service} {path} failed: {message}")]
    CallFailed {
        service: String,
        path: String,
        interface: String,
        method: String,
        message: String,
    },

    #[error("Unknown method {interface}.{method}")]
    UnknownMethod { interface: String, method: String },

    #[error("Unknown object {path} on {service}")]
    UnknownObject { service: String, path: String },

    #[error("Unknown interface {interface} on {path}")]
    UnknownInterface { path: String, interface: String },

    #[error("Service not available: {0}")]
    ServiceUnknown(String),

    #[error("Failed to encode call arguments: {0}")]
    Encode(String),

    #[error("Failed to decode reply: {0}")]
    Decode(String),

    #[error("Bus I/O failure: {0}")]
    Io(String),

    #[error("Malformed bus message: {0}")]
    BadMessage(String),

    #[error("Well-known name not resolved for {0}")]
    NameNotResolved(String),

    #[error("Connection closed")]
    Disconnected,
}

impl BusError {
    /// Errors after which the connection cannot be trusted any more
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Io(_) | BusError::BadMessage(_))
    }

    /// Build a call failure for the given call site
    pub fn call_failed(
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        message: impl Into<String>,
    ) -> Self {
        BusError::CallFailed {
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BusError::Io("reset".into()).is_fatal());
        assert!(BusError::BadMessage("truncated".into()).is_fatal());
        assert!(!BusError::Disconnected.is_fatal());
        assert!(!BusError::NameNotResolved(":1.9".into()).is_fatal());
    }
}
