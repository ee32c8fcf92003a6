//! Reserved member names and shared field vocabulary

use crate::error::{CoreError, CoreResult};

/// Members starting with this prefix carry bookkeeping, not data
pub const META_FIELD_PREFIX: &str = "__meta_";

/// Object path of a bus-origin instance
pub const META_OBJECT_PATH: &str = "__meta_field__object_path";

/// Well-known service name of a bus-origin instance
pub const META_OBJECT_SERVICE: &str = "__meta_field__object_service";

pub fn is_meta_field(member: &str) -> bool {
    member.starts_with(META_FIELD_PREFIX)
}

/// Fields of association rows
pub mod relations {
    pub const FIELD_ASSOCIATIONS: &str = "Associations";
    pub const FIELD_SOURCE: &str = "Source";
    pub const FIELD_DESTINATION: &str = "Destination";
    pub const FIELD_ENDPOINT: &str = "Endpoint";
}

/// Health rollup values
pub mod status {
    pub const FIELD_STATUS: &str = "Status";
    pub const OK: &str = "OK";
    pub const WARNING: &str = "Warning";
    pub const CRITICAL: &str = "Critical";
}

fn status_rank(status: &str) -> Option<(u8, &'static str)> {
    match status.to_lowercase().as_str() {
        "ok" => Some((0, status::OK)),
        "warning" => Some((1, status::WARNING)),
        "critical" => Some((2, status::CRITICAL)),
        _ => None,
    }
}

/// The more severe of two status values (case-insensitive, ties keep `left`)
pub fn higher_status(left: &str, right: &str) -> CoreResult<&'static str> {
    let (left_rank, left_name) =
        status_rank(left).ok_or_else(|| CoreError::UnknownStatus(left.to_string()))?;
    let (right_rank, right_name) =
        status_rank(right).ok_or_else(|| CoreError::UnknownStatus(right.to_string()))?;
    Ok(if left_rank >= right_rank { left_name } else { right_name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_status() {
        assert_eq!(higher_status("ok", "Warning").unwrap(), status::WARNING);
        assert_eq!(higher_status("CRITICAL", "warning").unwrap(), status::CRITICAL);
        assert_eq!(higher_status("OK", "ok").unwrap(), status::OK);
        assert!(matches!(
            higher_status("ok", "degraded"),
            Err(CoreError::UnknownStatus(s)) if s == "degraded"
        ));
    }

    #[test]
    fn test_meta_fields() {
        assert!(is_meta_field(META_OBJECT_PATH));
        assert!(is_meta_field(META_OBJECT_SERVICE));
        assert!(!is_meta_field("Reading"));
    }
}
