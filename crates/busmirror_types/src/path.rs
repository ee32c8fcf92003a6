//! Object path and bus name helpers

/// Count the path segments below `namespace`.
///
/// Returns 0 when the namespace is not shorter than the path.
pub fn count_extra_segments(namespace: &str, path: &str) -> usize {
    if namespace.len() >= path.len() {
        return 0;
    }
    match path.get(namespace.len()..) {
        Some(tail) => tail.matches('/').count(),
        None => 0,
    }
}

/// Last segment of an object path.
///
/// With `humanize` set, underscores become spaces (`cpu_temp` -> `cpu temp`).
pub fn last_segment_name(path: &str, humanize: bool) -> String {
    let segment = path.rsplit('/').next().unwrap_or(path);
    if humanize {
        segment.replace('_', " ")
    } else {
        segment.to_string()
    }
}

/// Unique connection names (`:1.42`) are assigned by the bus, not requested
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

/// Whether `path` equals `namespace` or lies below it
pub fn is_under_namespace(namespace: &str, path: &str) -> bool {
    path.starts_with(namespace)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_segments() {
        assert_eq!(count_extra_segments("/x/y", "/x/y/a"), 1);
        assert_eq!(count_extra_segments("/x/y", "/x/y/a/b"), 2);
        assert_eq!(count_extra_segments("/x/y", "/x/y"), 0);
        assert_eq!(count_extra_segments("/x/y/z", "/x"), 0);
    }

    #[test]
    fn test_last_segment_name() {
        assert_eq!(last_segment_name("/xyz/sensors/cpu_temp", true), "cpu temp");
        assert_eq!(last_segment_name("/xyz/sensors/cpu_temp", false), "cpu_temp");
        assert_eq!(last_segment_name("plain", false), "plain");
    }

    #[test]
    fn test_unique_names() {
        assert!(is_unique_name(":1.42"));
        assert!(!is_unique_name("org.example.Service"));
    }
}
