//! Unique name to well-known name cache

use std::collections::HashMap;

use busmirror_types::is_unique_name;
use parking_lot::RwLock;

/// Maps unique connection names (`:1.42`) to the well-known names they own.
///
/// Shared between connections through an `Arc`, so a single name-owner watcher
/// keeps every connection's lookups current.
#[derive(Debug, Default)]
pub struct ServiceNames {
    names: RwLock<HashMap<String, String>>,
}

impl ServiceNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unique: &str) -> Option<String> {
        self.names.read().get(unique).cloned()
    }

    pub fn insert(&self, unique: impl Into<String>, well_known: impl Into<String>) {
        self.names.write().insert(unique.into(), well_known.into());
    }

    /// Replace the whole cache with a fresh listing
    pub fn replace_all(&self, names: HashMap<String, String>) {
        *self.names.write() = names;
    }

    /// Apply one name-owner-changed notification.
    ///
    /// Unique names are ignored. The new owner maps to the name when present,
    /// otherwise the old owner keeps pointing at it.
    pub fn apply_owner_change(&self, name: &str, old_owner: &str, new_owner: &str) {
        if is_unique_name(name) {
            return;
        }
        let owner = if new_owner.is_empty() { old_owner } else { new_owner };
        if owner.is_empty() {
            return;
        }
        tracing::debug!(name = %name, owner = %owner, "Service owner changed");
        self.insert(owner, name);
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}
