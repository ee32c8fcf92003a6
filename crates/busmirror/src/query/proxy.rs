//! Query reading another entity's rows

use std::sync::Arc;

use super::Query;
use crate::entity::Entity;
use crate::error::CoreResult;
use crate::instance::InstancePtr;

/// Rows of a provider entity, populated on demand
pub struct ProxyQuery {
    provider: Arc<Entity>,
}

impl ProxyQuery {
    pub fn new(provider: Arc<Entity>) -> Self {
        provider.initialize();
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<Entity> {
        &self.provider
    }
}

impl Query for ProxyQuery {
    fn process(&self) -> CoreResult<Vec<InstancePtr>> {
        self.provider.populate()?;
        Ok(self.provider.get_instances(&[]))
    }

    fn fields(&self) -> Vec<String> {
        self.provider.member_names()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
