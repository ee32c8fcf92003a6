//! Directed edges between entities

use serde::{Deserialize, Serialize};

use crate::condition::{Comparison, Condition};
use crate::entity::Entity;
use crate::instance::InstanceHash;

/// `source_member` of the source row compared against `dest_member` of the
/// destination rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRule {
    pub source_member: String,
    pub dest_member: String,
    #[serde(default)]
    pub comparison: Comparison,
}

impl RelationRule {
    pub fn new(source_member: impl Into<String>, dest_member: impl Into<String>) -> Self {
        Self {
            source_member: source_member.into(),
            dest_member: dest_member.into(),
            comparison: Comparison::Equal,
        }
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = comparison;
        self
    }
}

/// Edge to the entity registered as `destination`
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    destination: String,
    rules: Vec<RelationRule>,
}

impl Relation {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: RelationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = RelationRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn rules(&self) -> &[RelationRule] {
        &self.rules
    }

    /// One single-rule condition per rule, built from the source row.
    ///
    /// Rules whose source member is not registered on `source`, or whose row
    /// is gone, are skipped.
    pub fn conditions(&self, source: &Entity, hash: InstanceHash) -> Vec<Condition> {
        let mut conditions = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if !source.has_member(&rule.source_member) {
                continue;
            }
            let Some(instance) = source.get_instance(hash) else {
                continue;
            };
            let literal = instance.field(&rule.source_member).into_value();
            tracing::trace!(
                source = %source.name(),
                destination = %self.destination,
                member = %rule.dest_member,
                literal = %literal,
                "Relation condition built"
            );
            conditions.push(Condition::new().with_rule(&rule.dest_member, literal, rule.comparison));
        }
        conditions
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
