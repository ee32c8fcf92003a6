//! Row filters
//!
//! A [`Condition`] is an AND of `(member, literal, comparison)` rules checked
//! against one instance. Values compare only when both sides hold the same
//! kind of value.

use busmirror_types::Value;
use serde::{Deserialize, Serialize};

use crate::instance::Instance;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[default]
    Equal,
    NonEqual,
}

impl Comparison {
    /// Compare two values; mismatched kinds never pass
    pub fn compare(self, left: &Value, right: &Value) -> bool {
        if !left.same_kind(right) {
            return false;
        }
        match self {
            Comparison::Equal => left == right,
            Comparison::NonEqual => left != right,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionRule {
    pub member: String,
    pub literal: Value,
    pub comparison: Comparison,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    rules: Vec<ConditionRule>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_equal(member: impl Into<String>, literal: impl Into<Value>) -> Self {
        Self::new().with_rule(member, literal, Comparison::Equal)
    }

    pub fn build_non_equal(member: impl Into<String>, literal: impl Into<Value>) -> Self {
        Self::new().with_rule(member, literal, Comparison::NonEqual)
    }

    pub fn with_rule(
        mut self,
        member: impl Into<String>,
        literal: impl Into<Value>,
        comparison: Comparison,
    ) -> Self {
        self.rules.push(ConditionRule {
            member: member.into(),
            literal: literal.into(),
            comparison,
        });
        self
    }

    pub fn rules(&self) -> &[ConditionRule] {
        &self.rules
    }

    /// Every rule holds for `instance`
    pub fn check(&self, instance: &Instance) -> bool {
        self.rules.iter().all(|rule| {
            let field = instance.field(&rule.member);
            rule.comparison.compare(field.value(), &rule.literal)
        })
    }
}

/// Every condition holds; an empty list matches everything
pub fn check_all(conditions: &[Condition], instance: &Instance) -> bool {
    conditions.iter().all(|condition| condition.check(instance))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FieldSchema;
    use std::sync::Arc;

    fn instance() -> Instance {
        let inst = Instance::new("svc", "/obj", Vec::<String>::new(), Arc::new(FieldSchema::new()));
        inst.supplement_or_update("Name", "eth0");
        inst.supplement_or_update("Speed", 1000i64);
        inst
    }

    #[test]
    fn test_equal_and_non_equal() {
        let inst = instance();
        assert!(Condition::build_equal("Name", "eth0").check(&inst));
        assert!(!Condition::build_equal("Name", "eth1").check(&inst));
        assert!(Condition::build_non_equal("Name", "eth1").check(&inst));
    }

    #[test]
    fn test_kind_mismatch_never_passes() {
        let inst = instance();
        assert!(!Condition::build_equal("Speed", "1000").check(&inst));
        assert!(!Condition::build_non_equal("Speed", "1000").check(&inst));
        // absent members read as not available
        assert!(!Condition::build_non_equal("Missing", "x").check(&inst));
    }

    #[test]
    fn test_rules_are_anded() {
        let inst = instance();
        let both = Condition::build_equal("Name", "eth0").with_rule("Speed", 1000i64, Comparison::Equal);
        assert!(both.check(&inst));
        let one_fails = Condition::build_equal("Name", "eth0").with_rule("Speed", 10i64, Comparison::Equal);
        assert!(!one_fails.check(&inst));
    }

    #[test]
    fn test_empty_list_matches() {
        assert!(check_all(&[], &instance()));
    }
}
