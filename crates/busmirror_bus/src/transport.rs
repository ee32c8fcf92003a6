//! Transport seam between the connection wrapper and a concrete bus

use std::time::Duration;

use crate::error::BusResult;
use crate::message::{MatchRule, MethodCall, Signal, SubscriptionId};

/// One bus handle.
///
/// Implementations are not required to tolerate concurrent use of `call`,
/// `send`, `add_match` and `drain`; [`crate::Connection`] serializes them
/// behind its priority guard. `wait` may run alongside the other operations.
pub trait Transport: Send + Sync {
    /// Unique name assigned to this handle by the bus
    fn unique_name(&self) -> String;

    /// Synchronous method call returning the encoded reply
    fn call(&self, call: &MethodCall) -> BusResult<serde_json::Value>;

    /// Method call without waiting for a reply
    fn send(&self, call: &MethodCall) -> BusResult<()>;

    /// Register a match rule
    fn add_match(&self, rule: &MatchRule) -> BusResult<SubscriptionId>;

    /// Drop a match rule; unknown ids are ignored
    fn remove_match(&self, id: SubscriptionId);

    /// Block up to `timeout` for incoming traffic, `true` when something is queued
    fn wait(&self, timeout: Duration) -> BusResult<bool>;

    /// Take every queued signal together with the rule it matched
    fn drain(&self) -> BusResult<Vec<(SubscriptionId, Signal)>>;
}
