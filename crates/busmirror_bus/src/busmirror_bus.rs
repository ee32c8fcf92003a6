//! Busmirror Bus - Connection layer over a D-Bus style object bus
//!
//! The [`Transport`] trait is the seam to a concrete bus. [`Connection`] wraps
//! one transport with a priority spin-guard, signal dispatch, a pump thread
//! and a unique-to-well-known name cache. [`LocalBus`] is an in-process bus
//! implementing the calls and signals the entity cache relies on; with the
//! `system-bus` feature, `SystemBusTransport` drives the host's system bus.

mod connection;
mod error;
mod fixture;
mod guard;
mod local;
mod message;
mod names;
#[cfg(feature = "system-bus")]
mod system;
mod transport;

pub use connection::{
    Connection, ConnectionConfig, SignalHandler, WeakConnection, Watcher, exit_on_fatal,
};
pub use error::{BusError, BusResult};
pub use fixture::{BusFixture, FixtureError, ObjectFixture, ServiceFixture};
pub use guard::{GuardScope, PriorityGuard, current_thread_token, priority};
pub use local::{LocalBus, LocalTransport, MethodHandler};
pub use message::{MatchRule, MethodCall, Signal, SignalKind, SubscriptionId, well_known};
pub use names::ServiceNames;
#[cfg(feature = "system-bus")]
pub use system::SystemBusTransport;
pub use transport::Transport;
