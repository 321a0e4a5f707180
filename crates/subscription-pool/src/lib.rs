//! Routing and live-state core for the Anthropic load balancer
//!
//! Tracks per-subscription load and cooldown state, selects a subscription for
//! each request, and models failover as an explicit state machine. Everything
//! here is synchronous and free of network I/O; the service crate does the
//! forwarding.
//!
//! Request lifecycle:
//! 1. `Pool::select` filters the registry snapshot and scores the survivors
//! 2. `Pool::reserve` admits through the burst window and claims a slot
//! 3. The proxy forwards with the subscription's `Credential`
//! 4. On 429, `Pool::penalize` starts a cooldown and `RequestAttempt` decides
//!    whether to fail over
//! 5. The `Reservation` releases its slot when dropped, including mid-stream

pub mod connection;
pub mod cooldown;
pub mod credential;
pub mod error;
pub mod failover;
pub mod pool;
pub mod registry;
pub mod selector;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionTracker, Reservation};
pub use cooldown::{CooldownTracker, MAX_COOLDOWN};
pub use credential::Credential;
pub use error::{Error, Result};
pub use failover::{
    AttemptAction, AttemptEvent, AttemptState, DEFAULT_MAX_RETRIES, FailureReason, Outcome,
    RequestAttempt,
};
pub use pool::{Pool, PoolSettings};
pub use registry::{Registry, SubscriptionDescriptor, SubscriptionSnapshot};
pub use selector::{DEFAULT_QUOTA_WEIGHT, Selector};
pub use status::{PoolHealth, StatusReport, StatusReporter, SubscriptionStatus};
