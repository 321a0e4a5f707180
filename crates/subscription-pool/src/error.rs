//! Error types for routing-core operations

/// Errors from registry, tracker and selector operations.
///
/// Only `NoEligibleSubscription` is meant to reach a client. `CapacityExhausted`
/// and `BurstLimited` are races that the failover loop absorbs, and
/// `UnknownSubscription` indicates an internal consistency fault.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no eligible subscription: {0}")]
    NoEligibleSubscription(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("burst limit reached: {0}")]
    BurstLimited(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("duplicate subscription name: {0}")]
    DuplicateSubscription(String),

    #[error("invalid subscription descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid quota value for {name}: {value}")]
    InvalidQuota { name: String, value: f64 },
}

/// Result alias for routing-core operations.
pub type Result<T> = std::result::Result<T, Error>;
