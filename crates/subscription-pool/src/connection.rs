//! Concurrent-connection accounting
//!
//! A [`Reservation`] is the only way to hold a slot. Reserve is check-and-increment
//! under the registry lock so `active_connections` can never exceed
//! `max_concurrent`, and release happens exactly once: explicitly, or on drop
//! when the owning task finishes or is cancelled.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::registry::{Registry, Subscription};

/// Slot accounting over the shared registry.
pub struct ConnectionTracker {
    registry: Arc<Registry>,
}

impl ConnectionTracker {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Claim one slot on `name`.
    ///
    /// Fails with [`Error::CapacityExhausted`] when the subscription is already at
    /// `max_concurrent`. Does not look at enabled, cooldown or burst state; that
    /// is the selector's job.
    pub fn reserve(&self, name: &str) -> Result<Reservation> {
        let index = self.registry.position(name)?;

        let active = self.registry.update(index, |subscription, state| {
            if state.active_connections >= subscription.max_concurrent() {
                return None;
            }
            state.active_connections += 1;
            state.total_requests += 1;
            set_active_gauge(subscription.name(), state.active_connections);
            Some(state.active_connections)
        });

        let Some(active) = active else {
            debug!(subscription = name, "reservation refused, at capacity");
            return Err(Error::CapacityExhausted(name.to_string()));
        };

        debug!(subscription = name, active, "slot reserved");
        Ok(Reservation {
            registry: self.registry.clone(),
            index,
            released: false,
        })
    }

    /// Current number of held slots on `name`.
    pub fn active_connections(&self, name: &str) -> Result<u32> {
        let index = self.registry.position(name)?;
        Ok(self
            .registry
            .update(index, |_, state| state.active_connections))
    }
}

/// Called with the registry lock held so concurrent updates publish in order.
fn set_active_gauge(name: &str, active: u32) {
    metrics::gauge!("subscription_active_connections", "subscription" => name.to_string())
        .set(f64::from(active));
}

/// A held connection slot on one subscription.
///
/// Dropping the reservation releases the slot.
#[must_use = "dropping a reservation releases its slot immediately"]
pub struct Reservation {
    registry: Arc<Registry>,
    index: usize,
    released: bool,
}

impl Reservation {
    pub fn subscription(&self) -> &Subscription {
        self.registry.by_index(self.index)
    }

    pub fn name(&self) -> &str {
        self.subscription().name()
    }

    pub fn credential(&self) -> &Credential {
        self.subscription().credential()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Give the slot back. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let active = self.registry.update(self.index, |subscription, state| {
            state.active_connections = state.active_connections.saturating_sub(1);
            set_active_gauge(subscription.name(), state.active_connections);
            state.active_connections
        });
        debug!(subscription = self.name(), active, "slot released");
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("subscription", &self.name())
            .field("released", &self.released)
            .finish()
    }
}
