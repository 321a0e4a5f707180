//! Subscription pool facade
//!
//! Bundles the registry with the trackers, selector and status reporter behind
//! one handle shared by every request task. The pool never performs network
//! I/O; the proxy drives it through the failover state machine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::connection::{ConnectionTracker, Reservation};
use crate::cooldown::CooldownTracker;
use crate::error::{Error, Result};
use crate::registry::{Registry, SubscriptionDescriptor};
use crate::selector::{DEFAULT_QUOTA_WEIGHT, Selector};
use crate::status::{StatusReport, StatusReporter};

/// Process-wide routing knobs.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Cooldown applied on an upstream 429.
    pub cooldown: Duration,
    /// Admissions per subscription per second. Zero disables the check.
    pub burst_limit: u32,
    pub quota_weight: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            burst_limit: 10,
            quota_weight: DEFAULT_QUOTA_WEIGHT,
        }
    }
}

pub struct Pool {
    registry: Arc<Registry>,
    cooldowns: CooldownTracker,
    connections: ConnectionTracker,
    selector: Selector,
    reporter: StatusReporter,
    settings: PoolSettings,
}

impl Pool {
    pub fn new(descriptors: Vec<SubscriptionDescriptor>, settings: PoolSettings) -> Result<Self> {
        let registry = Arc::new(Registry::new(descriptors)?);
        info!(
            subscriptions = registry.len(),
            cooldown_secs = settings.cooldown.as_secs(),
            burst_limit = settings.burst_limit,
            quota_weight = settings.quota_weight,
            "pool initialized"
        );
        Ok(Self {
            cooldowns: CooldownTracker::new(registry.clone()),
            connections: ConnectionTracker::new(registry.clone()),
            selector: Selector::new(settings.quota_weight),
            reporter: StatusReporter::new(registry.clone(), settings.burst_limit),
            registry,
            settings,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Name of the best eligible subscription, skipping `excluded`.
    pub fn select(&self, excluded: &HashSet<String>, now: Instant) -> Result<String> {
        self.cooldowns.sweep_expired(now);
        let snapshots = self.registry.snapshot(now, self.settings.burst_limit);
        self.selector
            .select(&snapshots, excluded)
            .map(|snapshot| snapshot.name.clone())
    }

    /// Admit through the burst window, then claim a slot.
    ///
    /// [`Error::BurstLimited`] and [`Error::CapacityExhausted`] both mean another
    /// request got there first; the caller should reselect.
    pub fn reserve(&self, name: &str, now: Instant) -> Result<Reservation> {
        if !self
            .cooldowns
            .admit_burst(name, self.settings.burst_limit, now)?
        {
            return Err(Error::BurstLimited(name.to_string()));
        }
        self.connections.reserve(name)
    }

    /// Apply the rate-limit cooldown, stretched to `retry_after` when upstream
    /// asked for longer. Returns the cooldown deadline.
    pub fn penalize(
        &self,
        name: &str,
        retry_after: Option<Duration>,
        now: Instant,
    ) -> Result<Instant> {
        let cooldown = retry_after.map_or(self.settings.cooldown, |hint| {
            hint.max(self.settings.cooldown)
        });
        self.cooldowns.penalize(name, cooldown, now)
    }

    /// Count an upstream failure that is not a rate limit.
    pub fn record_error(&self, name: &str) -> Result<()> {
        self.registry.record_error(name)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(name, enabled)
    }

    pub fn set_quota_remaining(&self, name: &str, remaining: Option<f64>) -> Result<()> {
        self.registry.set_quota_remaining(name, remaining)
    }

    pub fn status(&self, now: Instant) -> StatusReport {
        self.reporter.report(now)
    }
}
