//! Read-only status snapshot for the status endpoint and dashboards

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::registry::{Registry, SubscriptionSnapshot};

/// One subscription as reported on the status surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriptionStatus {
    pub name: String,
    pub enabled: bool,
    pub priority: u32,
    pub active_connections: u32,
    pub max_concurrent: u32,
    pub available: u32,
    pub in_cooldown: bool,
    pub cooldown_remaining_secs: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub quota_remaining: Option<f64>,
}

impl SubscriptionStatus {
    fn from_snapshot(snapshot: &SubscriptionSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            enabled: snapshot.enabled,
            priority: snapshot.priority,
            active_connections: snapshot.active_connections,
            max_concurrent: snapshot.max_concurrent,
            available: snapshot.available_capacity(),
            in_cooldown: snapshot.cooling_down,
            cooldown_remaining_secs: snapshot.cooldown_remaining.as_secs(),
            total_requests: snapshot.total_requests,
            total_errors: snapshot.total_errors,
            quota_remaining: snapshot.quota_remaining,
        }
    }

    /// Could take a request right now, burst window aside.
    fn selectable(&self) -> bool {
        self.enabled && !self.in_cooldown && self.available > 0
    }
}

/// Overall label derived from how many enabled subscriptions are selectable.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub status: PoolHealth,
    pub subscriptions: Vec<SubscriptionStatus>,
    pub total_active: u32,
    /// Sum of `max_concurrent` over enabled subscriptions.
    pub total_capacity: u32,
    pub available_capacity: u32,
}

pub struct StatusReporter {
    registry: Arc<Registry>,
    burst_limit: u32,
}

impl StatusReporter {
    pub fn new(registry: Arc<Registry>, burst_limit: u32) -> Self {
        Self {
            registry,
            burst_limit,
        }
    }

    pub fn report(&self, now: Instant) -> StatusReport {
        let subscriptions: Vec<SubscriptionStatus> = self
            .registry
            .snapshot(now, self.burst_limit)
            .iter()
            .map(SubscriptionStatus::from_snapshot)
            .collect();

        let enabled = subscriptions.iter().filter(|s| s.enabled);
        let enabled_count = enabled.clone().count();
        let selectable = enabled.clone().filter(|s| s.selectable()).count();
        let total_capacity: u32 = enabled.clone().map(|s| s.max_concurrent).sum();
        let available_capacity: u32 = enabled
            .filter(|s| !s.in_cooldown)
            .map(|s| s.available)
            .sum();
        let total_active: u32 = subscriptions.iter().map(|s| s.active_connections).sum();

        let status = if selectable == 0 {
            PoolHealth::Unhealthy
        } else if selectable < enabled_count {
            PoolHealth::Degraded
        } else {
            PoolHealth::Healthy
        };

        StatusReport {
            status,
            subscriptions,
            total_active,
            total_capacity,
            available_capacity,
        }
    }
}
