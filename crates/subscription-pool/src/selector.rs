//! Subscription selection
//!
//! Filters a registry snapshot down to the eligible subscriptions and picks the
//! one with the highest score:
//!
//! ```text
//! score = available_capacity_fraction + quota_weight * quota_remaining
//! ```
//!
//! `quota_remaining` is a fraction in `[0, 1]` and contributes nothing when
//! unknown. With the default weight of 0.05 the quota term only decides between
//! subscriptions whose load differs by less than one slot in twenty. Equal scores
//! go to the lowest `priority`, then the lowest `name`.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::SubscriptionSnapshot;

/// Default weight of the quota term in the score.
pub const DEFAULT_QUOTA_WEIGHT: f64 = 0.05;

/// Why a subscription was filtered out of a selection round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Disabled,
    CoolingDown,
    BurstLimited,
    AtCapacity,
    Excluded,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::Disabled => "disabled",
            Rejection::CoolingDown => "cooling_down",
            Rejection::BurstLimited => "burst_limited",
            Rejection::AtCapacity => "at_capacity",
            Rejection::Excluded => "excluded",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Selector {
    quota_weight: f64,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_WEIGHT)
    }
}

impl Selector {
    pub fn new(quota_weight: f64) -> Self {
        Self { quota_weight }
    }

    pub fn quota_weight(&self) -> f64 {
        self.quota_weight
    }

    /// Reason `snapshot` is ineligible, or `None` if it may be selected.
    pub fn rejection(
        &self,
        snapshot: &SubscriptionSnapshot,
        excluded: &HashSet<String>,
    ) -> Option<Rejection> {
        if excluded.contains(&snapshot.name) {
            Some(Rejection::Excluded)
        } else if !snapshot.enabled {
            Some(Rejection::Disabled)
        } else if snapshot.cooling_down {
            Some(Rejection::CoolingDown)
        } else if snapshot.burst_limited {
            Some(Rejection::BurstLimited)
        } else if snapshot.active_connections >= snapshot.max_concurrent {
            Some(Rejection::AtCapacity)
        } else {
            None
        }
    }

    pub fn score(&self, snapshot: &SubscriptionSnapshot) -> f64 {
        let quota = snapshot.quota_remaining.unwrap_or(0.0);
        snapshot.capacity_fraction() + self.quota_weight * quota
    }

    /// Pick the best eligible subscription from `snapshots`.
    ///
    /// Names in `excluded` are skipped (subscriptions already tried by this
    /// request). Fails with [`Error::NoEligibleSubscription`] carrying a JSON
    /// summary of why every candidate was filtered.
    pub fn select<'a>(
        &self,
        snapshots: &'a [SubscriptionSnapshot],
        excluded: &HashSet<String>,
    ) -> Result<&'a SubscriptionSnapshot> {
        let mut rejected = Vec::new();

        let best = snapshots
            .iter()
            .filter(|snapshot| match self.rejection(snapshot, excluded) {
                Some(reason) => {
                    debug!(
                        subscription = snapshot.name.as_str(),
                        reason = reason.as_str(),
                        "subscription filtered"
                    );
                    rejected.push(reason);
                    false
                }
                None => true,
            })
            .min_by(|a, b| self.rank(a, b));

        match best {
            Some(snapshot) => {
                debug!(
                    subscription = snapshot.name.as_str(),
                    score = self.score(snapshot),
                    "subscription selected"
                );
                Ok(snapshot)
            }
            None => Err(Error::NoEligibleSubscription(exhausted_message(
                snapshots.len(),
                &rejected,
            ))),
        }
    }

    /// Ordering where `Less` means "preferred".
    fn rank(&self, a: &SubscriptionSnapshot, b: &SubscriptionSnapshot) -> Ordering {
        self.score(b)
            .total_cmp(&self.score(a))
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| a.name.cmp(&b.name))
    }
}

fn exhausted_message(total: usize, rejected: &[Rejection]) -> String {
    let count = |reason: Rejection| rejected.iter().filter(|r| **r == reason).count();
    serde_json::json!({
        "subscriptions_total": total,
        "disabled": count(Rejection::Disabled),
        "cooling_down": count(Rejection::CoolingDown),
        "burst_limited": count(Rejection::BurstLimited),
        "at_capacity": count(Rejection::AtCapacity),
        "already_tried": count(Rejection::Excluded),
    })
    .to_string()
}
