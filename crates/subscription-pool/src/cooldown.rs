//! Rate-limit cooldowns and burst admission
//!
//! Two independent throttles per subscription:
//!
//! - **Cooldown**: after an upstream 429 the subscription is excluded from
//!   selection until `cooldown_until`. The deadline only ever moves forward; a
//!   second 429 during an active cooldown can extend it but never shorten it.
//! - **Burst admission**: at most `burst_limit` admissions per rolling
//!   [`BURST_WINDOW`]. A denied admission makes the subscription unavailable for
//!   the current selection round only and leaves cooldown state untouched.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::Registry;

/// Length of the rolling burst-admission window.
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Longest cooldown a single penalty can impose.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Number of admissions recorded within the last [`BURST_WINDOW`] before `now`.
pub(crate) fn recent_admissions(admissions: &VecDeque<Instant>, now: Instant) -> usize {
    admissions
        .iter()
        .filter(|at| now.saturating_duration_since(**at) < BURST_WINDOW)
        .count()
}

/// Cooldown and burst bookkeeping over the shared registry.
pub struct CooldownTracker {
    registry: Arc<Registry>,
}

impl CooldownTracker {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Put a subscription into cooldown for `cooldown` starting at `now`.
    ///
    /// `cooldown` is capped at [`MAX_COOLDOWN`]. Keeps the existing deadline if
    /// it is already later. Counts the rejection in `total_errors` either way
    /// and returns the effective deadline.
    pub fn penalize(&self, name: &str, cooldown: Duration, now: Instant) -> Result<Instant> {
        let index = self.registry.position(name)?;
        let cooldown = cooldown.min(MAX_COOLDOWN);
        let candidate = now.checked_add(cooldown).unwrap_or(now);

        let (until, extended) = self.registry.update(index, |_, state| {
            state.total_errors += 1;
            state.cooldown_announced = true;
            match state.cooldown_until {
                Some(current) if current >= candidate => (current, false),
                _ => {
                    state.cooldown_until = Some(candidate);
                    (candidate, true)
                }
            }
        });

        metrics::counter!("subscription_cooldowns_total", "subscription" => name.to_string())
            .increment(1);

        if extended {
            warn!(
                subscription = name,
                reason = "rate_limited",
                cooldown_secs = cooldown.as_secs(),
                "subscription entering cooldown"
            );
        } else {
            info!(
                subscription = name,
                reason = "rate_limited",
                remaining_secs = until.saturating_duration_since(now).as_secs(),
                "rate limited during cooldown, keeping later deadline"
            );
        }
        Ok(until)
    }

    /// True while `now` is before the subscription's cooldown deadline.
    pub fn is_cooling_down(&self, name: &str, now: Instant) -> Result<bool> {
        let index = self.registry.position(name)?;
        Ok(self.registry.update(index, |_, state| {
            state.cooldown_until.is_some_and(|until| now < until)
        }))
    }

    /// Time left until the cooldown deadline, zero when not cooling down.
    pub fn cooldown_remaining(&self, name: &str, now: Instant) -> Result<Duration> {
        let index = self.registry.position(name)?;
        Ok(self.registry.update(index, |_, state| {
            state
                .cooldown_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or_default()
        }))
    }

    /// Try to admit one request within the rolling burst window.
    ///
    /// Records the admission and returns `true` when fewer than `burst_limit`
    /// admissions happened in the last second; returns `false` otherwise without
    /// touching cooldown state. A limit of zero admits everything.
    pub fn admit_burst(&self, name: &str, burst_limit: u32, now: Instant) -> Result<bool> {
        let index = self.registry.position(name)?;

        let admitted = self.registry.update(index, |_, state| {
            while let Some(oldest) = state.admissions.front() {
                if now.saturating_duration_since(*oldest) >= BURST_WINDOW {
                    state.admissions.pop_front();
                } else {
                    break;
                }
            }
            if burst_limit != 0 && recent_admissions(&state.admissions, now) >= burst_limit as usize
            {
                false
            } else {
                state.admissions.push_back(now);
                true
            }
        });

        if !admitted {
            debug!(
                subscription = name,
                burst_limit,
                reason = "burst_limit",
                "burst admission denied"
            );
        }
        Ok(admitted)
    }

    /// Log subscriptions whose cooldown has run out since the last sweep.
    ///
    /// Purely observational; eligibility is always decided from the deadline.
    pub fn sweep_expired(&self, now: Instant) {
        self.registry.update_all(|subscription, state| {
            if state.cooldown_announced && state.cooldown_until.is_some_and(|until| now >= until) {
                state.cooldown_announced = false;
                info!(
                    subscription = subscription.name(),
                    "cooldown expired, subscription available again"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::registry;

    #[test]
    fn penalize_covers_half_open_window() {
        let tracker = CooldownTracker::new(registry(&[("s", 5, 1)]));
        let t = Instant::now();
        tracker.penalize("s", Duration::from_secs(60), t).unwrap();

        assert!(tracker.is_cooling_down("s", t).unwrap());
        assert!(tracker.is_cooling_down("s", t + Duration::from_millis(59_999)).unwrap());
        assert!(!tracker.is_cooling_down("s", t + Duration::from_secs(60)).unwrap());
        assert!(!tracker.is_cooling_down("s", t + Duration::from_secs(61)).unwrap());
    }

    #[test]
    fn not_cooling_down_before_any_penalty() {
        let tracker = CooldownTracker::new(registry(&[("s", 5, 1)]));
        assert!(!tracker.is_cooling_down("s", Instant::now()).unwrap());
        assert_eq!(
            tracker.cooldown_remaining("s", Instant::now()).unwrap(),
            Duration::ZERO
        );
    }

    #[test]
    fn repeated_penalty_extends_but_never_shortens() {
        let tracker = CooldownTracker::new(registry(&[("s", 5, 1)]));
        let t = Instant::now();

        let first = tracker.penalize("s", Duration::from_secs(60), t).unwrap();
        // Shorter penalty later on: deadline stays where it was.
        let second = tracker
            .penalize("s", Duration::from_secs(10), t + Duration::from_secs(5))
            .unwrap();
        assert_eq!(second, first);

        // A penalty reaching past the current deadline extends it.
        let third = tracker
            .penalize("s", Duration::from_secs(60), t + Duration::from_secs(30))
            .unwrap();
        assert_eq!(third, t + Duration::from_secs(90));
        assert!(tracker.is_cooling_down("s", t + Duration::from_secs(80)).unwrap());
    }

    #[test]
    fn penalize_counts_errors() {
        let registry = registry(&[("s", 5, 1)]);
        let tracker = CooldownTracker::new(registry.clone());
        let t = Instant::now();
        tracker.penalize("s", Duration::from_secs(1), t).unwrap();
        tracker.penalize("s", Duration::from_secs(1), t).unwrap();
        assert_eq!(registry.snapshot(t, 0)[0].total_errors, 2);
    }

    #[test]
    fn oversized_cooldown_is_capped() {
        let tracker = CooldownTracker::new(registry(&[("a", 5, 1)]));
        let now = Instant::now();

        let until = tracker
            .penalize("a", Duration::from_secs(u64::MAX), now)
            .unwrap();
        assert_eq!(until, now + MAX_COOLDOWN);
        assert!(tracker.is_cooling_down("a", now + MAX_COOLDOWN - Duration::from_secs(1)).unwrap());
        assert!(!tracker.is_cooling_down("a", now + MAX_COOLDOWN).unwrap());
    }

    #[test]
    fn remaining_counts_down() {
        let tracker = CooldownTracker::new(registry(&[("s", 5, 1)]));
        let t = Instant::now();
        tracker.penalize("s", Duration::from_secs(60), t).unwrap();
        assert_eq!(
            tracker
                .cooldown_remaining("s", t + Duration::from_secs(15))
                .unwrap(),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn burst_limit_denies_within_window_and_recovers() {
        let registry = registry(&[("s", 5, 1)]);
        let tracker = CooldownTracker::new(registry.clone());
        let t = Instant::now();

        assert!(tracker.admit_burst("s", 2, t).unwrap());
        assert!(tracker.admit_burst("s", 2, t + Duration::from_millis(100)).unwrap());
        assert!(!tracker.admit_burst("s", 2, t + Duration::from_millis(200)).unwrap());

        // Burst denial is not a cooldown.
        assert!(!tracker.is_cooling_down("s", t + Duration::from_millis(200)).unwrap());
        assert!(registry.snapshot(t + Duration::from_millis(200), 2)[0].burst_limited);

        // First admission leaves the window at t + 1s.
        assert!(tracker.admit_burst("s", 2, t + Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn zero_burst_limit_admits_everything() {
        let tracker = CooldownTracker::new(registry(&[("s", 5, 1)]));
        let t = Instant::now();
        for _ in 0..100 {
            assert!(tracker.admit_burst("s", 0, t).unwrap());
        }
    }

    #[test]
    fn burst_windows_are_per_subscription() {
        let tracker = CooldownTracker::new(registry(&[("a", 5, 1), ("b", 5, 1)]));
        let t = Instant::now();
        assert!(tracker.admit_burst("a", 1, t).unwrap());
        assert!(!tracker.admit_burst("a", 1, t).unwrap());
        assert!(tracker.admit_burst("b", 1, t).unwrap());
    }

    #[test]
    fn sweep_clears_announcement_only_after_expiry() {
        let registry = registry(&[("s", 5, 1)]);
        let tracker = CooldownTracker::new(registry.clone());
        let t = Instant::now();
        tracker.penalize("s", Duration::from_secs(10), t).unwrap();

        tracker.sweep_expired(t + Duration::from_secs(5));
        assert!(registry.update(0, |_, state| state.cooldown_announced));

        tracker.sweep_expired(t + Duration::from_secs(10));
        assert!(!registry.update(0, |_, state| state.cooldown_announced));
        // Deadline itself is untouched by the sweep.
        assert!(registry.update(0, |_, state| state.cooldown_until.is_some()));
    }

    #[test]
    fn unknown_subscription_is_an_error() {
        let tracker = CooldownTracker::new(registry(&[("s", 5, 1)]));
        assert!(matches!(
            tracker.penalize("nope", Duration::from_secs(1), Instant::now()),
            Err(Error::UnknownSubscription(_))
        ));
        assert!(tracker.admit_burst("nope", 1, Instant::now()).is_err());
    }
}
