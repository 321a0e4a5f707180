//! Subscription registry
//!
//! Holds the static descriptor and the live state of every subscription. The set
//! of subscriptions is fixed at construction; only live fields change afterwards.
//!
//! All live state sits behind a single `parking_lot::Mutex`. Critical sections are
//! a handful of field updates and the lock is never held across an await point,
//! so reserve, release and penalize are atomic with respect to each other and a
//! snapshot always reflects one consistent moment.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::cooldown::recent_admissions;
use crate::credential::Credential;
use crate::error::{Error, Result};

/// Static description of one subscription, produced by the config loader.
#[derive(Debug, Clone)]
pub struct SubscriptionDescriptor {
    pub name: String,
    pub credential: Credential,
    pub max_concurrent: u32,
    pub priority: u32,
    pub enabled: bool,
}

/// Immutable identity of a registered subscription.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    credential: Credential,
    max_concurrent: u32,
    priority: u32,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }
}

/// Mutable per-subscription state. Only the trackers touch these fields.
#[derive(Debug)]
pub(crate) struct LiveState {
    pub(crate) enabled: bool,
    pub(crate) active_connections: u32,
    pub(crate) cooldown_until: Option<Instant>,
    /// Set on penalize, cleared once the expiry has been logged.
    pub(crate) cooldown_announced: bool,
    pub(crate) total_requests: u64,
    pub(crate) total_errors: u64,
    pub(crate) quota_remaining: Option<f64>,
    pub(crate) admissions: VecDeque<Instant>,
}

impl LiveState {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            active_connections: 0,
            cooldown_until: None,
            cooldown_announced: false,
            total_requests: 0,
            total_errors: 0,
            quota_remaining: None,
            admissions: VecDeque::new(),
        }
    }
}

/// Point-in-time view of one subscription, taken under the registry lock.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub name: String,
    pub priority: u32,
    pub max_concurrent: u32,
    pub active_connections: u32,
    pub enabled: bool,
    pub cooling_down: bool,
    pub cooldown_remaining: Duration,
    pub burst_limited: bool,
    pub quota_remaining: Option<f64>,
    pub total_requests: u64,
    pub total_errors: u64,
}

impl SubscriptionSnapshot {
    /// Free slots left under `max_concurrent`.
    pub fn available_capacity(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.active_connections)
    }

    /// Free slots as a fraction of `max_concurrent`, in `[0, 1]`.
    pub fn capacity_fraction(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        f64::from(self.available_capacity()) / f64::from(self.max_concurrent)
    }
}

/// The fixed set of subscriptions and their live state.
#[derive(Debug)]
pub struct Registry {
    subscriptions: Vec<Subscription>,
    index: HashMap<String, usize>,
    live: Mutex<Vec<LiveState>>,
}

impl Registry {
    /// Build the registry from static descriptors.
    ///
    /// Rejects empty names, zero capacity and duplicate names. Order of the
    /// descriptors is preserved in snapshots and status output.
    pub fn new(descriptors: Vec<SubscriptionDescriptor>) -> Result<Self> {
        let mut subscriptions = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::with_capacity(descriptors.len());
        let mut live = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(Error::InvalidDescriptor(
                    "subscription name must not be empty".into(),
                ));
            }
            if descriptor.max_concurrent == 0 {
                return Err(Error::InvalidDescriptor(format!(
                    "{}: max_concurrent must be at least 1",
                    descriptor.name
                )));
            }
            if index.contains_key(&descriptor.name) {
                return Err(Error::DuplicateSubscription(descriptor.name));
            }

            index.insert(descriptor.name.clone(), subscriptions.len());
            live.push(LiveState::new(descriptor.enabled));
            subscriptions.push(Subscription {
                name: descriptor.name,
                credential: descriptor.credential,
                max_concurrent: descriptor.max_concurrent,
                priority: descriptor.priority,
            });
        }

        info!(subscriptions = subscriptions.len(), "registry initialized");
        Ok(Self {
            subscriptions,
            index,
            live: Mutex::new(live),
        })
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Subscription names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.subscriptions.iter().map(|s| s.name.as_str())
    }

    /// Look up a subscription's static identity.
    pub fn get(&self, name: &str) -> Result<&Subscription> {
        let index = self.position(name)?;
        Ok(&self.subscriptions[index])
    }

    pub(crate) fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownSubscription(name.to_string()))
    }

    pub(crate) fn by_index(&self, index: usize) -> &Subscription {
        &self.subscriptions[index]
    }

    /// Run `f` against one subscription's live state under the registry lock.
    pub(crate) fn update<R>(
        &self,
        index: usize,
        f: impl FnOnce(&Subscription, &mut LiveState) -> R,
    ) -> R {
        let mut live = self.live.lock();
        f(&self.subscriptions[index], &mut live[index])
    }

    /// Run `f` against every subscription's live state under one lock acquisition.
    pub(crate) fn update_all(&self, mut f: impl FnMut(&Subscription, &mut LiveState)) {
        let mut live = self.live.lock();
        for (subscription, state) in self.subscriptions.iter().zip(live.iter_mut()) {
            f(subscription, state);
        }
    }

    /// Consistent snapshot of all subscriptions as of `now`.
    ///
    /// `burst_limit` decides the `burst_limited` flag; zero disables the check.
    pub fn snapshot(&self, now: Instant, burst_limit: u32) -> Vec<SubscriptionSnapshot> {
        let live = self.live.lock();
        self.subscriptions
            .iter()
            .zip(live.iter())
            .map(|(subscription, state)| {
                let cooling_down = state.cooldown_until.is_some_and(|until| now < until);
                let cooldown_remaining = state
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default();
                let burst_limited = burst_limit != 0
                    && recent_admissions(&state.admissions, now) >= burst_limit as usize;

                SubscriptionSnapshot {
                    name: subscription.name.clone(),
                    priority: subscription.priority,
                    max_concurrent: subscription.max_concurrent,
                    active_connections: state.active_connections,
                    enabled: state.enabled,
                    cooling_down,
                    cooldown_remaining,
                    burst_limited,
                    quota_remaining: state.quota_remaining,
                    total_requests: state.total_requests,
                    total_errors: state.total_errors,
                }
            })
            .collect()
    }

    /// Administratively enable or disable a subscription.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let index = self.position(name)?;
        let previous = self.update(index, |_, state| {
            std::mem::replace(&mut state.enabled, enabled)
        });
        if previous != enabled {
            info!(subscription = name, enabled, "subscription toggled");
        }
        Ok(())
    }

    /// Store the remaining-quota figure from the external quota tracker.
    ///
    /// `remaining` is a fraction in `[0, 1]`; `None` marks the quota unknown.
    pub fn set_quota_remaining(&self, name: &str, remaining: Option<f64>) -> Result<()> {
        let index = self.position(name)?;
        if let Some(value) = remaining
            && !(0.0..=1.0).contains(&value)
        {
            return Err(Error::InvalidQuota {
                name: name.to_string(),
                value,
            });
        }
        self.update(index, |_, state| state.quota_remaining = remaining);
        Ok(())
    }

    /// Count a non-rate-limit upstream failure against a subscription.
    pub fn record_error(&self, name: &str) -> Result<()> {
        let index = self.position(name)?;
        self.update(index, |_, state| state.total_errors += 1);
        Ok(())
    }
}
