//! Failover state machine
//!
//! Pure state machine: receives events, returns the action the caller should
//! execute next. The caller (the proxy handler) owns the reservation and does
//! the network I/O implied by each action.
//!
//! ```text
//! Selecting ──Selected──▶ Reserving ──Reserved──▶ Forwarding ──Completed──▶ Succeeded
//!     ▲                      │                        │
//!     ├──CapacityExhausted───┘                        ├──RateLimited──▶ RateLimited ──Penalized──▶ Selecting | Failed
//!     ├──────────────UpstreamTimeout (first)──────────┤
//!     └──NoEligibleSubscription──▶ Failed             └──StreamInterrupted / ClientCancelled──▶ Failed
//! ```
//!
//! Each subscription that fails an attempt is excluded for the rest of the
//! request. Rate-limit failovers are capped by `max_retries`; timeouts and
//! unreachable upstreams get a single retry.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::warn;

/// Default rate-limit failovers after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Retries granted after a timeout or connection failure.
const MAX_TRANSPORT_RETRIES: u32 = 1;

/// Why a request ended without a relayed upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NoEligibleSubscription,
    RetriesExhausted,
    UpstreamTimeout,
    UpstreamUnreachable,
    StreamInterrupted,
    ClientCancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoEligibleSubscription => "no_eligible_subscription",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::UpstreamTimeout => "upstream_timeout",
            FailureReason::UpstreamUnreachable => "upstream_unreachable",
            FailureReason::StreamInterrupted => "stream_interrupted",
            FailureReason::ClientCancelled => "client_cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one try against one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    CapacityExhausted,
    BurstLimited,
    RateLimited,
    Timeout,
    Unreachable,
    StreamInterrupted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Selecting,
    Reserving { subscription: String },
    Forwarding { subscription: String },
    RateLimited { subscription: String },
    Succeeded { subscription: String },
    Failed { reason: FailureReason },
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded { .. } | AttemptState::Failed { .. }
        )
    }
}

/// Events reported by the caller after executing an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    /// Selector picked a subscription
    Selected { subscription: String },
    /// Selector found nothing eligible
    NoEligibleSubscription,
    /// Slot held
    Reserved,
    /// Lost the race for the last slot
    CapacityExhausted,
    /// Burst window full at reservation time
    BurstLimited,
    /// Upstream answered 429 before any body bytes
    RateLimited,
    /// Cooldown applied after a 429
    Penalized,
    UpstreamTimeout,
    UpstreamUnreachable,
    /// Upstream body failed after the response started
    StreamInterrupted,
    ClientCancelled,
    /// Response handed to the client
    Completed,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptAction {
    /// Run the selector with [`RequestAttempt::excluded`]
    Select,
    /// Reserve a slot on the subscription
    Reserve { subscription: String },
    /// Send the request upstream with the subscription's credential
    Forward { subscription: String },
    /// Put the subscription into cooldown
    Penalize { subscription: String },
    /// Return the upstream response
    Complete,
    /// Return an error response
    Fail { reason: FailureReason },
    /// Event did not apply to the current state
    None,
}

/// Per-request failover record.
///
/// Created when a request arrives and dropped when it completes. Dropping a
/// record that has not reached a terminal state means the client went away.
pub struct RequestAttempt {
    client_id: String,
    started_at: Instant,
    state: AttemptState,
    tried: Vec<(String, Outcome)>,
    excluded: HashSet<String>,
    forwards: u32,
    rate_limited: u32,
    transport_retries: u32,
    /// Set while a transport retry is pending; surfaced instead of
    /// `NoEligibleSubscription` if nothing is left to retry on.
    transport_failure: Option<FailureReason>,
    max_retries: u32,
}

impl RequestAttempt {
    pub fn new(client_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            client_id: client_id.into(),
            started_at: Instant::now(),
            state: AttemptState::Selecting,
            tried: Vec::new(),
            excluded: HashSet::new(),
            forwards: 0,
            rate_limited: 0,
            transport_retries: 0,
            transport_failure: None,
            max_retries,
        }
    }

    /// First action for a fresh request.
    pub fn start(&self) -> AttemptAction {
        AttemptAction::Select
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    /// Subscriptions tried so far with their outcomes, in order.
    pub fn tried(&self) -> &[(String, Outcome)] {
        &self.tried
    }

    /// Subscriptions the selector must skip for this request.
    pub fn excluded(&self) -> &HashSet<String> {
        &self.excluded
    }

    /// Number of times the request was sent upstream.
    pub fn attempts(&self) -> u32 {
        self.forwards
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Apply an event. Pure: no I/O.
    pub fn handle(&mut self, event: AttemptEvent) -> AttemptAction {
        let state = std::mem::replace(&mut self.state, AttemptState::Selecting);
        let (next, action) = self.transition(state, event);
        self.state = next;
        action
    }

    fn transition(
        &mut self,
        state: AttemptState,
        event: AttemptEvent,
    ) -> (AttemptState, AttemptAction) {
        match (state, event) {
            // --- Selecting ---
            (AttemptState::Selecting, AttemptEvent::Selected { subscription }) => (
                AttemptState::Reserving {
                    subscription: subscription.clone(),
                },
                AttemptAction::Reserve { subscription },
            ),

            (AttemptState::Selecting, AttemptEvent::NoEligibleSubscription) => fail(
                self.transport_failure
                    .take()
                    .unwrap_or(FailureReason::NoEligibleSubscription),
            ),

            // --- Reserving ---
            (AttemptState::Reserving { subscription }, AttemptEvent::Reserved) => {
                self.forwards += 1;
                self.transport_failure = None;
                (
                    AttemptState::Forwarding {
                        subscription: subscription.clone(),
                    },
                    AttemptAction::Forward { subscription },
                )
            }

            (AttemptState::Reserving { subscription }, AttemptEvent::CapacityExhausted) => {
                self.exclude(subscription, Outcome::CapacityExhausted);
                (AttemptState::Selecting, AttemptAction::Select)
            }

            (AttemptState::Reserving { subscription }, AttemptEvent::BurstLimited) => {
                self.exclude(subscription, Outcome::BurstLimited);
                (AttemptState::Selecting, AttemptAction::Select)
            }

            // --- Forwarding ---
            (AttemptState::Forwarding { subscription }, AttemptEvent::Completed) => {
                self.tried.push((subscription.clone(), Outcome::Succeeded));
                (
                    AttemptState::Succeeded { subscription },
                    AttemptAction::Complete,
                )
            }

            (AttemptState::Forwarding { subscription }, AttemptEvent::RateLimited) => {
                self.rate_limited += 1;
                self.exclude(subscription.clone(), Outcome::RateLimited);
                (
                    AttemptState::RateLimited {
                        subscription: subscription.clone(),
                    },
                    AttemptAction::Penalize { subscription },
                )
            }

            (AttemptState::Forwarding { subscription }, AttemptEvent::UpstreamTimeout) => {
                self.exclude(subscription, Outcome::Timeout);
                self.retry_transport(FailureReason::UpstreamTimeout)
            }

            (AttemptState::Forwarding { subscription }, AttemptEvent::UpstreamUnreachable) => {
                self.exclude(subscription, Outcome::Unreachable);
                self.retry_transport(FailureReason::UpstreamUnreachable)
            }

            (AttemptState::Forwarding { subscription }, AttemptEvent::StreamInterrupted) => {
                self.tried.push((subscription, Outcome::StreamInterrupted));
                fail(FailureReason::StreamInterrupted)
            }

            // --- RateLimited ---
            (AttemptState::RateLimited { .. }, AttemptEvent::Penalized)
                if self.rate_limited <= self.max_retries =>
            {
                (AttemptState::Selecting, AttemptAction::Select)
            }

            (AttemptState::RateLimited { .. }, AttemptEvent::Penalized) => {
                fail(FailureReason::RetriesExhausted)
            }

            // --- Cancellation from any live state ---
            (state, AttemptEvent::ClientCancelled) if !state.is_terminal() => {
                if let AttemptState::Forwarding { subscription } = state {
                    self.tried.push((subscription, Outcome::Cancelled));
                }
                fail(FailureReason::ClientCancelled)
            }

            // --- Ignore invalid transitions ---
            (state, _) => (state, AttemptAction::None),
        }
    }

    fn exclude(&mut self, subscription: String, outcome: Outcome) {
        self.excluded.insert(subscription.clone());
        self.tried.push((subscription, outcome));
    }

    fn retry_transport(&mut self, reason: FailureReason) -> (AttemptState, AttemptAction) {
        if self.transport_retries < MAX_TRANSPORT_RETRIES {
            self.transport_retries += 1;
            self.transport_failure = Some(reason);
            (AttemptState::Selecting, AttemptAction::Select)
        } else {
            fail(reason)
        }
    }
}

fn fail(reason: FailureReason) -> (AttemptState, AttemptAction) {
    (
        AttemptState::Failed { reason },
        AttemptAction::Fail { reason },
    )
}

impl fmt::Debug for RequestAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAttempt")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("tried", &self.tried)
            .field("attempts", &self.forwards)
            .finish()
    }
}

impl Drop for RequestAttempt {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let interrupted = format!("{:?}", self.state);
        self.handle(AttemptEvent::ClientCancelled);
        warn!(
            client_id = self.client_id.as_str(),
            state = interrupted.as_str(),
            tried = ?self.tried,
            elapsed_ms = self.elapsed().as_millis() as u64,
            reason = "client_cancelled",
            "request abandoned before completion"
        );
    }
}
