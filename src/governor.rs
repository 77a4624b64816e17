//! Request pacing for the homology service.
//!
//! NCBI asks BLAST URL API clients to space requests at least ten seconds
//! apart and to stay under a daily search budget. Every submission goes
//! through [`RateGovernor::acquire_slot`]; polls and report downloads go
//! through [`RateGovernor::acquire_spacing`], which shares the spacing clock
//! but leaves the daily budget alone. Both serve callers in arrival order and
//! never let two requests land inside the spacing window.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub min_spacing: Duration,
    pub daily_ceiling: usize,
    pub window: Duration,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_secs(10),
            daily_ceiling: 100,
            window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("homology quota exhausted: {used} of {ceiling} requests used in the rolling window")]
pub struct QuotaExceeded {
    pub used: usize,
    pub ceiling: usize,
    /// Time until the oldest grant leaves the window.
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    pub granted_at: Instant,
    pub waited: Duration,
    pub used_in_window: usize,
}

/// Grant history inside the rolling window.
#[derive(Debug, Clone, Default)]
pub struct RateBudget {
    grants: VecDeque<Instant>,
    /// Most recent request of any kind, counted or not.
    last_request: Option<Instant>,
}

impl RateBudget {
    pub fn with_grants(grants: impl IntoIterator<Item = Instant>) -> Self {
        let mut grants: Vec<Instant> = grants.into_iter().collect();
        grants.sort();
        let last_request = grants.last().copied();
        Self {
            grants: grants.into(),
            last_request,
        }
    }

    pub fn used(&self) -> usize {
        self.grants.len()
    }

    pub fn last_request(&self) -> Option<Instant> {
        self.last_request
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.grants.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, at: Instant) {
        self.grants.push_back(at);
        self.last_request = Some(at);
    }

    fn touch(&mut self, at: Instant) {
        self.last_request = Some(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub used: usize,
    pub remaining: usize,
    pub ceiling: usize,
}

#[derive(Debug)]
struct GovernorState {
    budget: RateBudget,
    next_ticket: u64,
    serving: u64,
}

pub struct RateGovernor {
    policy: RatePolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<GovernorState>,
    turn: Condvar,
}

impl RateGovernor {
    pub fn new(policy: RatePolicy, clock: Arc<dyn Clock>) -> Self {
        Self::with_budget(policy, clock, RateBudget::default())
    }

    pub fn with_budget(policy: RatePolicy, clock: Arc<dyn Clock>, budget: RateBudget) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(GovernorState {
                budget,
                next_ticket: 0,
                serving: 0,
            }),
            turn: Condvar::new(),
        }
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Waits for the next request slot.
    ///
    /// Returns immediately with [`QuotaExceeded`] when the rolling window is
    /// full; otherwise sleeps until the spacing since the previous request
    /// has elapsed. Concurrent callers are granted in the order they arrived.
    pub fn acquire_slot(&self) -> Result<SlotGrant, QuotaExceeded> {
        let mut state = self.take_turn();
        let now = self.clock.now();
        state.budget.prune(now, self.policy.window);
        if state.budget.used() >= self.policy.daily_ceiling {
            let retry_after = state
                .budget
                .grants
                .front()
                .map(|oldest| (*oldest + self.policy.window).saturating_duration_since(now))
                .unwrap_or_default();
            let used = state.budget.used();
            self.release_turn(state);
            tracing::warn!(used, ceiling = self.policy.daily_ceiling, "homology quota exhausted");
            return Err(QuotaExceeded {
                used,
                ceiling: self.policy.daily_ceiling,
                retry_after,
            });
        }

        let wait = self.spacing_wait(&state, now);
        // Later tickets stay parked on the condvar while this one sleeps, so
        // the mutex itself is free during the wait.
        drop(state);
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "waiting for homology slot");
            self.clock.sleep(wait);
        }

        let mut state = self.lock();
        let granted_at = self.clock.now();
        state.budget.record(granted_at);
        let used_in_window = state.budget.used();
        self.release_turn(state);

        Ok(SlotGrant {
            granted_at,
            waited: wait,
            used_in_window,
        })
    }

    /// Waits out the spacing window for a request that does not count
    /// against the daily ceiling, such as a status poll. Returns the time
    /// spent waiting.
    pub fn acquire_spacing(&self) -> Duration {
        let state = self.take_turn();
        let wait = self.spacing_wait(&state, self.clock.now());
        drop(state);
        if !wait.is_zero() {
            tracing::trace!(wait_ms = wait.as_millis() as u64, "spacing homology request");
            self.clock.sleep(wait);
        }

        let mut state = self.lock();
        let at = self.clock.now();
        state.budget.touch(at);
        self.release_turn(state);
        wait
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.lock();
        state.budget.prune(self.clock.now(), self.policy.window);
        let used = state.budget.used();
        BudgetSnapshot {
            used,
            remaining: self.policy.daily_ceiling.saturating_sub(used),
            ceiling: self.policy.daily_ceiling,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_turn(&self) -> MutexGuard<'_, GovernorState> {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.serving != ticket {
            state = self
                .turn
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    fn spacing_wait(&self, state: &GovernorState, now: Instant) -> Duration {
        state
            .budget
            .last_request()
            .map(|last| (last + self.policy.min_spacing).saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn release_turn(&self, mut state: MutexGuard<'_, GovernorState>) {
        state.serving += 1;
        drop(state);
        self.turn.notify_all();
    }
}
