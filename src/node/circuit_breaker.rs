use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Stops hammering an unreachable node: after `failure_threshold` consecutive
/// failures calls are refused for `cooldown`, then a single trial call decides
/// whether to close again.
#[derive(Debug)]
pub struct NodeCircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl Default for NodeCircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl NodeCircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown: cooldown.max(Duration::from_millis(1)),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let guard = self.state.lock();
        CircuitBreakerSnapshot {
            state: guard.state,
            consecutive_failures: guard.consecutive_failures,
            opened_at: guard.opened_at,
        }
    }

    /// Returns the state the call runs under, or `None` when it must be refused.
    pub fn acquire(&self) -> Option<CircuitState> {
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => Some(CircuitState::Closed),
            CircuitState::Open => {
                let cooled = guard
                    .opened_at
                    .map_or(false, |opened| opened.elapsed() >= self.cooldown);
                if !cooled {
                    return None;
                }
                Self::transition(&mut guard, CircuitState::HalfOpen);
                guard.trial_in_flight = true;
                Some(CircuitState::HalfOpen)
            }
            CircuitState::HalfOpen if guard.trial_in_flight => None,
            CircuitState::HalfOpen => {
                guard.trial_in_flight = true;
                Some(CircuitState::HalfOpen)
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.state.lock();
        guard.consecutive_failures = 0;
        guard.trial_in_flight = false;
        guard.opened_at = None;
        Self::transition(&mut guard, CircuitState::Closed);
    }

    pub fn record_failure(&self) {
        let mut guard = self.state.lock();
        guard.consecutive_failures = guard.consecutive_failures.saturating_add(1);
        let reopen = guard.state == CircuitState::HalfOpen;
        guard.trial_in_flight = false;
        if reopen || guard.consecutive_failures >= self.failure_threshold {
            guard.opened_at = Some(Instant::now());
            Self::transition(&mut guard, CircuitState::Open);
        }
    }

    fn transition(state: &mut BreakerState, next: CircuitState) {
        if state.state != next {
            tracing::warn!(
                previous = ?state.state,
                next = ?next,
                consecutive_failures = state.consecutive_failures,
                "node circuit breaker state changed"
            );
            state.state = next;
        }
    }
}
