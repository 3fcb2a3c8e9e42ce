//! Circuit breaker state record and transition rules.
//!
//! The state machine is pure: every rule is a method on the persisted
//! record, so the same transitions run identically inside a store
//! `fetch_update` closure and in unit tests with synthetic clocks.

use serde::{Deserialize, Serialize};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast, calls are denied until the recovery timeout elapses.
    Open,
    /// Probation: probe traffic is admitted to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// A state change produced by recording an outcome, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Outcome of asking the state machine to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal traffic through a closed circuit.
    Admitted,
    /// Admitted as probe traffic; `transitioned` is true for the single
    /// caller that performed the OPEN -> HALF_OPEN move.
    Probe { transitioned: bool },
    /// Denied: the circuit is open and the recovery timeout has not elapsed.
    Denied { next_attempt_time: u64 },
}

/// The persisted record for one named breaker.
///
/// Serialized as JSON against the shared store; all timestamps are unix
/// milliseconds. The counters hold the invariant that a success zeroes
/// `failure_count` and a failure zeroes `success_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<u64>,
    pub last_success_time: Option<u64>,
    /// Calls admitted through the breaker (denied calls are not counted,
    /// so a fail-fast storm costs no store writes).
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub opened_at: Option<u64>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            opened_at: None,
        }
    }
}

impl CircuitBreakerState {
    /// Apply the admission rules for a call arriving at `now_ms`.
    ///
    /// Mutates the record (request totals, OPEN -> HALF_OPEN move); callers
    /// persist the record iff the result is not `Denied`.
    pub fn try_admit(&mut self, now_ms: u64, recovery_timeout_ms: u64) -> Admission {
        match self.state {
            CircuitState::Closed => {
                self.total_requests += 1;
                Admission::Admitted
            }
            CircuitState::HalfOpen => {
                self.total_requests += 1;
                Admission::Probe { transitioned: false }
            }
            CircuitState::Open => {
                let next_attempt = self.next_attempt_time(recovery_timeout_ms);
                if now_ms >= next_attempt {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    self.total_requests += 1;
                    Admission::Probe { transitioned: true }
                } else {
                    Admission::Denied {
                        next_attempt_time: next_attempt,
                    }
                }
            }
        }
    }

    /// Record a successful call outcome.
    pub fn record_success(&mut self, now_ms: u64, success_threshold: u32) -> Option<Transition> {
        self.failure_count = 0;
        self.success_count = self.success_count.saturating_add(1);
        self.last_success_time = Some(now_ms);
        self.total_successes += 1;

        if self.state == CircuitState::HalfOpen && self.success_count >= success_threshold {
            self.state = CircuitState::Closed;
            self.success_count = 0;
            self.opened_at = None;
            return Some(Transition::Closed);
        }
        None
    }

    /// Record a counted failure outcome.
    pub fn record_failure(&mut self, now_ms: u64, failure_threshold: u32) -> Option<Transition> {
        self.success_count = 0;
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now_ms);
        self.total_failures += 1;

        match self.state {
            CircuitState::Closed if self.failure_count >= failure_threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now_ms);
                Some(Transition::Opened)
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now_ms);
                Some(Transition::Opened)
            }
            _ => None,
        }
    }

    /// Earliest unix-millis instant at which an open circuit admits a probe.
    /// Meaningful only while `state` is [`CircuitState::Open`].
    pub fn next_attempt_time(&self, recovery_timeout_ms: u64) -> u64 {
        self.last_failure_time
            .unwrap_or(0)
            .saturating_add(recovery_timeout_ms)
    }
}
