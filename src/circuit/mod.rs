//! # Circuit Breaker
//!
//! Per-dependency failure isolation: a CLOSED/OPEN/HALF_OPEN state machine
//! wrapped around every call to one named dependency, with its state
//! persisted in the shared store so all process instances fail fast
//! together and recover together.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CircuitBreaker`] | Wraps calls, owns the persisted state machine |
//! | [`CircuitBreakerConfig`] | Thresholds, timeouts, expected failure kinds |
//! | [`CircuitBreakerState`] | The typed record stored per breaker name |
//! | [`CircuitBreakerSnapshot`] | Stats view with computed next attempt time |

mod breaker;
mod state;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
pub use state::{CircuitBreakerState, CircuitState};
